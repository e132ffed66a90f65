//! Inference service: owns a model pipeline and, when the pipeline asks for a
//! periodic service interval, a [`PeriodicTimer`] whose tick asks the raw data
//! collector for fresh samples.

use super::{ModelPipeline, ResultListener};
use crate::error::{Result, SpeechError};
use crate::timer::PeriodicTimer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Hook into the sensor capture side, called on every timer tick
pub trait RawDataCollector: Send {
    /// Gather samples and hand them to `sink.push_data`
    fn collect(&mut self, sink: &InferenceSink);
}

impl<F> RawDataCollector for F
where
    F: FnMut(&InferenceSink) + Send,
{
    fn collect(&mut self, sink: &InferenceSink) {
        self(sink)
    }
}

/// Cloneable push side of an [`InferenceService`]
#[derive(Clone)]
pub struct InferenceSink {
    pipeline: Arc<Mutex<ModelPipeline>>,
    running: Arc<AtomicBool>,
}

impl InferenceSink {
    pub fn push_data(&self, data: &[f32]) -> Result<()> {
        if !self.is_running() {
            return Err(SpeechError::NotRunning);
        }
        self.pipeline.lock().push_data(data)
    }

    pub fn clear_data(&self) -> Result<()> {
        if !self.is_running() {
            return Err(SpeechError::NotRunning);
        }
        self.pipeline.lock().clear_data();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub struct InferenceService {
    sink: InferenceSink,
    interval: u32,
    prepared: bool,
    timer: Option<PeriodicTimer>,
}

impl InferenceService {
    pub fn new(pipeline: ModelPipeline) -> Self {
        Self {
            sink: InferenceSink {
                pipeline: Arc::new(Mutex::new(pipeline)),
                running: Arc::new(AtomicBool::new(false)),
            },
            interval: 0,
            prepared: false,
            timer: None,
        }
    }

    /// Prepare the pipeline. A periodic pipeline needs a collector; a
    /// streaming one (interval 0) ignores it.
    pub fn prepare(&mut self, collector: Option<Box<dyn RawDataCollector>>) -> Result<()> {
        if self.prepared {
            return Err(SpeechError::InvalidArgument(
                "Inference service is already prepared".to_string(),
            ));
        }

        let interval = self.sink.pipeline.lock().prepare()?;
        self.interval = interval;

        if interval > 0 {
            let mut collector = collector.ok_or_else(|| {
                SpeechError::InvalidArgument(format!(
                    "Pipeline runs every {}ms but no raw data collector was given",
                    interval
                ))
            })?;
            let sink = self.sink.clone();
            let timer = PeriodicTimer::create(move || collector.collect(&sink), u64::from(interval))?;
            self.timer = Some(timer);
            log::info!("Inference service prepared in periodic mode ({}ms)", interval);
        } else {
            log::info!("Inference service prepared in streaming mode");
        }

        self.prepared = true;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if !self.prepared {
            return Err(SpeechError::InvalidArgument(
                "Inference service started before prepare".to_string(),
            ));
        }
        if self.is_running() {
            return Ok(());
        }

        self.sink.running.store(true, Ordering::Release);
        if let Some(timer) = self.timer.as_mut() {
            // First start arms the timer
            if let Err(e) = timer.change_interval(u64::from(self.interval)) {
                self.sink.running.store(false, Ordering::Release);
                return Err(e);
            }
        }

        log::debug!("Inference service started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.sink.running.store(false, Ordering::Release);
        if let Some(timer) = self.timer.as_mut() {
            if let Err(e) = timer.stop() {
                log::warn!("Failed to stop inference timer: {}", e);
            }
        }
        log::debug!("Inference service stopped");
        Ok(())
    }

    pub fn set_interval(&mut self, interval_ms: u32) -> Result<()> {
        let Some(timer) = self.timer.as_mut() else {
            return Err(SpeechError::InvalidArgument(
                "Inference service has no timer".to_string(),
            ));
        };
        if interval_ms == 0 {
            return Err(SpeechError::InvalidArgument(
                "Interval must be greater than zero".to_string(),
            ));
        }

        if self.sink.is_running() {
            timer.change_interval(u64::from(interval_ms))?;
        }
        self.interval = interval_ms;
        Ok(())
    }

    pub fn push_data(&self, data: &[f32]) -> Result<()> {
        self.sink.push_data(data)
    }

    pub fn clear_data(&self) -> Result<()> {
        self.sink.clear_data()
    }

    pub fn register_result_listener(&self, listener: ResultListener) {
        self.sink.pipeline.lock().register_result_listener(listener);
    }

    pub fn raw_data_count(&self) -> usize {
        self.sink.pipeline.lock().raw_data_count()
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.sink.is_running()
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub fn sink(&self) -> InferenceSink {
        self.sink.clone()
    }
}
