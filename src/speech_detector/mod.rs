//! Public entry point for keyword and end-point detection.
//!
//! Every detector call runs on the `SpeechDetectorWorker` thread, so callers
//! such as the audio capture thread never block on DSP polling or inference.
//! Results are mapped to [`SpeechDetectorEvent`]s and fanned out to listeners
//! on a second worker, `SpeechDetectorListenerWorker`.

pub mod listener;

pub use listener::{ListenerRegistry, SpeechDetectorEvent, SpeechDetectorListener};

use crate::config::SpeechDetectorConfig;
use crate::detector::{
    DetectionCallback, EndPointDetector, EndPointDetectorKind, EpdState,
    HardwareEndPointDetector, HardwareKeywordDetector, KeywordDetector, KeywordDetectorKind,
    PipelineFactory, SoftwareEndPointDetector, SoftwareKeywordDetector,
};
use crate::device::{DeviceRoute, DeviceRouter, ProcessSubtype, ProcessType};
use crate::error::{Result, SpeechError};
use crate::worker::{TaskQueueWorker, WorkerHandle, WorkerOptions, WorkerState};
use crossbeam_channel as cb;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

const DETECTOR_WORKER: &str = "SpeechDetectorWorker";
const LISTENER_WORKER: &str = "SpeechDetectorListenerWorker";

/// Which detection kinds the device can run itself, and where
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub hardware_keyword: Option<DeviceRoute>,
    pub hardware_end_point: Option<DeviceRoute>,
}

impl Capabilities {
    /// Ask the router for speech-detection capable sub-devices
    pub fn discover(router: &dyn DeviceRouter, force_software: bool) -> Self {
        if force_software {
            log::info!("Hardware speech detection disabled by configuration");
            return Self::default();
        }

        let lookup = |subtype: ProcessSubtype| {
            match router.find_stream_in_device_with_process_type(ProcessType::SpeechDetector, subtype) {
                Ok(route) => {
                    log::info!("Hardware {} detection available on {}", subtype, route);
                    Some(route)
                }
                Err(result) => {
                    log::info!("No hardware {} detection ({}), using software", subtype, result);
                    None
                }
            }
        };

        Self {
            hardware_keyword: lookup(ProcessSubtype::Keyword),
            hardware_end_point: lookup(ProcessSubtype::EndPoint),
        }
    }
}

/// Detector state mirrored for lock-free queries from any thread
#[derive(Default)]
struct StatusSnapshot {
    end_point_state: AtomicU8,
    keyword_detecting: AtomicBool,
    audio_buffer_size: AtomicUsize,
}

/// Detectors owned by the detection worker thread
struct DetectorState {
    keyword: KeywordDetectorKind,
    end_point: EndPointDetectorKind,
    /// Both hardware detectors read the same DSP mailbox
    shared_mailbox: bool,
    status: Arc<StatusSnapshot>,
}

impl DetectorState {
    fn publish(&self) {
        self.status
            .end_point_state
            .store(self.end_point.state().as_u8(), Ordering::Release);
        self.status
            .keyword_detecting
            .store(self.keyword.is_detecting(), Ordering::Release);
        self.status
            .audio_buffer_size
            .store(self.end_point.audio_buffer_size(), Ordering::Release);
    }
}

impl WorkerState for DetectorState {
    fn wants_poll(&self) -> bool {
        self.keyword.is_detecting() || self.end_point.is_waiting()
    }

    /// One bounded slice per detector. While an end-point wait owns a shared
    /// mailbox it also reports keyword messages, so keyword polling pauses.
    fn poll(&mut self) {
        let waiting = self.end_point.is_waiting();
        if waiting {
            self.end_point.poll_end_point();
        }
        if self.keyword.is_detecting() && !(waiting && self.shared_mailbox) {
            self.keyword.detect_keyword();
        }
        self.publish();
    }
}

/// Map detector results to events and hand them to the listener worker
fn event_forwarder(
    listeners: Arc<ListenerRegistry>,
    dispatch: WorkerHandle<()>,
) -> DetectionCallback {
    Box::new(move |result| {
        let Some(event) = SpeechDetectorEvent::from_result(result) else {
            return;
        };
        let listeners = Arc::clone(&listeners);
        if !dispatch.en_queue(move |_| {
            listeners.dispatch(event);
        }) {
            log::warn!("Listener worker stopped, dropping {:?}", event);
        }
    })
}

pub struct SpeechDetector {
    worker: TaskQueueWorker<DetectorState>,
    listener_worker: TaskQueueWorker<()>,
    listeners: Arc<ListenerRegistry>,
    status: Arc<StatusSnapshot>,
    capabilities: Capabilities,
    shut_down: bool,
}

impl SpeechDetector {
    /// Discover capabilities, build one detector per kind and start both workers.
    ///
    /// `epd_factory` builds the pipeline for software end-point detection and is
    /// only used when the device has no end-point DSP.
    pub fn new(
        config: &SpeechDetectorConfig,
        router: Arc<dyn DeviceRouter>,
        epd_factory: PipelineFactory,
    ) -> Result<Self> {
        let capabilities = Capabilities::discover(router.as_ref(), config.force_software);

        let mut keyword = match capabilities.hardware_keyword {
            Some(route) => KeywordDetectorKind::Hardware(HardwareKeywordDetector::new(
                Arc::clone(&router),
                route,
                config.process_msg_timeout_ms,
            )),
            None => KeywordDetectorKind::Software(SoftwareKeywordDetector::new()),
        };
        let mut end_point = match capabilities.hardware_end_point {
            Some(route) => EndPointDetectorKind::Hardware(HardwareEndPointDetector::new(
                Arc::clone(&router),
                route,
                config.process_msg_timeout_ms,
            )),
            None => EndPointDetectorKind::Software(SoftwareEndPointDetector::new(
                epd_factory,
                config.delivery_bytes,
                config.max_stream_buffer_bytes,
            )),
        };

        let mut listener_worker =
            TaskQueueWorker::new(WorkerOptions::new(LISTENER_WORKER, config.worker_stack_size));
        if !listener_worker.start_worker(()) {
            return Err(SpeechError::NoMemory(format!("failed to start {}", LISTENER_WORKER)));
        }

        let listeners = Arc::new(ListenerRegistry::new());
        keyword.register_result_callback(event_forwarder(
            Arc::clone(&listeners),
            listener_worker.handle(),
        ));
        end_point.register_result_callback(event_forwarder(
            Arc::clone(&listeners),
            listener_worker.handle(),
        ));

        let status = Arc::new(StatusSnapshot::default());
        let state = DetectorState {
            keyword,
            end_point,
            shared_mailbox: capabilities.hardware_keyword.is_some()
                && capabilities.hardware_keyword == capabilities.hardware_end_point,
            status: Arc::clone(&status),
        };
        state.publish();

        let mut worker =
            TaskQueueWorker::new(WorkerOptions::new(DETECTOR_WORKER, config.worker_stack_size));
        if !worker.start_worker(state) {
            return Err(SpeechError::NoMemory(format!("failed to start {}", DETECTOR_WORKER)));
        }

        log::info!(
            "Speech detector ready (keyword: {}, end point: {})",
            if capabilities.hardware_keyword.is_some() { "hardware" } else { "software" },
            if capabilities.hardware_end_point.is_some() { "hardware" } else { "software" },
        );

        Ok(Self {
            worker,
            listener_worker,
            listeners,
            status,
            capabilities,
            shut_down: false,
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Run `f` on the detection worker and wait for its result.
    /// `None` if the task never ran (worker stopped or queue cleared).
    fn call<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut DetectorState) -> R + Send + 'static,
    {
        let (tx, rx) = cb::bounded(1);
        let queued = self.worker.en_queue(move |state: &mut DetectorState| {
            let value = f(state);
            state.publish();
            let _ = tx.send(value);
        });
        if !queued {
            return None;
        }
        rx.recv().ok()
    }

    /// Queue `f` on the detection worker without waiting
    fn submit<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut DetectorState) + Send + 'static,
    {
        self.worker.en_queue(move |state: &mut DetectorState| {
            f(state);
            state.publish();
        })
    }

    pub fn init_keyword_detect(&self) -> bool {
        self.call(|s| s.keyword.init()).unwrap_or(false)
    }

    pub fn deinit_keyword_detect(&self) -> bool {
        self.call(|s| s.keyword.deinit()).is_some()
    }

    pub fn init_end_point_detect(&self) -> bool {
        self.call(|s| s.end_point.init()).unwrap_or(false)
    }

    pub fn deinit_end_point_detect(&self) -> bool {
        self.call(|s| s.end_point.deinit()).is_some()
    }

    pub fn start_keyword_detect(&self) -> bool {
        self.submit(|s| {
            if !s.keyword.start_keyword_detect() {
                log::warn!("Keyword detection did not start");
            }
        })
    }

    pub fn stop_keyword_detect(&self) -> bool {
        self.submit(|s| {
            s.keyword.stop_keyword_detect();
        })
    }

    /// Begin end-point detection; `timeout_ms < 0` waits without limit on
    /// hardware detectors. The wait runs between queued calls on the worker.
    pub fn start_end_point_detect(&self, timeout_ms: i32) -> bool {
        self.submit(move |s| {
            if !s.end_point.start_end_point_detect(timeout_ms) {
                log::warn!("End point detection did not start");
            }
        })
    }

    /// Hand captured audio to the end-point detector. The bytes are copied
    /// and processed on the worker.
    pub fn detect_end_point(&self, sample: &[u8]) -> bool {
        let sample = sample.to_vec();
        self.submit(move |s| {
            s.end_point.detect_end_point(&sample);
        })
    }

    /// Cancel everything still queued, then stop the end-point detector
    pub fn stop_end_point_detect(&self) -> bool {
        let dropped = self.worker.clear_queue() + self.listener_worker.clear_queue();
        if dropped > 0 {
            log::debug!("Discarded {} queued call(s) before stopping end point detection", dropped);
        }
        self.call(|s| s.end_point.stop_end_point_detect())
            .unwrap_or(false)
    }

    /// Wait until everything queued so far, including listener dispatch, has run
    pub fn wait_idle(&self) -> bool {
        if self.call(|_| ()).is_none() {
            return false;
        }
        let (tx, rx) = cb::bounded(1);
        if !self.listener_worker.en_queue(move |_| {
            let _ = tx.send(());
        }) {
            return false;
        }
        rx.recv().is_ok()
    }

    pub fn end_point_state(&self) -> EpdState {
        EpdState::from_u8(self.status.end_point_state.load(Ordering::Acquire))
    }

    pub fn is_keyword_detecting(&self) -> bool {
        self.status.keyword_detecting.load(Ordering::Acquire)
    }

    pub fn audio_buffer_size(&self) -> usize {
        self.status.audio_buffer_size.load(Ordering::Acquire)
    }

    pub fn add_listener(&self, listener: &Arc<dyn SpeechDetectorListener>) -> bool {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SpeechDetectorListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Release both detectors and stop the workers
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        self.worker.clear_queue();
        if self
            .call(|s| {
                s.keyword.deinit();
                s.end_point.deinit();
            })
            .is_none()
        {
            log::warn!("Detectors were not deinitialised before shutdown");
        }
        self.worker.stop_worker();
        self.listener_worker.stop_worker();
        log::info!("Speech detector shut down");
    }
}

impl Drop for SpeechDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
