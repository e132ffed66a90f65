//! Inference-backed detectors running on the host.

use super::{
    classify_end_point, DetectionCallback, DetectionResult, EndPointDetector, EpdState,
    KeywordDetector, SharedCallback,
};
use crate::error::{Result, SpeechError};
use crate::inference::{InferenceResult, InferenceService, ModelPipeline};
use crate::stream_buffer::StreamBuffer;
use dasp_sample::Sample;

/// Captured audio is 16-bit little-endian PCM
pub const BYTES_PER_SAMPLE: usize = 2;

/// Builds a fresh end-point pipeline on every `init`
pub type PipelineFactory = Box<dyn Fn() -> Result<ModelPipeline> + Send>;

/// Size of the streaming buffer for a given per-callback delivery.
///
/// Starts at one delivery and keeps adding deliveries until the total is a
/// whole number of inference windows. A delivery smaller than one window can
/// never fill it and is rejected.
pub fn stream_buffer_size(delivery_bytes: usize, window_bytes: usize, max_bytes: usize) -> Result<usize> {
    if delivery_bytes == 0 || window_bytes == 0 {
        return Err(SpeechError::InvalidArgument(
            "Delivery and window sizes must be non-zero".to_string(),
        ));
    }
    if delivery_bytes < window_bytes {
        return Err(SpeechError::InvalidArgument(format!(
            "Insufficient data per delivery: {} bytes cannot fill a {}-byte inference window",
            delivery_bytes, window_bytes
        )));
    }

    let mut size = delivery_bytes;
    while size % window_bytes != 0 {
        size += delivery_bytes;
        if size > max_bytes {
            break;
        }
    }
    if size > max_bytes {
        return Err(SpeechError::InvalidArgument(format!(
            "Padding {}-byte deliveries to {}-byte windows needs {} bytes, limit is {}",
            delivery_bytes, window_bytes, size, max_bytes
        )));
    }
    Ok(size)
}

/// Decode little-endian 16-bit PCM into normalised samples
fn pcm16_to_f32(bytes: &[u8], out: &mut Vec<f32>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]).to_sample::<f32>()),
    );
}

pub struct SoftwareEndPointDetector {
    factory: PipelineFactory,
    delivery_bytes: usize,
    max_buffer_bytes: usize,
    service: Option<InferenceService>,
    buffer: Option<StreamBuffer>,
    window: Vec<u8>,
    samples: Vec<f32>,
    state: EpdState,
    callback: SharedCallback,
}

impl SoftwareEndPointDetector {
    pub fn new(factory: PipelineFactory, delivery_bytes: usize, max_buffer_bytes: usize) -> Self {
        Self {
            factory,
            delivery_bytes,
            max_buffer_bytes,
            service: None,
            buffer: None,
            window: Vec::new(),
            samples: Vec::new(),
            state: EpdState::Idle,
            callback: SharedCallback::default(),
        }
    }

    /// Bytes consumed by one inference
    pub fn window_bytes(&self) -> usize {
        self.window.len()
    }

    /// Bytes buffered but not yet handed to inference
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.as_ref().map_or(0, StreamBuffer::size_of_data)
    }

    fn setup(&mut self) -> Result<()> {
        let pipeline = (self.factory)()?;
        let mut service = InferenceService::new(pipeline);
        service.prepare(None)?;
        if service.interval() != 0 {
            return Err(SpeechError::InvalidArgument(format!(
                "End point pipeline must be push driven, got a {}ms interval",
                service.interval()
            )));
        }

        let window_bytes = service.raw_data_count() * BYTES_PER_SAMPLE;
        let size = stream_buffer_size(self.delivery_bytes, window_bytes, self.max_buffer_bytes)?;
        let buffer = StreamBuffer::builder()
            .capacity(size)
            .flush_threshold(window_bytes)
            .build()?;

        let callback = self.callback.clone();
        service.register_result_listener(Box::new(move |result, output| {
            if result == InferenceResult::Failure {
                log::warn!("End point inference cycle failed");
                return;
            }
            match classify_end_point(output) {
                DetectionResult::None => {}
                detected => callback.notify(detected),
            }
        }));

        log::info!(
            "Software end point detector ready: window {} bytes, buffer {} bytes",
            window_bytes,
            size
        );
        self.window = vec![0; window_bytes];
        self.buffer = Some(buffer);
        self.service = Some(service);
        Ok(())
    }
}

impl EndPointDetector for SoftwareEndPointDetector {
    fn init(&mut self) -> bool {
        if self.service.is_some() {
            return true;
        }
        match self.setup() {
            Ok(()) => true,
            Err(e) => {
                log::error!("Software end point detector init failed: {}", e);
                false
            }
        }
    }

    fn deinit(&mut self) {
        if let Some(mut service) = self.service.take() {
            if service.is_running() {
                if let Err(e) = service.stop() {
                    log::warn!("Failed to stop end point inference: {}", e);
                }
            }
        }
        self.buffer = None;
        self.window.clear();
        self.state = EpdState::Idle;
        log::info!("Software end point detector released");
    }

    /// Streaming detection has no wait of its own; the timeout is not used
    fn start_end_point_detect(&mut self, timeout_ms: i32) -> bool {
        if self.state == EpdState::InProgress {
            log::warn!("End point detection already in progress");
            return false;
        }
        let (Some(service), Some(buffer)) = (self.service.as_mut(), self.buffer.as_mut()) else {
            log::warn!("Software end point detection started before init");
            return false;
        };
        if let Err(e) = service.start() {
            log::error!("Failed to start end point inference: {}", e);
            return false;
        }
        buffer.clear();
        self.state = EpdState::InProgress;
        log::info!("End point detection started (timeout {}ms ignored)", timeout_ms);
        true
    }

    fn stop_end_point_detect(&mut self) -> bool {
        if self.state != EpdState::InProgress {
            return false;
        }
        if let Some(service) = self.service.as_mut() {
            if let Err(e) = service.stop() {
                log::warn!("Failed to stop end point inference: {}", e);
            }
        }
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.clear();
        }
        self.state = EpdState::Stop;
        log::info!("End point detection stopped");
        true
    }

    fn detect_end_point(&mut self, sample: &[u8]) -> bool {
        if self.state != EpdState::InProgress {
            return false;
        }
        let (Some(service), Some(buffer)) = (self.service.as_ref(), self.buffer.as_mut()) else {
            return false;
        };

        // Fill what fits, drain whole windows, repeat. After a drain less than
        // one window remains, so every round accepts at least one byte.
        let mut rest = sample;
        while !rest.is_empty() {
            let free = buffer.capacity() - buffer.size_of_data();
            let (head, tail) = rest.split_at(free.min(rest.len()));
            buffer.write(head);
            rest = tail;

            while buffer.size_of_data() >= self.window.len() {
                let read = buffer.read(&mut self.window);
                pcm16_to_f32(&self.window[..read], &mut self.samples);
                log::debug!("Pushing {} samples to end point inference", self.samples.len());
                if let Err(e) = service.push_data(&self.samples) {
                    log::warn!("End point inference failed: {}", e);
                }
            }
        }
        true
    }

    fn register_result_callback(&mut self, callback: DetectionCallback) {
        self.callback.set(callback);
    }

    fn state(&self) -> EpdState {
        self.state
    }

    fn audio_buffer_size(&self) -> usize {
        self.buffer.as_ref().map_or(0, StreamBuffer::capacity)
    }
}

/// Placeholder for hosts without a keyword model; never initialises
#[derive(Default)]
pub struct SoftwareKeywordDetector {
    callback: SharedCallback,
}

impl SoftwareKeywordDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeywordDetector for SoftwareKeywordDetector {
    fn init(&mut self) -> bool {
        log::warn!("No on-device keyword model available, keyword detection disabled");
        false
    }

    fn deinit(&mut self) {}

    fn start_keyword_detect(&mut self) -> bool {
        false
    }

    fn stop_keyword_detect(&mut self) -> bool {
        false
    }

    fn detect_keyword(&mut self) -> bool {
        false
    }

    fn register_result_callback(&mut self, callback: DetectionCallback) {
        self.callback.set(callback);
    }

    fn is_detecting(&self) -> bool {
        false
    }
}
