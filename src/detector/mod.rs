//! Keyword and end-point detection strategies.
//!
//! Each detection kind has a hardware variant (a DSP sub-device reporting
//! through its process mailbox) and a software variant (on-device inference).
//! The variant is picked once at capability discovery and wrapped in a
//! [`EndPointDetectorKind`] / [`KeywordDetectorKind`].
//!
//! None of the detectors are thread-safe; they are only ever driven from the
//! speech detector worker thread.

pub mod hardware;
pub mod software;

use crate::device::ProcessMessage;
use parking_lot::Mutex;
use std::sync::Arc;
use strum::Display;

pub use hardware::{HardwareEndPointDetector, HardwareKeywordDetector};
pub use software::{
    stream_buffer_size, PipelineFactory, SoftwareEndPointDetector, SoftwareKeywordDetector,
    BYTES_PER_SAMPLE,
};

/// End-point detection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EpdState {
    Idle,
    InProgress,
    Stop,
}

impl EpdState {
    pub fn as_u8(self) -> u8 {
        match self {
            EpdState::Idle => 0,
            EpdState::InProgress => 1,
            EpdState::Stop => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => EpdState::InProgress,
            2 => EpdState::Stop,
            _ => EpdState::Idle,
        }
    }
}

/// What a detector found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionResult {
    None,
    EndPoint,
    Speech,
    Keyword,
    Local(u8),
}

impl From<ProcessMessage> for DetectionResult {
    fn from(message: ProcessMessage) -> Self {
        match message {
            ProcessMessage::EndPoint => DetectionResult::EndPoint,
            ProcessMessage::Speech => DetectionResult::Speech,
            ProcessMessage::Keyword => DetectionResult::Keyword,
            ProcessMessage::Local(slot) => DetectionResult::Local(slot),
        }
    }
}

/// Classify a `[no_endpoint, endpoint]` inference result.
///
/// Detection happens only when `result[0] < result[1]`; an exact `1.0` in the
/// second slot marks the end point, anything else is ongoing speech.
pub fn classify_end_point(result: &[f32]) -> DetectionResult {
    match result {
        [first, second, ..] if first < second => {
            if *second == 1.0 {
                DetectionResult::EndPoint
            } else {
                DetectionResult::Speech
            }
        }
        _ => DetectionResult::None,
    }
}

pub type DetectionCallback = Box<dyn FnMut(DetectionResult) + Send>;

/// Callback slot shared with closures living inside a detector
#[derive(Clone, Default)]
pub(crate) struct SharedCallback(Arc<Mutex<Option<DetectionCallback>>>);

impl SharedCallback {
    pub(crate) fn set(&self, callback: DetectionCallback) {
        *self.0.lock() = Some(callback);
    }

    pub(crate) fn notify(&self, result: DetectionResult) {
        match self.0.lock().as_mut() {
            Some(callback) => callback(result),
            None => log::debug!("No result callback registered, dropping {:?}", result),
        }
    }
}

pub trait EndPointDetector: Send {
    fn init(&mut self) -> bool;

    fn deinit(&mut self);

    /// Begin detection. `timeout_ms < 0` waits without limit where the
    /// variant waits at all.
    fn start_end_point_detect(&mut self, timeout_ms: i32) -> bool;

    fn stop_end_point_detect(&mut self) -> bool;

    /// Hand over captured audio; dropped unless detection is in progress
    fn detect_end_point(&mut self, sample: &[u8]) -> bool;

    fn register_result_callback(&mut self, callback: DetectionCallback);

    fn state(&self) -> EpdState;

    /// Size of the capture buffer the detector expects, 0 if it has none
    fn audio_buffer_size(&self) -> usize {
        0
    }

    /// True while the detector needs [`poll_end_point`](Self::poll_end_point)
    /// to be driven
    fn is_waiting(&self) -> bool {
        false
    }

    /// One bounded wait step; true if an end point was reported
    fn poll_end_point(&mut self) -> bool {
        false
    }
}

pub trait KeywordDetector: Send {
    fn init(&mut self) -> bool;

    fn deinit(&mut self);

    fn start_keyword_detect(&mut self) -> bool;

    fn stop_keyword_detect(&mut self) -> bool;

    /// One detection step; true if a keyword or local command was reported
    fn detect_keyword(&mut self) -> bool;

    fn register_result_callback(&mut self, callback: DetectionCallback);

    fn is_detecting(&self) -> bool;
}

pub enum EndPointDetectorKind {
    Hardware(HardwareEndPointDetector),
    Software(SoftwareEndPointDetector),
}

impl EndPointDetectorKind {
    fn inner(&self) -> &dyn EndPointDetector {
        match self {
            EndPointDetectorKind::Hardware(d) => d,
            EndPointDetectorKind::Software(d) => d,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn EndPointDetector {
        match self {
            EndPointDetectorKind::Hardware(d) => d,
            EndPointDetectorKind::Software(d) => d,
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, EndPointDetectorKind::Hardware(_))
    }
}

impl EndPointDetector for EndPointDetectorKind {
    fn init(&mut self) -> bool {
        self.inner_mut().init()
    }

    fn deinit(&mut self) {
        self.inner_mut().deinit()
    }

    fn start_end_point_detect(&mut self, timeout_ms: i32) -> bool {
        self.inner_mut().start_end_point_detect(timeout_ms)
    }

    fn stop_end_point_detect(&mut self) -> bool {
        self.inner_mut().stop_end_point_detect()
    }

    fn detect_end_point(&mut self, sample: &[u8]) -> bool {
        self.inner_mut().detect_end_point(sample)
    }

    fn register_result_callback(&mut self, callback: DetectionCallback) {
        self.inner_mut().register_result_callback(callback)
    }

    fn state(&self) -> EpdState {
        self.inner().state()
    }

    fn audio_buffer_size(&self) -> usize {
        self.inner().audio_buffer_size()
    }

    fn is_waiting(&self) -> bool {
        self.inner().is_waiting()
    }

    fn poll_end_point(&mut self) -> bool {
        self.inner_mut().poll_end_point()
    }
}

pub enum KeywordDetectorKind {
    Hardware(HardwareKeywordDetector),
    Software(SoftwareKeywordDetector),
}

impl KeywordDetectorKind {
    fn inner(&self) -> &dyn KeywordDetector {
        match self {
            KeywordDetectorKind::Hardware(d) => d,
            KeywordDetectorKind::Software(d) => d,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn KeywordDetector {
        match self {
            KeywordDetectorKind::Hardware(d) => d,
            KeywordDetectorKind::Software(d) => d,
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, KeywordDetectorKind::Hardware(_))
    }
}

impl KeywordDetector for KeywordDetectorKind {
    fn init(&mut self) -> bool {
        self.inner_mut().init()
    }

    fn deinit(&mut self) {
        self.inner_mut().deinit()
    }

    fn start_keyword_detect(&mut self) -> bool {
        self.inner_mut().start_keyword_detect()
    }

    fn stop_keyword_detect(&mut self) -> bool {
        self.inner_mut().stop_keyword_detect()
    }

    fn detect_keyword(&mut self) -> bool {
        self.inner_mut().detect_keyword()
    }

    fn register_result_callback(&mut self, callback: DetectionCallback) {
        self.inner_mut().register_result_callback(callback)
    }

    fn is_detecting(&self) -> bool {
        self.inner().is_detecting()
    }
}
