//! DSP-backed detectors. The sub-device runs the detection itself and posts
//! results into its process mailbox; these types only route, arm and poll.

use super::{
    DetectionCallback, DetectionResult, EndPointDetector, EpdState, KeywordDetector,
    SharedCallback,
};
use crate::device::{
    AudioManagerResult, DeviceRoute, DeviceRouter, ProcessMessage, ProcessSubtype, ProcessType,
};
use crate::error::{Result, SpeechError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Routing and process registration for one detection subtype on a DSP route
struct DspBinding {
    router: Arc<dyn DeviceRouter>,
    route: DeviceRoute,
    subtype: ProcessSubtype,
    restore: Option<DeviceRoute>,
    attached: bool,
}

impl DspBinding {
    fn new(router: Arc<dyn DeviceRouter>, route: DeviceRoute, subtype: ProcessSubtype) -> Self {
        Self {
            router,
            route,
            subtype,
            restore: None,
            attached: false,
        }
    }

    fn attach(&mut self) -> Result<()> {
        if self.attached {
            return Ok(());
        }

        let original = self.router.stream_in_device();
        match self.router.change_stream_in_device(self.route) {
            AudioManagerResult::Success => self.restore = Some(original),
            // Another detector already moved capture here
            AudioManagerResult::DeviceAlreadyInUse => self.restore = None,
            other => return Err(SpeechError::device("change_stream_in_device", other)),
        }

        let registered = self
            .router
            .register_stream_in_device_process_type(
                self.route,
                ProcessType::SpeechDetector,
                self.subtype,
            )
            .check("register_stream_in_device_process_type")
            .and_then(|_| {
                self.router
                    .register_stream_in_device_process_handler(
                        self.route,
                        ProcessType::SpeechDetector,
                    )
                    .check("register_stream_in_device_process_handler")
            });
        if let Err(e) = registered {
            self.restore_route();
            return Err(e);
        }

        self.attached = true;
        Ok(())
    }

    fn detach(&mut self) {
        if !self.attached {
            return;
        }
        let result = self.router.unregister_stream_in_device_process(self.route);
        if !result.is_success() {
            log::warn!("Failed to unregister {} process on {}: {}", self.subtype, self.route, result);
        }
        self.restore_route();
        self.attached = false;
    }

    fn restore_route(&mut self) {
        if let Some(original) = self.restore.take() {
            let result = self.router.change_stream_in_device(original);
            if !result.is_success() && result != AudioManagerResult::DeviceAlreadyInUse {
                log::warn!("Failed to restore input route {}: {}", original, result);
            }
        }
    }

    fn start_process(&self) -> Result<()> {
        self.router
            .start_stream_in_device_process_type(self.route, self.subtype)
            .check("start_stream_in_device_process_type")
    }

    fn stop_process(&self) -> Result<()> {
        self.router
            .stop_stream_in_device_process_type(self.route, self.subtype)
            .check("stop_stream_in_device_process_type")
    }

    /// `Ok(None)` when nothing arrived within `timeout`
    fn next_message(&self, timeout: Duration) -> Result<Option<ProcessMessage>> {
        match self
            .router
            .get_device_process_handler_message(self.route, timeout)
        {
            Ok(message) => Ok(Some(message)),
            Err(AudioManagerResult::OperationFail) => Ok(None),
            Err(other) => Err(SpeechError::device("get_device_process_handler_message", other)),
        }
    }
}

pub struct HardwareEndPointDetector {
    dsp: DspBinding,
    poll_slice: Duration,
    state: EpdState,
    timeout_ms: i32,
    deadline: Option<Instant>,
    callback: SharedCallback,
}

impl HardwareEndPointDetector {
    pub fn new(router: Arc<dyn DeviceRouter>, route: DeviceRoute, process_msg_timeout_ms: u64) -> Self {
        Self {
            dsp: DspBinding::new(router, route, ProcessSubtype::EndPoint),
            poll_slice: Duration::from_millis(process_msg_timeout_ms.max(1)),
            state: EpdState::Idle,
            timeout_ms: -1,
            deadline: None,
            callback: SharedCallback::default(),
        }
    }

    /// Leave the wait: stop the DSP process and go back to `Idle`
    fn finish(&mut self) {
        if let Err(e) = self.dsp.stop_process() {
            log::warn!("Failed to stop end point process: {}", e);
        }
        self.deadline = None;
        self.state = EpdState::Idle;
    }
}

impl EndPointDetector for HardwareEndPointDetector {
    fn init(&mut self) -> bool {
        match self.dsp.attach() {
            Ok(()) => {
                log::info!("Hardware end point detector ready on {}", self.dsp.route);
                true
            }
            Err(e) => {
                log::error!("Hardware end point detector init failed: {}", e);
                false
            }
        }
    }

    fn deinit(&mut self) {
        if self.state == EpdState::InProgress {
            let _ = self.stop_end_point_detect();
        }
        self.dsp.detach();
        self.state = EpdState::Idle;
        log::info!("Hardware end point detector released");
    }

    /// Start the DSP process and arm the wait. The wait itself is driven by
    /// [`poll_end_point`](EndPointDetector::poll_end_point).
    fn start_end_point_detect(&mut self, timeout_ms: i32) -> bool {
        if !self.dsp.attached {
            log::warn!("Hardware end point detection started before init");
            return false;
        }
        if self.state == EpdState::InProgress {
            log::warn!("End point detection already in progress");
            return false;
        }
        if let Err(e) = self.dsp.start_process() {
            log::error!("Failed to start end point process: {}", e);
            return false;
        }

        self.timeout_ms = timeout_ms;
        self.deadline = u64::try_from(timeout_ms)
            .ok()
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        self.state = EpdState::InProgress;
        log::info!("End point detection started (timeout {}ms)", timeout_ms);
        true
    }

    fn stop_end_point_detect(&mut self) -> bool {
        if self.state != EpdState::InProgress {
            return false;
        }
        if let Err(e) = self.dsp.stop_process() {
            log::warn!("Failed to stop end point process: {}", e);
        }
        self.deadline = None;
        self.state = EpdState::Stop;
        log::info!("End point detection stopped");
        true
    }

    /// The DSP taps the capture path itself; host audio is not needed
    fn detect_end_point(&mut self, _sample: &[u8]) -> bool {
        self.state == EpdState::InProgress
    }

    fn register_result_callback(&mut self, callback: DetectionCallback) {
        self.callback.set(callback);
    }

    fn state(&self) -> EpdState {
        self.state
    }

    fn is_waiting(&self) -> bool {
        self.state == EpdState::InProgress
    }

    /// Read the mailbox for at most one poll slice. `Speech` is forwarded
    /// without ending the wait; an end point, the deadline or a mailbox
    /// failure ends it.
    fn poll_end_point(&mut self) -> bool {
        if self.state != EpdState::InProgress {
            return false;
        }
        let slice = match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    log::info!("End point detection timed out after {}ms", self.timeout_ms);
                    self.finish();
                    return false;
                }
                self.poll_slice.min(deadline - now)
            }
            None => self.poll_slice,
        };

        match self.dsp.next_message(slice) {
            Ok(Some(ProcessMessage::EndPoint)) => {
                log::info!("End point detected");
                self.finish();
                self.callback.notify(DetectionResult::EndPoint);
                true
            }
            Ok(Some(ProcessMessage::Speech)) => {
                self.callback.notify(DetectionResult::Speech);
                false
            }
            // The keyword process may share this mailbox
            Ok(Some(message @ (ProcessMessage::Keyword | ProcessMessage::Local(_)))) => {
                let result = DetectionResult::from(message);
                log::info!("Reporting {:?} received during end point wait", result);
                self.callback.notify(result);
                false
            }
            Ok(None) => false,
            Err(e) => {
                log::error!("End point polling aborted: {}", e);
                self.finish();
                false
            }
        }
    }
}

pub struct HardwareKeywordDetector {
    dsp: DspBinding,
    poll_slice: Duration,
    detecting: bool,
    callback: SharedCallback,
}

impl HardwareKeywordDetector {
    pub fn new(router: Arc<dyn DeviceRouter>, route: DeviceRoute, process_msg_timeout_ms: u64) -> Self {
        Self {
            dsp: DspBinding::new(router, route, ProcessSubtype::Keyword),
            poll_slice: Duration::from_millis(process_msg_timeout_ms.max(1)),
            detecting: false,
            callback: SharedCallback::default(),
        }
    }
}

impl KeywordDetector for HardwareKeywordDetector {
    fn init(&mut self) -> bool {
        match self.dsp.attach() {
            Ok(()) => {
                log::info!("Hardware keyword detector ready on {}", self.dsp.route);
                true
            }
            Err(e) => {
                log::error!("Hardware keyword detector init failed: {}", e);
                false
            }
        }
    }

    fn deinit(&mut self) {
        if self.detecting {
            let _ = self.stop_keyword_detect();
        }
        self.dsp.detach();
        log::info!("Hardware keyword detector released");
    }

    fn start_keyword_detect(&mut self) -> bool {
        if !self.dsp.attached {
            log::warn!("Keyword detection started before init");
            return false;
        }
        if self.detecting {
            return false;
        }
        if let Err(e) = self.dsp.start_process() {
            log::error!("Failed to start keyword process: {}", e);
            return false;
        }
        self.detecting = true;
        log::info!("Keyword detection started");
        true
    }

    fn stop_keyword_detect(&mut self) -> bool {
        if !self.detecting {
            return false;
        }
        if let Err(e) = self.dsp.stop_process() {
            log::warn!("Failed to stop keyword process: {}", e);
        }
        self.detecting = false;
        log::info!("Keyword detection stopped");
        true
    }

    fn detect_keyword(&mut self) -> bool {
        if !self.detecting {
            return false;
        }
        match self.dsp.next_message(self.poll_slice) {
            Ok(Some(message @ (ProcessMessage::Keyword | ProcessMessage::Local(_)))) => {
                let result = DetectionResult::from(message);
                log::info!("Keyword detector reported {:?}", result);
                self.callback.notify(result);
                true
            }
            Ok(Some(other)) => {
                log::debug!("Ignoring {:?} on keyword mailbox", other);
                false
            }
            Ok(None) => false,
            Err(e) => {
                log::warn!("Keyword polling failed: {}", e);
                false
            }
        }
    }

    fn register_result_callback(&mut self, callback: DetectionCallback) {
        self.callback.set(callback);
    }

    fn is_detecting(&self) -> bool {
        self.detecting
    }
}
