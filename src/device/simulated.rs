//! In-process stand-in for the platform audio manager.
//!
//! Keeps the bookkeeping rules of the real routing layer: re-routing to the
//! active device reports `DeviceAlreadyInUse`, process handlers are reference
//! counted, stopping a process drains its mailbox, and messages only arrive
//! while a process is started. Failures can be scripted per operation.

use super::{
    AudioManagerResult, DeviceRoute, DeviceRouter, ProcessMessage, ProcessSubtype, ProcessType,
};
use crossbeam_channel::{self as cb, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Default)]
struct RouteState {
    supported: Vec<ProcessSubtype>,
    configured: Vec<ProcessSubtype>,
    handler_refcnt: u32,
    started: Vec<ProcessSubtype>,
}

struct SimState {
    current: DeviceRoute,
    routes: HashMap<DeviceRoute, RouteState>,
    failures: HashMap<&'static str, AudioManagerResult>,
}

struct Mailbox {
    tx: cb::Sender<ProcessMessage>,
    rx: cb::Receiver<ProcessMessage>,
}

pub struct SimulatedDevice {
    state: Mutex<SimState>,
    mailboxes: Mutex<HashMap<DeviceRoute, Mailbox>>,
}

impl SimulatedDevice {
    /// A device tree with a single plain capture route
    pub fn new(input: DeviceRoute) -> Self {
        let mut routes = HashMap::new();
        routes.insert(input, RouteState::default());
        Self {
            state: Mutex::new(SimState {
                current: input,
                routes,
                failures: HashMap::new(),
            }),
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Add a speech-detection capable sub-device
    pub fn with_speech_detect(self, route: DeviceRoute, subtypes: &[ProcessSubtype]) -> Self {
        self.state.lock().routes.insert(
            route,
            RouteState {
                supported: subtypes.to_vec(),
                ..RouteState::default()
            },
        );
        self
    }

    /// Make the next call of `op` fail with `result`
    pub fn fail_next(&self, op: &'static str, result: AudioManagerResult) {
        self.state.lock().failures.insert(op, result);
    }

    /// Post a message as the DSP would. Returns false if no process is running on `route`.
    pub fn inject(&self, route: DeviceRoute, message: ProcessMessage) -> bool {
        let running = self
            .state
            .lock()
            .routes
            .get(&route)
            .map(|r| r.handler_refcnt > 0 && !r.started.is_empty())
            .unwrap_or(false);
        if !running {
            log::debug!("Dropping injected {:?}: no process running on {}", message, route);
            return false;
        }
        match self.mailboxes.lock().get(&route) {
            Some(mailbox) => mailbox.tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn handler_refcount(&self, route: DeviceRoute) -> u32 {
        self.state
            .lock()
            .routes
            .get(&route)
            .map(|r| r.handler_refcnt)
            .unwrap_or(0)
    }

    pub fn is_process_started(&self, route: DeviceRoute, subtype: ProcessSubtype) -> bool {
        self.state
            .lock()
            .routes
            .get(&route)
            .map(|r| r.started.contains(&subtype))
            .unwrap_or(false)
    }

    fn scripted_failure(state: &mut SimState, op: &'static str) -> Option<AudioManagerResult> {
        state.failures.remove(op)
    }
}

impl DeviceRouter for SimulatedDevice {
    fn stream_in_device(&self) -> DeviceRoute {
        self.state.lock().current
    }

    fn change_stream_in_device(&self, route: DeviceRoute) -> AudioManagerResult {
        let mut state = self.state.lock();
        if let Some(result) = Self::scripted_failure(&mut state, "change_stream_in_device") {
            return result;
        }
        if !state.routes.contains_key(&route) {
            return AudioManagerResult::InvalidParam;
        }
        if state.current == route {
            return AudioManagerResult::DeviceAlreadyInUse;
        }
        log::debug!("Input route {} -> {}", state.current, route);
        state.current = route;
        AudioManagerResult::Success
    }

    fn find_stream_in_device_with_process_type(
        &self,
        process: ProcessType,
        subtype: ProcessSubtype,
    ) -> Result<DeviceRoute, AudioManagerResult> {
        if process != ProcessType::SpeechDetector {
            return Err(AudioManagerResult::DeviceNotSupport);
        }
        let state = self.state.lock();
        let mut candidates: Vec<DeviceRoute> = state
            .routes
            .iter()
            .filter(|(_, r)| r.supported.contains(&subtype))
            .map(|(route, _)| *route)
            .collect();
        candidates.sort_by_key(|route| (route.card, route.device));
        candidates
            .first()
            .copied()
            .ok_or(AudioManagerResult::DeviceNotSupport)
    }

    fn register_stream_in_device_process_type(
        &self,
        route: DeviceRoute,
        process: ProcessType,
        subtype: ProcessSubtype,
    ) -> AudioManagerResult {
        let mut state = self.state.lock();
        if let Some(result) = Self::scripted_failure(&mut state, "register_process_type") {
            return result;
        }
        let Some(entry) = state.routes.get_mut(&route) else {
            return AudioManagerResult::InvalidDevice;
        };
        if process != ProcessType::SpeechDetector || !entry.supported.contains(&subtype) {
            return AudioManagerResult::DeviceNotSupport;
        }
        if !entry.configured.contains(&subtype) {
            entry.configured.push(subtype);
        }
        AudioManagerResult::Success
    }

    fn register_stream_in_device_process_handler(
        &self,
        route: DeviceRoute,
        process: ProcessType,
    ) -> AudioManagerResult {
        if process == ProcessType::None {
            return AudioManagerResult::InvalidParam;
        }
        let mut state = self.state.lock();
        if let Some(result) = Self::scripted_failure(&mut state, "register_process_handler") {
            return result;
        }
        let Some(entry) = state.routes.get_mut(&route) else {
            return AudioManagerResult::InvalidDevice;
        };
        if entry.supported.is_empty() {
            return AudioManagerResult::DeviceNotSupport;
        }

        entry.handler_refcnt += 1;
        if entry.handler_refcnt == 1 {
            let (tx, rx) = cb::bounded(16);
            self.mailboxes.lock().insert(route, Mailbox { tx, rx });
        }
        AudioManagerResult::Success
    }

    fn start_stream_in_device_process_type(
        &self,
        route: DeviceRoute,
        subtype: ProcessSubtype,
    ) -> AudioManagerResult {
        let mut state = self.state.lock();
        if let Some(result) = Self::scripted_failure(&mut state, "start_process") {
            return result;
        }
        let Some(entry) = state.routes.get_mut(&route) else {
            return AudioManagerResult::InvalidDevice;
        };
        // AEC may be armed before a handler exists
        if entry.handler_refcnt == 0 && subtype != ProcessSubtype::Aec {
            return AudioManagerResult::CardNotReady;
        }
        if !entry.started.contains(&subtype) {
            entry.started.push(subtype);
        }
        AudioManagerResult::Success
    }

    fn stop_stream_in_device_process_type(
        &self,
        route: DeviceRoute,
        subtype: ProcessSubtype,
    ) -> AudioManagerResult {
        {
            let mut state = self.state.lock();
            if let Some(result) = Self::scripted_failure(&mut state, "stop_process") {
                return result;
            }
            let Some(entry) = state.routes.get_mut(&route) else {
                return AudioManagerResult::InvalidDevice;
            };
            if entry.handler_refcnt == 0 && subtype != ProcessSubtype::Aec {
                return AudioManagerResult::CardNotReady;
            }
            entry.started.retain(|s| *s != subtype);
        }

        if let Some(mailbox) = self.mailboxes.lock().get(&route) {
            let drained = mailbox.rx.try_iter().count();
            if drained > 0 {
                log::debug!("Discarded {} stale mailbox message(s) on {}", drained, route);
            }
        }
        AudioManagerResult::Success
    }

    fn get_device_process_handler_message(
        &self,
        route: DeviceRoute,
        timeout: Duration,
    ) -> Result<ProcessMessage, AudioManagerResult> {
        let rx = match self.mailboxes.lock().get(&route) {
            Some(mailbox) => mailbox.rx.clone(),
            None => return Err(AudioManagerResult::InvalidDevice),
        };
        match rx.recv_timeout(timeout) {
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(AudioManagerResult::OperationFail)
            }
        }
    }

    fn unregister_stream_in_device_process(&self, route: DeviceRoute) -> AudioManagerResult {
        let mut state = self.state.lock();
        if let Some(result) = Self::scripted_failure(&mut state, "unregister_process") {
            return result;
        }
        let Some(entry) = state.routes.get_mut(&route) else {
            return AudioManagerResult::InvalidDevice;
        };
        if entry.handler_refcnt == 0 {
            return AudioManagerResult::InvalidDevice;
        }

        entry.handler_refcnt -= 1;
        if entry.handler_refcnt == 0 {
            entry.started.clear();
            entry.configured.clear();
            self.mailboxes.lock().remove(&route);
        }
        AudioManagerResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: DeviceRoute = DeviceRoute::new(0, 0);
    const DSP: DeviceRoute = DeviceRoute::new(0, 1);

    fn device() -> SimulatedDevice {
        SimulatedDevice::new(INPUT)
            .with_speech_detect(DSP, &[ProcessSubtype::Keyword, ProcessSubtype::EndPoint])
    }

    #[test]
    fn test_change_route() {
        let device = device();
        assert_eq!(
            device.change_stream_in_device(INPUT),
            AudioManagerResult::DeviceAlreadyInUse
        );
        assert_eq!(device.change_stream_in_device(DSP), AudioManagerResult::Success);
        assert_eq!(device.stream_in_device(), DSP);
        assert_eq!(
            device.change_stream_in_device(DeviceRoute::new(3, 3)),
            AudioManagerResult::InvalidParam
        );
    }

    #[test]
    fn test_find_process_device() {
        let device = device();
        assert_eq!(
            device.find_stream_in_device_with_process_type(
                ProcessType::SpeechDetector,
                ProcessSubtype::Keyword
            ),
            Ok(DSP)
        );
        assert!(SimulatedDevice::new(INPUT)
            .find_stream_in_device_with_process_type(
                ProcessType::SpeechDetector,
                ProcessSubtype::Keyword
            )
            .is_err());
    }

    #[test]
    fn test_handler_refcount_and_mailbox() {
        let device = device();
        assert!(!device.inject(DSP, ProcessMessage::Keyword));

        assert!(device
            .register_stream_in_device_process_handler(DSP, ProcessType::SpeechDetector)
            .is_success());
        assert!(device
            .register_stream_in_device_process_handler(DSP, ProcessType::SpeechDetector)
            .is_success());
        assert_eq!(device.handler_refcount(DSP), 2);

        assert!(device
            .start_stream_in_device_process_type(DSP, ProcessSubtype::Keyword)
            .is_success());
        assert!(device.inject(DSP, ProcessMessage::Keyword));
        assert_eq!(
            device.get_device_process_handler_message(DSP, Duration::from_millis(50)),
            Ok(ProcessMessage::Keyword)
        );
        assert_eq!(
            device.get_device_process_handler_message(DSP, Duration::from_millis(10)),
            Err(AudioManagerResult::OperationFail)
        );

        assert!(device.unregister_stream_in_device_process(DSP).is_success());
        assert_eq!(device.handler_refcount(DSP), 1);
        assert!(device.unregister_stream_in_device_process(DSP).is_success());
        assert_eq!(
            device.unregister_stream_in_device_process(DSP),
            AudioManagerResult::InvalidDevice
        );
    }

    #[test]
    fn test_stop_drains_mailbox() {
        let device = device();
        device.register_stream_in_device_process_handler(DSP, ProcessType::SpeechDetector);
        device.start_stream_in_device_process_type(DSP, ProcessSubtype::EndPoint);
        device.inject(DSP, ProcessMessage::Speech);
        device.inject(DSP, ProcessMessage::EndPoint);

        assert!(device
            .stop_stream_in_device_process_type(DSP, ProcessSubtype::EndPoint)
            .is_success());
        assert!(device
            .get_device_process_handler_message(DSP, Duration::from_millis(10))
            .is_err());
    }

    #[test]
    fn test_start_requires_handler() {
        let device = device();
        assert_eq!(
            device.start_stream_in_device_process_type(DSP, ProcessSubtype::Keyword),
            AudioManagerResult::CardNotReady
        );
        assert!(device
            .start_stream_in_device_process_type(DSP, ProcessSubtype::Aec)
            .is_success());
    }

    #[test]
    fn test_scripted_failure_fires_once() {
        let device = device();
        device.fail_next("register_process_type", AudioManagerResult::DeviceFail);
        assert_eq!(
            device.register_stream_in_device_process_type(
                DSP,
                ProcessType::SpeechDetector,
                ProcessSubtype::Keyword
            ),
            AudioManagerResult::DeviceFail
        );
        assert!(device
            .register_stream_in_device_process_type(
                DSP,
                ProcessType::SpeechDetector,
                ProcessSubtype::Keyword
            )
            .is_success());
    }
}
