//! Audio device routing primitives consumed by the hardware detectors.
//!
//! The real implementation lives in the platform audio manager; this crate
//! only depends on the [`DeviceRouter`] trait and ships [`SimulatedDevice`]
//! for hosts without a speech-detection DSP.

pub mod simulated;

use crate::error::{Result, SpeechError};
use std::time::Duration;
use strum::Display;

pub use simulated::SimulatedDevice;

/// Result codes of the audio manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AudioManagerResult {
    #[strum(serialize = "success")]
    Success,
    #[strum(serialize = "device already in use")]
    DeviceAlreadyInUse,
    #[strum(serialize = "invalid device")]
    InvalidDevice,
    #[strum(serialize = "invalid parameter")]
    InvalidParam,
    #[strum(serialize = "operation failed")]
    OperationFail,
    #[strum(serialize = "device failure")]
    DeviceFail,
    #[strum(serialize = "device not supported")]
    DeviceNotSupport,
    #[strum(serialize = "card not ready")]
    CardNotReady,
    #[strum(serialize = "no available card")]
    NoAvailCard,
}

impl AudioManagerResult {
    pub fn is_success(self) -> bool {
        self == AudioManagerResult::Success
    }

    /// Turn a code into a `Result`, tagging failures with the operation name
    pub fn check(self, op: &'static str) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(SpeechError::device(op, self))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ProcessType {
    None,
    SpeechDetector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ProcessSubtype {
    None,
    EndPoint,
    Keyword,
    Local,
    Aec,
}

/// Messages posted by the device into its process mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMessage {
    EndPoint,
    Speech,
    Keyword,
    /// Local command recognised on the device (slot 0..=7)
    Local(u8),
}

/// A card/device pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceRoute {
    pub card: u32,
    pub device: u32,
}

impl DeviceRoute {
    pub const fn new(card: u32, device: u32) -> Self {
        Self { card, device }
    }
}

impl std::fmt::Display for DeviceRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "card {} device {}", self.card, self.device)
    }
}

pub trait DeviceRouter: Send + Sync {
    /// Route currently used for capture
    fn stream_in_device(&self) -> DeviceRoute;

    fn change_stream_in_device(&self, route: DeviceRoute) -> AudioManagerResult;

    /// Look for an input device offering the given process
    fn find_stream_in_device_with_process_type(
        &self,
        process: ProcessType,
        subtype: ProcessSubtype,
    ) -> std::result::Result<DeviceRoute, AudioManagerResult>;

    fn register_stream_in_device_process_type(
        &self,
        route: DeviceRoute,
        process: ProcessType,
        subtype: ProcessSubtype,
    ) -> AudioManagerResult;

    fn register_stream_in_device_process_handler(
        &self,
        route: DeviceRoute,
        process: ProcessType,
    ) -> AudioManagerResult;

    fn start_stream_in_device_process_type(
        &self,
        route: DeviceRoute,
        subtype: ProcessSubtype,
    ) -> AudioManagerResult;

    /// Stop the process and drop whatever is left in the mailbox
    fn stop_stream_in_device_process_type(
        &self,
        route: DeviceRoute,
        subtype: ProcessSubtype,
    ) -> AudioManagerResult;

    /// Wait up to `timeout` for the next mailbox message
    fn get_device_process_handler_message(
        &self,
        route: DeviceRoute,
        timeout: Duration,
    ) -> std::result::Result<ProcessMessage, AudioManagerResult>;

    fn unregister_stream_in_device_process(&self, route: DeviceRoute) -> AudioManagerResult;
}
