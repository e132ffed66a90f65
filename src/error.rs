use crate::config::ConfigError;
use crate::device::AudioManagerResult;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpeechError>;

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Inference service is not running")]
    NotRunning,

    #[error("Out of memory: {0}")]
    NoMemory(String),

    #[error("Device error during {op}: {result}")]
    Device {
        op: &'static str,
        result: AudioManagerResult,
    },

    #[error("Timer error: {0}")]
    Timer(String),

    #[error("Inference failure: {0}")]
    Inference(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SpeechError {
    /// Map a non-success audio manager code to a device error
    pub fn device(op: &'static str, result: AudioManagerResult) -> Self {
        SpeechError::Device { op, result }
    }
}
