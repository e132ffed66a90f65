pub mod config;
pub mod detector;
pub mod device;
pub mod error;
pub mod inference;
pub mod models;
pub mod speech_detector;
pub mod stream_buffer;
pub mod timer;
pub mod worker;

pub use config::{load_config, SpeechDetectorConfig};
pub use error::{Result, SpeechError};
pub use speech_detector::{
    Capabilities, SpeechDetector, SpeechDetectorEvent, SpeechDetectorListener,
};
