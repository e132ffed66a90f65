use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
    #[error("Environment error: {0}")]
    EnvError(#[from] env::VarError),
}

/// Capture and routing parameters for the speech detector
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechDetectorConfig {
    /// Regular capture route
    pub input_card: u32,
    pub input_device: u32,
    /// Bytes handed over by every capture callback
    pub delivery_bytes: usize,
    /// Slice used when waiting on the device mailbox
    pub process_msg_timeout_ms: u64,
    /// Ceiling for the software end-point stream buffer
    pub max_stream_buffer_bytes: usize,
    /// Stack size of both worker threads
    pub worker_stack_size: usize,
    /// Skip hardware capability discovery
    pub force_software: bool,
}

impl Default for SpeechDetectorConfig {
    fn default() -> Self {
        Self {
            input_card: 0,
            input_device: 0,
            delivery_bytes: 1024,
            process_msg_timeout_ms: 100,
            max_stream_buffer_bytes: 128 * 1024,
            worker_stack_size: 256 * 1024,
            force_software: false,
        }
    }
}

impl SpeechDetectorConfig {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        Ok(Self {
            input_card: Self::var_or("SPEECH_INPUT_CARD", defaults.input_card)?,
            input_device: Self::var_or("SPEECH_INPUT_DEVICE", defaults.input_device)?,
            delivery_bytes: Self::var_or("SPEECH_DELIVERY_BYTES", defaults.delivery_bytes)?,
            process_msg_timeout_ms: Self::var_or(
                "SPEECH_PROCESS_MSG_TIMEOUT_MS",
                defaults.process_msg_timeout_ms,
            )?,
            max_stream_buffer_bytes: Self::var_or(
                "SPEECH_MAX_STREAM_BUFFER_BYTES",
                defaults.max_stream_buffer_bytes,
            )?,
            worker_stack_size: Self::var_or(
                "SPEECH_WORKER_STACK_SIZE",
                defaults.worker_stack_size,
            )?,
            force_software: Self::flag("SPEECH_FORCE_SOFTWARE")?,
        }
        .validated()?)
    }

    fn var_or<T>(var: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(var) {
            Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                var: var.to_string(),
                reason: e.to_string(),
            }),
            Err(env::VarError::NotPresent) => Ok(default),
            Err(e) => Err(e.into()),
        }
    }

    fn flag(var: &str) -> Result<bool, ConfigError> {
        match env::var(var) {
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" | "" => Ok(false),
                other => Err(ConfigError::InvalidValue {
                    var: var.to_string(),
                    reason: format!("expected a boolean, got '{}'", other),
                }),
            },
            Err(env::VarError::NotPresent) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.delivery_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                var: "SPEECH_DELIVERY_BYTES".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.delivery_bytes % 2 != 0 {
            return Err(ConfigError::InvalidValue {
                var: "SPEECH_DELIVERY_BYTES".to_string(),
                reason: "must hold whole 16-bit samples".to_string(),
            });
        }
        if self.max_stream_buffer_bytes < self.delivery_bytes {
            return Err(ConfigError::InvalidValue {
                var: "SPEECH_MAX_STREAM_BUFFER_BYTES".to_string(),
                reason: format!(
                    "{} is smaller than one delivery ({} bytes)",
                    self.max_stream_buffer_bytes, self.delivery_bytes
                ),
            });
        }
        Ok(self)
    }
}

/// Load configuration with helpful error messages
pub fn load_config() -> Result<SpeechDetectorConfig, ConfigError> {
    match SpeechDetectorConfig::from_env() {
        Ok(config) => {
            log::info!("Loaded speech detector configuration: {:?}", config);
            Ok(config)
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}
