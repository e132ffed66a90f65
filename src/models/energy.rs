//! Energy based end-point model.
//!
//! Splits every inference window into short frames and tracks frame RMS
//! against a speech threshold. Once speech has been heard, a run of
//! `hangover_frames` quiet frames marks the end point.

use crate::error::{Result, SpeechError};
use crate::inference::{AiModel, ModelStatus};

/// Output when nothing is happening
const NO_DETECTION: [f32; 2] = [1.0, 0.0];
/// Output while speech is still going
const SPEECH: [f32; 2] = [0.25, 0.75];
/// Output once the speaker has stopped
const END_POINT: [f32; 2] = [0.0, 1.0];

#[derive(Debug, Clone)]
pub struct EnergyConfig {
    /// Samples consumed per inference
    pub window_samples: usize,
    /// Samples per RMS frame
    pub frame_samples: usize,
    /// RMS at or above which a frame counts as speech
    pub speech_rms: f32,
    /// Quiet frames after speech that end the utterance
    pub hangover_frames: usize,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        // 16 kHz: 16ms windows, 8ms frames, 400ms hangover
        Self {
            window_samples: 256,
            frame_samples: 128,
            speech_rms: 0.02,
            hangover_frames: 50,
        }
    }
}

pub struct EnergyEndPointModel {
    config: EnergyConfig,
    pending: Vec<f32>,
    heard_speech: bool,
    quiet_frames: usize,
    last_frame_speech: bool,
    output: Vec<f32>,
}

impl EnergyEndPointModel {
    pub fn new(config: EnergyConfig) -> Result<Self> {
        if config.window_samples == 0 || config.frame_samples == 0 {
            return Err(SpeechError::InvalidArgument(
                "Energy model window and frame sizes must be non-zero".to_string(),
            ));
        }
        if config.frame_samples > config.window_samples {
            return Err(SpeechError::InvalidArgument(format!(
                "Frame of {} samples does not fit a {}-sample window",
                config.frame_samples, config.window_samples
            )));
        }
        Ok(Self {
            pending: Vec::with_capacity(config.window_samples),
            config,
            heard_speech: false,
            quiet_frames: 0,
            last_frame_speech: false,
            output: NO_DETECTION.to_vec(),
        })
    }

    fn frame_rms(frame: &[f32]) -> f32 {
        let energy: f32 = frame.iter().map(|s| s * s).sum();
        (energy / frame.len() as f32).sqrt()
    }
}

impl AiModel for EnergyEndPointModel {
    fn raw_data_count(&self) -> usize {
        self.config.window_samples
    }

    fn preprocess(&mut self, data: &[f32]) -> Result<ModelStatus> {
        let room = self.config.window_samples - self.pending.len();
        let take = room.min(data.len());
        self.pending.extend_from_slice(&data[..take]);

        if self.pending.len() < self.config.window_samples {
            Ok(ModelStatus::Continue)
        } else {
            Ok(ModelStatus::Finished)
        }
    }

    fn invoke(&mut self) -> Result<ModelStatus> {
        for frame in self.pending.chunks(self.config.frame_samples) {
            if Self::frame_rms(frame) >= self.config.speech_rms {
                self.heard_speech = true;
                self.quiet_frames = 0;
                self.last_frame_speech = true;
            } else {
                if self.heard_speech {
                    self.quiet_frames += 1;
                }
                self.last_frame_speech = false;
            }
        }
        self.pending.clear();
        Ok(ModelStatus::Finished)
    }

    fn postprocess(&mut self) -> Result<ModelStatus> {
        let verdict = if self.heard_speech && self.quiet_frames >= self.config.hangover_frames {
            log::debug!("Energy model: {} quiet frames after speech", self.quiet_frames);
            self.heard_speech = false;
            self.quiet_frames = 0;
            END_POINT
        } else if self.last_frame_speech {
            SPEECH
        } else {
            NO_DETECTION
        };
        self.output.clear();
        self.output.extend_from_slice(&verdict);
        Ok(ModelStatus::Finished)
    }

    fn output(&self) -> &[f32] {
        &self.output
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.heard_speech = false;
        self.quiet_frames = 0;
        self.last_frame_speech = false;
        self.output.clear();
        self.output.extend_from_slice(&NO_DETECTION);
    }
}
