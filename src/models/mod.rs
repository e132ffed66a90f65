pub mod energy;
#[cfg(feature = "tflite")]
pub mod tflite;

pub use energy::{EnergyConfig, EnergyEndPointModel};
#[cfg(feature = "tflite")]
pub use tflite::TfliteModel;

use crate::detector::PipelineFactory;
use crate::error::{Result, SpeechError};
use crate::inference::{AiModel, InferenceHandler, ModelPipeline, ModelSet};

/// Handler attaching a single end-point model in streaming mode
pub struct EndPointInferenceHandler {
    model: Option<Box<dyn AiModel>>,
}

impl EndPointInferenceHandler {
    pub fn new(model: Box<dyn AiModel>) -> Self {
        Self { model: Some(model) }
    }
}

impl InferenceHandler for EndPointInferenceHandler {
    fn prepare(&mut self, models: &mut ModelSet) -> Result<u32> {
        let model = self.model.take().ok_or_else(|| {
            SpeechError::InvalidArgument("End point model already attached".to_string())
        })?;
        models.attach(model)?;
        // Driven by captured audio, not by a timer
        Ok(0)
    }
}

/// Pipeline factory for the energy end-point model
pub fn energy_pipeline_factory(config: EnergyConfig) -> PipelineFactory {
    Box::new(move || {
        let model = EnergyEndPointModel::new(config.clone())?;
        ModelPipeline::new(Box::new(EndPointInferenceHandler::new(Box::new(model))), 1)
    })
}

/// Pipeline factory for a TensorFlow Lite end-point model
#[cfg(feature = "tflite")]
pub fn tflite_pipeline_factory(model_path: String) -> PipelineFactory {
    Box::new(move || {
        let model = TfliteModel::new(&model_path)?;
        ModelPipeline::new(Box::new(EndPointInferenceHandler::new(Box::new(model))), 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_factory_builds_streaming_pipeline() {
        let factory = energy_pipeline_factory(EnergyConfig::default());
        let mut pipeline = factory().unwrap();
        assert_eq!(pipeline.prepare().unwrap(), 0);
        assert_eq!(pipeline.model_count(), 1);
        assert_eq!(pipeline.raw_data_count(), EnergyConfig::default().window_samples);

        // Each call builds a fresh pipeline
        let mut second = factory().unwrap();
        assert!(second.prepare().is_ok());
    }
}
