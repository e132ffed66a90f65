//! TensorFlow Lite backed end-point model.
//!
//! Expects a float model with one `[1, N]` input of raw samples and one
//! output holding the `[no_endpoint, endpoint]` scores.

use crate::error::{Result, SpeechError};
use crate::inference::{AiModel, ModelStatus};
use parking_lot::Mutex;

use tflitec::interpreter::{Interpreter, Options};
use tflitec::model::Model;

pub struct TfliteModel {
    interpreter: Mutex<Interpreter<'static>>,
    input_len: usize,
    input: Vec<f32>,
    output: Vec<f32>,
}

impl TfliteModel {
    pub fn new(model_path: &str) -> Result<Self> {
        // Interpreter borrows the model for its whole life
        let model = Box::leak(Box::new(Model::new(model_path).map_err(|e| {
            SpeechError::Inference(format!("Failed to load end point model: {}", e))
        })?));

        let mut options = Options::default();
        options.thread_count = 1;

        let interpreter = Interpreter::new(model, Some(options)).map_err(|e| {
            SpeechError::Inference(format!("Failed to create end point interpreter: {}", e))
        })?;
        interpreter.allocate_tensors().map_err(|e| {
            SpeechError::Inference(format!("Failed to allocate end point tensors: {}", e))
        })?;

        let input_len = {
            let tensor = interpreter.input(0).map_err(|e| {
                SpeechError::Inference(format!("End point model has no input: {}", e))
            })?;
            tensor.shape().dimensions().iter().product::<usize>()
        };
        if input_len == 0 {
            return Err(SpeechError::Inference(
                "End point model input is empty".to_string(),
            ));
        }

        log::info!("Loaded end point model {} ({} input samples)", model_path, input_len);
        Ok(Self {
            interpreter: Mutex::new(interpreter),
            input_len,
            input: Vec::with_capacity(input_len),
            output: Vec::new(),
        })
    }
}

impl AiModel for TfliteModel {
    fn raw_data_count(&self) -> usize {
        self.input_len
    }

    fn preprocess(&mut self, data: &[f32]) -> Result<ModelStatus> {
        let room = self.input_len - self.input.len();
        self.input.extend_from_slice(&data[..room.min(data.len())]);
        if self.input.len() < self.input_len {
            return Ok(ModelStatus::Continue);
        }
        Ok(ModelStatus::Finished)
    }

    fn invoke(&mut self) -> Result<ModelStatus> {
        let interpreter = self.interpreter.lock();
        interpreter.copy(&self.input[..], 0).map_err(|e| {
            SpeechError::Inference(format!("Failed to set end point input: {}", e))
        })?;
        self.input.clear();

        interpreter
            .invoke()
            .map_err(|e| SpeechError::Inference(format!("End point inference failed: {}", e)))?;

        let tensor = interpreter.output(0).map_err(|e| {
            SpeechError::Inference(format!("Failed to get end point output: {}", e))
        })?;
        self.output.clear();
        self.output.extend_from_slice(tensor.data::<f32>());
        Ok(ModelStatus::Finished)
    }

    fn postprocess(&mut self) -> Result<ModelStatus> {
        if self.output.len() < 2 {
            return Err(SpeechError::Inference(format!(
                "Expected 2 end point scores, got {}",
                self.output.len()
            )));
        }
        Ok(ModelStatus::Finished)
    }

    fn output(&self) -> &[f32] {
        &self.output
    }

    fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
    }
}
