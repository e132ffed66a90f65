//! # On-device inference pipeline
//!
//! A [`ModelPipeline`] owns an ordered, fixed-capacity set of models. Every
//! pushed datum flows through preprocess → invoke → postprocess of the first
//! model that has not finished in the current cycle, and moves on to the next
//! model only when the stage reports [`ModelStatus::Finished`]:
//!
//! ```text
//! push_data ─► model[k] ──Finished──► model[k+1] ─► … ─► model[N-1] ─► ensemble ─► listener
//!                 │
//!                 └─Continue──► cycle suspended at k until the next push_data
//! ```
//!
//! The model author decides which models exist and in what order through an
//! [`InferenceHandler`]; the same handler performs the ensemble step.

pub mod service;

use crate::error::{Result, SpeechError};

pub use service::{InferenceService, InferenceSink, RawDataCollector};

/// Progress reported by a model stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    /// The stage produced its output; the cycle may move on
    Finished,
    /// The stage needs more data before it can finish
    Continue,
}

/// Outcome delivered to the result listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceResult {
    Success,
    Failure,
}

pub type ResultListener = Box<dyn FnMut(InferenceResult, &[f32]) + Send>;

/// One unit of the pipeline
pub trait AiModel: Send {
    /// Number of raw samples one invocation consumes
    fn raw_data_count(&self) -> usize;

    fn preprocess(&mut self, data: &[f32]) -> Result<ModelStatus>;

    fn invoke(&mut self) -> Result<ModelStatus>;

    fn postprocess(&mut self) -> Result<ModelStatus>;

    /// Output of the last finished postprocess step
    fn output(&self) -> &[f32];

    /// Drop accumulated state without discarding the model
    fn clear(&mut self);
}

/// Model author hook: builds the model set and combines the final result
pub trait InferenceHandler: Send {
    /// Attach models in execution order; returns the service interval in ms
    /// (0 means the pipeline is driven by explicit pushes only)
    fn prepare(&mut self, models: &mut ModelSet) -> Result<u32>;

    /// Ensemble step, run once the last model finished
    fn on_inference_finished(&mut self, last_index: usize, result: &[f32]) -> Result<Vec<f32>> {
        let _ = last_index;
        Ok(result.to_vec())
    }
}

/// Ordered set of models with a capacity fixed at construction
pub struct ModelSet {
    models: Vec<Box<dyn AiModel>>,
    capacity: usize,
}

impl ModelSet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            models: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a model; returns its position in the execution order
    pub fn attach(&mut self, model: Box<dyn AiModel>) -> Result<usize> {
        if self.models.len() >= self.capacity {
            return Err(SpeechError::NoMemory(format!(
                "Model set is full ({} models)",
                self.capacity
            )));
        }
        self.models.push(model);
        Ok(self.models.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub struct ModelPipeline {
    handler: Box<dyn InferenceHandler>,
    models: ModelSet,
    next_model: usize,
    prepared: bool,
    listener: Option<ResultListener>,
}

impl ModelPipeline {
    pub fn new(handler: Box<dyn InferenceHandler>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SpeechError::InvalidArgument(
                "Pipeline needs room for at least one model".to_string(),
            ));
        }
        Ok(Self {
            handler,
            models: ModelSet::with_capacity(capacity),
            next_model: 0,
            prepared: false,
            listener: None,
        })
    }

    /// Let the handler attach its models. Returns the service interval.
    pub fn prepare(&mut self) -> Result<u32> {
        if self.prepared {
            return Err(SpeechError::InvalidArgument(
                "Pipeline is already prepared".to_string(),
            ));
        }

        let interval = self.handler.prepare(&mut self.models)?;
        if self.models.is_empty() {
            return Err(SpeechError::InvalidArgument(
                "Handler attached no models".to_string(),
            ));
        }

        self.prepared = true;
        log::info!(
            "Model pipeline prepared: {} model(s), interval {}ms",
            self.models.len(),
            interval
        );
        Ok(interval)
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// Raw samples the first model needs for one invocation
    pub fn raw_data_count(&self) -> usize {
        self.models
            .models
            .first()
            .map(|model| model.raw_data_count())
            .unwrap_or(0)
    }

    pub fn register_result_listener(&mut self, listener: ResultListener) {
        self.listener = Some(listener);
    }

    /// Feed data into the first unfinished model of the current cycle
    pub fn push_data(&mut self, data: &[f32]) -> Result<()> {
        if !self.prepared {
            return Err(SpeechError::InvalidArgument(
                "push_data called before prepare".to_string(),
            ));
        }
        if data.is_empty() {
            return Err(SpeechError::InvalidArgument("Empty data pushed".to_string()));
        }

        let mut carried: Option<Vec<f32>> = None;
        let mut index = self.next_model;

        while index < self.models.models.len() {
            let input = carried.as_deref().unwrap_or(data);
            let model = &mut self.models.models[index];

            match run_stage(model.as_mut(), input) {
                Ok(ModelStatus::Finished) => {
                    carried = Some(model.output().to_vec());
                    index += 1;
                }
                Ok(ModelStatus::Continue) => {
                    log::trace!("Model {} waiting for more data", index);
                    self.next_model = index;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Model {} failed: {}", index, e);
                    self.next_model = 0;
                    return Err(e);
                }
            }
        }

        self.next_model = 0;
        let last_index = self.models.models.len() - 1;
        let result = carried.unwrap_or_default();

        match self.handler.on_inference_finished(last_index, &result) {
            Ok(ensemble) => {
                if let Some(listener) = self.listener.as_mut() {
                    listener(InferenceResult::Success, &ensemble);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(listener) = self.listener.as_mut() {
                    listener(InferenceResult::Failure, &[]);
                }
                Err(e)
            }
        }
    }

    /// Reset every model's accumulated state
    pub fn clear_data(&mut self) {
        for model in self.models.models.iter_mut() {
            model.clear();
        }
        self.next_model = 0;
    }

    /// Reset models `offset..offset + count`
    pub fn clear_data_range(&mut self, offset: usize, count: usize) -> Result<()> {
        let end = offset
            .checked_add(count)
            .filter(|end| *end <= self.models.models.len())
            .ok_or_else(|| {
                SpeechError::InvalidArgument(format!(
                    "Clear range {}+{} exceeds {} model(s)",
                    offset,
                    count,
                    self.models.models.len()
                ))
            })?;

        for model in &mut self.models.models[offset..end] {
            model.clear();
        }
        if self.next_model >= offset {
            self.next_model = offset;
        }
        Ok(())
    }
}

fn run_stage(model: &mut dyn AiModel, input: &[f32]) -> Result<ModelStatus> {
    if model.preprocess(input)? == ModelStatus::Continue {
        return Ok(ModelStatus::Continue);
    }
    if model.invoke()? == ModelStatus::Continue {
        return Ok(ModelStatus::Continue);
    }
    model.postprocess()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sums its input; needs `need` pushes before it finishes
    struct SumModel {
        need: usize,
        seen: usize,
        acc: f32,
        out: Vec<f32>,
        fail: bool,
    }

    impl SumModel {
        fn boxed(need: usize) -> Box<dyn AiModel> {
            Box::new(Self {
                need,
                seen: 0,
                acc: 0.0,
                out: Vec::new(),
                fail: false,
            })
        }
    }

    impl AiModel for SumModel {
        fn raw_data_count(&self) -> usize {
            4
        }

        fn preprocess(&mut self, data: &[f32]) -> Result<ModelStatus> {
            self.acc += data.iter().sum::<f32>();
            self.seen += 1;
            if self.seen < self.need {
                Ok(ModelStatus::Continue)
            } else {
                Ok(ModelStatus::Finished)
            }
        }

        fn invoke(&mut self) -> Result<ModelStatus> {
            if self.fail {
                return Err(SpeechError::Inference("invoke failed".to_string()));
            }
            Ok(ModelStatus::Finished)
        }

        fn postprocess(&mut self) -> Result<ModelStatus> {
            self.out = vec![self.acc];
            self.acc = 0.0;
            self.seen = 0;
            Ok(ModelStatus::Finished)
        }

        fn output(&self) -> &[f32] {
            &self.out
        }

        fn clear(&mut self) {
            self.acc = 0.0;
            self.seen = 0;
        }
    }

    struct Handler {
        models: Vec<Box<dyn AiModel>>,
        interval: u32,
    }

    impl InferenceHandler for Handler {
        fn prepare(&mut self, models: &mut ModelSet) -> Result<u32> {
            for model in self.models.drain(..) {
                models.attach(model)?;
            }
            Ok(self.interval)
        }
    }

    fn pipeline(models: Vec<Box<dyn AiModel>>) -> (ModelPipeline, Arc<Mutex<Vec<Vec<f32>>>>) {
        let capacity = models.len().max(1);
        let mut pipeline = ModelPipeline::new(
            Box::new(Handler {
                models,
                interval: 0,
            }),
            capacity,
        )
        .unwrap();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        pipeline.register_result_listener(Box::new(move |code, data| {
            assert_eq!(code, InferenceResult::Success);
            sink.lock().unwrap().push(data.to_vec());
        }));
        (pipeline, results)
    }

    #[test]
    fn test_push_before_prepare_fails() {
        let (mut pipeline, _) = pipeline(vec![SumModel::boxed(1)]);
        assert!(pipeline.push_data(&[1.0]).is_err());
    }

    #[test]
    fn test_prepare_returns_interval_once() {
        let (mut pipeline, _) = pipeline(vec![SumModel::boxed(1)]);
        assert_eq!(pipeline.prepare().unwrap(), 0);
        assert!(pipeline.prepare().is_err());
        assert_eq!(pipeline.raw_data_count(), 4);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut pipeline = ModelPipeline::new(
            Box::new(Handler {
                models: vec![SumModel::boxed(1), SumModel::boxed(1)],
                interval: 0,
            }),
            1,
        )
        .unwrap();
        assert!(matches!(pipeline.prepare(), Err(SpeechError::NoMemory(_))));
    }

    #[test]
    fn test_single_model_emits_once_per_cycle() {
        let (mut pipeline, results) = pipeline(vec![SumModel::boxed(1)]);
        pipeline.prepare().unwrap();
        pipeline.push_data(&[1.0, 2.0]).unwrap();
        pipeline.push_data(&[3.0]).unwrap();
        assert_eq!(*results.lock().unwrap(), vec![vec![3.0], vec![3.0]]);
    }

    #[test]
    fn test_continue_suspends_cycle() {
        let (mut pipeline, results) = pipeline(vec![SumModel::boxed(1), SumModel::boxed(2)]);
        pipeline.prepare().unwrap();

        // Second model needs two pushes; the second push resumes at model 1
        pipeline.push_data(&[1.0, 1.0]).unwrap();
        assert!(results.lock().unwrap().is_empty());
        pipeline.push_data(&[5.0]).unwrap();
        assert_eq!(*results.lock().unwrap(), vec![vec![7.0]]);
    }

    #[test]
    fn test_failure_propagates_without_listener() {
        let mut failing = SumModel {
            need: 1,
            seen: 0,
            acc: 0.0,
            out: Vec::new(),
            fail: false,
        };
        failing.fail = true;
        let (mut pipeline, results) = pipeline(vec![Box::new(failing)]);
        pipeline.prepare().unwrap();
        assert!(matches!(
            pipeline.push_data(&[1.0]),
            Err(SpeechError::Inference(_))
        ));
        assert!(results.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clear_data_restarts_cycle() {
        let (mut pipeline, results) = pipeline(vec![SumModel::boxed(2)]);
        pipeline.prepare().unwrap();
        pipeline.push_data(&[10.0]).unwrap();
        pipeline.clear_data();
        pipeline.push_data(&[1.0]).unwrap();
        pipeline.push_data(&[1.0]).unwrap();
        assert_eq!(*results.lock().unwrap(), vec![vec![2.0]]);

        assert!(pipeline.clear_data_range(0, 2).is_err());
        assert!(pipeline.clear_data_range(0, 1).is_ok());
    }
}
