//! The compressive model as seen by the orchestrator.

use crate::data::Batch;
use crate::stage::StageIndex;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Tensor = ArrayD<f32>;

/// Failure inside the model's own computation.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ModelError(pub String);

pub type ModelResult<T> = std::result::Result<T, ModelError>;

/// Result of one forward/backward evaluation of a single stage.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub objective: f32,
    /// Auxiliary distance metric, reported alongside the objective.
    pub distance: f32,
    /// One gradient per tensor in `parameters(stage)`, same order and shape.
    pub gradients: Vec<Tensor>,
}

impl Evaluation {
    /// Describes the first non-finite value, if any.
    #[must_use]
    pub fn non_finite(&self) -> Option<String> {
        if !self.objective.is_finite() {
            return Some(format!("objective is {}", self.objective));
        }
        if !self.distance.is_finite() {
            return Some(format!("distance is {}", self.distance));
        }
        self.gradients
            .iter()
            .position(|g| g.iter().any(|v| !v.is_finite()))
            .map(|idx| format!("gradient {idx} has non-finite entries"))
    }
}

/// A stage-specific visual artifact, such as an encoded representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerVisual {
    pub name: String,
    pub values: Tensor,
}

/// A stacked model trained one stage at a time.
///
/// Gradients returned for a stage cover that stage's parameters only; every
/// other stage is frozen from the caller's point of view.
pub trait StageModel {
    fn stage_count(&self) -> usize;

    /// Fresh parameter initialization.
    fn initialize(&mut self, seed: u64);

    fn evaluate(&self, stage: StageIndex, batch: &Batch) -> ModelResult<Evaluation>;

    fn parameters(&self, stage: StageIndex) -> &[Tensor];

    fn parameters_mut(&mut self, stage: StageIndex) -> &mut [Tensor];

    fn visualize(&self, stage: StageIndex, batch: &Batch) -> ModelResult<Vec<LayerVisual>>;
}
