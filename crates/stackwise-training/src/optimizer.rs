//! Per-stage optimizer bindings.
//!
//! Each stage owns an [`OptimizerBinding`] with its own step counter and
//! learning-rate schedule. Bindings are the only code that writes trainable
//! parameters during training.

use crate::config::{AdamConfig, OptimizerKind, TrainingConfig};
use crate::data::Batch;
use crate::error::{TrainingError, TrainingResult};
use crate::model::{StageModel, Tensor};
use crate::stage::{StageIndex, StagePlan};
use serde::{Deserialize, Serialize};

/// Continuous exponential decay over a stage's planned step count.
///
/// `rate(step) = lr_init * decay_factor^(step / total_planned_steps)`, no clamping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRateSchedule {
    pub lr_init: f64,
    pub decay_factor: f64,
    pub total_planned_steps: u64,
}

impl LearningRateSchedule {
    #[must_use]
    pub fn new(lr_init: f64, decay_factor: f64, total_planned_steps: u64) -> Self {
        Self { lr_init, decay_factor, total_planned_steps: total_planned_steps.max(1) }
    }

    #[must_use]
    pub fn rate(&self, step: u64) -> f64 {
        self.lr_init * self.decay_factor.powf(step as f64 / self.total_planned_steps as f64)
    }
}

/// Clip gradients by global norm.
///
/// The global norm is `sqrt(sum of all squared entries)`. When it exceeds
/// `max_norm` every gradient is scaled by `max_norm / global_norm`; otherwise
/// gradients are left untouched.
///
/// Returns the global norm before clipping.
pub fn clip_by_global_norm(gradients: &mut [Tensor], max_norm: f32) -> f32 {
    let total_norm_sq: f64 = gradients
        .iter()
        .flat_map(|g| g.iter())
        .map(|&v| f64::from(v) * f64::from(v))
        .sum();
    let global_norm = total_norm_sq.sqrt() as f32;

    if global_norm > max_norm {
        let clip_coef = max_norm / global_norm;
        for grad in gradients.iter_mut() {
            grad.mapv_inplace(|g| g * clip_coef);
        }
    }

    global_norm
}

#[derive(Debug, Clone, PartialEq)]
enum UpdateRule {
    Sgd,
    Adam(AdamConfig),
}

/// Serializable optimizer state of one stage, stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step_count: u64,
    /// Adam first moments; empty for SGD or before the first update.
    #[serde(default)]
    pub first_moments: Vec<Tensor>,
    /// Adam second moments; empty for SGD or before the first update.
    #[serde(default)]
    pub second_moments: Vec<Tensor>,
}

/// What one optimizer step observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub objective: f32,
    pub distance: f32,
    /// Global gradient norm before clipping.
    pub gradient_norm: f32,
    /// Learning rate the update was applied with.
    pub learning_rate: f64,
}

#[derive(Debug, Clone)]
pub struct OptimizerBinding {
    stage: StageIndex,
    schedule: LearningRateSchedule,
    max_gradient_norm: f32,
    rule: UpdateRule,
    state: OptimizerState,
}

impl OptimizerBinding {
    #[must_use]
    pub fn new(plan: &StagePlan, config: &TrainingConfig) -> Self {
        let rule = match config.optimizer {
            OptimizerKind::Sgd => UpdateRule::Sgd,
            OptimizerKind::Adam => UpdateRule::Adam(config.adam.clone()),
        };

        Self {
            stage: plan.index,
            schedule: LearningRateSchedule::new(config.lr_init, config.lr_decay_factor, plan.total_planned_steps),
            max_gradient_norm: config.max_gradient_norm,
            rule,
            state: OptimizerState::default(),
        }
    }

    #[must_use]
    pub fn stage(&self) -> StageIndex {
        self.stage
    }

    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.state.step_count
    }

    #[must_use]
    pub fn schedule(&self) -> &LearningRateSchedule {
        &self.schedule
    }

    #[must_use]
    pub fn current_learning_rate(&self) -> f64 {
        self.schedule.rate(self.state.step_count)
    }

    #[must_use]
    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    pub fn restore_state(&mut self, state: OptimizerState) {
        self.state = state;
    }

    /// Evaluate the stage on `batch`, clip, apply one update, and count it.
    ///
    /// Any failure leaves the step counter untouched.
    pub fn step<M: StageModel + ?Sized>(&mut self, model: &mut M, batch: &Batch) -> TrainingResult<StepOutcome> {
        let stage = self.stage;
        let stage_step = self.state.step_count;

        let mut eval = model
            .evaluate(stage, batch)
            .map_err(|e| TrainingError::compute(stage, stage_step, e.to_string()))?;
        if let Some(reason) = eval.non_finite() {
            return Err(TrainingError::compute(stage, stage_step, reason));
        }

        let params = model.parameters_mut(stage);
        if params.len() != eval.gradients.len() {
            return Err(TrainingError::compute(
                stage,
                stage_step,
                format!("{} gradients for {} parameters", eval.gradients.len(), params.len()),
            ));
        }
        if let Some(idx) = params.iter().zip(&eval.gradients).position(|(p, g)| p.shape() != g.shape()) {
            return Err(TrainingError::compute(stage, stage_step, format!("gradient {idx} shape mismatch")));
        }

        let gradient_norm = clip_by_global_norm(&mut eval.gradients, self.max_gradient_norm);
        let learning_rate = self.schedule.rate(stage_step);
        let lr = learning_rate as f32;

        // Updated values are staged first so a non-finite result never reaches the model.
        let (updated, moments) = match &self.rule {
            UpdateRule::Sgd => {
                let updated: Vec<Tensor> =
                    params.iter().zip(&eval.gradients).map(|(param, grad)| param - &(grad * lr)).collect();
                (updated, None)
            }
            UpdateRule::Adam(adam) => {
                let mut first = self.state.first_moments.clone();
                let mut second = self.state.second_moments.clone();
                if first.len() != params.len() {
                    first = params.iter().map(|p| Tensor::zeros(p.raw_dim())).collect();
                    second = params.iter().map(|p| Tensor::zeros(p.raw_dim())).collect();
                }

                let t = (stage_step + 1) as i32;
                let bias1 = 1.0 - adam.beta1.powi(t);
                let bias2 = 1.0 - adam.beta2.powi(t);

                let mut updated = Vec::with_capacity(params.len());
                for (((param, grad), m), v) in
                    params.iter().zip(&eval.gradients).zip(first.iter_mut()).zip(second.iter_mut())
                {
                    m.zip_mut_with(grad, |m, &g| *m = adam.beta1 * *m + (1.0 - adam.beta1) * g);
                    v.zip_mut_with(grad, |v, &g| *v = adam.beta2 * *v + (1.0 - adam.beta2) * g * g);

                    let mut next = param.clone();
                    ndarray::Zip::from(&mut next).and(&*m).and(&*v).for_each(|p, &m, &v| {
                        let m_hat = m / bias1;
                        let v_hat = v / bias2;
                        *p -= lr * m_hat / (v_hat.sqrt() + adam.epsilon);
                    });
                    updated.push(next);
                }
                (updated, Some((first, second)))
            }
        };

        if let Some(idx) = updated.iter().position(|p| p.iter().any(|v| !v.is_finite())) {
            return Err(TrainingError::compute(stage, stage_step, format!("update of parameter {idx} is not finite")));
        }

        for (param, next) in params.iter_mut().zip(updated) {
            *param = next;
        }
        if let Some((first, second)) = moments {
            self.state.first_moments = first;
            self.state.second_moments = second;
        }
        self.state.step_count += 1;

        Ok(StepOutcome { objective: eval.objective, distance: eval.distance, gradient_norm, learning_rate })
    }
}

/// Optimizer bindings for every stage, addressed by [`StageIndex`].
#[derive(Debug, Clone)]
pub struct OptimizerBank {
    bindings: Vec<OptimizerBinding>,
}

impl OptimizerBank {
    #[must_use]
    pub fn new(plans: &[StagePlan], config: &TrainingConfig) -> Self {
        Self { bindings: plans.iter().map(|plan| OptimizerBinding::new(plan, config)).collect() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    #[must_use]
    pub fn get(&self, stage: StageIndex) -> &OptimizerBinding {
        &self.bindings[stage.zero_based()]
    }

    pub fn get_mut(&mut self, stage: StageIndex) -> &mut OptimizerBinding {
        &mut self.bindings[stage.zero_based()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptimizerBinding> {
        self.bindings.iter()
    }

    #[must_use]
    pub fn states(&self) -> Vec<OptimizerState> {
        self.bindings.iter().map(|b| b.state.clone()).collect()
    }

    pub fn restore_states(&mut self, states: Vec<OptimizerState>) -> Result<(), String> {
        if states.len() != self.bindings.len() {
            return Err(format!("checkpoint has optimizer state for {} stages, expected {}", states.len(), self.bindings.len()));
        }
        for (binding, state) in self.bindings.iter_mut().zip(states) {
            binding.restore_state(state);
        }
        Ok(())
    }
}
