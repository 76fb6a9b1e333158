use crate::stage::{StageIndex, StagePlan};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Planned { plans: Vec<StagePlan> },
    StageStarted { stage: StageIndex, global_step: u64 },
    Step { stage: StageIndex, global_step: u64, stage_step: u64, objective: f32, distance: f32, learning_rate: f64 },
    StageCompleted { stage: StageIndex, global_step: u64, stage_steps: u64 },
    Finished { global_step: u64 },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Logs progress through `tracing`.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Planned { plans } => {
                for plan in plans {
                    info!(
                        stage = %plan.index,
                        hidden_size = plan.hidden_size,
                        batch_size = plan.batch_size,
                        total_steps = plan.total_planned_steps,
                        "Stage planned"
                    );
                }
            }
            ProgressEvent::StageStarted { stage, global_step } => {
                info!(stage = %stage, global_step, "Stage started");
            }
            ProgressEvent::Step { stage, global_step, stage_step, objective, distance, learning_rate } => {
                info!(stage = %stage, global_step, stage_step, objective, distance, learning_rate, "Step");
            }
            ProgressEvent::StageCompleted { stage, global_step, stage_steps } => {
                info!(stage = %stage, global_step, stage_steps, "Stage completed");
            }
            ProgressEvent::Finished { global_step } => info!(global_step, "Training finished"),
        }
    }
}

/// Collects events in order.
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
