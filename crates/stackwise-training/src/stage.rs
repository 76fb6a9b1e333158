//! Stage identities, per-stage plans and the mutable training session.

use serde::{Deserialize, Serialize};

/// 1-based index of a training stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct StageIndex(usize);

impl StageIndex {
    pub const FIRST: Self = Self(1);

    /// Returns `None` for 0, since stages are numbered from 1.
    #[must_use]
    pub fn new(index: usize) -> Option<Self> {
        (index >= 1).then_some(Self(index))
    }

    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }

    /// Position of this stage in per-stage arrays.
    #[must_use]
    pub fn zero_based(self) -> usize {
        self.0 - 1
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Iterates stages `1..=count`.
    pub fn all(count: usize) -> impl Iterator<Item = Self> {
        (1..=count).map(Self)
    }
}

impl TryFrom<usize> for StageIndex {
    type Error = String;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        Self::new(index).ok_or_else(|| "stage index must be at least 1".to_string())
    }
}

impl From<StageIndex> for usize {
    fn from(index: StageIndex) -> Self {
        index.0
    }
}

impl std::fmt::Display for StageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Static per-stage hyperparameters, fixed before training starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    pub index: StageIndex,
    pub hidden_size: usize,
    pub batch_size: usize,
    pub epoch_budget: u64,
    /// Steps the learning-rate schedule decays over. Computed per stage from
    /// `epoch_budget * dataset_size / batch_size`, independent of other stages.
    pub total_planned_steps: u64,
}

impl StagePlan {
    #[must_use]
    pub fn new(
        index: StageIndex,
        hidden_size: usize,
        batch_size: usize,
        epoch_budget: u64,
        dataset_size: usize,
    ) -> Self {
        let total_planned_steps = (epoch_budget.saturating_mul(dataset_size as u64) / batch_size.max(1) as u64).max(1);
        Self { index, hidden_size, batch_size, epoch_budget, total_planned_steps }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum SchedulerState {
    Stage(StageIndex),
    Completed,
}

impl SchedulerState {
    #[must_use]
    pub fn active_stage(self) -> Option<StageIndex> {
        match self {
            Self::Stage(index) => Some(index),
            Self::Completed => None,
        }
    }
}

/// Process-wide mutable training state, passed explicitly to every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingSession {
    state: SchedulerState,
    global_step: u64,
    epoch_baseline: u64,
}

impl TrainingSession {
    /// A fresh session sitting at stage 1.
    #[must_use]
    pub fn new(epoch_baseline: u64) -> Self {
        Self { state: SchedulerState::Stage(StageIndex::FIRST), global_step: 0, epoch_baseline }
    }

    /// A session resumed from a checkpoint.
    #[must_use]
    pub fn resume(state: SchedulerState, global_step: u64, epoch_baseline: u64) -> Self {
        Self { state, global_step, epoch_baseline }
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    #[must_use]
    pub fn active_stage(&self) -> Option<StageIndex> {
        self.state.active_stage()
    }

    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    #[must_use]
    pub fn epoch_baseline(&self) -> u64 {
        self.epoch_baseline
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == SchedulerState::Completed
    }

    /// Moves to the next stage, or to `Completed` after the last one, and
    /// re-records the epoch baseline. Returns the new state.
    pub fn advance_stage(&mut self, stage_count: usize, epoch_baseline: u64) -> SchedulerState {
        self.state = match self.state {
            SchedulerState::Stage(index) if index.get() < stage_count => SchedulerState::Stage(index.next()),
            SchedulerState::Stage(_) | SchedulerState::Completed => SchedulerState::Completed,
        };
        self.epoch_baseline = epoch_baseline;
        self.state
    }

    /// Counts one executed parameter update.
    pub fn record_step(&mut self) {
        self.global_step += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_index_rejects_zero() {
        assert!(StageIndex::new(0).is_none());
        assert_eq!(StageIndex::new(3).map(StageIndex::zero_based), Some(2));
    }

    #[test]
    fn test_planned_steps_use_integer_division() {
        let plan = StagePlan::new(StageIndex::FIRST, 16, 64, 10, 1000);
        assert_eq!(plan.total_planned_steps, 156);
    }

    #[test]
    fn test_stage_index_deserialization_rejects_zero() {
        assert!(serde_json::from_str::<StageIndex>("0").is_err());
        assert_eq!(serde_json::from_str::<StageIndex>("2").unwrap().get(), 2);
        assert_eq!(serde_json::to_string(&StageIndex::FIRST).unwrap(), "1");

        let state: Result<SchedulerState, _> = serde_json::from_str(r#"{"state":"stage","stage":0}"#);
        assert!(state.is_err());
    }

    #[test]
    fn test_planned_steps_saturate_on_huge_budgets() {
        let plan = StagePlan::new(StageIndex::FIRST, 16, 64, u64::MAX / 4, 2048);
        assert_eq!(plan.total_planned_steps, u64::MAX / 64);
    }

    #[test]
    fn test_planned_steps_never_zero() {
        let plan = StagePlan::new(StageIndex::FIRST, 16, 64, 1, 10);
        assert_eq!(plan.total_planned_steps, 1);
    }

    #[test]
    fn test_session_advances_one_stage_at_a_time() {
        let mut session = TrainingSession::new(0);
        assert_eq!(session.advance_stage(3, 2), SchedulerState::Stage(StageIndex(2)));
        assert_eq!(session.epoch_baseline(), 2);
        assert_eq!(session.advance_stage(3, 4), SchedulerState::Stage(StageIndex(3)));
        assert_eq!(session.advance_stage(3, 6), SchedulerState::Completed);
        assert!(session.is_completed());
    }

    #[test]
    fn test_record_step_is_independent_of_stage() {
        let mut session = TrainingSession::new(0);
        session.record_step();
        session.advance_stage(2, 1);
        session.record_step();
        assert_eq!(session.global_step(), 2);
    }
}
