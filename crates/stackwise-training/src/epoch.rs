/// Whether the active stage has used up its epoch budget.
///
/// Epochs are observed only through the data source's reshuffle counter, so
/// completion is detected at whole-pass granularity. The boundary is
/// inclusive: exactly `epoch_budget` passes since `epoch_baseline` completes
/// the stage.
#[must_use]
pub fn stage_complete(reshuffle_counter: u64, epoch_baseline: u64, epoch_budget: u64) -> bool {
    reshuffle_counter.saturating_sub(epoch_baseline) >= epoch_budget
}
