//! The staged training loop.
//!
//! [`StageScheduler`] walks `Stage(1) .. Stage(N)` and then `Completed`. Each
//! loop iteration either trains one batch on the active stage or, once the
//! data source has made `epoch_budget` full passes since the stage began,
//! hands off to the next stage without consuming a batch.

use crate::checkpoint::{CheckpointStore, Checkpointable, Snapshot};
use crate::config::TrainingConfig;
use crate::data::{Batch, DataSource};
use crate::epoch;
use crate::error::{TrainingError, TrainingResult};
use crate::model::StageModel;
use crate::optimizer::{OptimizerBank, StepOutcome};
use crate::progress::{ProgressEvent, ProgressSink, TracingProgressSink};
use crate::report::{self, LayerReport, NullReportSink, Report, ReportCadence, ReportSink, ScalarReport};
use crate::stage::{SchedulerState, StageIndex, StagePlan, TrainingSession};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Result of one [`StageScheduler::advance`] call.
#[derive(Debug)]
pub enum Advance {
    /// A batch for the active stage.
    Batch(Batch),
    /// The active stage used up its epoch budget. No batch was fetched.
    StageComplete { completed: StageIndex, next: SchedulerState },
    /// Every stage had already completed.
    Finished,
}

pub struct StageScheduler<M, D> {
    model: M,
    data: D,
    optimizers: OptimizerBank,
    plans: Vec<StagePlan>,
    session: TrainingSession,
    cadence: ReportCadence,
    save_rate: u64,
    log_rate: u64,
    store: CheckpointStore,
    reports: Box<dyn ReportSink>,
    progress: Arc<dyn ProgressSink>,
    stop: Arc<AtomicBool>,
}

impl<M: StageModel, D: DataSource> StageScheduler<M, D> {
    #[must_use]
    pub fn new(
        model: M,
        data: D,
        optimizers: OptimizerBank,
        session: TrainingSession,
        config: &TrainingConfig,
    ) -> Self {
        Self {
            model,
            plans: config.stage_plans(data.len()),
            data,
            optimizers,
            session,
            cadence: ReportCadence::from_config(config),
            save_rate: config.save_rate.max(1),
            log_rate: config.log_rate.max(1),
            store: CheckpointStore::from_config(config),
            reports: Box::new(NullReportSink),
            progress: Arc::new(TracingProgressSink),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_reports(mut self, reports: Box<dyn ReportSink>) -> Self {
        self.reports = reports;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    #[must_use]
    pub fn session(&self) -> &TrainingSession {
        &self.session
    }

    #[must_use]
    pub fn plans(&self) -> &[StagePlan] {
        &self.plans
    }

    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    #[must_use]
    pub fn data(&self) -> &D {
        &self.data
    }

    #[must_use]
    pub fn optimizers(&self) -> &OptimizerBank {
        &self.optimizers
    }

    fn is_final_stage(&self, stage: StageIndex) -> bool {
        stage.get() == self.plans.len()
    }

    /// Either hand off to the next stage or fetch one batch for the active one.
    pub fn advance(&mut self) -> TrainingResult<Advance> {
        let Some(stage) = self.session.active_stage() else {
            return Ok(Advance::Finished);
        };
        let plan = &self.plans[stage.zero_based()];
        let counter = self.data.reshuffle_counter();

        if epoch::stage_complete(counter, self.session.epoch_baseline(), plan.epoch_budget) {
            let global_step = self.session.global_step();
            self.progress.on_event(ProgressEvent::StageCompleted {
                stage,
                global_step,
                stage_steps: self.optimizers.get(stage).step_count(),
            });

            let next = self.session.advance_stage(self.plans.len(), counter);
            if let SchedulerState::Stage(next_stage) = next {
                self.progress.on_event(ProgressEvent::StageStarted { stage: next_stage, global_step });
            }
            return Ok(Advance::StageComplete { completed: stage, next });
        }

        let batch = self.data.next_batch(plan.batch_size)?;
        Ok(Advance::Batch(batch))
    }

    /// Drive the loop until every stage completes.
    ///
    /// Returns `Interrupted` if the stop flag is raised; the step in flight
    /// always finishes first.
    pub fn run(&mut self) -> TrainingResult<()> {
        if let Some(stage) = self.session.active_stage() {
            self.progress.on_event(ProgressEvent::StageStarted { stage, global_step: self.session.global_step() });
        }

        loop {
            if self.stop.load(Ordering::SeqCst) {
                let global_step = self.session.global_step();
                warn!(global_step, "Stop requested");
                return Err(TrainingError::Interrupted { global_step });
            }

            match self.advance()? {
                Advance::Batch(batch) => self.train_step(&batch)?,
                Advance::StageComplete { next: SchedulerState::Completed, .. } | Advance::Finished => break,
                Advance::StageComplete { completed, next } => {
                    debug!(completed = %completed, next = ?next, "Stage handed off");
                }
            }
        }

        self.progress.on_event(ProgressEvent::Finished { global_step: self.session.global_step() });
        Ok(())
    }

    /// Optimizer step, reports, periodic checkpoint, then the global step.
    fn train_step(&mut self, batch: &Batch) -> TrainingResult<()> {
        let Some(stage) = self.session.active_stage() else {
            return Ok(());
        };
        let global_step = self.session.global_step();

        let binding = self.optimizers.get_mut(stage);
        let outcome = binding.step(&mut self.model, batch)?;
        let stage_step = binding.step_count();

        self.report(stage, global_step, &outcome, batch);

        if global_step % self.log_rate == 0 {
            self.progress.on_event(ProgressEvent::Step {
                stage,
                global_step,
                stage_step,
                objective: outcome.objective,
                distance: outcome.distance,
                learning_rate: outcome.learning_rate,
            });
        }

        if self.is_final_stage(stage) && global_step % self.save_rate == 0 {
            let snapshot = Snapshot::capture(global_step, self.session.state(), &self.model, &self.optimizers);
            self.store.save(&snapshot)?;
        }

        self.session.record_step();
        Ok(())
    }

    fn report(&mut self, stage: StageIndex, global_step: u64, outcome: &StepOutcome, batch: &Batch) {
        if self.cadence.scalars_due(global_step) {
            let scalars = ScalarReport {
                step: global_step,
                stage,
                objective: outcome.objective,
                distance: outcome.distance,
                learning_rate: outcome.learning_rate,
            };
            report::emit(self.reports.as_mut(), &Report::Scalars(scalars));
        }

        if self.cadence.visuals_due(global_step) {
            match self.model.visualize(stage, batch) {
                Ok(visuals) => {
                    let layer = LayerReport { step: global_step, stage, visuals };
                    report::emit(self.reports.as_mut(), &Report::Layer(layer));
                }
                Err(e) => warn!(stage = %stage, global_step, error = %e, "Failed to build layer visuals"),
            }
        }
    }
}

impl<M: StageModel, D> Checkpointable for StageScheduler<M, D> {
    fn snapshot(&self) -> Snapshot {
        Snapshot::capture(self.session.global_step(), self.session.state(), &self.model, &self.optimizers)
    }

    fn checkpoint_step(&self) -> u64 {
        self.session.global_step()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryDataset;
    use crate::dense::DenseStackedAutoencoder;
    use crate::progress::RecordingProgressSink;
    use crate::report::MemoryReportSink;
    use ndarray::Array2;
    use tempfile::TempDir;

    fn config(temp: &TempDir, hidden: Vec<usize>, batches: Vec<usize>, epochs: u64) -> TrainingConfig {
        TrainingConfig {
            epochs,
            hidden_sizes: hidden,
            batch_sizes: batches,
            logs_dir: temp.path().join("logs"),
            ..Default::default()
        }
    }

    fn scheduler(config: &TrainingConfig, size: usize) -> StageScheduler<DenseStackedAutoencoder, InMemoryDataset> {
        let examples = Array2::from_shape_fn((size, 4), |(i, j)| ((i + j) as f32 * 0.1).cos());
        let data = InMemoryDataset::new(examples, config.angles_max_delta, config.seed).unwrap();
        let mut model = DenseStackedAutoencoder::new(4, &config.hidden_sizes);
        model.initialize(config.seed);
        let plans = config.stage_plans(data.len());
        let optimizers = OptimizerBank::new(&plans, config);
        let session = TrainingSession::new(data.reshuffle_counter());
        StageScheduler::new(model, data, optimizers, session, config)
    }

    #[test]
    fn test_single_stage_completes_after_one_pass() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, vec![3], vec![50], 1);
        let mut scheduler = scheduler(&config, 100);

        for _ in 0..2 {
            let Advance::Batch(batch) = scheduler.advance().unwrap() else {
                panic!("expected a batch");
            };
            scheduler.train_step(&batch).unwrap();
        }
        assert_eq!(scheduler.data().reshuffle_counter(), 1);

        let third = scheduler.advance().unwrap();
        assert!(matches!(
            third,
            Advance::StageComplete { completed: StageIndex::FIRST, next: SchedulerState::Completed }
        ));
        assert_eq!(scheduler.session().global_step(), 2);
    }

    #[test]
    fn test_handoff_does_not_fetch() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, vec![3, 2], vec![100, 100], 1);
        let mut scheduler = scheduler(&config, 100);

        let Advance::Batch(batch) = scheduler.advance().unwrap() else {
            panic!("expected a batch");
        };
        scheduler.train_step(&batch).unwrap();
        let counter = scheduler.data().reshuffle_counter();

        assert!(matches!(scheduler.advance().unwrap(), Advance::StageComplete { .. }));
        assert_eq!(scheduler.data().reshuffle_counter(), counter);
        assert_eq!(scheduler.session().epoch_baseline(), counter);
        assert_eq!(scheduler.session().active_stage(), StageIndex::new(2));
    }

    #[test]
    fn test_run_leaves_inactive_stage_counters_alone() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, vec![3, 2], vec![50, 25], 1);
        let mut scheduler = scheduler(&config, 100);

        scheduler.run().unwrap();

        let steps: Vec<u64> = scheduler.optimizers().iter().map(|b| b.step_count()).collect();
        assert_eq!(steps, vec![2, 4]);
        assert_eq!(scheduler.session().global_step(), 6);
        assert!(scheduler.session().is_completed());
    }

    #[test]
    fn test_run_reports_on_cadence() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp, vec![3], vec![10], 3);
        config.train_report_rate = 10;
        config.layer_report_rate = 25;
        let reports = MemoryReportSink::default();
        let mut scheduler = scheduler(&config, 100).with_reports(Box::new(reports.clone()));

        scheduler.run().unwrap();

        let scalar_steps: Vec<u64> = reports.scalars().iter().map(|r| r.step).collect();
        let layer_steps: Vec<u64> = reports.layers().iter().map(|r| r.step).collect();
        assert_eq!(scalar_steps, vec![0, 10, 20]);
        assert_eq!(layer_steps, vec![0, 25]);
    }

    #[test]
    fn test_stop_flag_interrupts_before_next_step() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, vec![3], vec![10], 5);
        let stop = Arc::new(AtomicBool::new(true));
        let mut scheduler = scheduler(&config, 100).with_stop_flag(Arc::clone(&stop));

        let err = scheduler.run().unwrap_err();
        assert!(matches!(err, TrainingError::Interrupted { global_step: 0 }));
    }

    #[test]
    fn test_progress_marks_every_stage() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, vec![3, 2, 2], vec![50, 50, 50], 1);
        let progress = Arc::new(RecordingProgressSink::default());
        let mut scheduler = scheduler(&config, 100).with_progress(progress.clone());

        scheduler.run().unwrap();

        let started: Vec<usize> = progress
            .events()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::StageStarted { stage, .. } => Some(stage.get()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![1, 2, 3]);
        assert!(matches!(progress.events().last(), Some(ProgressEvent::Finished { global_step: 6 })));
    }
}
