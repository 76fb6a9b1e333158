//! Training entry point: restore or initialize, run every stage, and always
//! leave a final checkpoint behind.

use crate::checkpoint::{CheckpointRecord, CheckpointStore, FinalSave};
use crate::config::{ConfigError, TrainingConfig};
use crate::data::{DataSource, InMemoryDataset, build_dataset};
use crate::dense::DenseStackedAutoencoder;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::RunLayout;
use crate::model::StageModel;
use crate::optimizer::OptimizerBank;
use crate::progress::{ProgressEvent, ProgressSink, TracingProgressSink};
use crate::report::{JsonlReportSink, NullReportSink, ReportSink};
use crate::scheduler::StageScheduler;
use crate::stage::{SchedulerState, TrainingSession};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub final_step: u64,
    pub stages_completed: usize,
    pub checkpoint: CheckpointRecord,
}

pub struct Trainer<M, D> {
    config: TrainingConfig,
    model: M,
    data: D,
    reports: Option<Box<dyn ReportSink>>,
    progress: Arc<dyn ProgressSink>,
    stop: Arc<AtomicBool>,
}

impl Trainer<DenseStackedAutoencoder, InMemoryDataset> {
    /// Dense reference model over the data source named in `config`.
    pub fn from_config(config: TrainingConfig) -> TrainingResult<Self> {
        config.validate()?;
        let data = build_dataset(&config)?;
        let model = DenseStackedAutoencoder::new(data.input_dim(), &config.hidden_sizes);
        Self::new(config, model, data)
    }
}

impl<M: StageModel, D: DataSource> Trainer<M, D> {
    pub fn new(config: TrainingConfig, model: M, data: D) -> TrainingResult<Self> {
        config.validate()?;
        if model.stage_count() != config.stage_count() {
            return Err(ConfigError::InvalidValue(format!(
                "model has {} stages but hidden_sizes defines {}",
                model.stage_count(),
                config.stage_count()
            ))
            .into());
        }
        if data.is_empty() {
            return Err(TrainingError::Data("data source is empty".to_string()));
        }

        Ok(Self {
            config,
            model,
            data,
            reports: None,
            progress: Arc::new(TracingProgressSink),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the default JSONL report sink under `logs_dir`.
    #[must_use]
    pub fn with_reports(mut self, reports: Box<dyn ReportSink>) -> Self {
        self.reports = Some(reports);
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
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn train(self) -> TrainingResult<TrainingSummary> {
        let Self { config, mut model, data, reports, progress, stop } = self;
        let layout = RunLayout::for_config(&config);
        let store = CheckpointStore::new(&layout.checkpoint_location(), config.max_to_keep);
        let plans = config.stage_plans(data.len());
        let mut optimizers = OptimizerBank::new(&plans, &config);

        // Nothing may touch the data source before a requested restore succeeds.
        let session = if config.restore {
            let snapshot = store.restore()?;
            let (global_step, state) = (snapshot.global_step, snapshot.state);
            snapshot
                .apply(&mut model, &mut optimizers)
                .map_err(|reason| TrainingError::restore(store.location(), reason))?;
            info!(global_step, state = ?state, "Resuming training");
            TrainingSession::resume(state, global_step, data.reshuffle_counter())
        } else {
            model.initialize(config.seed);
            TrainingSession::new(data.reshuffle_counter())
        };

        layout.ensure_dirs()?;
        if let Err(e) = config.save(&layout.config_path()) {
            warn!(error = %e, "Failed to record run configuration");
        }

        let reports: Box<dyn ReportSink> = match reports {
            Some(reports) => reports,
            None => match JsonlReportSink::open(layout.reports_dir()) {
                Ok(sink) => Box::new(sink),
                Err(e) => {
                    warn!(dir = %layout.reports_dir().display(), error = %e, "Reporting disabled");
                    Box::new(NullReportSink)
                }
            },
        };

        progress.on_event(ProgressEvent::Planned { plans: plans.clone() });

        let mut scheduler = StageScheduler::new(model, data, optimizers, session, &config)
            .with_reports(reports)
            .with_progress(progress)
            .with_stop_flag(stop);

        let mut guard = FinalSave::new(&store, &mut scheduler);
        let outcome = guard.target().run();
        let saved = guard.finish();

        let checkpoint = match (outcome, saved) {
            (Ok(()), saved) => saved?,
            (Err(e), Ok(_)) => return Err(e),
            (Err(e), Err(save_error)) => {
                error!(error = %save_error, "Final checkpoint save failed");
                return Err(e);
            }
        };

        let session = scheduler.session();
        let stages_completed = match session.state() {
            SchedulerState::Completed => plans.len(),
            SchedulerState::Stage(stage) => stage.zero_based(),
        };

        Ok(TrainingSummary { final_step: session.global_step(), stages_completed, checkpoint })
    }
}
