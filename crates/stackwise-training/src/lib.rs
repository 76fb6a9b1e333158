//! Stackwise Training
//!
//! Greedy layer-wise training for stacked models:
//! - Stage plans and the mutable session (`StagePlan`, `TrainingSession`)
//! - Per-stage optimizers with their own step counters and decay schedules
//! - A scheduler that hands off between stages on whole-epoch boundaries
//! - Best-effort reporting and a checkpoint store with a guaranteed final save

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod dense;
pub mod epoch;
pub mod error;
pub mod layout;
pub mod model;
pub mod optimizer;
pub mod progress;
pub mod report;
pub mod scheduler;
pub mod stage;
pub mod trainer;

pub use checkpoint::{CheckpointRecord, CheckpointStore, Checkpointable, FinalSave, Snapshot};
pub use config::{AdamConfig, ConfigError, ConfigResult, DataConfig, OptimizerKind, TrainingConfig};
pub use data::{Batch, DataSource, InMemoryDataset, build_dataset};
pub use dense::DenseStackedAutoencoder;
pub use epoch::stage_complete;
pub use error::{TrainingError, TrainingResult};
pub use layout::RunLayout;
pub use model::{Evaluation, LayerVisual, ModelError, ModelResult, StageModel, Tensor};
pub use optimizer::{
    LearningRateSchedule, OptimizerBank, OptimizerBinding, OptimizerState, StepOutcome, clip_by_global_norm,
};
pub use progress::{ProgressEvent, ProgressSink, RecordingProgressSink, TracingProgressSink};
pub use report::{
    JsonlReportSink, LayerReport, MemoryReportSink, NullReportSink, Report, ReportCadence, ReportSink, ScalarReport,
};
pub use scheduler::{Advance, StageScheduler};
pub use stage::{SchedulerState, StageIndex, StagePlan, TrainingSession};
pub use trainer::{Trainer, TrainingSummary};
