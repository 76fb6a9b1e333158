//! Periodic metric and visualization reporting.
//!
//! Reports are typed records keyed by global step. Delivery is best effort:
//! a failing sink is logged and training carries on.

use crate::config::TrainingConfig;
use crate::model::LayerVisual;
use crate::stage::StageIndex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub const SCALARS_FILE: &str = "scalars.jsonl";
pub const LAYERS_FILE: &str = "layers.jsonl";

/// Objective, auxiliary metric and learning rate at one global step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarReport {
    pub step: u64,
    pub stage: StageIndex,
    pub objective: f32,
    pub distance: f32,
    pub learning_rate: f64,
}

/// Stage-specific visual artifacts at one global step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerReport {
    pub step: u64,
    pub stage: StageIndex,
    pub visuals: Vec<LayerVisual>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Scalars(ScalarReport),
    Layer(LayerReport),
}

impl Report {
    #[must_use]
    pub fn step(&self) -> u64 {
        match self {
            Self::Scalars(r) => r.step,
            Self::Layer(r) => r.step,
        }
    }
}

pub trait ReportSink: Send {
    fn write_scalars(&mut self, report: &ScalarReport) -> io::Result<()>;

    fn write_layer(&mut self, report: &LayerReport) -> io::Result<()>;
}

/// Deliver `report` to the sink method for its kind. Failures are logged.
pub fn emit(sink: &mut dyn ReportSink, report: &Report) {
    let result = match report {
        Report::Scalars(r) => sink.write_scalars(r),
        Report::Layer(r) => sink.write_layer(r),
    };

    if let Err(e) = result {
        warn!(step = report.step(), error = %e, "Failed to write report");
    }
}

/// Independent cadences for the two report kinds, in global steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportCadence {
    pub train_report_rate: u64,
    pub layer_report_rate: u64,
}

impl ReportCadence {
    #[must_use]
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self { train_report_rate: config.train_report_rate, layer_report_rate: config.layer_report_rate }
    }

    #[must_use]
    pub fn scalars_due(&self, global_step: u64) -> bool {
        global_step % self.train_report_rate.max(1) == 0
    }

    #[must_use]
    pub fn visuals_due(&self, global_step: u64) -> bool {
        global_step % self.layer_report_rate.max(1) == 0
    }
}

/// Appends JSON lines to `scalars.jsonl` and `layers.jsonl` in a reporting directory.
#[derive(Debug)]
pub struct JsonlReportSink {
    dir: PathBuf,
    scalars: BufWriter<File>,
    layers: BufWriter<File>,
}

impl JsonlReportSink {
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |name: &str| OpenOptions::new().create(true).append(true).open(dir.join(name));

        Ok(Self {
            dir: dir.to_path_buf(),
            scalars: BufWriter::new(open(SCALARS_FILE)?),
            layers: BufWriter::new(open(LAYERS_FILE)?),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn write_line<T: Serialize>(out: &mut BufWriter<File>, record: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *out, record)?;
    out.write_all(b"\n")?;
    out.flush()
}

impl ReportSink for JsonlReportSink {
    fn write_scalars(&mut self, report: &ScalarReport) -> io::Result<()> {
        write_line(&mut self.scalars, report)
    }

    fn write_layer(&mut self, report: &LayerReport) -> io::Result<()> {
        write_line(&mut self.layers, report)
    }
}

#[derive(Debug, Default)]
struct Recorded {
    scalars: Vec<ScalarReport>,
    layers: Vec<LayerReport>,
}

/// Keeps every report in memory. Clones share the same records, so a handle
/// kept by the caller sees what the trainer wrote.
#[derive(Debug, Default, Clone)]
pub struct MemoryReportSink {
    recorded: Arc<Mutex<Recorded>>,
}

impl MemoryReportSink {
    #[must_use]
    pub fn scalars(&self) -> Vec<ScalarReport> {
        self.recorded.lock().map(|r| r.scalars.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn layers(&self) -> Vec<LayerReport> {
        self.recorded.lock().map(|r| r.layers.clone()).unwrap_or_default()
    }

    fn record(&self, apply: impl FnOnce(&mut Recorded)) -> io::Result<()> {
        let mut recorded = self.recorded.lock().map_err(|_| io::Error::other("report buffer poisoned"))?;
        apply(&mut recorded);
        Ok(())
    }
}

impl ReportSink for MemoryReportSink {
    fn write_scalars(&mut self, report: &ScalarReport) -> io::Result<()> {
        self.record(|r| r.scalars.push(report.clone()))
    }

    fn write_layer(&mut self, report: &LayerReport) -> io::Result<()> {
        self.record(|r| r.layers.push(report.clone()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullReportSink;

impl ReportSink for NullReportSink {
    fn write_scalars(&mut self, _report: &ScalarReport) -> io::Result<()> {
        Ok(())
    }

    fn write_layer(&mut self, _report: &LayerReport) -> io::Result<()> {
        Ok(())
    }
}
