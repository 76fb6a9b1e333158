use crate::config::{DataConfig, TrainingConfig};
use crate::error::{TrainingError, TrainingResult};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// One batch of training input. Produced fresh per fetch and consumed by a
/// single step.
#[derive(Debug, Clone)]
pub struct Batch {
    /// One example per row.
    pub inputs: Array2<f32>,
    /// Stage-agnostic augmentation parameter, one angle (radians) per row.
    pub rotation_angles: Vec<f32>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }
}

/// Source of training batches.
///
/// `reshuffle_counter` counts completed passes over the whole dataset and is
/// the only epoch signal the scheduler relies on.
pub trait DataSource {
    /// Number of examples in one full pass.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Width of a single example.
    fn input_dim(&self) -> usize;

    fn reshuffle_counter(&self) -> u64;

    /// Blocking fetch of the next `batch_size` examples.
    fn next_batch(&mut self, batch_size: usize) -> TrainingResult<Batch>;
}

/// Dataset held fully in memory, served in shuffled order.
///
/// A batch that runs past the end of the current pass takes the remaining
/// examples, reshuffles, and fills up from the new order.
#[derive(Debug)]
pub struct InMemoryDataset {
    examples: Array2<f32>,
    order: Vec<usize>,
    cursor: usize,
    reshuffle_counter: u64,
    angles_max_delta: f32,
    rng: StdRng,
}

impl InMemoryDataset {
    pub fn new(examples: Array2<f32>, angles_max_delta: f32, seed: u64) -> TrainingResult<Self> {
        if examples.nrows() == 0 || examples.ncols() == 0 {
            return Err(TrainingError::Data("dataset must not be empty".to_string()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..examples.nrows()).collect();
        order.shuffle(&mut rng);

        Ok(Self { examples, order, cursor: 0, reshuffle_counter: 0, angles_max_delta, rng })
    }

    /// Low-rank data plus uniform noise, fully determined by `seed`.
    pub fn synthetic(
        size: usize,
        dim: usize,
        rank: usize,
        noise: f32,
        angles_max_delta: f32,
        seed: u64,
    ) -> TrainingResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (rank.max(1) as f32).sqrt();
        let latent = Array2::from_shape_fn((size, rank), |_| rng.gen_range(-1.0f32..=1.0));
        let mixing = Array2::from_shape_fn((rank, dim), |_| rng.gen_range(-scale..=scale));
        let mut examples = latent.dot(&mixing);
        examples.mapv_inplace(|x| x + rng.gen_range(-noise..=noise));

        Self::new(examples, angles_max_delta, seed.wrapping_add(1))
    }

    /// Reads one example per line, each a JSON array of numbers.
    pub fn from_jsonl(path: &Path, angles_max_delta: f32, seed: u64) -> TrainingResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut rows: Vec<Vec<f32>> = Vec::new();

        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row: Vec<f32> = serde_json::from_str(line).map_err(|e| {
                TrainingError::Data(format!("failed to parse jsonl line {}: {}", idx + 1, e))
            })?;
            if let Some(first) = rows.first() {
                if first.len() != row.len() {
                    return Err(TrainingError::Data(format!(
                        "jsonl line {} has {} values, expected {}",
                        idx + 1,
                        row.len(),
                        first.len()
                    )));
                }
            }
            rows.push(row);
        }

        let width = rows.first().map_or(0, Vec::len);
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let examples = Array2::from_shape_vec((rows.len(), width), flat)
            .map_err(|e| TrainingError::Data(format!("invalid dataset shape: {e}")))?;

        Self::new(examples, angles_max_delta, seed)
    }

    fn reshuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
        self.reshuffle_counter += 1;
    }
}

impl DataSource for InMemoryDataset {
    fn len(&self) -> usize {
        self.examples.nrows()
    }

    fn input_dim(&self) -> usize {
        self.examples.ncols()
    }

    fn reshuffle_counter(&self) -> u64 {
        self.reshuffle_counter
    }

    fn next_batch(&mut self, batch_size: usize) -> TrainingResult<Batch> {
        if batch_size == 0 {
            return Err(TrainingError::Data("batch_size must be >= 1".to_string()));
        }

        let mut rows = Vec::with_capacity(batch_size);
        while rows.len() < batch_size {
            rows.push(self.order[self.cursor]);
            self.cursor += 1;
            if self.cursor == self.order.len() {
                self.reshuffle();
            }
        }

        let inputs = self.examples.select(Axis(0), &rows);
        let delta = self.angles_max_delta;
        let rotation_angles = (0..batch_size).map(|_| self.rng.gen_range(-delta..=delta)).collect();

        Ok(Batch { inputs, rotation_angles })
    }
}

/// Build the data source described by `config.data`.
pub fn build_dataset(config: &TrainingConfig) -> TrainingResult<InMemoryDataset> {
    match &config.data {
        DataConfig::Synthetic { size, dim, rank, noise } => {
            InMemoryDataset::synthetic(*size, *dim, *rank, *noise, config.angles_max_delta, config.seed)
        }
        DataConfig::Jsonl { path } => InMemoryDataset::from_jsonl(path, config.angles_max_delta, config.seed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dataset(size: usize) -> InMemoryDataset {
        InMemoryDataset::synthetic(size, 4, 2, 0.0, 0.1, 7).unwrap()
    }

    #[test]
    fn test_counter_advances_on_exact_boundary() {
        let mut data = dataset(100);
        data.next_batch(50).unwrap();
        assert_eq!(data.reshuffle_counter(), 0);
        data.next_batch(50).unwrap();
        assert_eq!(data.reshuffle_counter(), 1);
    }

    #[test]
    fn test_batch_wraps_across_passes() {
        let mut data = dataset(10);
        let batch = data.next_batch(7).unwrap();
        assert_eq!(batch.len(), 7);
        assert_eq!(data.reshuffle_counter(), 0);

        let batch = data.next_batch(7).unwrap();
        assert_eq!(batch.len(), 7);
        assert_eq!(data.reshuffle_counter(), 1);
    }

    #[test]
    fn test_batch_larger_than_dataset() {
        let mut data = dataset(3);
        let batch = data.next_batch(7).unwrap();
        assert_eq!(batch.len(), 7);
        assert_eq!(data.reshuffle_counter(), 2);
    }

    #[test]
    fn test_rotation_angles_within_bounds() {
        let mut data = dataset(20);
        let batch = data.next_batch(20).unwrap();
        assert_eq!(batch.rotation_angles.len(), 20);
        assert!(batch.rotation_angles.iter().all(|a| a.abs() <= 0.1));
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let mut data = dataset(5);
        assert!(data.next_batch(0).is_err());
    }

    #[test]
    fn test_from_jsonl() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.jsonl");
        std::fs::write(&path, "[1, 2, 3]\n\n[4, 5, 6]\n").unwrap();

        let data = InMemoryDataset::from_jsonl(&path, 0.0, 1).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.input_dim(), 3);
    }

    #[test]
    fn test_from_jsonl_rejects_ragged_rows() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.jsonl");
        std::fs::write(&path, "[1, 2, 3]\n[4, 5]\n").unwrap();

        assert!(InMemoryDataset::from_jsonl(&path, 0.0, 1).is_err());
    }

    #[test]
    fn test_empty_dataset_is_rejected() {
        assert!(InMemoryDataset::new(Array2::zeros((0, 4)), 0.0, 1).is_err());
    }
}
