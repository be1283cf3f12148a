//! Seeded synthetic regression data.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use super::CpuBackend;
use super::tensor::CpuTensor;
use crate::backend::{INPUT_KEY, Sample, TARGET_KEY};
use crate::components::{BatchIter, DataLoader, Dataset, LoaderOptions};

const TRUE_BIAS: f64 = 0.3;

/// Dataset configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_features")]
    pub features: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_phases_per_epoch")]
    pub phases_per_epoch: f64,
    #[serde(default)]
    pub noise: f64,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    #[serde(default)]
    pub num_workers: Option<usize>,
}

fn default_num_samples() -> usize {
    64
}

fn default_batch_size() -> usize {
    8
}

fn default_features() -> usize {
    2
}

fn default_phases_per_epoch() -> f64 {
    1.0
}

fn default_shuffle() -> bool {
    true
}

#[derive(Debug, Clone)]
struct Example {
    input: Vec<f64>,
    target: f64,
}

/// `target = x . w + 0.3 + noise` with a fixed `w`, drawn from a seeded RNG.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    examples: Arc<Vec<Example>>,
    features: usize,
    batch_size: usize,
    world_size: usize,
    phases_per_epoch: f64,
    shuffle: bool,
    seed: u64,
    num_workers: Option<usize>,
}

impl SyntheticDataset {
    pub fn new(num_samples: usize, batch_size: usize, features: usize, seed: u64) -> Self {
        Self::generate(num_samples, batch_size, features, seed, 0.0)
    }

    pub fn from_config(config: &SyntheticConfig, default_seed: u64) -> anyhow::Result<Self> {
        anyhow::ensure!(config.batch_size > 0, "batch_size must be >= 1");
        anyhow::ensure!(config.features > 0, "features must be >= 1");
        let mut dataset = Self::generate(
            config.num_samples,
            config.batch_size,
            config.features,
            config.seed.unwrap_or(default_seed),
            config.noise,
        );
        dataset.phases_per_epoch = config.phases_per_epoch;
        dataset.shuffle = config.shuffle;
        dataset.num_workers = config.num_workers;
        Ok(dataset)
    }

    fn generate(num_samples: usize, batch_size: usize, features: usize, seed: u64, noise: f64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = true_weights(features);
        let examples = (0..num_samples)
            .map(|_| {
                let input: Vec<f64> = (0..features).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let jitter = if noise > 0.0 {
                    rng.gen_range(-noise..noise)
                } else {
                    0.0
                };
                let target = input.iter().zip(&weights).map(|(x, w)| x * w).sum::<f64>() + TRUE_BIAS + jitter;
                Example { input, target }
            })
            .collect();
        Self {
            examples: Arc::new(examples),
            features,
            batch_size: batch_size.max(1),
            world_size: 1,
            phases_per_epoch: 1.0,
            shuffle: true,
            seed,
            num_workers: None,
        }
    }

    /// Number of processes sharing the global batch.
    pub fn with_world_size(mut self, world_size: usize) -> Self {
        self.world_size = world_size.max(1);
        self
    }

    pub fn with_phases_per_epoch(mut self, phases_per_epoch: f64) -> Self {
        self.phases_per_epoch = phases_per_epoch;
        self
    }

    /// Reshuffle example order for every phase id (the default).
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn features(&self) -> usize {
        self.features
    }
}

fn true_weights(features: usize) -> Vec<f64> {
    (0..features)
        .map(|i| {
            let magnitude = 0.5 * (i + 1) as f64;
            if i % 2 == 0 { magnitude } else { -magnitude }
        })
        .collect()
}

impl Dataset<CpuBackend> for SyntheticDataset {
    fn iterator(&self, options: &LoaderOptions) -> anyhow::Result<Box<dyn DataLoader<CpuBackend>>> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(options.current_phase_id as u64));
            order.shuffle(&mut rng);
        }
        let mut options = options.clone();
        options.num_workers = options.num_workers.or(self.num_workers).or(Some(0));
        Ok(Box::new(SyntheticLoader {
            examples: Arc::clone(&self.examples),
            order: Arc::new(order),
            features: self.features,
            batch_size: self.batch_size,
            options,
        }))
    }

    fn batchsize_per_replica(&self) -> usize {
        self.batch_size
    }

    fn global_batchsize(&self) -> usize {
        self.batch_size * self.world_size
    }

    fn phases_per_epoch(&self) -> f64 {
        self.phases_per_epoch
    }
}

/// Loader over one ordering of a [`SyntheticDataset`]. The last batch may be
/// short.
pub struct SyntheticLoader {
    examples: Arc<Vec<Example>>,
    order: Arc<Vec<usize>>,
    features: usize,
    batch_size: usize,
    options: LoaderOptions,
}

impl SyntheticLoader {
    /// Example indices in iteration order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

impl DataLoader<CpuBackend> for SyntheticLoader {
    fn len(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    fn options(&self) -> &LoaderOptions {
        &self.options
    }

    fn iter(&self) -> anyhow::Result<BatchIter<CpuBackend>> {
        let examples = Arc::clone(&self.examples);
        let order = Arc::clone(&self.order);
        let (features, batch_size) = (self.features, self.batch_size);
        let batches = (0..self.len()).map(move |batch| -> anyhow::Result<Sample<CpuTensor>> {
            let start = batch * batch_size;
            let end = (start + batch_size).min(order.len());
            let indices = &order[start..end];
            let input = indices
                .iter()
                .flat_map(|&i| examples[i].input.iter().copied())
                .collect();
            let target = indices.iter().map(|&i| examples[i].target).collect();
            let mut sample = Sample::new();
            sample.insert(INPUT_KEY.to_string(), CpuTensor::new(input, indices.len(), features)?);
            sample.insert(TARGET_KEY.to_string(), CpuTensor::column(target));
            Ok(sample)
        });
        Ok(Box::new(batches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_cover_dataset() {
        let dataset = SyntheticDataset::new(10, 4, 3, 0);
        let loader = dataset.iterator(&LoaderOptions::default()).unwrap();
        assert_eq!(loader.len(), 3);
        let batches: Vec<_> = loader.iter().unwrap().collect::<anyhow::Result<_>>().unwrap();
        assert_eq!(batches.len(), 3);
        let rows: usize = batches.iter().map(|b| b[TARGET_KEY].rows()).sum();
        assert_eq!(rows, 10);
        assert_eq!(batches[0][INPUT_KEY].cols(), 3);
        assert_eq!(batches[2][INPUT_KEY].rows(), 2);
    }

    #[test]
    fn test_iter_is_repeatable() {
        let dataset = SyntheticDataset::new(8, 4, 2, 3);
        let loader = dataset.iterator(&LoaderOptions::default()).unwrap();
        let first: Vec<_> = loader.iter().unwrap().map(Result::unwrap).collect();
        let second: Vec<_> = loader.iter().unwrap().map(Result::unwrap).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_shuffle_depends_on_phase_id() {
        let dataset = SyntheticDataset::new(32, 4, 2, 1);
        let order = |phase_id| {
            let options = LoaderOptions {
                current_phase_id: phase_id,
                ..Default::default()
            };
            let loader = dataset.iterator(&options).unwrap();
            let batches: Vec<_> = loader.iter().unwrap().map(Result::unwrap).collect();
            batches
        };
        assert_eq!(order(1), order(1));
        assert_ne!(order(1), order(2));
    }

    #[test]
    fn test_unshuffled_order_is_sequential() {
        let dataset = SyntheticDataset::new(5, 2, 2, 1).with_shuffle(false);
        let options = LoaderOptions {
            current_phase_id: 4,
            ..Default::default()
        };
        let loader = dataset.iterator(&options).unwrap();
        let batches: Vec<_> = loader.iter().unwrap().map(Result::unwrap).collect();
        let first = dataset.iterator(&LoaderOptions::default()).unwrap();
        let reference: Vec<_> = first.iter().unwrap().map(Result::unwrap).collect();
        assert_eq!(batches, reference);
    }

    #[test]
    fn test_loader_resolves_worker_default() {
        let dataset = SyntheticDataset::new(8, 4, 2, 0);
        let options = LoaderOptions {
            pin_memory: true,
            current_phase_id: 3,
            ..Default::default()
        };
        let loader = dataset.iterator(&options).unwrap();
        assert_eq!(loader.options().num_workers, Some(0));
        assert!(loader.options().pin_memory);
        assert_eq!(loader.options().current_phase_id, 3);
    }

    #[test]
    fn test_global_batchsize_scales_with_world() {
        let dataset = SyntheticDataset::new(8, 4, 2, 0).with_world_size(3);
        assert_eq!(dataset.batchsize_per_replica(), 4);
        assert_eq!(dataset.global_batchsize(), 12);
    }

    #[test]
    fn test_config_defaults() {
        let config: SyntheticConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        let dataset = SyntheticDataset::from_config(&config, 5).unwrap();
        assert_eq!(dataset.len(), 64);
        assert_eq!(dataset.batchsize_per_replica(), 8);
        assert_eq!(dataset.features(), 2);
        assert_eq!(dataset.phases_per_epoch(), 1.0);
    }
}
