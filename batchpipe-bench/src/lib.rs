//! Benchmarks for batchpipe pipelines
//!
//! A synthetic batch type stands in for real data: `generate` fills one
//! feature vector per key and `normalize` scales each vector to unit length.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use batchpipe_core::{ActionRegistry, Args, Batch, Dataset, Index, PairedDataset, Pipeline};
use batchpipe_parallel::{PrefetchConfig, PrefetchExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Number of measured iterations
    pub iterations: usize,

    /// Warmup iterations
    pub warmup_iterations: usize,

    /// Number of keys in the dataset
    pub items: usize,

    /// Keys per batch
    pub batch_size: usize,

    /// Features generated per item
    pub dim: usize,

    /// Whether batches are drawn in shuffled order
    pub shuffle: bool,

    /// Worker threads for the prefetch benchmark
    pub workers: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            warmup_iterations: 3,
            items: 10_000,
            batch_size: 256,
            dim: 64,
            shuffle: true,
            workers: 4,
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone, Serialize)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Throughput (items/second)
    pub throughput: f64,
}

/// Run a benchmark; `func` returns the number of items it processed
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, func: F) -> Result<BenchResult>
where
    F: Fn() -> Result<usize>,
{
    ensure!(config.iterations > 0, "at least one iteration is required");

    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let mut items = 0;
    let start_total = Instant::now();

    for _ in 0..config.iterations {
        let start = Instant::now();
        items += func()?;
        times.push(start.elapsed());
    }

    let total_time = start_total.elapsed();
    let avg_time = times.iter().sum::<Duration>() / times.len() as u32;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();
    let throughput = items as f64 / total_time.as_secs_f64();

    debug!(name, ?avg_time, throughput, "benchmark finished");
    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        throughput,
    })
}

/// Synthetic feature vectors, one per key
pub struct Features {
    index: Index<usize>,
    /// Row-major `len * dim` values
    pub values: Vec<f32>,
    /// Features per row
    pub dim: usize,
}

impl Features {
    fn empty(index: Index<usize>) -> Self {
        Self {
            index,
            values: Vec::new(),
            dim: 0,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn generate(&mut self, args: &Args) -> anyhow::Result<()> {
        self.dim = args.kw_or("dim", 16)?;
        self.values = self
            .index
            .iter()
            .flat_map(|key| (0..self.dim).map(move |j| ((key * 31 + j) % 97) as f32))
            .collect();
        Ok(())
    }

    fn normalize(&mut self, _: &Args) -> anyhow::Result<()> {
        if self.dim == 0 {
            return Ok(());
        }
        for row in self.values.chunks_mut(self.dim) {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                row.iter_mut().for_each(|v| *v /= norm);
            }
        }
        Ok(())
    }
}

impl Batch for Features {
    type Key = usize;

    fn index(&self) -> &Index<usize> {
        &self.index
    }

    fn actions() -> &'static ActionRegistry<Self> {
        static ACTIONS: OnceLock<ActionRegistry<Features>> = OnceLock::new();
        ACTIONS.get_or_init(|| {
            ActionRegistry::new()
                .with_action("generate", Features::generate)
                .with_action("normalize", Features::normalize)
        })
    }
}

/// Dataset of `items` synthetic feature rows
pub fn features(items: usize) -> Dataset<Features> {
    Dataset::new(Index::range(items), |index| Ok(Features::empty(index)))
}

/// The benchmarked pipeline: generate then normalize
pub fn feature_pipeline(config: &BenchConfig) -> Pipeline<Features> {
    features(config.items)
        .pipeline()
        .append("generate", Args::new().kwarg("dim", config.dim))
        .then("normalize")
}

/// One full pass through `run`
pub fn bench_run(config: &BenchConfig) -> Result<BenchResult> {
    let pipeline = feature_pipeline(config);
    run_benchmark("Pipeline run", config, || {
        let stats = pipeline.run(config.batch_size, config.shuffle, true)?;
        Ok(usize::try_from(stats.items_processed)?)
    })
}

/// One pass worth of `next_batch` calls
pub fn bench_next_batch(config: &BenchConfig) -> Result<BenchResult> {
    let steps = config.items.div_ceil(config.batch_size);
    let mut pipeline = feature_pipeline(config);
    pipeline.next_batch(config.batch_size, config.shuffle)?;

    let pipeline = std::cell::RefCell::new(pipeline);
    run_benchmark("Pipeline next_batch", config, || {
        let mut pipeline = pipeline.borrow_mut();
        let mut items = 0;
        for _ in 0..steps {
            items += pipeline.next_batch(config.batch_size, config.shuffle)?.len();
        }
        Ok(items)
    })
}

/// One pass over a paired dataset of features and features
pub fn bench_paired(config: &BenchConfig) -> Result<BenchResult> {
    let paired = PairedDataset::new(feature_pipeline(config), feature_pipeline(config))?;
    run_benchmark("Paired run", config, || {
        let stats = paired.run(config.batch_size, config.shuffle, true)?;
        Ok(usize::try_from(stats.items_processed)?)
    })
}

/// One pass with batches prepared on worker threads
pub fn bench_prefetch(config: &BenchConfig) -> Result<BenchResult> {
    let prefetch = PrefetchConfig::new(config.batch_size)
        .with_shuffle(config.shuffle)
        .with_workers(config.workers)
        .epochs(1);

    run_benchmark("Prefetched pass", config, || {
        let mut items = 0;
        for batch in feature_pipeline(config).prefetch(&prefetch)? {
            items += batch?.len();
        }
        Ok(items)
    })
}

/// Every benchmark with the same config
pub fn run_all(config: &BenchConfig) -> Result<Vec<BenchResult>> {
    Ok(vec![
        bench_run(config)?,
        bench_next_batch(config)?,
        bench_paired(config)?,
        bench_prefetch(config)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> BenchConfig {
        BenchConfig {
            iterations: 2,
            warmup_iterations: 0,
            items: 50,
            batch_size: 8,
            dim: 4,
            shuffle: true,
            workers: 2,
        }
    }

    #[test]
    fn test_rows_are_unit_length() {
        let config = small();
        let pipeline = feature_pipeline(&config);
        let batch = pipeline.materialize(&Index::range(3)).unwrap();
        assert_eq!(batch.values.len(), 12);
        for row in batch.values.chunks(4) {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_all_benchmarks_run() {
        let results = run_all(&small()).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.throughput > 0.0));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = BenchConfig {
            iterations: 0,
            ..small()
        };
        assert!(run_benchmark("noop", &config, || Ok(0)).is_err());
    }
}
