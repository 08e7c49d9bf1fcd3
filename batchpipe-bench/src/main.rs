//! Benchmark runner for batchpipe pipelines
//!
//! Usage: `batchpipe-bench [config.json]`

use std::env;
use std::fs;

use anyhow::{Context, Result};
use batchpipe_bench::{run_all, BenchConfig, BenchResult};

fn print_result(result: &BenchResult) {
    println!("\nBenchmark: {}", result.name);
    println!("  Total time:   {:?}", result.total_time);
    println!("  Average time: {:?}", result.avg_time);
    println!("  Min time:     {:?}", result.min_time);
    println!("  Max time:     {:?}", result.max_time);
    println!("  Throughput:   {:.2} items/sec", result.throughput);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = match env::args().nth(1) {
        Some(path) => {
            let text = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?
        }
        None => BenchConfig::default(),
    };

    println!("=== Batch Pipeline Benchmarks ===");
    println!("{}", serde_json::to_string_pretty(&config)?);

    for result in run_all(&config)? {
        print_result(&result);
    }

    // Batch size sweep
    println!("\n=== Batch Size Sweep ===");
    for batch_size in [16, 64, 256, 1024] {
        let config = BenchConfig {
            batch_size,
            iterations: 3,
            warmup_iterations: 1,
            ..config.clone()
        };
        let result = batchpipe_bench::bench_run(&config)?;
        println!("\nBatch size: {batch_size}");
        println!("  Average time: {:?}", result.avg_time);
        println!("  Throughput:   {:.2} items/sec", result.throughput);
    }

    Ok(())
}
