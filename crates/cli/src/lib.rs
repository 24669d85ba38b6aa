use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use outcore_cache::{Builder, CacheConfig, CacheStats};
use outcore_scheduler::{IterSource, PipelineConfig, TaskError, TaskPool, TaskReport};
use outcore_storage::{InMemoryMetrics, MetricsSink};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "outcore")]
#[command(about = "Out-of-core cache and pipeline driver")]
pub struct Cli {
    /// TOML file with optional [cache] and [pipeline] tables.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sum 0..items with alternating signs through a spilling pipeline.
    Pipeline {
        #[arg(long, default_value_t = 1_000_000)]
        items: u64,
        #[arg(long, default_value_t = 1024)]
        batch_size: usize,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        spill_threshold: Option<usize>,
    },
    /// Register blob resources and access them in order under a budget.
    Cache {
        #[arg(long, default_value_t = 400)]
        resources: u32,
        #[arg(long, default_value_t = 1)]
        size: usize,
        /// Memory budget in bytes (defaults to the configured budget).
        #[arg(long)]
        budget: Option<u64>,
        #[arg(long, default_value_t = 1)]
        passes: u32,
    },
    /// Print CLI version.
    Version,
}

/// Layout of the `--config` file.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    cache: Option<CacheConfig>,
    pipeline: Option<PipelineConfig>,
}

#[derive(Debug, Serialize)]
struct PipelineOutput {
    items: u64,
    batch_size: usize,
    workers: usize,
    sum: i64,
    expected: i64,
    tasks: Vec<TaskReport>,
    metrics: BTreeMap<&'static str, u64>,
}

#[derive(Debug, Serialize)]
struct CacheOutput {
    resources: u32,
    size: usize,
    passes: u32,
    stats: CacheStats,
    hit_rate: f64,
    metrics: BTreeMap<&'static str, u64>,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging();

    let file_config = match &cli.config {
        Some(path) => load_file_config(path)?,
        None => FileConfig::default(),
    };

    match cli.command {
        Commands::Pipeline { items, batch_size, workers, spill_threshold } => {
            let mut config = match file_config.pipeline {
                Some(config) => config,
                None => PipelineConfig::from_env().context("invalid pipeline environment")?,
            };
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }
            if let Some(threshold) = spill_threshold {
                config = config.with_spill_threshold(threshold);
            }
            run_pipeline(config, items, batch_size)
        }
        Commands::Cache { resources, size, budget, passes } => {
            let mut config = match file_config.cache {
                Some(config) => config,
                None => CacheConfig::from_env().context("invalid cache environment")?,
            };
            if let Some(budget) = budget {
                config.memory_budget = budget;
            }
            run_cache(&config, resources, size, passes)
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // Already installed when `run` is called more than once in a process.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config {}", path.display()))
}

fn run_pipeline(config: PipelineConfig, items: u64, batch_size: usize) -> Result<()> {
    ensure!(batch_size > 0, "--batch-size must be >= 1");
    ensure!(items <= i64::MAX as u64, "--items is too large");

    let metrics = Arc::new(InMemoryMetrics::new());
    let workers = config.num_workers;
    let mut pool = TaskPool::open(config, metrics.clone() as Arc<dyn MetricsSink>)
        .context("failed to create pipeline")?;

    let values = pool.channel::<i64>("values");
    let partials = pool.channel::<i64>("partials");
    pool.add_source("integers", IterSource::new(0..items as i64, batch_size), &values);
    pool.add_transform(
        "alternating-sum",
        &values,
        |batch: Vec<i64>| -> Result<Vec<i64>, TaskError> {
            Ok(vec![batch.iter().map(|v| if v % 2 == 0 { *v } else { -v }).sum()])
        },
        Some(&partials),
    );

    let report = pool.run().context("pipeline failed")?;
    info!(items, batch_size, workers, "pipeline finished");

    let mut sum = 0i64;
    for batch in partials.consume() {
        sum += batch.context("failed to read pipeline output")?.iter().sum::<i64>();
    }

    let output = PipelineOutput {
        items,
        batch_size,
        workers,
        sum,
        expected: expected_alternating_sum(items),
        tasks: report.tasks,
        metrics: metrics.snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Closed form of `sum((-1)^i * i)` for `i` in `0..n`.
fn expected_alternating_sum(n: u64) -> i64 {
    let n = n as i64;
    if n % 2 == 0 {
        -(n / 2)
    } else {
        n / 2
    }
}

fn run_cache(config: &CacheConfig, resources: u32, size: usize, passes: u32) -> Result<()> {
    ensure!(resources > 0, "--resources must be >= 1");

    let metrics = Arc::new(InMemoryMetrics::new());
    let mut builder = Builder::with_metrics(metrics.clone());
    let handles: Vec<_> = (0..resources).map(|i| builder.register(vec![i as u8; size])).collect();
    let cache = builder.build_with_config(config).context("failed to build cache")?;

    for _ in 0..passes {
        for (i, handle) in handles.iter().enumerate() {
            let blob = cache
                .get(*handle)
                .with_context(|| format!("failed to access resource {i}"))?;
            ensure!(
                blob.len() == size && blob.iter().all(|b| *b == i as u8),
                "resource {i} came back with different contents"
            );
        }
    }

    let stats = cache.stats();
    info!(resources, passes, evictions = stats.evictions, "cache run finished");
    let output = CacheOutput {
        resources,
        size,
        passes,
        hit_rate: stats.hit_rate(),
        stats,
        metrics: metrics.snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_alternating_sum() {
        let brute = |n: i64| (0..n).map(|i| if i % 2 == 0 { i } else { -i }).sum::<i64>();
        for n in 0..50 {
            assert_eq!(expected_alternating_sum(n as u64), brute(n), "n={n}");
        }
        assert_eq!(expected_alternating_sum(1_000_000), -500_000);
    }

    #[test]
    fn test_file_config_tables_are_optional() {
        let config: FileConfig = toml::from_str("[pipeline]\nnum_workers = 2\n").unwrap();
        assert!(config.cache.is_none());
        assert_eq!(config.pipeline.unwrap().num_workers, 2);

        let config: FileConfig = toml::from_str("[cache]\nmemory_budget_mb = 1\n").unwrap();
        assert_eq!(config.cache.unwrap().memory_budget, 1024 * 1024);
    }
}
