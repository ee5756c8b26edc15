//! Equi7 → lat/lon re-tiling pipeline
//!
//! Re-tiles a catalog of Equi7 rasters onto a WGS84 longitude/latitude grid
//! with `gdalwarp` and publishes each result to an S3-compatible object store.
//! Runs are idempotent: the store itself records what is done, so a batch can
//! be stopped, restarted, or run from several machines at once.
//!
//! # Architecture
//!
//! - **Task**: Catalog loading, shuffling and de-duplication of task descriptors
//! - **Remote**: Artifact identity, existence probes, S3 client and publisher
//! - **Warp**: `gdalwarp` command construction and invocation
//! - **Pipeline**: Bounded fan-out, per-task processing and metrics
//!
//! # Usage
//!
//! ```no_run
//! use equi7_retile::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let summary = run_pipeline(config).await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod pipeline;
pub mod remote;
pub mod task;
pub mod warp;

pub use config::{Config, ProbeFailurePolicy};
pub use pipeline::{BatchSummary, Metrics, Scheduler, SchedulerConfig, TaskProcessor};
pub use remote::{ArtifactAddress, ArtifactResolver};
pub use task::{Catalog, TaskDescriptor};

use anyhow::Result;
use remote::{ExistenceProbe, HttpProbe, IdempotencyGate, ObjectStoreUploader, Publisher, StoreProbe};
use std::sync::Arc;
use std::time::Duration;
use warp::{ProcessRunner, ResamplingInvoker};

/// Run the full re-tiling batch with the given configuration.
///
/// Individual task failures do not make this return an error; they are
/// listed in the returned [`BatchSummary`].
pub async fn run_pipeline(config: Config) -> Result<BatchSummary> {
    config.validate()?;

    tracing::info!("Starting Equi7 re-tiling pipeline");

    let output_store = remote::create_output_store(&config)?;

    let mut catalog = Catalog::load(&config.catalog, &config.store).await?;
    catalog.prepare(&config.catalog);

    if catalog.is_empty() && catalog.rejected().is_empty() {
        tracing::warn!("Catalog contains no tasks");
    }

    let probe: Arc<dyn ExistenceProbe> = if config.store.is_local() {
        Arc::new(StoreProbe::new(output_store.clone()))
    } else {
        Arc::new(HttpProbe::new(Duration::from_secs(config.processing.probe_timeout_secs))?)
    };

    tokio::fs::create_dir_all(&config.processing.work_dir).await?;
    tracing::info!("Local outputs go to {}", config.processing.work_dir.display());

    let metrics = Metrics::new();

    let processor = Arc::new(TaskProcessor::new(
        ArtifactResolver::from_config(&config)?,
        IdempotencyGate::new(probe, config.processing.probe_failure_policy),
        ResamplingInvoker::new(config.warp.clone(), Arc::new(ProcessRunner)),
        Publisher::new(Arc::new(ObjectStoreUploader::new(
            output_store,
            config.store.multipart_threshold_bytes(),
            config.store.multipart_part_size_bytes(),
        ))),
        metrics.clone(),
    ));

    let scheduler_config = SchedulerConfig {
        concurrency: config.processing.concurrency,
        enable_metrics: config.processing.enable_metrics,
        metrics_interval_secs: config.processing.metrics_interval_secs,
        metrics_output_path: config.processing.metrics_output_path.clone(),
    };

    let scheduler = Scheduler::new(processor, metrics, scheduler_config);

    let rejected = catalog.rejected().to_vec();
    let mut summary = scheduler.run(catalog.into_tasks()).await;
    summary.rejected = rejected;

    summary.log_failures();
    tracing::info!("Pipeline complete: {}", summary);

    Ok(summary)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
