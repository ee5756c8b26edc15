//! Bounded fan-out of tasks.
//!
//! The scheduler drives every descriptor through the [`TaskProcessor`] with at
//! most `concurrency` tasks in flight. Outcomes are collected, never
//! propagated: one failed task does not stop the batch.

use crate::pipeline::{Metrics, MetricsReporter, TaskError, TaskOutcome, TaskProcessor, TaskReport};
use crate::task::{RejectedRow, TaskDescriptor};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of tasks in flight
    pub concurrency: usize,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    pub metrics_output_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 70,
            enable_metrics: true,
            metrics_interval_secs: 30,
            metrics_output_path: None,
        }
    }
}

/// Scheduler for distributing tasks across async workers.
pub struct Scheduler {
    processor: Arc<TaskProcessor>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(processor: Arc<TaskProcessor>, metrics: Arc<Metrics>, config: SchedulerConfig) -> Self {
        Self {
            processor,
            metrics,
            config,
        }
    }

    /// Run every task to a final state.
    pub async fn run(&self, tasks: Vec<TaskDescriptor>) -> BatchSummary {
        let total_tasks = tasks.len();
        let concurrency = self.config.concurrency.max(1);

        tracing::info!(
            "Scheduling {} tasks for processing ({} concurrent)",
            total_tasks,
            concurrency
        );

        // Start metrics reporter if enabled
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                total_tasks as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let processor = self.processor.clone();

        let reports: Vec<TaskReport> = stream::iter(tasks)
            .map(|task| {
                let processor = processor.clone();
                async move { processor.process(task).await }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        // Shutdown metrics reporter
        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        let folders = touched_folders(&reports, self.processor.work_dir());
        if let Err(e) = tokio::task::spawn_blocking(move || prune_folders(folders)).await {
            tracing::warn!("Tile folder cleanup did not finish: {}", e);
        }

        let mut summary = BatchSummary::default();
        for report in reports {
            summary.record(report);
        }

        if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                total_tasks as u64,
            );
            reporter.print_summary();

            if let Some(ref path) = self.config.metrics_output_path {
                let snapshot = self.metrics.snapshot();
                if let Err(e) = snapshot.save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        summary
    }
}

/// Tile folders this batch wrote into: those of tasks that reached the warp step.
fn touched_folders(reports: &[TaskReport], work_dir: &std::path::Path) -> BTreeSet<PathBuf> {
    reports
        .iter()
        .filter(|report| {
            matches!(
                report.result,
                Ok(TaskOutcome::Published { .. }) | Err(TaskError::Invoke(_)) | Err(TaskError::Publish(_))
            )
        })
        .filter_map(|report| report.address.local_path.parent())
        .filter(|folder| folder.starts_with(work_dir) && *folder != work_dir)
        .map(PathBuf::from)
        .collect()
}

/// Remove the given folders if they are empty.
fn prune_folders(folders: BTreeSet<PathBuf>) {
    for folder in folders {
        // Fails harmlessly when something is still inside
        if std::fs::remove_dir(&folder).is_ok() {
            tracing::debug!("Removed empty tile folder {}", folder.display());
        }
    }
}

/// A task that ended in failure.
#[derive(Debug, Clone)]
pub struct FailedTask {
    /// Artifact key the task was producing
    pub key: String,

    /// Rendered error chain
    pub error: String,
}

/// Aggregate result of a batch.
#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Tasks dispatched
    pub total_tasks: usize,

    /// Tasks whose artifact was produced and uploaded
    pub published: usize,

    /// Tasks skipped because their artifact already existed
    pub already_published: usize,

    /// Bytes uploaded by this run
    pub bytes_uploaded: u64,

    /// Tasks that failed
    pub failed: Vec<FailedTask>,

    /// Catalog rows that never became tasks
    pub rejected: Vec<RejectedRow>,
}

impl BatchSummary {
    fn record(&mut self, report: TaskReport) {
        self.total_tasks += 1;
        match report.result {
            Ok(TaskOutcome::Published { bytes }) => {
                self.published += 1;
                self.bytes_uploaded += bytes;
            }
            Ok(TaskOutcome::AlreadyPublished) => self.already_published += 1,
            Err(e) => self.failed.push(FailedTask {
                key: report.address.key,
                error: e.to_string(),
            }),
        }
    }

    /// Whether the batch needs another run.
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty() || !self.rejected.is_empty()
    }

    /// Log every failure, one line each.
    pub fn log_failures(&self) {
        for row in &self.rejected {
            tracing::warn!(row = row.row, "Rejected catalog row: {}", row.reason);
        }
        for failure in &self.failed {
            tracing::warn!(address = %failure.key, "Failed: {}", failure.error);
        }
    }
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Published: {}, Already published: {}, Failed: {}, Rejected rows: {}, Total: {}",
            self.published,
            self.already_published,
            self.failed.len(),
            self.rejected.len(),
            self.total_tasks
        )
    }
}
