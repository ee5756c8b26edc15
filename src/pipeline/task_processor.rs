//! Per-task processing.
//!
//! Every task runs the same short sequence:
//!
//! 1. Validate the descriptor
//! 2. Resolve its artifact address
//! 3. Probe the store; stop here if the artifact is already published
//! 4. Warp the source into the task's local output file
//! 5. Upload the output and remove the local copy
//!
//! A failure at any step ends that task only. Nothing is retried in place;
//! re-running the batch is the recovery path, and the probe turns every
//! finished task into a skip.

use crate::pipeline::Metrics;
use crate::remote::{ArtifactAddress, ArtifactResolver, GateDecision, IdempotencyGate, ProbeError, PublishError, Publisher};
use crate::task::{DescriptorError, TaskDescriptor};
use crate::warp::{InvokerError, ResamplingInvoker};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Why a task did not reach a final success state.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task: {0}")]
    Configuration(#[from] DescriptorError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("resampling failed: {0}")]
    Invoke(#[from] InvokerError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Successful end state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Output produced and uploaded
    Published { bytes: u64 },
    /// The artifact was already in the store
    AlreadyPublished,
}

/// Result of one task, tagged with the address it was working towards.
#[derive(Debug)]
pub struct TaskReport {
    pub address: ArtifactAddress,
    pub result: Result<TaskOutcome, TaskError>,
}

/// Runs the probe → warp → publish sequence for individual tasks.
pub struct TaskProcessor {
    resolver: ArtifactResolver,
    gate: IdempotencyGate,
    invoker: ResamplingInvoker,
    publisher: Publisher,
    metrics: Arc<Metrics>,
}

impl TaskProcessor {
    pub fn new(
        resolver: ArtifactResolver,
        gate: IdempotencyGate,
        invoker: ResamplingInvoker,
        publisher: Publisher,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            resolver,
            gate,
            invoker,
            publisher,
            metrics,
        }
    }

    /// Scratch directory local outputs are written under.
    pub fn work_dir(&self) -> &Path {
        self.resolver.work_dir()
    }

    /// Process a single task and record the outcome in the metrics.
    pub async fn process(&self, descriptor: TaskDescriptor) -> TaskReport {
        let address = self.resolver.resolve(&descriptor);
        let result = self.process_task(&descriptor, &address).await;

        match &result {
            Ok(TaskOutcome::Published { bytes }) => {
                self.metrics.add_task_published();
                tracing::info!(address = %address, bytes, "Published");
            }
            Ok(TaskOutcome::AlreadyPublished) => {
                self.metrics.add_task_skipped();
                tracing::info!(address = %address, "Already published, skipping");
            }
            Err(e) => {
                self.metrics.add_task_failed();
                tracing::error!(address = %address, source = %descriptor.source_path, "Task failed: {}", e);
            }
        }

        TaskReport { address, result }
    }

    async fn process_task(
        &self,
        descriptor: &TaskDescriptor,
        address: &ArtifactAddress,
    ) -> Result<TaskOutcome, TaskError> {
        descriptor.validate()?;

        let probe_start = Instant::now();
        let decision = self.gate.check(address).await;
        self.metrics.add_probe_time(probe_start.elapsed());

        if decision? == GateDecision::AlreadyPublished {
            return Ok(TaskOutcome::AlreadyPublished);
        }

        tracing::debug!(
            address = %address,
            resampling = %descriptor.resampling_method(),
            "Warping {}",
            descriptor.source_path
        );

        let warp_start = Instant::now();
        let warped = self.invoker.invoke(descriptor, &address.local_path).await;
        self.metrics.add_warp_time(warp_start.elapsed());
        self.metrics.add_bytes_warped(warped?);

        let upload_start = Instant::now();
        let uploaded = self.publisher.publish(address).await;
        self.metrics.add_upload_time(upload_start.elapsed());
        let bytes = uploaded?;
        self.metrics.add_bytes_uploaded(bytes);

        Ok(TaskOutcome::Published { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeFailurePolicy;
    use crate::pipeline::test_support::{descriptor, Harness};
    use crate::remote::ExistenceProbe;
    use crate::task::BoundingBox;
    use async_trait::async_trait;

    struct UnreachableProbe;

    #[async_trait]
    impl ExistenceProbe for UnreachableProbe {
        async fn exists(&self, address: &ArtifactAddress) -> Result<bool, ProbeError> {
            Err(ProbeError::Transient {
                target: address.url.clone(),
                reason: "timed out".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_missing_artifact_is_warped_and_published() {
        let harness = Harness::new();
        let task = descriptor("geomorphon_xyz.tif", "T001", "EXTRACONT_05");

        let report = harness.processor().process(task).await;

        assert_eq!(report.address.key, "latlon/v6/T001_aa.05/geomorphon_xyz.tif");
        assert_eq!(report.result.unwrap(), TaskOutcome::Published { bytes: 13 });
        assert_eq!(harness.runner.invocations(), 1);
        assert_eq!(harness.stored(&report.address.key).await.unwrap(), b"warped raster");
        assert!(!report.address.local_path.exists());
        assert!(harness.residue().is_empty());
    }

    #[tokio::test]
    async fn test_existing_artifact_is_skipped() {
        let harness = Harness::new();
        let task = descriptor("geomorphon_xyz.tif", "T001", "EXTRACONT_05");
        harness.publish_existing(&task).await;

        let report = harness.processor().process(task).await;

        assert_eq!(report.result.unwrap(), TaskOutcome::AlreadyPublished);
        assert_eq!(harness.runner.invocations(), 0);
        assert_eq!(harness.uploads(), 0);
        // The earlier object is untouched
        assert_eq!(harness.stored(&report.address.key).await.unwrap(), b"earlier run");
        assert_eq!(harness.metrics.snapshot().tasks_skipped, 1);
    }

    #[tokio::test]
    async fn test_warp_failure_publishes_nothing() {
        let harness = Harness::new();
        let task = descriptor("slope_fail.tif", "T001", "EU_03");

        let report = harness.processor().process(task).await;

        assert!(matches!(report.result, Err(TaskError::Invoke(InvokerError::ToolFailed { .. }))));
        assert_eq!(harness.uploads(), 0);
        assert!(harness.stored(&report.address.key).await.is_none());
        assert!(harness.residue().is_empty());
        assert_eq!(harness.metrics.snapshot().tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_invalid_descriptor_does_no_work() {
        let harness = Harness::new();
        let mut task = descriptor("slope_a.tif", "T001", "EU_03");
        task.bbox = BoundingBox::new(11.0, 20.0, 10.0, 21.0);

        let report = harness.processor().process(task).await;

        assert!(matches!(report.result, Err(TaskError::Configuration(_))));
        assert_eq!(harness.runner.invocations(), 0);
    }

    #[tokio::test]
    async fn test_name_escaping_work_dir_does_no_work() {
        let harness = Harness::new();

        for name in ["../../slope_up.tif", "/tmp/slope_abs.tif"] {
            let report = harness.processor().process(descriptor(name, "T001", "EU_01")).await;

            assert!(
                matches!(report.result, Err(TaskError::Configuration(DescriptorError::NotASegment { .. }))),
                "{} was processed",
                name
            );
            assert!(!report.address.local_path.exists());
        }
        assert_eq!(harness.runner.invocations(), 0);
        assert_eq!(harness.uploads(), 0);
        assert_eq!(harness.metrics.snapshot().tasks_failed, 2);
    }

    #[tokio::test]
    async fn test_escaped_file_name_is_found_on_rerun() {
        let harness = Harness::new();
        let task = descriptor("slope_a#1?.tif", "T001", "EU_01");

        let first = harness.processor().process(task.clone()).await;
        assert!(matches!(first.result, Ok(TaskOutcome::Published { .. })));

        let second = harness.processor().process(task).await;
        assert_eq!(second.result.unwrap(), TaskOutcome::AlreadyPublished);
        assert_eq!(harness.runner.invocations(), 1);
        assert_eq!(harness.uploads(), 1);
    }

    #[tokio::test]
    async fn test_probe_failure_fails_task_by_default() {
        let harness = Harness::new();
        let processor = harness.processor_with_probe(Arc::new(UnreachableProbe), ProbeFailurePolicy::Fail);

        let report = processor.process(descriptor("slope_a.tif", "T001", "EU_03")).await;

        assert!(matches!(report.result, Err(TaskError::Probe(_))));
        assert_eq!(harness.runner.invocations(), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_can_be_treated_as_missing() {
        let harness = Harness::new();
        let processor = harness.processor_with_probe(Arc::new(UnreachableProbe), ProbeFailurePolicy::TreatAsMissing);

        let report = processor.process(descriptor("slope_a.tif", "T001", "EU_03")).await;

        assert!(matches!(report.result, Ok(TaskOutcome::Published { .. })));
        assert_eq!(harness.runner.invocations(), 1);
    }
}
