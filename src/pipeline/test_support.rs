//! Fakes shared by the pipeline tests.

use crate::config::ProbeFailurePolicy;
use crate::config::WarpConfig;
use crate::pipeline::{Metrics, TaskProcessor};
use crate::remote::{
    ArtifactResolver, ArtifactUploader, ExistenceProbe, IdempotencyGate, ObjectStoreUploader, PublishError,
    Publisher, StoreProbe,
};
use crate::task::{BoundingBox, TaskDescriptor};
use crate::warp::{CommandRunner, ProcessOutput, ResamplingInvoker, WarpCommand};
use async_trait::async_trait;
use object_store::memory::InMemory;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const KEY_PREFIX: &str = "latlon/v6";

/// Stands in for gdalwarp. Output files whose name contains `fail` make it
/// exit non-zero without writing anything.
#[derive(Default)]
pub struct FakeRunner {
    pub invocations: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    in_flight: AtomicUsize,
    delay: Duration,
}

impl FakeRunner {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &WarpCommand) -> std::io::Result<ProcessOutput> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let output = command.args.last().expect("output argument");
        let failing = Path::new(output)
            .file_name()
            .is_some_and(|name| name.to_string_lossy().contains("fail"));
        if failing {
            return Ok(ProcessOutput {
                exit_code: Some(1),
                stderr: "ERROR 4: failed to open source".to_string(),
                ..Default::default()
            });
        }

        tokio::fs::write(output, b"warped raster").await?;
        Ok(ProcessOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

/// Counts uploads before handing them to an in-memory store.
pub struct CountingUploader {
    inner: ObjectStoreUploader,
    pub uploads: AtomicUsize,
}

#[async_trait]
impl ArtifactUploader for CountingUploader {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<u64, PublishError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.inner.upload(local_path, key).await
    }
}

/// An in-memory store, a scratch directory and fakes wired into a processor.
pub struct Harness {
    pub store: Arc<dyn ObjectStore>,
    pub runner: Arc<FakeRunner>,
    pub uploader: Arc<CountingUploader>,
    pub work_dir: TempDir,
    pub metrics: Arc<Metrics>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_runner(FakeRunner::default())
    }

    pub fn with_runner(runner: FakeRunner) -> Self {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        Self {
            uploader: Arc::new(CountingUploader {
                inner: ObjectStoreUploader::new(store.clone(), 1024 * 1024, 5 * 1024 * 1024),
                uploads: AtomicUsize::new(0),
            }),
            store,
            runner: Arc::new(runner),
            work_dir: TempDir::new().expect("temp dir"),
            metrics: Metrics::new(),
        }
    }

    pub fn resolver(&self) -> ArtifactResolver {
        ArtifactResolver::new(KEY_PREFIX, "http://store:8333", "tiles", self.work_dir.path()).expect("resolver")
    }

    pub fn processor(&self) -> TaskProcessor {
        self.processor_with_probe(
            Arc::new(StoreProbe::new(self.store.clone())),
            ProbeFailurePolicy::Fail,
        )
    }

    pub fn processor_with_probe(&self, probe: Arc<dyn ExistenceProbe>, policy: ProbeFailurePolicy) -> TaskProcessor {
        TaskProcessor::new(
            self.resolver(),
            IdempotencyGate::new(probe, policy),
            ResamplingInvoker::new(WarpConfig::default(), self.runner.clone()),
            Publisher::new(self.uploader.clone()),
            self.metrics.clone(),
        )
    }

    pub fn uploads(&self) -> usize {
        self.uploader.uploads.load(Ordering::SeqCst)
    }

    /// Put an object at the key `descriptor` resolves to.
    pub async fn publish_existing(&self, descriptor: &TaskDescriptor) {
        let key = self.resolver().resolve(descriptor).key;
        self.store
            .put(&object_store::path::Path::from(key), PutPayload::from_static(b"earlier run"))
            .await
            .expect("put");
    }

    pub async fn stored(&self, key: &str) -> Option<Vec<u8>> {
        match self.store.get(&object_store::path::Path::from(key)).await {
            Ok(result) => Some(result.bytes().await.expect("read").to_vec()),
            Err(_) => None,
        }
    }

    /// Files left anywhere under the work directory.
    pub fn residue(&self) -> Vec<std::path::PathBuf> {
        fn walk(dir: &Path, out: &mut Vec<std::path::PathBuf>) {
            for entry in std::fs::read_dir(dir).expect("read_dir").flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, out);
                } else {
                    out.push(path);
                }
            }
        }
        let mut out = Vec::new();
        if self.work_dir.path().exists() {
            walk(self.work_dir.path(), &mut out);
        }
        out
    }
}

pub fn descriptor(file_name: &str, source_tile: &str, target_tile: &str) -> TaskDescriptor {
    TaskDescriptor::new(
        file_name,
        format!("http://source:8333/equi7/{}/{}", target_tile, file_name),
        BoundingBox::new(10.0, 20.0, 11.0, 21.0),
        source_tile,
        target_tile,
    )
}

/// `count` distinct descriptors spread over a few target tiles.
pub fn descriptors(count: usize) -> Vec<TaskDescriptor> {
    (0..count)
        .map(|i| {
            descriptor(
                &format!("slope_{:03}.tif", i),
                &format!("T{:03}", i % 7),
                &format!("EXTRACONT_{:02}", i % 3),
            )
        })
        .collect()
}
