//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Tasks whose artifact was produced and uploaded
    pub tasks_published: AtomicU64,

    /// Tasks skipped because the artifact already existed
    pub tasks_skipped: AtomicU64,

    /// Tasks that failed
    pub tasks_failed: AtomicU64,

    /// Total bytes written by the warp tool
    pub bytes_warped: AtomicU64,

    /// Total bytes uploaded
    pub bytes_uploaded: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-step timing (in microseconds for precision)
    /// Time spent in existence probes (microseconds)
    pub probe_us: AtomicU64,

    /// Time spent in the warp tool (microseconds)
    pub warp_us: AtomicU64,

    /// Time spent uploading (microseconds)
    pub upload_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_task_published(&self) {
        self.tasks_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_task_skipped(&self) {
        self.tasks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_warped(&self, bytes: u64) {
        self.bytes_warped.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_probe_time(&self, duration: Duration) {
        self.probe_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_warp_time(&self, duration: Duration) {
        self.warp_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_upload_time(&self, duration: Duration) {
        self.upload_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get upload throughput in MB/s.
    pub fn upload_throughput_mbps(&self) -> f64 {
        let bytes = self.bytes_uploaded.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (bytes as f64) / (1024.0 * 1024.0) / elapsed
        } else {
            0.0
        }
    }

    /// Get published tasks per minute.
    pub fn tasks_per_minute(&self) -> f64 {
        let tasks = self.tasks_published.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            tasks as f64 / elapsed * 60.0
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_published: self.tasks_published.load(Ordering::Relaxed),
            tasks_skipped: self.tasks_skipped.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            bytes_warped: self.bytes_warped.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            upload_throughput_mbps: self.upload_throughput_mbps(),
            tasks_per_minute: self.tasks_per_minute(),
            probe_secs: self.probe_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            warp_secs: self.warp_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            upload_secs: self.upload_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_published: u64,
    pub tasks_skipped: u64,
    pub tasks_failed: u64,
    pub bytes_warped: u64,
    pub bytes_uploaded: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub upload_throughput_mbps: f64,
    pub tasks_per_minute: f64,
    /// Total time spent probing (seconds, summed across tasks)
    pub probe_secs: f64,
    /// Total time spent warping (seconds, summed across tasks)
    pub warp_secs: f64,
    /// Total time spent uploading (seconds, summed across tasks)
    pub upload_secs: f64,
}

impl MetricsSnapshot {
    /// Tasks that reached a final state.
    pub fn tasks_done(&self) -> u64 {
        self.tasks_published + self.tasks_skipped + self.tasks_failed
    }

    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_step_time = self.probe_secs + self.warp_secs + self.upload_secs;
        let (probe_pct, warp_pct, upload_pct) = if total_step_time > 0.0 {
            (
                self.probe_secs / total_step_time * 100.0,
                self.warp_secs / total_step_time * 100.0,
                self.upload_secs / total_step_time * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Tasks: {} published, {} skipped, {} failed | \
             Uploaded: {:.2} GB @ {:.1} MB/s | Rate: {:.1} tasks/min | Elapsed: {:.1}s | \
             Time: probe {:.0}% | warp {:.0}% | upload {:.0}%",
            self.tasks_published,
            self.tasks_skipped,
            self.tasks_failed,
            self.bytes_uploaded as f64 / (1024.0 * 1024.0 * 1024.0),
            self.upload_throughput_mbps,
            self.tasks_per_minute,
            self.elapsed.as_secs_f64(),
            probe_pct,
            warp_pct,
            upload_pct,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_tasks: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_tasks: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_tasks,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("[{:.1}%] {}", self.progress_percent(&snapshot), snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    fn progress_percent(&self, snapshot: &MetricsSnapshot) -> f64 {
        if self.total_tasks > 0 {
            snapshot.tasks_done() as f64 / self.total_tasks as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Re-tiling Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Tasks: {}", self.total_tasks);
        println!("Published: {}", snapshot.tasks_published);
        println!("Already published: {}", snapshot.tasks_skipped);
        println!("Failed: {}", snapshot.tasks_failed);
        println!(
            "Data uploaded: {:.2} GB",
            snapshot.bytes_uploaded as f64 / (1024.0 * 1024.0 * 1024.0)
        );
        println!("Upload throughput: {:.1} MB/s", snapshot.upload_throughput_mbps);

        let total_step = snapshot.probe_secs + snapshot.warp_secs + snapshot.upload_secs;
        if total_step > 0.0 {
            println!("\n--- Step Time Breakdown ---");
            println!("Probe:   {:>9.1}s ({:>5.1}%)", snapshot.probe_secs, snapshot.probe_secs / total_step * 100.0);
            println!("Warp:    {:>9.1}s ({:>5.1}%)", snapshot.warp_secs, snapshot.warp_secs / total_step * 100.0);
            println!("Upload:  {:>9.1}s ({:>5.1}%)", snapshot.upload_secs, snapshot.upload_secs / total_step * 100.0);
        }
        println!("=========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_published: 80,
            tasks_skipped: 15,
            tasks_failed: 5,
            bytes_warped: 2 * 1024 * 1024 * 1024,
            bytes_uploaded: 1024 * 1024 * 1024,
            elapsed: Duration::from_secs(100),
            upload_throughput_mbps: 10.24,
            tasks_per_minute: 48.0,
            probe_secs: 1.0,
            warp_secs: 8.0,
            upload_secs: 1.0,
        }
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.add_task_published();
        metrics.add_task_published();
        metrics.add_task_skipped();
        metrics.add_task_failed();
        metrics.add_bytes_uploaded(1000);
        metrics.add_bytes_uploaded(500);
        metrics.add_bytes_warped(1500);

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.tasks_published, 2);
        assert_eq!(snapshot.tasks_skipped, 1);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.tasks_done(), 4);
        assert_eq!(snapshot.bytes_uploaded, 1500);
        assert_eq!(snapshot.bytes_warped, 1500);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = Metrics::new();

        metrics.add_probe_time(Duration::from_millis(100));
        metrics.add_warp_time(Duration::from_millis(50));
        metrics.add_upload_time(Duration::from_millis(25));

        let snapshot = metrics.snapshot();

        assert!((snapshot.probe_secs - 0.1).abs() < 0.001);
        assert!((snapshot.warp_secs - 0.05).abs() < 0.001);
        assert!((snapshot.upload_secs - 0.025).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let display = format!("{}", snapshot());

        assert!(display.contains("80 published"));
        assert!(display.contains("15 skipped"));
        assert!(display.contains("5 failed"));
        assert!(display.contains("warp 80%"));
    }

    #[test]
    fn test_snapshot_serializes_elapsed_as_seconds() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(json["elapsed"], 100.0);
        assert_eq!(json["tasks_published"], 80);
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };

        metrics.add_bytes_uploaded(1000);

        assert_eq!(metrics.upload_throughput_mbps(), 0.0);
        assert_eq!(metrics.tasks_per_minute(), 0.0);
    }

    #[test]
    fn test_progress_percent() {
        let reporter = MetricsReporter::new(Metrics::new(), 10, 200);
        assert!((reporter.progress_percent(&snapshot()) - 50.0).abs() < 1e-9);

        let empty = MetricsReporter::new(Metrics::new(), 10, 0);
        assert_eq!(empty.progress_percent(&snapshot()), 0.0);
    }
}
