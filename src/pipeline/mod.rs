//! Task fan-out, per-task processing and progress metrics.

mod metrics;
mod scheduler;
mod task_processor;

#[cfg(test)]
mod test_support;

pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use scheduler::{BatchSummary, FailedTask, Scheduler, SchedulerConfig};
pub use task_processor::{TaskError, TaskOutcome, TaskProcessor, TaskReport};
