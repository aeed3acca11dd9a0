//! Job dispatch, completion polling and result aggregation.

mod aggregator;
mod dispatcher;
mod error_report;
mod metrics;
mod poller;
mod queue;
mod scheduler;


pub use aggregator::{count_output_records, MergedResult, ResultAggregator};
pub use dispatcher::{Dispatcher, LocalJobExit, SubmissionResult};
pub use error_report::{ErrorReporter, QueueWarning};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use poller::{CompletionPoller, CompletionWatcher, PollOutcome, SentinelWatcher};
pub use queue::{first_available_node, GridEngineClient, QueueAvailability, QueueClient};
pub use scheduler::{RunOutcome, RunReport, Scheduler, SchedulerStats, WorkEstimate};
