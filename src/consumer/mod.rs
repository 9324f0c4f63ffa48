//! Consumer runtime: batching, commit handling and worker supervision
//!
//! Every scanned binding gets a worker. The worker reads from its own
//! subscription, groups messages into batches, hands each batch to the
//! binding's handler and commits according to the binding's
//! [`CommitStrategy`](crate::config::CommitStrategy). The [`Supervisor`]
//! restarts failed workers with backoff and shuts them all down on request.

pub mod batch;
pub mod context;
pub mod dlq;
pub(crate) mod lifecycle;
pub mod metrics;
pub mod retry;
pub mod shutdown;
pub mod supervisor;
pub(crate) mod worker;

pub use batch::Batch;
pub use context::HandlerContext;
pub use dlq::{DeadLetterReason, DeadLetterSink, DLQ_HEADER_PREFIX};
pub use metrics::{ConsumerMetrics, MetricsSnapshot, ProcessingStats};
pub use retry::{RetryExecutor, RetryPolicy, RetryResult};
pub use shutdown::ShutdownState;
pub use supervisor::{BindingStatus, ShutdownReport, Supervisor, SupervisorState};
pub use worker::WorkerError;
