//! `forgeflow-executor` — asynchronous job acquisition, locking, and
//! execution.
//!
//! Multiple engine instances share one job store; each runs an
//! [`AsyncExecutor`](async_executor::AsyncExecutor) that claims due jobs
//! under row-level optimistic locks, dispatches them to a bounded worker
//! pool, and routes failures to retry or dead-letter handling. At most one
//! instance holds a live lock on a given job row at any time; the losing
//! side of any race simply yields and picks up other work on its next poll.

pub mod async_executor;
pub mod command;
pub mod commands;
pub mod config;
pub mod execution;
pub mod handler;
pub mod lock;
pub mod manager;
pub mod pool;
pub mod runnables;
pub mod store;
pub mod wait;

pub use async_executor::{AsyncExecutor, ExecutorMetrics};
pub use command::{Command, CommandConfig, CommandContext, CommandExecutor, TransactionPropagation};
pub use config::AsyncExecutorConfig;
pub use execution::{DefaultRetryCommandFactory, FailedJobHandler, RetryCommandFactory};
pub use handler::{JobHandler, JobHandlerRegistry, NoRepeat, RepeatSchedule};
pub use manager::JobManager;
pub use pool::{FixedWorkerPool, TaskExecutor, TaskRejected};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
