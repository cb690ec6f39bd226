//! `forgeflow-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the job record model, strongly-typed identifiers, and the error taxonomy
//! shared by the store and executor layers.

pub mod error;
pub mod id;
pub mod job;

pub use error::{JobServiceError, JobServiceResult};
pub use id::JobId;
pub use job::{DEFAULT_RETRIES, Job, JobKind, JobSet};
