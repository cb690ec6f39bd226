//! Named job commands executed through the command executor.

pub mod acquire;
pub mod exclusive;
pub mod retry;
pub mod unacquire;

pub use acquire::{AcquireJobsCmd, AcquireTimerJobsCmd};
pub use exclusive::{LockExclusiveJobCmd, UnlockExclusiveJobCmd};
pub use retry::DefaultJobRetryCmd;
pub use unacquire::UnacquireOwnedJobsCmd;
