//! Process job handles and the pool that recycles them.
//!
//! A [`JobHandle`] runs one external command, either blocking the caller
//! until it exits or finishing in the background, and reports the outcome
//! through callbacks and accessors. A [`HandlePool`] recycles handles.

mod error;
mod job;
mod pool;
mod report;

pub use error::JobError;
pub use job::{JobCallback, JobHandle};
pub use pool::{HandlePool, POOL_BASE_IDENTITY};
pub use report::{JobReport, JobStatus};
