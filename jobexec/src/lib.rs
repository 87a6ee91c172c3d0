//! Jobexec - run external processes as recyclable job handles.
//!
//! Architecture:
//! - `process::JobHandle` owns one process attempt: configuration, captured
//!   output, status and lifecycle callbacks
//! - `process::HandlePool` recycles handles and tags each with an identity
//! - `logging` installs the tracing subscriber used by the binaries

pub mod logging;
pub mod process;

pub use process::{
    HandlePool, JobCallback, JobError, JobHandle, JobReport, JobStatus, POOL_BASE_IDENTITY,
};
