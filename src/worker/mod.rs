//! Worker side of the protocol.
//!
//! # Components
//!
//! - [`Worker`]: a broker connection that registers functions and asks for
//!   jobs, sleeping between grabs until the broker sends NOOP
//! - [`JobExecution`]: a held job; sends progress and exactly one result
//! - [`ShellExecutor`]: maps function names to shell commands
//!
//! # Execution Flow
//!
//! 1. [`Worker::next_assignment`] sends GRAB_JOB_UNIQ
//! 2. On NO_JOB it sends PRE_SLEEP; the NOOP that wakes it issues the next grab
//! 3. [`ShellExecutor::run`] spawns `sh -c <command>` with the payload on stdin
//! 4. stdout, or stderr on failure, goes back as the job's terminal report
//!
//! # Security Note
//!
//! Commands are executed directly via shell without sandboxing.

pub mod execution;
pub mod executor;
pub mod session;

pub use execution::{Assignment, JobExecution};
pub use executor::{ExecutionResult, ExecutionStatus, ShellExecutor};
pub use session::Worker;
