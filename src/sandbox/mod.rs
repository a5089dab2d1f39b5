//! Artifact execution.
//!
//! The sentinel never runs an artifact directly: it hands the path to an
//! [`Executor`] and gets back an [`ExecutionRecord`]. Today the only
//! implementation is [`HostExecutor`], which runs the artifact on the host
//! with the sentinel's own privileges, working directory and environment.
//! There is no isolation of any kind. An isolating executor (namespaces,
//! Landlock, seccomp, a throwaway VM) plugs in behind the same trait.

pub mod host;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use host::HostExecutor;

/// Why an artifact run did not complete cleanly.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The process never started (missing exec bit, bad format, ...)
    #[error("failed to start: {0}")]
    Launch(#[source] std::io::Error),
    #[error("exit status {0}")]
    Exit(i32),
    /// Terminated by a signal (unix only)
    #[error("terminated by signal {0}")]
    Signal(i32),
    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(std::time::Duration),
    /// The process ran but its exit could not be collected
    #[error("failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Outcome of a single artifact run.
///
/// `output` is the combined stdout/stderr stream exactly as the child
/// wrote it. It is kept even when `error` is set.
#[derive(Debug, Default)]
pub struct ExecutionRecord {
    pub output: Vec<u8>,
    pub error: Option<ExecutionError>,
}

impl ExecutionRecord {
    pub fn success(output: Vec<u8>) -> Self {
        Self {
            output,
            error: None,
        }
    }

    pub fn failure(output: Vec<u8>, error: ExecutionError) -> Self {
        Self {
            output,
            error: Some(error),
        }
    }

    /// Output decoded for the text log; invalid UTF-8 is replaced.
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Runs one artifact to completion (or until its time budget runs out).
///
/// Implementations never return an error: every failure is folded into
/// the record so the caller can log it and move on.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, path: &Path) -> ExecutionRecord;

    /// Short label for startup diagnostics, e.g. `"host (timeout 300s)"`.
    fn description(&self) -> String;
}
