pub mod audit;
pub mod scan;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::sandbox::Executor;

use audit::AuditLog;
use scan::Candidate;

/// Counters for one cycle, mostly for tests and the `--once` summary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// The directory could not be listed; nothing else was attempted
    pub scan_failed: bool,
    pub executed: usize,
    /// Runs that ended with an execution error (launch, exit, signal, timeout)
    pub failed: usize,
    pub deleted: usize,
    pub delete_failed: usize,
}

/// Creates the watch directory if it is missing.
///
/// Called once at startup; an error here is fatal for the process.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(anyhow!("{} exists and is not a directory", path.display()));
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory {}", path.display()))?;
    info!("Created watch directory {}", path.display());
    Ok(())
}

/// The watch/execute/log/cleanup loop.
///
/// Everything happens on one task: a cycle lists the watch directory,
/// runs each matching artifact to completion, logs it, deletes it, and
/// only then moves on to the next one. Failures are written to the audit
/// log and never leave the loop.
pub struct Sentinel {
    config: Config,
    executor: Arc<dyn Executor>,
    audit: AuditLog,
}

impl Sentinel {
    pub fn new(config: Config, executor: Arc<dyn Executor>) -> Self {
        let audit = AuditLog::new(config.log_file.clone());
        Self {
            config,
            executor,
            audit,
        }
    }

    /// Runs cycles forever, sleeping `interval` between them.
    pub async fn run(&self) {
        info!(
            "Watching {} for *{} every {}s, auditing to {}",
            self.config.watch_dir.display(),
            self.config.marker,
            self.config.interval_secs,
            self.audit.path().display()
        );
        loop {
            let report = self.run_cycle().await;
            debug!("Cycle done: {report:?}");
            tokio::time::sleep(self.config.interval()).await;
        }
    }

    /// One pass over the watch directory.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let candidates = match scan::scan(&self.config.watch_dir, &self.config.marker) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("{e:#}");
                self.audit.append(&format!("{e:#}"));
                report.scan_failed = true;
                return report;
            }
        };

        for candidate in &candidates {
            self.process(candidate, &mut report).await;
        }
        report
    }

    /// Discovered → Executing → Logged → Deleted / DeleteFailed.
    ///
    /// Deletion is attempted whatever the execution outcome, including
    /// when the artifact never started.
    async fn process(&self, candidate: &Candidate, report: &mut CycleReport) {
        let path = candidate.path.display();

        info!("Executing: {path}");
        self.audit.append(&format!("Executing: {path}"));

        let record = self.executor.execute(&candidate.path).await;
        report.executed += 1;

        self.audit
            .append(&format!("Output from {path}:\n{}", record.output_text()));
        if let Some(e) = &record.error {
            warn!("Execution error for {path}: {e}");
            self.audit.append(&format!("Execution error: {e}"));
            report.failed += 1;
        }

        match std::fs::remove_file(&candidate.path) {
            Ok(()) => {
                info!("Deleted: {path}");
                self.audit.append(&format!("Deleted: {path}"));
                report.deleted += 1;
            }
            Err(e) => {
                warn!("Error deleting {path}: {e}");
                self.audit.append(&format!("Error deleting: {path} - {e}"));
                report.delete_failed += 1;
            }
        }
    }
}
