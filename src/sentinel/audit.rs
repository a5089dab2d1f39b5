//! Append-only audit log.
//!
//! Every write opens the file in append/create mode, writes one record,
//! flushes and closes it again. No handle is held between writes, so the
//! file can be rotated or tailed freely and a crash leaves at worst a
//! truncated last record.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::error;

/// Same layout as the usual `YYYY/MM/DD HH:MM:SS` log prefix.
const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `<timestamp> <message>` as a single record. A trailing
    /// newline is added unless the message already ends with one.
    pub fn try_append(&self, message: &str) -> Result<()> {
        let mut line = format!("{} {}", chrono::Local::now().format(TIMESTAMP_FORMAT), message);
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Cannot open audit log {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Like [`try_append`](Self::try_append), but a failure only goes to
    /// the diagnostic log. The sentinel never stops because of its own log.
    pub fn append(&self, message: &str) {
        if let Err(e) = self.try_append(message) {
            error!("Audit log error: {e:#}");
        }
    }
}
