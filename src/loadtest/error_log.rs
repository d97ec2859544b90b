//! Append-only JSON-lines log of failed query executions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::loadtest::error::LoadTestError;

/// One line of the error log.
#[derive(Debug, Serialize)]
pub struct ErrorLogEntry<'a> {
    pub timestamp: DateTime<Utc>,
    pub worker_id: usize,
    pub query: &'a str,
    /// Which execution path failed, e.g. `"fetch"` or `"execute"`.
    pub operation: &'a str,
    pub error: &'a str,
}

/// Shared handle to the error log file. Writes are serialized by a mutex so
/// lines from different workers never interleave.
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ErrorLog {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn open(path: &Path) -> Result<Self, LoadTestError> {
        let io_err = |source: std::io::Error| LoadTestError::MetricsIo {
            source,
            path: path.display().to_string(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Failures are logged and swallowed.
    pub fn append(&self, entry: &ErrorLogEntry<'_>) {
        let mut line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode error log entry");
                return;
            },
        };
        line.push('\n');

        let mut file = self.file.lock();
        if let Err(e) = file.write_all(line.as_bytes()) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to append to error log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_one_json_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("errors.jsonl");
        let log = ErrorLog::open(&path).unwrap();
        assert_eq!(log.path(), path.as_path());

        for worker_id in 0..3 {
            log.append(&ErrorLogEntry {
                timestamp: Utc::now(),
                worker_id,
                query: "orders",
                operation: "fetch",
                error: "relation \"orders\" does not exist",
            });
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["worker_id"], 0);
        assert_eq!(first["query"], "orders");
        assert_eq!(first["operation"], "fetch");
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.jsonl");
        let entry = ErrorLogEntry {
            timestamp: Utc::now(),
            worker_id: 1,
            query: "q",
            operation: "execute",
            error: "timeout",
        };

        ErrorLog::open(&path).unwrap().append(&entry);
        ErrorLog::open(&path).unwrap().append(&entry);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
