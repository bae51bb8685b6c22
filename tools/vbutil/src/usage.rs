// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Usage log
//!
//! One line per invocation, appended to a file named on the command line.
//! The file is opened when the tool starts and the closing line is written
//! when the log is dropped, including on error returns.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;

/// Open usage log, or a no-op when no path was given
pub struct UsageLog {
    file: Option<(PathBuf, File)>,
    outcome: Option<String>,
}

impl UsageLog {
    /// Open `path` for appending and record the start of `command`
    pub fn open(path: Option<&Path>, command: &str) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::disabled());
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Could not open usage log {}", path.display()))?;
        writeln!(file, "{} start {}", timestamp(), command)
            .with_context(|| format!("Could not write usage log {}", path.display()))?;
        Ok(Self {
            file: Some((path.to_path_buf(), file)),
            outcome: None,
        })
    }

    /// Log that records nothing
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            file: None,
            outcome: None,
        }
    }

    /// Outcome written on close
    pub fn set_outcome(&mut self, outcome: impl Into<String>) {
        self.outcome = Some(outcome.into());
    }
}

impl Drop for UsageLog {
    fn drop(&mut self) {
        let Some((path, mut file)) = self.file.take() else {
            return;
        };
        let outcome = self.outcome.as_deref().unwrap_or("aborted");
        if let Err(e) = writeln!(file, "{} end {}", timestamp(), outcome).and_then(|()| file.flush())
        {
            log::warn!("usage log {} not closed cleanly: {e}", path.display());
        }
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("vbutil-{}-{name}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn test_disabled_log_writes_nothing() {
        let log = UsageLog::open(None, "show-gpt").unwrap();
        assert!(log.file.is_none());
    }

    #[test]
    fn test_closed_on_drop() {
        let path = scratch("drop");
        {
            let mut log = UsageLog::open(Some(&path), "verify-kernel").unwrap();
            log.set_outcome("ok");
        }
        {
            let _log = UsageLog::open(Some(&path), "nv-decode").unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("start verify-kernel"));
        assert!(lines[1].ends_with("end ok"));
        assert!(lines[2].ends_with("start nv-decode"));
        assert!(lines[3].ends_with("end aborted"));
        std::fs::remove_file(&path).unwrap();
    }
}
