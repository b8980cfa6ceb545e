//! `.bot.pid`: singleton marker for a running bot instance.
//!
//! Written as JSON `{pid, startedAt, apiPort}`; older deployments wrote
//! a bare integer, which is still read.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidFile {
    pub pid: u32,
    /// Epoch milliseconds.
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_port: Option<u16>,
}

impl PidFile {
    pub fn current(api_port: Option<u16>) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now().timestamp_millis(),
            api_port,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize pid file")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(pid = self.pid, path = %path.display(), "pid file written");
        Ok(())
    }

    /// Read a pid file, accepting both the JSON shape and a legacy bare
    /// integer. `None` when the file does not exist or is unreadable.
    pub fn read(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        if let Ok(parsed) = serde_json::from_str::<PidFile>(&content) {
            return Some(parsed);
        }
        content.trim().parse::<u32>().ok().map(|pid| Self {
            pid,
            started_at: 0,
            api_port: None,
        })
    }

    pub fn remove(path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(error = %e, path = %path.display(), "pid file removal failed");
            }
        }
    }
}
