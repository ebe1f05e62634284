use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::peers::{CorroborationOutcome, CorroborationRecord};
use crate::publish::PushReport;
use crate::worktree::write_atomically;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    /// First commit on an empty branch
    Bootstrap,
    Corroborated,
    Forced,
    /// No peers are configured, so nothing to wait for
    Uncorroborated,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub branch: String,
    pub outcome: CorroborationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stamp_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&CorroborationRecord> for PeerSummary {
    fn from(record: &CorroborationRecord) -> Self {
        Self {
            branch: record.peer.branch_name.clone(),
            outcome: record.outcome,
            stamp_commit: record.stamp_commit.clone(),
            error: record.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// What happened in the last scheduling cycle. Also carries the force
/// counter so it survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub trigger: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub kind: CycleKind,
    pub commit: Option<String>,
    pub corroborations: Vec<PeerSummary>,
    pub pushes: Vec<PushReport>,
    pub force_elapsed: u32,
    pub consecutive_forced: u32,
    pub mail_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn save_report(report: &CycleReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let json = serde_json::to_string_pretty(report)?;
    write_atomically(path, json.as_bytes())
        .with_context(|| format!("Failed to write status file {}", path.display()))?;
    Ok(())
}

/// Load the previous report. A missing file is not an error; a corrupt one
/// is reported and ignored.
pub fn load_report(path: &Path) -> Result<Option<CycleReport>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read status file {}", path.display()))
        }
    };

    match serde_json::from_str::<CycleReport>(&contents) {
        Ok(report) => Ok(Some(report)),
        Err(e) => {
            tracing::warn!("Ignoring unreadable status file {}: {}", path.display(), e);
            Ok(None)
        }
    }
}
