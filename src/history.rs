//! Run history: one entry per completed backup run, persisted in settings
//! and surfaced by the `status`/`history` CLI subcommands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal outcome of a backup run (spec §3 "Backup progress").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub account_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    pub messages_downloaded: u64,
    pub messages_skipped_existing: u64,
    pub bytes_written: u64,
    /// Human-readable error summaries, one per folder or fatal failure.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl HistoryEntry {
    #[cfg(test)]
    pub fn new_for_test(i: u32) -> Self {
        let now = DateTime::<Utc>::from_timestamp(1_700_000_000 + i as i64, 0).unwrap();
        Self {
            account_id: format!("account-{i}"),
            started_at: now,
            ended_at: now,
            status: RunStatus::Completed,
            messages_downloaded: 0,
            messages_skipped_existing: 0,
            bytes_written: 0,
            errors: Vec::new(),
        }
    }
}
