//! Backup progress reporting (spec §3, §9 redesign note: progress is a
//! one-way observer feed, never a control channel back into the pipeline).

use crate::history::RunStatus;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    AccountStarted {
        account_id: String,
    },
    FolderStarted {
        account_id: String,
        folder: String,
        total_messages: u64,
    },
    MessageDownloaded {
        account_id: String,
        folder: String,
        bytes: u64,
    },
    MessageSkippedExisting {
        account_id: String,
        folder: String,
    },
    FolderCompleted {
        account_id: String,
        folder: String,
    },
    AccountCompleted {
        account_id: String,
        status: RunStatus,
    },
    Error {
        account_id: String,
        folder: Option<String>,
        message: String,
    },
}

/// One-way sink for progress events. The default `TracingProgressSink`
/// simply logs; a CLI front-end could implement this to draw a bar.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::AccountStarted { account_id } => {
                tracing::info!(account = %account_id, "backup started");
            }
            ProgressEvent::FolderStarted {
                account_id,
                folder,
                total_messages,
            } => {
                tracing::info!(account = %account_id, %folder, total_messages, "folder started");
            }
            ProgressEvent::MessageDownloaded {
                account_id,
                folder,
                bytes,
            } => {
                tracing::debug!(account = %account_id, %folder, bytes, "message downloaded");
            }
            ProgressEvent::MessageSkippedExisting { account_id, folder } => {
                tracing::trace!(account = %account_id, %folder, "message already present, skipped");
            }
            ProgressEvent::FolderCompleted { account_id, folder } => {
                tracing::info!(account = %account_id, %folder, "folder completed");
            }
            ProgressEvent::AccountCompleted { account_id, status } => {
                tracing::info!(account = %account_id, ?status, "backup finished");
            }
            ProgressEvent::Error {
                account_id,
                folder,
                message,
            } => {
                tracing::warn!(account = %account_id, folder = ?folder, %message, "backup error");
            }
        }
    }
}

/// Accumulates events into run totals for the history entry written at the
/// end of a run. Not itself a `ProgressSink` -- the pipeline updates it
/// directly alongside emitting events to the configured sink.
#[derive(Debug, Default, Clone)]
pub struct RunTotals {
    pub messages_downloaded: u64,
    pub messages_skipped_existing: u64,
    pub bytes_written: u64,
    pub errors: Vec<String>,
}

impl RunTotals {
    pub fn record_downloaded(&mut self, bytes: u64) {
        self.messages_downloaded += 1;
        self.bytes_written += bytes;
    }

    pub fn record_skipped(&mut self) {
        self.messages_skipped_existing += 1;
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn status(&self) -> RunStatus {
        if self.errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        }
    }
}
