//! Backup pipeline (spec §4.6): drives one account's session through every
//! folder, downloading messages the local store doesn't already have.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::account;
use crate::config::{AccountConfig, Settings};
use crate::history::HistoryEntry;
use crate::progress::{ProgressEvent, ProgressSink, RunTotals};
use crate::ratelimit::RateLimitCoordinator;
use crate::session::ClientSession;
use crate::store::FolderStore;

/// Runs a single account's backup to completion (or until cancelled),
/// returning the totals recorded into run history.
pub async fn run_account(
    account: &AccountConfig,
    settings: &Settings,
    rate_limit: Arc<RateLimitCoordinator>,
    progress: &dyn ProgressSink,
    cancel: CancellationToken,
) -> HistoryEntry {
    let started_at = Utc::now();
    let mut totals = RunTotals::default();

    progress.on_event(ProgressEvent::AccountStarted {
        account_id: account.id.clone(),
    });

    if let Err(e) = run_account_inner(account, settings, rate_limit, progress, &cancel, &mut totals).await {
        totals.record_error(e.to_string());
        progress.on_event(ProgressEvent::Error {
            account_id: account.id.clone(),
            folder: None,
            message: e.to_string(),
        });
    }

    let status = if cancel.is_cancelled() {
        crate::history::RunStatus::Cancelled
    } else {
        totals.status()
    };

    progress.on_event(ProgressEvent::AccountCompleted {
        account_id: account.id.clone(),
        status,
    });

    HistoryEntry {
        account_id: account.id.clone(),
        started_at,
        ended_at: Utc::now(),
        status,
        messages_downloaded: totals.messages_downloaded,
        messages_skipped_existing: totals.messages_skipped_existing,
        bytes_written: totals.bytes_written,
        errors: totals.errors,
    }
}

async fn run_account_inner(
    account: &AccountConfig,
    settings: &Settings,
    rate_limit: Arc<RateLimitCoordinator>,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
    totals: &mut RunTotals,
) -> anyhow::Result<()> {
    let credentials = account::resolve_credentials(account).await?;
    let params = account::connection_params(account, settings.global_rate_limit);

    let mut session = ClientSession::new(params, credentials, cancel.clone(), rate_limit);
    session.connect().await?;

    let folders = session.list_folders().await?;

    for folder in folders {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = sync_folder(&mut session, account, settings, &folder, progress, totals).await {
            totals.record_error(format!("{folder}: {e}"));
            progress.on_event(ProgressEvent::Error {
                account_id: account.id.clone(),
                folder: Some(folder.clone()),
                message: e.to_string(),
            });
        }
    }

    session.logout().await.ok();
    Ok(())
}

async fn sync_folder(
    session: &mut ClientSession,
    account: &AccountConfig,
    settings: &Settings,
    folder: &str,
    progress: &dyn ProgressSink,
    totals: &mut RunTotals,
) -> anyhow::Result<()> {
    let store = FolderStore::prepare(&settings.backup_root, &account.id, folder).await?;
    let known = store.known_uids().await?;

    session.select_folder(folder).await?;
    let server_uids = session.search_all_uids().await?;
    let missing: Vec<u32> = server_uids.iter().copied().filter(|uid| !known.contains(uid)).collect();

    progress.on_event(ProgressEvent::FolderStarted {
        account_id: account.id.clone(),
        folder: folder.to_string(),
        total_messages: missing.len() as u64,
    });

    for uid in missing {
        let fetch_time = Utc::now();
        let size = session.fetch_message_size(uid).await.unwrap_or(0);

        if size > settings.stream_threshold_bytes {
            let tmp_path = store.reserve_streaming_path(uid, fetch_time).await?;
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            let bytes = session.stream_message_to_writer(uid, &mut file).await?;
            drop(file);
            store.finalize_streaming_path(uid, &tmp_path).await?;
            totals.record_downloaded(bytes);
        } else {
            let (body, _) = session.fetch_message(uid).await?;
            store.write_message(uid, &body, fetch_time).await?;
            totals.record_downloaded(body.len() as u64);
        }

        progress.on_event(ProgressEvent::MessageDownloaded {
            account_id: account.id.clone(),
            folder: folder.to_string(),
            bytes: totals.bytes_written,
        });
    }

    let skipped = server_uids.iter().filter(|uid| known.contains(uid)).count();
    for _ in 0..skipped {
        totals.record_skipped();
    }

    progress.on_event(ProgressEvent::FolderCompleted {
        account_id: account.id.clone(),
        folder: folder.to_string(),
    });

    Ok(())
}
