//! Verification & repair (spec §4.7): compare the server's UID set against
//! what's on disk, report the two asymmetric differences, and optionally
//! repair by downloading what's missing locally and pruning what's gone
//! from the server.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::account;
use crate::config::{AccountConfig, Settings};
use crate::ratelimit::RateLimitCoordinator;
use crate::session::ClientSession;
use crate::store::{self, FolderStore};

#[derive(Debug, Default)]
pub struct FolderReport {
    pub folder: String,
    pub missing_locally: Vec<u32>,
    pub deleted_on_server: Vec<u32>,
    pub repaired: u64,
    pub pruned: u64,
}

/// Verify every folder of `account`, repairing divergences in place when
/// `repair` is set.
pub async fn verify_account(
    account: &AccountConfig,
    settings: &Settings,
    rate_limit: Arc<RateLimitCoordinator>,
    cancel: CancellationToken,
    repair: bool,
) -> anyhow::Result<Vec<FolderReport>> {
    let credentials = account::resolve_credentials(account).await?;
    let params = account::connection_params(account, settings.global_rate_limit);
    let mut session = ClientSession::new(params, credentials, cancel.clone(), rate_limit);
    session.connect().await?;

    let folders = session.list_folders().await?;
    let mut reports = Vec::new();

    for folder in folders {
        if cancel.is_cancelled() {
            break;
        }
        let report = verify_folder(&mut session, account, settings, &folder, repair).await?;
        reports.push(report);
    }

    session.logout().await.ok();
    Ok(reports)
}

async fn verify_folder(
    session: &mut ClientSession,
    account: &AccountConfig,
    settings: &Settings,
    folder: &str,
    repair: bool,
) -> anyhow::Result<FolderReport> {
    let folder_store = FolderStore::prepare(&settings.backup_root, &account.id, folder).await?;
    let local: HashSet<u32> = folder_store.known_uids().await?;

    session.select_folder(folder).await?;
    let server: HashSet<u32> = session.search_all_uids().await?.into_iter().collect();

    let missing_locally: Vec<u32> = server.difference(&local).copied().collect();
    let deleted_on_server: Vec<u32> = local.difference(&server).copied().collect();

    let mut report = FolderReport {
        folder: folder.to_string(),
        missing_locally: missing_locally.clone(),
        deleted_on_server: deleted_on_server.clone(),
        repaired: 0,
        pruned: 0,
    };

    if repair {
        for uid in &missing_locally {
            let (body, _) = session.fetch_message(*uid).await?;
            folder_store.write_message(*uid, &body, Utc::now()).await?;
            report.repaired += 1;
        }
        let removed = store::cleanup_orphans(&folder_store, &server).await?;
        report.pruned = removed.len() as u64;
    }

    Ok(report)
}
