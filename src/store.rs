//! Filesystem message store (spec §4.5): one directory per account/folder,
//! one `.eml` file per message, an append-only `.uid_cache` sidecar, and
//! atomic (temp-then-rename) writes so a crash mid-write never leaves a
//! corrupt message file behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;
use crate::headers::{self, MessageMetadata};

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Sanitize an account id or folder path segment for use as a directory
/// name: replace path separators and other filesystem-hostile characters.
pub fn sanitize_segment(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            c => out.push(c),
        }
    }
    if out.is_empty() {
        "_".to_string()
    } else {
        out
    }
}

pub struct FolderStore {
    dir: PathBuf,
    uid_cache_path: PathBuf,
}

impl FolderStore {
    /// Ensure the on-disk directory for `account_id`/`folder` exists and
    /// return a handle to it. The folder's IMAP hierarchy is flattened into
    /// sanitized path segments joined under the account root.
    pub async fn prepare(backup_root: &Path, account_id: &str, folder: &str) -> Result<Self, StorageError> {
        let mut dir = backup_root.join(sanitize_segment(account_id));
        for segment in folder.split('/') {
            dir = dir.join(sanitize_segment(segment));
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err(&dir, e))?;
        let uid_cache_path = dir.join(".uid_cache");
        Ok(Self { dir, uid_cache_path })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// UIDs already recorded for this folder, read from the sidecar cache.
    /// Falls back to an empty set if the cache doesn't exist yet (first run).
    pub async fn known_uids(&self) -> Result<HashSet<u32>, StorageError> {
        match fs::read_to_string(&self.uid_cache_path).await {
            Ok(content) => Ok(content
                .lines()
                .filter_map(|l| l.trim().parse::<u32>().ok())
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
            Err(e) => Err(io_err(&self.uid_cache_path, e)),
        }
    }

    /// Append `uid` to the sidecar cache. Append-only: never rewritten, so
    /// a crash mid-append loses at most the one pending record.
    async fn record_uid(&self, uid: u32) -> Result<(), StorageError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.uid_cache_path)
            .await
            .map_err(|e| io_err(&self.uid_cache_path, e))?;
        file.write_all(format!("{uid}\n").as_bytes())
            .await
            .map_err(|e| io_err(&self.uid_cache_path, e))?;
        Ok(())
    }

    /// Write `body` as a new message file, deriving its name from the
    /// parsed headers and `fallback_time`. Collisions (two messages that
    /// derive the same name) are resolved with a `_1`, `_2`, ... suffix.
    /// The write is atomic: contents land in a `.tmp` file first, then
    /// renamed into place, so readers never observe a partial file.
    pub async fn write_message(
        &self,
        uid: u32,
        body: &[u8],
        fallback_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<PathBuf, StorageError> {
        let metadata = headers::parse_metadata(header_block(body));
        let final_path = self.resolve_collision_free_path(uid, &metadata, fallback_time).await?;
        self.write_atomic(&final_path, body).await?;
        self.record_uid(uid).await?;
        Ok(final_path)
    }

    /// Reserve a destination path for a streamed write (message body larger
    /// than the streaming threshold) before any bytes are known, using only
    /// the UID and fallback time -- headers aren't available yet since the
    /// body hasn't been read. Returns the `.tmp` path to write into.
    pub async fn reserve_streaming_path(
        &self,
        uid: u32,
        fallback_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<PathBuf, StorageError> {
        let metadata = MessageMetadata::default();
        let final_path = self.resolve_collision_free_path(uid, &metadata, fallback_time).await?;
        Ok(final_path.with_extension("eml.tmp"))
    }

    /// Finalize a streamed write: rename the `.tmp` file into place and
    /// record the UID.
    pub async fn finalize_streaming_path(&self, uid: u32, tmp_path: &Path) -> Result<PathBuf, StorageError> {
        let final_path = tmp_path.with_extension("");
        fs::rename(tmp_path, &final_path)
            .await
            .map_err(|e| io_err(&final_path, e))?;
        self.record_uid(uid).await?;
        Ok(final_path)
    }

    async fn resolve_collision_free_path(
        &self,
        uid: u32,
        metadata: &MessageMetadata,
        fallback_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<PathBuf, StorageError> {
        let base_name = headers::derive_filename(uid, metadata, fallback_time);
        let mut candidate = self.dir.join(&base_name);
        let mut suffix = 0u32;
        while fs::metadata(&candidate).await.is_ok() {
            suffix += 1;
            let stem = base_name.trim_end_matches(".eml");
            candidate = self.dir.join(format!("{stem}_{suffix}.eml"));
        }
        Ok(candidate)
    }

    async fn write_atomic(&self, final_path: &Path, body: &[u8]) -> Result<(), StorageError> {
        let tmp_path = final_path.with_extension("eml.tmp");
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| io_err(&tmp_path, e))?;
        file.write_all(body).await.map_err(|e| io_err(&tmp_path, e))?;
        file.sync_all().await.map_err(|e| io_err(&tmp_path, e))?;
        fs::rename(&tmp_path, final_path)
            .await
            .map_err(|e| io_err(final_path, e))?;
        Ok(())
    }

    /// Total size in bytes of stored `.eml` files.
    pub async fn size_bytes(&self) -> Result<u64, StorageError> {
        let mut total = 0u64;
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| io_err(&self.dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&self.dir, e))? {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("eml") {
                if let Ok(meta) = entry.metadata().await {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }

    pub async fn message_count(&self) -> Result<u64, StorageError> {
        let mut count = 0u64;
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| io_err(&self.dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&self.dir, e))? {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("eml") {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Header block is everything before the first blank line (`\r\n\r\n` or
/// `\n\n`); if neither is found, treat the whole body as headers.
fn header_block(body: &[u8]) -> &[u8] {
    if let Some(pos) = find_subslice(body, b"\r\n\r\n") {
        &body[..pos]
    } else if let Some(pos) = find_subslice(body, b"\n\n") {
        &body[..pos]
    } else {
        body
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Remove `.eml` files whose UID (per filename prefix) is no longer present
/// in `server_uids` and isn't in the cache's recorded set, used by the
/// verification/repair loop's orphan cleanup (spec §4.7). Returns the paths
/// removed.
pub async fn cleanup_orphans(store: &FolderStore, server_uids: &HashSet<u32>) -> Result<Vec<PathBuf>, StorageError> {
    let mut removed = Vec::new();
    let mut entries = fs::read_dir(&store.dir)
        .await
        .map_err(|e| io_err(&store.dir, e))?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&store.dir, e))? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("eml") {
            continue;
        }
        let Some(file_stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(uid_str) = file_stem.split('_').next() else {
            continue;
        };
        let Ok(uid) = uid_str.parse::<u32>() else {
            continue;
        };
        if !server_uids.contains(&uid) {
            fs::remove_file(&path).await.map_err(|e| io_err(&path, e))?;
            removed.push(path);
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn write_message_is_idempotent_on_uid() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FolderStore::prepare(tmp.path(), "acct", "INBOX").await.unwrap();
        let body = b"Subject: hi\r\n\r\nbody";
        store.write_message(1, body, now()).await.unwrap();
        let uids = store.known_uids().await.unwrap();
        assert!(uids.contains(&1));
    }

    #[tokio::test]
    async fn colliding_filenames_get_suffixed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FolderStore::prepare(tmp.path(), "acct", "INBOX").await.unwrap();
        let body = b"Subject: hi\r\n\r\nbody";
        let p1 = store.write_message(1, body, now()).await.unwrap();
        let p2 = store.write_message(2, body, now()).await.unwrap();
        assert_ne!(p1, p2);
    }

    #[tokio::test]
    async fn sanitize_segment_strips_path_separators() {
        assert_eq!(sanitize_segment("INBOX/Sub"), "INBOX_Sub");
    }

    #[tokio::test]
    async fn cleanup_orphans_removes_uids_not_on_server() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FolderStore::prepare(tmp.path(), "acct", "INBOX").await.unwrap();
        store.write_message(1, b"Subject: a\r\n\r\nb", now()).await.unwrap();
        store.write_message(2, b"Subject: b\r\n\r\nb", now()).await.unwrap();
        let server_uids: HashSet<u32> = [1].into_iter().collect();
        let removed = cleanup_orphans(&store, &server_uids).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(store.message_count().await.unwrap(), 1);
    }
}
