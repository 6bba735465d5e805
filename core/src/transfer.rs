//! Transfer registry (component G): announced (sender) and pending
//! (receiver) transfer bookkeeping, keyed by `transfer_id`.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default time-to-live for an announced transfer before the janitor sweeps
/// it, absent a `TRANSFERRING` status extension.
pub const DEFAULT_TTL_SECS: i64 = 300;

/// Metadata for one file within a transfer. Folders are flattened: `name` is
/// always a basename.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    /// Hex-encoded SHA-256 of the full file content, 64 characters.
    pub checksum: String,
    pub mime_hint: Option<String>,
}

impl FileMetadata {
    pub fn is_valid(&self) -> bool {
        self.checksum.len() == 64 && self.checksum.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Complete,
    Failed,
    Expired,
    Canceled,
}

/// One record per `FILE_ANNOUNCE`, owned either by the sender (as
/// `announced`, with `source_paths` populated) or the receiver (as
/// `pending`, with `source_paths` empty).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub files: Vec<FileMetadata>,
    /// Absolute source paths, sender-side only, same order as `files`.
    pub source_paths: Vec<PathBuf>,
    pub announced_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TransferStatus,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl TransferRecord {
    pub fn new_announced(files: Vec<FileMetadata>, source_paths: Vec<PathBuf>) -> Self {
        let mut id_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let transfer_id = hex::encode(id_bytes);
        let bytes_total = files.iter().map(|f| f.size).sum();
        let announced_at = Utc::now();
        let expires_at = announced_at + chrono::Duration::seconds(DEFAULT_TTL_SECS);
        Self {
            transfer_id,
            files,
            source_paths,
            announced_at,
            expires_at,
            status: TransferStatus::Pending,
            bytes_done: 0,
            bytes_total,
        }
    }

    pub fn new_pending(transfer_id: String, files: Vec<FileMetadata>) -> Self {
        let bytes_total = files.iter().map(|f| f.size).sum();
        let announced_at = Utc::now();
        let expires_at = announced_at + chrono::Duration::seconds(DEFAULT_TTL_SECS);
        Self {
            transfer_id,
            files,
            source_paths: Vec::new(),
            announced_at,
            expires_at,
            status: TransferStatus::Pending,
            bytes_done: 0,
            bytes_total,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at && self.status != TransferStatus::Transferring
    }
}

#[derive(Default)]
struct Maps {
    announced: HashMap<String, TransferRecord>,
    pending: HashMap<String, TransferRecord>,
}

/// Serializes every map access behind a single mutex; the sweep clones keys
/// first so the lock is never held across I/O.
#[derive(Clone, Default)]
pub struct TransferRegistry {
    inner: Arc<Mutex<Maps>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_announced(&self, record: TransferRecord) -> String {
        let id = record.transfer_id.clone();
        self.inner.lock().await.announced.insert(id.clone(), record);
        id
    }

    pub async fn register_pending(&self, record: TransferRecord) {
        let id = record.transfer_id.clone();
        self.inner.lock().await.pending.insert(id, record);
    }

    pub async fn get_announced(&self, id: &str) -> Option<TransferRecord> {
        self.inner.lock().await.announced.get(id).cloned()
    }

    pub async fn get_pending(&self, id: &str) -> Option<TransferRecord> {
        self.inner.lock().await.pending.get(id).cloned()
    }

    pub async fn update_progress(&self, id: &str, pending: bool, bytes_done: u64) {
        let mut guard = self.inner.lock().await;
        let map = if pending { &mut guard.pending } else { &mut guard.announced };
        if let Some(rec) = map.get_mut(id) {
            rec.bytes_done = bytes_done;
            rec.status = TransferStatus::Transferring;
        }
    }

    pub async fn mark(&self, id: &str, pending: bool, status: TransferStatus) {
        let mut guard = self.inner.lock().await;
        let map = if pending { &mut guard.pending } else { &mut guard.announced };
        if let Some(rec) = map.get_mut(id) {
            rec.status = status;
        }
    }

    pub async fn remove_pending(&self, id: &str) -> Option<TransferRecord> {
        self.inner.lock().await.pending.remove(id)
    }

    pub async fn remove_announced(&self, id: &str) -> Option<TransferRecord> {
        self.inner.lock().await.announced.remove(id)
    }

    /// Looks up an announced transfer for a `FILE_REQUEST`, rejecting it if
    /// missing or past its deadline.
    pub async fn lookup_for_request(&self, id: &str) -> Result<TransferRecord> {
        let record = self
            .get_announced(id)
            .await
            .ok_or_else(|| Error::ExpiredOrUnknownTransfer(id.to_string()))?;
        if record.is_expired(Utc::now()) {
            return Err(Error::ExpiredOrUnknownTransfer(id.to_string()));
        }
        Ok(record)
    }

    /// Marks every in-flight transfer `Failed`; called when a connection
    /// drops.
    pub async fn fail_all_in_flight(&self) {
        let mut guard = self.inner.lock().await;
        for rec in guard.announced.values_mut().chain(guard.pending.values_mut()) {
            if matches!(rec.status, TransferStatus::Pending | TransferStatus::Transferring) {
                rec.status = TransferStatus::Failed;
            }
        }
    }

    /// Snapshots every in-flight record across both maps, for the `status`
    /// CLI surface. Order is unspecified.
    pub async fn all(&self) -> Vec<TransferRecord> {
        let guard = self.inner.lock().await;
        guard.announced.values().chain(guard.pending.values()).cloned().collect()
    }

    /// Removes expired records from both maps. Runs every 30 s per the
    /// concurrency model; `Transferring` records get one more TTL instead of
    /// being dropped.
    pub async fn sweep_expired(&self) {
        let now = Utc::now();
        let mut guard = self.inner.lock().await;
        let extend = chrono::Duration::seconds(DEFAULT_TTL_SECS);
        for map in [&mut guard.announced, &mut guard.pending] {
            let expired_keys: Vec<String> = map
                .iter()
                .filter(|(_, rec)| now > rec.expires_at)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired_keys {
                let Some(rec) = map.get_mut(&id) else { continue };
                if rec.status == TransferStatus::Transferring {
                    rec.expires_at += extend;
                } else {
                    rec.status = TransferStatus::Expired;
                    map.remove(&id);
                }
            }
        }
    }
}
