//! Persistence of replicated trees.
//!
//! A document is stored as an optional snapshot plus an append-only log of
//! the updates made since that snapshot. Restoring applies the snapshot and
//! then replays the log. Replaying an update already contained in the
//! snapshot is a no-op, so a crash between writing the snapshot and
//! truncating the log loses nothing.

use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::TreeSyncError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, TreeSyncError>;

/// A storage backend for replicas.
pub trait CrdtStorage: Send + Sync {
    /// Load the latest snapshot of a document, if one was saved.
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replace the snapshot of a document.
    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()>;

    /// Append an update to the log and return its ID. IDs increase
    /// monotonically.
    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin)
    -> StorageResult<i64>;

    /// Logged updates with an ID greater than `since_id`, oldest first.
    fn get_updates_since(&self, name: &str, since_id: i64) -> StorageResult<Vec<CrdtUpdate>>;

    /// Every logged update, oldest first.
    fn get_all_updates(&self, name: &str) -> StorageResult<Vec<CrdtUpdate>> {
        self.get_updates_since(name, 0)
    }

    /// ID of the newest logged update, or 0 when the log is empty.
    fn latest_update_id(&self, name: &str) -> StorageResult<i64>;

    /// Drop every logged update with an ID up to and including `through_id`.
    fn truncate_log(&self, name: &str, through_id: i64) -> StorageResult<()>;
}
