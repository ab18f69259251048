//! [`CrdtStorage`] kept in process memory.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use super::storage::{CrdtStorage, StorageResult};
use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::TreeSyncError;

/// Storage that lives as long as the value does.
///
/// Used by tests and by replicas that are rebuilt from peers on every start.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    docs: RwLock<HashMap<String, StoredDoc>>,
    last_id: AtomicI64,
}

#[derive(Debug, Default)]
struct StoredDoc {
    snapshot: Option<Vec<u8>>,
    log: Vec<CrdtUpdate>,
}

fn poisoned<T>(_: T) -> TreeSyncError {
    TreeSyncError::Storage("memory storage lock poisoned".to_string())
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_doc<R>(&self, name: &str, f: impl FnOnce(&StoredDoc) -> R) -> StorageResult<Option<R>> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(docs.get(name).map(f))
    }

    fn with_doc_mut<R>(&self, name: &str, f: impl FnOnce(&mut StoredDoc) -> R) -> StorageResult<R> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        Ok(f(docs.entry(name.to_string()).or_default()))
    }
}

impl CrdtStorage for MemoryStorage {
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.with_doc(name, |doc| doc.snapshot.clone())?.flatten())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        self.with_doc_mut(name, |doc| doc.snapshot = Some(state.to_vec()))
    }

    fn append_update(
        &self,
        name: &str,
        update: &[u8],
        origin: UpdateOrigin,
    ) -> StorageResult<i64> {
        let update_id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = CrdtUpdate {
            update_id,
            doc_name: name.to_string(),
            data: update.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin,
        };
        self.with_doc_mut(name, |doc| doc.log.push(record))?;
        Ok(update_id)
    }

    fn get_updates_since(&self, name: &str, since_id: i64) -> StorageResult<Vec<CrdtUpdate>> {
        let updates = self.with_doc(name, |doc| {
            doc.log
                .iter()
                .filter(|update| update.update_id > since_id)
                .cloned()
                .collect::<Vec<_>>()
        })?;
        Ok(updates.unwrap_or_default())
    }

    fn latest_update_id(&self, name: &str) -> StorageResult<i64> {
        let latest = self.with_doc(name, |doc| doc.log.last().map(|update| update.update_id))?;
        Ok(latest.flatten().unwrap_or(0))
    }

    fn truncate_log(&self, name: &str, through_id: i64) -> StorageResult<()> {
        self.with_doc_mut(name, |doc| doc.log.retain(|update| update.update_id > through_id))
    }
}
