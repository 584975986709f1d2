//! In-memory reference backend.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{StoreBackend, StoredEntry};
use crate::error::Result;

/// Reference backend keeping entries in a process-local map. Swappable for
/// a document-store adapter without touching strategy logic.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, for assertions in tests.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn find(&self, id: &str) -> Result<Option<StoredEntry>> {
        Ok(self
            .entries
            .lock()
            .expect("store lock poisoned")
            .get(id)
            .cloned())
    }

    async fn list(&self, user: &str) -> Result<Vec<StoredEntry>> {
        Ok(self
            .entries
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|entry| entry.user == user)
            .cloned()
            .collect())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .expect("store lock poisoned")
            .contains_key(id))
    }

    async fn upsert(&self, mut entry: StoredEntry) -> Result<StoredEntry> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let now = Utc::now();
        entry.created_at = entries
            .get(&entry.id)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        entry.updated_at = Some(now);
        entries.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.entries.lock().expect("store lock poisoned").remove(id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
