//! File-backed reference backend using one TOML document per entry.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{StoreBackend, StoredEntry};
use crate::error::{Error, Result};

const ENTRY_FILE_VERSION: u32 = 1;

/// Stores each entry as `<id>.toml` under a base directory. Intended for
/// single-node deployments and development; a document-database adapter
/// covers the rest.
#[derive(Debug, Clone)]
pub struct FileBackend {
    base_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryFile {
    version: u32,
    entry: StoredEntry,
}

impl FileBackend {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn new_default() -> Self {
        Self {
            base_dir: default_store_dir(),
        }
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.toml"))
    }

    fn read_entry(path: &Path) -> Result<Option<StoredEntry>> {
        let raw = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let file: EntryFile = toml::from_str(&raw)?;
        Ok(Some(file.entry))
    }

    fn write_entry(&self, entry: &StoredEntry) -> Result<()> {
        fs::create_dir_all(&self.base_dir)?;
        let path = self.entry_path(&entry.id);
        let serialized = toml::to_string(&EntryFile {
            version: ENTRY_FILE_VERSION,
            entry: entry.clone(),
        })?;
        fs::write(&path, serialized)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for FileBackend {
    async fn find(&self, id: &str) -> Result<Option<StoredEntry>> {
        Self::read_entry(&self.entry_path(id))
    }

    async fn list(&self, user: &str) -> Result<Vec<StoredEntry>> {
        let dir = match fs::read_dir(&self.base_dir) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        for item in dir {
            let path = item?.path();
            if !path.extension().is_some_and(|ext| ext == "toml") {
                continue;
            }
            if let Some(entry) = Self::read_entry(&path)? {
                if entry.user == user {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.entry_path(id).exists())
    }

    async fn upsert(&self, mut entry: StoredEntry) -> Result<StoredEntry> {
        let now = Utc::now();
        let existing = Self::read_entry(&self.entry_path(&entry.id))?;
        entry.created_at = existing.and_then(|e| e.created_at).or(Some(now));
        entry.updated_at = Some(now);
        self.write_entry(&entry)?;
        Ok(entry)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Io(err)),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn default_store_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".authwall"))
        .unwrap_or_else(|| PathBuf::from(".authwall"))
}
