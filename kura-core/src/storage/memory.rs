//! In-memory storage backend (`memory://name` URIs).
//!
//! Each name addresses a shared store, so several handles (and the backend
//! instances built from a library source) observe the same data. Used by the
//! test suites and as a stand-in for remote backends that have no local
//! filesystem representation. Watching is not supported.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::error::{Result, ScanError};
use crate::storage::StorageBackend;

type StoreData = HashMap<String, (DateTime<Utc>, Vec<u8>)>;

static STORES: OnceLock<Mutex<HashMap<String, StoreData>>> = OnceLock::new();

fn stores() -> &'static Mutex<HashMap<String, StoreData>> {
    STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

fn io_not_found(path: &str) -> ScanError {
    ScanError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("file path {path:?} not found in store"),
    ))
}

/// Handle for seeding and mutating a named in-memory store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
}

impl MemoryStore {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn set(&self, path: &str, content: impl Into<Vec<u8>>) {
        let mut guard = stores().lock().expect("memory store lock poisoned");
        guard
            .entry(self.name.clone())
            .or_default()
            .insert(path.to_string(), (Utc::now(), content.into()));
    }

    pub fn unset(&self, path: &str) {
        let mut guard = stores().lock().expect("memory store lock poisoned");
        if let Some(data) = guard.get_mut(&self.name) {
            data.remove(path);
        }
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        let guard = stores().lock().expect("memory store lock poisoned");
        guard
            .get(&self.name)
            .and_then(|data| data.get(path))
            .map(|(_, content)| content.clone())
    }

    pub fn paths(&self) -> Vec<String> {
        let guard = stores().lock().expect("memory store lock poisoned");
        guard
            .get(&self.name)
            .map(|data| data.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut guard = stores().lock().expect("memory store lock poisoned");
        guard.remove(&self.name);
    }
}

/// Storage backend reading from a named [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    store: MemoryStore,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            store: MemoryStore::named(name),
        }
    }

    /// `memory://name` — the host part names the store.
    pub fn from_url(url: &Url) -> Self {
        Self::new(url.host_str().unwrap_or_default())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn check(&self) -> Result<()> {
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.store.get(path).ok_or_else(|| io_not_found(path))
    }

    async fn get_modified_time(&self, path: &str) -> Result<DateTime<Utc>> {
        let guard = stores().lock().expect("memory store lock poisoned");
        guard
            .get(&self.store.name)
            .and_then(|data| data.get(path))
            .map(|(modified, _)| *modified)
            .ok_or_else(|| io_not_found(path))
    }

    async fn exists(&self, path: &str) -> bool {
        self.store.get(path).is_some()
    }

    async fn list_dir(&self, path: &str) -> Result<(Vec<String>, Vec<String>)> {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };

        let mut directories = Vec::new();
        let mut files = Vec::new();
        for stored in self.store.paths() {
            let Some(remainder) = stored.strip_prefix(&prefix) else {
                continue;
            };
            match remainder.split_once('/') {
                Some((directory, _)) => {
                    if !directories.contains(&directory.to_string()) {
                        directories.push(directory.to_string());
                    }
                }
                None => files.push(remainder.to_string()),
            }
        }

        Ok((directories, files))
    }
}
