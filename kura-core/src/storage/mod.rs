//! Storage backend abstraction.
//!
//! A library's content lives behind a [`StorageBackend`] selected by the
//! scheme of the library's source URI. Backends expose enough surface for
//! scanning (recursive walks, reads for digest computation) and may
//! optionally provide a live watch stream.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

use kura_model::ScanEvent;

use crate::error::{Result, ScanError};

pub mod filesystem;
pub mod memory;
pub mod watch;

pub use filesystem::FilesystemBackend;
pub use memory::{MemoryBackend, MemoryStore};

/// Outcome of polling a watch stream.
#[derive(Debug)]
pub enum WatchPoll {
    /// A translated event is ready.
    Event(ScanEvent),
    /// The timeout elapsed with nothing to report. Callers multiplexing
    /// several libraries use this to move on to the next stream.
    Timeout,
    /// The underlying watcher has shut down; no further events will arrive.
    Closed,
}

/// A live stream of change events from a storage backend.
#[async_trait]
pub trait EventSource: Send + fmt::Debug {
    /// Wait for the next event. `timeout` bounds the wait; `None` blocks
    /// until an event arrives or the stream closes.
    async fn next(&mut self, timeout: Option<Duration>) -> Result<WatchPoll>;

    /// Stop watching and release any OS-level watch handles. Dropping the
    /// source has the same effect.
    fn close(&mut self);
}

/// Backend interface used by libraries for scanning.
///
/// All paths are relative to the backend root, slash-separated, without a
/// leading slash.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Validate the backend configuration. Called before a library is
    /// created; failure rejects the library.
    async fn check(&self) -> Result<()>;

    /// Read a file's full content.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    async fn get_modified_time(&self, path: &str) -> Result<DateTime<Utc>>;

    async fn exists(&self, path: &str) -> bool;

    /// Immediate children of a directory as `(directories, files)` name
    /// lists.
    async fn list_dir(&self, path: &str) -> Result<(Vec<String>, Vec<String>)>;

    /// Paths of all files under `start`, breadth-first.
    ///
    /// With `safe` set, directories that fail to list are skipped instead of
    /// aborting the walk. Backends with a cheaper native listing may
    /// override this.
    async fn walk_files(&self, start: &str, safe: bool) -> Result<Vec<String>> {
        let mut queue = VecDeque::from([start.to_string()]);
        let mut found = Vec::new();

        while let Some(current) = queue.pop_front() {
            let (directories, files) = match self.list_dir(&current).await {
                Ok(listing) => listing,
                Err(err) if safe => {
                    debug!("skipping unreadable directory {current:?}: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };
            queue.extend(directories.iter().map(|name| join_path(&current, name)));
            found.extend(files.iter().map(|name| join_path(&current, name)));
        }

        Ok(found)
    }

    /// Start a live watch. Backends without change notification support
    /// return [`ScanError::WatchUnsupported`].
    async fn watch(&self) -> Result<Box<dyn EventSource>> {
        Err(ScanError::WatchUnsupported(format!("{self:?}")))
    }
}

pub(crate) fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), name)
    }
}

type BackendFactory = Arc<dyn Fn(&Url) -> Result<Arc<dyn StorageBackend>> + Send + Sync>;

/// Maps URI schemes to backend constructors.
pub struct StorageRegistry {
    schemes: HashMap<String, BackendFactory>,
}

impl fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.schemes.keys().collect();
        schemes.sort();
        f.debug_struct("StorageRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self {
            schemes: HashMap::new(),
        }
    }

    /// A registry with the built-in `file` and `memory` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("file", |url| {
                Ok(Arc::new(FilesystemBackend::from_url(url)?) as Arc<dyn StorageBackend>)
            })
            .expect("built-in schemes cannot collide");
        registry
            .register("memory", |url| {
                Ok(Arc::new(MemoryBackend::from_url(url)) as Arc<dyn StorageBackend>)
            })
            .expect("built-in schemes cannot collide");
        registry
    }

    /// Register a backend for a URI scheme. Registering the same scheme
    /// twice is refused.
    pub fn register<F>(&mut self, scheme: &str, factory: F) -> Result<()>
    where
        F: Fn(&Url) -> Result<Arc<dyn StorageBackend>> + Send + Sync + 'static,
    {
        if scheme.is_empty() {
            return Err(ScanError::Validation(
                "cannot register a storage backend with an empty scheme".to_string(),
            ));
        }
        if self.schemes.contains_key(scheme) {
            return Err(ScanError::Validation(format!(
                "a storage backend is already registered for scheme {scheme:?}"
            )));
        }
        self.schemes.insert(scheme.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Parse a source URI and instantiate the matching backend.
    pub fn build(&self, uri: &str) -> Result<Arc<dyn StorageBackend>> {
        let url = Url::parse(uri)
            .map_err(|err| ScanError::Validation(format!("invalid source URI {uri:?}: {err}")))?;
        let factory = self.schemes.get(url.scheme()).ok_or_else(|| {
            ScanError::Validation(format!(
                "no storage backend registered for scheme {:?}",
                url.scheme()
            ))
        })?;
        factory(&url)
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_scheme_is_rejected() {
        let registry = StorageRegistry::with_defaults();
        let err = registry.build("unicorn:///magic").unwrap_err();
        assert!(matches!(err, ScanError::Validation(_)));
    }

    #[test]
    fn duplicate_scheme_is_refused() {
        let mut registry = StorageRegistry::with_defaults();
        let result = registry.register("memory", |url| {
            Ok(Arc::new(MemoryBackend::from_url(url)) as Arc<dyn StorageBackend>)
        });
        assert!(result.is_err());
    }

    #[test]
    fn join_path_handles_the_root() {
        assert_eq!(join_path("", "foo"), "foo");
        assert_eq!(join_path("a/b", "c"), "a/b/c");
    }
}
