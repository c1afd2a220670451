//! A library is one scanned collection: a storage backend plus the database
//! rows describing what has been found in it.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{info, warn};

use kura_model::{Library, ScanEvent};

use crate::config::ScanConfig;
use crate::db;
use crate::error::Result;
use crate::scanner::runner::{self, RunOptions, ScanStats};
use crate::scanner::ScanContext;
use crate::storage::{StorageBackend, StorageRegistry, WatchPoll};

/// Runtime handle for a library: the persisted record, its resolved storage
/// backend and the cached set of ignored directories.
#[derive(Debug)]
pub struct LibraryHandle {
    record: Library,
    storage: Arc<dyn StorageBackend>,
    ignored: RwLock<Option<Arc<HashSet<String>>>>,
}

impl LibraryHandle {
    /// Resolve the library's source URI against the registry and wrap the
    /// record in a handle.
    pub fn open(record: Library, registry: &StorageRegistry) -> Result<Self> {
        let storage = registry.build(&record.source)?;
        Ok(Self {
            record,
            storage,
            ignored: RwLock::new(None),
        })
    }

    /// Create a new library: validate its configuration and storage, persist
    /// the record and return the handle.
    pub async fn create(
        pool: &SqlitePool,
        registry: &StorageRegistry,
        record: Library,
    ) -> Result<Self> {
        record.validate_default_visibility()?;
        let handle = Self::open(record, registry)?;
        handle.storage.check().await?;

        let mut conn = pool.acquire().await?;
        db::insert_library(&mut conn, &handle.record).await?;
        Ok(handle)
    }

    pub fn record(&self) -> &Library {
        &self.record
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Directories whose contents are excluded from the catalog, identified
    /// by a marker file they contain. Computed on first use and cached until
    /// [`LibraryHandle::invalidate_ignored`].
    pub async fn ignored_directories(&self, config: &ScanConfig) -> Result<Arc<HashSet<String>>> {
        if let Some(cached) = self.ignored.read().await.as_ref() {
            return Ok(Arc::clone(cached));
        }

        let mut guard = self.ignored.write().await;
        // Another task may have filled the cache while we waited.
        if let Some(cached) = guard.as_ref() {
            return Ok(Arc::clone(cached));
        }

        let mut directories = HashSet::new();
        if let Some(marker) = config.ignore_marker.as_deref() {
            for path in self.storage.walk_files("", true).await? {
                let (directory, name) = match path.rsplit_once('/') {
                    Some((directory, name)) => (directory, name),
                    None => ("", path.as_str()),
                };
                if name == marker {
                    directories.insert(directory.to_string());
                }
            }
        }
        let directories = Arc::new(directories);
        *guard = Some(Arc::clone(&directories));
        Ok(directories)
    }

    /// Whether `path` sits inside an ignored directory. A marker at the
    /// backend root excludes everything.
    pub async fn is_path_ignored(&self, path: &str, config: &ScanConfig) -> Result<bool> {
        let ignored = self.ignored_directories(config).await?;
        Ok(ignored.iter().any(|directory| {
            directory.is_empty()
                || path == directory.as_str()
                || (path.len() > directory.len()
                    && path.starts_with(directory.as_str())
                    && path.as_bytes()[directory.len()] == b'/')
        }))
    }

    /// Drop the ignored-directory cache. Called when a marker file appears
    /// or disappears.
    pub async fn invalidate_ignored(&self) {
        *self.ignored.write().await = None;
    }

    /// Full scan: walk the backend, reconcile every found file and mark
    /// tracked files the walk did not see as missing.
    pub async fn scan(
        self: &Arc<Self>,
        ctx: &ScanContext,
        options: &RunOptions,
    ) -> Result<ScanStats> {
        info!("starting scan of library {}", self.record.id);
        self.invalidate_ignored().await;
        self.ignored_directories(&ctx.config).await?;

        let walked = self.storage.walk_files("", true).await?;
        let walked_set: HashSet<String> = walked.iter().cloned().collect();
        let events = walked
            .into_iter()
            .map(|path| ScanEvent::FileModified { path });
        let mut stats =
            runner::run(Arc::clone(self), ctx, options, futures::stream::iter(events)).await?;

        // Files the walk did not encounter are gone. Paths inside ignored
        // directories are also handled here: the walk saw them, but their
        // modified-events marked them missing already.
        let tracked = {
            let mut conn = ctx.pool.acquire().await?;
            db::available_paths(&mut conn, self.record.id).await?
        };
        let removals = tracked
            .into_iter()
            .filter(|path| !walked_set.contains(path))
            .map(|path| ScanEvent::FileRemoved { path });
        stats.merge(
            runner::run(
                Arc::clone(self),
                ctx,
                options,
                futures::stream::iter(removals),
            )
            .await?,
        );

        info!(
            "finished scan of library {}: {} events processed, {} failed",
            self.record.id, stats.processed, stats.failed
        );
        Ok(stats)
    }

    /// Watch the backend for changes and reconcile events as they arrive.
    /// Runs until `stop` is set or the underlying watcher shuts down.
    pub async fn watch(
        self: &Arc<Self>,
        ctx: &ScanContext,
        options: &RunOptions,
        stop: Arc<AtomicBool>,
    ) -> Result<ScanStats> {
        self.ignored_directories(&ctx.config).await?;
        let source = self.storage.watch().await?;
        info!("watching library {} for changes", self.record.id);

        let poll = Duration::from_millis(ctx.config.watch_poll_ms);
        let events = futures::stream::unfold(source, move |mut source| {
            let stop = Arc::clone(&stop);
            async move {
                loop {
                    if stop.load(Ordering::Relaxed) {
                        source.close();
                        return None;
                    }
                    match source.next(Some(poll)).await {
                        Ok(WatchPoll::Event(event)) => return Some((event, source)),
                        Ok(WatchPoll::Timeout) => continue,
                        Ok(WatchPoll::Closed) => return None,
                        Err(err) => {
                            warn!("watch stream failed: {err}");
                            return None;
                        }
                    }
                }
            }
        });

        let stats = runner::run(Arc::clone(self), ctx, options, events).await?;
        info!(
            "stopped watching library {}: {} events processed, {} failed",
            self.record.id, stats.processed, stats.failed
        );
        Ok(stats)
    }
}
