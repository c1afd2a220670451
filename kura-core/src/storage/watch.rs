//! Translation of raw `notify` notifications into the [`ScanEvent`]
//! vocabulary, plus the pull-based stream wrapper handed to consumers.
//!
//! The interesting parts are stateful: rename notifications arrive as
//! separate from/to halves that must be paired by tracker cookie, removal
//! notifications carry no directory-ness (the path is already gone), and
//! create-then-write bursts produce a redundant modify that would trigger a
//! second commit for the same content.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

use kura_model::ScanEvent;

use crate::error::{Result, ScanError};
use crate::storage::filesystem::{directory_snapshot, relative_string};
use crate::storage::{EventSource, WatchPoll};

/// A rename-from half waiting for its matching rename-to.
#[derive(Debug)]
struct PendingMove {
    path: String,
    is_dir: bool,
    tracker: Option<usize>,
}

/// State machine turning raw notifications into scan events.
///
/// Fed one `notify::Event` at a time via [`EventTranslator::push`]; call
/// [`EventTranslator::flush`] when the stream goes quiet so a dangling
/// rename-from resolves to a removal.
pub struct EventTranslator {
    root: PathBuf,
    /// Relative paths of every directory we believe exists. Kept current so
    /// events for paths that are already gone can still be classified.
    directories: HashSet<String>,
    pending_move: Option<PendingMove>,
    /// Set after a file-create event so the immediately following modify for
    /// the same path is dropped.
    suppress_modify: Option<String>,
}

impl fmt::Debug for EventTranslator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTranslator")
            .field("root", &self.root)
            .field("directory_count", &self.directories.len())
            .field("pending_move", &self.pending_move)
            .finish()
    }
}

impl EventTranslator {
    pub fn new(root: PathBuf, directories: HashSet<String>) -> Self {
        Self {
            root,
            directories,
            pending_move: None,
            suppress_modify: None,
        }
    }

    /// Feed one raw notification, returning any scan events it resolves to.
    pub fn push(&mut self, raw: &notify::Event) -> Vec<ScanEvent> {
        let mut out = Vec::new();
        let suppress = self.suppress_modify.take();

        let Some(path) = raw.paths.first().and_then(|p| self.relative(p)) else {
            // Events for paths outside the root (or unrepresentable ones)
            // are not ours to handle.
            self.resolve_pending(&mut out);
            return out;
        };

        match raw.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                self.resolve_pending(&mut out);
                self.pending_move = Some(PendingMove {
                    is_dir: self.directories.contains(&path),
                    path,
                    tracker: raw.tracker(),
                });
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                match self.pending_move.take() {
                    Some(pending) if pending.tracker == raw.tracker() => {
                        self.emit_move(pending, path, &mut out);
                    }
                    pending => {
                        if let Some(pending) = pending {
                            // Unrelated from/to halves; surface both on their
                            // own so the mismatch is visible downstream.
                            warn!(
                                "unpaired rename notifications ({:?} then {path:?}), \
                                 treating them independently",
                                pending.path
                            );
                            self.emit_removal(pending, &mut out);
                        }
                        self.emit_moved_in(&path, &mut out);
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                self.resolve_pending(&mut out);
                let new_path = raw.paths.get(1).and_then(|p| self.relative(p));
                match new_path {
                    Some(new_path) => {
                        let pending = PendingMove {
                            is_dir: self.directories.contains(&path),
                            path,
                            tracker: raw.tracker(),
                        };
                        self.emit_move(pending, new_path, &mut out);
                    }
                    None => {
                        // Moved out of the root: a removal from our side.
                        let pending = PendingMove {
                            is_dir: self.directories.contains(&path),
                            path,
                            tracker: None,
                        };
                        self.emit_removal(pending, &mut out);
                    }
                }
            }
            EventKind::Create(kind) => {
                self.resolve_pending(&mut out);
                let absolute = self.root.join(&path);
                let is_dir = match kind {
                    CreateKind::Folder => true,
                    CreateKind::File => false,
                    _ => absolute.is_dir(),
                };
                if is_dir {
                    self.directories.insert(path);
                } else if absolute.is_file() {
                    self.suppress_modify = Some(path.clone());
                    out.push(ScanEvent::File { path });
                }
            }
            EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Metadata(_) | ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Other) => {
                self.resolve_pending(&mut out);
                if suppress.as_deref() == Some(path.as_str()) {
                    debug!("dropping modify notification right after create of {path:?}");
                } else if self.root.join(&path).is_file() {
                    out.push(ScanEvent::FileModified { path });
                }
            }
            EventKind::Remove(kind) => {
                self.resolve_pending(&mut out);
                let is_dir = match kind {
                    RemoveKind::Folder => true,
                    RemoveKind::File => false,
                    _ => self.directories.contains(&path),
                };
                let pending = PendingMove {
                    path,
                    is_dir,
                    tracker: None,
                };
                self.emit_removal(pending, &mut out);
            }
            _ => {
                self.resolve_pending(&mut out);
            }
        }

        out
    }

    /// Resolve a dangling rename-from once it is clear no matching
    /// rename-to will arrive.
    pub fn flush(&mut self) -> Vec<ScanEvent> {
        let mut out = Vec::new();
        self.resolve_pending(&mut out);
        self.suppress_modify = None;
        out
    }

    fn resolve_pending(&mut self, out: &mut Vec<ScanEvent>) {
        if let Some(pending) = self.pending_move.take() {
            self.emit_removal(pending, out);
        }
    }

    fn emit_move(&mut self, from: PendingMove, new_path: String, out: &mut Vec<ScanEvent>) {
        let destination = self.root.join(&new_path);
        let destination_is_dir = destination.is_dir();

        if from.is_dir && destination_is_dir {
            self.rename_directory(&from.path, &new_path);
            out.push(ScanEvent::DirectoryMoved {
                old_path: from.path,
                new_path,
            });
        } else if !from.is_dir && destination.is_file() {
            out.push(ScanEvent::FileMoved {
                old_path: from.path,
                new_path,
            });
        } else {
            // Directory-ness disagrees or the target is missing. Surface the
            // halves independently instead of guessing at a pairing.
            warn!(
                "rename pair {:?} -> {new_path:?} is inconsistent \
                 (from_dir={}, to_dir={destination_is_dir}); this is probably a bug",
                from.path, from.is_dir
            );
            self.emit_removal(from, out);
            self.emit_moved_in(&new_path, out);
        }
    }

    fn emit_removal(&mut self, pending: PendingMove, out: &mut Vec<ScanEvent>) {
        if pending.is_dir {
            self.forget_directory(&pending.path);
            out.push(ScanEvent::DirectoryRemoved { path: pending.path });
        } else {
            out.push(ScanEvent::FileRemoved { path: pending.path });
        }
    }

    /// Content appeared from outside the watched root: emit one `File` event
    /// per contained file.
    fn emit_moved_in(&mut self, path: &str, out: &mut Vec<ScanEvent>) {
        let absolute = self.root.join(path);
        if absolute.is_dir() {
            self.directories.insert(path.to_string());
            self.walk_in(&absolute, path, out);
        } else if absolute.is_file() {
            out.push(ScanEvent::File {
                path: path.to_string(),
            });
        }
    }

    fn walk_in(&mut self, absolute: &Path, relative: &str, out: &mut Vec<ScanEvent>) {
        let Ok(entries) = std::fs::read_dir(absolute) else {
            return;
        };
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let child_relative = format!("{relative}/{name}");
            let child_absolute = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                self.directories.insert(child_relative.clone());
                self.walk_in(&child_absolute, &child_relative, out);
            } else {
                out.push(ScanEvent::File {
                    path: child_relative,
                });
            }
        }
    }

    fn rename_directory(&mut self, old_path: &str, new_path: &str) {
        let prefix = format!("{old_path}/");
        let moved: Vec<String> = self
            .directories
            .iter()
            .filter(|dir| dir.as_str() == old_path || dir.starts_with(&prefix))
            .cloned()
            .collect();
        for dir in moved {
            self.directories.remove(&dir);
            let renamed = if dir == old_path {
                new_path.to_string()
            } else {
                format!("{new_path}/{}", &dir[prefix.len()..])
            };
            self.directories.insert(renamed);
        }
    }

    fn forget_directory(&mut self, path: &str) {
        let prefix = format!("{path}/");
        self.directories
            .retain(|dir| dir.as_str() != path && !dir.starts_with(&prefix));
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let stripped = path.strip_prefix(&self.root).ok()?;
        let as_string = relative_string(stripped)?;
        if as_string.is_empty() {
            None
        } else {
            Some(as_string)
        }
    }
}

enum WatchMessage {
    Event(notify::Event),
    Error(String),
}

/// Live watch stream for [`FilesystemBackend`](crate::storage::FilesystemBackend).
///
/// The notify watcher pushes raw notifications into a channel from its own
/// thread; consumers pull translated events with [`EventSource::next`].
pub struct FsWatchStream {
    watcher: Option<RecommendedWatcher>,
    rx: mpsc::Receiver<WatchMessage>,
    translator: EventTranslator,
    ready: VecDeque<ScanEvent>,
}

impl fmt::Debug for FsWatchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsWatchStream")
            .field("active", &self.watcher.is_some())
            .field("ready", &self.ready.len())
            .finish()
    }
}

impl FsWatchStream {
    pub(crate) async fn start(root: PathBuf) -> Result<Self> {
        let snapshot_root = root.clone();
        let directories = spawn_blocking(move || directory_snapshot(&snapshot_root))
            .await
            .map_err(|err| ScanError::Internal(format!("directory snapshot panicked: {err}")))?;

        let (tx, rx) = mpsc::channel::<WatchMessage>(4096);
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<notify::Event, notify::Error>| {
                let message = match result {
                    Ok(event) => WatchMessage::Event(event),
                    Err(err) => WatchMessage::Error(err.to_string()),
                };
                if tx.blocking_send(message).is_err() {
                    // Receiver is gone; the watcher is being torn down.
                }
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            watcher: Some(watcher),
            rx,
            translator: EventTranslator::new(root, directories),
            ready: VecDeque::new(),
        })
    }

    fn ingest(&mut self, message: WatchMessage) {
        match message {
            WatchMessage::Event(raw) => {
                self.ready.extend(self.translator.push(&raw));
            }
            WatchMessage::Error(error) => {
                warn!("filesystem watcher reported an error: {error}");
            }
        }
    }

    fn drain_available(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.ingest(message);
        }
    }
}

#[async_trait]
impl EventSource for FsWatchStream {
    async fn next(&mut self, timeout: Option<Duration>) -> Result<WatchPoll> {
        loop {
            // Give the translator as much lookahead as is already buffered
            // before taking anything out: rename pairing and create/modify
            // suppression both depend on seeing the following notification.
            self.drain_available();
            if let Some(event) = self.ready.pop_front() {
                return Ok(WatchPoll::Event(event));
            }
            if self.watcher.is_none() {
                return Ok(WatchPoll::Closed);
            }

            let received = match timeout {
                Some(duration) => match tokio::time::timeout(duration, self.rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.ready.extend(self.translator.flush());
                        if let Some(event) = self.ready.pop_front() {
                            return Ok(WatchPoll::Event(event));
                        }
                        return Ok(WatchPoll::Timeout);
                    }
                },
                None => self.rx.recv().await,
            };

            match received {
                Some(message) => self.ingest(message),
                None => {
                    self.ready.extend(self.translator.flush());
                    if let Some(event) = self.ready.pop_front() {
                        return Ok(WatchPoll::Event(event));
                    }
                    return Ok(WatchPoll::Closed);
                }
            }
        }
    }

    fn close(&mut self) {
        // Dropping the watcher releases the OS watch handles and
        // disconnects the channel sender.
        self.watcher = None;
    }
}
