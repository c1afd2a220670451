//! Content handlers decide which files belong in the catalog and keep their
//! asset groups consistent after changes.
//!
//! The engine itself knows nothing about particular media types. When an
//! untracked file turns up it asks every registered handler to claim it;
//! exactly one claim wins, anything else and the file stays out of the
//! catalog. After rows of an existing asset change, the handler registered
//! for that asset's kind gets a chance to re-validate the group.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use kura_model::{AssetId, AssetKind, AssetRecord, Visibility};

use crate::db;
use crate::error::Result;
use crate::library::LibraryHandle;

/// Per-kind plugin interface for catalog membership decisions.
#[async_trait]
pub trait ContentHandler: Send + Sync {
    /// Asset kind this handler produces and maintains.
    fn kind(&self) -> AssetKind;

    /// Whether processing holds a device that tolerates only one user at a
    /// time. When any registered handler reports this, event processing
    /// falls back to a single worker.
    fn requires_exclusive_device(&self) -> bool {
        false
    }

    /// Decide whether the new file at `path` belongs to this handler. A
    /// `Some` return names the asset (existing or freshly created) the file
    /// record should attach to.
    async fn claim_new_file(
        &self,
        context: &str,
        path: &str,
        library: &LibraryHandle,
        conn: &mut SqliteConnection,
    ) -> Result<Option<AssetId>>;

    /// Called after the engine changed file rows of `asset` so derived state
    /// can be brought back in line with what is on disk.
    async fn files_changed(
        &self,
        asset: &AssetRecord,
        library: &LibraryHandle,
        conn: &mut SqliteConnection,
    ) -> Result<()>;
}

/// Ordered collection of content handlers consulted by the engine.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ContentHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = self.handlers.iter().map(|h| h.kind().as_str()).collect();
        f.debug_struct("HandlerRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ContentHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn any_exclusive_device(&self) -> bool {
        self.handlers.iter().any(|h| h.requires_exclusive_device())
    }

    /// Offer a new file to every handler. The file enters the catalog only
    /// when exactly one handler claims it; zero claims and competing claims
    /// both leave it untracked.
    pub(crate) async fn dispatch_new_file(
        &self,
        context: &str,
        path: &str,
        library: &LibraryHandle,
        conn: &mut SqliteConnection,
    ) -> Result<Option<AssetId>> {
        let mut claims: Vec<(AssetKind, AssetId)> = Vec::new();
        for handler in &self.handlers {
            if let Some(asset_id) = handler.claim_new_file(context, path, library, conn).await? {
                claims.push((handler.kind(), asset_id));
            }
        }
        match claims.as_slice() {
            [] => {
                debug!("no handler claimed {path:?}, leaving it untracked");
                Ok(None)
            }
            [(_, asset_id)] => Ok(Some(*asset_id)),
            many => {
                let kinds: Vec<&str> = many.iter().map(|(kind, _)| kind.as_str()).collect();
                warn!("{path:?} was claimed by multiple handlers ({kinds:?}), dropping it");
                Ok(None)
            }
        }
    }

    /// Route a changed-files notification to the handler owning the asset's
    /// kind. Assets of a kind no handler covers are left alone.
    pub(crate) async fn dispatch_files_changed(
        &self,
        asset: &AssetRecord,
        library: &LibraryHandle,
        conn: &mut SqliteConnection,
    ) -> Result<()> {
        let Some(handler) = self.handlers.iter().find(|h| h.kind() == asset.kind) else {
            debug!(
                "no handler registered for kind {:?}, skipping files-changed for asset {}",
                asset.kind, asset.id
            );
            return Ok(());
        };
        handler.files_changed(asset, library, conn).await
    }
}

/// Catch-all handler that claims every file in libraries of its context and
/// groups byte-identical content into one asset.
#[derive(Debug)]
pub struct GenericFileHandler {
    context: String,
}

impl GenericFileHandler {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }
}

#[async_trait]
impl ContentHandler for GenericFileHandler {
    fn kind(&self) -> AssetKind {
        AssetKind::Generic
    }

    async fn claim_new_file(
        &self,
        context: &str,
        path: &str,
        library: &LibraryHandle,
        conn: &mut SqliteConnection,
    ) -> Result<Option<AssetId>> {
        if context != self.context {
            return Ok(None);
        }
        let content = library.storage().read(path).await?;
        let digest = hex::encode(Sha256::digest(&content));

        let library_id = library.record().id;
        if let Some(existing) =
            db::asset_by_kind_and_identity(conn, library_id, AssetKind::Generic, &digest).await?
        {
            return Ok(Some(existing.id));
        }

        let asset = AssetRecord {
            id: AssetId::new(),
            library_id,
            kind: AssetKind::Generic,
            identity_digest: digest,
            visibility: Visibility::Inherit,
        };
        db::insert_asset(conn, &asset).await?;
        Ok(Some(asset.id))
    }

    async fn files_changed(
        &self,
        asset: &AssetRecord,
        library: &LibraryHandle,
        conn: &mut SqliteConnection,
    ) -> Result<()> {
        // Every confirmed-present row must still hold the asset's content.
        // Rows that drifted or vanished are marked missing rather than
        // deleted so a later refind can reuse them.
        let files = db::files_of_asset(conn, asset.id).await?;
        for mut file in files {
            if !file.available() {
                continue;
            }
            let digest = match library.storage().read(&file.path).await {
                Ok(content) => Some(hex::encode(Sha256::digest(&content))),
                Err(_) => None,
            };
            if digest.as_deref() != Some(asset.identity_digest.as_str()) {
                debug!(
                    "file {:?} no longer matches asset {}, marking it missing",
                    file.path, asset.id
                );
                file.availability = None;
                db::update_file(conn, &file).await?;
            }
        }
        Ok(())
    }
}
