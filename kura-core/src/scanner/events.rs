//! Per-event reconciliation: each scan event commits as one database
//! transaction that brings the catalog in line with what the event reports.
//!
//! The central piece is [`apply_file`], which handles new content, content
//! changes, copies and re-found files through content-identity matching. The
//! other event kinds either reduce to it or are narrow bookkeeping updates.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Connection, SqliteConnection};
use tracing::{debug, warn};

use kura_model::{AssetId, FileId, FileRecord, ScanEvent};

use crate::db;
use crate::error::Result;
use crate::library::LibraryHandle;
use crate::scanner::ScanContext;

/// Apply an event to the database inside its own transaction.
#[async_trait]
pub trait CommitEvent {
    async fn commit(&self, library: &LibraryHandle, ctx: &ScanContext) -> Result<()>;
}

#[async_trait]
impl CommitEvent for ScanEvent {
    async fn commit(&self, library: &LibraryHandle, ctx: &ScanContext) -> Result<()> {
        let mut conn = ctx.pool.acquire().await?;
        commit_on(self, &mut conn, library, ctx).await
    }
}

/// Commit an event on an already-acquired connection. Workers hold one
/// connection for their lifetime and call this per event.
pub(crate) async fn commit_on(
    event: &ScanEvent,
    conn: &mut SqliteConnection,
    library: &LibraryHandle,
    ctx: &ScanContext,
) -> Result<()> {
    let mut tx = conn.begin().await?;
    match event {
        ScanEvent::File { path } => apply_file(&mut tx, library, ctx, path).await?,
        ScanEvent::FileModified { path } => apply_file_modified(&mut tx, library, ctx, path).await?,
        ScanEvent::FileMoved { old_path, new_path } => {
            apply_file_moved(&mut tx, library, ctx, old_path, new_path).await?
        }
        ScanEvent::FileRemoved { path } => apply_file_removed(&mut tx, library, ctx, path).await?,
        ScanEvent::DirectoryMoved { old_path, new_path } => {
            apply_directory_moved(&mut tx, library, ctx, old_path, new_path).await?
        }
        ScanEvent::DirectoryRemoved { path } => {
            apply_directory_removed(&mut tx, library, ctx, path).await?
        }
    }
    tx.commit().await?;
    Ok(())
}

fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn basename(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn is_ignore_marker(path: &str, ctx: &ScanContext) -> bool {
    ctx.config.ignore_marker.as_deref() == Some(basename(path))
}

/// Let the handler of the asset's kind react to changed file rows.
async fn notify_asset(
    conn: &mut SqliteConnection,
    library: &LibraryHandle,
    ctx: &ScanContext,
    asset_id: AssetId,
) -> Result<()> {
    if let Some(asset) = db::asset_by_id(conn, asset_id).await? {
        ctx.handlers
            .dispatch_files_changed(&asset, library, conn)
            .await?;
    }
    Ok(())
}

async fn mark_missing(
    conn: &mut SqliteConnection,
    library: &LibraryHandle,
    ctx: &ScanContext,
    mut file: FileRecord,
) -> Result<()> {
    file.availability = None;
    db::update_file(conn, &file).await?;
    notify_asset(conn, library, ctx, file.asset_id).await
}

/// Reconcile a file that exists on storage.
///
/// Matching works on two keys: the path and the content digest. Depending on
/// which of the two finds something, this covers new files, content edits,
/// copies, and re-found files that went missing earlier.
async fn apply_file(
    conn: &mut SqliteConnection,
    library: &LibraryHandle,
    ctx: &ScanContext,
    path: &str,
) -> Result<()> {
    if is_ignore_marker(path, ctx) {
        library.invalidate_ignored().await;
    }
    if library.is_path_ignored(path, &ctx.config).await? {
        if let Some(row) = db::file_by_path(conn, library.record().id, path).await? {
            if row.available() {
                debug!("{path:?} is now inside an ignored directory, marking it missing");
                mark_missing(conn, library, ctx, row).await?;
            }
        }
        return Ok(());
    }

    let content = match library.storage().read(path).await {
        Ok(content) => content,
        Err(err) => {
            // The file vanished between the event and us looking at it.
            debug!("could not read {path:?} ({err}), treating it as missing");
            if let Some(row) = db::file_by_path(conn, library.record().id, path).await? {
                if row.available() {
                    mark_missing(conn, library, ctx, row).await?;
                }
            }
            return Ok(());
        }
    };
    let digest = content_digest(&content);
    let library_id = library.record().id;

    match db::file_by_path(conn, library_id, path).await? {
        Some(mut row) if row.digest == digest => {
            // Same content as we last saw at this path. Confirm presence;
            // handlers only hear about it if the row was missing before.
            let was_missing = !row.available();
            row.availability = Some(Utc::now());
            db::update_file(conn, &row).await?;
            if was_missing {
                notify_asset(conn, library, ctx, row.asset_id).await?;
            }
            Ok(())
        }
        Some(row) => {
            // The content at a tracked path changed. Find where the new
            // content belongs and re-point the row there.
            let previous_asset = row.asset_id;
            match resolve_asset(conn, library, ctx, path, &digest, Some(row.id)).await? {
                Some(asset_id) => {
                    let mut row = row;
                    row.asset_id = asset_id;
                    row.digest = digest;
                    row.availability = Some(Utc::now());
                    db::update_file(conn, &row).await?;
                    if previous_asset != asset_id {
                        notify_asset(conn, library, ctx, previous_asset).await?;
                    }
                    notify_asset(conn, library, ctx, asset_id).await?;
                }
                None => {
                    // The new content was not claimed by anyone. The row
                    // cannot stay attached to content it no longer holds.
                    debug!("changed content at {path:?} was not claimed, marking the row missing");
                    mark_missing(conn, library, ctx, row).await?;
                }
            }
            Ok(())
        }
        None => {
            // Nothing tracked at this path. A missing row with the same
            // content is the same file re-found elsewhere; claim it back
            // before considering the file new.
            let missing = db::files_with_digest(conn, library_id, &digest, Some(false)).await?;
            if let Some(mut row) = missing.into_iter().next() {
                debug!("re-found content of {:?} at {path:?}", row.path);
                row.path = path.to_string();
                row.availability = Some(Utc::now());
                db::update_file(conn, &row).await?;
                notify_asset(conn, library, ctx, row.asset_id).await?;
                return Ok(());
            }

            // A present file with identical content makes this a copy: the
            // new row joins its asset without consulting handlers.
            let present = db::files_with_digest(conn, library_id, &digest, Some(true)).await?;
            if let Some(original) = present.into_iter().next() {
                debug!("{path:?} is a copy of {:?}", original.path);
                let row = FileRecord {
                    id: FileId::new(),
                    asset_id: original.asset_id,
                    library_id,
                    path: path.to_string(),
                    digest,
                    availability: Some(Utc::now()),
                };
                db::insert_file(conn, &row).await?;
                return Ok(());
            }

            match resolve_asset(conn, library, ctx, path, &digest, None).await? {
                Some(asset_id) => {
                    let row = FileRecord {
                        id: FileId::new(),
                        asset_id,
                        library_id,
                        path: path.to_string(),
                        digest,
                        availability: Some(Utc::now()),
                    };
                    db::insert_file(conn, &row).await?;
                    notify_asset(conn, library, ctx, asset_id).await?;
                }
                None => {
                    debug!("{path:?} was not claimed, leaving it untracked");
                }
            }
            Ok(())
        }
    }
}

/// Find the asset that content with `digest` belongs to: another present
/// file with the same content, an asset with that identity, or whatever a
/// handler claims. `exclude` hides the row being reconciled from the
/// same-content search.
async fn resolve_asset(
    conn: &mut SqliteConnection,
    library: &LibraryHandle,
    ctx: &ScanContext,
    path: &str,
    digest: &str,
    exclude: Option<FileId>,
) -> Result<Option<AssetId>> {
    let library_id = library.record().id;
    let present = db::files_with_digest(conn, library_id, digest, Some(true)).await?;
    if let Some(twin) = present.into_iter().find(|row| Some(row.id) != exclude) {
        return Ok(Some(twin.asset_id));
    }
    if let Some(asset) = db::asset_by_identity(conn, library_id, digest).await? {
        return Ok(Some(asset.id));
    }
    ctx.handlers
        .dispatch_new_file(&library.record().context, path, library, conn)
        .await
}

/// A possibly-redundant modification report. When the tracked row was
/// confirmed after the file's last modification, nothing needs to happen;
/// this is what keeps full rescans cheap.
async fn apply_file_modified(
    conn: &mut SqliteConnection,
    library: &LibraryHandle,
    ctx: &ScanContext,
    path: &str,
) -> Result<()> {
    let row = db::file_by_path(conn, library.record().id, path).await?;
    let Some(row) = row.filter(|row| row.available()) else {
        return apply_file(conn, library, ctx, path).await;
    };

    if is_ignore_marker(path, ctx) {
        library.invalidate_ignored().await;
    }
    if library.is_path_ignored(path, &ctx.config).await? {
        return mark_missing(conn, library, ctx, row).await;
    }

    match library.storage().get_modified_time(path).await {
        Ok(modified) if row.availability.is_some_and(|seen| seen > modified) => {
            // Already confirmed since the last write, nothing to do.
            Ok(())
        }
        // Unknown modification time is treated as a change.
        _ => apply_file(conn, library, ctx, path).await,
    }
}

async fn apply_file_moved(
    conn: &mut SqliteConnection,
    library: &LibraryHandle,
    ctx: &ScanContext,
    old_path: &str,
    new_path: &str,
) -> Result<()> {
    if is_ignore_marker(old_path, ctx) || is_ignore_marker(new_path, ctx) {
        library.invalidate_ignored().await;
    }

    let row = db::file_by_path(conn, library.record().id, old_path).await?;
    let Some(mut row) = row.filter(|row| row.available()) else {
        // The old path was never tracked; treat the destination as a find.
        return apply_file(conn, library, ctx, new_path).await;
    };

    row.path = new_path.to_string();
    if library.is_path_ignored(new_path, &ctx.config).await? {
        debug!("{old_path:?} moved into an ignored directory, marking it missing");
        row.availability = None;
    } else {
        row.availability = Some(Utc::now());
    }
    db::update_file(conn, &row).await?;
    notify_asset(conn, library, ctx, row.asset_id).await
}

async fn apply_file_removed(
    conn: &mut SqliteConnection,
    library: &LibraryHandle,
    ctx: &ScanContext,
    path: &str,
) -> Result<()> {
    if is_ignore_marker(path, ctx) {
        library.invalidate_ignored().await;
    }
    match db::file_by_path(conn, library.record().id, path).await? {
        Some(row) if row.available() => mark_missing(conn, library, ctx, row).await,
        _ => {
            debug!("removal of untracked path {path:?}, nothing to do");
            Ok(())
        }
    }
}

/// Rewrite the path prefix of every row under the moved directory, present
/// and missing alike, so missing rows can still be re-found at their new
/// location later.
async fn apply_directory_moved(
    conn: &mut SqliteConnection,
    library: &LibraryHandle,
    ctx: &ScanContext,
    old_path: &str,
    new_path: &str,
) -> Result<()> {
    // Marker files inside the directory moved along with it.
    library.invalidate_ignored().await;

    let rows = db::files_under_directory(conn, library.record().id, old_path).await?;
    if rows.is_empty() {
        debug!("move of untracked directory {old_path:?}, nothing to do");
        return Ok(());
    }

    let into_ignored = library.is_path_ignored(new_path, &ctx.config).await?;
    let prefix_len = old_path.trim_end_matches('/').len() + 1;
    let mut touched_assets: HashSet<AssetId> = HashSet::new();
    for mut row in rows {
        let suffix = &row.path[prefix_len..];
        row.path = format!("{}/{suffix}", new_path.trim_end_matches('/'));
        if into_ignored && row.available() {
            row.availability = None;
        }
        touched_assets.insert(row.asset_id);
        db::update_file(conn, &row).await?;
    }
    for asset_id in touched_assets {
        notify_asset(conn, library, ctx, asset_id).await?;
    }
    Ok(())
}

async fn apply_directory_removed(
    conn: &mut SqliteConnection,
    library: &LibraryHandle,
    ctx: &ScanContext,
    path: &str,
) -> Result<()> {
    // Any marker files inside are gone too.
    library.invalidate_ignored().await;

    let rows = db::files_under_directory(conn, library.record().id, path).await?;
    let mut touched_assets: HashSet<AssetId> = HashSet::new();
    let mut any = false;
    for mut row in rows {
        if !row.available() {
            continue;
        }
        any = true;
        row.availability = None;
        touched_assets.insert(row.asset_id);
        db::update_file(conn, &row).await?;
    }
    if !any {
        warn!("removal of directory {path:?} matched no tracked files");
    }
    for asset_id in touched_assets {
        notify_asset(conn, library, ctx, asset_id).await?;
    }
    Ok(())
}
