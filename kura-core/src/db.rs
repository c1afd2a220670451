//! Persistence layer for libraries, assets and files.
//!
//! All mutating functions take a `&mut SqliteConnection` so callers can
//! compose them inside a single transaction; the reconciliation engine wraps
//! every event commit in one.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection};
use uuid::Uuid;

use kura_model::{
    AssetId, AssetKind, AssetRecord, FileId, FileRecord, Library, LibraryId, Visibility,
};

use crate::error::{Result, ScanError};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Open (creating if necessary) a database at the given sqlite URL and bring
/// the schema up to date.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests and one-off runs.
///
/// Every sqlite connection to `:memory:` gets its own database, so the pool
/// is pinned to a single connection.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|err| ScanError::Decode(format!("bad uuid {value:?}: {err}")))
}

#[derive(Debug, FromRow)]
struct LibraryRow {
    id: String,
    source: String,
    context: String,
    default_visibility: i64,
    created_at: DateTime<Utc>,
}

impl LibraryRow {
    fn into_library(self) -> Result<Library> {
        Ok(Library {
            id: LibraryId(parse_uuid(&self.id)?),
            source: self.source,
            context: self.context,
            default_visibility: Visibility::from_i64(self.default_visibility)?,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AssetRow {
    id: String,
    library_id: String,
    kind: String,
    identity_digest: String,
    visibility: i64,
}

impl AssetRow {
    fn into_asset(self) -> Result<AssetRecord> {
        Ok(AssetRecord {
            id: AssetId(parse_uuid(&self.id)?),
            library_id: LibraryId(parse_uuid(&self.library_id)?),
            kind: AssetKind::parse(&self.kind)?,
            identity_digest: self.identity_digest,
            visibility: Visibility::from_i64(self.visibility)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct FileRow {
    id: String,
    asset_id: String,
    library_id: String,
    path: String,
    digest: String,
    availability: Option<DateTime<Utc>>,
}

impl FileRow {
    fn into_file(self) -> Result<FileRecord> {
        Ok(FileRecord {
            id: FileId(parse_uuid(&self.id)?),
            asset_id: AssetId(parse_uuid(&self.asset_id)?),
            library_id: LibraryId(parse_uuid(&self.library_id)?),
            path: self.path,
            digest: self.digest,
            availability: self.availability,
        })
    }
}

pub async fn insert_library(conn: &mut SqliteConnection, library: &Library) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO libraries (id, source, context, default_visibility, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(library.id.to_string())
    .bind(&library.source)
    .bind(&library.context)
    .bind(library.default_visibility.as_i64())
    .bind(library.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_library(
    conn: &mut SqliteConnection,
    id: LibraryId,
) -> Result<Option<Library>> {
    let row = sqlx::query_as::<_, LibraryRow>(
        r#"
        SELECT id, source, context, default_visibility, created_at
        FROM libraries
        WHERE id = $1
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(conn)
    .await?;
    row.map(LibraryRow::into_library).transpose()
}

pub async fn insert_asset(conn: &mut SqliteConnection, asset: &AssetRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO assets (id, library_id, kind, identity_digest, visibility)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(asset.id.to_string())
    .bind(asset.library_id.to_string())
    .bind(asset.kind.as_str())
    .bind(&asset.identity_digest)
    .bind(asset.visibility.as_i64())
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn asset_by_id(
    conn: &mut SqliteConnection,
    id: AssetId,
) -> Result<Option<AssetRecord>> {
    let row = sqlx::query_as::<_, AssetRow>(
        r#"
        SELECT id, library_id, kind, identity_digest, visibility
        FROM assets
        WHERE id = $1
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(conn)
    .await?;
    row.map(AssetRow::into_asset).transpose()
}

/// Look up an asset by its content identity, regardless of kind. Used by the
/// engine to re-attach content that matches a group that already exists.
pub async fn asset_by_identity(
    conn: &mut SqliteConnection,
    library_id: LibraryId,
    identity_digest: &str,
) -> Result<Option<AssetRecord>> {
    let row = sqlx::query_as::<_, AssetRow>(
        r#"
        SELECT id, library_id, kind, identity_digest, visibility
        FROM assets
        WHERE library_id = $1 AND identity_digest = $2
        LIMIT 1
        "#,
    )
    .bind(library_id.to_string())
    .bind(identity_digest)
    .fetch_optional(conn)
    .await?;
    row.map(AssetRow::into_asset).transpose()
}

pub async fn asset_by_kind_and_identity(
    conn: &mut SqliteConnection,
    library_id: LibraryId,
    kind: AssetKind,
    identity_digest: &str,
) -> Result<Option<AssetRecord>> {
    let row = sqlx::query_as::<_, AssetRow>(
        r#"
        SELECT id, library_id, kind, identity_digest, visibility
        FROM assets
        WHERE library_id = $1 AND kind = $2 AND identity_digest = $3
        LIMIT 1
        "#,
    )
    .bind(library_id.to_string())
    .bind(kind.as_str())
    .bind(identity_digest)
    .fetch_optional(conn)
    .await?;
    row.map(AssetRow::into_asset).transpose()
}

pub async fn asset_count(conn: &mut SqliteConnection, library_id: LibraryId) -> Result<i64> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM assets WHERE library_id = $1")
        .bind(library_id.to_string())
        .fetch_one(conn)
        .await?;
    Ok(count.0)
}

pub async fn insert_file(conn: &mut SqliteConnection, file: &FileRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO files (id, asset_id, library_id, path, digest, availability)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(file.id.to_string())
    .bind(file.asset_id.to_string())
    .bind(file.library_id.to_string())
    .bind(&file.path)
    .bind(&file.digest)
    .bind(file.availability)
    .execute(conn)
    .await?;
    Ok(())
}

/// Persist the mutable parts of a file record: asset reference, path, digest
/// and availability.
pub async fn update_file(conn: &mut SqliteConnection, file: &FileRecord) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE files
        SET asset_id = $2, path = $3, digest = $4, availability = $5
        WHERE id = $1
        "#,
    )
    .bind(file.id.to_string())
    .bind(file.asset_id.to_string())
    .bind(&file.path)
    .bind(&file.digest)
    .bind(file.availability)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn file_by_path(
    conn: &mut SqliteConnection,
    library_id: LibraryId,
    path: &str,
) -> Result<Option<FileRecord>> {
    let row = sqlx::query_as::<_, FileRow>(
        r#"
        SELECT id, asset_id, library_id, path, digest, availability
        FROM files
        WHERE library_id = $1 AND path = $2
        "#,
    )
    .bind(library_id.to_string())
    .bind(path)
    .fetch_optional(conn)
    .await?;
    row.map(FileRow::into_file).transpose()
}

/// Files in a library with the given content digest. `available` narrows the
/// result: `Some(true)` to confirmed-present files, `Some(false)` to missing
/// ones, `None` returns both.
pub async fn files_with_digest(
    conn: &mut SqliteConnection,
    library_id: LibraryId,
    digest: &str,
    available: Option<bool>,
) -> Result<Vec<FileRecord>> {
    let filter = match available {
        Some(true) => "AND availability IS NOT NULL",
        Some(false) => "AND availability IS NULL",
        None => "",
    };
    let query = format!(
        r#"
        SELECT id, asset_id, library_id, path, digest, availability
        FROM files
        WHERE library_id = $1 AND digest = $2 {filter}
        ORDER BY path
        "#
    );
    let rows = sqlx::query_as::<_, FileRow>(&query)
        .bind(library_id.to_string())
        .bind(digest)
        .fetch_all(conn)
        .await?;
    rows.into_iter().map(FileRow::into_file).collect()
}

/// Every file whose path sits under `directory`, available or not.
///
/// Matching happens on a directory boundary: `foo` covers `foo/x` but never
/// `foobar/x`. `substr` is used instead of LIKE so paths containing wildcard
/// characters cannot widen the match.
pub async fn files_under_directory(
    conn: &mut SqliteConnection,
    library_id: LibraryId,
    directory: &str,
) -> Result<Vec<FileRecord>> {
    let prefix = format!("{}/", directory.trim_end_matches('/'));
    let rows = sqlx::query_as::<_, FileRow>(
        r#"
        SELECT id, asset_id, library_id, path, digest, availability
        FROM files
        WHERE library_id = $1 AND substr(path, 1, $2) = $3
        ORDER BY path
        "#,
    )
    .bind(library_id.to_string())
    .bind(prefix.len() as i64)
    .bind(&prefix)
    .fetch_all(conn)
    .await?;
    rows.into_iter().map(FileRow::into_file).collect()
}

pub async fn files_of_asset(
    conn: &mut SqliteConnection,
    asset_id: AssetId,
) -> Result<Vec<FileRecord>> {
    let rows = sqlx::query_as::<_, FileRow>(
        r#"
        SELECT id, asset_id, library_id, path, digest, availability
        FROM files
        WHERE asset_id = $1
        ORDER BY path
        "#,
    )
    .bind(asset_id.to_string())
    .fetch_all(conn)
    .await?;
    rows.into_iter().map(FileRow::into_file).collect()
}

/// Paths of every confirmed-present file in the library. Drives the removal
/// step of a full scan.
pub async fn available_paths(
    conn: &mut SqliteConnection,
    library_id: LibraryId,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT path FROM files WHERE library_id = $1 AND availability IS NOT NULL",
    )
    .bind(library_id.to_string())
    .fetch_all(conn)
    .await?;
    Ok(rows.into_iter().map(|(path,)| path).collect())
}

pub async fn file_count(conn: &mut SqliteConnection, library_id: LibraryId) -> Result<i64> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files WHERE library_id = $1")
        .bind(library_id.to_string())
        .fetch_one(conn)
        .await?;
    Ok(count.0)
}
