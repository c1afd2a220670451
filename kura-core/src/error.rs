use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("model error: {0}")]
    Model(#[from] kura_model::ModelError),

    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid storage configuration: {0}")]
    Validation(String),

    #[error("storage backend {0:?} does not support watching for changes")]
    WatchUnsupported(String),

    #[error("corrupt database row: {0}")]
    Decode(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;
