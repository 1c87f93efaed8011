use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CovenantError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Signature error: {0}")]
    Signature(String),
    #[error("Knowledge snapshot is stale: {0}")]
    StaleSnapshot(String),
    #[error("Invalid proposal transition: {0}")]
    InvalidTransition(String),
    #[error("Not found: {0}")]
    NotFound(String),
}
