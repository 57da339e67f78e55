//! Error type shared by the maintenance tools

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unreadable or inconsistent TOML/environment settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database file, table or catalog row that should exist does not
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A pre-flight gate failed; nothing was mutated
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A post-flight check failed; the enclosing transaction rolls back
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The Clerk-to-Firebase mapping source failed
    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
