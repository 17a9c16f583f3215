use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("memory write failed: {0}")]
    WriteFailed(String),

    #[error("fact not found: {id}")]
    FactNotFound { id: i64 },
}

pub type Result<T> = std::result::Result<T, MemoryError>;
