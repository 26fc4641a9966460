//! Error types shared by the core domain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("launch failed: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
