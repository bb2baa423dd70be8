use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Navigation error: {0}")]
    Navigation(String),

    #[error("{0}")]
    Command(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Instruction not allowed: {0}")]
    Security(String),

    #[error("Screenshot error: {0}")]
    Screenshot(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Failure class reported on execution records.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Generation(_) | Error::Provider(_) => ErrorKind::Generation,
            Error::Navigation(_) => ErrorKind::Navigation,
            Error::Command(_) | Error::Timeout(_) => ErrorKind::Command,
            Error::Session(_) => ErrorKind::Session,
            Error::Security(_) => ErrorKind::Security,
            Error::Screenshot(_) => ErrorKind::Screenshot,
            Error::Config(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Storage(_)
            | Error::Other(_) => ErrorKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Generation,
    Navigation,
    Command,
    Session,
    Security,
    Screenshot,
    Other,
}

pub type Result<T> = std::result::Result<T, Error>;
