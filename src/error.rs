//! Common error type and result alias used across the crate.
//!
//! Every failure is terminal for the current invocation: the binary maps an
//! `AppError` to a descriptive message and a nonzero exit, and nothing is
//! written to the workflow document once any step has failed.
use std::path::PathBuf;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Pool definitions missing, unreadable, or referencing an unknown mode.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown style preset '{0}'")]
    UnknownPreset(String),

    #[error("unknown negative group '{0}'")]
    UnknownGroup(String),

    /// A node exists but is not of the class the operation expects.
    #[error("node {node} is not a {expected} block")]
    RoleMismatch { node: String, expected: String },

    #[error("{0}")]
    NodeNotFound(String),

    /// A required upstream node is absent and this operation will not create it.
    #[error("{0}")]
    DependencyMissing(String),

    /// An optional feature was requested without its required parameters.
    #[error("{0}")]
    MissingArgument(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
