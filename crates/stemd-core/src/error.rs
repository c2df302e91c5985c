//! Error types shared across the stemd core

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the job service and its collaborators
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected submission or malformed request data
    #[error("{0}")]
    InvalidInput(String),

    #[error("Input file does not exist: {}", .0.display())]
    NotFound(PathBuf),

    /// On-disk cache inconsistency: digest mismatch, size mismatch,
    /// or a failed rename while finalizing weights
    #[error("Cache error: {0}")]
    Cache(String),

    /// Transport failure while downloading weights
    #[error("Weight download failed: {0}")]
    Fetch(String),

    /// The separation driver returned an error
    #[error("Separation failed: {0}")]
    Processing(String),

    /// A cooperative stop was observed mid-job
    #[error("{0}")]
    Cancelled(String),

    /// The worker pool is draining or already stopped
    #[error("{0}")]
    Shutdown(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
