//! Error types for the daemon's seams.
//!
//! Catalog and engine failures are recovered inside the daemon (retry,
//! advance, or log-and-continue); only `ControlError` ever reaches an HTTP
//! caller.

use thiserror::Error;

/// Any failure talking to the remote catalog. Always treated as transient.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("catalog returned {status} for {endpoint}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },

    #[error("unexpected catalog response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("no CSRF token available, login first")]
    NotLoggedIn,
}

/// Failure of the media engine for the current playback attempt.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("mpv binary not found")]
    BinaryNotFound,

    #[error("failed to start mpv: {0}")]
    Spawn(String),

    #[error("mpv IPC: {0}")]
    Ipc(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejected control-surface requests.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown playlist: {0}")]
    UnknownPlaylist(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}
