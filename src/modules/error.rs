//! Error types returned across the library seams.
//!
//! Application code mostly works with `anyhow::Result`; the enums here exist
//! where a caller has to tell failure classes apart (a protocol violation
//! closes a session, a rejected request does not).

use serde_json::Value;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of a single client session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The underlying socket failed.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    /// The peer violated the protocol (malformed JSON or a non-hello first record).
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The connection went away while a response was awaited.
    #[error("session closed")]
    Closed,
    /// The mount instance answered a request with a non-success state.
    #[error("request rejected: {0}")]
    Rejected(Value),
}

/// Failures while loading the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config {path}: {source}")]
    Read {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying I/O failure.
        source: io::Error,
    },
    /// The config file is not valid TOML for the expected schema.
    #[error("cannot parse config {path}: {source}")]
    Parse {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying parse failure.
        source: toml::de::Error,
    },
    /// The config parsed but is unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}
