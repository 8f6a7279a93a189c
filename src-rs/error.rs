//! Error taxonomy.
//!
//! Only [`ConfigError`] is fatal. Everything else is contained at frame or
//! scene granularity, or escalates to a fallback into standby.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid or missing configuration. Reported before any connection attempt.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration JSON {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required configuration keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Loss of, or failure on, the control connection. Recoverable: triggers a
/// fallback into standby.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{operation} timed out after {seconds:.1}s")]
    Timeout { operation: String, seconds: f64 },

    #[error("connection closed by remote")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{request_type} rejected (code {code}){}", comment_suffix(.comment))]
    Rejected {
        request_type: String,
        code: i64,
        comment: Option<String>,
    },

    #[error("{failures} consecutive capture failures; last: {last}")]
    CaptureCeiling {
        failures: u32,
        #[source]
        last: CaptureError,
    },
}

fn comment_suffix(comment: &Option<String>) -> String {
    comment
        .as_deref()
        .map(|c| format!(": {c}"))
        .unwrap_or_default()
}

impl ConnectionError {
    pub fn timeout(operation: impl Into<String>, limit: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds: limit.as_secs_f64(),
        }
    }
}

/// A single frame could not be acquired.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("screenshot request failed: {0}")]
    Remote(#[source] Box<ConnectionError>),

    #[error("capture program failed: {0}")]
    Program(String),

    #[error("capture timed out after {0:.1}s")]
    Timeout(f64),

    #[error("invalid image data: {0}")]
    Decode(String),
}

impl From<ConnectionError> for CaptureError {
    fn from(err: ConnectionError) -> Self {
        Self::Remote(Box::new(err))
    }
}

/// Item lookup or mutation failed inside one scene. Scoped to that scene:
/// the synchronization call carries on with the remaining scenes.
#[derive(Error, Debug)]
#[error("scene '{scene}': {source}")]
pub struct SceneLookupError {
    pub scene: String,
    #[source]
    pub source: ConnectionError,
}

/// The external detector could not produce a verdict.
#[derive(Error, Debug)]
pub enum DetectError {
    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("detector program failed: {0}")]
    Program(String),

    #[error("detector timed out after {0:.1}s")]
    Timeout(f64),

    #[error("unrecognized detector output: {0}")]
    Output(String),
}
