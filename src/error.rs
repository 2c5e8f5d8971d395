//! Error types for the motion bridge.
//!
//! Each concern owns a `thiserror` enum ([`FormatError`] for capture payloads,
//! [`UpstreamError`] for the generation server link, [`TunnelError`] for the
//! forwarding child process). [`BridgeError`] is what control-plane handlers
//! return and maps every class onto an HTTP status code. Upstream and tunnel
//! failures never reach a handler: runs report them as status messages and
//! the watchdog retries the tunnel.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result alias used by control-plane and library operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// A capture payload or artifact that cannot be turned into a canonical clip.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The `.npz` container itself is unreadable.
    #[error("invalid npz archive: {0}")]
    Archive(String),

    /// One `.npy` member is malformed.
    #[error("invalid npy member '{member}': {reason}")]
    Npy { member: String, reason: String },

    /// A member uses a dtype the codec does not handle.
    #[error("unsupported dtype '{descr}' in member '{member}'")]
    UnsupportedDtype { member: String, descr: String },

    /// None of the recognized field sets is present.
    #[error("unsupported npz format, got keys: {fields:?}")]
    UnrecognizedShape { fields: Vec<String> },

    /// A shape was detected but one of its companion fields is absent.
    #[error("{shape} capture is missing field '{field}'")]
    MissingField {
        shape: &'static str,
        field: &'static str,
    },

    #[error("fps must be a positive number, got {0}")]
    InvalidFps(f64),

    /// A field has the wrong dimensionality or column count.
    #[error("field '{field}' has shape {found:?}, expected {expected}")]
    BadShape {
        field: &'static str,
        expected: String,
        found: Vec<usize>,
    },

    /// Fields disagree on the number of frames.
    #[error("field '{field}' has {found} frames, expected {expected}")]
    FrameMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    /// A supplied joint-name list does not match the canonical skeleton.
    #[error("joint_names do not match the canonical joint order")]
    JointNames,

    /// The two joint-name lists do not describe a bijection.
    #[error("joint lists are not a permutation of each other: {0}")]
    Permutation(String),
}

/// Failures talking to the remote generation server through the tunnel.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed before a response arrived")]
    Closed,
}

/// Failures of the forwarding child process.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("'{command}' not found in PATH")]
    CommandMissing { command: String },

    #[error("failed to spawn tunnel: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("tunnel exited immediately ({status})")]
    ExitedImmediately { status: String },
}

/// Top-level error type; every variant maps onto one response status.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed or missing request fields.
    #[error("{0}")]
    Validation(String),

    /// Referenced artifact is absent.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate save without overwrite, or a generation already in flight.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Format(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
