//! Error taxonomy for sync sessions.
//!
//! Fatal conditions abort the whole session and surface as [`Error`].
//! Per-file problems never abort a session; they are collected as
//! [`FileError`] values in the session report.

use serde::Serialize;
use std::fmt;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Session-level failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Magic mismatch or no mutually implemented protocol version.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The file list could not be decoded or encoded.
    #[error("malformed manifest: {0}")]
    Manifest(String),

    /// Connection read/write failure. Retrying needs a fresh connection.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer broke the message contract (unknown type, bad id, ...).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer reported a failure with an `error` message.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// Local failure outside any single file, such as an unreadable source root.
    #[error("local error: {0}")]
    Local(String),

    /// A blocked operation observed the session cancellation signal.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Keep the whole `anyhow` context chain in the message.
    pub fn local(err: anyhow::Error) -> Self {
        Self::Local(format!("{:#}", err))
    }

    /// True when the connection itself should be considered broken.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// True when the failure was reported by the peer.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Whether the peer should be told about this failure with an `error`
    /// frame. Transport faults cannot be reported, remote errors already
    /// came from the peer.
    pub(crate) fn should_notify_peer(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::Manifest(_) | Self::Protocol(_) | Self::Local(_)
        )
    }

    /// Wire code used when reporting this error to the peer.
    pub(crate) fn code(&self) -> u16 {
        match self {
            Self::Handshake(_) => ErrorCode::Handshake as u16,
            Self::Manifest(_) => ErrorCode::Manifest as u16,
            Self::Protocol(_) => ErrorCode::Protocol as u16,
            Self::Transport(_) | Self::Remote(_) | Self::Local(_) | Self::Cancelled => {
                ErrorCode::Internal as u16
            }
        }
    }
}

/// Codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Internal = 1,
    Handshake = 2,
    Manifest = 3,
    Protocol = 4,
}

/// A failure reported by the peer through an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: u16,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Category of a per-file failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileErrorKind {
    /// Local I/O failure (open, read, write, permission).
    Io,
    /// A delta arrived but the base file could not be used.
    MissingBase,
    /// The delta stream did not apply cleanly to the base.
    DeltaMismatch,
    /// Path or symlink target rejected as unsafe.
    UnsafePath,
    /// File type that the protocol does not carry.
    Unsupported,
    /// The enumerator reported a walk error for this entry.
    Walk,
    /// The transfer was requested but never completed by the peer.
    Incomplete,
}

/// Non-fatal failure tied to one manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub path: String,
    pub kind: FileErrorKind,
    pub message: String,
}

impl FileError {
    pub fn new(path: impl Into<String>, kind: FileErrorKind, err: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            kind,
            message: err.to_string(),
        }
    }

    /// Build from an `anyhow` chain, keeping every context layer.
    pub fn from_anyhow(path: impl Into<String>, kind: FileErrorKind, err: &anyhow::Error) -> Self {
        Self {
            path: path.into(),
            kind,
            message: format!("{:#}", err),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}: {}", self.path, self.kind, self.message)
    }
}
