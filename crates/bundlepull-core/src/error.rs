//! Transfer-specific error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised transfer error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
    /// Remote or local path the error refers to, if any.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// Remote path does not exist.
    NotFound,
    /// Remote path names a directory where a file was expected.
    IsDirectory,
    /// Connection / transport-level failure. Triggers fallback.
    TransportLost,
    /// Local filesystem read/write failure.
    IoError,
    /// A batched stat call failed as a unit. Recoverable — retry per path.
    BatchStatFailed,
    /// No transport left to try. Terminal.
    NoViableTransport,
    /// TCP connect / SSH handshake / channel setup failure.
    ConnectionFailed,
    /// SSH authentication failed.
    AuthFailed,
    /// Config / parameter validation error.
    InvalidConfig,
}

pub type TransferResult<T> = Result<T, TransferError>;

// ── Construction helpers ─────────────────────────────────────────────

impl TransferError {
    pub fn new(kind: TransferErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn not_found(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            TransferErrorKind::NotFound,
            format!("Remote path not found: {}", path),
        )
        .with_path(path)
    }

    pub fn is_directory(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            TransferErrorKind::IsDirectory,
            format!("Remote path is a directory: {}", path),
        )
        .with_path(path)
    }

    pub fn transport_lost(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::TransportLost, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::IoError, msg)
    }

    pub fn batch_stat_failed(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::BatchStatFailed, msg)
    }

    pub fn no_viable_transport(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::NoViableTransport, msg)
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::ConnectionFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::AuthFailed, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::InvalidConfig, msg)
    }

    // ── Classification ───────────────────────────────────────────

    /// Transport-level loss escalates to the fallback controller instead of
    /// being recorded as a per-file failure.
    pub fn is_transport_loss(&self) -> bool {
        self.kind == TransferErrorKind::TransportLost
    }

    /// Recoverable errors are retried at a finer granularity (a failed
    /// batch stat falls back to per-path stats) rather than propagated.
    pub fn is_recoverable(&self) -> bool {
        self.kind == TransferErrorKind::BatchStatFailed
    }

    /// Terminal errors end the whole operation without a successful result.
    pub fn is_terminal(&self) -> bool {
        self.kind == TransferErrorKind::NoViableTransport
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref path) = self.path {
            write!(f, "[{:?}] {} ({})", self.kind, self.message, path)
        } else {
            write!(f, "[{:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for TransferError {}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<TransferError> for String {
    fn from(e: TransferError) -> String {
        e.message
    }
}
