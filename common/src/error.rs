//! Transfer error taxonomy shared by every protocol module.
//!
//! Every failure surfaced to the pipeline, to history or to a remote peer is
//! expressed with a [`TransferErrorCode`]. Protocol modules translate their own
//! wire vocabulary to and from this enumeration at their boundary.

use serde::{Deserialize, Serialize};

/// Closed set of transfer error codes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum TransferErrorCode {
    #[default]
    Ok,
    Unknown,
    Internal,
    Unimplemented,
    Connection,
    ConnectionReset,
    UnknownRemote,
    ExceededLimit,
    BadAuthentication,
    DataTransfer,
    Integrity,
    Finalization,
    ExternalOperation,
    Warning,
    Stopped,
    Cancelled,
    FileNotFound,
    Forbidden,
    BadSize,
    ShuttingDown,
}

impl TransferErrorCode {
    /// Whether the code represents a lifecycle signal rather than a failure.
    pub fn is_signal(self) -> bool {
        matches!(self, Self::Stopped | Self::Cancelled | Self::ShuttingDown)
    }
}

/// A typed transfer failure: a code plus a human-readable detail message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("TransferError({code}): {details}")]
pub struct TransferError {
    pub code: TransferErrorCode,
    pub details: String,
}

impl TransferError {
    pub fn new(code: TransferErrorCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
        }
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(TransferErrorCode::Internal, details)
    }

    /// Wraps an arbitrary error, keeping its full message chain.
    pub fn with_cause(
        code: TransferErrorCode,
        details: impl Into<String>,
        cause: &dyn std::fmt::Display,
    ) -> Self {
        Self::new(code, format!("{}: {cause}", details.into()))
    }
}

impl From<crate::store::DbError> for TransferError {
    fn from(err: crate::store::DbError) -> Self {
        tracing::error!("database error: {err:#}");
        Self::internal("database error")
    }
}

/// Maps a filesystem error to the closest transfer error code.
pub fn io_to_transfer_error(err: &std::io::Error) -> TransferError {
    match err.kind() {
        std::io::ErrorKind::NotFound => TransferError::new(TransferErrorCode::FileNotFound, "file not found"),
        std::io::ErrorKind::PermissionDenied => {
            TransferError::new(TransferErrorCode::Forbidden, "file operation not allowed")
        }
        _ => TransferError::with_cause(TransferErrorCode::Internal, "file operation failed", err),
    }
}
