//! Translation between [`TransferError`]s and the wire error vocabulary.

use common::pipeline::Interruptible;
use common::{TransferError, TransferErrorCode};

use crate::protocol::{WireError, WireErrorCode};

fn wire_code(code: TransferErrorCode) -> WireErrorCode {
    match code {
        TransferErrorCode::Ok => WireErrorCode::CompleteOk,
        TransferErrorCode::Unknown => WireErrorCode::Unknown,
        TransferErrorCode::Internal => WireErrorCode::Internal,
        TransferErrorCode::Unimplemented => WireErrorCode::Unimplemented,
        TransferErrorCode::Connection => WireErrorCode::ConnectionImpossible,
        TransferErrorCode::ConnectionReset => WireErrorCode::Disconnection,
        TransferErrorCode::UnknownRemote => WireErrorCode::QueryRemotelyUnknown,
        TransferErrorCode::ExceededLimit => WireErrorCode::ServerOverloaded,
        TransferErrorCode::BadAuthentication => WireErrorCode::BadAuthent,
        TransferErrorCode::DataTransfer => WireErrorCode::TransferError,
        TransferErrorCode::Integrity => WireErrorCode::FinalOp,
        TransferErrorCode::Finalization => WireErrorCode::FinalOp,
        TransferErrorCode::ExternalOperation => WireErrorCode::ExternalOperation,
        TransferErrorCode::Warning => WireErrorCode::Warning,
        TransferErrorCode::Stopped => WireErrorCode::StoppedTransfer,
        TransferErrorCode::Cancelled => WireErrorCode::CanceledTransfer,
        TransferErrorCode::FileNotFound => WireErrorCode::FileNotFound,
        TransferErrorCode::Forbidden => WireErrorCode::FileNotAllowed,
        TransferErrorCode::BadSize => WireErrorCode::SizeNotAllowed,
        TransferErrorCode::ShuttingDown => WireErrorCode::Shutdown,
    }
}

/// The internal code of a wire error, `None` for the success family.
pub fn from_wire_code(code: WireErrorCode) -> Option<TransferErrorCode> {
    use WireErrorCode as W;
    let code = match code {
        W::InitOk | W::PreProcessingOk | W::TransferOk | W::PostProcessingOk | W::CompleteOk => {
            return None;
        }
        W::ConnectionImpossible => TransferErrorCode::Connection,
        W::ServerOverloaded => TransferErrorCode::ExceededLimit,
        W::BadAuthent => TransferErrorCode::BadAuthentication,
        W::ExternalOperation => TransferErrorCode::ExternalOperation,
        W::TransferError => TransferErrorCode::DataTransfer,
        W::MD5Error => TransferErrorCode::Integrity,
        W::Disconnection => TransferErrorCode::ConnectionReset,
        W::RemoteShutdown | W::Shutdown => TransferErrorCode::ShuttingDown,
        W::FinalOp => TransferErrorCode::Finalization,
        W::Unimplemented | W::CommandNotFound | W::IncorrectCommand => {
            TransferErrorCode::Unimplemented
        }
        W::Internal => TransferErrorCode::Internal,
        W::Warning => TransferErrorCode::Warning,
        W::FileNotFound => TransferErrorCode::FileNotFound,
        W::FileNotAllowed | W::SizeNotAllowed => TransferErrorCode::Forbidden,
        W::StoppedTransfer => TransferErrorCode::Stopped,
        W::CanceledTransfer => TransferErrorCode::Cancelled,
        W::RemoteError
        | W::Unknown
        | W::QueryAlreadyFinished
        | W::QueryStillRunning
        | W::NotKnownHost
        | W::QueryRemotelyUnknown
        | W::PassThroughMode
        | W::Running => TransferErrorCode::UnknownRemote,
    };
    Some(code)
}

/// Converts a local failure into the error sent to the partner.
pub fn to_wire(err: &TransferError) -> WireError {
    WireError::new(wire_code(err.code), err.details.clone())
}

/// Wraps any other failure, keeping its message.
pub fn to_wire_any(err: &dyn std::fmt::Display) -> WireError {
    WireError::new(WireErrorCode::Unknown, err.to_string())
}

/// Converts an error received from the partner without side effects.
pub fn from_wire_error(err: &WireError) -> Option<TransferError> {
    from_wire_code(err.code)
        .map(|code| TransferError::new(code, format!("Error on remote partner: {}", err.message)))
}

/// Wraps a failure of unknown origin reported by the partner.
pub fn from_wire_any(err: &dyn std::fmt::Display) -> TransferError {
    TransferError::new(TransferErrorCode::UnknownRemote, err.to_string())
}

/// Converts an error received from the partner, applying pause and cancel
/// requests to `session`. Returns `None` when nothing is left to report.
pub async fn from_wire(err: &WireError, session: &mut (dyn Interruptible + '_)) -> Option<TransferError> {
    match err.code {
        WireErrorCode::StoppedTransfer => match session.pause().await {
            Ok(()) => None,
            Err(pause_err) => {
                tracing::error!("failed to pause transfer: {pause_err}");
                Some(TransferError::with_cause(
                    TransferErrorCode::Stopped,
                    "failed to pause transfer",
                    &pause_err,
                ))
            }
        },
        WireErrorCode::CanceledTransfer => match session.cancel().await {
            Ok(()) => None,
            Err(cancel_err) => {
                tracing::error!("failed to cancel transfer: {cancel_err}");
                Some(TransferError::with_cause(
                    TransferErrorCode::Cancelled,
                    "failed to cancel transfer",
                    &cancel_err,
                ))
            }
        },
        _ => from_wire_error(err),
    }
}
