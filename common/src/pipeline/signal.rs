//! Cooperative interruption of a running transfer.
//!
//! A [`Signal`] is a cancellation token that remembers *why* it was raised.
//! Every suspension point of a transfer races its work against
//! [`Signal::raised`] so a pause, a cancel or a service shutdown surfaces as
//! the matching [`Cause`] instead of a generic cancellation.

use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::{TransferError, TransferErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Cause {
    /// The owning service is stopping; the transfer can be resumed later.
    Shutdown,
    /// Paused by an operator or by the peer.
    Pause,
    /// Cancelled by an operator or by the peer.
    Cancel,
}

impl Cause {
    pub fn to_error(self) -> TransferError {
        match self {
            Cause::Shutdown => {
                TransferError::new(TransferErrorCode::ShuttingDown, "transfer interrupted by service shutdown")
            }
            Cause::Pause => TransferError::new(TransferErrorCode::Stopped, "transfer paused by user"),
            Cause::Cancel => TransferError::new(TransferErrorCode::Cancelled, "transfer cancelled by user"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Signal {
    token: CancellationToken,
    cause: Arc<Mutex<Option<Cause>>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(Mutex::new(None)),
        }
    }

    /// Raises the signal. The first cause wins; returns `false` if the signal
    /// was already raised.
    pub fn raise(&self, cause: Cause) -> bool {
        {
            let mut slot = self.cause.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return false;
            }
            *slot = Some(cause);
        }
        tracing::debug!("transfer signal raised: {cause}");
        self.token.cancel();
        true
    }

    pub fn cause(&self) -> Option<Cause> {
        *self.cause.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the signal is raised and returns its cause.
    pub async fn raised(&self) -> Cause {
        self.token.cancelled().await;
        self.cause().unwrap_or(Cause::Shutdown)
    }

    /// Drives `fut` to completion unless the signal is raised first.
    pub async fn race<F: std::future::Future>(&self, fut: F) -> Result<F::Output, Cause> {
        tokio::select! {
            biased;
            cause = self.raised() => Err(cause),
            out = fut => Ok(out),
        }
    }

    /// Like [`Signal::race`] for fallible futures, turning a raised signal into
    /// the matching [`TransferError`].
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, TransferError>
    where
        F: std::future::Future<Output = Result<T, TransferError>>,
    {
        match self.race(fut).await {
            Ok(res) => res,
            Err(cause) => Err(cause.to_error()),
        }
    }
}
