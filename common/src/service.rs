//! Operational state of a protocol service.

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display)]
pub enum StateCode {
    #[default]
    Offline,
    Running,
    Error,
}

/// The latest `(code, reason)` pair of a service.
#[derive(Debug, Default)]
pub struct ServiceState {
    inner: Mutex<(StateCode, String)>,
}

impl ServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> (StateCode, String) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn code(&self) -> StateCode {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    fn set(&self, code: StateCode, reason: String) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = (code, reason);
    }

    pub fn set_running(&self) {
        self.set(StateCode::Running, String::new());
    }

    pub fn set_offline(&self) {
        self.set(StateCode::Offline, String::new());
    }

    pub fn set_error(&self, reason: impl Into<String>) {
        self.set(StateCode::Error, reason.into());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("the service is already running")]
    AlreadyRunning,
    #[error("the service is not running")]
    NotRunning,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to start the service: {0}")]
    Startup(String),
    #[error("failed to interrupt transfers: {0}")]
    Interrupt(TransferError),
}

impl ServiceError {
    pub fn config(err: impl std::fmt::Display) -> Self {
        Self::Config(err.to_string())
    }

    pub fn startup(err: impl std::fmt::Display) -> Self {
        Self::Startup(err.to_string())
    }
}

/// A protocol server or client whose lifecycle is driven by the daemon.
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) -> Result<(), ServiceError>;

    /// Interrupts the transfers owned by the service, waiting at most
    /// `timeout`, then releases its network resources.
    async fn stop(&self, timeout: Duration) -> Result<(), ServiceError>;

    fn state(&self) -> (StateCode, String);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_keeps_reason() {
        let state = ServiceState::new();
        assert_eq!(state.get(), (StateCode::Offline, String::new()));
        state.set_error("missing certificate");
        assert_eq!(state.get(), (StateCode::Error, "missing certificate".to_string()));
        state.set_running();
        assert_eq!(state.code(), StateCode::Running);
        state.set_offline();
        assert_eq!(state.code(), StateCode::Offline);
    }
}
