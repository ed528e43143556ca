//! Registry of the transfers currently running in this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use super::signal::{Cause, Signal};
use crate::model::Id;
use crate::{TransferError, TransferErrorCode};

/// The service a running transfer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A transfer received by the server of this local agent.
    Server(Id),
    /// A transfer initiated by this client.
    Client(Id),
}

#[derive(Debug)]
struct Entry {
    origin: Origin,
    signal: Signal,
}

#[derive(Debug, Default)]
pub struct TransferRegistry {
    running: Mutex<HashMap<Id, Entry>>,
    changed: Notify,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Id, Entry>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a running transfer. The entry lives as long as the returned guard.
    pub fn register(
        self: &Arc<Self>,
        id: Id,
        origin: Origin,
        signal: Signal,
    ) -> Result<RegistryGuard, TransferError> {
        let mut running = self.lock();
        if running.contains_key(&id) {
            tracing::warn!("transfer {id} is already running");
            return Err(TransferError::internal("transfer is already running"));
        }
        running.insert(id, Entry { origin, signal });
        Ok(RegistryGuard {
            registry: Arc::clone(self),
            id,
        })
    }

    fn unregister(&self, id: Id) {
        self.lock().remove(&id);
        self.changed.notify_waiters();
    }

    /// Ids of the running transfers, sorted.
    pub fn list(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_running(&self, id: Id) -> bool {
        self.lock().contains_key(&id)
    }

    fn count(&self, origin: Origin) -> usize {
        self.lock().values().filter(|e| e.origin == origin).count()
    }

    /// Raises `cause` on one running transfer; returns `false` if it is not running.
    pub fn raise(&self, id: Id, cause: Cause) -> bool {
        match self.lock().get(&id) {
            Some(entry) => {
                entry.signal.raise(cause);
                true
            }
            None => false,
        }
    }

    pub fn pause(&self, id: Id) -> bool {
        self.raise(id, Cause::Pause)
    }

    pub fn cancel(&self, id: Id) -> bool {
        self.raise(id, Cause::Cancel)
    }

    /// Interrupts every transfer of `origin` and waits until they have all
    /// unregistered, or until `timeout` elapses.
    pub async fn stop_all(&self, origin: Origin, timeout: Duration) -> Result<(), TransferError> {
        let deadline = tokio::time::Instant::now() + timeout;
        {
            let running = self.lock();
            for (id, entry) in running.iter().filter(|(_, e)| e.origin == origin) {
                tracing::info!("interrupting transfer {id}");
                entry.signal.raise(Cause::Shutdown);
            }
        }
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let remaining = self.count(origin);
            if remaining == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::error!("{remaining} transfer(s) did not stop in time");
                return Err(TransferError::new(
                    TransferErrorCode::ShuttingDown,
                    format!("{remaining} transfer(s) could not be interrupted in time"),
                ));
            }
        }
    }

    pub async fn stop_all_from_server(&self, agent_id: Id, timeout: Duration) -> Result<(), TransferError> {
        self.stop_all(Origin::Server(agent_id), timeout).await
    }

    pub async fn stop_all_from_client(&self, client_id: Id, timeout: Duration) -> Result<(), TransferError> {
        self.stop_all(Origin::Client(client_id), timeout).await
    }
}

/// Removes its transfer from the registry when dropped.
#[derive(Debug)]
pub struct RegistryGuard {
    registry: Arc<TransferRegistry>,
    id: Id,
}

impl RegistryGuard {
    pub fn id(&self) -> Id {
        self.id
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
