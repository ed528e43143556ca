//! Outbound connections shared by the transfers going to the same partner.
//!
//! Each address maps to one [`Connection`] and the number of sessions using
//! it. Once the count drops to zero the connection is kept for a grace period
//! so back-to-back transfers reuse it, then closed.

use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::protocol::framing::{BoxedRead, BoxedWrite};
use crate::protocol::{Connection, PeerInfo};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,
    #[error("failed to connect to {addr}: {reason}")]
    Dial { addr: String, reason: String },
}

fn dial_error(addr: &str, reason: impl std::fmt::Display) -> PoolError {
    PoolError::Dial {
        addr: addr.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug)]
struct Entry {
    conn: Arc<Connection>,
    refs: usize,
    /// Bumped whenever `refs` drops to zero; a reclaim timer only acts on its own epoch.
    epoch: u64,
    reclaim: Option<CancellationToken>,
}

impl Entry {
    fn take(&mut self) -> Arc<Connection> {
        self.refs += 1;
        if let Some(timer) = self.reclaim.take() {
            timer.cancel();
        }
        Arc::clone(&self.conn)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    closed: bool,
}

#[derive(Debug)]
pub struct ConnPool {
    state: Mutex<State>,
    closing: CancellationToken,
    grace_period: Duration,
    dial_timeout: Duration,
    local_addr: Option<SocketAddr>,
}

impl Default for ConnPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Host part of `host:port`, without IPv6 brackets.
pub fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

impl ConnPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            closing: CancellationToken::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            local_addr: None,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Binds outgoing connections to this local address.
    pub fn with_local_addr(mut self, local_addr: Option<SocketAddr>) -> Self {
        self.local_addr = local_addr;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a reference on the connection to `addr`, dialing it if needed.
    pub async fn add(&self, addr: &str, tls: Option<Arc<ClientConfig>>) -> Result<Arc<Connection>, PoolError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(entry) = state.entries.get_mut(addr) {
                if !entry.conn.is_closed() {
                    tracing::debug!("reusing connection to {addr}");
                    return Ok(entry.take());
                }
                tracing::debug!("dropping dead connection to {addr}");
                state.entries.remove(addr);
            }
        }

        let conn = tokio::select! {
            _ = self.closing.cancelled() => return Err(PoolError::Closed),
            res = tokio::time::timeout(self.dial_timeout, self.dial(addr, tls)) => match res {
                Ok(res) => res?,
                Err(_) => return Err(dial_error(addr, "connection timed out")),
            },
        };

        let extra = {
            let mut state = self.lock();
            let live = state.entries.get(addr).is_some_and(|entry| !entry.conn.is_closed());
            if state.closed {
                Some(Err(PoolError::Closed))
            } else if live {
                state.entries.get_mut(addr).map(|entry| Ok(entry.take()))
            } else {
                state.entries.insert(
                    addr.to_string(),
                    Entry {
                        conn: Arc::clone(&conn),
                        refs: 1,
                        epoch: 0,
                        reclaim: None,
                    },
                );
                None
            }
        };
        match extra {
            Some(res) => {
                conn.shutdown().await;
                res
            }
            None => {
                tracing::info!("connected to {addr}");
                Ok(conn)
            }
        }
    }

    async fn dial(&self, addr: &str, tls: Option<Arc<ClientConfig>>) -> Result<Arc<Connection>, PoolError> {
        let stream = match self.local_addr {
            None => TcpStream::connect(addr).await.map_err(|err| dial_error(addr, err))?,
            Some(local) => {
                let remote = tokio::net::lookup_host(addr)
                    .await
                    .map_err(|err| dial_error(addr, err))?
                    .find(|remote| remote.is_ipv4() == local.is_ipv4())
                    .ok_or_else(|| dial_error(addr, "no address matches the local address family"))?;
                let socket = if local.is_ipv4() {
                    TcpSocket::new_v4()
                } else {
                    TcpSocket::new_v6()
                }
                .map_err(|err| dial_error(addr, err))?;
                socket.bind(local).map_err(|err| dial_error(addr, err))?;
                socket.connect(remote).await.map_err(|err| dial_error(addr, err))?
            }
        };
        stream.set_nodelay(true).map_err(|err| dial_error(addr, err))?;
        let peer_addr = stream.peer_addr().map_err(|err| dial_error(addr, err))?;
        let Some(config) = tls else {
            let (read, write) = stream.into_split();
            return Ok(Connection::client(
                Box::new(read),
                Box::new(write),
                PeerInfo::plain(peer_addr),
            ));
        };
        let name = ServerName::try_from(host_of(addr).to_string()).map_err(|err| dial_error(addr, err))?;
        let tls_stream = tokio_rustls::TlsConnector::from(config)
            .connect(name, stream)
            .await
            .map_err(|err| dial_error(addr, format!("TLS handshake failed: {err}")))?;
        let certificates = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
            .unwrap_or_default();
        let (read, write) = tokio::io::split(tls_stream);
        let read: BoxedRead = Box::new(read);
        let write: BoxedWrite = Box::new(write);
        Ok(Connection::client(
            read,
            write,
            PeerInfo {
                addr: peer_addr,
                certificates,
            },
        ))
    }

    /// Like [`ConnPool::add`], the reference being given back when the
    /// returned [`PoolRef`] is dropped.
    pub async fn acquire(self: &Arc<Self>, addr: &str, tls: Option<Arc<ClientConfig>>) -> Result<PoolRef, PoolError> {
        let conn = self.add(addr, tls).await?;
        Ok(PoolRef {
            pool: Arc::clone(self),
            addr: addr.to_string(),
            conn,
        })
    }

    /// Releases a reference taken with [`ConnPool::add`].
    pub fn done(self: &Arc<Self>, addr: &str) {
        let mut state = self.lock();
        let grace = self.grace_period;
        let Some(entry) = state.entries.get_mut(addr) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // no timer without a runtime, the connection goes right away
            state.entries.remove(addr);
            return;
        };
        entry.epoch += 1;
        let timer = self.closing.child_token();
        if let Some(previous) = entry.reclaim.replace(timer.clone()) {
            previous.cancel();
        }
        runtime.spawn(reclaim(
            Arc::downgrade(self),
            addr.to_string(),
            entry.epoch,
            timer,
            grace,
        ));
    }

    /// Whether a connection to `addr` is held, idle or not.
    pub fn exists(&self, addr: &str) -> bool {
        self.lock().entries.contains_key(addr)
    }

    /// Closes every connection; later calls to [`ConnPool::add`] fail.
    pub async fn force_close(&self) {
        let conns: Vec<Arc<Connection>> = {
            let mut state = self.lock();
            state.closed = true;
            state.entries.drain().map(|(_, entry)| entry.conn).collect()
        };
        self.closing.cancel();
        for conn in conns {
            conn.shutdown().await;
        }
    }
}

/// A reference on a pooled connection, released on drop.
#[derive(Debug)]
pub struct PoolRef {
    pool: Arc<ConnPool>,
    addr: String,
    conn: Arc<Connection>,
}

impl PoolRef {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for PoolRef {
    fn drop(&mut self) {
        self.pool.done(&self.addr);
    }
}

async fn reclaim(pool: Weak<ConnPool>, addr: String, epoch: u64, timer: CancellationToken, grace: Duration) {
    tokio::select! {
        _ = timer.cancelled() => return,
        _ = tokio::time::sleep(grace) => {}
    }
    let Some(pool) = pool.upgrade() else {
        return;
    };
    let conn = {
        let mut state = pool.lock();
        let idle = state
            .entries
            .get(&addr)
            .is_some_and(|entry| entry.refs == 0 && entry.epoch == epoch);
        if idle {
            state.entries.remove(&addr).map(|entry| entry.conn)
        } else {
            None
        }
    };
    if let Some(conn) = conn {
        tracing::info!("closing idle connection to {addr}");
        conn.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts plain connections and counts them.
    async fn listener() -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, peer)) = listener.accept().await {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let (read, write) = stream.into_split();
                held.push(Connection::server(Box::new(read), Box::new(write), PeerInfo::plain(peer)));
            }
        });
        (addr, accepted)
    }

    fn pool(grace: Duration) -> Arc<ConnPool> {
        Arc::new(ConnPool::new().with_grace_period(grace))
    }

    #[tokio::test]
    async fn one_connection_per_address() {
        let (addr, accepted) = listener().await;
        let pool = pool(Duration::from_secs(60));
        let first = pool.add(&addr, None).await.unwrap();
        let second = pool.add(&addr, None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
        pool.done(&addr);
        pool.done(&addr);
        assert!(pool.exists(&addr), "kept during the grace period");
    }

    #[tokio::test]
    async fn idle_connection_is_reclaimed() {
        let (addr, _) = listener().await;
        let pool = pool(Duration::from_millis(50));
        let conn = pool.add(&addr, None).await.unwrap();
        pool.done(&addr);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pool.exists(&addr));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn add_during_grace_keeps_the_connection() {
        let (addr, accepted) = listener().await;
        let pool = pool(Duration::from_millis(100));
        let first = pool.add(&addr, None).await.unwrap();
        pool.done(&addr);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let again = pool.add(&addr, None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(pool.exists(&addr));
        assert!(!again.is_closed());
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_dial_leaves_no_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let pool = pool(Duration::from_secs(1));
        let err = pool.add(&addr, None).await.unwrap_err();
        assert!(matches!(err, PoolError::Dial { .. }), "{err}");
        assert!(!pool.exists(&addr));
        pool.done(&addr);
    }

    #[tokio::test]
    async fn closed_pool_refuses_new_connections() {
        let (addr, _) = listener().await;
        let pool = pool(Duration::from_secs(60));
        let conn = pool.add(&addr, None).await.unwrap();
        pool.force_close().await;
        assert!(conn.is_closed());
        assert!(!pool.exists(&addr));
        assert_eq!(pool.add(&addr, None).await.unwrap_err(), PoolError::Closed);
    }

    #[tokio::test]
    async fn dropped_reference_is_released() {
        let (addr, _) = listener().await;
        let pool = pool(Duration::from_millis(50));
        let first = pool.acquire(&addr, None).await.unwrap();
        let second = pool.acquire(&addr, None).await.unwrap();
        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        drop(first);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pool.exists(&addr), "still referenced");
        let conn = Arc::clone(second.connection());
        drop(second);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!pool.exists(&addr));
        assert!(conn.is_closed());
    }

    #[test]
    fn host_part() {
        assert_eq!(host_of("127.0.0.1:6666"), "127.0.0.1");
        assert_eq!(host_of("[::1]:6666"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
        assert_eq!(host_of("r66.example.com:8067"), "r66.example.com");
    }
}
