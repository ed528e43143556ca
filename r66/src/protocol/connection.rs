//! One TCP/TLS connection multiplexing many logical sessions.
//!
//! Each session has its own send window: a side may only have
//! [`SESSION_WINDOW`] packets of a session in flight, and the peer grants
//! more with `Credit` frames as it consumes them. A session whose consumer
//! stalls therefore never holds up the reader of the connection.

use rustls::pki_types::CertificateDer;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use super::WireError;
use super::framing::{BoxedRead, BoxedWrite, Frame, RecvStream, SendStream};
use super::packet::Packet;

/// Packets of one session a side may send before the peer grants more.
pub const SESSION_WINDOW: u32 = 64;

/// Consumed packets acknowledged by one `Credit` frame.
const CREDIT_BATCH: u32 = SESSION_WINDOW / 4;

const ACCEPT_QUEUE: usize = 64;

/// What is known about the other end of a connection.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    /// The TLS client certificate chain, empty on plain connections.
    pub certificates: Vec<CertificateDer<'static>>,
}

impl PeerInfo {
    pub fn plain(addr: SocketAddr) -> Self {
        Self {
            addr,
            certificates: Vec::new(),
        }
    }
}

/// Local end of a session as seen by the read loop.
#[derive(Debug)]
struct Route {
    tx: mpsc::Sender<Packet>,
    /// Packets this side may still send on the session.
    credit: Arc<Semaphore>,
}

fn route() -> (Route, mpsc::Receiver<Packet>) {
    let (tx, rx) = mpsc::channel(SESSION_WINDOW as usize);
    let route = Route {
        tx,
        credit: Arc::new(Semaphore::new(SESSION_WINDOW as usize)),
    };
    (route, rx)
}

pub struct Connection {
    writer: tokio::sync::Mutex<SendStream<BoxedWrite>>,
    sessions: Mutex<HashMap<u32, Route>>,
    next_id: AtomicU32,
    closed: CancellationToken,
    peer: PeerInfo,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer.addr)
            .field("sessions", &self.session_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    fn new(write: BoxedWrite, peer: PeerInfo) -> Arc<Self> {
        Arc::new(Self {
            writer: tokio::sync::Mutex::new(SendStream::new(write)),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            closed: CancellationToken::new(),
            peer,
        })
    }

    /// Wraps the requester side of a connection.
    pub fn client(read: BoxedRead, write: BoxedWrite, peer: PeerInfo) -> Arc<Self> {
        let conn = Self::new(write, peer);
        tokio::spawn(read_loop(Arc::clone(&conn), RecvStream::new(read), None));
        conn
    }

    /// Wraps the responder side of a connection. Every session opened by the
    /// peer is delivered on the returned channel, starting with its first packet.
    pub fn server(read: BoxedRead, write: BoxedWrite, peer: PeerInfo) -> (Arc<Self>, mpsc::Receiver<Session>) {
        let conn = Self::new(write, peer);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);
        tokio::spawn(read_loop(Arc::clone(&conn), RecvStream::new(read), Some(accept_tx)));
        (conn, accept_rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Route>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed, by either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn open_session(self: &Arc<Self>) -> Result<Session, WireError> {
        if self.is_closed() {
            return Err(WireError::disconnection("connection is closed"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (route, rx) = route();
        let credit = Arc::clone(&route.credit);
        self.lock().insert(id, route);
        Ok(Session::new(id, Arc::clone(self), rx, credit))
    }

    async fn send(&self, frame: Frame) -> Result<(), WireError> {
        if self.is_closed() {
            return Err(WireError::disconnection("connection is closed"));
        }
        let name = match &frame {
            Frame::Packet { packet, .. } => packet.name(),
            Frame::Credit { .. } => "Credit",
        };
        let mut writer = self.writer.lock().await;
        writer.send_object(&frame).await.map_err(|err| {
            tracing::debug!("failed to send {name} to {}: {err:#}", self.peer.addr);
            self.closed.cancel();
            WireError::disconnection("connection lost")
        })
    }

    /// Sends `frame` from a task of its own; the caller never waits on the socket.
    fn send_detached(self: &Arc<Self>, frame: Frame) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = conn.send(frame).await {
                tracing::debug!("failed to notify {}: {err}", conn.peer.addr);
            }
        });
    }

    /// Closes the connection; every session sees a disconnection.
    pub async fn shutdown(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.close().await {
            tracing::debug!("failed to close connection to {}: {err:#}", self.peer.addr);
        }
    }

    /// Ends a session locally and reports `err` to the peer.
    fn reject(self: &Arc<Self>, session: u32, err: WireError) {
        if let Some(route) = self.lock().remove(&session) {
            route.credit.close();
        }
        self.send_detached(Frame::Packet {
            session,
            packet: Packet::Error(err),
        });
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, accept: Option<&mpsc::Sender<Session>>) {
        match frame {
            Frame::Credit { session, count } => {
                if let Some(route) = self.lock().get(&session) {
                    route.credit.add_permits(count as usize);
                }
            }
            Frame::Packet { session, packet } => self.deliver(session, packet, accept),
        }
    }

    fn deliver(self: &Arc<Self>, session: u32, packet: Packet, accept: Option<&mpsc::Sender<Session>>) {
        let sender = self.lock().get(&session).map(|route| route.tx.clone());
        if let Some(tx) = sender {
            match tx.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => {
                    self.lock().remove(&session);
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("session {session} from {} overran its window", self.peer.addr);
                    self.reject(session, WireError::incorrect_command("session window exceeded"));
                }
            }
            return;
        }
        match (accept, packet) {
            (Some(accept), packet @ Packet::Authent(_)) => {
                let (route, rx) = route();
                let credit = Arc::clone(&route.credit);
                if route.tx.try_send(packet).is_err() {
                    return;
                }
                self.lock().insert(session, route);
                let accepted = Session::new(session, Arc::clone(self), rx, credit);
                match accept.try_send(accepted) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!("too many pending sessions from {}", self.peer.addr);
                        self.send_detached(Frame::Packet {
                            session,
                            packet: Packet::Error(WireError::new(
                                super::WireErrorCode::ServerOverloaded,
                                "too many pending sessions",
                            )),
                        });
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!("session {session} refused, no longer accepting");
                    }
                }
            }
            (_, packet) => {
                tracing::debug!(
                    "dropping {} for unknown session {session} from {}",
                    packet.name(),
                    self.peer.addr
                );
            }
        }
    }
}

async fn read_loop(conn: Arc<Connection>, mut recv: RecvStream<BoxedRead>, accept: Option<mpsc::Sender<Session>>) {
    loop {
        let frame = tokio::select! {
            _ = conn.closed.cancelled() => break,
            frame = recv.recv_object::<Frame>() => frame,
        };
        match frame {
            Ok(Some(frame)) => conn.dispatch(frame, accept.as_ref()),
            Ok(None) => {
                tracing::debug!("connection closed by {}", conn.peer.addr);
                break;
            }
            Err(err) => {
                tracing::warn!("failed to read from {}: {err:#}", conn.peer.addr);
                break;
            }
        }
    }
    conn.closed.cancel();
    for (_, route) in conn.lock().drain() {
        route.credit.close();
    }
}

/// One logical session of a [`Connection`].
#[derive(Debug)]
pub struct Session {
    id: u32,
    conn: Arc<Connection>,
    rx: mpsc::Receiver<Packet>,
    credit: Arc<Semaphore>,
    /// Packets taken from `rx` and not yet granted back to the peer.
    consumed: u32,
}

impl Session {
    fn new(id: u32, conn: Arc<Connection>, rx: mpsc::Receiver<Packet>, credit: Arc<Semaphore>) -> Self {
        Self {
            id,
            conn,
            rx,
            credit,
            consumed: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> &PeerInfo {
        self.conn.peer()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Waits for send credit when the peer has not consumed earlier packets yet.
    pub async fn send(&self, packet: Packet) -> Result<(), WireError> {
        let permit = tokio::select! {
            permit = self.credit.acquire() => permit,
            _ = self.conn.closed() => return Err(WireError::disconnection("connection is closed")),
        };
        let Ok(permit) = permit else {
            return Err(WireError::disconnection("session is closed"));
        };
        permit.forget();
        self.conn
            .send(Frame::Packet {
                session: self.id,
                packet,
            })
            .await
    }

    /// Next packet of this session. Cancel safe.
    pub async fn recv(&mut self) -> Result<Packet, WireError> {
        let packet = self
            .rx
            .recv()
            .await
            .ok_or_else(|| WireError::disconnection("connection closed by the remote host"))?;
        self.acknowledge();
        Ok(packet)
    }

    /// An already received packet, if any.
    pub fn try_recv(&mut self) -> Option<Packet> {
        let packet = self.rx.try_recv().ok()?;
        self.acknowledge();
        Some(packet)
    }

    fn acknowledge(&mut self) {
        self.consumed += 1;
        if self.consumed < CREDIT_BATCH {
            return;
        }
        let count = std::mem::take(&mut self.consumed);
        self.conn.send_detached(Frame::Credit { session: self.id, count });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.conn.lock().remove(&self.id);
    }
}
