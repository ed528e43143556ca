//! The R66 server: a listener accepting plain or TLS connections for one local agent.

use async_trait::async_trait;
use common::config::parse_proto_config;
use common::model::{CredentialType, LocalAgent, Owner};
use common::service::{Service, ServiceError, ServiceState, StateCode};
use common::Gateway;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::auth::{R66AuthHandler, ServerEnv};
use crate::config::R66ServerConfig;
use crate::hash::crypt_pass;
use crate::protocol::framing::{BoxedRead, BoxedWrite};
use crate::protocol::server::{AuthHandler, serve};
use crate::protocol::{Connection, PeerInfo};
use crate::tls::{self, LegacyCertCompat};

struct Listener {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct R66Server {
    gateway: Gateway,
    agent: LocalAgent,
    tls: bool,
    compat: LegacyCertCompat,
    state: ServiceState,
    listener: Mutex<Option<Listener>>,
}

impl std::fmt::Debug for R66Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("R66Server")
            .field("agent", &self.agent.name)
            .field("address", &self.agent.address)
            .field("tls", &self.tls)
            .field("state", &self.state.code())
            .finish_non_exhaustive()
    }
}

impl R66Server {
    pub fn new(gateway: Gateway, agent: LocalAgent, tls: bool, compat: LegacyCertCompat) -> Self {
        Self {
            gateway,
            agent,
            tls,
            compat,
            state: ServiceState::new(),
            listener: Mutex::new(None),
        }
    }

    fn listener(&self) -> MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address the server listens on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener().as_ref().map(|listener| listener.local_addr)
    }

    pub fn agent(&self) -> &LocalAgent {
        &self.agent
    }

    /// The password sent to requesters: the configured one, else the agent's
    /// password credential.
    fn server_password(&self, conf: &R66ServerConfig) -> Result<String, ServiceError> {
        let stored = if conf.server_password.is_empty() {
            let creds = self
                .gateway
                .store
                .credentials(Owner::LocalAgent(self.agent.id))
                .map_err(ServiceError::config)?;
            creds
                .into_iter()
                .find(|cred| cred.kind == CredentialType::Password)
                .map(|cred| cred.value)
                .ok_or_else(|| ServiceError::Config("the R66 server is missing a password".to_string()))?
        } else {
            conf.server_password.clone()
        };
        let password = self.gateway.reveal(&stored).map_err(|err| {
            ServiceError::Config(format!("failed to decrypt the server password: {err}"))
        })?;
        Ok(crypt_pass(&password))
    }

    async fn listen(&self) -> Result<Listener, ServiceError> {
        let conf: R66ServerConfig = parse_proto_config(&self.agent.proto_config).map_err(ServiceError::config)?;
        conf.check().map_err(ServiceError::config)?;
        let login = if conf.server_login.is_empty() {
            self.agent.name.clone()
        } else {
            conf.server_login.clone()
        };
        let password = self.server_password(&conf)?;
        let acceptor = if self.tls {
            let config = tls::server_config(self.gateway.store.as_ref(), &self.agent, &self.compat)
                .map_err(ServiceError::config)?;
            Some(TlsAcceptor::from(config))
        } else {
            None
        };
        let listener = TcpListener::bind(&self.agent.address)
            .await
            .map_err(|err| ServiceError::Startup(format!("failed to listen on {}: {err}", self.agent.address)))?;
        let local_addr = listener.local_addr().map_err(ServiceError::startup)?;

        let env = Arc::new(ServerEnv {
            gateway: self.gateway.clone(),
            agent: self.agent.clone(),
            conf,
        });
        let auth: Arc<dyn AuthHandler> = Arc::new(R66AuthHandler::new(env, login, password, self.compat.clone()));
        let token = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, acceptor, auth, token.clone()));
        tracing::info!("R66 server {:?} listening on {local_addr}", self.agent.name);
        Ok(Listener {
            local_addr,
            token,
            task,
        })
    }
}

#[async_trait]
impl Service for R66Server {
    #[tracing::instrument(skip_all, fields(server = %self.agent.name))]
    async fn start(&self) -> Result<(), ServiceError> {
        if self.state.code() == StateCode::Running {
            return Err(ServiceError::AlreadyRunning);
        }
        match self.listen().await {
            Ok(listener) => {
                *self.listener() = Some(listener);
                self.state.set_running();
                Ok(())
            }
            Err(err) => {
                tracing::error!("failed to start the R66 server: {err}");
                self.state.set_error(err.to_string());
                Err(err)
            }
        }
    }

    #[tracing::instrument(skip_all, fields(server = %self.agent.name))]
    async fn stop(&self, timeout: Duration) -> Result<(), ServiceError> {
        let listener = self.listener().take();
        let Some(listener) = listener.filter(|_| self.state.code() == StateCode::Running) else {
            self.state.set_offline();
            return Err(ServiceError::NotRunning);
        };
        let interrupted = self
            .gateway
            .registry
            .stop_all_from_server(self.agent.id, timeout)
            .await;
        if let Err(err) = &interrupted {
            tracing::error!("failed to interrupt the running transfers: {err}");
        }
        listener.token.cancel();
        if let Err(err) = listener.task.await {
            tracing::warn!("the listener task failed: {err}");
        }
        self.state.set_offline();
        tracing::info!("R66 server {:?} stopped", self.agent.name);
        interrupted.map_err(ServiceError::Interrupt)
    }

    fn state(&self) -> (StateCode, String) {
        self.state.get()
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    auth: Arc<dyn AuthHandler>,
    token: CancellationToken,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = token.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!("failed to accept a connection: {err}");
                    continue;
                }
            },
        };
        tracing::debug!("connection accepted from {addr}");
        tokio::spawn(handle_connection(
            stream,
            addr,
            acceptor.clone(),
            Arc::clone(&auth),
            token.child_token(),
        ));
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    auth: Arc<dyn AuthHandler>,
    token: CancellationToken,
) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!("failed to set TCP_NODELAY for {addr}: {err}");
    }
    let (conn, mut sessions) = match acceptor {
        None => {
            let (read, write) = stream.into_split();
            Connection::server(Box::new(read), Box::new(write), PeerInfo::plain(addr))
        }
        Some(acceptor) => {
            let tls_stream = tokio::select! {
                _ = token.cancelled() => return,
                res = acceptor.accept(stream) => match res {
                    Ok(tls_stream) => tls_stream,
                    Err(err) => {
                        tracing::warn!("TLS handshake with {addr} failed: {err}");
                        return;
                    }
                },
            };
            let certificates = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
                .unwrap_or_default();
            let (read, write) = tokio::io::split(tls_stream);
            let read: BoxedRead = Box::new(read);
            let write: BoxedWrite = Box::new(write);
            Connection::server(read, write, PeerInfo { addr, certificates })
        }
    };
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            session = sessions.recv() => match session {
                Some(session) => {
                    tokio::spawn(serve(session, Arc::clone(&auth)));
                }
                None => break,
            },
        }
    }
    conn.shutdown().await;
    tracing::debug!("connection with {addr} closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::Credential;
    use common::store::MemoryStore;

    fn server(store: Arc<MemoryStore>, proto_config: &str) -> R66Server {
        let mut agent = LocalAgent {
            name: "r66_server".into(),
            protocol: "r66".into(),
            address: "127.0.0.1:0".into(),
            proto_config: serde_json::from_str(proto_config).unwrap(),
            ..Default::default()
        };
        agent.id = store.add_local_agent(agent.clone());
        R66Server::new(Gateway::new(store), agent, false, LegacyCertCompat::disabled())
    }

    #[tokio::test]
    async fn lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let srv = server(store, r#"{"serverPassword": "sesame"}"#);
        assert_eq!(srv.state().0, StateCode::Offline);
        assert!(matches!(srv.stop(Duration::from_secs(1)).await, Err(ServiceError::NotRunning)));

        srv.start().await.unwrap();
        assert_eq!(srv.state(), (StateCode::Running, String::new()));
        let addr = srv.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(matches!(srv.start().await, Err(ServiceError::AlreadyRunning)));
        TcpStream::connect(addr).await.unwrap();

        srv.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(srv.state().0, StateCode::Offline);
        assert!(srv.local_addr().is_none());
    }

    #[tokio::test]
    async fn password_falls_back_to_the_agent_credential() {
        let store = Arc::new(MemoryStore::new());
        let srv = server(store.clone(), "{}");
        store.add_credential(Credential {
            id: 0,
            owner: Owner::LocalAgent(srv.agent().id),
            name: "password".into(),
            kind: CredentialType::Password,
            value: "sesame".into(),
            value2: String::new(),
        });
        srv.start().await.unwrap();
        srv.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn setup_failures_are_kept_in_the_state() {
        let store = Arc::new(MemoryStore::new());
        let srv = server(store.clone(), "{}");
        assert!(matches!(srv.start().await, Err(ServiceError::Config(_))));
        let (code, reason) = srv.state();
        assert_eq!(code, StateCode::Error);
        assert!(reason.contains("missing a password"), "{reason}");

        let srv = server(store, r#"{"serverPassword": "x", "blockSiz": 12}"#);
        assert!(srv.start().await.is_err());
        assert_eq!(srv.state().0, StateCode::Error);
    }
}
