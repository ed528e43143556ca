//! The R66 client: runs the transfers of one local client over pooled connections.

use async_trait::async_trait;
use common::config::parse_proto_config;
use common::model::{Client, RemoteAccount, RemoteAgent};
use common::pipeline::{Pipeline, run_client};
use common::service::{Service, ServiceError, ServiceState, StateCode};
use common::{Gateway, TransferError, TransferErrorCode};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::{R66ClientConfig, R66PartnerConfig};
use crate::pool::ConnPool;
use crate::tls::{self, LegacyCertCompat};
use crate::transfer_client::{Handshake, PooledSession, R66TransferClient, open_session};

pub struct R66Client {
    gateway: Gateway,
    client: Client,
    tls: bool,
    compat: LegacyCertCompat,
    state: ServiceState,
    running: Mutex<Option<(Arc<ConnPool>, R66ClientConfig)>>,
}

impl std::fmt::Debug for R66Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("R66Client")
            .field("client", &self.client.name)
            .field("tls", &self.tls)
            .field("state", &self.state.code())
            .finish_non_exhaustive()
    }
}

impl R66Client {
    pub fn new(gateway: Gateway, client: Client, tls: bool, compat: LegacyCertCompat) -> Self {
        Self {
            gateway,
            client,
            tls,
            compat,
            state: ServiceState::new(),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<(Arc<ConnPool>, R66ClientConfig)>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn setup(&self) -> Result<(Arc<ConnPool>, R66ClientConfig), ServiceError> {
        let conf: R66ClientConfig = parse_proto_config(&self.client.proto_config).map_err(ServiceError::config)?;
        conf.check().map_err(ServiceError::config)?;
        let local_addr = match self.client.local_address.as_deref() {
            None | Some("") => None,
            Some(addr) => Some(addr.parse::<SocketAddr>().map_err(|err| {
                ServiceError::Config(format!("invalid local address {addr:?}: {err}"))
            })?),
        };
        let mut pool = ConnPool::new().with_local_addr(local_addr);
        if let Some(timeout) = conf.dial_timeout() {
            pool = pool.with_dial_timeout(timeout);
        }
        Ok((Arc::new(pool), conf))
    }

    fn pool_and_conf(&self) -> Result<(Arc<ConnPool>, R66ClientConfig), TransferError> {
        self.running()
            .as_ref()
            .map(|(pool, conf)| (Arc::clone(pool), conf.clone()))
            .ok_or_else(|| TransferError::new(TransferErrorCode::ShuttingDown, "the R66 client is not running"))
    }

    fn handshake(
        &self,
        conf: &R66ClientConfig,
        partner: &RemoteAgent,
        account: &RemoteAccount,
    ) -> Result<Handshake, TransferError> {
        let partner_conf: R66PartnerConfig = parse_proto_config(&partner.proto_config).map_err(|err| {
            tracing::error!("invalid configuration for partner {:?}: {err}", partner.name);
            TransferError::internal("invalid partner configuration")
        })?;
        partner_conf.check().map_err(|err| {
            tracing::error!("invalid configuration for partner {:?}: {err}", partner.name);
            TransferError::internal("invalid partner configuration")
        })?;
        let params = conf.params(&partner_conf).map_err(|err| {
            tracing::error!("invalid configuration for partner {:?}: {err}", partner.name);
            TransferError::internal("invalid partner configuration")
        })?;
        let tls = if self.tls {
            let config = tls::client_config(self.gateway.store.as_ref(), partner, account, &self.compat).map_err(
                |err| {
                    tracing::error!("failed to set up TLS for partner {:?}: {err}", partner.name);
                    TransferError::internal("failed to set up the TLS configuration")
                },
            )?;
            Some(config)
        } else {
            None
        };
        let server_login = if partner_conf.server_login.is_empty() {
            partner.name.clone()
        } else {
            partner_conf.server_login
        };
        Ok(Handshake {
            params,
            server_login,
            tls,
        })
    }

    /// Prepares the protocol half of the transfer driven by `pip`.
    pub fn init_transfer(&self, pip: &Pipeline) -> Result<R66TransferClient, TransferError> {
        let (pool, conf) = self.pool_and_conf()?;
        let (Some(partner), Some(account)) = (&pip.ctx.remote_agent, &pip.ctx.remote_account) else {
            return Err(TransferError::internal("client transfer without a partner"));
        };
        let handshake = self.handshake(&conf, partner, account)?;
        Ok(R66TransferClient::new(pool, handshake))
    }

    /// Runs the transfer driven by `pip` to completion, error or interruption.
    #[tracing::instrument(skip_all, fields(client = %self.client.name, transfer = pip.transfer().id))]
    pub async fn run_transfer(&self, pip: &mut Pipeline) -> Result<(), TransferError> {
        let mut transfer = match self.init_transfer(pip) {
            Ok(transfer) => transfer,
            Err(err) => {
                pip.set_error(&err).await;
                return Err(err);
            }
        };
        run_client(pip, &mut transfer).await
    }

    /// Borrows an authenticated session to `partner`, outside of any transfer.
    /// Give it back with [`R66Client::return_connection`].
    pub async fn get_connection(
        &self,
        partner: &RemoteAgent,
        account: &RemoteAccount,
    ) -> Result<PooledSession, TransferError> {
        let (pool, conf) = self.pool_and_conf()?;
        let handshake = self.handshake(&conf, partner, account)?;
        open_session(&pool, &handshake, &self.gateway, partner, account).await
    }

    pub async fn return_connection(&self, session: PooledSession) {
        session.close().await;
    }
}

#[async_trait]
impl Service for R66Client {
    #[tracing::instrument(skip_all, fields(client = %self.client.name))]
    async fn start(&self) -> Result<(), ServiceError> {
        if self.state.code() == StateCode::Running {
            return Err(ServiceError::AlreadyRunning);
        }
        match self.setup() {
            Ok(running) => {
                *self.running() = Some(running);
                self.state.set_running();
                tracing::info!("R66 client {:?} started", self.client.name);
                Ok(())
            }
            Err(err) => {
                tracing::error!("failed to start the R66 client: {err}");
                self.state.set_error(err.to_string());
                Err(err)
            }
        }
    }

    #[tracing::instrument(skip_all, fields(client = %self.client.name))]
    async fn stop(&self, timeout: Duration) -> Result<(), ServiceError> {
        let running = self.running().take();
        let Some((pool, _)) = running.filter(|_| self.state.code() == StateCode::Running) else {
            self.state.set_offline();
            return Err(ServiceError::NotRunning);
        };
        let interrupted = self
            .gateway
            .registry
            .stop_all_from_client(self.client.id, timeout)
            .await;
        if let Err(err) = &interrupted {
            tracing::error!("failed to interrupt the running transfers: {err}");
        }
        pool.force_close().await;
        self.state.set_offline();
        tracing::info!("R66 client {:?} stopped", self.client.name);
        interrupted.map_err(ServiceError::Interrupt)
    }

    fn state(&self) -> (StateCode, String) {
        self.state.get()
    }
}
