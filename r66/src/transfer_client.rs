//! The requester half of a client transfer.

use async_trait::async_trait;
use common::error::io_to_transfer_error;
use common::model::{CredentialType, Owner, RemoteAccount, RemoteAgent, TransferStep, UNKNOWN_SIZE};
use common::pipeline::{Pipeline, TransferClient};
use common::secrets::verify_password;
use common::{Gateway, TransferError, TransferErrorCode};
use rustls::ClientConfig;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::TransferParams;
use crate::errors::{from_wire, to_wire};
use crate::hash::{HashAlgo, crypt_pass, local_file_hash};
use crate::info::{apply_update_info, make_user_content};
use crate::pool::{ConnPool, PoolRef};
use crate::protocol::client::{ClientSession, Incoming};
use crate::protocol::{Authent, Request, UpdateInfo, WireError, WireErrorCode};

fn mismatch(what: &str) -> TransferError {
    tracing::error!("the partner replied with a different {what}");
    TransferError::new(TransferErrorCode::Unimplemented, "client-server configuration mismatch")
}

fn partner_of(pip: &Pipeline) -> Result<(&RemoteAgent, &RemoteAccount), TransferError> {
    match (&pip.ctx.remote_agent, &pip.ctx.remote_account) {
        (Some(agent), Some(account)) => Ok((agent, account)),
        _ => Err(TransferError::internal("client transfer without a partner")),
    }
}

/// The options a requester authenticates with, and expects back.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub params: TransferParams,
    /// Login the partner must answer with.
    pub server_login: String,
    pub tls: Option<Arc<ClientConfig>>,
}

impl Handshake {
    pub fn digest(&self) -> Option<HashAlgo> {
        self.params.final_hash.then_some(self.params.digest)
    }

    fn authent(&self, gateway: &Gateway, account: &RemoteAccount) -> Result<Authent, TransferError> {
        let creds = gateway.store.credentials(Owner::RemoteAccount(account.id))?;
        let password = match creds.into_iter().find(|cred| cred.kind == CredentialType::Password) {
            Some(cred) => {
                let password = gateway.reveal(&cred.value).map_err(|err| {
                    tracing::error!("failed to decrypt the password of {:?}: {err}", account.login);
                    TransferError::internal("failed to decrypt the account password")
                })?;
                crypt_pass(&password)
            }
            None => String::new(),
        };
        Ok(Authent {
            login: account.login.clone(),
            password,
            filesize: true,
            final_hash: self.params.final_hash,
            digest: self.digest().map(HashAlgo::name).unwrap_or_default().to_string(),
        })
    }

    /// Checks the identity sent back by the partner.
    fn server_identity(&self, gateway: &Gateway, partner: &RemoteAgent, reply: &Authent) -> Result<bool, TransferError> {
        if !bool::from(reply.login.as_bytes().ct_eq(self.server_login.as_bytes())) {
            tracing::error!("the partner answered as {:?}, expected {:?}", reply.login, self.server_login);
            return Ok(false);
        }
        let creds = gateway.store.credentials(Owner::RemoteAgent(partner.id))?;
        if let Some(cred) = creds.iter().find(|cred| cred.kind == CredentialType::PasswordHash) {
            return verify_password(reply.password.as_bytes(), &cred.value).map_err(|err| {
                tracing::error!("failed to check the password of partner {:?}: {err}", partner.name);
                TransferError::internal("internal authentication error")
            });
        }
        if let Some(cred) = creds.iter().find(|cred| cred.kind == CredentialType::Password) {
            let password = gateway.reveal(&cred.value).map_err(|err| {
                tracing::error!("failed to decrypt the password of partner {:?}: {err}", partner.name);
                TransferError::internal("internal authentication error")
            })?;
            let expected = crypt_pass(&password);
            return Ok(bool::from(expected.as_bytes().ct_eq(reply.password.as_bytes())));
        }
        // without a password, only the TLS handshake vouches for the partner
        Ok(self.tls.is_some())
    }

    fn check_reply(&self, gateway: &Gateway, partner: &RemoteAgent, reply: &Authent) -> Result<(), TransferError> {
        if !self.server_identity(gateway, partner, reply)? {
            return Err(TransferError::new(
                TransferErrorCode::BadAuthentication,
                "server authentication failed",
            ));
        }
        if !reply.filesize {
            return Err(mismatch("file size option"));
        }
        let digest_matches =
            !reply.final_hash || reply.digest.parse::<HashAlgo>().is_ok_and(|d| Some(d) == self.digest());
        if reply.final_hash != self.params.final_hash || !digest_matches {
            return Err(mismatch("final hash option"));
        }
        Ok(())
    }
}

/// A session and the pool reference keeping its connection open.
#[derive(Debug)]
pub struct PooledSession {
    session: ClientSession,
    lease: PoolRef,
}

impl PooledSession {
    pub fn addr(&self) -> &str {
        self.lease.addr()
    }

    /// Closes the session, then gives the connection back to the pool.
    pub async fn close(self) {
        let Self { session, lease } = self;
        session.close().await;
        drop(lease);
    }
}

impl std::ops::Deref for PooledSession {
    type Target = ClientSession;

    fn deref(&self) -> &ClientSession {
        &self.session
    }
}

impl std::ops::DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut ClientSession {
        &mut self.session
    }
}

/// Opens an unauthenticated session to `addr` over a pooled connection.
async fn connect(pool: &Arc<ConnPool>, handshake: &Handshake, addr: &str) -> Result<PooledSession, TransferError> {
    let lease = pool.acquire(addr, handshake.tls.clone()).await.map_err(|err| {
        tracing::error!("failed to connect to {addr}: {err}");
        TransferError::new(TransferErrorCode::Connection, "failed to connect to remote host")
    })?;
    let session = lease.connection().open_session().map_err(|err| {
        tracing::error!("failed to open a session on {addr}: {err}");
        TransferError::new(TransferErrorCode::Connection, "failed to connect to remote host")
    })?;
    Ok(PooledSession {
        session: ClientSession::new(session),
        lease,
    })
}

/// Authenticates `session` and checks the identity of the partner. The
/// partner is told when its answer is refused; closing is left to the caller.
async fn authenticate(
    session: &mut ClientSession,
    auth: Authent,
    handshake: &Handshake,
    gateway: &Gateway,
    partner: &RemoteAgent,
) -> Result<(), TransferError> {
    let reply = session.authent(auth).await.map_err(|err| {
        tracing::error!("authentication refused by the partner: {err}");
        TransferError::new(TransferErrorCode::BadAuthentication, "client authentication failed")
    })?;
    if let Err(err) = handshake.check_reply(gateway, partner, &reply) {
        if let Err(send_err) = session.send_error(to_wire(&err)).await {
            tracing::debug!("failed to send the error to the partner: {send_err}");
        }
        return Err(err);
    }
    Ok(())
}

/// Opens an authenticated session to `partner` over a pooled connection.
///
/// On failure nothing is left open: the partner is told why when it is still
/// listening, and the pool reference is given back, also when the returned
/// future is dropped before completion.
#[tracing::instrument(skip_all, fields(partner = %partner.name, account = %account.login))]
pub async fn open_session(
    pool: &Arc<ConnPool>,
    handshake: &Handshake,
    gateway: &Gateway,
    partner: &RemoteAgent,
    account: &RemoteAccount,
) -> Result<PooledSession, TransferError> {
    let auth = handshake.authent(gateway, account)?;
    let mut session = connect(pool, handshake, &partner.address).await?;
    if let Err(err) = authenticate(&mut session, auth, handshake, gateway, partner).await {
        session.close().await;
        return Err(err);
    }
    Ok(session)
}

/// Drives one transfer over a pooled connection.
pub struct R66TransferClient {
    pool: Arc<ConnPool>,
    handshake: Handshake,
    session: Option<PooledSession>,
    /// Final hash announced by a sending partner.
    remote_hash: Option<Vec<u8>>,
    addr: String,
}

impl std::fmt::Debug for R66TransferClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("R66TransferClient")
            .field("addr", &self.addr)
            .field("tls", &self.handshake.tls.is_some())
            .field("params", &self.handshake.params)
            .finish_non_exhaustive()
    }
}

impl R66TransferClient {
    pub fn new(pool: Arc<ConnPool>, handshake: Handshake) -> Self {
        Self {
            pool,
            handshake,
            session: None,
            remote_hash: None,
            addr: String::new(),
        }
    }

    fn params(&self) -> &TransferParams {
        &self.handshake.params
    }

    fn session(&mut self) -> Result<&mut ClientSession, TransferError> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| TransferError::internal("no open session"))
    }

    fn digest(&self) -> Option<HashAlgo> {
        self.handshake.digest()
    }

    fn block_algo(&self) -> HashAlgo {
        self.digest().unwrap_or_default()
    }

    /// Closes the session and gives the connection back to the pool.
    async fn release(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    /// Tells the partner about a local failure, then releases the session.
    async fn abort(&mut self, err: TransferError) -> TransferError {
        let sent = match &self.session {
            Some(session) => session.send_error(to_wire(&err)).await,
            None => Ok(()),
        };
        if let Err(send_err) = sent {
            tracing::debug!("failed to send the error to the partner: {send_err}");
        }
        self.release().await;
        err
    }

    /// Handles an error reported by the partner. Pause and cancel requests are
    /// applied to the pipeline before being returned.
    async fn remote_failure(&mut self, pip: &mut Pipeline, err: WireError) -> TransferError {
        tracing::warn!("transfer {} aborted by the partner: {err}", pip.transfer().id);
        self.release().await;
        let code = err.code;
        match from_wire(&err, pip).await {
            Some(err) => err,
            None if code == WireErrorCode::StoppedTransfer => {
                TransferError::new(TransferErrorCode::Stopped, "transfer paused by the partner")
            }
            None => TransferError::new(TransferErrorCode::Cancelled, "transfer cancelled by the partner"),
        }
    }

    async fn source_size(pip: &Pipeline) -> Result<i64, TransferError> {
        let path = pip.local_path();
        let fs = pip.filesystem(&path)?;
        let info = fs.stat(&path).await.map_err(|err| {
            tracing::error!("failed to stat {path}: {err}");
            io_to_transfer_error(&err)
        })?;
        Ok(i64::try_from(info.size).unwrap_or(i64::MAX))
    }

    fn make_request(&self, pip: &Pipeline) -> Request {
        let trans = pip.transfer();
        let block = self.params().block_size;
        let id = match trans.remote_transfer_id.parse() {
            Ok(id) => id,
            Err(_) => trans.id,
        };
        Request {
            id,
            filepath: trans.remote_path.clone(),
            filesize: trans.filesize,
            rule: pip.ctx.rule.name.clone(),
            block,
            rank: u32::try_from(trans.progress / i64::from(block)).unwrap_or(u32::MAX),
            is_recv: !pip.ctx.rule.is_send,
            is_md5: self.params().check_block_hash,
            infos: make_user_content(&trans.transfer_info),
        }
    }

    fn check_reply(pip: &mut Pipeline, req: &Request, reply: &Request) -> Result<(), TransferError> {
        if reply.id != req.id {
            return Err(mismatch("transfer id"));
        }
        if reply.rule != req.rule || reply.is_recv != req.is_recv {
            return Err(mismatch("rule"));
        }
        if reply.block != req.block {
            return Err(mismatch("block size"));
        }
        if reply.is_md5 != req.is_md5 {
            return Err(mismatch("block hash option"));
        }
        let base = |path: &str| path.rsplit('/').next().unwrap_or_default().to_string();
        if base(&reply.filepath) != base(&req.filepath) {
            return Err(mismatch("file name"));
        }
        if pip.ctx.rule.is_send {
            if reply.filesize != req.filesize {
                return Err(mismatch("file size"));
            }
        } else if reply.filesize >= 0 {
            pip.ctx.transfer.filesize = reply.filesize;
        }
        let resumed_at = i64::from(reply.rank) * i64::from(reply.block);
        if resumed_at < pip.transfer().progress {
            pip.ctx.transfer.progress = resumed_at;
        }
        pip.update_trans()
    }

    /// Aligns the progress on a block boundary and declares the size of a sent file.
    async fn prepare_request(&self, pip: &mut Pipeline) -> Result<Request, TransferError> {
        let block = i64::from(self.params().block_size);
        if pip.transfer().step <= TransferStep::Data {
            let progress = pip.transfer().progress;
            pip.ctx.transfer.progress = progress - progress % block;
        }
        if pip.ctx.rule.is_send {
            pip.ctx.transfer.filesize = Self::source_size(pip).await?;
        }
        pip.update_trans()?;
        Ok(self.make_request(pip))
    }

    async fn send_request(&mut self, pip: &mut Pipeline) -> Result<(), TransferError> {
        let req = match self.prepare_request(pip).await {
            Ok(req) => req,
            Err(err) => return Err(self.abort(err).await),
        };
        let reply = match self.session()?.request(req.clone()).await {
            Ok(reply) => reply,
            Err(err) => return Err(self.remote_failure(pip, err).await),
        };
        if let Err(err) = Self::check_reply(pip, &req, &reply) {
            return Err(self.abort(err).await);
        }
        Ok(())
    }

    async fn check_received(&self, pip: &mut Pipeline) -> Result<(), TransferError> {
        pip.end_data().await?;
        let trans = pip.transfer();
        if trans.filesize != UNKNOWN_SIZE && trans.progress != trans.filesize {
            return Err(TransferError::new(
                TransferErrorCode::BadSize,
                format!("incorrect file size (expected {}, got {})", trans.filesize, trans.progress),
            ));
        }
        let Some(digest) = self.digest() else {
            return Ok(());
        };
        let local = local_file_hash(pip, digest).await?;
        let valid = match &self.remote_hash {
            Some(hash) => bool::from(hash.as_slice().ct_eq(&local)),
            None => pip.transfer().filesize == 0,
        };
        if !valid {
            return Err(TransferError::new(TransferErrorCode::Integrity, "invalid file hash"));
        }
        Ok(())
    }

    /// Fills `buf` from the pipeline unless the end of the file comes first.
    async fn read_block(pip: &mut Pipeline, buf: &mut [u8]) -> Result<usize, TransferError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = pip.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

#[async_trait]
impl TransferClient for R66TransferClient {
    async fn request(&mut self, pip: &mut Pipeline) -> Result<(), TransferError> {
        let (partner, account) = partner_of(pip)?;
        let auth = self.handshake.authent(pip.gateway(), account)?;
        self.addr = partner.address.clone();
        // from here on, pause and cancel reach the partner
        let session = self
            .session
            .insert(connect(&self.pool, &self.handshake, &partner.address).await?);
        if let Err(err) = authenticate(session, auth, &self.handshake, pip.gateway(), partner).await {
            self.release().await;
            return Err(err);
        }
        self.send_request(pip).await
    }

    async fn end_pre_tasks(&mut self, pip: &mut Pipeline) -> Result<(), TransferError> {
        let info = pip.ctx.rule.is_send.then(|| {
            let trans = pip.transfer();
            UpdateInfo {
                filename: trans.remote_path.trim_start_matches('/').to_string(),
                filesize: trans.filesize,
                user_content: make_user_content(&trans.transfer_info),
            }
        });
        let reply = match self.session()?.end_pre_tasks(info).await {
            Ok(reply) => reply,
            Err(err) => return Err(self.remote_failure(pip, err).await),
        };
        let Some(info) = reply.filter(|_| !pip.ctx.rule.is_send) else {
            return Ok(());
        };
        match apply_update_info(pip, &info) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.abort(err).await),
        }
    }

    async fn send(&mut self, pip: &mut Pipeline) -> Result<(), TransferError> {
        if let Err(err) = self.session()?.start_data().await {
            return Err(self.remote_failure(pip, err).await);
        }
        let block_algo = self.block_algo();
        let mut buf = vec![0u8; self.params().block_size as usize];
        let mut rank = u32::try_from(pip.transfer().progress / i64::from(self.params().block_size)).unwrap_or(0);
        loop {
            let n = match Self::read_block(pip, &mut buf).await {
                Ok(n) => n,
                Err(err) if err.code.is_signal() => return Err(err),
                Err(err) => return Err(self.abort(err).await),
            };
            if n == 0 {
                break;
            }
            let payload = buf[..n].to_vec();
            let hash = self.params().check_block_hash.then(|| block_algo.hash_bytes(&payload));
            if let Err(err) = self.session()?.send_data(rank, payload, hash).await {
                return Err(self.remote_failure(pip, err).await);
            }
            rank += 1;
            if n < buf.len() {
                break;
            }
        }
        let hash = match self.digest() {
            Some(digest) => match local_file_hash(pip, digest).await {
                Ok(hash) => Some(hash),
                Err(err) => return Err(self.abort(err).await),
            },
            None => None,
        };
        if let Err(err) = self.session()?.end_transfer(hash).await {
            return Err(self.remote_failure(pip, err).await);
        }
        Ok(())
    }

    async fn receive(&mut self, pip: &mut Pipeline) -> Result<(), TransferError> {
        if let Err(err) = self.session()?.start_data().await {
            return Err(self.remote_failure(pip, err).await);
        }
        let block_algo = self.block_algo();
        let mut expected = u32::try_from(pip.transfer().progress / i64::from(self.params().block_size)).unwrap_or(0);
        loop {
            let incoming = match self.session()?.recv_data().await {
                Ok(incoming) => incoming,
                Err(err) => return Err(self.remote_failure(pip, err).await),
            };
            match incoming {
                Incoming::Data { rank, payload, hash } => {
                    if rank != expected {
                        let err = TransferError::new(
                            TransferErrorCode::DataTransfer,
                            format!("unexpected block rank {rank} (expected {expected})"),
                        );
                        return Err(self.abort(err).await);
                    }
                    if self.params().check_block_hash
                        && hash.as_deref() != Some(block_algo.hash_bytes(&payload).as_slice())
                    {
                        let err =
                            TransferError::new(TransferErrorCode::Integrity, format!("invalid hash for block {rank}"));
                        return Err(self.abort(err).await);
                    }
                    match pip.write(&payload).await {
                        Ok(()) => {}
                        Err(err) if err.code.is_signal() => return Err(err),
                        Err(err) => return Err(self.abort(err).await),
                    }
                    expected += 1;
                }
                Incoming::End { hash } => {
                    self.remote_hash = hash;
                    break;
                }
            }
        }
        if let Err(err) = self.check_received(pip).await {
            return Err(self.abort(err).await);
        }
        if let Err(err) = self.session()?.end_transfer_ok().await {
            return Err(self.remote_failure(pip, err).await);
        }
        Ok(())
    }

    async fn end_transfer(&mut self, pip: &mut Pipeline) -> Result<(), TransferError> {
        if let Err(err) = self.session()?.end_request().await {
            return Err(self.remote_failure(pip, err).await);
        }
        self.release().await;
        Ok(())
    }

    async fn send_error(&mut self, _pip: &mut Pipeline, err: &TransferError) {
        self.abort(err.clone()).await;
    }

    async fn pause(&mut self, _pip: &mut Pipeline) -> Result<(), TransferError> {
        let res = match &self.session {
            Some(session) => session.stop().await,
            None => Ok(()),
        };
        self.release().await;
        res.map_err(|err| TransferError::with_cause(TransferErrorCode::ConnectionReset, "failed to pause the transfer", &err))
    }

    async fn cancel(&mut self, _pip: &mut Pipeline) -> Result<(), TransferError> {
        let res = match &self.session {
            Some(session) => session.cancel().await,
            None => Ok(()),
        };
        self.release().await;
        res.map_err(|err| TransferError::with_cause(TransferErrorCode::ConnectionReset, "failed to cancel the transfer", &err))
    }
}
