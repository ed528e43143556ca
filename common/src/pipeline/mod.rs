//! Protocol-agnostic transfer orchestration.
//!
//! A [`Pipeline`] owns one transfer attempt: it persists every state change of
//! the [`Transfer`], runs the rule's task chains, gives the protocol module a
//! file stream for the data phase and archives the record once it is over.
//! Protocol modules drive it step by step:
//!
//! `pre_tasks -> start_data -> read/write -> end_data -> post_tasks -> end_transfer`
//!
//! with `set_error`, `pause`, `interrupt` and `cancel` as the exits.
//! While a pipeline exists its transfer is listed in the [`TransferRegistry`].

pub mod client;
pub mod registry;
pub mod signal;
pub mod tasks;

use async_trait::async_trait;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

pub use client::{TransferClient, run_client};
pub use registry::{Origin, RegistryGuard, TransferRegistry};
pub use signal::{Cause, Signal};
pub use tasks::{NoopTaskRunner, TaskRunner};

use crate::config::PathsConfig;
use crate::error::io_to_transfer_error;
use crate::fs::{FileHandle, FileSystem, FsPath, OpenMode};
use crate::model::{
    Client, HistoryEntry, LocalAccount, LocalAgent, RemoteAccount, RemoteAgent, Rule, TaskChain,
    Transfer, TransferStatus, TransferStep, UNKNOWN_SIZE,
};
use crate::{Gateway, TransferError, TransferErrorCode};

/// Everything a transfer attempt is bound to. Rebuilt on every attempt.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub transfer: Transfer,
    pub rule: Rule,
    pub local_agent: Option<LocalAgent>,
    pub local_account: Option<LocalAccount>,
    pub client: Option<Client>,
    pub remote_agent: Option<RemoteAgent>,
    pub remote_account: Option<RemoteAccount>,
}

impl TransferContext {
    pub fn server(transfer: Transfer, rule: Rule, agent: LocalAgent, account: LocalAccount) -> Self {
        Self {
            transfer,
            rule,
            local_agent: Some(agent),
            local_account: Some(account),
            client: None,
            remote_agent: None,
            remote_account: None,
        }
    }

    pub fn client(
        transfer: Transfer,
        rule: Rule,
        client: Client,
        partner: RemoteAgent,
        account: RemoteAccount,
    ) -> Self {
        Self {
            transfer,
            rule,
            local_agent: None,
            local_account: None,
            client: Some(client),
            remote_agent: Some(partner),
            remote_account: Some(account),
        }
    }

    /// Name of the file on this side of the transfer.
    pub fn local_filename(&self) -> &str {
        if self.rule.is_send {
            &self.transfer.src_filename
        } else {
            &self.transfer.dest_filename
        }
    }

    /// Name of the file on the partner's side, defaulting to the local name.
    pub fn remote_filename(&self) -> &str {
        let name = if self.rule.is_send {
            &self.transfer.dest_filename
        } else {
            &self.transfer.src_filename
        };
        if name.is_empty() { self.local_filename() } else { name }
    }

    fn origin(&self) -> Result<Origin, TransferError> {
        match (&self.local_agent, &self.client) {
            (Some(agent), _) => Ok(Origin::Server(agent.id)),
            (None, Some(client)) => Ok(Origin::Client(client.id)),
            (None, None) => Err(TransferError::internal("transfer has neither a server nor a client")),
        }
    }

    fn account_and_agent(&self) -> (String, String, String) {
        match (&self.local_agent, &self.local_account, &self.remote_agent, &self.remote_account) {
            (Some(agent), Some(account), _, _) => {
                (account.login.clone(), agent.name.clone(), agent.protocol.clone())
            }
            (_, _, Some(agent), Some(account)) => {
                (account.login.clone(), agent.name.clone(), agent.protocol.clone())
            }
            _ => Default::default(),
        }
    }
}

fn resolve_dir(base: &FsPath, dir: &str) -> FsPath {
    if dir.contains("://") {
        FsPath::parse(dir)
    } else if std::path::Path::new(dir).is_absolute() {
        FsPath::local(dir)
    } else {
        base.join(dir)
    }
}

/// Base directory of a transfer: the server's root dir, or the gateway home.
fn base_dir(paths: &PathsConfig, ctx: &TransferContext) -> FsPath {
    let home = FsPath::parse(&paths.gateway_home);
    match &ctx.local_agent {
        Some(agent) if !agent.root_dir.is_empty() => resolve_dir(&home, &agent.root_dir),
        _ => home,
    }
}

/// Resolves the local directory of a transfer.
///
/// Order: rule local dir, then the server's send/receive dir, then the
/// gateway default out/in dir.
pub fn local_dir(paths: &PathsConfig, ctx: &TransferContext) -> FsPath {
    let base = base_dir(paths, ctx);
    if !ctx.rule.local_dir.is_empty() {
        return resolve_dir(&base, &ctx.rule.local_dir);
    }
    if let Some(agent) = &ctx.local_agent {
        let dir = if ctx.rule.is_send { &agent.send_dir } else { &agent.receive_dir };
        if !dir.is_empty() {
            return resolve_dir(&base, dir);
        }
    }
    let default = if ctx.rule.is_send {
        &paths.default_out_dir
    } else {
        &paths.default_in_dir
    };
    resolve_dir(&base, default)
}

fn tmp_dir(paths: &PathsConfig, ctx: &TransferContext) -> FsPath {
    let base = base_dir(paths, ctx);
    if !ctx.rule.tmp_local_rcv_dir.is_empty() {
        resolve_dir(&base, &ctx.rule.tmp_local_rcv_dir)
    } else {
        resolve_dir(&base, &paths.default_tmp_dir)
    }
}

fn set_paths(paths: &PathsConfig, ctx: &mut TransferContext) {
    let local = local_dir(paths, ctx).join(ctx.local_filename());
    let remote_name = ctx.remote_filename().trim_start_matches('/').to_string();
    let remote_dir = ctx.rule.remote_dir.trim_end_matches('/');
    ctx.transfer.local_path = local.to_string();
    ctx.transfer.remote_path = if remote_dir.is_empty() {
        remote_name
    } else {
        format!("{remote_dir}/{remote_name}")
    };
}

fn to_offset(progress: i64) -> u64 {
    u64::try_from(progress).unwrap_or(0)
}

/// Callbacks run when a transfer is stopped from the outside.
#[async_trait]
pub trait Interruptible: Send {
    async fn pause(&mut self) -> Result<(), TransferError>;
    async fn interrupt(&mut self) -> Result<(), TransferError>;
    async fn cancel(&mut self) -> Result<(), TransferError>;
}

pub struct Pipeline {
    pub ctx: TransferContext,
    gateway: Gateway,
    signal: Signal,
    file: Option<FileHandle>,
    data_started: bool,
    data_done: bool,
    _guard: RegistryGuard,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("transfer", &self.ctx.transfer.id)
            .field("step", &self.ctx.transfer.step)
            .field("status", &self.ctx.transfer.status)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Starts the attempt of a transfer received by a local server.
    pub fn new_server(gateway: &Gateway, ctx: TransferContext) -> Result<Self, TransferError> {
        if ctx.local_agent.is_none() || ctx.local_account.is_none() {
            return Err(TransferError::internal("server transfer without a local account"));
        }
        Self::init(gateway, ctx)
    }

    /// Starts the attempt of a transfer initiated by a local client.
    pub fn new_client(gateway: &Gateway, ctx: TransferContext) -> Result<Self, TransferError> {
        if ctx.client.is_none() || ctx.remote_agent.is_none() || ctx.remote_account.is_none() {
            return Err(TransferError::internal("client transfer without a partner"));
        }
        Self::init(gateway, ctx)
    }

    fn init(gateway: &Gateway, mut ctx: TransferContext) -> Result<Self, TransferError> {
        if ctx.transfer.status.is_terminal() {
            return Err(TransferError::new(
                TransferErrorCode::Forbidden,
                "transfer is already finished",
            ));
        }
        let origin = ctx.origin()?;
        if ctx.transfer.local_path.is_empty() {
            set_paths(&gateway.paths, &mut ctx);
        }
        ctx.transfer.status = TransferStatus::Running;
        ctx.transfer.error_code = TransferErrorCode::Ok;
        ctx.transfer.error_details.clear();
        if ctx.transfer.id == 0 {
            gateway.store.insert_transfer(&mut ctx.transfer)?;
            if ctx.transfer.remote_transfer_id.is_empty() {
                ctx.transfer.remote_transfer_id = ctx.transfer.id.to_string();
            }
        }
        let signal = Signal::new();
        let guard = gateway
            .registry
            .register(ctx.transfer.id, origin, signal.clone())?;
        gateway.store.update_transfer(&ctx.transfer)?;
        tracing::info!(
            "transfer {} started: {} {} (step {}, progress {})",
            ctx.transfer.id,
            ctx.rule.direction(),
            ctx.transfer.local_path,
            ctx.transfer.step,
            ctx.transfer.progress
        );
        let data_done = ctx.transfer.step > TransferStep::Data;
        Ok(Self {
            ctx,
            gateway: gateway.clone(),
            signal,
            file: None,
            data_started: false,
            data_done,
            _guard: guard,
        })
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn transfer(&self) -> &Transfer {
        &self.ctx.transfer
    }

    pub fn data_started(&self) -> bool {
        self.data_started
    }

    pub fn local_path(&self) -> FsPath {
        FsPath::parse(&self.ctx.transfer.local_path)
    }

    /// Where received data is written until [`Pipeline::end_data`].
    pub fn part_path(&self) -> FsPath {
        tmp_dir(&self.gateway.paths, &self.ctx)
            .join(self.local_path().file_name())
            .with_suffix(".part")
    }

    pub fn filesystem(&self, path: &FsPath) -> Result<Arc<dyn FileSystem>, TransferError> {
        self.gateway.resolver.resolve(path).map_err(|err| {
            tracing::error!("failed to resolve {path}: {err}");
            TransferError::internal("failed to resolve file path")
        })
    }

    /// Opens the local file read-only, e.g. to compute its hash.
    pub async fn open_local(&self) -> Result<FileHandle, TransferError> {
        let path = self.local_path();
        let fs = self.filesystem(&path)?;
        fs.open(&path, OpenMode::Read)
            .await
            .map_err(|err| io_to_transfer_error(&err))
    }

    /// Persists the in-memory transfer record.
    pub fn update_trans(&self) -> Result<(), TransferError> {
        self.gateway.store.update_transfer(&self.ctx.transfer)?;
        Ok(())
    }

    /// Changes the local file name and rebuilds the transfer paths.
    pub fn rebuild_filepaths(&mut self, new_file: &str) -> Result<(), TransferError> {
        if self.data_started {
            return Err(TransferError::internal(
                "cannot rename the file once the data transfer has started",
            ));
        }
        if self.ctx.rule.is_send {
            self.ctx.transfer.src_filename = new_file.to_string();
        } else {
            self.ctx.transfer.dest_filename = new_file.to_string();
        }
        set_paths(&self.gateway.paths, &mut self.ctx);
        self.update_trans()
    }

    async fn run_chain(&mut self, chain: TaskChain) -> Result<(), TransferError> {
        let tasks = self.ctx.rule.chain(chain);
        if tasks.is_empty() {
            return Ok(());
        }
        let runner = Arc::clone(&self.gateway.tasks);
        self.signal.guard(runner.run(chain, &tasks, &self.ctx)).await
    }

    pub async fn pre_tasks(&mut self) -> Result<(), TransferError> {
        if self.ctx.transfer.step > TransferStep::PreTasks {
            return Ok(());
        }
        self.ctx.transfer.step = TransferStep::PreTasks;
        self.update_trans()?;
        self.run_chain(TaskChain::Pre).await?;
        self.ctx.transfer.task_number = 0;
        self.update_trans()
    }

    /// Opens the file stream of the data phase, positioned at the current progress.
    pub async fn start_data(&mut self) -> Result<(), TransferError> {
        if self.data_started {
            return Ok(());
        }
        self.data_started = true;
        if self.data_done {
            return Ok(());
        }
        self.ctx.transfer.step = TransferStep::Data;
        let file = if self.ctx.rule.is_send {
            self.open_source().await?
        } else {
            self.open_destination().await?
        };
        self.file = Some(file);
        self.update_trans()
    }

    async fn open_source(&mut self) -> Result<FileHandle, TransferError> {
        let path = self.local_path();
        let fs = self.filesystem(&path)?;
        let info = fs.stat(&path).await.map_err(|err| io_to_transfer_error(&err))?;
        self.ctx.transfer.filesize = i64::try_from(info.size).unwrap_or(i64::MAX);
        if self.ctx.transfer.progress > self.ctx.transfer.filesize {
            return Err(TransferError::new(
                TransferErrorCode::BadSize,
                "transfer progress exceeds the file size",
            ));
        }
        let mut file = fs
            .open(&path, OpenMode::Read)
            .await
            .map_err(|err| io_to_transfer_error(&err))?;
        file.seek(SeekFrom::Start(to_offset(self.ctx.transfer.progress)))
            .await
            .map_err(|err| io_to_transfer_error(&err))?;
        Ok(file)
    }

    async fn open_destination(&mut self) -> Result<FileHandle, TransferError> {
        let path = self.part_path();
        let fs = self.filesystem(&path)?;
        fs.mkdir_all(&path.parent())
            .await
            .map_err(|err| io_to_transfer_error(&err))?;
        if self.ctx.transfer.progress == 0 {
            match fs.remove(&path).await {
                Ok(()) => tracing::debug!("removed stale temporary file {path}"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_to_transfer_error(&err)),
            }
        }
        let mut file = fs
            .open(&path, OpenMode::Write)
            .await
            .map_err(|err| io_to_transfer_error(&err))?;
        file.seek(SeekFrom::Start(to_offset(self.ctx.transfer.progress)))
            .await
            .map_err(|err| io_to_transfer_error(&err))?;
        Ok(file)
    }

    /// Reads the next chunk of the file being sent; `0` means end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        if self.data_done {
            return Ok(0);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::internal("file stream is not open"))?;
        let n = match self.signal.race(file.read(buf)).await {
            Ok(res) => res.map_err(|err| {
                TransferError::with_cause(TransferErrorCode::DataTransfer, "failed to read file", &err)
            })?,
            Err(cause) => return Err(cause.to_error()),
        };
        if n > 0 {
            self.ctx.transfer.progress += n as i64;
            self.update_trans()?;
        }
        Ok(n)
    }

    /// Appends a chunk to the file being received.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), TransferError> {
        if self.data_done {
            return Err(TransferError::internal("data transfer is already over"));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::internal("file stream is not open"))?;
        match self.signal.race(file.write_all(buf)).await {
            Ok(res) => res.map_err(|err| {
                TransferError::with_cause(TransferErrorCode::DataTransfer, "failed to write file", &err)
            })?,
            Err(cause) => return Err(cause.to_error()),
        }
        self.ctx.transfer.progress += buf.len() as i64;
        self.update_trans()
    }

    async fn close_file(&mut self) -> Result<(), TransferError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|err| io_to_transfer_error(&err))?;
            file.shutdown().await.map_err(|err| io_to_transfer_error(&err))?;
        }
        Ok(())
    }

    /// Closes the data stream and moves a received file to its final path.
    pub async fn end_data(&mut self) -> Result<(), TransferError> {
        if !self.data_started {
            self.start_data().await?;
        }
        self.close_file().await?;
        if self.data_done {
            return Ok(());
        }
        if !self.ctx.rule.is_send {
            let part = self.part_path();
            let dest = self.local_path();
            let fs = self.filesystem(&dest)?;
            fs.mkdir_all(&dest.parent())
                .await
                .map_err(|err| io_to_transfer_error(&err))?;
            fs.rename(&part, &dest).await.map_err(|err| {
                TransferError::with_cause(
                    TransferErrorCode::Finalization,
                    "failed to move the received file",
                    &err,
                )
            })?;
        }
        if self.ctx.transfer.filesize == UNKNOWN_SIZE {
            self.ctx.transfer.filesize = self.ctx.transfer.progress;
        }
        self.data_done = true;
        self.update_trans()
    }

    pub async fn post_tasks(&mut self) -> Result<(), TransferError> {
        if self.ctx.transfer.step > TransferStep::PostTasks {
            return Ok(());
        }
        self.ctx.transfer.step = TransferStep::PostTasks;
        self.update_trans()?;
        self.run_chain(TaskChain::Post).await?;
        self.ctx.transfer.task_number = 0;
        self.update_trans()
    }

    /// Marks the transfer done and archives it.
    pub async fn end_transfer(&mut self) -> Result<(), TransferError> {
        self.close_file().await?;
        self.ctx.transfer.step = TransferStep::None;
        self.ctx.transfer.status = TransferStatus::Done;
        self.ctx.transfer.task_number = 0;
        self.archive()?;
        tracing::info!("transfer {} done", self.ctx.transfer.id);
        Ok(())
    }

    fn archive(&self) -> Result<(), TransferError> {
        let trans = &self.ctx.transfer;
        let (account, agent, protocol) = self.ctx.account_and_agent();
        let entry = HistoryEntry {
            id: trans.id,
            remote_transfer_id: trans.remote_transfer_id.clone(),
            is_server: trans.is_server,
            is_send: self.ctx.rule.is_send,
            rule: self.ctx.rule.name.clone(),
            account,
            agent,
            protocol,
            src_filename: trans.src_filename.clone(),
            dest_filename: trans.dest_filename.clone(),
            local_path: trans.local_path.clone(),
            remote_path: trans.remote_path.clone(),
            filesize: trans.filesize,
            start: trans.start,
            stop: chrono::Utc::now(),
            status: trans.status,
            step: trans.step,
            progress: trans.progress,
            error_code: trans.error_code,
            error_details: trans.error_details.clone(),
            transfer_info: trans.transfer_info.clone(),
        };
        self.gateway.store.insert_history(&entry)?;
        self.gateway.store.delete_transfer(trans.id)?;
        Ok(())
    }

    /// Records a failure: runs the error tasks, then persists the
    /// `Error` status with the original cause. The reached step is kept so
    /// the transfer can be resumed.
    pub async fn set_error(&mut self, err: &TransferError) {
        tracing::error!("transfer {} failed: {err}", self.ctx.transfer.id);
        if let Err(close_err) = self.close_file().await {
            tracing::warn!("failed to close the file stream: {close_err}");
        }
        let failed_step = self.ctx.transfer.step;
        self.ctx.transfer.status = TransferStatus::Error;
        self.ctx.transfer.error_code = err.code;
        self.ctx.transfer.error_details = err.details.clone();
        self.ctx.transfer.step = TransferStep::ErrorTasks;
        if let Err(db_err) = self.update_trans() {
            tracing::error!("failed to persist the transfer error: {db_err}");
        }
        let tasks = self.ctx.rule.chain(TaskChain::Error);
        if !tasks.is_empty() {
            let runner = Arc::clone(&self.gateway.tasks);
            if let Err(task_err) = runner.run(TaskChain::Error, &tasks, &self.ctx).await {
                tracing::error!("error tasks failed: {task_err}");
            }
        }
        self.ctx.transfer.step = failed_step;
        self.ctx.transfer.task_number = 0;
        if let Err(db_err) = self.update_trans() {
            tracing::error!("failed to persist the transfer error: {db_err}");
        }
    }

    async fn stop_with(&mut self, status: TransferStatus) -> Result<(), TransferError> {
        let closed = self.close_file().await;
        self.ctx.transfer.status = status;
        self.update_trans()?;
        tracing::info!("transfer {} {status}", self.ctx.transfer.id);
        closed
    }

    pub async fn pause(&mut self) -> Result<(), TransferError> {
        self.stop_with(TransferStatus::Paused).await
    }

    pub async fn interrupt(&mut self) -> Result<(), TransferError> {
        self.stop_with(TransferStatus::Interrupted).await
    }

    pub async fn cancel(&mut self) -> Result<(), TransferError> {
        let closed = self.close_file().await;
        self.ctx.transfer.status = TransferStatus::Cancelled;
        self.archive()?;
        tracing::info!("transfer {} cancelled", self.ctx.transfer.id);
        closed
    }

    /// Applies the outcome matching a raised [`Cause`].
    pub async fn halt(&mut self, cause: Cause) -> Result<(), TransferError> {
        match cause {
            Cause::Shutdown => self.interrupt().await,
            Cause::Pause => self.pause().await,
            Cause::Cancel => self.cancel().await,
        }
    }
}

#[async_trait]
impl Interruptible for Pipeline {
    async fn pause(&mut self) -> Result<(), TransferError> {
        Pipeline::pause(self).await
    }

    async fn interrupt(&mut self) -> Result<(), TransferError> {
        Pipeline::interrupt(self).await
    }

    async fn cancel(&mut self) -> Result<(), TransferError> {
        Pipeline::cancel(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use crate::store::{MemoryStore, Store};

    struct Fixture {
        _tmp: tempfile::TempDir,
        gateway: Gateway,
        store: Arc<MemoryStore>,
        agent: LocalAgent,
        account: LocalAccount,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut agent = LocalAgent {
            name: "server".into(),
            protocol: "r66".into(),
            ..Default::default()
        };
        agent.id = store.add_local_agent(agent.clone());
        let mut account = LocalAccount {
            local_agent_id: agent.id,
            login: "toto".into(),
            ..Default::default()
        };
        account.id = store.add_local_account(account.clone());
        let paths = PathsConfig {
            gateway_home: tmp.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let gateway = Gateway::new(store.clone()).with_paths(paths);
        Fixture {
            _tmp: tmp,
            gateway,
            store,
            agent,
            account,
        }
    }

    fn recv_rule(store: &MemoryStore) -> Rule {
        let mut rule = Rule {
            name: "push".into(),
            is_send: false,
            tasks: vec![Task {
                chain: TaskChain::Pre,
                kind: "COPY".into(),
                args: Default::default(),
            }],
            ..Default::default()
        };
        rule.id = store.add_rule(rule.clone());
        rule
    }

    fn server_ctx(fx: &Fixture, rule: &Rule, trans: Transfer) -> TransferContext {
        TransferContext::server(trans, rule.clone(), fx.agent.clone(), fx.account.clone())
    }

    fn new_trans(fx: &Fixture, rule: &Rule) -> Transfer {
        let mut trans = Transfer::new_server("42".into(), rule.id, fx.account.id);
        trans.dest_filename = "file.txt".into();
        trans
    }

    #[tokio::test]
    async fn receive_is_archived() {
        let fx = fixture();
        let rule = recv_rule(&fx.store);
        let ctx = server_ctx(&fx, &rule, new_trans(&fx, &rule));
        let mut pip = Pipeline::new_server(&fx.gateway, ctx).unwrap();
        let id = pip.transfer().id;
        assert!(fx.gateway.registry.is_running(id));
        assert!(pip.transfer().local_path.ends_with("in/file.txt"));
        pip.pre_tasks().await.unwrap();
        pip.start_data().await.unwrap();
        pip.write(b"hello ").await.unwrap();
        pip.write(b"world!").await.unwrap();
        assert_eq!(fx.store.transfer(id).unwrap().progress, 12);
        pip.end_data().await.unwrap();
        pip.post_tasks().await.unwrap();
        pip.end_transfer().await.unwrap();
        let local = pip.local_path();
        drop(pip);
        assert!(!fx.gateway.registry.is_running(id));
        assert_eq!(std::fs::read(&local.path).unwrap(), b"hello world!");
        let hist = fx.store.history(id).unwrap();
        assert_eq!(hist.status, TransferStatus::Done);
        assert_eq!(hist.filesize, 12);
        assert_eq!(hist.account, "toto");
        assert!(fx.store.transfer(id).is_err());
    }

    #[tokio::test]
    async fn interrupted_receive_resumes() {
        let fx = fixture();
        let rule = recv_rule(&fx.store);
        let ctx = server_ctx(&fx, &rule, new_trans(&fx, &rule));
        let mut pip = Pipeline::new_server(&fx.gateway, ctx).unwrap();
        let id = pip.transfer().id;
        pip.pre_tasks().await.unwrap();
        pip.start_data().await.unwrap();
        pip.write(b"abcd").await.unwrap();
        pip.signal().raise(Cause::Shutdown);
        let err = pip.write(b"efgh").await.unwrap_err();
        assert_eq!(err.code, TransferErrorCode::ShuttingDown);
        pip.halt(Cause::Shutdown).await.unwrap();
        drop(pip);

        let trans = fx.store.transfer(id).unwrap();
        assert_eq!(trans.status, TransferStatus::Interrupted);
        assert_eq!(trans.step, TransferStep::Data);
        assert_eq!(trans.progress, 4);

        let mut pip = Pipeline::new_server(&fx.gateway, server_ctx(&fx, &rule, trans)).unwrap();
        pip.start_data().await.unwrap();
        pip.write(b"efgh").await.unwrap();
        pip.end_data().await.unwrap();
        assert_eq!(std::fs::read(&pip.local_path().path).unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn error_keeps_step() {
        let fx = fixture();
        let rule = recv_rule(&fx.store);
        let ctx = server_ctx(&fx, &rule, new_trans(&fx, &rule));
        let mut pip = Pipeline::new_server(&fx.gateway, ctx).unwrap();
        pip.pre_tasks().await.unwrap();
        pip.start_data().await.unwrap();
        let err = TransferError::new(TransferErrorCode::Integrity, "invalid file hash");
        pip.set_error(&err).await;
        let trans = fx.store.transfer(pip.transfer().id).unwrap();
        assert_eq!(trans.status, TransferStatus::Error);
        assert_eq!(trans.step, TransferStep::Data);
        assert_eq!(trans.error(), Some(err));
    }

    #[tokio::test]
    async fn concurrent_attempts_are_refused() {
        let fx = fixture();
        let rule = recv_rule(&fx.store);
        let ctx = server_ctx(&fx, &rule, new_trans(&fx, &rule));
        let pip = Pipeline::new_server(&fx.gateway, ctx).unwrap();
        let again = server_ctx(&fx, &rule, fx.store.transfer(pip.transfer().id).unwrap());
        let err = Pipeline::new_server(&fx.gateway, again).unwrap_err();
        assert_eq!(err.details, "transfer is already running");
    }

    #[tokio::test]
    async fn cancel_archives() {
        let fx = fixture();
        let rule = recv_rule(&fx.store);
        let ctx = server_ctx(&fx, &rule, new_trans(&fx, &rule));
        let mut pip = Pipeline::new_server(&fx.gateway, ctx).unwrap();
        let id = pip.transfer().id;
        Interruptible::cancel(&mut pip).await.unwrap();
        assert_eq!(fx.store.history(id).unwrap().status, TransferStatus::Cancelled);
        assert!(fx.store.transfer(id).unwrap_err().is_not_found());
    }

    #[test]
    fn directories_are_resolved() {
        let paths = PathsConfig {
            gateway_home: "/gw".into(),
            ..Default::default()
        };
        let rule = Rule {
            is_send: true,
            ..Default::default()
        };
        let agent = LocalAgent {
            root_dir: "srv".into(),
            send_dir: "outgoing".into(),
            ..Default::default()
        };
        let mut ctx = TransferContext::server(
            Transfer::new_server("1".into(), 1, 1),
            rule,
            agent,
            LocalAccount::default(),
        );
        assert_eq!(local_dir(&paths, &ctx).path, "/gw/srv/outgoing");
        ctx.rule.local_dir = "/data/out".into();
        assert_eq!(local_dir(&paths, &ctx).path, "/data/out");
        ctx.local_agent = None;
        ctx.rule.local_dir.clear();
        assert_eq!(local_dir(&paths, &ctx).path, "/gw/out");
    }
}
