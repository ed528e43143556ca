//! Validation of the requests of an authenticated session.

use async_trait::async_trait;
use common::error::io_to_transfer_error;
use common::model::{HistoryEntry, LocalAccount, Owner, Rule, Transfer, TransferStep};
use common::pipeline::{Pipeline, TransferContext, local_dir};
use common::store::DbError;
use common::{TransferError, TransferErrorCode};
use std::sync::Arc;

use crate::auth::{Negotiated, ServerEnv};
use crate::errors::to_wire;
use crate::info::{make_user_content, update_pipeline_info};
use crate::protocol::framing::MAX_BLOCK_SIZE;
use crate::protocol::server::{SessionHandler, TransferHandler};
use crate::protocol::{
    FileEntry, FileInfoReply, FileInfoRequest, Request, TransferInfoReply, TransferInfoRequest,
    WireError, WireErrorCode,
};
use crate::server_transfer::ServerTransfer;

fn database_error(err: &DbError) -> WireError {
    tracing::error!("database error: {err}");
    WireError::internal("database error")
}

/// Moves `progress` back to a block boundary no further than what both sides have.
/// Returns the adjusted progress and rank.
pub fn resume_point(progress: i64, rank: u32, block: u32) -> (i64, u32) {
    let block = i64::from(block.max(1));
    let requested = i64::from(rank) * block;
    if progress <= requested {
        let rank = u32::try_from(progress / block).unwrap_or(rank);
        (progress - progress % block, rank)
    } else {
        (requested, rank)
    }
}

pub struct R66SessionHandler {
    env: Arc<ServerEnv>,
    account: LocalAccount,
    negotiated: Negotiated,
}

impl R66SessionHandler {
    pub fn new(env: Arc<ServerEnv>, account: LocalAccount, negotiated: Negotiated) -> Self {
        Self {
            env,
            account,
            negotiated,
        }
    }

    fn check_request(req: &Request) -> Result<(), WireError> {
        if req.filepath.is_empty() {
            return Err(WireError::incorrect_command("missing filepath"));
        }
        if req.block == 0 {
            return Err(WireError::incorrect_command("missing block size"));
        }
        if req.block > MAX_BLOCK_SIZE {
            return Err(WireError::incorrect_command(format!(
                "block size {} exceeds the limit of {MAX_BLOCK_SIZE}",
                req.block
            )));
        }
        if req.rule.is_empty() {
            return Err(WireError::incorrect_command("missing transfer rule"));
        }
        Ok(())
    }

    fn is_authorized(&self, rule: &Rule) -> Result<bool, WireError> {
        let accesses = self
            .env
            .gateway
            .store
            .rule_accesses(rule.id)
            .map_err(|err| database_error(&err))?;
        if accesses.is_empty() {
            return Ok(true);
        }
        let account = Owner::LocalAccount(self.account.id);
        let agent = Owner::LocalAgent(self.env.agent.id);
        Ok(accesses.iter().any(|access| access.target == account || access.target == agent))
    }

    fn rule(&self, name: &str, is_send: bool) -> Result<Rule, WireError> {
        let rule = match self.env.gateway.store.rule(name, is_send) {
            Ok(rule) => rule,
            Err(err) if err.is_not_found() => {
                let direction = if is_send { "send" } else { "receive" };
                tracing::warn!("requested {direction} transfer rule {name:?} does not exist");
                return Err(WireError::incorrect_command("rule does not exist"));
            }
            Err(err) => return Err(database_error(&err)),
        };
        if !self.is_authorized(&rule)? {
            tracing::warn!("account {:?} is not allowed to use rule {name:?}", self.account.login);
            return Err(WireError::new(
                WireErrorCode::FileNotAllowed,
                "you do not have the rights to use this transfer rule",
            ));
        }
        Ok(rule)
    }

    /// The transfer to resume for this request, or a new one.
    fn transfer(&self, req: &Request, rule: &Rule) -> Result<Transfer, WireError> {
        let store = &self.env.gateway.store;
        let remote_id = req.id.to_string();
        match store.server_transfer(&remote_id, self.account.id) {
            Ok(trans) => {
                tracing::debug!("resuming transfer {} (remote id {remote_id})", trans.id);
                return Ok(trans);
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(database_error(&err)),
        }
        match store.server_history(&remote_id, &self.account.login, &self.env.agent.name) {
            Ok(_) => {
                return Err(to_wire(&TransferError::new(
                    TransferErrorCode::Forbidden,
                    "transfer is already finished",
                )));
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(database_error(&err)),
        }
        let mut trans = Transfer::new_server(remote_id, rule.id, self.account.id);
        let filename = req.filepath.trim_start_matches('/').to_string();
        if rule.is_send {
            trans.src_filename = filename;
        } else {
            trans.dest_filename = filename;
        }
        Ok(trans)
    }

    /// Declares the size of the file sent by this side.
    async fn stat_source(pip: &mut Pipeline) -> Result<(), TransferError> {
        let path = pip.local_path();
        let fs = pip.filesystem(&path)?;
        let info = fs.stat(&path).await.map_err(|err| {
            tracing::error!("failed to stat {path}: {err}");
            io_to_transfer_error(&err)
        })?;
        pip.ctx.transfer.filesize = i64::try_from(info.size).unwrap_or(i64::MAX);
        pip.update_trans()
    }

    async fn setup(pip: &mut Pipeline, req: &mut Request) -> Result<(), TransferError> {
        if pip.ctx.rule.is_send {
            if pip.transfer().step <= TransferStep::Data {
                Self::stat_source(pip).await?;
            }
            req.filesize = pip.transfer().filesize;
        } else if req.filesize >= 0 {
            pip.ctx.transfer.filesize = req.filesize;
        }
        update_pipeline_info(pip, &req.infos)
    }

    fn history_reply(id: i64, hist: &HistoryEntry) -> TransferInfoReply {
        TransferInfoReply {
            id,
            client: hist.account.clone(),
            server: hist.agent.clone(),
            file: if hist.is_send {
                hist.src_filename.clone()
            } else {
                hist.dest_filename.clone()
            },
            rule: hist.rule.clone(),
            is_recv: hist.is_send,
            is_md5: false,
            block_size: 0,
            status: hist.status.to_string(),
            step: hist.step.to_string(),
            progress: hist.progress,
            user_content: make_user_content(&hist.transfer_info),
            start: hist.start.to_rfc3339(),
            stop: hist.stop.to_rfc3339(),
        }
    }
}

#[async_trait]
impl SessionHandler for R66SessionHandler {
    #[tracing::instrument(skip_all, fields(account = %self.account.login, rule = %req.rule, id = req.id))]
    async fn valid_request(&mut self, req: &mut Request) -> Result<Box<dyn TransferHandler>, WireError> {
        Self::check_request(req)?;
        let rule = self.rule(&req.rule, req.is_recv)?;
        let verb = if rule.is_send { "Download" } else { "Upload" };
        tracing::info!(
            "{verb} of file {} was requested by {}, using rule {}",
            req.filepath,
            self.account.login,
            rule.name
        );

        let mut trans = self.transfer(req, &rule)?;
        if self.env.conf.block_size != 0 && self.env.conf.block_size != req.block {
            tracing::debug!("block size {} replaced by {}", req.block, self.env.conf.block_size);
            req.block = self.env.conf.block_size;
        }
        if trans.step <= TransferStep::Data {
            let (progress, rank) = resume_point(trans.progress, req.rank, req.block);
            trans.progress = progress;
            req.rank = rank;
        }

        let ctx = TransferContext::server(trans, rule, self.env.agent.clone(), self.account.clone());
        let mut pip = Pipeline::new_server(&self.env.gateway, ctx).map_err(|err| to_wire(&err))?;
        if let Err(err) = Self::setup(&mut pip, req).await {
            pip.set_error(&err).await;
            return Err(to_wire(&err));
        }
        Ok(Box::new(ServerTransfer::new(pip, self.negotiated)))
    }

    async fn file_info(&mut self, req: &FileInfoRequest) -> Result<FileInfoReply, WireError> {
        let rule = match self.env.gateway.store.rule(&req.rule, true) {
            Ok(rule) => rule,
            Err(err) if err.is_not_found() => return Err(WireError::incorrect_command("rule not found")),
            Err(err) => return Err(database_error(&err)),
        };
        if !self.is_authorized(&rule)? {
            return Err(WireError::incorrect_command("you do not have the rights to use this transfer rule"));
        }
        let ctx = TransferContext::server(
            Transfer::new_server(String::new(), rule.id, self.account.id),
            rule,
            self.env.agent.clone(),
            self.account.clone(),
        );
        let dir = local_dir(&self.env.gateway.paths, &ctx);
        let fs = self.env.gateway.resolver.resolve(&dir).map_err(|err| {
            tracing::error!("failed to instantiate the file system: {err}");
            WireError::internal("file system error")
        })?;
        let matches = fs.glob(&dir, req.pattern.trim_start_matches('/')).await.map_err(|err| {
            tracing::error!("failed to retrieve matching files: {err}");
            WireError::incorrect_command("incorrect file pattern")
        })?;
        if matches.is_empty() {
            return Err(WireError::new(
                WireErrorCode::FileNotFound,
                "no files found for the given pattern",
            ));
        }
        let files = matches
            .into_iter()
            .filter(|info| !info.is_dir)
            .map(|info| FileEntry {
                name: info.path.file_name().to_string(),
                size: info.size,
                modified: info.modified.map(|time| time.to_rfc3339()).unwrap_or_default(),
            })
            .collect();
        Ok(FileInfoReply { files })
    }

    async fn transfer_info(&mut self, req: &TransferInfoRequest) -> Result<TransferInfoReply, WireError> {
        if req.is_client {
            return Err(WireError::incorrect_command("requesting info on client transfers is forbidden"));
        }
        let store = &self.env.gateway.store;
        let remote_id = req.id.to_string();
        match store.server_transfer(&remote_id, self.account.id) {
            Ok(trans) => {
                let rule = store.rule_by_id(trans.rule_id).map_err(|err| database_error(&err))?;
                let file = if rule.is_send {
                    trans.src_filename.clone()
                } else {
                    trans.dest_filename.clone()
                };
                Ok(TransferInfoReply {
                    id: req.id,
                    client: self.account.login.clone(),
                    server: self.env.agent.name.clone(),
                    file,
                    rule: rule.name,
                    is_recv: rule.is_send,
                    is_md5: self.env.conf.check_block_hash,
                    block_size: self.env.conf.block_size,
                    status: trans.status.to_string(),
                    step: trans.step.to_string(),
                    progress: trans.progress,
                    user_content: make_user_content(&trans.transfer_info),
                    start: trans.start.to_rfc3339(),
                    stop: String::new(),
                })
            }
            Err(err) if err.is_not_found() => {
                match store.server_history(&remote_id, &self.account.login, &self.env.agent.name) {
                    Ok(hist) => Ok(Self::history_reply(req.id, &hist)),
                    Err(err) if err.is_not_found() => Err(WireError::incorrect_command("transfer not found")),
                    Err(err) => Err(database_error(&err)),
                }
            }
            Err(err) => Err(database_error(&err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::PathsConfig;
    use common::model::{LocalAgent, RuleAccess, TransferStatus};
    use common::store::{MemoryStore, Store};
    use common::Gateway;

    use crate::config::R66ServerConfig;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: Arc<MemoryStore>,
        gateway: Gateway,
        handler: R66SessionHandler,
        recv_rule: Rule,
    }

    fn fixture(conf: R66ServerConfig) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut agent = LocalAgent {
            name: "r66_server".into(),
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
        let mut recv_rule = Rule {
            name: "push".into(),
            is_send: false,
            ..Default::default()
        };
        recv_rule.id = store.add_rule(recv_rule.clone());
        let mut send_rule = Rule {
            name: "pull".into(),
            is_send: true,
            ..Default::default()
        };
        send_rule.id = store.add_rule(send_rule.clone());
        let paths = PathsConfig {
            gateway_home: tmp.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let gateway = Gateway::new(store.clone()).with_paths(paths);
        let env = Arc::new(ServerEnv {
            gateway: gateway.clone(),
            agent,
            conf,
        });
        let negotiated = Negotiated {
            filesize: true,
            digest: None,
        };
        Fixture {
            _tmp: tmp,
            store,
            gateway,
            handler: R66SessionHandler::new(env, account, negotiated),
            recv_rule,
        }
    }

    fn push_request(id: i64) -> Request {
        Request {
            id,
            filepath: "/file.txt".into(),
            filesize: 12,
            rule: "push".into(),
            block: 4,
            rank: 0,
            is_recv: false,
            is_md5: false,
            infos: r#"{"key": "value"}"#.into(),
        }
    }

    async fn refusal(fx: &mut Fixture, mut req: Request) -> WireError {
        match fx.handler.valid_request(&mut req).await {
            Ok(_) => panic!("request should have been refused"),
            Err(err) => err,
        }
    }

    #[test]
    fn resume_points() {
        assert_eq!(resume_point(0, 0, 512), (0, 0));
        // local progress behind the peer: trust the local checkpoint
        assert_eq!(resume_point(1300, 5, 512), (1024, 2));
        // peer behind the local progress: restart from the peer's rank
        assert_eq!(resume_point(2000, 1, 512), (512, 1));
        assert_eq!(resume_point(1024, 2, 512), (1024, 2));
    }

    #[tokio::test]
    async fn structural_checks() {
        let mut fx = fixture(R66ServerConfig::default());
        let mut req = push_request(1);
        req.filepath.clear();
        assert_eq!(refusal(&mut fx, req).await.message, "missing filepath");
        let mut req = push_request(1);
        req.block = 0;
        assert_eq!(refusal(&mut fx, req).await.message, "missing block size");
        let mut req = push_request(1);
        req.block = MAX_BLOCK_SIZE + 1;
        let err = refusal(&mut fx, req).await;
        assert_eq!(err.code, WireErrorCode::IncorrectCommand);
        assert!(err.message.contains("exceeds the limit"), "{}", err.message);
        let mut req = push_request(1);
        req.block = u32::MAX;
        assert_eq!(refusal(&mut fx, req).await.code, WireErrorCode::IncorrectCommand);
        let mut req = push_request(1);
        req.rule.clear();
        assert_eq!(refusal(&mut fx, req).await.code, WireErrorCode::IncorrectCommand);
        let mut req = push_request(1);
        req.rule = "nope".into();
        assert_eq!(refusal(&mut fx, req).await.message, "rule does not exist");
        assert!(fx.store.transfers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rule_access_is_checked() {
        let mut fx = fixture(R66ServerConfig::default());
        fx.store.add_rule_access(RuleAccess {
            rule_id: fx.recv_rule.id,
            target: Owner::LocalAccount(9999),
        });
        let err = refusal(&mut fx, push_request(1)).await;
        assert_eq!(err.code, WireErrorCode::FileNotAllowed);
    }

    #[tokio::test]
    async fn retried_requests_resume_the_same_transfer() {
        let mut fx = fixture(R66ServerConfig::default());
        let mut req = push_request(77);
        let handler = fx.handler.valid_request(&mut req).await.unwrap();
        let trans = fx.store.transfers().unwrap().remove(0);
        assert_eq!(trans.remote_transfer_id, "77");
        assert_eq!(trans.filesize, 12);
        assert_eq!(trans.transfer_info["key"], "value");
        drop(handler);

        let mut trans = fx.store.transfer(trans.id).unwrap();
        trans.step = TransferStep::Data;
        trans.progress = 6;
        trans.status = TransferStatus::Interrupted;
        fx.store.update_transfer(&trans).unwrap();

        let mut req = push_request(77);
        req.rank = 3;
        let handler = fx.handler.valid_request(&mut req).await.unwrap();
        assert_eq!(req.rank, 1);
        drop(handler);
        let all = fx.store.transfers().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].progress, 4);
        assert_eq!(all[0].status, TransferStatus::Running);
    }

    #[tokio::test]
    async fn server_block_size_wins() {
        let mut fx = fixture(R66ServerConfig {
            block_size: 512,
            ..Default::default()
        });
        let mut req = push_request(5);
        let _handler = fx.handler.valid_request(&mut req).await.unwrap();
        assert_eq!(req.block, 512);
    }

    #[tokio::test]
    async fn broken_transfer_info_is_an_internal_error() {
        let mut fx = fixture(R66ServerConfig::default());
        let mut req = push_request(8);
        req.infos = "{not json".into();
        let err = refusal(&mut fx, req).await;
        assert_eq!(err.code, WireErrorCode::Internal);
        let trans = fx.store.transfers().unwrap().remove(0);
        assert_eq!(trans.status, TransferStatus::Error);
        assert_eq!(trans.error_code, TransferErrorCode::Internal);
        assert!(!fx.gateway.registry.is_running(trans.id));
    }

    #[tokio::test]
    async fn pull_declares_the_file_size() {
        let mut fx = fixture(R66ServerConfig::default());
        let out = std::path::Path::new(&fx.gateway.paths.gateway_home).join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("report.csv"), b"a,b,c\n").unwrap();
        let mut req = Request {
            filesize: -1,
            filepath: "report.csv".into(),
            rule: "pull".into(),
            is_recv: true,
            ..push_request(9)
        };
        let _handler = fx.handler.valid_request(&mut req).await.unwrap();
        assert_eq!(req.filesize, 6);

        let mut req = Request {
            filepath: "missing.csv".into(),
            rule: "pull".into(),
            is_recv: true,
            ..push_request(10)
        };
        let err = fx.handler.valid_request(&mut req).await.err().unwrap();
        assert_eq!(err.code, WireErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn file_listing() {
        let mut fx = fixture(R66ServerConfig::default());
        let out = std::path::Path::new(&fx.gateway.paths.gateway_home).join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("a.txt"), b"aaa").unwrap();
        std::fs::write(out.join("b.txt"), b"b").unwrap();
        std::fs::write(out.join("c.bin"), b"c").unwrap();
        let req = FileInfoRequest {
            rule: "pull".into(),
            pattern: "*.txt".into(),
        };
        let reply = fx.handler.file_info(&req).await.unwrap();
        let names: Vec<_> = reply.files.iter().map(|f| (f.name.as_str(), f.size)).collect();
        assert_eq!(names, [("a.txt", 3), ("b.txt", 1)]);

        let req = FileInfoRequest {
            rule: "pull".into(),
            pattern: "*.pdf".into(),
        };
        assert_eq!(fx.handler.file_info(&req).await.unwrap_err().code, WireErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn transfer_status() {
        let mut fx = fixture(R66ServerConfig {
            check_block_hash: true,
            ..Default::default()
        });
        let mut req = push_request(31);
        let handler = fx.handler.valid_request(&mut req).await.unwrap();
        let info = fx
            .handler
            .transfer_info(&TransferInfoRequest { id: 31, is_client: false })
            .await
            .unwrap();
        assert_eq!(info.status, "Running");
        assert_eq!(info.file, "file.txt");
        assert_eq!(info.client, "toto");
        assert!(info.is_md5);
        assert_eq!(info.block_size, 0);
        drop(handler);

        let err = fx
            .handler
            .transfer_info(&TransferInfoRequest { id: 31, is_client: true })
            .await
            .unwrap_err();
        assert_eq!(err.code, WireErrorCode::IncorrectCommand);
        let err = fx
            .handler
            .transfer_info(&TransferInfoRequest { id: 32, is_client: false })
            .await
            .unwrap_err();
        assert_eq!(err.message, "transfer not found");
    }
}
