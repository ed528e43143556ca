//! The local half of a transfer served to a requester.

use async_trait::async_trait;
use common::error::io_to_transfer_error;
use common::model::{TransferStep, UNKNOWN_SIZE};
use common::pipeline::{Cause, Pipeline, Signal};
use common::{TransferError, TransferErrorCode};
use subtle::ConstantTimeEq;

use crate::auth::Negotiated;
use crate::errors::from_wire;
use crate::hash::local_file_hash;
use crate::info::{apply_update_info, make_user_content};
use crate::protocol::server::TransferHandler;
use crate::protocol::{UpdateInfo, WireError};

pub struct ServerTransfer {
    pip: Pipeline,
    negotiated: Negotiated,
}

impl ServerTransfer {
    pub fn new(pip: Pipeline, negotiated: Negotiated) -> Self {
        Self { pip, negotiated }
    }

    async fn check_size(&self) -> Result<(), TransferError> {
        let trans = self.pip.transfer();
        if self.pip.ctx.rule.is_send
            || !self.negotiated.filesize
            || trans.step > TransferStep::Data
            || trans.filesize == UNKNOWN_SIZE
        {
            return Ok(());
        }
        let path = self.pip.local_path();
        let fs = self.pip.filesystem(&path)?;
        let info = fs.stat(&path).await.map_err(|err| io_to_transfer_error(&err))?;
        let got = i64::try_from(info.size).unwrap_or(i64::MAX);
        if got != trans.filesize {
            return Err(TransferError::new(
                TransferErrorCode::BadSize,
                format!("incorrect file size (expected {}, got {got})", trans.filesize),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TransferHandler for ServerTransfer {
    async fn update_transfer_info(&mut self, info: &UpdateInfo) -> Result<(), TransferError> {
        apply_update_info(&mut self.pip, info)
    }

    async fn run_pre_task(&mut self) -> Result<Option<UpdateInfo>, TransferError> {
        self.pip.pre_tasks().await?;
        if !self.pip.ctx.rule.is_send {
            return Ok(None);
        }
        let trans = self.pip.transfer();
        Ok(Some(UpdateInfo {
            filename: trans.remote_path.trim_start_matches('/').to_string(),
            filesize: trans.filesize,
            user_content: make_user_content(&trans.transfer_info),
        }))
    }

    async fn get_stream(&mut self) -> Result<(), TransferError> {
        self.pip.start_data().await
    }

    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        self.pip.read(buf).await
    }

    async fn write_data(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.pip.write(data).await
    }

    fn block_hash(&self, data: &[u8]) -> Vec<u8> {
        self.negotiated.digest.unwrap_or_default().hash_bytes(data)
    }

    async fn valid_end_transfer(&mut self, hash: Option<&[u8]>) -> Result<Option<Vec<u8>>, TransferError> {
        self.pip.end_data().await?;
        self.check_size().await?;
        let Some(digest) = self.negotiated.digest else {
            return Ok(None);
        };
        let local = local_file_hash(&self.pip, digest).await?;
        if self.pip.ctx.rule.is_send {
            return Ok(Some(local));
        }
        let valid = match hash {
            Some(hash) => bool::from(hash.ct_eq(&local)),
            None => self.pip.transfer().filesize == 0,
        };
        if !valid {
            tracing::error!("final hash of transfer {} does not match", self.pip.transfer().id);
            return Err(TransferError::new(TransferErrorCode::Integrity, "invalid file hash"));
        }
        Ok(None)
    }

    async fn run_post_task(&mut self) -> Result<(), TransferError> {
        self.pip.post_tasks().await
    }

    async fn valid_end_request(&mut self) -> Result<(), TransferError> {
        self.pip.end_transfer().await
    }

    async fn run_error_tasks(&mut self, err: &TransferError) {
        self.pip.set_error(err).await;
    }

    async fn on_remote_error(&mut self, err: &WireError) {
        if let Some(err) = from_wire(err, &mut self.pip).await {
            self.pip.set_error(&err).await;
        }
    }

    fn signal(&self) -> Signal {
        self.pip.signal().clone()
    }

    async fn halt(&mut self, cause: Cause) {
        if let Err(err) = self.pip.halt(cause).await {
            tracing::error!("failed to interrupt transfer {}: {err}", self.pip.transfer().id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Gateway;
    use common::config::PathsConfig;
    use common::model::{LocalAccount, LocalAgent, Rule, Transfer, TransferStatus};
    use common::pipeline::TransferContext;
    use common::store::{MemoryStore, Store};
    use std::sync::Arc;

    use crate::hash::HashAlgo;
    use crate::protocol::WireErrorCode;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: Arc<MemoryStore>,
        gateway: Gateway,
        agent: LocalAgent,
        account: LocalAccount,
        recv_rule: Rule,
        send_rule: Rule,
    }

    fn fixture() -> Fixture {
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
        Fixture {
            _tmp: tmp,
            store,
            gateway,
            agent,
            account,
            recv_rule,
            send_rule,
        }
    }

    impl Fixture {
        fn transfer(&self, remote_id: &str, is_send: bool, digest: Option<HashAlgo>) -> ServerTransfer {
            let rule = if is_send { &self.send_rule } else { &self.recv_rule };
            let mut trans = Transfer::new_server(remote_id.into(), rule.id, self.account.id);
            if is_send {
                trans.src_filename = format!("{remote_id}.txt");
            } else {
                trans.dest_filename = format!("{remote_id}.txt");
            }
            let ctx = TransferContext::server(trans, rule.clone(), self.agent.clone(), self.account.clone());
            let pip = Pipeline::new_server(&self.gateway, ctx).unwrap();
            ServerTransfer::new(pip, Negotiated { filesize: true, digest })
        }

        /// A receive transfer declared as `filesize` bytes that got `data`.
        async fn received(
            &self,
            remote_id: &str,
            filesize: i64,
            data: &[u8],
            digest: Option<HashAlgo>,
        ) -> ServerTransfer {
            let mut transfer = self.transfer(remote_id, false, digest);
            transfer.pip.ctx.transfer.filesize = filesize;
            assert_eq!(transfer.run_pre_task().await.unwrap(), None);
            transfer.get_stream().await.unwrap();
            if !data.is_empty() {
                transfer.write_data(data).await.unwrap();
            }
            transfer
        }
    }

    #[tokio::test]
    async fn matching_final_hash_is_accepted() {
        let fx = fixture();
        let data = b"hello world!";
        let mut transfer = fx.received("1", 12, data, Some(HashAlgo::Sha256)).await;
        let hash = HashAlgo::Sha256.hash_bytes(data);
        assert_eq!(transfer.valid_end_transfer(Some(&hash)).await.unwrap(), None);
        transfer.run_post_task().await.unwrap();
        transfer.valid_end_request().await.unwrap();
        let id = transfer.pip.transfer().id;
        assert_eq!(fx.store.history(id).unwrap().status, TransferStatus::Done);
    }

    #[tokio::test]
    async fn final_hash_mismatch_is_an_integrity_error() {
        let fx = fixture();
        let mut transfer = fx.received("1", 12, b"hello world!", Some(HashAlgo::Sha256)).await;
        let hash = HashAlgo::Sha256.hash_bytes(b"hello w0rld!");
        let err = transfer.valid_end_transfer(Some(&hash)).await.unwrap_err();
        assert_eq!(err.code, TransferErrorCode::Integrity);
    }

    #[tokio::test]
    async fn hash_of_another_algorithm_is_refused() {
        let fx = fixture();
        let data = b"hello world!";
        let mut transfer = fx.received("1", 12, data, Some(HashAlgo::Sha512)).await;
        let hash = HashAlgo::Sha256.hash_bytes(data);
        let err = transfer.valid_end_transfer(Some(&hash)).await.unwrap_err();
        assert_eq!(err.code, TransferErrorCode::Integrity);
    }

    #[tokio::test]
    async fn empty_file_needs_no_hash() {
        let fx = fixture();
        let mut transfer = fx.received("1", 0, b"", Some(HashAlgo::Sha256)).await;
        assert_eq!(transfer.valid_end_transfer(None).await.unwrap(), None);

        let mut transfer = fx.received("2", 4, b"data", Some(HashAlgo::Sha256)).await;
        let err = transfer.valid_end_transfer(None).await.unwrap_err();
        assert_eq!(err.code, TransferErrorCode::Integrity);
    }

    #[tokio::test]
    async fn size_mismatch_is_refused() {
        let fx = fixture();
        let mut transfer = fx.received("1", 10, b"data", None).await;
        let err = transfer.valid_end_transfer(None).await.unwrap_err();
        assert_eq!(err.code, TransferErrorCode::BadSize);
        assert!(err.details.contains("expected 10, got 4"), "{}", err.details);

        let mut unchecked = fx.transfer("2", false, None);
        unchecked.negotiated.filesize = false;
        unchecked.pip.ctx.transfer.filesize = 10;
        unchecked.get_stream().await.unwrap();
        unchecked.write_data(b"data").await.unwrap();
        assert_eq!(unchecked.valid_end_transfer(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn remote_cancel_mid_data_archives_the_transfer() {
        let fx = fixture();
        let mut transfer = fx.received("1", 12, b"hello ", None).await;
        let id = transfer.pip.transfer().id;
        let cancel = WireError::new(WireErrorCode::CanceledTransfer, "transfer cancelled by user");
        transfer.on_remote_error(&cancel).await;
        let hist = fx.store.history(id).unwrap();
        assert_eq!(hist.status, TransferStatus::Cancelled);
        assert_eq!(hist.progress, 6);
        assert!(fx.store.transfer(id).is_err());
    }

    #[tokio::test]
    async fn remote_stop_mid_data_pauses_the_transfer() {
        let fx = fixture();
        let mut transfer = fx.received("1", 12, b"hello ", None).await;
        let id = transfer.pip.transfer().id;
        let stop = WireError::new(WireErrorCode::StoppedTransfer, "transfer paused by user");
        transfer.on_remote_error(&stop).await;
        let trans = fx.store.transfer(id).unwrap();
        assert_eq!(trans.status, TransferStatus::Paused);
        assert_eq!(trans.error_code, TransferErrorCode::Ok);

        let mut transfer = fx.received("2", 12, b"hello ", None).await;
        let id = transfer.pip.transfer().id;
        let gone = WireError::disconnection("connection lost");
        transfer.on_remote_error(&gone).await;
        let trans = fx.store.transfer(id).unwrap();
        assert_eq!(trans.status, TransferStatus::Error);
        assert_eq!(trans.error_code, TransferErrorCode::ConnectionReset);
    }

    #[tokio::test]
    async fn sent_file_hash_is_returned() {
        let fx = fixture();
        let content = b"content of the sent file";
        let mut transfer = fx.transfer("1", true, Some(HashAlgo::Sha512));
        let source = transfer.pip.local_path();
        let parent = std::path::Path::new(&source.path).parent().unwrap();
        std::fs::create_dir_all(parent).unwrap();
        std::fs::write(&source.path, content).unwrap();

        let info = transfer.run_pre_task().await.unwrap().unwrap();
        assert_eq!(info.filename, "1.txt");
        transfer.get_stream().await.unwrap();
        let mut sent = Vec::new();
        let mut buf = [0; 8];
        loop {
            let n = transfer.read_data(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            sent.extend_from_slice(&buf[..n]);
        }
        assert_eq!(sent, content);
        let hash = transfer.valid_end_transfer(None).await.unwrap();
        assert_eq!(hash, Some(HashAlgo::Sha512.hash_bytes(content)));
    }
}
