//! End-to-end R66 transfers between a server and a client over loopback.
//!
//! Both sides run in this process but keep their own store and directories,
//! as two gateways would.

use common::config::PathsConfig;
use async_trait::async_trait;
use common::model::{
    Client, Credential, CredentialType, LocalAccount, LocalAgent, Owner, RemoteAccount, RemoteAgent, Rule, Task,
    TaskChain, Transfer, TransferStatus,
};
use common::pipeline::{Pipeline, TaskRunner, TransferContext, TransferRegistry};
use common::secrets::fast_hash;
use common::service::{Service, StateCode};
use common::store::{MemoryStore, Store};
use common::{Gateway, TransferError, TransferErrorCode};
use r66::hash::crypt_pass;
use r66::protocol::packet::FileInfoRequest;
use r66::tls::LegacyCertCompat;
use r66::{Module, R66Client, R66Module, R66Server, R66TlsModule};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const CONTENT: &[u8] = b"hello world\n";

struct Side {
    tmp: tempfile::TempDir,
    store: Arc<MemoryStore>,
    gateway: Gateway,
}

impl Side {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let paths = PathsConfig {
            gateway_home: tmp.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let gateway = Gateway::new(store.clone()).with_paths(paths);
        Self { tmp, store, gateway }
    }

    fn path(&self, dir: &str, name: &str) -> PathBuf {
        self.tmp.path().join(dir).join(name)
    }

    fn put(&self, dir: &str, name: &str, content: &[u8]) {
        let path = self.path(dir, name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn cred(&self, owner: Owner, kind: CredentialType, value: &str, value2: &str) {
        self.store.add_credential(Credential {
            id: 0,
            owner,
            name: kind.to_string(),
            kind,
            value: value.to_string(),
            value2: value2.to_string(),
        });
    }

    fn rule(&self, name: &str, is_send: bool) -> Rule {
        let mut rule = Rule {
            name: name.into(),
            is_send,
            ..Default::default()
        };
        rule.id = self.store.add_rule(rule.clone());
        rule
    }
}

fn module(tls: bool) -> Box<dyn Module> {
    if tls {
        Box::new(R66TlsModule::new(LegacyCertCompat::disabled()))
    } else {
        Box::new(R66Module::new(LegacyCertCompat::disabled()))
    }
}

fn self_signed(cn: &str) -> (String, String) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    params.distinguished_name.push(rcgen::DnType::CommonName, cn);
    let cert = params.self_signed(&key_pair).unwrap();
    (cert.pem(), key_pair.serialize_pem())
}

struct ServerSide {
    side: Side,
    server: R66Server,
    addr: SocketAddr,
}

/// A started server with a `toto` account and the `push` / `pull` rules.
async fn server_side(proto_config: serde_json::Value, identity: Option<&(String, String)>) -> ServerSide {
    let side = Side::new();
    let tls = identity.is_some();
    let mut agent = LocalAgent {
        name: "r66_server".into(),
        protocol: module(tls).protocol().into(),
        address: "127.0.0.1:0".into(),
        proto_config: proto_config.as_object().unwrap().clone(),
        ..Default::default()
    };
    agent.id = side.store.add_local_agent(agent.clone());
    let mut account = LocalAccount {
        local_agent_id: agent.id,
        login: "toto".into(),
        ..Default::default()
    };
    account.id = side.store.add_local_account(account.clone());
    side.cred(
        Owner::LocalAccount(account.id),
        CredentialType::PasswordHash,
        &fast_hash(&crypt_pass("sesame")),
        "",
    );
    if let Some((cert, key)) = identity {
        side.cred(Owner::LocalAgent(agent.id), CredentialType::TlsCertificate, cert, key);
    }
    side.rule("push", false);
    side.rule("pull", true);

    let server = module(tls).make_server(&side.gateway, &agent);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    ServerSide { side, server, addr }
}

fn default_server_config() -> serde_json::Value {
    serde_json::json!({"serverPassword": "server_pwd"})
}

struct ClientSide {
    side: Side,
    client: R66Client,
    record: Client,
    partner: RemoteAgent,
    account: RemoteAccount,
    push: Rule,
    pull: Rule,
}

/// A started client knowing the server at `addr` as `r66_server`.
async fn client_side(addr: SocketAddr, password: &str, server_cert: Option<&str>) -> ClientSide {
    client_side_with(addr, password, server_cert, serde_json::json!({})).await
}

async fn client_side_with(
    addr: SocketAddr,
    password: &str,
    server_cert: Option<&str>,
    proto_config: serde_json::Value,
) -> ClientSide {
    let side = Side::new();
    let tls = server_cert.is_some();
    let protocol = module(tls).protocol();
    let mut record = Client {
        name: "r66_client".into(),
        protocol: protocol.into(),
        proto_config: proto_config.as_object().unwrap().clone(),
        ..Default::default()
    };
    record.id = side.store.add_client(record.clone());
    let mut partner = RemoteAgent {
        name: "r66_server".into(),
        protocol: protocol.into(),
        address: addr.to_string(),
        ..Default::default()
    };
    partner.id = side.store.add_remote_agent(partner.clone());
    side.cred(Owner::RemoteAgent(partner.id), CredentialType::Password, "server_pwd", "");
    if let Some(cert) = server_cert {
        side.cred(Owner::RemoteAgent(partner.id), CredentialType::TrustedTlsCertificate, cert, "");
    }
    let mut account = RemoteAccount {
        remote_agent_id: partner.id,
        login: "toto".into(),
        ..Default::default()
    };
    account.id = side.store.add_remote_account(account.clone());
    side.cred(Owner::RemoteAccount(account.id), CredentialType::Password, password, "");
    let push = side.rule("push", true);
    let pull = side.rule("pull", false);

    let client = module(tls).make_client(&side.gateway, &record);
    client.start().await.unwrap();
    ClientSide {
        side,
        client,
        record,
        partner,
        account,
        push,
        pull,
    }
}

impl ClientSide {
    async fn run(&self, rule: &Rule, file: &str) -> (i64, Result<(), TransferError>) {
        let trans = Transfer::new_client(self.record.id, rule.id, self.account.id, file, file);
        self.run_attempt(rule, trans).await
    }

    async fn run_attempt(&self, rule: &Rule, trans: Transfer) -> (i64, Result<(), TransferError>) {
        let ctx = TransferContext::client(
            trans,
            rule.clone(),
            self.record.clone(),
            self.partner.clone(),
            self.account.clone(),
        );
        let mut pip = Pipeline::new_client(&self.side.gateway, ctx).unwrap();
        let id = pip.transfer().id;
        let res = self.client.run_transfer(&mut pip).await;
        (id, res)
    }
}

async fn eventually_exists(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{path:?} never appeared");
}

async fn shutdown(server: &ServerSide, client: &ClientSide) {
    client.client.stop(Duration::from_secs(1)).await.unwrap();
    server.server.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(server.server.state().0, StateCode::Offline);
}

/// Pauses the transfer from its first pre-task, once.
struct PauseOnce {
    registry: Arc<TransferRegistry>,
    fired: AtomicBool,
}

#[async_trait]
impl TaskRunner for PauseOnce {
    async fn run(&self, _chain: TaskChain, _tasks: &[Task], ctx: &TransferContext) -> Result<(), TransferError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            assert!(self.registry.pause(ctx.transfer.id));
        }
        Ok(())
    }
}

fn install_crypto_provider() {
    rustls::crypto::ring::default_provider().install_default().ok();
}

#[tokio::test]
async fn push_with_final_hash() {
    let server = server_side(default_server_config(), None).await;
    let client = client_side(server.addr, "sesame", None).await;
    client.side.put("out", "file.txt", CONTENT);

    let (id, res) = client.run(&client.push, "file.txt").await;
    res.unwrap();

    let received = server.side.path("in", "file.txt");
    eventually_exists(&received).await;
    assert_eq!(std::fs::read(&received).unwrap(), CONTENT);
    assert!(!server.side.path("in", "file.txt.part").exists());

    let entry = client.side.store.history(id).unwrap();
    assert_eq!(entry.status, TransferStatus::Done);
    assert_eq!(entry.filesize, CONTENT.len() as i64);
    assert_eq!(entry.progress, CONTENT.len() as i64);
    assert_eq!(entry.protocol, "r66");
    assert!(client.side.store.transfer(id).is_err());
    shutdown(&server, &client).await;
}

#[tokio::test]
async fn pull_with_block_hashes() {
    let server = server_side(default_server_config(), None).await;
    let client = client_side_with(
        server.addr,
        "sesame",
        None,
        serde_json::json!({"blockSize": 1024, "checkBlockHash": true, "finalHashAlgo": "SHA-512"}),
    )
    .await;
    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    server.side.put("out", "report.csv", &content);

    let (id, res) = client.run(&client.pull, "report.csv").await;
    res.unwrap();

    assert_eq!(std::fs::read(client.side.path("in", "report.csv")).unwrap(), content);
    let entry = client.side.store.history(id).unwrap();
    assert_eq!(entry.status, TransferStatus::Done);
    assert_eq!(entry.filesize, content.len() as i64);
    shutdown(&server, &client).await;
}

#[tokio::test]
async fn paused_transfer_is_resumed() {
    let server = server_side(default_server_config(), None).await;
    let mut client = client_side(server.addr, "sesame", None).await;
    let runner = PauseOnce {
        registry: Arc::clone(&client.side.gateway.registry),
        fired: AtomicBool::new(false),
    };
    client.side.gateway = client.side.gateway.clone().with_tasks(Arc::new(runner));
    let mut rule = Rule {
        name: "push".into(),
        is_send: true,
        tasks: vec![Task {
            chain: TaskChain::Pre,
            kind: "pause".into(),
            args: Default::default(),
        }],
        ..Default::default()
    };
    rule.id = client.side.store.add_rule(rule.clone());
    client.side.put("out", "file.txt", CONTENT);

    let (id, res) = client.run(&rule, "file.txt").await;
    assert_eq!(res.unwrap_err().code, TransferErrorCode::Stopped);
    let paused = client.side.store.transfer(id).unwrap();
    assert_eq!(paused.status, TransferStatus::Paused);

    // the server pauses its side when told, then releases it
    let mut server_trans = None;
    for _ in 0..100 {
        let found = server.side.store.transfers().unwrap().into_iter().next();
        match found {
            Some(trans)
                if trans.status == TransferStatus::Paused && !server.side.gateway.registry.is_running(trans.id) =>
            {
                server_trans = Some(trans);
                break;
            }
            _ => {}
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let server_trans = server_trans.expect("the server never paused its transfer");
    assert_eq!(server_trans.remote_transfer_id, id.to_string());

    let (resumed_id, res) = client.run_attempt(&rule, paused).await;
    res.unwrap();
    assert_eq!(resumed_id, id);
    assert_eq!(client.side.store.history(id).unwrap().status, TransferStatus::Done);

    let received = server.side.path("in", "file.txt");
    eventually_exists(&received).await;
    assert_eq!(std::fs::read(&received).unwrap(), CONTENT);
    for _ in 0..100 {
        if server.side.store.transfers().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let hist = server
        .side
        .store
        .server_history(&id.to_string(), "toto", "r66_server")
        .unwrap();
    assert_eq!(hist.id, server_trans.id);
    assert_eq!(hist.status, TransferStatus::Done);
    shutdown(&server, &client).await;
}

#[tokio::test]
async fn block_size_mismatch_is_refused() {
    let server = server_side(
        serde_json::json!({"serverPassword": "server_pwd", "blockSize": 512}),
        None,
    )
    .await;
    let client = client_side(server.addr, "sesame", None).await;
    client.side.put("out", "file.txt", CONTENT);

    let (id, res) = client.run(&client.push, "file.txt").await;
    let err = res.unwrap_err();
    assert_eq!(err.code, TransferErrorCode::Unimplemented);

    let trans = client.side.store.transfer(id).unwrap();
    assert_eq!(trans.status, TransferStatus::Error);
    assert_eq!(trans.error_code, TransferErrorCode::Unimplemented);
    assert!(!server.side.path("in", "file.txt").exists());
    shutdown(&server, &client).await;
}

#[tokio::test]
async fn wrong_password_fails_closed() {
    let server = server_side(default_server_config(), None).await;
    let client = client_side(server.addr, "not sesame", None).await;
    client.side.put("out", "file.txt", CONTENT);

    let (id, res) = client.run(&client.push, "file.txt").await;
    assert_eq!(res.unwrap_err().code, TransferErrorCode::BadAuthentication);
    let trans = client.side.store.transfer(id).unwrap();
    assert_eq!(trans.status, TransferStatus::Error);
    assert_eq!(trans.error_code, TransferErrorCode::BadAuthentication);
    assert!(server.side.store.transfers().unwrap().is_empty());
    shutdown(&server, &client).await;
}

#[tokio::test]
async fn unreachable_partner() {
    let server = server_side(default_server_config(), None).await;
    let addr = server.addr;
    server.server.stop(Duration::from_secs(1)).await.unwrap();

    let client = client_side(addr, "sesame", None).await;
    client.side.put("out", "file.txt", CONTENT);
    let (_, res) = client.run(&client.push, "file.txt").await;
    assert_eq!(res.unwrap_err().code, TransferErrorCode::Connection);
    client.client.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn borrowed_sessions_share_the_connection() {
    let server = server_side(default_server_config(), None).await;
    let client = client_side(server.addr, "sesame", None).await;
    server.side.put("out", "a.csv", b"a");
    server.side.put("out", "b.csv", b"bb");
    server.side.put("out", "c.txt", b"ccc");

    let (first, second) = tokio::join!(
        client.client.get_connection(&client.partner, &client.account),
        client.client.get_connection(&client.partner, &client.account),
    );
    let mut first = first.unwrap();
    let second = second.unwrap();
    assert_ne!(first.id(), second.id());

    let reply = first
        .file_info(FileInfoRequest {
            rule: "pull".into(),
            pattern: "*.csv".into(),
        })
        .await
        .unwrap();
    let names: Vec<_> = reply.files.iter().map(|f| (f.name.as_str(), f.size)).collect();
    assert_eq!(names, [("a.csv", 1), ("b.csv", 2)]);

    client.client.return_connection(first).await;
    client.client.return_connection(second).await;
    shutdown(&server, &client).await;
}

#[tokio::test]
async fn push_over_tls() {
    install_crypto_provider();
    let identity = self_signed("r66_server");
    let server = server_side(default_server_config(), Some(&identity)).await;
    let client = client_side(server.addr, "sesame", Some(&identity.0)).await;
    client.side.put("out", "file.txt", CONTENT);

    let (id, res) = client.run(&client.push, "file.txt").await;
    res.unwrap();

    let received = server.side.path("in", "file.txt");
    eventually_exists(&received).await;
    assert_eq!(std::fs::read(&received).unwrap(), CONTENT);
    let entry = client.side.store.history(id).unwrap();
    assert_eq!(entry.status, TransferStatus::Done);
    assert_eq!(entry.protocol, "r66-tls");
    shutdown(&server, &client).await;
}

#[tokio::test]
async fn untrusted_server_certificate_is_refused() {
    install_crypto_provider();
    let identity = self_signed("r66_server");
    let (other, _) = self_signed("impostor");
    let server = server_side(default_server_config(), Some(&identity)).await;
    let client = client_side(server.addr, "sesame", Some(&other)).await;
    client.side.put("out", "file.txt", CONTENT);

    let (_, res) = client.run(&client.push, "file.txt").await;
    assert!(res.is_err());
    assert!(!server.side.path("in", "file.txt").exists());
    shutdown(&server, &client).await;
}
