//! Gateway data model: agents, accounts, credentials, rules and transfers.

use serde::{Deserialize, Serialize};

/// Database identifier. `0` means "not persisted yet".
pub type Id = i64;

/// File size sentinel meaning "size not yet known".
pub const UNKNOWN_SIZE: i64 = -1;

/// Protocol-specific configuration, kept as raw JSON until a module parses it.
pub type ProtoConfig = serde_json::Map<String, serde_json::Value>;

/// Free-form transfer info attached to a transfer.
pub type TransferInfo = serde_json::Map<String, serde_json::Value>;

/// A local listening endpoint (server).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalAgent {
    pub id: Id,
    pub name: String,
    pub protocol: String,
    pub address: String,
    pub root_dir: String,
    pub receive_dir: String,
    pub send_dir: String,
    pub proto_config: ProtoConfig,
}

/// An account allowed to connect to a [`LocalAgent`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalAccount {
    pub id: Id,
    pub local_agent_id: Id,
    pub login: String,
    /// Source IP allow-list; empty means "any address".
    pub ip_addresses: Vec<ipnet::IpNet>,
}

impl LocalAccount {
    pub fn allows_ip(&self, ip: std::net::IpAddr) -> bool {
        self.ip_addresses.is_empty() || self.ip_addresses.iter().any(|net| net.contains(&ip))
    }
}

/// A remote partner this gateway connects to as a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteAgent {
    pub id: Id,
    pub name: String,
    pub protocol: String,
    pub address: String,
    pub proto_config: ProtoConfig,
}

/// Credentials used to log into a [`RemoteAgent`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteAccount {
    pub id: Id,
    pub remote_agent_id: Id,
    pub login: String,
}

/// An outbound connection profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Client {
    pub id: Id,
    pub name: String,
    pub protocol: String,
    pub local_address: Option<String>,
    pub proto_config: ProtoConfig,
    pub nb_of_attempts: u8,
    pub first_retry_delay: u32,
    pub retry_increment_factor: f32,
}

/// The object a credential (or a rule access) is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "id")]
pub enum Owner {
    LocalAgent(Id),
    LocalAccount(Id),
    RemoteAgent(Id),
    RemoteAccount(Id),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CredentialType {
    Password,
    PasswordHash,
    TlsCertificate,
    TrustedTlsCertificate,
    R66LegacyCertificate,
    SshPublicKey,
    SshPrivateKey,
}

/// A typed secret attached to an agent or an account.
///
/// For [`CredentialType::TlsCertificate`], `value` holds the PEM certificate
/// chain and `value2` the PEM private key (empty when only the certificate is
/// known, e.g. a client certificate registered on a local account).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(default)]
    pub id: Id,
    pub owner: Owner,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CredentialType,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub value2: String,
}

/// A globally trusted certification authority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Authority {
    pub id: Id,
    pub name: String,
    /// PEM encoded CA certificate.
    pub public_identity: String,
    /// Hosts this authority may vouch for; empty means any host.
    pub valid_hosts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
pub enum TaskChain {
    Pre,
    Post,
    Error,
}

/// One task of a rule's task chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub chain: TaskChain,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// A named transfer template. `is_send` is from this gateway's point of view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Rule {
    pub id: Id,
    pub name: String,
    pub is_send: bool,
    pub local_dir: String,
    pub remote_dir: String,
    pub tmp_local_rcv_dir: String,
    pub tasks: Vec<Task>,
}

impl Rule {
    pub fn direction(&self) -> &'static str {
        if self.is_send { "send" } else { "receive" }
    }

    pub fn chain(&self, chain: TaskChain) -> Vec<Task> {
        self.tasks.iter().filter(|t| t.chain == chain).cloned().collect()
    }
}

/// Grants an agent or account the right to use a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAccess {
    pub rule_id: Id,
    pub target: Owner,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
pub enum TransferStatus {
    #[default]
    Planned,
    Running,
    Paused,
    Interrupted,
    Error,
    Done,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// Ordered transfer steps; a transfer only ever moves forward through them.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
)]
pub enum TransferStep {
    #[default]
    None,
    Setup,
    PreTasks,
    Data,
    PostTasks,
    ErrorTasks,
    Finalization,
}

/// A persisted record of one file movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: Id,
    pub remote_transfer_id: String,
    pub rule_id: Id,
    pub is_server: bool,
    /// Set for server transfers.
    pub local_account_id: Option<Id>,
    /// Set for client transfers.
    pub remote_account_id: Option<Id>,
    pub client_id: Option<Id>,
    pub src_filename: String,
    pub dest_filename: String,
    pub local_path: String,
    pub remote_path: String,
    pub filesize: i64,
    pub progress: i64,
    pub start: chrono::DateTime<chrono::Utc>,
    pub step: TransferStep,
    pub status: TransferStatus,
    pub task_number: i8,
    pub error_code: crate::TransferErrorCode,
    pub error_details: String,
    pub transfer_info: TransferInfo,
}

impl Transfer {
    pub fn new_server(remote_transfer_id: String, rule_id: Id, account_id: Id) -> Self {
        Self {
            is_server: true,
            local_account_id: Some(account_id),
            ..Self::blank(remote_transfer_id, rule_id)
        }
    }

    pub fn new_client(client_id: Id, rule_id: Id, account_id: Id, src: &str, dest: &str) -> Self {
        Self {
            is_server: false,
            remote_account_id: Some(account_id),
            client_id: Some(client_id),
            src_filename: src.to_string(),
            dest_filename: dest.to_string(),
            ..Self::blank(String::new(), rule_id)
        }
    }

    fn blank(remote_transfer_id: String, rule_id: Id) -> Self {
        Self {
            id: 0,
            remote_transfer_id,
            rule_id,
            is_server: false,
            local_account_id: None,
            remote_account_id: None,
            client_id: None,
            src_filename: String::new(),
            dest_filename: String::new(),
            local_path: String::new(),
            remote_path: String::new(),
            filesize: UNKNOWN_SIZE,
            progress: 0,
            start: chrono::Utc::now(),
            step: TransferStep::None,
            status: TransferStatus::Planned,
            task_number: 0,
            error_code: crate::TransferErrorCode::Ok,
            error_details: String::new(),
            transfer_info: TransferInfo::new(),
        }
    }

    pub fn error(&self) -> Option<crate::TransferError> {
        if self.error_code == crate::TransferErrorCode::Ok {
            None
        } else {
            Some(crate::TransferError::new(self.error_code, self.error_details.clone()))
        }
    }
}

/// An archived, immutable transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Id,
    pub remote_transfer_id: String,
    pub is_server: bool,
    pub is_send: bool,
    pub rule: String,
    pub account: String,
    pub agent: String,
    pub protocol: String,
    pub src_filename: String,
    pub dest_filename: String,
    pub local_path: String,
    pub remote_path: String,
    pub filesize: i64,
    pub start: chrono::DateTime<chrono::Utc>,
    pub stop: chrono::DateTime<chrono::Utc>,
    pub status: TransferStatus,
    pub step: TransferStep,
    pub progress: i64,
    pub error_code: crate::TransferErrorCode,
    pub error_details: String,
    pub transfer_info: TransferInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_allow_list() {
        let mut acc = LocalAccount {
            login: "foo".to_string(),
            ..Default::default()
        };
        let ip: std::net::IpAddr = "10.1.2.3".parse().unwrap();
        assert!(acc.allows_ip(ip));
        acc.ip_addresses = vec!["192.168.0.0/16".parse().unwrap()];
        assert!(!acc.allows_ip(ip));
        acc.ip_addresses.push("10.0.0.0/8".parse().unwrap());
        assert!(acc.allows_ip(ip));
    }

    #[test]
    fn steps_are_ordered() {
        assert!(TransferStep::Data > TransferStep::PreTasks);
        assert!(TransferStep::PostTasks > TransferStep::Data);
        assert!(TransferStep::Setup > TransferStep::None);
    }

    #[test]
    fn credential_type_names() {
        assert_eq!(CredentialType::TrustedTlsCertificate.to_string(), "trusted_tls_certificate");
        let parsed: CredentialType = "r66_legacy_certificate".parse().unwrap();
        assert_eq!(parsed, CredentialType::R66LegacyCertificate);
    }

    #[test]
    fn credential_from_json() {
        let cred: Credential = serde_json::from_str(
            r#"{"owner": {"type": "localAccount", "id": 3}, "type": "password_hash", "value": "$FAST$x"}"#,
        )
        .unwrap();
        assert_eq!(cred.owner, Owner::LocalAccount(3));
        assert_eq!(cred.kind, CredentialType::PasswordHash);
    }
}
