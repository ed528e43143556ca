use serde::{Deserialize, Serialize};

use super::WireError;

/// Authentication exchange, sent by the requester and echoed by the responder
/// with its own identity and the negotiated options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authent {
    pub login: String,
    /// Hex SHA-256 of the password, see [`crate::hash::crypt_pass`].
    pub password: String,
    /// Whether file sizes are declared and checked.
    pub filesize: bool,
    /// Whether a final hash of the whole file is exchanged.
    pub final_hash: bool,
    /// Digest algorithm of the final hash, e.g. `SHA-256`.
    pub digest: String,
}

/// A transfer request. The responder echoes it back once validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Requester-assigned transfer id.
    pub id: i64,
    pub filepath: String,
    /// `-1` when unknown.
    pub filesize: i64,
    pub rule: String,
    pub block: u32,
    /// Index of the first block to transfer.
    pub rank: u32,
    /// `true` when the requester receives the file.
    pub is_recv: bool,
    /// `true` when every data block carries its own hash.
    pub is_md5: bool,
    /// Transfer info, usually a JSON object.
    pub infos: String,
}

/// File metadata exchanged once the pre-tasks are done.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub filename: String,
    pub filesize: i64,
    pub user_content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfoRequest {
    pub rule: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// RFC 3339, empty when unknown.
    pub modified: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfoReply {
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfoRequest {
    pub id: i64,
    /// `true` when the id was assigned by the requester.
    pub is_client: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfoReply {
    pub id: i64,
    pub client: String,
    pub server: String,
    pub file: String,
    pub rule: String,
    pub is_recv: bool,
    /// Whether blocks carry a hash; unknown (`false`) for finished transfers.
    pub is_md5: bool,
    /// `0` when unknown or chosen by the requester.
    pub block_size: u32,
    pub status: String,
    pub step: String,
    pub progress: i64,
    pub user_content: String,
    /// RFC 3339.
    pub start: String,
    /// RFC 3339, empty while running.
    pub stop: String,
}

/// Every message of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Authent(Authent),
    AuthentReply(Authent),
    Request(Request),
    RequestReply(Request),
    EndPreTasks { info: Option<UpdateInfo> },
    PreTasksOk { info: Option<UpdateInfo> },
    StartData,
    DataReady,
    Data {
        rank: u32,
        payload: Vec<u8>,
        hash: Option<Vec<u8>>,
    },
    EndTransfer { hash: Option<Vec<u8>> },
    EndTransferOk { hash: Option<Vec<u8>> },
    EndRequest,
    EndRequestOk,
    FileInfo(FileInfoRequest),
    FileInfoReply(FileInfoReply),
    TransferInfo(TransferInfoRequest),
    TransferInfoReply(TransferInfoReply),
    Error(WireError),
    Close,
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authent(_) => "Authent",
            Self::AuthentReply(_) => "AuthentReply",
            Self::Request(_) => "Request",
            Self::RequestReply(_) => "RequestReply",
            Self::EndPreTasks { .. } => "EndPreTasks",
            Self::PreTasksOk { .. } => "PreTasksOk",
            Self::StartData => "StartData",
            Self::DataReady => "DataReady",
            Self::Data { .. } => "Data",
            Self::EndTransfer { .. } => "EndTransfer",
            Self::EndTransferOk { .. } => "EndTransferOk",
            Self::EndRequest => "EndRequest",
            Self::EndRequestOk => "EndRequestOk",
            Self::FileInfo(_) => "FileInfo",
            Self::FileInfoReply(_) => "FileInfoReply",
            Self::TransferInfo(_) => "TransferInfo",
            Self::TransferInfoReply(_) => "TransferInfoReply",
            Self::Error(_) => "Error",
            Self::Close => "Close",
        }
    }
}
