//! A small R66 session library.
//!
//! Packets ([`packet`]) are length-delimited frames ([`framing`]) tagged with a
//! session id, so several logical sessions share one TCP/TLS connection
//! ([`connection`]). [`client::ClientSession`] drives the requester side of one
//! session; [`server::serve`] drives the responder side through the
//! [`server::AuthHandler`] / [`server::SessionHandler`] /
//! [`server::TransferHandler`] capabilities.

pub mod client;
pub mod connection;
pub mod framing;
pub mod packet;
pub mod server;

use serde::{Deserialize, Serialize};

pub use client::ClientSession;
pub use connection::{Connection, PeerInfo, Session};
pub use packet::{
    Authent, FileEntry, FileInfoReply, FileInfoRequest, Packet, Request, TransferInfoReply,
    TransferInfoRequest, UpdateInfo,
};

/// Error codes of the R66 protocol, with their one-character wire form.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum WireErrorCode {
    InitOk,
    PreProcessingOk,
    TransferOk,
    PostProcessingOk,
    CompleteOk,
    ConnectionImpossible,
    ServerOverloaded,
    BadAuthent,
    ExternalOperation,
    TransferError,
    MD5Error,
    Disconnection,
    RemoteShutdown,
    FinalOp,
    Unimplemented,
    Shutdown,
    RemoteError,
    Internal,
    StoppedTransfer,
    CanceledTransfer,
    Warning,
    Unknown,
    QueryAlreadyFinished,
    QueryStillRunning,
    NotKnownHost,
    QueryRemotelyUnknown,
    FileNotFound,
    CommandNotFound,
    PassThroughMode,
    Running,
    IncorrectCommand,
    FileNotAllowed,
    SizeNotAllowed,
}

impl WireErrorCode {
    pub fn as_char(self) -> char {
        match self {
            Self::InitOk => 'i',
            Self::PreProcessingOk => 'B',
            Self::TransferOk => 'X',
            Self::PostProcessingOk => 'P',
            Self::CompleteOk => 'O',
            Self::ConnectionImpossible => 'C',
            Self::ServerOverloaded => 'l',
            Self::BadAuthent => 'A',
            Self::ExternalOperation => 'E',
            Self::TransferError => 'T',
            Self::MD5Error => 'M',
            Self::Disconnection => 'D',
            Self::RemoteShutdown => 'r',
            Self::FinalOp => 'F',
            Self::Unimplemented => 'U',
            Self::Shutdown => 'S',
            Self::RemoteError => 'R',
            Self::Internal => 'I',
            Self::StoppedTransfer => 'H',
            Self::CanceledTransfer => 'K',
            Self::Warning => 'W',
            Self::Unknown => '-',
            Self::QueryAlreadyFinished => 'Q',
            Self::QueryStillRunning => 's',
            Self::NotKnownHost => 'N',
            Self::QueryRemotelyUnknown => 'u',
            Self::FileNotFound => 'f',
            Self::CommandNotFound => 'c',
            Self::PassThroughMode => 'p',
            Self::Running => 'z',
            Self::IncorrectCommand => 'n',
            Self::FileNotAllowed => 'a',
            Self::SizeNotAllowed => 'd',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        <Self as strum::IntoEnumIterator>::iter().find(|code| code.as_char() == c)
    }

    /// The codes a partner sends when a step went fine.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::InitOk
                | Self::PreProcessingOk
                | Self::TransferOk
                | Self::PostProcessingOk
                | Self::CompleteOk
        )
    }
}

/// An error as exchanged with the partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code} ({}): {message}", code.as_char())]
pub struct WireError {
    pub code: WireErrorCode,
    pub message: String,
}

impl WireError {
    pub fn new(code: WireErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(WireErrorCode::Internal, message)
    }

    pub fn disconnection(message: impl Into<String>) -> Self {
        Self::new(WireErrorCode::Disconnection, message)
    }

    pub fn incorrect_command(message: impl Into<String>) -> Self {
        Self::new(WireErrorCode::IncorrectCommand, message)
    }
}
