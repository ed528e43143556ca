//! Requester side of a session.

use super::connection::Session;
use super::packet::{
    Authent, FileInfoReply, FileInfoRequest, Packet, Request, TransferInfoReply,
    TransferInfoRequest, UpdateInfo,
};
use super::{WireError, WireErrorCode};

/// A data block or the end of the data phase, as seen by a receiving requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Data {
        rank: u32,
        payload: Vec<u8>,
        hash: Option<Vec<u8>>,
    },
    End { hash: Option<Vec<u8>> },
}

#[derive(Debug)]
pub struct ClientSession {
    session: Session,
}

fn unexpected(expected: &str, got: &Packet) -> WireError {
    WireError::incorrect_command(format!("expected {expected}, received {}", got.name()))
}

impl ClientSession {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn id(&self) -> u32 {
        self.session.id()
    }

    /// Receives the next packet, turning a partner error into `Err`.
    async fn recv(&mut self) -> Result<Packet, WireError> {
        match self.session.recv().await? {
            Packet::Error(err) => Err(err),
            packet => Ok(packet),
        }
    }

    async fn send(&self, packet: Packet) -> Result<(), WireError> {
        self.session.send(packet).await
    }

    pub async fn authent(&mut self, auth: Authent) -> Result<Authent, WireError> {
        self.send(Packet::Authent(auth)).await?;
        match self.recv().await? {
            Packet::AuthentReply(reply) => Ok(reply),
            other => Err(unexpected("AuthentReply", &other)),
        }
    }

    pub async fn request(&mut self, req: Request) -> Result<Request, WireError> {
        self.send(Packet::Request(req)).await?;
        match self.recv().await? {
            Packet::RequestReply(reply) => Ok(reply),
            other => Err(unexpected("RequestReply", &other)),
        }
    }

    /// Tells the partner our pre-tasks are done; returns its file metadata, if any.
    pub async fn end_pre_tasks(&mut self, info: Option<UpdateInfo>) -> Result<Option<UpdateInfo>, WireError> {
        self.send(Packet::EndPreTasks { info }).await?;
        match self.recv().await? {
            Packet::PreTasksOk { info } => Ok(info),
            other => Err(unexpected("PreTasksOk", &other)),
        }
    }

    pub async fn start_data(&mut self) -> Result<(), WireError> {
        self.send(Packet::StartData).await?;
        match self.recv().await? {
            Packet::DataReady => Ok(()),
            other => Err(unexpected("DataReady", &other)),
        }
    }

    pub async fn send_data(&self, rank: u32, payload: Vec<u8>, hash: Option<Vec<u8>>) -> Result<(), WireError> {
        self.send(Packet::Data { rank, payload, hash }).await
    }

    pub async fn recv_data(&mut self) -> Result<Incoming, WireError> {
        match self.recv().await? {
            Packet::Data { rank, payload, hash } => Ok(Incoming::Data { rank, payload, hash }),
            Packet::EndTransfer { hash } => Ok(Incoming::End { hash }),
            other => Err(unexpected("Data", &other)),
        }
    }

    /// Ends the data phase of a push.
    pub async fn end_transfer(&mut self, hash: Option<Vec<u8>>) -> Result<(), WireError> {
        self.send(Packet::EndTransfer { hash }).await?;
        match self.recv().await? {
            Packet::EndTransferOk { .. } => Ok(()),
            other => Err(unexpected("EndTransferOk", &other)),
        }
    }

    /// Acknowledges the end of the data phase of a pull.
    pub async fn end_transfer_ok(&self) -> Result<(), WireError> {
        self.send(Packet::EndTransferOk { hash: None }).await
    }

    pub async fn end_request(&mut self) -> Result<(), WireError> {
        self.send(Packet::EndRequest).await?;
        match self.recv().await? {
            Packet::EndRequestOk => Ok(()),
            other => Err(unexpected("EndRequestOk", &other)),
        }
    }

    pub async fn send_error(&self, err: WireError) -> Result<(), WireError> {
        self.send(Packet::Error(err)).await
    }

    /// Asks the partner to pause the transfer.
    pub async fn stop(&self) -> Result<(), WireError> {
        self.send_error(WireError::new(WireErrorCode::StoppedTransfer, "transfer paused by user"))
            .await
    }

    pub async fn cancel(&self) -> Result<(), WireError> {
        self.send_error(WireError::new(WireErrorCode::CanceledTransfer, "transfer cancelled by user"))
            .await
    }

    pub async fn file_info(&mut self, req: FileInfoRequest) -> Result<FileInfoReply, WireError> {
        self.send(Packet::FileInfo(req)).await?;
        match self.recv().await? {
            Packet::FileInfoReply(reply) => Ok(reply),
            other => Err(unexpected("FileInfoReply", &other)),
        }
    }

    pub async fn transfer_info(&mut self, req: TransferInfoRequest) -> Result<TransferInfoReply, WireError> {
        self.send(Packet::TransferInfo(req)).await?;
        match self.recv().await? {
            Packet::TransferInfoReply(reply) => Ok(reply),
            other => Err(unexpected("TransferInfoReply", &other)),
        }
    }

    /// Closes the session; the connection stays open for other sessions.
    pub async fn close(self) {
        if let Err(err) = self.send(Packet::Close).await {
            tracing::debug!("failed to close session {}: {err}", self.id());
        }
    }
}
