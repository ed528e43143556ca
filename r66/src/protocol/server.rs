//! Responder side of a session.
//!
//! [`serve`] authenticates the session once, then answers its requests until
//! the requester closes it or a transfer fails. A transfer runs as:
//!
//! `Request -> EndPreTasks -> StartData -> Data* / EndTransfer -> EndRequest`
//!
//! Any step may be answered with an `Error` packet by either side.

use async_trait::async_trait;
use common::pipeline::{Cause, Signal};
use common::{TransferError, TransferErrorCode};
use std::sync::Arc;

use super::connection::{PeerInfo, Session};
use super::packet::{
    Authent, FileInfoReply, FileInfoRequest, Packet, Request, TransferInfoReply,
    TransferInfoRequest, UpdateInfo,
};
use super::WireError;
use crate::errors::to_wire;

/// The outcome of a successful authentication.
pub struct Authenticated {
    pub handler: Box<dyn SessionHandler>,
    /// Sent back to the requester.
    pub reply: Authent,
}

pub trait AuthHandler: Send + Sync {
    fn valid_auth(&self, auth: &Authent, peer: &PeerInfo) -> Result<Authenticated, WireError>;
}

/// Serves the requests of one authenticated session.
#[async_trait]
pub trait SessionHandler: Send {
    /// Validates a transfer request. The handler may adjust the request
    /// (file size, rank, block size); the adjusted request is echoed back.
    async fn valid_request(&mut self, req: &mut Request) -> Result<Box<dyn TransferHandler>, WireError>;

    async fn file_info(&mut self, req: &FileInfoRequest) -> Result<FileInfoReply, WireError>;

    async fn transfer_info(&mut self, req: &TransferInfoRequest) -> Result<TransferInfoReply, WireError>;
}

/// Drives the local half of one transfer.
#[async_trait]
pub trait TransferHandler: Send {
    /// Applies the file metadata sent by a pushing requester.
    async fn update_transfer_info(&mut self, info: &UpdateInfo) -> Result<(), TransferError>;

    /// Runs the pre-tasks; returns the file metadata when this side sends the file.
    async fn run_pre_task(&mut self) -> Result<Option<UpdateInfo>, TransferError>;

    async fn get_stream(&mut self) -> Result<(), TransferError>;

    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize, TransferError>;

    async fn write_data(&mut self, data: &[u8]) -> Result<(), TransferError>;

    fn block_hash(&self, data: &[u8]) -> Vec<u8>;

    /// Ends the data phase. Checks `hash` when receiving; returns the final
    /// hash to declare when sending.
    async fn valid_end_transfer(&mut self, hash: Option<&[u8]>) -> Result<Option<Vec<u8>>, TransferError>;

    async fn run_post_task(&mut self) -> Result<(), TransferError>;

    async fn valid_end_request(&mut self) -> Result<(), TransferError>;

    /// Records a local failure; the requester has already been told.
    async fn run_error_tasks(&mut self, err: &TransferError);

    /// Records an error reported by the requester, or the loss of the connection.
    async fn on_remote_error(&mut self, err: &WireError);

    fn signal(&self) -> Signal;

    /// Applies an interruption raised on this side.
    async fn halt(&mut self, cause: Cause);
}

enum Failure {
    Local(TransferError),
    Remote(WireError),
}

fn unexpected(packet: &Packet) -> Failure {
    Failure::Local(TransferError::new(
        TransferErrorCode::Unimplemented,
        format!("unexpected {} packet", packet.name()),
    ))
}

async fn recv(session: &mut Session) -> Result<Packet, Failure> {
    match session.recv().await.map_err(Failure::Remote)? {
        Packet::Error(err) => Err(Failure::Remote(err)),
        Packet::Close => Err(Failure::Remote(WireError::disconnection(
            "session closed by the remote host",
        ))),
        packet => Ok(packet),
    }
}

async fn send(session: &Session, packet: Packet) -> Result<(), Failure> {
    session.send(packet).await.map_err(Failure::Remote)
}

async fn send_error(session: &Session, err: WireError) {
    if let Err(send_err) = session.send(Packet::Error(err)).await {
        tracing::debug!("failed to send error to {}: {send_err}", session.peer().addr);
    }
}

/// Serves one session until it is closed.
#[tracing::instrument(skip_all, fields(peer = %session.peer().addr, session = session.id()))]
pub async fn serve(mut session: Session, auth: Arc<dyn AuthHandler>) {
    let Some(mut handler) = authenticate(&mut session, auth.as_ref()).await else {
        return;
    };
    loop {
        let packet = match session.recv().await {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!("session ended: {err}");
                return;
            }
        };
        match packet {
            Packet::Request(req) => {
                if !run_request(&mut session, handler.as_mut(), req).await {
                    return;
                }
            }
            Packet::FileInfo(req) => {
                let reply = handler.file_info(&req).await.map(Packet::FileInfoReply);
                answer(&session, reply).await;
            }
            Packet::TransferInfo(req) => {
                let reply = handler.transfer_info(&req).await.map(Packet::TransferInfoReply);
                answer(&session, reply).await;
            }
            Packet::Close => return,
            Packet::Error(err) => {
                tracing::debug!("session ended by the partner: {err}");
                return;
            }
            other => {
                send_error(
                    &session,
                    WireError::incorrect_command(format!("unexpected {} packet", other.name())),
                )
                .await;
                return;
            }
        }
    }
}

async fn answer(session: &Session, reply: Result<Packet, WireError>) {
    let packet = reply.unwrap_or_else(Packet::Error);
    if let Err(err) = session.send(packet).await {
        tracing::debug!("failed to answer {}: {err}", session.peer().addr);
    }
}

async fn authenticate(session: &mut Session, auth: &dyn AuthHandler) -> Option<Box<dyn SessionHandler>> {
    let authent = match session.recv().await.ok()? {
        Packet::Authent(authent) => authent,
        other => {
            send_error(
                session,
                WireError::incorrect_command(format!("expected Authent, received {}", other.name())),
            )
            .await;
            return None;
        }
    };
    match auth.valid_auth(&authent, session.peer()) {
        Ok(Authenticated { handler, reply }) => {
            tracing::debug!("account {:?} authenticated", authent.login);
            if let Err(err) = session.send(Packet::AuthentReply(reply)).await {
                tracing::debug!("failed to answer authentication: {err}");
                return None;
            }
            Some(handler)
        }
        Err(err) => {
            tracing::warn!("authentication of {:?} refused: {}", authent.login, err.message);
            send_error(session, err).await;
            None
        }
    }
}

/// Returns whether the session may serve another request.
async fn run_request(session: &mut Session, handler: &mut dyn SessionHandler, mut req: Request) -> bool {
    let mut trans = match handler.valid_request(&mut req).await {
        Ok(trans) => trans,
        Err(err) => {
            tracing::warn!("transfer request {} refused: {err}", req.id);
            send_error(session, err).await;
            return false;
        }
    };
    if let Err(err) = session.send(Packet::RequestReply(req.clone())).await {
        trans.on_remote_error(&err).await;
        return false;
    }
    let signal = trans.signal();
    let cause = match signal.race(run_transfer(session, trans.as_mut(), &req)).await {
        Ok(Ok(())) => return true,
        Ok(Err(Failure::Local(err))) => match signal.cause() {
            Some(cause) if err.code.is_signal() => cause,
            _ => {
                send_error(session, to_wire(&err)).await;
                trans.run_error_tasks(&err).await;
                return false;
            }
        },
        Ok(Err(Failure::Remote(err))) => {
            tracing::warn!("transfer {} aborted by the partner: {err}", req.id);
            trans.on_remote_error(&err).await;
            return false;
        }
        Err(cause) => cause,
    };
    tracing::info!("transfer {} interrupted: {cause}", req.id);
    send_error(session, to_wire(&cause.to_error())).await;
    trans.halt(cause).await;
    false
}

async fn run_transfer(session: &mut Session, trans: &mut dyn TransferHandler, req: &Request) -> Result<(), Failure> {
    let info = match recv(session).await? {
        Packet::EndPreTasks { info } => info,
        other => return Err(unexpected(&other)),
    };
    if let Some(info) = &info {
        trans.update_transfer_info(info).await.map_err(Failure::Local)?;
    }
    let info = trans.run_pre_task().await.map_err(Failure::Local)?;
    send(session, Packet::PreTasksOk { info }).await?;

    match recv(session).await? {
        Packet::StartData => {}
        other => return Err(unexpected(&other)),
    }
    trans.get_stream().await.map_err(Failure::Local)?;
    send(session, Packet::DataReady).await?;
    if req.is_recv {
        send_file(session, trans, req).await?;
    } else {
        receive_file(session, trans, req).await?;
    }

    match recv(session).await? {
        Packet::EndRequest => {}
        other => return Err(unexpected(&other)),
    }
    trans.run_post_task().await.map_err(Failure::Local)?;
    trans.valid_end_request().await.map_err(Failure::Local)?;
    if let Err(err) = session.send(Packet::EndRequestOk).await {
        tracing::warn!("transfer {} done but not acknowledged: {err}", req.id);
    }
    Ok(())
}

async fn receive_file(session: &mut Session, trans: &mut dyn TransferHandler, req: &Request) -> Result<(), Failure> {
    let mut expected_rank = req.rank;
    loop {
        match recv(session).await? {
            Packet::Data { rank, payload, hash } => {
                if rank != expected_rank {
                    return Err(Failure::Local(TransferError::new(
                        TransferErrorCode::DataTransfer,
                        format!("unexpected block rank {rank} (expected {expected_rank})"),
                    )));
                }
                if req.is_md5 && hash.as_deref() != Some(trans.block_hash(&payload).as_slice()) {
                    return Err(Failure::Local(TransferError::new(
                        TransferErrorCode::Integrity,
                        format!("invalid hash for block {rank}"),
                    )));
                }
                trans.write_data(&payload).await.map_err(Failure::Local)?;
                expected_rank += 1;
            }
            Packet::EndTransfer { hash } => {
                trans
                    .valid_end_transfer(hash.as_deref())
                    .await
                    .map_err(Failure::Local)?;
                return send(session, Packet::EndTransferOk { hash: None }).await;
            }
            other => return Err(unexpected(&other)),
        }
    }
}

/// Fills `buf` unless the end of the file is reached first.
async fn read_block(trans: &mut dyn TransferHandler, buf: &mut [u8]) -> Result<usize, TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = trans.read_data(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn send_file(session: &mut Session, trans: &mut dyn TransferHandler, req: &Request) -> Result<(), Failure> {
    let mut buf = vec![0u8; req.block as usize];
    let mut rank = req.rank;
    loop {
        // the requester may give up while we are still sending
        if let Some(packet) = session.try_recv() {
            return match packet {
                Packet::Error(err) => Err(Failure::Remote(err)),
                other => Err(unexpected(&other)),
            };
        }
        let n = read_block(trans, &mut buf).await.map_err(Failure::Local)?;
        if n == 0 {
            break;
        }
        let payload = buf[..n].to_vec();
        let hash = req.is_md5.then(|| trans.block_hash(&payload));
        send(session, Packet::Data { rank, payload, hash }).await?;
        rank += 1;
        if n < buf.len() {
            break;
        }
    }
    let hash = trans.valid_end_transfer(None).await.map_err(Failure::Local)?;
    send(session, Packet::EndTransfer { hash }).await?;
    match recv(session).await? {
        Packet::EndTransferOk { .. } => Ok(()),
        other => Err(unexpected(&other)),
    }
}

