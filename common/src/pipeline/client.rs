//! Client side driver: runs a [`TransferClient`] through the pipeline steps.

use async_trait::async_trait;

use super::{Cause, Pipeline};
use crate::TransferError;
use crate::model::TransferStatus;

/// The protocol half of a client transfer.
///
/// Errors returned by these methods have already been reported to the
/// partner; the driver only records them.
#[async_trait]
pub trait TransferClient: Send {
    /// Connects to the partner, authenticates and sends the transfer request.
    async fn request(&mut self, pip: &mut Pipeline) -> Result<(), TransferError>;

    async fn begin_pre_tasks(&mut self, _pip: &mut Pipeline) -> Result<(), TransferError> {
        Ok(())
    }

    async fn end_pre_tasks(&mut self, pip: &mut Pipeline) -> Result<(), TransferError>;

    /// Sends the file; the pipeline stream is already open.
    async fn send(&mut self, pip: &mut Pipeline) -> Result<(), TransferError>;

    /// Receives the file; the pipeline stream is already open.
    async fn receive(&mut self, pip: &mut Pipeline) -> Result<(), TransferError>;

    async fn end_transfer(&mut self, pip: &mut Pipeline) -> Result<(), TransferError>;

    /// Notifies the partner of a local failure and closes the session.
    async fn send_error(&mut self, pip: &mut Pipeline, err: &TransferError);

    async fn pause(&mut self, pip: &mut Pipeline) -> Result<(), TransferError>;

    async fn cancel(&mut self, pip: &mut Pipeline) -> Result<(), TransferError>;
}

enum Failure {
    /// Raised by the pipeline itself; the partner does not know yet.
    Local(TransferError),
    /// Returned by the client, which already told the partner.
    Reported(TransferError),
}

fn reported(err: TransferError) -> Failure {
    Failure::Reported(err)
}

fn local(err: TransferError) -> Failure {
    Failure::Local(err)
}

async fn drive<C>(pip: &mut Pipeline, client: &mut C) -> Result<(), Failure>
where
    C: TransferClient + ?Sized,
{
    client.request(pip).await.map_err(reported)?;

    client.begin_pre_tasks(pip).await.map_err(reported)?;
    pip.pre_tasks().await.map_err(local)?;
    client.end_pre_tasks(pip).await.map_err(reported)?;

    pip.start_data().await.map_err(local)?;
    if pip.ctx.rule.is_send {
        client.send(pip).await.map_err(reported)?;
    } else {
        client.receive(pip).await.map_err(reported)?;
    }
    pip.end_data().await.map_err(local)?;

    pip.post_tasks().await.map_err(local)?;
    client.end_transfer(pip).await.map_err(reported)?;
    pip.end_transfer().await.map_err(local)
}

/// Runs a client transfer to completion, error or interruption.
pub async fn run_client<C>(pip: &mut Pipeline, client: &mut C) -> Result<(), TransferError>
where
    C: TransferClient + ?Sized,
{
    let signal = pip.signal().clone();
    let failure = match signal.race(drive(pip, client)).await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(failure)) => failure,
        Err(cause) => return halt(pip, client, cause).await,
    };
    let err = match failure {
        Failure::Reported(err) => err,
        Failure::Local(err) => {
            client.send_error(pip, &err).await;
            err
        }
    };
    // already paused or cancelled on the partner's request
    if err.code.is_signal() && pip.transfer().status != TransferStatus::Running {
        return Err(err);
    }
    pip.set_error(&err).await;
    Err(err)
}

async fn halt<C>(pip: &mut Pipeline, client: &mut C, cause: Cause) -> Result<(), TransferError>
where
    C: TransferClient + ?Sized,
{
    tracing::info!("transfer {} interrupted: {cause}", pip.transfer().id);
    let notified = match cause {
        Cause::Pause => client.pause(pip).await,
        Cause::Cancel => client.cancel(pip).await,
        Cause::Shutdown => {
            client.send_error(pip, &cause.to_error()).await;
            Ok(())
        }
    };
    if let Err(err) = notified {
        tracing::warn!("failed to notify the partner: {err}");
    }
    pip.halt(cause).await?;
    Err(cause.to_error())
}
