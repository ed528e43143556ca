//! Length-delimited frames carrying `bitcode` encoded [`Frame`]s.

use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::packet::Packet;

/// Largest accepted frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Largest block a transfer may use: a `Data` frame also carries the session
/// id, the rank and a block hash.
pub const MAX_BLOCK_SIZE: u32 = (MAX_FRAME_LENGTH - 64 * 1024) as u32;

/// What travels on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// One packet addressed to a logical session.
    Packet { session: u32, packet: Packet },
    /// Lets the peer send `count` more packets on `session`.
    Credit { session: u32, count: u32 },
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Writing half of a connection; each object is flushed as one frame.
#[derive(Debug)]
pub struct SendStream<W> {
    framed: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        Self {
            framed: FramedWrite::new(stream, codec()),
        }
    }

    /// Sends and flushes one object.
    pub async fn send_object<T: Serialize>(&mut self, obj: &T) -> anyhow::Result<()> {
        let bytes = bitcode::serialize(obj)?;
        self.framed.send(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        SinkExt::<bytes::Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}

/// Reading half of a connection.
#[derive(Debug)]
pub struct RecvStream<R> {
    framed: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        Self {
            framed: FramedRead::new(stream, codec()),
        }
    }

    /// Returns `None` once the peer closed the stream.
    pub async fn recv_object<T: serde::de::DeserializeOwned>(&mut self) -> anyhow::Result<Option<T>> {
        if let Some(frame) = futures::StreamExt::next(&mut self.framed).await {
            let bytes = frame?;
            let obj = bitcode::deserialize(&bytes)?;
            Ok(Some(obj))
        } else {
            Ok(None)
        }
    }
}

/// Writing half of a plain or TLS socket.
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;
/// Reading half of a plain or TLS socket.
pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
