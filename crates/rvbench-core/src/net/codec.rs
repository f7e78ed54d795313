//! Length-prefixed bincode frames
//!
//! Every frame is a big-endian `u32` payload length followed by the bincode
//! encoding of a `Frame`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{BusError, BusResult};
use crate::message::Message;

/// Largest accepted frame payload
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every client connection
    Hello {
        service: String,
        network: String,
        description: String,
    },
    Subscribe {
        id: u64,
        subject: String,
    },
    /// Daemon acknowledgement that a route is installed
    Subscribed {
        id: u64,
    },
    Unsubscribe {
        id: u64,
    },
    Publish(Message),
    /// Daemon delivery of a published message to subscription `id`
    Deliver {
        id: u64,
        message: Message,
    },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Subscribe { .. } => "subscribe",
            Frame::Subscribed { .. } => "subscribed",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Publish(_) => "publish",
            Frame::Deliver { .. } => "deliver",
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> BusResult<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(frame)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(BusError::protocol(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> BusResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BusError::protocol(format!("frame too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}
