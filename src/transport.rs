//! Line-delimited JSON framing.
//!
//! One envelope per line. JSON escaping keeps newlines out of the encoded
//! object, so a frame boundary is always a message boundary.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::common::{Message, PROTOCOL_VERSION};
use crate::error::WireError;

/// Upper bound for a single encoded envelope (hex file payloads included).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type TcpMessageReader = MessageReader<OwnedReadHalf>;
pub type TcpMessageWriter = MessageWriter<OwnedWriteHalf>;

pub fn encode(message: &Message) -> Result<String, WireError> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode(line: &str) -> Result<Message, WireError> {
    let message: Message = serde_json::from_str(line)?;
    if message.version() != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(message.version()));
    }
    Ok(message)
}

/// Split a TCP stream into independently owned read and write halves.
pub fn split(stream: TcpStream) -> (TcpMessageReader, TcpMessageWriter) {
    if let Err(err) = stream.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY: {err}");
    }
    let (read_half, write_half) = stream.into_split();
    (MessageReader::new(read_half), MessageWriter::new(write_half))
}

pub struct MessageReader<R> {
    frames: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            frames: FramedRead::new(inner, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
        }
    }

    /// Next envelope, or `Ok(None)` once the remote end closed the stream.
    ///
    /// Any error means the stream can no longer be trusted.
    pub async fn next_message(&mut self) -> Result<Option<Message>, WireError> {
        match self.frames.next().await {
            None => Ok(None),
            Some(Err(err)) => Err(err.into()),
            Some(Ok(line)) => decode(&line).map(Some),
        }
    }
}

pub struct MessageWriter<W> {
    frames: FramedWrite<W, LinesCodec>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            frames: FramedWrite::new(inner, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
        }
    }

    /// Encode, write and flush one envelope.
    pub async fn send(&mut self, message: &Message) -> Result<(), WireError> {
        let line = encode(message)?;
        self.frames.send(line).await?;
        Ok(())
    }

    /// Flush and shut down the write side.
    pub async fn close(&mut self) -> Result<(), WireError> {
        SinkExt::<String>::close(&mut self.frames).await?;
        Ok(())
    }
}
