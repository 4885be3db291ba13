//! Errors raised while reading or writing envelopes.

use std::io;

use tokio_util::codec::LinesCodecError;

use crate::transport::MAX_FRAME_BYTES;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The frame was not a valid envelope.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame is not valid UTF-8")]
    InvalidEncoding,

    #[error("Frame exceeds {0} bytes")]
    FrameTooLong(usize),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

impl WireError {
    /// Whether the peer sent something that cannot be parsed, as opposed to
    /// the transport itself failing.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

impl From<LinesCodecError> for WireError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => Self::FrameTooLong(MAX_FRAME_BYTES),
            LinesCodecError::Io(err) if err.kind() == io::ErrorKind::InvalidData => {
                Self::InvalidEncoding
            }
            LinesCodecError::Io(err) => Self::Io(err),
        }
    }
}
