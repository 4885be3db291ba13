use std::io;

use p2p_signal::WireError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Cannot reach signaling server at {addr}: {source}")]
    ServerUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Cannot connect to {peer} at {addr}: {source}")]
    PeerUnreachable {
        peer: String,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Signaling server closed the connection")]
    ServerClosed,

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Invalid peer address `{0}`")]
    InvalidPeerAddress(String),

    #[error("Channel to {0} is closed")]
    ChannelClosed(String),

    #[error("Connection from {addr} did not open with PEER_READY")]
    PeerNotReady { addr: String },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
