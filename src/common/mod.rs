pub mod types;

pub use types::{
    LOGIN_SUCCESS, Message, MessageType, PROTOCOL_VERSION, SERVER_IDENTITY, default_peer_port,
};
