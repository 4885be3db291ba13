//! Signaling server for the peer-to-peer chat.
//!
//! Clients log in here, learn who else is online, and exchange the
//! addresses they need to open a direct connection to each other.

pub mod config;
pub mod error;
pub mod network;

pub use config::ServerConfig;
pub use error::ServerError;
pub use network::SignalingServer;
