//! Chat client: logs in to the signaling server, learns who is online, and
//! opens direct channels to other users for the conversation itself.

pub mod common;
pub mod config;
pub mod error;
pub mod network;
pub mod ui;

pub use config::ClientConfig;
pub use error::ClientError;
pub use network::P2PClient;
