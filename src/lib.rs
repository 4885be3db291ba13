//! Wire protocol shared by the signaling server (`p2p-nodemaster`) and the
//! chat client (`p2p-client`).
//!
//! Every connection in the system, client to server and peer to peer,
//! carries the same [`Message`] envelope framed as one JSON object per line.

pub mod common;
pub mod error;
pub mod logging;
pub mod transport;

pub use common::{Message, MessageType, SERVER_IDENTITY};
pub use error::WireError;
