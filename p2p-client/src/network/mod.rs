pub mod client;
pub mod peer;

pub use client::P2PClient;
pub use peer::{PeerChannel, PeerEvent};
