pub mod handler;
pub mod hub;
pub mod monitor;
pub mod registry;
pub mod server;
pub mod session;

pub use hub::{EvictReason, PresenceHub, RelayError};
pub use registry::{PeerRecord, PeerRegistry};
pub use server::SignalingServer;
