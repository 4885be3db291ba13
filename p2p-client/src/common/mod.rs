pub mod commands;
pub mod events;
pub mod types;

pub use commands::NetworkCommand;
pub use events::{NetworkEvent, PeerRequest};
pub use types::ChatMessage;
