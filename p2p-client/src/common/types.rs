use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat line as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    /// The other side of the conversation.
    pub peer: String,
    pub sender: String,
    pub content: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn new(peer: &str, sender: &str, content: &str, timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer: peer.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp,
        }
    }
}
