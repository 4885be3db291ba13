use tokio::sync::oneshot;

use super::types::ChatMessage;

/// Sự kiện từ tầng mạng gửi lên UI.
#[derive(Debug)]
pub enum NetworkEvent {
    LoggedIn { identity: String, listen_port: u16 },
    /// Full list of other users online, replacing any previous list.
    OnlineUsers(Vec<String>),
    PeerOnline(String),
    PeerOffline(String),
    PeerRequest(PeerRequest),
    PeerConnected(String),
    PeerDisconnected(String),
    MessageReceived(ChatMessage),
    MessageSent(ChatMessage),
    SystemNotice(String),
    ServerDisconnected,
}

/// Someone wants to open a direct channel. Dropping the request rejects it.
#[derive(Debug)]
pub struct PeerRequest {
    from: String,
    responder: oneshot::Sender<bool>,
}

impl PeerRequest {
    pub fn new(from: String, responder: oneshot::Sender<bool>) -> Self {
        Self { from, responder }
    }

    pub fn peer(&self) -> &str {
        &self.from
    }

    pub fn accept(self) {
        let _ = self.responder.send(true);
    }

    pub fn reject(self) {
        let _ = self.responder.send(false);
    }
}
