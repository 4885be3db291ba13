use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::common::{ChatMessage, NetworkEvent, PeerRequest};

const MAX_DEBUG_EVENTS: usize = 100;

/// Debug event để hiển thị thông tin mạng
#[derive(Debug, Clone)]
pub struct DebugEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub peer: Option<String>,
    pub message: String,
}

/// Trạng thái cục bộ của UI.
#[derive(Default)]
pub struct AppState {
    pub identity: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub online_users: BTreeSet<String>,
    /// Peers with an open direct channel.
    pub peers: Vec<String>,
    /// Where plain input lines are sent.
    pub active_peer: Option<String>,
    pub pending_requests: VecDeque<PeerRequest>,
    pub debug_events: Vec<DebugEvent>,
    pub peer_last_seen: HashMap<String, DateTime<Utc>>,
    pub server_connected: bool,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a network event into the state and return the line to show,
    /// if any.
    pub fn apply(&mut self, event: NetworkEvent) -> Option<String> {
        match event {
            NetworkEvent::LoggedIn {
                identity,
                listen_port,
            } => {
                let line = format!("Logged in as {identity} (peers connect on port {listen_port})");
                self.identity = Some(identity);
                self.server_connected = true;
                Some(line)
            }
            NetworkEvent::OnlineUsers(users) => {
                self.online_users = users.into_iter().collect();
                Some(self.online_summary())
            }
            NetworkEvent::PeerOnline(peer) => {
                let line = format!("{peer} is online");
                self.online_users.insert(peer);
                Some(line)
            }
            NetworkEvent::PeerOffline(peer) => {
                self.online_users.remove(&peer);
                Some(format!("{peer} went offline"))
            }
            NetworkEvent::PeerRequest(request) => {
                let peer = request.peer();
                let line = format!("{peer} wants to chat. /accept {peer} or /reject {peer}");
                self.pending_requests.push_back(request);
                Some(line)
            }
            NetworkEvent::PeerConnected(peer) => {
                self.add_peer(peer.clone());
                Some(format!("Direct channel to {peer} is open"))
            }
            NetworkEvent::PeerDisconnected(peer) => {
                self.remove_peer(&peer);
                Some(format!("{peer} disconnected"))
            }
            NetworkEvent::MessageReceived(message) => {
                let line = format!("[{}] {}", message.sender, message.content);
                self.push_message(message);
                Some(line)
            }
            NetworkEvent::MessageSent(message) => {
                let line = format!("[me -> {}] {}", message.peer, message.content);
                self.push_message(message);
                Some(line)
            }
            NetworkEvent::SystemNotice(text) => {
                self.add_debug_event("NOTICE".to_string(), None, text.clone());
                Some(format!("* {text}"))
            }
            NetworkEvent::ServerDisconnected => {
                self.server_connected = false;
                self.online_users.clear();
                Some("Disconnected from the signaling server".to_string())
            }
        }
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.add_debug_event(
            "MESSAGE".to_string(),
            Some(message.peer.clone()),
            format!("{} -> {}", message.sender, message.peer),
        );
        self.messages.push(message);
    }

    /// Conversation with `peer`, oldest first.
    pub fn conversation<'a>(&'a self, peer: &'a str) -> impl Iterator<Item = &'a ChatMessage> {
        self.messages.iter().filter(move |message| message.peer == peer)
    }

    pub fn add_peer(&mut self, peer: String) {
        let now = Utc::now();
        if !self.peers.contains(&peer) {
            self.peers.push(peer.clone());
        }
        self.peer_last_seen.insert(peer.clone(), now);
        if self.active_peer.is_none() {
            self.active_peer = Some(peer.clone());
        }
        self.add_debug_event(
            "PEER_CONNECTED".to_string(),
            Some(peer),
            format!("Peer connected at {}", now.format("%H:%M:%S")),
        );
    }

    pub fn remove_peer(&mut self, peer: &str) {
        let now = Utc::now();
        if !self.peers.iter().any(|open| open == peer) {
            return;
        }
        self.peers.retain(|open| open != peer);
        if self.active_peer.as_deref() == Some(peer) {
            self.active_peer = self.peers.first().cloned();
        }

        let duration_msg = match self.peer_last_seen.get(peer) {
            Some(since) => format!(
                " (open for {:.1}s)",
                now.signed_duration_since(*since).num_milliseconds() as f64 / 1000.0
            ),
            None => String::new(),
        };
        self.add_debug_event(
            "PEER_DISCONNECTED".to_string(),
            Some(peer.to_string()),
            format!("Peer disconnected at {}{duration_msg}", now.format("%H:%M:%S")),
        );
    }

    /// Take the pending request from `peer`, or the oldest one.
    pub fn take_request(&mut self, peer: Option<&str>) -> Option<PeerRequest> {
        let index = match peer {
            Some(peer) => self
                .pending_requests
                .iter()
                .position(|request| request.peer() == peer)?,
            None => 0,
        };
        self.pending_requests.remove(index)
    }

    pub fn add_debug_event(&mut self, event_type: String, peer: Option<String>, message: String) {
        self.debug_events.push(DebugEvent {
            timestamp: Utc::now(),
            event_type,
            peer,
            message,
        });
        if self.debug_events.len() > MAX_DEBUG_EVENTS {
            self.debug_events.remove(0);
        }
    }

    pub fn online_summary(&self) -> String {
        if self.online_users.is_empty() {
            "Nobody else is online".to_string()
        } else {
            let users: Vec<&str> = self.online_users.iter().map(String::as_str).collect();
            format!("Online: {}", users.join(", "))
        }
    }
}
