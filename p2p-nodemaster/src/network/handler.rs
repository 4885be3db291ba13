//! Connection handler: one per accepted connection, owning its receive loop.
//!
//! ```text
//! AwaitingLogin --LOGIN--> Active --LOGOUT / read error / cancel--> Closing --> Closed
//! ```

use std::sync::Arc;
use std::time::Duration;

use p2p_signal::common::default_peer_port;
use p2p_signal::transport::TcpMessageReader;
use p2p_signal::{Message, MessageType, SERVER_IDENTITY};
use tokio::time::{Instant, sleep_until};

use super::hub::{EvictReason, PresenceHub, RelayError};
use super::session::SessionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    AwaitingLogin,
    Active,
    Closing,
    Closed,
}

pub struct ConnectionHandler {
    hub: Arc<PresenceHub>,
    session: SessionHandle,
    reader: TcpMessageReader,
    /// How long a fresh connection may stay in `AwaitingLogin`.
    login_timeout: Duration,
    identity: Option<String>,
    state: HandlerState,
    close_reason: EvictReason,
}

impl ConnectionHandler {
    pub fn new(
        hub: Arc<PresenceHub>,
        session: SessionHandle,
        reader: TcpMessageReader,
        login_timeout: Duration,
    ) -> Self {
        Self {
            hub,
            session,
            reader,
            login_timeout,
            identity: None,
            state: HandlerState::AwaitingLogin,
            close_reason: EvictReason::Disconnected,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Receive and dispatch until logout, transport failure, or cancellation,
    /// then tear the session down.
    pub async fn run(mut self) {
        let cancel = self.session.cancel_token();
        let login_deadline = Instant::now() + self.login_timeout;

        while matches!(self.state, HandlerState::AwaitingLogin | HandlerState::Active) {
            let awaiting_login = self.state == HandlerState::AwaitingLogin;
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Session {} cancelled", self.label());
                    break;
                }
                _ = sleep_until(login_deadline), if awaiting_login => {
                    log::warn!("{} did not log in within {:?}", self.label(), self.login_timeout);
                    self.session.send(Message::error("Login timed out"));
                    break;
                }
                next = self.reader.next_message() => next,
            };

            match next {
                Ok(Some(message)) => self.dispatch(message),
                Ok(None) => {
                    log::debug!("{} closed the connection", self.label());
                    break;
                }
                Err(err) if err.is_protocol_violation() => {
                    log::warn!("Protocol violation from {}: {err}", self.label());
                    break;
                }
                Err(err) => {
                    log::debug!("Read error from {}: {err}", self.label());
                    break;
                }
            }
        }

        self.close();
    }

    fn dispatch(&mut self, message: Message) {
        if !message.kind().is_known() {
            log::warn!(
                "Ignoring unknown message type `{}` from {}",
                message.kind(),
                self.label()
            );
            return;
        }

        match self.state {
            HandlerState::AwaitingLogin => match message.kind() {
                MessageType::Login => self.handle_login(&message),
                other => {
                    log::warn!("{} sent {other} before logging in", self.label());
                    self.session.send(Message::error("Login required"));
                }
            },
            HandlerState::Active => self.dispatch_active(message),
            HandlerState::Closing | HandlerState::Closed => {}
        }
    }

    fn dispatch_active(&mut self, message: Message) {
        let Some(identity) = self.identity.clone() else {
            return;
        };

        match message.kind() {
            MessageType::Heartbeat => self.hub.touch(&identity),
            MessageType::PeerRequest => {
                let target = message.target().unwrap_or_default();
                if let Err(err) = self.hub.relay_peer_request(&identity, target) {
                    log::info!("Peer request {identity} -> {target} failed: {err}");
                    self.reply_relay_error(target, err);
                }
            }
            MessageType::PeerInfo => {
                let target = message.target().unwrap_or_default();
                if let Err(err) = self.hub.relay_peer_info(&identity, target, message.content()) {
                    log::info!("Peer info {identity} -> {target} failed: {err}");
                    self.reply_relay_error(target, err);
                }
            }
            MessageType::GetOnlineUsers => self.hub.send_snapshot(&identity, &self.session),
            MessageType::Logout => {
                log::info!("User {identity} logged out");
                self.close_reason = EvictReason::Logout;
                self.state = HandlerState::Closing;
            }
            MessageType::Login => {
                log::warn!("Ignoring repeated LOGIN from {identity}");
            }
            other => {
                log::debug!("Ignoring {other} from {identity}; the server does not carry chat payload");
            }
        }
    }

    /// The ERROR names the identity the failed handshake step was aimed at,
    /// so the sender can drop whatever it had pending for that peer.
    fn reply_relay_error(&self, target: &str, err: RelayError) {
        let mut reply = Message::error(err.to_string());
        if !target.is_empty() {
            reply = reply.with_target(target);
        }
        self.session.send(reply);
    }

    fn handle_login(&mut self, message: &Message) {
        let identity = message.sender().trim();
        if identity.is_empty() || identity == SERVER_IDENTITY {
            log::warn!("Rejecting login with invalid username `{identity}`");
            self.session.send(Message::error("Invalid username"));
            return;
        }

        let port = message.login_port().unwrap_or_else(|| {
            let port = default_peer_port(identity);
            log::debug!("{identity} did not advertise a peer port; assuming {port}");
            port
        });

        self.identity = Some(identity.to_string());
        self.state = HandlerState::Active;
        let address = self.session.peer_addr().ip();
        if self.hub.login(identity, &self.session, address, port) {
            log::info!("User {identity} re-registered from {}", self.session.peer_addr());
        }
    }

    /// Unregister, broadcast USER_OFFLINE, and release the transport.
    /// Repeated calls do nothing.
    fn close(&mut self) {
        if self.state == HandlerState::Closed {
            return;
        }
        self.state = HandlerState::Closing;

        if let Some(identity) = self.identity.as_deref() {
            self.hub.evict(identity, Some(self.session.id()), self.close_reason);
        }
        self.session.shutdown();
        self.state = HandlerState::Closed;
        log::info!("Client disconnected: {}", self.label());
    }

    fn label(&self) -> String {
        match &self.identity {
            Some(identity) => format!("{identity} ({})", self.session.peer_addr()),
            None => self.session.peer_addr().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use p2p_signal::transport;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;

    async fn handler_with_queue(
        hub: Arc<PresenceHub>,
    ) -> (ConnectionHandler, mpsc::UnboundedReceiver<Message>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();
        let (reader, _writer) = transport::split(stream);

        let (tx, rx) = mpsc::unbounded_channel();
        let session = SessionHandle::new(peer_addr, tx, CancellationToken::new());
        let handler = ConnectionHandler::new(hub, session, reader, Duration::from_secs(30));
        (handler, rx, client)
    }

    fn kinds(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<MessageType> {
        let mut kinds = Vec::new();
        while let Ok(message) = rx.try_recv() {
            kinds.push(message.kind().clone());
        }
        kinds
    }

    #[tokio::test]
    async fn test_requires_login_first() {
        let hub = Arc::new(PresenceHub::new());
        let (mut handler, mut rx, _client) = handler_with_queue(Arc::clone(&hub)).await;

        handler.dispatch(Message::heartbeat("alice"));
        assert_eq!(handler.state(), HandlerState::AwaitingLogin);
        assert_eq!(kinds(&mut rx), vec![MessageType::Error]);

        handler.dispatch(Message::login(SERVER_IDENTITY, 6001));
        assert_eq!(handler.state(), HandlerState::AwaitingLogin);

        handler.dispatch(Message::login("alice", 6001));
        assert_eq!(handler.state(), HandlerState::Active);
        assert_eq!(
            kinds(&mut rx),
            vec![MessageType::Error, MessageType::Login, MessageType::GetOnlineUsers]
        );
        assert_eq!(hub.peer_record("alice").unwrap().port, 6001);
    }

    #[tokio::test]
    async fn test_login_without_port_uses_derived_default() {
        let hub = Arc::new(PresenceHub::new());
        let (mut handler, _rx, _client) = handler_with_queue(Arc::clone(&hub)).await;

        handler.dispatch(Message::new(MessageType::Login, "alice", "login"));
        let record = hub.peer_record("alice").unwrap();
        assert_eq!(record.port, default_peer_port("alice"));
        assert_eq!(record.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_unknown_tag_keeps_session_open() {
        let hub = Arc::new(PresenceHub::new());
        let (mut handler, mut rx, _client) = handler_with_queue(Arc::clone(&hub)).await;
        handler.dispatch(Message::login("alice", 6001));
        kinds(&mut rx);

        handler.dispatch(Message::new(MessageType::Unknown("TYPING".into()), "alice", ""));
        handler.dispatch(Message::text("alice", "payload is not relayed"));
        assert_eq!(handler.state(), HandlerState::Active);
        assert!(kinds(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_logout_then_repeated_close_broadcasts_once() {
        let hub = Arc::new(PresenceHub::new());
        let (mut alice, _alice_rx, _a) = handler_with_queue(Arc::clone(&hub)).await;
        let (mut bob, mut bob_rx, _b) = handler_with_queue(Arc::clone(&hub)).await;
        alice.dispatch(Message::login("alice", 6001));
        bob.dispatch(Message::login("bob", 6002));
        kinds(&mut bob_rx);

        alice.dispatch(Message::logout("alice"));
        assert_eq!(alice.state(), HandlerState::Closing);
        alice.close();
        alice.close();

        assert_eq!(alice.state(), HandlerState::Closed);
        assert_eq!(kinds(&mut bob_rx), vec![MessageType::UserOffline]);
        assert_eq!(hub.online_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_replies_with_snapshot() {
        let hub = Arc::new(PresenceHub::new());
        let (mut alice, mut alice_rx, _a) = handler_with_queue(Arc::clone(&hub)).await;
        let (mut bob, _bob_rx, _b) = handler_with_queue(Arc::clone(&hub)).await;
        alice.dispatch(Message::login("alice", 6001));
        bob.dispatch(Message::login("bob", 6002));
        kinds(&mut alice_rx);

        alice.dispatch(Message::get_online_users("alice"));
        let reply = alice_rx.try_recv().unwrap();
        assert_eq!(reply.kind(), &MessageType::GetOnlineUsers);
        assert_eq!(reply.online_list(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_relay_error_names_the_target() {
        let hub = Arc::new(PresenceHub::new());
        let (mut alice, mut rx, _client) = handler_with_queue(Arc::clone(&hub)).await;
        alice.dispatch(Message::login("alice", 6001));
        kinds(&mut rx);

        alice.dispatch(Message::peer_request("alice", "ghost"));
        let error = rx.try_recv().unwrap();
        assert_eq!(error.kind(), &MessageType::Error);
        assert_eq!(error.content(), "User ghost is not online");
        assert_eq!(error.target(), Some("ghost"));

        alice.dispatch(Message::new(MessageType::PeerRequest, "alice", ""));
        let error = rx.try_recv().unwrap();
        assert_eq!(error.content(), "Target user is missing");
        assert_eq!(error.target(), None);
    }
}
