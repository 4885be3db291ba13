//! Presence hub: the single owner of the peer registry and the
//! identity → session table.
//!
//! Every operation runs under one lock and only *enqueues* outbound
//! messages while holding it (writes happen on each session's writer task).
//! A registry mutation and the broadcast it triggers are therefore observed
//! by every session in the same order: a session never receives
//! USER_ONLINE for an identity already present in its snapshot, and every
//! session registered at eviction time receives exactly one USER_OFFLINE.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use p2p_signal::Message;
use parking_lot::Mutex;

use super::registry::{PeerRecord, PeerRegistry};
use super::session::{SessionHandle, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Logout,
    Disconnected,
    TimedOut,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Logout => "logout",
            Self::Disconnected => "disconnected",
            Self::TimedOut => "heartbeat timeout",
        };
        f.write_str(reason)
    }
}

/// Why a PEER_REQUEST or PEER_INFO could not be relayed. The display text
/// is what the sender receives in the ERROR reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Target user is missing")]
    MissingTarget,

    #[error("User {0} is not online")]
    TargetOffline(String),

    #[error("Cannot open a chat with yourself")]
    SelfTarget,

    #[error("Peer address is missing")]
    MissingAddress,
}

#[derive(Default)]
struct HubState {
    registry: PeerRegistry,
    sessions: HashMap<String, SessionHandle>,
}

#[derive(Default)]
pub struct PresenceHub {
    state: Mutex<HubState>,
}

impl PresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity` for `session`, acknowledge, announce it to everyone
    /// else, then send the newcomer its snapshot of who is online.
    ///
    /// If the identity was already online on another connection, that older
    /// session is told it was replaced and shut down; others are not told
    /// again. Returns whether an existing record was replaced.
    pub fn login(&self, identity: &str, session: &SessionHandle, address: IpAddr, port: u16) -> bool {
        let mut state = self.state.lock();
        let replaced = state.registry.register(identity, address, port);
        let previous = state.sessions.insert(identity.to_string(), session.clone());

        session.send(Message::login_ack());

        if let Some(previous) = previous.filter(|previous| previous.id() != session.id()) {
            log::warn!(
                "User {identity} logged in again from {}; closing session from {}",
                session.peer_addr(),
                previous.peer_addr()
            );
            previous.send(Message::error("Session replaced by a newer login"));
            previous.begin_close();
            previous.shutdown();
        }

        if !replaced {
            let notified = broadcast(&state.sessions, &Message::user_online(identity), identity);
            log::debug!("Announced {identity} to {notified} sessions");
        }

        let snapshot = state.registry.snapshot_excluding(identity);
        session.send(Message::online_users(&snapshot));

        log::info!(
            "User online: {identity} [{address}:{port}] - {} users online",
            state.registry.len()
        );
        replaced
    }

    /// Remove `identity` and broadcast USER_OFFLINE, exactly once.
    ///
    /// With `expected` set, only the session with that id is evicted, so a
    /// stale connection closing late cannot remove a newer login.
    pub fn evict(&self, identity: &str, expected: Option<SessionId>, reason: EvictReason) -> bool {
        let mut state = self.state.lock();
        evict_locked(&mut state, identity, expected, reason)
    }

    pub fn touch(&self, identity: &str) {
        self.state.lock().registry.touch(identity);
    }

    /// Queue the current online list for `session`. Taken and queued under
    /// the same lock as every broadcast, so it never overtakes or lags one.
    pub fn send_snapshot(&self, identity: &str, session: &SessionHandle) {
        let state = self.state.lock();
        let snapshot = state.registry.snapshot_excluding(identity);
        session.send(Message::online_users(&snapshot));
    }

    pub fn relay_peer_request(&self, from: &str, to: &str) -> Result<(), RelayError> {
        if to.is_empty() {
            return Err(RelayError::MissingTarget);
        }
        if to == from {
            return Err(RelayError::SelfTarget);
        }
        self.deliver(to, Message::peer_request(from, to))?;
        log::info!("Relayed peer request {from} -> {to}");
        Ok(())
    }

    /// Forward `address` to `to` unchanged.
    pub fn relay_peer_info(&self, from: &str, to: &str, address: &str) -> Result<(), RelayError> {
        if to.is_empty() {
            return Err(RelayError::MissingTarget);
        }
        if address.is_empty() {
            return Err(RelayError::MissingAddress);
        }
        self.deliver(to, Message::peer_info(from, to, address))?;
        log::info!("Relayed peer info {from} -> {to}");
        Ok(())
    }

    /// Evict every identity whose heartbeat is older than `threshold`.
    pub fn sweep(&self, threshold: Duration) -> Vec<String> {
        let mut state = self.state.lock();
        let mut evicted = Vec::new();
        for identity in state.registry.timed_out(threshold) {
            if evict_locked(&mut state, &identity, None, EvictReason::TimedOut) {
                evicted.push(identity);
            }
        }
        evicted
    }

    pub fn online_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn peer_record(&self, identity: &str) -> Option<PeerRecord> {
        self.state.lock().registry.get(identity).cloned()
    }

    fn deliver(&self, to: &str, message: Message) -> Result<(), RelayError> {
        let state = self.state.lock();
        let delivered = state
            .sessions
            .get(to)
            .is_some_and(|session| session.send(message));
        if delivered {
            Ok(())
        } else {
            Err(RelayError::TargetOffline(to.to_string()))
        }
    }
}

fn evict_locked(
    state: &mut HubState,
    identity: &str,
    expected: Option<SessionId>,
    reason: EvictReason,
) -> bool {
    let Some(session) = state.sessions.get(identity) else {
        return false;
    };
    if expected.is_some_and(|id| id != session.id()) {
        return false;
    }
    if !session.begin_close() {
        return false;
    }
    let Some(session) = state.sessions.remove(identity) else {
        return false;
    };
    state.registry.unregister(identity);
    let notified = broadcast(&state.sessions, &Message::user_offline(identity), identity);
    session.shutdown();

    log::info!(
        "User offline: {identity} ({reason}) - {} users online, {notified} notified",
        state.registry.len()
    );
    true
}

fn broadcast(sessions: &HashMap<String, SessionHandle>, message: &Message, exclude: &str) -> usize {
    sessions
        .iter()
        .filter(|(identity, _)| identity.as_str() != exclude)
        .filter(|(_, session)| session.send(message.clone()))
        .count()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Barrier};

    use p2p_signal::MessageType;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct TestSession {
        handle: SessionHandle,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl TestSession {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let addr = "127.0.0.1:40000".parse().unwrap();
            Self {
                handle: SessionHandle::new(addr, tx, CancellationToken::new()),
                rx,
            }
        }

        fn drain(&mut self) -> Vec<Message> {
            let mut messages = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                messages.push(message);
            }
            messages
        }
    }

    fn count(messages: &[Message], kind: MessageType, sender: &str) -> usize {
        messages
            .iter()
            .filter(|m| m.kind() == &kind && m.sender() == sender)
            .count()
    }

    #[test]
    fn test_login_acks_announces_then_snapshots() {
        let hub = PresenceHub::new();
        let mut alice = TestSession::new();
        let mut bob = TestSession::new();

        assert!(!hub.login("alice", &alice.handle, LOCALHOST, 6001));
        let first = alice.drain();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].kind(), &MessageType::Login);
        assert_eq!(first[1].kind(), &MessageType::GetOnlineUsers);
        assert!(first[1].online_list().is_empty());

        hub.login("bob", &bob.handle, LOCALHOST, 6002);
        let to_bob = bob.drain();
        assert_eq!(to_bob[0].content(), p2p_signal::common::LOGIN_SUCCESS);
        assert_eq!(to_bob[1].kind(), &MessageType::GetOnlineUsers);
        assert_eq!(to_bob[1].online_list(), vec!["alice"]);

        let to_alice = alice.drain();
        assert_eq!(to_alice.len(), 1);
        assert_eq!(count(&to_alice, MessageType::UserOnline, "bob"), 1);
        assert_eq!(hub.online_count(), 2);
    }

    #[test]
    fn test_evict_broadcasts_offline_once() {
        let hub = PresenceHub::new();
        let alice = TestSession::new();
        let mut bob = TestSession::new();
        hub.login("alice", &alice.handle, LOCALHOST, 6001);
        hub.login("bob", &bob.handle, LOCALHOST, 6002);
        bob.drain();

        assert!(hub.evict("alice", Some(alice.handle.id()), EvictReason::Disconnected));
        assert!(!hub.evict("alice", Some(alice.handle.id()), EvictReason::Disconnected));
        assert!(!hub.evict("alice", None, EvictReason::TimedOut));

        let to_bob = bob.drain();
        assert_eq!(to_bob.len(), 1);
        assert_eq!(count(&to_bob, MessageType::UserOffline, "alice"), 1);
        assert!(alice.handle.cancel_token().is_cancelled());
        assert!(hub.peer_record("alice").is_none());
        assert_eq!(hub.online_count(), 1);
    }

    #[test]
    fn test_refresh_snapshot_is_ordered_with_broadcasts() {
        let hub = Arc::new(PresenceHub::new());
        let mut watcher = TestSession::new();
        hub.login("watcher", &watcher.handle, LOCALHOST, 6001);
        watcher.drain();

        let churn = {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let carol = TestSession::new();
                    hub.login("carol", &carol.handle, LOCALHOST, 6003);
                    hub.evict("carol", Some(carol.handle.id()), EvictReason::Logout);
                }
            })
        };
        for _ in 0..2_000 {
            hub.send_snapshot("watcher", &watcher.handle);
        }
        churn.join().unwrap();

        // Fold the queue the way a client does; every snapshot must agree
        // with the presence events queued before it.
        let mut online = BTreeSet::new();
        let mut snapshots = 0;
        for message in watcher.drain() {
            match message.kind() {
                MessageType::UserOnline => {
                    online.insert(message.sender().to_string());
                }
                MessageType::UserOffline => {
                    online.remove(message.sender());
                }
                MessageType::GetOnlineUsers => {
                    let snapshot: BTreeSet<String> = message.online_list().into_iter().collect();
                    assert_eq!(snapshot, online);
                    snapshots += 1;
                }
                _ => {}
            }
        }
        assert_eq!(snapshots, 2_000);
        assert!(online.is_empty());
    }

    #[test]
    fn test_peer_request_to_unknown_identity() {
        let hub = PresenceHub::new();
        let alice = TestSession::new();
        let mut bob = TestSession::new();
        hub.login("alice", &alice.handle, LOCALHOST, 6001);
        hub.login("bob", &bob.handle, LOCALHOST, 6002);
        bob.drain();

        assert_eq!(
            hub.relay_peer_request("alice", "ghost"),
            Err(RelayError::TargetOffline("ghost".into()))
        );
        assert_eq!(hub.relay_peer_request("alice", "alice"), Err(RelayError::SelfTarget));
        assert_eq!(hub.relay_peer_request("alice", ""), Err(RelayError::MissingTarget));
        assert!(bob.drain().is_empty());
    }

    #[test]
    fn test_handshake_messages_are_relayed() {
        let hub = PresenceHub::new();
        let mut alice = TestSession::new();
        let mut bob = TestSession::new();
        hub.login("alice", &alice.handle, LOCALHOST, 6001);
        hub.login("bob", &bob.handle, LOCALHOST, 6002);
        alice.drain();
        bob.drain();

        hub.relay_peer_request("alice", "bob").unwrap();
        let request = bob.drain().pop().unwrap();
        assert_eq!(request.kind(), &MessageType::PeerRequest);
        assert_eq!(request.sender(), "alice");

        hub.relay_peer_info("bob", "alice", "127.0.0.1:6001").unwrap();
        let info = alice.drain().pop().unwrap();
        assert_eq!(info.kind(), &MessageType::PeerInfo);
        assert_eq!(info.sender(), "bob");
        assert_eq!(info.content(), "127.0.0.1:6001");

        assert_eq!(
            hub.relay_peer_info("bob", "alice", ""),
            Err(RelayError::MissingAddress)
        );
    }

    #[test]
    fn test_relogin_replaces_old_session_quietly() {
        let hub = PresenceHub::new();
        let mut old = TestSession::new();
        let new = TestSession::new();
        let mut bob = TestSession::new();
        hub.login("bob", &bob.handle, LOCALHOST, 6002);
        hub.login("alice", &old.handle, LOCALHOST, 6001);
        bob.drain();
        old.drain();

        assert!(hub.login("alice", &new.handle, LOCALHOST, 6003));
        assert!(bob.drain().is_empty());
        let to_old = old.drain();
        assert_eq!(to_old.len(), 1);
        assert_eq!(to_old[0].kind(), &MessageType::Error);
        assert!(old.handle.is_closed());

        // The stale connection closing later must not evict the new login.
        assert!(!hub.evict("alice", Some(old.handle.id()), EvictReason::Disconnected));
        assert_eq!(hub.peer_record("alice").unwrap().port, 6003);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_stale_peers_once() {
        let hub = PresenceHub::new();
        let alice = TestSession::new();
        let mut bob = TestSession::new();
        hub.login("alice", &alice.handle, LOCALHOST, 6001);
        hub.login("bob", &bob.handle, LOCALHOST, 6002);
        bob.drain();

        tokio::time::advance(Duration::from_secs(31)).await;
        hub.touch("bob");

        assert_eq!(hub.sweep(Duration::from_secs(30)), vec!["alice"]);
        assert!(hub.sweep(Duration::from_secs(30)).is_empty());
        assert!(!hub.evict("alice", Some(alice.handle.id()), EvictReason::Logout));

        let to_bob = bob.drain();
        assert_eq!(count(&to_bob, MessageType::UserOffline, "alice"), 1);
        assert_eq!(hub.online_count(), 1);
    }

    #[test]
    fn test_sweep_racing_logout_evicts_once() {
        for _ in 0..10 {
            let hub = Arc::new(PresenceHub::new());
            let alice = TestSession::new();
            let mut bob = TestSession::new();
            hub.login("alice", &alice.handle, LOCALHOST, 6001);
            hub.login("bob", &bob.handle, LOCALHOST, 6002);
            bob.drain();

            std::thread::sleep(Duration::from_millis(60));
            hub.touch("bob");

            let barrier = Arc::new(Barrier::new(2));
            let sweeper = {
                let hub = Arc::clone(&hub);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    hub.sweep(Duration::from_millis(30)).len()
                })
            };
            let logout = {
                let hub = Arc::clone(&hub);
                let barrier = Arc::clone(&barrier);
                let id = alice.handle.id();
                std::thread::spawn(move || {
                    barrier.wait();
                    usize::from(hub.evict("alice", Some(id), EvictReason::Logout))
                })
            };

            let evictions = sweeper.join().unwrap() + logout.join().unwrap();
            assert_eq!(evictions, 1);
            assert_eq!(count(&bob.drain(), MessageType::UserOffline, "alice"), 1);
        }
    }
}
