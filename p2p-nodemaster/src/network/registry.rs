//! Peer registry: which identities are online, where, and how recently they
//! were heard from.
//!
//! The registry is plain state. It is owned by the [`PresenceHub`] lock so
//! that every mutation is serialized together with the broadcast it causes.
//!
//! [`PresenceHub`]: super::hub::PresenceHub

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub identity: String,
    pub address: IpAddr,
    /// Port the client accepts direct peer connections on.
    pub port: u16,
    pub last_heartbeat: Instant,
    pub online: bool,
    pub registered_at: DateTime<Utc>,
}

impl PeerRecord {
    fn new(identity: &str, address: IpAddr, port: u16) -> Self {
        Self {
            identity: identity.to_string(),
            address,
            port,
            last_heartbeat: Instant::now(),
            online: true,
            registered_at: Utc::now(),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn heartbeat_age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_heartbeat)
    }

    pub fn is_timed_out(&self, threshold: Duration) -> bool {
        self.heartbeat_age() > threshold
    }
}

/// At most one record per identity; iteration order is by identity.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<String, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for `identity`, stamping its heartbeat.
    /// Returns whether an existing record was replaced.
    pub fn register(&mut self, identity: &str, address: IpAddr, port: u16) -> bool {
        self.peers
            .insert(identity.to_string(), PeerRecord::new(identity, address, port))
            .is_some()
    }

    pub fn unregister(&mut self, identity: &str) -> bool {
        self.peers.remove(identity).is_some()
    }

    /// Refresh the heartbeat of an existing record. Unknown identities are ignored.
    pub fn touch(&mut self, identity: &str) {
        if let Some(record) = self.peers.get_mut(identity) {
            record.last_heartbeat = Instant::now();
            record.online = true;
        }
    }

    /// Every online identity except `identity`, in identity order.
    pub fn snapshot_excluding(&self, identity: &str) -> Vec<String> {
        self.peers
            .values()
            .filter(|record| record.online && record.identity != identity)
            .map(|record| record.identity.clone())
            .collect()
    }

    /// Unknown identities are never timed out.
    pub fn is_timed_out(&self, identity: &str, threshold: Duration) -> bool {
        self.peers
            .get(identity)
            .is_some_and(|record| record.is_timed_out(threshold))
    }

    pub fn timed_out(&self, threshold: Duration) -> Vec<String> {
        self.peers
            .values()
            .filter(|record| record.is_timed_out(threshold))
            .map(|record| record.identity.clone())
            .collect()
    }

    pub fn get(&self, identity: &str) -> Option<&PeerRecord> {
        self.peers.get(identity)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_register_reports_replacement() {
        let mut registry = PeerRegistry::new();
        assert!(!registry.register("alice", LOCALHOST, 6001));
        assert!(registry.register("alice", LOCALHOST, 6002));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("alice").unwrap().port, 6002);
    }

    #[test]
    fn test_unregister() {
        let mut registry = PeerRegistry::new();
        registry.register("alice", LOCALHOST, 6001);

        assert!(registry.unregister("alice"));
        assert!(!registry.unregister("alice"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_no_duplicates_and_snapshot_never_contains_self() {
        let mut registry = PeerRegistry::new();
        let names = ["carol", "alice", "bob", "dave", "alice", "bob"];
        for (step, name) in names.iter().enumerate() {
            registry.register(name, LOCALHOST, 6000 + step as u16);
        }
        registry.unregister("dave");
        registry.register("dave", LOCALHOST, 7001);
        registry.unregister("carol");
        registry.register("carol", LOCALHOST, 7000);

        assert_eq!(registry.len(), 4);
        for name in ["alice", "bob", "carol", "dave"] {
            let snapshot = registry.snapshot_excluding(name);
            assert!(!snapshot.contains(&name.to_string()));
            assert_eq!(snapshot.len(), 3);
        }
        assert_eq!(registry.snapshot_excluding("alice"), vec!["bob", "carol", "dave"]);
        assert_eq!(registry.snapshot_excluding("nobody").len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_touch() {
        let mut registry = PeerRegistry::new();
        let threshold = Duration::from_secs(30);
        registry.register("alice", LOCALHOST, 6001);
        registry.register("bob", LOCALHOST, 6002);

        tokio::time::advance(Duration::from_secs(20)).await;
        registry.touch("bob");
        registry.touch("ghost");
        assert!(!registry.is_timed_out("alice", threshold));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(registry.is_timed_out("alice", threshold));
        assert!(!registry.is_timed_out("bob", threshold));
        assert!(!registry.is_timed_out("ghost", threshold));
        assert_eq!(registry.timed_out(threshold), vec!["alice"]);
        assert!(registry.get("ghost").is_none());
    }
}
