use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use super::hub::PresenceHub;

/// Background task that evicts users whose heartbeat went stale.
///
/// Eviction goes through [`PresenceHub::sweep`], the same exactly-once path
/// an explicit disconnect takes, so a sweep racing a logout for the same
/// user produces a single USER_OFFLINE.
pub struct HeartbeatMonitor {
    hub: Arc<PresenceHub>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(hub: Arc<PresenceHub>, interval: Duration, timeout: Duration) -> Self {
        Self {
            hub,
            interval,
            timeout,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        log::info!(
            "Heartbeat monitor started (every {:?}, timeout {:?})",
            self.interval,
            self.timeout
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }

        log::info!("Heartbeat monitor stopped");
    }

    /// Run one sweep now. Returns the evicted identities.
    pub fn sweep(&self) -> Vec<String> {
        let evicted = self.hub.sweep(self.timeout);
        for identity in &evicted {
            log::warn!("User timeout: {identity}");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use p2p_signal::{Message, MessageType};
    use tokio::sync::mpsc;

    use super::*;
    use crate::network::session::SessionHandle;

    fn session() -> (SessionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = "127.0.0.1:40000".parse().unwrap();
        (SessionHandle::new(addr, tx, CancellationToken::new()), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_evicts_silent_user_on_schedule() {
        let hub = Arc::new(PresenceHub::new());
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let (alice, _alice_rx) = session();
        let (bob, mut bob_rx) = session();
        hub.login("alice", &alice, localhost, 6001);
        hub.login("bob", &bob, localhost, 6002);
        while bob_rx.try_recv().is_ok() {}

        let shutdown = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(
            Arc::clone(&hub),
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
        .spawn(shutdown.clone());

        // Bob keeps heartbeating, alice goes quiet.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            hub.touch("bob");
        }

        assert!(hub.peer_record("alice").is_none());
        assert!(hub.peer_record("bob").is_some());
        let offline: Vec<Message> = std::iter::from_fn(|| bob_rx.try_recv().ok())
            .filter(|m| m.kind() == &MessageType::UserOffline)
            .collect();
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].sender(), "alice");

        shutdown.cancel();
        monitor.await.unwrap();
    }
}
