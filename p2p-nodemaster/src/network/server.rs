use std::net::SocketAddr;
use std::sync::Arc;

use p2p_signal::Message;
use p2p_signal::transport::{self, MessageWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::ServerError;

use super::handler::ConnectionHandler;
use super::hub::PresenceHub;
use super::monitor::HeartbeatMonitor;
use super::session::{SessionHandle, run_writer};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Rendezvous server: accepts client connections, tracks who is online, and
/// relays handshake messages. Chat payload never passes through it.
pub struct SignalingServer {
    config: ServerConfig,
    listener: TcpListener,
    hub: Arc<PresenceHub>,
    connection_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl SignalingServer {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            connection_slots: Arc::new(Semaphore::new(config.max_connections)),
            config,
            listener,
            hub: Arc::new(PresenceHub::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> Arc<PresenceHub> {
        Arc::clone(&self.hub)
    }

    /// Cancel this token to stop [`run`](Self::run).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shut down. The heartbeat monitor runs for the
    /// same lifetime.
    pub async fn run(self) -> Result<(), ServerError> {
        let local_addr = self.local_addr()?;
        log::info!("Signaling server listening on {local_addr}");

        let monitor = HeartbeatMonitor::new(
            Arc::clone(&self.hub),
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout(),
        )
        .spawn(self.shutdown.child_token());

        let mut stats_interval = interval(STATS_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.handle_new_connection(stream, peer_addr),
                    Err(err) => log::error!("Failed to accept connection: {err}"),
                },
                _ = stats_interval.tick() => {
                    log::info!("Statistics: {} users online", self.hub.online_count());
                }
            }
        }

        // Every session token is a child of `shutdown`, so each handler is
        // already tearing itself down.
        if let Err(err) = monitor.await {
            log::warn!("Heartbeat monitor task failed: {err}");
        }
        log::info!("Signaling server stopped");
        Ok(())
    }

    fn handle_new_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let Ok(permit) = Arc::clone(&self.connection_slots).try_acquire_owned() else {
            log::warn!(
                "Rejecting {peer_addr}: {} connections already open",
                self.config.max_connections
            );
            tokio::spawn(reject(stream));
            return;
        };

        let (reader, writer) = transport::split(stream);
        let (outbound, queue) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        let session = SessionHandle::new(peer_addr, outbound, cancel.clone());

        tokio::spawn(run_writer(queue, writer, cancel));
        let handler = ConnectionHandler::new(
            Arc::clone(&self.hub),
            session,
            reader,
            self.config.heartbeat_timeout(),
        );
        tokio::spawn(async move {
            handler.run().await;
            drop(permit);
        });

        log::info!("Client connected: {peer_addr}");
    }
}

async fn reject(stream: TcpStream) {
    let (_, write_half) = stream.into_split();
    let mut writer = MessageWriter::new(write_half);
    if writer.send(&Message::error("Server is full")).await.is_ok() {
        let _ = writer.close().await;
    }
}
