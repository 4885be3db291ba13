//! Direct chat channel between two clients.
//!
//! Both ends behave the same once the channel is open. The initiator's
//! first frame is PEER_READY naming itself so the acceptor can match the
//! connection to a request it agreed to.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use p2p_signal::transport::{self, TcpMessageReader, TcpMessageWriter};
use p2p_signal::{Message, MessageType};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::ChatMessage;
use crate::error::ClientError;

pub type ChannelId = Uuid;

/// What a channel's receive loop reports to the owning client.
#[derive(Debug)]
pub enum PeerEvent {
    Text {
        peer: String,
        content: String,
        timestamp: i64,
    },
    /// Sent at most once per channel, and never after [`PeerChannel::close`].
    Disconnected { channel: ChannelId, peer: String },
}

/// An accepted connection that has identified itself with PEER_READY.
pub struct IncomingPeer {
    pub peer: String,
    pub remote_addr: SocketAddr,
    reader: TcpMessageReader,
    writer: TcpMessageWriter,
}

/// Read the opening PEER_READY from a freshly accepted connection.
pub async fn await_peer_ready(
    stream: TcpStream,
    remote_addr: SocketAddr,
    wait: Duration,
) -> Result<IncomingPeer, ClientError> {
    let (mut reader, writer) = transport::split(stream);
    let not_ready = || ClientError::PeerNotReady {
        addr: remote_addr.to_string(),
    };

    let first = timeout(wait, reader.next_message())
        .await
        .map_err(|_| not_ready())??
        .ok_or_else(not_ready)?;

    if first.kind() != &MessageType::PeerReady || first.sender().is_empty() {
        return Err(not_ready());
    }

    Ok(IncomingPeer {
        peer: first.sender().to_string(),
        remote_addr,
        reader,
        writer,
    })
}

pub struct PeerChannel {
    id: ChannelId,
    peer: String,
    local_identity: String,
    remote_addr: SocketAddr,
    writer: TcpMessageWriter,
    connected: Arc<AtomicBool>,
    disconnect_reported: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl PeerChannel {
    /// Dial `address` (`host:port`) and announce ourselves with PEER_READY.
    pub async fn connect(
        local_identity: &str,
        peer: &str,
        address: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, ClientError> {
        if !is_valid_address(address) {
            return Err(ClientError::InvalidPeerAddress(address.to_string()));
        }

        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| ClientError::PeerUnreachable {
                peer: peer.to_string(),
                addr: address.to_string(),
                source,
            })?;
        let remote_addr = stream.peer_addr()?;
        let (reader, mut writer) = transport::split(stream);
        writer.send(&Message::peer_ready(local_identity)).await?;

        log::info!("Opened peer channel to {peer} at {remote_addr}");
        Ok(Self::start(local_identity, peer, remote_addr, reader, writer, events))
    }

    /// Adopt an inbound connection that already sent its PEER_READY.
    pub fn accept(
        local_identity: &str,
        incoming: IncomingPeer,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        log::info!(
            "Accepted peer channel from {} at {}",
            incoming.peer,
            incoming.remote_addr
        );
        Self::start(
            local_identity,
            &incoming.peer,
            incoming.remote_addr,
            incoming.reader,
            incoming.writer,
            events,
        )
    }

    fn start(
        local_identity: &str,
        peer: &str,
        remote_addr: SocketAddr,
        reader: TcpMessageReader,
        writer: TcpMessageWriter,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let channel = Self {
            id: Uuid::new_v4(),
            peer: peer.to_string(),
            local_identity: local_identity.to_string(),
            remote_addr,
            writer,
            connected: Arc::new(AtomicBool::new(true)),
            disconnect_reported: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        };

        tokio::spawn(receive_loop(
            ReceiveContext {
                channel: channel.id,
                peer: channel.peer.clone(),
                connected: Arc::clone(&channel.connected),
                disconnect_reported: Arc::clone(&channel.disconnect_reported),
                cancel: channel.cancel.clone(),
                events,
            },
            reader,
        ));
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send one TEXT. A failed write marks the channel disconnected; there
    /// is no retry.
    pub async fn send(&mut self, content: &str) -> Result<ChatMessage, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::ChannelClosed(self.peer.clone()));
        }

        let message = Message::text(&self.local_identity, content);
        if let Err(err) = self.writer.send(&message).await {
            log::warn!("Write to {} failed: {err}", self.peer);
            self.connected.store(false, Ordering::Release);
            self.cancel.cancel();
            return Err(err.into());
        }

        Ok(ChatMessage::new(
            &self.peer,
            &self.local_identity,
            content,
            message.timestamp(),
        ))
    }

    /// Close without reporting a disconnect to the owner.
    pub async fn close(&mut self) {
        self.connected.store(false, Ordering::Release);
        self.disconnect_reported.store(true, Ordering::Release);
        self.cancel.cancel();
        if let Err(err) = self.writer.close().await {
            log::debug!("Error closing channel to {}: {err}", self.peer);
        }
    }
}

impl Drop for PeerChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ReceiveContext {
    channel: ChannelId,
    peer: String,
    connected: Arc<AtomicBool>,
    disconnect_reported: Arc<AtomicBool>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<PeerEvent>,
}

async fn receive_loop(ctx: ReceiveContext, mut reader: TcpMessageReader) {
    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            next = reader.next_message() => next,
        };

        match next {
            Ok(Some(message)) if message.kind() == &MessageType::Text => {
                if message.sender() != ctx.peer {
                    log::warn!(
                        "TEXT on channel to {} claims to be from {}",
                        ctx.peer,
                        message.sender()
                    );
                }
                let _ = ctx.events.send(PeerEvent::Text {
                    peer: ctx.peer.clone(),
                    content: message.content().to_string(),
                    timestamp: message.timestamp(),
                });
            }
            Ok(Some(message)) => {
                log::debug!("Ignoring {} on channel to {}", message.kind(), ctx.peer);
            }
            Ok(None) => {
                log::info!("{} closed the peer channel", ctx.peer);
                break;
            }
            Err(err) => {
                log::warn!("Peer channel to {} failed: {err}", ctx.peer);
                break;
            }
        }
    }

    ctx.connected.store(false, Ordering::Release);
    ctx.cancel.cancel();
    if !ctx.disconnect_reported.swap(true, Ordering::AcqRel) {
        let _ = ctx.events.send(PeerEvent::Disconnected {
            channel: ctx.channel,
            peer: ctx.peer,
        });
    }
}

fn is_valid_address(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && port.parse::<u16>().is_ok_and(|port| port != 0)
        }
        None => false,
    }
}
