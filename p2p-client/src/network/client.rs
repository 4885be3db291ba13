use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use p2p_signal::common::LOGIN_SUCCESS;
use p2p_signal::transport::{self, TcpMessageWriter};
use p2p_signal::{Message, MessageType};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};

use crate::common::{ChatMessage, NetworkCommand, NetworkEvent, PeerRequest};
use crate::config::ClientConfig;
use crate::error::ClientError;

use super::peer::{IncomingPeer, PeerChannel, PeerEvent, await_peer_ready};

/// How long an inbound connection has to send its PEER_READY.
const PEER_READY_TIMEOUT: Duration = Duration::from_secs(10);
const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Results of work the event loop hands off to spawned tasks.
enum Internal {
    Decision { peer: String, accepted: bool },
    Inbound(Result<IncomingPeer, ClientError>),
    Outbound {
        peer: String,
        result: Result<PeerChannel, ClientError>,
    },
}

/// Client side of the signaling protocol.
///
/// Owns the server connection, the peer listener and every open
/// [`PeerChannel`]. The UI drives it with [`NetworkCommand`]s and hears back
/// through [`NetworkEvent`]s.
pub struct P2PClient {
    identity: String,
    config: ClientConfig,
    event_sender: mpsc::Sender<NetworkEvent>,
    command_receiver: mpsc::Receiver<NetworkCommand>,
    channels: HashMap<String, PeerChannel>,
    /// Requests we sent, waiting for the target's PEER_INFO.
    outgoing_requests: HashMap<String, Instant>,
    /// Requests we accepted, waiting for the requester to dial in.
    accepted_requests: HashMap<String, Instant>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    listen_port: u16,
    advertised_addr: String,
    logged_in: bool,
}

impl P2PClient {
    pub fn new(
        identity: impl Into<String>,
        config: ClientConfig,
        event_sender: mpsc::Sender<NetworkEvent>,
        command_receiver: mpsc::Receiver<NetworkCommand>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            identity: identity.into(),
            config,
            event_sender,
            command_receiver,
            channels: HashMap::new(),
            outgoing_requests: HashMap::new(),
            accepted_requests: HashMap::new(),
            internal_tx,
            internal_rx,
            peer_tx,
            peer_rx,
            listen_port: 0,
            advertised_addr: String::new(),
            logged_in: false,
        }
    }

    /// Connect, log in, and serve commands until logout or until the server
    /// connection is lost.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        let listen_port = listener.local_addr()?.port();
        self.listen_port = listen_port;

        let server_addr = self.config.server_addr();
        let stream = TcpStream::connect(&server_addr)
            .await
            .map_err(|source| ClientError::ServerUnreachable {
                addr: server_addr.clone(),
                source,
            })?;
        let advertise_host = match &self.config.advertise_host {
            Some(host) => host.clone(),
            None => stream.local_addr()?.ip().to_string(),
        };
        self.advertised_addr = format!("{advertise_host}:{listen_port}");

        let (mut reader, mut writer) = transport::split(stream);
        writer.send(&Message::login(&self.identity, listen_port)).await?;
        log::info!(
            "Connected to {server_addr} as {}; accepting peers on {}",
            self.identity,
            self.advertised_addr
        );

        let heartbeat_every = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut expiry = interval(EXPIRY_CHECK_INTERVAL);

        let failure = loop {
            let outcome = tokio::select! {
                command = self.command_receiver.recv() => match command {
                    Some(NetworkCommand::Logout) | None => break None,
                    Some(command) => self.handle_command(command, &mut writer).await,
                },
                message = reader.next_message() => match message {
                    Ok(Some(message)) => self.handle_server_message(message).await,
                    Ok(None) => Err(ClientError::ServerClosed),
                    Err(err) => Err(err.into()),
                },
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => self.spawn_inbound_handshake(stream, remote_addr),
                        Err(err) => log::warn!("Failed to accept peer connection: {err}"),
                    }
                    Ok(())
                }
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal, &mut writer).await,
                Some(event) = self.peer_rx.recv() => {
                    self.handle_peer_event(event).await;
                    Ok(())
                }
                _ = heartbeat.tick() => writer
                    .send(&Message::heartbeat(&self.identity))
                    .await
                    .map_err(ClientError::from),
                _ = expiry.tick() => {
                    self.expire_requests().await;
                    Ok(())
                }
            };

            if let Err(err) = outcome {
                break Some(err);
            }
        };

        match &failure {
            None => {
                log::info!("Logging out {}", self.identity);
                if let Err(err) = writer.send(&Message::logout(&self.identity)).await {
                    log::debug!("Failed to send LOGOUT: {err}");
                }
                let _ = writer.close().await;
            }
            Some(err) => {
                log::warn!("Disconnected from the signaling server: {err}");
                self.notice(format!("Disconnected from the signaling server: {err}"))
                    .await;
                self.emit(NetworkEvent::ServerDisconnected).await;
            }
        }

        for (_, mut channel) in self.channels.drain() {
            channel.close().await;
        }
        match failure {
            Some(err @ ClientError::LoginRejected(_)) => Err(err),
            _ => Ok(()),
        }
    }

    async fn handle_command(
        &mut self,
        command: NetworkCommand,
        server: &mut TcpMessageWriter,
    ) -> Result<(), ClientError> {
        match command {
            NetworkCommand::ConnectToPeer { peer } => {
                if self.channels.get(&peer).is_some_and(PeerChannel::is_connected) {
                    self.notice(format!("Already connected to {peer}")).await;
                    return Ok(());
                }
                self.request_peer(&peer, server).await?;
            }
            NetworkCommand::SendMessage { to, content } => {
                let open = self.channels.get_mut(&to).filter(|channel| channel.is_connected());
                let Some(channel) = open else {
                    self.notice(format!("No open channel to {to}; requesting one"))
                        .await;
                    return self.request_peer(&to, server).await;
                };
                let sent = channel.send(&content).await;
                match sent {
                    Ok(message) => self.emit(NetworkEvent::MessageSent(message)).await,
                    Err(err) => self.notice(format!("Failed to send to {to}: {err}")).await,
                }
            }
            NetworkCommand::ClosePeer { peer } => match self.channels.remove(&peer) {
                Some(mut channel) => {
                    channel.close().await;
                    self.emit(NetworkEvent::PeerDisconnected(peer)).await;
                }
                None => self.notice(format!("No open channel to {peer}")).await,
            },
            NetworkCommand::RefreshOnlineUsers => {
                server.send(&Message::get_online_users(&self.identity)).await?;
            }
            // Handled by the event loop.
            NetworkCommand::Logout => {}
        }
        Ok(())
    }

    async fn request_peer(
        &mut self,
        peer: &str,
        server: &mut TcpMessageWriter,
    ) -> Result<(), ClientError> {
        let peer = peer.trim();
        if peer.is_empty() || peer == self.identity {
            self.notice("Pick another user to chat with".to_string()).await;
            return Ok(());
        }

        server.send(&Message::peer_request(&self.identity, peer)).await?;
        self.outgoing_requests.insert(peer.to_string(), Instant::now());
        log::info!("Sent peer request to {peer}");
        self.notice(format!("Requesting a chat with {peer}...")).await;
        Ok(())
    }

    async fn handle_server_message(&mut self, message: Message) -> Result<(), ClientError> {
        match message.kind() {
            MessageType::Login if message.content() == LOGIN_SUCCESS => {
                self.logged_in = true;
                log::info!("Logged in as {}", self.identity);
                self.emit(NetworkEvent::LoggedIn {
                    identity: self.identity.clone(),
                    listen_port: self.listen_port,
                })
                .await;
            }
            MessageType::GetOnlineUsers => {
                let mut online = message.online_list();
                online.retain(|identity| identity != &self.identity);
                self.emit(NetworkEvent::OnlineUsers(online)).await;
            }
            MessageType::UserOnline if message.sender() != self.identity => {
                self.emit(NetworkEvent::PeerOnline(message.sender().to_string()))
                    .await;
            }
            MessageType::UserOffline => {
                let peer = message.sender().to_string();
                if self.outgoing_requests.remove(&peer).is_some() {
                    self.notice(format!("{peer} went offline before answering"))
                        .await;
                }
                self.accepted_requests.remove(&peer);
                self.emit(NetworkEvent::PeerOffline(peer)).await;
            }
            MessageType::PeerRequest => self.surface_peer_request(message.sender()).await,
            MessageType::PeerInfo => self.handle_peer_info(&message),
            MessageType::Error if !self.logged_in => {
                return Err(ClientError::LoginRejected(message.content().to_string()));
            }
            MessageType::Error => {
                // A failed relay names the peer it was aimed at; that
                // handshake is over.
                if let Some(peer) = message.target() {
                    self.outgoing_requests.remove(peer);
                    self.accepted_requests.remove(peer);
                }
                log::warn!("Server error: {}", message.content());
                self.notice(format!("Server: {}", message.content())).await;
            }
            other => log::debug!("Ignoring {other} from the server"),
        }
        Ok(())
    }

    async fn surface_peer_request(&mut self, from: &str) {
        if from.is_empty() || from == self.identity {
            return;
        }
        log::info!("Peer request from {from}");

        let (responder, decision) = oneshot::channel();
        self.emit(NetworkEvent::PeerRequest(PeerRequest::new(
            from.to_string(),
            responder,
        )))
        .await;

        let peer = from.to_string();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let accepted = decision.await.unwrap_or(false);
            let _ = internal.send(Internal::Decision { peer, accepted });
        });
    }

    fn handle_peer_info(&mut self, message: &Message) {
        let peer = message.sender().to_string();
        if self.outgoing_requests.remove(&peer).is_none() {
            log::warn!("Ignoring unsolicited PEER_INFO from {peer}");
            return;
        }

        let address = message.content().to_string();
        log::info!("{peer} accepted; dialing {address}");
        let identity = self.identity.clone();
        let events = self.peer_tx.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = PeerChannel::connect(&identity, &peer, &address, events).await;
            let _ = internal.send(Internal::Outbound { peer, result });
        });
    }

    fn spawn_inbound_handshake(&self, stream: TcpStream, remote_addr: SocketAddr) {
        log::debug!("Incoming peer connection from {remote_addr}");
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = await_peer_ready(stream, remote_addr, PEER_READY_TIMEOUT).await;
            let _ = internal.send(Internal::Inbound(result));
        });
    }

    async fn handle_internal(
        &mut self,
        internal: Internal,
        server: &mut TcpMessageWriter,
    ) -> Result<(), ClientError> {
        match internal {
            Internal::Decision { peer, accepted: true } => {
                server
                    .send(&Message::peer_info(&self.identity, &peer, &self.advertised_addr))
                    .await?;
                self.accepted_requests.insert(peer.clone(), Instant::now());
                log::info!("Accepted peer request from {peer}");
            }
            Internal::Decision { peer, accepted: false } => {
                log::info!("Rejected peer request from {peer}");
            }
            Internal::Inbound(Ok(incoming)) => {
                if self.accepted_requests.remove(&incoming.peer).is_none() {
                    log::warn!(
                        "Dropping connection from {} claiming to be {}: no accepted request",
                        incoming.remote_addr,
                        incoming.peer
                    );
                    return Ok(());
                }
                let channel = PeerChannel::accept(&self.identity, incoming, self.peer_tx.clone());
                self.install_channel(channel).await;
            }
            Internal::Inbound(Err(err)) => log::warn!("Inbound peer handshake failed: {err}"),
            Internal::Outbound { peer, result } => match result {
                Ok(channel) => self.install_channel(channel).await,
                Err(err) => {
                    log::warn!("Direct connection to {peer} failed: {err}");
                    self.notice(format!("Could not connect to {peer}: {err}")).await;
                }
            },
        }
        Ok(())
    }

    async fn install_channel(&mut self, channel: PeerChannel) {
        let peer = channel.peer().to_string();
        log::debug!("Peer channel {} to {peer} via {}", channel.id(), channel.remote_addr());
        if let Some(mut previous) = self.channels.insert(peer.clone(), channel) {
            previous.close().await;
        }
        self.emit(NetworkEvent::PeerConnected(peer)).await;
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Text {
                peer,
                content,
                timestamp,
            } => {
                let message = ChatMessage::new(&peer, &peer, &content, timestamp);
                self.emit(NetworkEvent::MessageReceived(message)).await;
            }
            PeerEvent::Disconnected { channel, peer } => {
                let current = self
                    .channels
                    .get(&peer)
                    .is_some_and(|open| open.id() == channel);
                if current {
                    self.channels.remove(&peer);
                    self.emit(NetworkEvent::PeerDisconnected(peer)).await;
                }
            }
        }
    }

    async fn expire_requests(&mut self) {
        let timeout = self.config.peer_request_timeout();

        let mut expired: Vec<String> = Vec::new();
        self.outgoing_requests.retain(|peer, sent_at| {
            let fresh = sent_at.elapsed() < timeout;
            if !fresh {
                expired.push(peer.clone());
            }
            fresh
        });
        self.accepted_requests.retain(|peer, accepted_at| {
            let fresh = accepted_at.elapsed() < timeout;
            if !fresh {
                log::debug!("{peer} never dialed in; forgetting accepted request");
            }
            fresh
        });

        for peer in expired {
            log::info!("Peer request to {peer} expired");
            self.notice(format!("{peer} did not respond")).await;
        }
    }

    async fn notice(&self, text: String) {
        self.emit(NetworkEvent::SystemNotice(text)).await;
    }

    async fn emit(&self, event: NetworkEvent) {
        if let Err(err) = self.event_sender.send(event).await {
            log::debug!("UI is gone, dropping event: {err}");
        }
    }
}
