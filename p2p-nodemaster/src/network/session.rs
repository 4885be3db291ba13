//! Per-connection session state shared between a connection's own handler
//! and everyone who broadcasts or relays to it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use p2p_signal::Message;
use p2p_signal::transport::TcpMessageWriter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type SessionId = Uuid;

/// Cloneable handle to one accepted connection.
///
/// Outbound messages go through an unbounded queue drained by
/// [`run_writer`], which is the only code that writes to the socket, so
/// concurrent senders never interleave frames.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        peer_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            outbound,
            closed: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue a message. Returns `false` once the session is closing.
    pub fn send(&self, message: Message) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.send(message).is_ok()
    }

    /// Atomically move the session into the closing state.
    ///
    /// Exactly one caller ever gets `true`.
    pub fn begin_close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the connection's reader and writer tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Drain a session's outbound queue onto its socket.
///
/// Runs until every sender is dropped, a write fails, or the session is
/// cancelled. On cancellation, messages that were already queued are still
/// flushed so a final ERROR reaches the client.
pub async fn run_writer(
    mut queue: mpsc::UnboundedReceiver<Message>,
    mut writer: TcpMessageWriter,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            next = queue.recv() => {
                let Some(message) = next else { break };
                if let Err(err) = writer.send(&message).await {
                    log::debug!("Write failed, closing session: {err}");
                    cancel.cancel();
                    return;
                }
            }
            _ = cancel.cancelled() => {
                while let Ok(message) = queue.try_recv() {
                    if writer.send(&message).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.close().await;
}
