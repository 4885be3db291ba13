/// Lệnh UI gửi xuống tầng mạng.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCommand {
    /// Ask `peer` (through the server) for a direct chat channel.
    ConnectToPeer { peer: String },
    /// Send over the open channel to `to`; without one, a connection is
    /// requested first and the text is not queued.
    SendMessage { to: String, content: String },
    ClosePeer { peer: String },
    RefreshOnlineUsers,
    Logout,
}
