use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Version stamped into every envelope as `v`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Sender name used by the signaling server for its own messages.
pub const SERVER_IDENTITY: &str = "Server";

/// Content of the server's LOGIN acknowledgment.
pub const LOGIN_SUCCESS: &str = "login_success";

/// Tag carried in the `type` field of an envelope.
///
/// Tags outside the known set decode to [`MessageType::Unknown`] instead of
/// failing, so a receiver can tell "valid but unrecognized" apart from a
/// malformed frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Login,
    Logout,
    Heartbeat,
    GetOnlineUsers,
    PeerRequest,
    PeerInfo,
    PeerReady,
    Text,
    File,
    UserOnline,
    UserOffline,
    Error,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Login => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::Heartbeat => "HEARTBEAT",
            Self::GetOnlineUsers => "GET_ONLINE_USERS",
            Self::PeerRequest => "PEER_REQUEST",
            Self::PeerInfo => "PEER_INFO",
            Self::PeerReady => "PEER_READY",
            Self::Text => "TEXT",
            Self::File => "FILE",
            Self::UserOnline => "USER_ONLINE",
            Self::UserOffline => "USER_OFFLINE",
            Self::Error => "ERROR",
            Self::Unknown(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "LOGIN" => Self::Login,
            "LOGOUT" => Self::Logout,
            "HEARTBEAT" => Self::Heartbeat,
            "GET_ONLINE_USERS" => Self::GetOnlineUsers,
            "PEER_REQUEST" => Self::PeerRequest,
            "PEER_INFO" => Self::PeerInfo,
            "PEER_READY" => Self::PeerReady,
            "TEXT" => Self::Text,
            "FILE" => Self::File,
            "USER_ONLINE" => Self::UserOnline,
            "USER_OFFLINE" => Self::UserOffline,
            "ERROR" => Self::Error,
            _ => Self::Unknown(tag),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire unit exchanged on every connection, server and peer alike.
///
/// Fields serialize in declaration order. A message is immutable once
/// built; the `with_*` builders consume and return it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "v")]
    version: u8,
    #[serde(rename = "type")]
    kind: MessageType,
    from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default)]
    content: String,
    /// Unix epoch milliseconds.
    timestamp: i64,
    #[serde(rename = "fileName", default, skip_serializing_if = "Option::is_none")]
    file_name: Option<String>,
    #[serde(
        rename = "fileData",
        default,
        skip_serializing_if = "Option::is_none",
        with = "hex_payload"
    )]
    file_data: Option<Vec<u8>>,
}

impl Message {
    pub fn new(kind: MessageType, from: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            from: from.into(),
            to: None,
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
            file_name: None,
            file_data: None,
        }
    }

    pub fn with_target(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.file_name = Some(name.into());
        self.file_data = Some(data);
        self
    }

    /// LOGIN carrying the port the sender accepts peer connections on.
    pub fn login(identity: &str, listen_port: u16) -> Self {
        Self::new(MessageType::Login, identity, format!("login:{listen_port}"))
    }

    pub fn login_ack() -> Self {
        Self::new(MessageType::Login, SERVER_IDENTITY, LOGIN_SUCCESS)
    }

    pub fn logout(identity: &str) -> Self {
        Self::new(MessageType::Logout, identity, "logout")
    }

    pub fn heartbeat(identity: &str) -> Self {
        Self::new(MessageType::Heartbeat, identity, "")
    }

    pub fn get_online_users(identity: &str) -> Self {
        Self::new(MessageType::GetOnlineUsers, identity, "")
    }

    /// Server snapshot of online identities, comma-joined.
    pub fn online_users(identities: &[String]) -> Self {
        Self::new(
            MessageType::GetOnlineUsers,
            SERVER_IDENTITY,
            identities.join(","),
        )
    }

    pub fn peer_request(from: &str, to: &str) -> Self {
        Self::new(MessageType::PeerRequest, from, "peer_request").with_target(to)
    }

    /// `address` is the `host:port` the sender listens on for its peer channel.
    pub fn peer_info(from: &str, to: &str, address: &str) -> Self {
        Self::new(MessageType::PeerInfo, from, address).with_target(to)
    }

    pub fn peer_ready(from: &str) -> Self {
        Self::new(MessageType::PeerReady, from, "ready")
    }

    pub fn text(from: &str, content: &str) -> Self {
        Self::new(MessageType::Text, from, content)
    }

    pub fn user_online(identity: &str) -> Self {
        Self::new(MessageType::UserOnline, identity, "online")
    }

    pub fn user_offline(identity: &str) -> Self {
        Self::new(MessageType::UserOffline, identity, "offline")
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageType::Error, SERVER_IDENTITY, content)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    pub fn sender(&self) -> &str {
        &self.from
    }

    pub fn target(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn file_data(&self) -> Option<&[u8]> {
        self.file_data.as_deref()
    }

    /// Port advertised in a LOGIN body of the form `label:port`.
    pub fn login_port(&self) -> Option<u16> {
        let (_, port) = self.content.rsplit_once(':')?;
        port.trim().parse().ok().filter(|port| *port != 0)
    }

    /// Identities listed in a GET_ONLINE_USERS snapshot.
    pub fn online_list(&self) -> Vec<String> {
        self.content
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Fallback peer port for a client that did not advertise one.
///
/// `5000 + |h mod 1000|`, where `h` is the 31-multiplier wrapping `i32` hash
/// over the identity's UTF-16 code units. Two identities can collide.
pub fn default_peer_port(identity: &str) -> u16 {
    let hash = identity
        .encode_utf16()
        .fold(0i32, |acc, unit| acc.wrapping_mul(31).wrapping_add(i32::from(unit)));
    5000 + (hash % 1000).unsigned_abs() as u16
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| hex::decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_order_on_the_wire() {
        let msg = Message::peer_info("bob", "alice", "127.0.0.1:6001");
        let json = serde_json::to_string(&msg).unwrap();

        let positions: Vec<usize> = ["\"v\"", "\"type\"", "\"from\"", "\"to\"", "\"content\"", "\"timestamp\""]
            .iter()
            .map(|key| json.find(key).unwrap())
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(json.contains("\"type\":\"PEER_INFO\""));
        assert!(!json.contains("fileData"));
    }

    #[test]
    fn test_unknown_tag_is_preserved() {
        let json = r#"{"v":1,"type":"TYPING","from":"alice","content":"","timestamp":0}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind(), &MessageType::Unknown("TYPING".to_string()));
        assert!(!msg.kind().is_known());
        assert_eq!(msg.kind().to_string(), "TYPING");
    }

    #[test]
    fn test_missing_required_field_is_an_error() {
        let json = r#"{"v":1,"type":"LOGIN","content":"login:6001","timestamp":0}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    #[test]
    fn test_file_payload_survives_serialization() {
        let msg = Message::new(MessageType::File, "alice", "photo")
            .with_target("bob")
            .with_file("cat.png", vec![0, 1, 0xfe, 0xff]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"fileData\":\"0001feff\""));

        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.file_data(), Some(&[0, 1, 0xfe, 0xff][..]));
        assert_eq!(decoded.file_name(), Some("cat.png"));
    }

    #[test]
    fn test_login_port_parsing() {
        assert_eq!(Message::login("alice", 6001).login_port(), Some(6001));
        assert_eq!(Message::new(MessageType::Login, "alice", "login").login_port(), None);
        assert_eq!(Message::new(MessageType::Login, "alice", "login:abc").login_port(), None);
        assert_eq!(Message::new(MessageType::Login, "alice", "login:0").login_port(), None);
    }

    #[test]
    fn test_online_list_skips_empty_entries() {
        let snapshot = Message::online_users(&["alice".to_string(), "carol".to_string()]);
        assert_eq!(snapshot.content(), "alice,carol");
        assert_eq!(snapshot.online_list(), vec!["alice", "carol"]);
        assert!(Message::online_users(&[]).online_list().is_empty());
    }

    #[test]
    fn test_default_peer_port_is_deterministic_and_in_range() {
        // The 31-multiplier hash of "alice" is 92903040.
        assert_eq!(default_peer_port("alice"), 5040);
        assert_eq!(default_peer_port("alice"), default_peer_port("alice"));
        for name in ["bob", "carol", "ghost", "a-much-longer-identity-name", ""] {
            let port = default_peer_port(name);
            assert!((5000..6000).contains(&port), "{name} -> {port}");
        }
    }
}
