//! Binary wire protocol for the editing session.
//!
//! Every WebSocket frame carries one bincode-encoded [`Envelope`]:
//! ```text
//! ┌───────────┬───────────┬──────────────────────────────┐
//! │ script_id │ sender    │ message (tag + fields)       │
//! │ 16 bytes  │ 16 bytes  │ variable                     │
//! └───────────┴───────────┴──────────────────────────────┘
//! ```
//!
//! `sender` is the member the message originates from. Messages produced by
//! the server itself carry `Uuid::nil()`; messages the server relays keep the
//! original member's id.

use cowrite_core::Operation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation id of one local edit, echoed back by the server.
pub type EditId = Uuid;

/// Message discriminants, mostly for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    JoinSession = 1,
    RejoinSession = 2,
    LeaveSession = 3,
    JoinedSession = 4,
    SessionsFull = 5,
    Edit = 6,
    SyncToSession = 7,
    SyncError = 8,
    RequestSync = 9,
    CheckSessionStatus = 10,
    SessionStatus = 11,
    GetScriptText = 12,
    ScriptText = 13,
    CursorPosition = 14,
    Select = 15,
    MemberJoinedSession = 16,
    MemberLeftSession = 17,
    SessionClosed = 18,
}

/// Member identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for cursor/selection rendering
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        // Stable color from peer_id hash
        let hash = peer_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            peer_id,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Session protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// C→S: attach to a script's session.
    JoinSession { member: PeerInfo, state: u64 },
    /// C→S: recovery handshake carrying the last known state.
    RejoinSession { member: PeerInfo, state: u64 },
    /// C→S: detach from the session.
    LeaveSession,
    /// S→C: baseline document and roster.
    JoinedSession {
        state: u64,
        script_text: String,
        active_members: Vec<PeerInfo>,
    },
    /// S→C: the join was refused for capacity.
    SessionsFull,
    /// C↔S: one atomic or composite edit.
    ///
    /// C→S `state` is the server state the edit was computed against. S→C
    /// `state` is the state the edit was applied at; the receiver's state
    /// becomes `state + 1`.
    Edit {
        id: EditId,
        state: u64,
        edit: Operation,
    },
    /// S→C: forced resync to the authoritative text.
    SyncToSession { state: u64, script_text: String },
    /// S→C: the client's edit could not be reconciled.
    SyncError { state: u64, script_text: String },
    /// C→S: ask for a `SyncToSession`.
    RequestSync,
    /// C→S: liveness probe.
    CheckSessionStatus { state: u64 },
    /// S→C: answer to `CheckSessionStatus`.
    SessionStatus { active: bool, state: u64 },
    /// C→S: ask for the full text (drift check).
    GetScriptText,
    /// S→C: answer to `GetScriptText`.
    ScriptText { state: u64, script_text: String },
    /// C↔S: best-effort cursor presence.
    CursorPosition { position: usize, state: u64 },
    /// C↔S: best-effort selection presence.
    Select { start: usize, end: usize, state: u64 },
    /// S→C: roster change.
    MemberJoinedSession { member: PeerInfo },
    /// S→C: roster change.
    MemberLeftSession { member: Uuid },
    /// S→C: the server closed the session.
    SessionClosed,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::JoinSession { .. } => MessageType::JoinSession,
            Message::RejoinSession { .. } => MessageType::RejoinSession,
            Message::LeaveSession => MessageType::LeaveSession,
            Message::JoinedSession { .. } => MessageType::JoinedSession,
            Message::SessionsFull => MessageType::SessionsFull,
            Message::Edit { .. } => MessageType::Edit,
            Message::SyncToSession { .. } => MessageType::SyncToSession,
            Message::SyncError { .. } => MessageType::SyncError,
            Message::RequestSync => MessageType::RequestSync,
            Message::CheckSessionStatus { .. } => MessageType::CheckSessionStatus,
            Message::SessionStatus { .. } => MessageType::SessionStatus,
            Message::GetScriptText => MessageType::GetScriptText,
            Message::ScriptText { .. } => MessageType::ScriptText,
            Message::CursorPosition { .. } => MessageType::CursorPosition,
            Message::Select { .. } => MessageType::Select,
            Message::MemberJoinedSession { .. } => MessageType::MemberJoinedSession,
            Message::MemberLeftSession { .. } => MessageType::MemberLeftSession,
            Message::SessionClosed => MessageType::SessionClosed,
        }
    }
}

/// Top-level frame: one message addressed to one script's session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub script_id: Uuid,
    pub sender: Uuid,
    pub message: Message,
}

impl Envelope {
    pub fn new(script_id: Uuid, sender: Uuid, message: Message) -> Self {
        Self {
            script_id,
            sender,
            message,
        }
    }

    /// A message produced by the server itself.
    pub fn from_server(script_id: Uuid, message: Message) -> Self {
        Self::new(script_id, Uuid::nil(), message)
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(envelope)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_roundtrip() {
        let script = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let id = Uuid::new_v4();
        let edit = Operation::mult(vec![Operation::remove(10, 5), Operation::insert(11, "é")]);

        let env = Envelope::new(script, sender, Message::Edit { id, state: 42, edit: edit.clone() });
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();

        assert_eq!(decoded.script_id, script);
        assert_eq!(decoded.sender, sender);
        assert_eq!(decoded.message_type(), MessageType::Edit);
        assert_eq!(decoded.message, Message::Edit { id, state: 42, edit });
    }

    #[test]
    fn test_joined_session_roundtrip() {
        let alice = PeerInfo::new("Alice");
        let env = Envelope::from_server(
            Uuid::new_v4(),
            Message::JoinedSession {
                state: 7,
                script_text: "(play 'c4)".into(),
                active_members: vec![alice.clone()],
            },
        );
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();

        assert!(decoded.sender.is_nil());
        match decoded.message {
            Message::JoinedSession { state, script_text, active_members } => {
                assert_eq!(state, 7);
                assert_eq!(script_text, "(play 'c4)");
                assert_eq!(active_members, vec![alice]);
            }
            other => panic!("expected JoinedSession, got {other:?}"),
        }
    }

    #[test]
    fn test_unit_messages_roundtrip() {
        let script = Uuid::new_v4();
        for message in [
            Message::LeaveSession,
            Message::SessionsFull,
            Message::RequestSync,
            Message::GetScriptText,
            Message::SessionClosed,
        ] {
            let env = Envelope::from_server(script, message.clone());
            let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
            assert_eq!(decoded.message, message);
        }
    }

    #[test]
    fn test_edit_frame_is_compact() {
        let env = Envelope::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Message::Edit {
                id: Uuid::new_v4(),
                state: 1_000,
                edit: Operation::insert(120, "x"),
            },
        );
        let encoded = env.encode().unwrap();
        // 3 uuids plus a handful of varints
        assert!(encoded.len() < 80, "edit frame is {} bytes", encoded.len());
    }

    #[test]
    fn test_peer_info_stable_color() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let info1 = PeerInfo::with_id(id, "Test");
        let info2 = PeerInfo::with_id(id, "Test");
        assert_eq!(info1.color, info2.color);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            Envelope::decode(&garbage),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::JoinSession as u8, 1);
        assert_eq!(MessageType::Edit as u8, 6);
        assert_eq!(MessageType::SessionClosed as u8, 18);
        assert_eq!(Message::RequestSync.message_type(), MessageType::RequestSync);
    }
}
