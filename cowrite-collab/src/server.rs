//! WebSocket sync server: the single authority for every script's order.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── SessionRoom (script_id) ── DocumentRoom ── BroadcastGroup
//! Client B ──┘         │                     (text, state,        │
//!                      │                      history)            │
//!                      │                          ┌───────────────┼──────────┐
//!                      │                          ▼               ▼          ▼
//!                      └── scripts (texts of   Client A        Client B   Client C
//!                          closed sessions)
//! ```
//!
//! Edits are applied and broadcast while the room lock is held, so the
//! broadcast channel carries them in state order. Replies that carry a
//! snapshot (`syncError`, `syncToSession`, `scriptText`, `sessionStatus`)
//! flush whatever the connection has already received from the channel
//! before the snapshot goes out, so a client never sees an edit older than
//! the baseline it was just given.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame};
use crate::protocol::{Envelope, Message, PeerInfo, ProtocolError};
use crate::room::DocumentRoom;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum concurrently open script sessions
    pub max_sessions: usize,
    /// Maximum members per session
    pub max_members_per_session: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    /// Operations kept per session for transforming late edits
    pub history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions: 100,
            max_members_per_session: 100,
            broadcast_capacity: 256,
            history_limit: 1024,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub edits_applied: u64,
    pub edits_rejected: u64,
}

/// Authoritative document plus its broadcast group.
struct SessionRoom {
    document: DocumentRoom,
    broadcast: Arc<BroadcastGroup>,
}

impl SessionRoom {
    fn new(text: &str, config: &ServerConfig) -> Self {
        Self {
            document: DocumentRoom::new(text, config.history_limit),
            broadcast: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
        }
    }
}

struct ServerShared {
    config: ServerConfig,
    /// Open sessions: script_id → room
    rooms: RwLock<HashMap<Uuid, SessionRoom>>,
    /// Texts of scripts without an open session
    scripts: RwLock<HashMap<Uuid, String>>,
    stats: RwLock<ServerStats>,
}

/// Per-connection state.
struct Connection {
    addr: SocketAddr,
    member: Option<PeerInfo>,
    script_id: Option<Uuid>,
    broadcast_rx: Option<broadcast::Receiver<Arc<Frame>>>,
}

impl Connection {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            member: None,
            script_id: None,
            broadcast_rx: None,
        }
    }

    fn member_id(&self) -> Uuid {
        self.member.as_ref().map_or(Uuid::nil(), |member| member.peer_id)
    }

    /// The room went away underneath us.
    fn detach(&mut self) {
        self.script_id = None;
        self.broadcast_rx = None;
    }

    /// Move every frame already queued for this member into `out`.
    fn drain_pending(&mut self, out: &mut Vec<Vec<u8>>) {
        let member = self.member_id();
        let Some(rx) = self.broadcast_rx.as_mut() else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(frame) => {
                    if frame.delivers_to(member) {
                        out.push(frame.bytes.clone());
                    }
                }
                Err(TryRecvError::Lagged(n)) => {
                    log::warn!("member {member} lagged by {n} frames");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<ServerShared>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                rooms: RwLock::new(HashMap::new()),
                scripts: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Set the text a script's session starts from when it is next opened.
    pub async fn seed_script(&self, script_id: Uuid, text: impl Into<String>) {
        self.shared.scripts.write().await.insert(script_id, text.into());
    }

    /// Current text of a script, open or not.
    pub async fn script_text(&self, script_id: Uuid) -> Option<String> {
        let live = {
            let rooms = self.shared.rooms.read().await;
            rooms.get(&script_id).map(|room| room.document.text())
        };
        match live {
            Some(text) => Some(text),
            None => self.shared.scripts.read().await.get(&script_id).cloned(),
        }
    }

    /// State counter of an open session.
    pub async fn script_state(&self, script_id: Uuid) -> Option<u64> {
        let rooms = self.shared.rooms.read().await;
        rooms.get(&script_id).map(|room| room.document.state())
    }

    pub async fn session_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    pub async fn member_count(&self, script_id: Uuid) -> usize {
        let rooms = self.shared.rooms.read().await;
        match rooms.get(&script_id) {
            Some(room) => room.broadcast.member_count().await,
            None => 0,
        }
    }

    /// Close a session. Members are told with `sessionClosed` and must
    /// rejoin; the text is kept for the next join.
    pub async fn close_session(&self, script_id: Uuid) -> bool {
        let mut rooms = self.shared.rooms.write().await;
        let Some(room) = rooms.remove(&script_id) else {
            return false;
        };
        let closed = Envelope::from_server(script_id, Message::SessionClosed);
        if let Err(e) = room.broadcast.broadcast(&closed, true) {
            log::error!("failed to announce close of {script_id}: {e}");
        }
        self.shared
            .scripts
            .write()
            .await
            .insert(script_id, room.document.text());
        let count = rooms.len();
        drop(rooms);

        self.shared.stats.write().await.active_sessions = count;
        log::info!("session for script {script_id} closed by server");
        true
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.shared.config.bind_addr).await
    }

    /// Start listening for WebSocket connections on the configured address.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<ServerShared>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection::new(addr);
        let result = Self::serve_connection(&shared, &mut conn, ws_stream).await;

        Self::leave(&shared, &mut conn).await;
        shared.stats.write().await.active_connections -= 1;
        result
    }

    async fn serve_connection(
        shared: &ServerShared,
        conn: &mut Connection,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                biased;

                // Outgoing broadcast frame
                frame = async {
                    match conn.broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not in a session yet: wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            if frame.delivers_to(conn.member_id()) {
                                ws_sender.send(WsMessage::Binary(frame.bytes.clone().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Member {} lagged by {n} frames", conn.member_id());
                            if let Some(script_id) = conn.script_id {
                                let rooms = shared.rooms.read().await;
                                if let Some(room) = rooms.get(&script_id) {
                                    room.broadcast.record_dropped(n);
                                }
                            }
                        }
                        Err(RecvError::Closed) => conn.detach(),
                    }
                }

                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match Envelope::decode(&bytes) {
                                Ok(envelope) => {
                                    for reply in Self::handle_envelope(shared, conn, envelope).await? {
                                        ws_sender.send(WsMessage::Binary(reply.into())).await?;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {}: {e}", conn.addr);
                                }
                            }
                        }

                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection closed from {}", conn.addr);
                            break;
                        }

                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", conn.addr);
                            break;
                        }

                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Handle one client message. Returns the encoded frames to send back
    /// to this connection, in order.
    async fn handle_envelope(
        shared: &ServerShared,
        conn: &mut Connection,
        envelope: Envelope,
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let mut out = Vec::new();
        let script_id = envelope.script_id;

        match envelope.message {
            Message::JoinSession { member, .. } => {
                Self::join(shared, conn, script_id, member, &mut out).await?;
            }
            Message::RejoinSession { member, state } => {
                log::info!("{} rejoining script {script_id} from state {state}", member.name);
                Self::join(shared, conn, script_id, member, &mut out).await?;
            }
            Message::LeaveSession => Self::leave(shared, conn).await,

            message if conn.script_id != Some(script_id) => {
                log::debug!(
                    "{:?} for script {script_id} from {} outside its session",
                    message.message_type(),
                    conn.addr
                );
                match message {
                    Message::Edit { .. } | Message::RequestSync | Message::GetScriptText => {
                        out.push(Envelope::from_server(script_id, Message::SessionClosed).encode()?);
                    }
                    Message::CheckSessionStatus { .. } => {
                        let status = Message::SessionStatus { active: false, state: 0 };
                        out.push(Envelope::from_server(script_id, status).encode()?);
                    }
                    _ => {}
                }
            }

            Message::Edit { id, state, edit } => {
                let member_id = conn.member_id();
                let mut rooms = shared.rooms.write().await;
                let Some(room) = rooms.get_mut(&script_id) else {
                    conn.detach();
                    out.push(Envelope::from_server(script_id, Message::SessionClosed).encode()?);
                    return Ok(out);
                };

                match room.document.apply_edit(state, edit) {
                    Ok((applied_at, operation)) => {
                        log::trace!("edit {id} from {member_id} applied at state {applied_at}");
                        let echo = Envelope::new(
                            script_id,
                            member_id,
                            Message::Edit {
                                id,
                                state: applied_at,
                                edit: operation,
                            },
                        );
                        room.broadcast.broadcast(&echo, true)?;
                        drop(rooms);
                        shared.stats.write().await.edits_applied += 1;
                    }
                    Err(e) => {
                        log::warn!("Rejecting edit {id} from {member_id}: {e}");
                        let (state, script_text) = room.document.snapshot();
                        conn.drain_pending(&mut out);
                        drop(rooms);
                        let reply = Message::SyncError { state, script_text };
                        out.push(Envelope::from_server(script_id, reply).encode()?);
                        shared.stats.write().await.edits_rejected += 1;
                    }
                }
            }

            Message::RequestSync => {
                let reply = match Self::snapshot(shared, conn, script_id, &mut out).await {
                    Some((state, script_text)) => Message::SyncToSession { state, script_text },
                    None => Message::SessionClosed,
                };
                out.push(Envelope::from_server(script_id, reply).encode()?);
            }

            Message::CheckSessionStatus { state: client_state } => {
                let reply = match Self::snapshot(shared, conn, script_id, &mut out).await {
                    Some((state, _)) => {
                        if state != client_state {
                            log::debug!("status probe at {client_state}, server at {state}");
                        }
                        Message::SessionStatus { active: true, state }
                    }
                    None => Message::SessionStatus { active: false, state: 0 },
                };
                out.push(Envelope::from_server(script_id, reply).encode()?);
            }

            Message::GetScriptText => {
                let reply = match Self::snapshot(shared, conn, script_id, &mut out).await {
                    Some((state, script_text)) => Message::ScriptText { state, script_text },
                    None => Message::SessionClosed,
                };
                out.push(Envelope::from_server(script_id, reply).encode()?);
            }

            message @ (Message::CursorPosition { .. } | Message::Select { .. }) => {
                let relay = Envelope::new(script_id, conn.member_id(), message);
                let rooms = shared.rooms.read().await;
                if let Some(room) = rooms.get(&script_id) {
                    room.broadcast.broadcast(&relay, false)?;
                }
            }

            message => {
                log::debug!(
                    "Unhandled {:?} from {}",
                    message.message_type(),
                    conn.addr
                );
            }
        }

        Ok(out)
    }

    /// Snapshot the connection's room, flushing queued frames first.
    async fn snapshot(
        shared: &ServerShared,
        conn: &mut Connection,
        script_id: Uuid,
        out: &mut Vec<Vec<u8>>,
    ) -> Option<(u64, String)> {
        let rooms = shared.rooms.read().await;
        let snapshot = rooms.get(&script_id).map(|room| room.document.snapshot());
        conn.drain_pending(out);
        drop(rooms);
        if snapshot.is_none() {
            conn.detach();
        }
        snapshot
    }

    async fn join(
        shared: &ServerShared,
        conn: &mut Connection,
        script_id: Uuid,
        member: PeerInfo,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<(), ProtocolError> {
        if conn.script_id.is_some() && conn.script_id != Some(script_id) {
            Self::leave(shared, conn).await;
        }
        let config = &shared.config;
        let seed = shared.scripts.read().await.get(&script_id).cloned();

        let mut rooms = shared.rooms.write().await;
        let rejoining = conn.script_id == Some(script_id) && rooms.contains_key(&script_id);
        if !rejoining {
            conn.detach();
        }
        let full = match rooms.get(&script_id) {
            Some(room) => {
                !rejoining && room.broadcast.member_count().await >= config.max_members_per_session
            }
            None => rooms.len() >= config.max_sessions,
        };
        if full {
            drop(rooms);
            log::warn!("Refusing {} on script {script_id}: sessions full", member.name);
            out.push(Envelope::from_server(script_id, Message::SessionsFull).encode()?);
            return Ok(());
        }

        let room = rooms.entry(script_id).or_insert_with(|| {
            log::info!("Opening session for script {script_id}");
            SessionRoom::new(seed.as_deref().unwrap_or_default(), config)
        });

        let member_id = member.peer_id;
        let active_members: Vec<PeerInfo> = room
            .broadcast
            .members()
            .await
            .into_iter()
            .filter(|m| m.peer_id != member_id)
            .collect();

        if rejoining {
            conn.member = Some(member.clone());
            conn.drain_pending(out);
        } else {
            conn.broadcast_rx = Some(room.broadcast.add_member(member.clone()).await);
            let joined = Envelope::new(
                script_id,
                member_id,
                Message::MemberJoinedSession {
                    member: member.clone(),
                },
            );
            room.broadcast.broadcast(&joined, false)?;
        }

        let (state, script_text) = room.document.snapshot();
        let session_count = rooms.len();
        drop(rooms);

        log::info!(
            "{} ({member_id}) joined script {script_id} at state {state}",
            member.name
        );
        conn.member = Some(member);
        conn.script_id = Some(script_id);
        shared.stats.write().await.active_sessions = session_count;

        let reply = Message::JoinedSession {
            state,
            script_text,
            active_members,
        };
        out.push(Envelope::from_server(script_id, reply).encode()?);
        Ok(())
    }

    async fn leave(shared: &ServerShared, conn: &mut Connection) {
        let member_id = conn.member_id();
        let script_id = conn.script_id.take();
        conn.broadcast_rx = None;
        let Some(script_id) = script_id else {
            return;
        };

        let mut rooms = shared.rooms.write().await;
        if let Some(room) = rooms.get_mut(&script_id) {
            room.broadcast.remove_member(&member_id).await;
            let left = Envelope::new(
                script_id,
                member_id,
                Message::MemberLeftSession { member: member_id },
            );
            if let Err(e) = room.broadcast.broadcast(&left, false) {
                log::error!("Failed to announce departure of {member_id}: {e}");
            }
            log::info!("Member {member_id} left script {script_id}");

            // Remove empty sessions, keeping their text
            if room.broadcast.member_count().await == 0 {
                if let Some(room) = rooms.remove(&script_id) {
                    shared
                        .scripts
                        .write()
                        .await
                        .insert(script_id, room.document.text());
                    log::info!("Session for script {script_id} removed (empty)");
                }
            }
        }
        let session_count = rooms.len();
        drop(rooms);
        shared.stats.write().await.active_sessions = session_count;
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}
