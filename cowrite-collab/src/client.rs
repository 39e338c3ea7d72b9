//! WebSocket sync client for editing one script with the server.
//!
//! A background task owns the [`Session`] and the socket. The application
//! talks to it through [`SyncClient`] and receives [`SyncEvent`]s on the
//! channel returned by [`SyncClient::connect`].

use std::time::Instant;

use cowrite_core::{DocumentAdapter, Operation};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::protocol::{Envelope, PeerInfo, ProtocolError};
use crate::session::{Session, SessionConfig, SessionError, SessionEvent, SessionPhase};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established, join request sent
    Connected,
    Session(SessionEvent),
    /// Connection lost or closed
    Disconnected,
}

/// Point-in-time view of the client's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub text: String,
    pub state: u64,
    pub synchronized: bool,
    pub phase: SessionPhase,
    pub pending_edits: usize,
    pub active_members: usize,
}

enum ClientCommand {
    Edit {
        operation: Operation,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    MoveCursor(usize),
    Select {
        start: usize,
        end: usize,
    },
    CheckStatus,
    RequestSync,
    Snapshot(oneshot::Sender<ClientSnapshot>),
    Leave,
}

/// Handle to a running client session.
pub struct SyncClient {
    peer_info: PeerInfo,
    script_id: Uuid,
    commands: mpsc::Sender<ClientCommand>,
    task: JoinHandle<()>,
}

impl SyncClient {
    /// Connect to `url` and start joining `script_id` with `document` as the
    /// local copy.
    pub async fn connect<D>(
        url: &str,
        script_id: Uuid,
        peer_info: PeerInfo,
        document: D,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SyncEvent>), ProtocolError>
    where
        D: DocumentAdapter + Send + 'static,
    {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            log::warn!("Failed to connect to {url}: {e}");
            ProtocolError::ConnectionClosed
        })?;
        log::info!("{} connected to {url}", peer_info.name);

        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(256);
        let session = Session::open(config, script_id, peer_info.clone(), document, Instant::now());

        let _ = event_tx.send(SyncEvent::Connected).await;
        let task = tokio::spawn(run_session(session, ws_stream, command_rx, event_tx));

        Ok((
            Self {
                peer_info,
                script_id,
                commands: command_tx,
                task,
            },
            event_rx,
        ))
    }

    /// Apply an edit to the local document and submit it.
    pub async fn edit(&self, operation: Operation) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(ClientCommand::Edit { operation, reply }).await?;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    pub async fn move_cursor(&self, position: usize) -> Result<(), SessionError> {
        self.command(ClientCommand::MoveCursor(position)).await
    }

    pub async fn select(&self, start: usize, end: usize) -> Result<(), SessionError> {
        self.command(ClientCommand::Select { start, end }).await
    }

    /// Ask the server whether the session is alive and at our state.
    pub async fn check_status(&self) -> Result<(), SessionError> {
        self.command(ClientCommand::CheckStatus).await
    }

    /// Ask the server for a full baseline.
    pub async fn request_sync(&self) -> Result<(), SessionError> {
        self.command(ClientCommand::RequestSync).await
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(ClientCommand::Snapshot(reply)).await?;
        Ok(rx.await.map_err(|_| ProtocolError::ConnectionClosed)?)
    }

    /// Current local text.
    pub async fn text(&self) -> Result<String, SessionError> {
        Ok(self.snapshot().await?.text)
    }

    /// Leave the session and close the connection.
    pub async fn leave(self) -> Result<(), SessionError> {
        self.command(ClientCommand::Leave).await?;
        let _ = self.task.await;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Get our peer info.
    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn script_id(&self) -> Uuid {
        self.script_id
    }

    async fn command(&self, command: ClientCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Protocol(ProtocolError::ConnectionClosed))
    }
}

async fn run_session<D: DocumentAdapter>(
    mut session: Session<D>,
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut commands: mpsc::Receiver<ClientCommand>,
    events: mpsc::Sender<SyncEvent>,
) {
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    loop {
        if !flush(&mut session, &mut ws_writer, &events).await {
            break;
        }

        let deadline = session.next_deadline();
        tokio::select! {
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match Envelope::decode(&bytes) {
                            Ok(envelope) => session.handle_envelope(envelope, Instant::now()),
                            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            command = commands.recv() => {
                let now = Instant::now();
                match command {
                    Some(ClientCommand::Edit { operation, reply }) => {
                        let _ = reply.send(session.apply_local_edit(operation, now));
                    }
                    Some(ClientCommand::MoveCursor(position)) => session.move_cursor(position),
                    Some(ClientCommand::Select { start, end }) => session.select(start, end),
                    Some(ClientCommand::CheckStatus) => session.check_session_status(now),
                    Some(ClientCommand::RequestSync) => session.request_sync(now),
                    Some(ClientCommand::Snapshot(reply)) => {
                        let _ = reply.send(ClientSnapshot {
                            text: session.document().text(),
                            state: session.state(),
                            synchronized: session.synchronized(),
                            phase: session.phase(),
                            pending_edits: session.pending_len(),
                            active_members: session.roster().active_count(),
                        });
                    }
                    // Dropping the handle leaves too
                    Some(ClientCommand::Leave) | None => {
                        session.leave();
                        flush(&mut session, &mut ws_writer, &events).await;
                        let _ = ws_writer.close().await;
                        break;
                    }
                }
            }

            _ = sleep_until(deadline) => session.handle_timeout(Instant::now()),
        }
    }

    // Anything the session said on its way out
    while let Some(event) = session.poll_event() {
        let _ = events.send(SyncEvent::Session(event)).await;
    }
    log::info!("{} disconnected from script {}", session.local().name, session.script_id());
    let _ = events.send(SyncEvent::Disconnected).await;
}

/// Send the outbox and forward events. Returns false once the socket is gone.
async fn flush<D: DocumentAdapter>(
    session: &mut Session<D>,
    ws_writer: &mut WsWriter,
    events: &mpsc::Sender<SyncEvent>,
) -> bool {
    while let Some(envelope) = session.poll_outgoing() {
        match envelope.encode() {
            Ok(bytes) => {
                if let Err(e) = ws_writer.send(WsMessage::Binary(bytes.into())).await {
                    log::warn!("Failed to send {:?}: {e}", envelope.message_type());
                    return false;
                }
            }
            Err(e) => log::error!("Failed to encode {:?}: {e}", envelope.message_type()),
        }
    }
    while let Some(event) = session.poll_event() {
        // The application may have dropped its receiver; keep editing anyway
        let _ = events.send(SyncEvent::Session(event)).await;
    }
    true
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
