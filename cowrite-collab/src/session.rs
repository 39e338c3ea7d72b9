//! Client session protocol: join, edit exchange, rejoin and resync.
//!
//! [`Session`] is a plain state machine. It never touches a socket or a
//! clock: incoming frames go in through [`Session::handle_envelope`], time
//! goes in as an explicit `now`, and everything it wants to say comes back
//! out of [`Session::poll_outgoing`] and [`Session::poll_event`]. The async
//! [`SyncClient`](crate::client::SyncClient) wires it to a WebSocket; tests
//! drive it by hand.
//!
//! ```text
//!            JoinedSession                      fault
//!  Joining ────────────────► Active ─────────────────────► Rejoining
//!     │                        ▲  ▲                           │
//!     │ SessionsFull           │  └─── JoinedSession ─────────┘
//!     ▼                        │
//!   Closed ◄──── leave ────────┘
//! ```
//!
//! Every recovery path ends with the server's text replacing the local one.
//! Faults are reported as [`SessionEvent::Synchronizing`]; nothing is
//! returned to the caller as an error except misuse.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use cowrite_core::{DocumentAdapter, DocumentError, Operation};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::{Roster, Selection};
use crate::protocol::{EditId, Envelope, Message, MessageType, PeerInfo, ProtocolError};
use crate::sync::{EchoOutcome, PendingEdit, SyncState, DEFAULT_HISTORY_LIMIT};
use crate::timer::Timers;

/// Client-side timing configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long the in-flight edit may wait for its echo.
    pub edit_timeout: Duration,
    /// Deadline for join, status, resync and text probe answers.
    pub sync_timeout: Duration,
    /// Quiet period after the buffer drains before the drift check runs.
    pub drift_check_delay: Duration,
    /// Applied operations kept in the sync history.
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            edit_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(5),
            drift_check_delay: Duration::from_secs(5),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Joining,
    Active,
    Rejoining,
    Closed,
}

/// Reasons the session abandons its incremental state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncFault {
    #[error("edit {edit} was not acknowledged in time")]
    AckTimeout { edit: EditId },
    #[error("state mismatch: expected {expected}, server reported {actual}")]
    StateMismatch { expected: u64, actual: u64 },
    #[error("server could not reconcile a local edit")]
    ServerSyncError,
    #[error("local text drifted from the server copy")]
    DriftDetected,
    #[error("status mismatch: local state {local}, server state {server}")]
    StatusMismatch { local: u64, server: u64 },
    #[error("server session is no longer active")]
    SessionInactive,
    #[error("remote edit at state {remote} cannot follow local state {local}")]
    UnexplainedState { local: u64, remote: u64 },
    #[error("no answer to a resync request")]
    ResyncTimeout,
    #[error("remote edit does not fit the local document: {0}")]
    Document(#[from] DocumentError),
}

/// Caller misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is not active")]
    NotActive,
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Notifications for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Baseline received; the document holds the server's text.
    Joined { state: u64, members: Vec<PeerInfo> },
    /// A remote edit was applied to the document.
    RemoteEdit { operation: Operation, state: u64 },
    /// The server applied one of our edits.
    Acknowledged { id: EditId, state: u64 },
    /// Recovery started; `discarded` local edits were dropped.
    Synchronizing { fault: SyncFault, discarded: usize },
    /// The document was replaced with the server's text.
    Resynced { state: u64, discarded: usize },
    /// No answer arrived for the named request.
    FailedToSynchronize { waiting_for: MessageType },
    SessionsFull,
    SessionClosed,
    MemberJoined(PeerInfo),
    MemberLeft(Uuid),
    CursorMoved { member: Uuid, position: usize },
    SelectionChanged { member: Uuid, selection: Selection },
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    EditAck(EditId),
    Handshake,
    Status,
    Resync,
    TextProbe,
    DriftCheck,
}

/// One client's view of one script's editing session.
pub struct Session<D> {
    config: SessionConfig,
    script_id: Uuid,
    local: PeerInfo,
    phase: SessionPhase,
    sync: SyncState,
    document: D,
    roster: Roster,
    timers: Timers<TimerKey>,
    remote_active: bool,
    resync_pending: bool,
    outbox: VecDeque<Envelope>,
    events: VecDeque<SessionEvent>,
}

impl<D: DocumentAdapter> Session<D> {
    /// Start joining `script_id`. The join request is waiting in the outbox.
    pub fn open(config: SessionConfig, script_id: Uuid, local: PeerInfo, document: D, now: Instant) -> Self {
        let mut session = Self {
            sync: SyncState::with_history_limit(0, config.history_limit),
            roster: Roster::new(local.peer_id),
            config,
            script_id,
            local,
            phase: SessionPhase::Joining,
            document,
            timers: Timers::new(),
            remote_active: false,
            resync_pending: false,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        };
        log::info!("{} joining script {script_id}", session.local.name);
        session.send_handshake(now);
        session
    }

    // ─── incoming ────────────────────────────────────────────────

    /// Process one frame from the server.
    pub fn handle_envelope(&mut self, envelope: Envelope, now: Instant) {
        if envelope.script_id != self.script_id {
            log::debug!(
                "ignoring {:?} for script {} (session is {})",
                envelope.message_type(),
                envelope.script_id,
                self.script_id
            );
            return;
        }
        if self.phase == SessionPhase::Closed {
            return;
        }

        let sender = envelope.sender;
        match envelope.message {
            Message::JoinedSession {
                state,
                script_text,
                active_members,
            } => self.on_joined(state, &script_text, active_members),
            Message::SessionsFull => {
                log::warn!("script {} is full", self.script_id);
                self.close();
                self.events.push_back(SessionEvent::SessionsFull);
            }
            Message::Edit { id, state, edit } => self.on_edit(id, state, edit, now),
            Message::SyncToSession { state, script_text } => {
                self.adopt_server_text(state, &script_text);
            }
            Message::SyncError { state, script_text } => {
                let fault = SyncFault::ServerSyncError;
                log::warn!("{fault}");
                self.events.push_back(SessionEvent::Synchronizing {
                    fault,
                    discarded: self.sync.pending_len(),
                });
                self.adopt_server_text(state, &script_text);
            }
            Message::SessionStatus { active, state } => self.on_status(active, state, now),
            Message::ScriptText { state, script_text } => self.on_script_text(state, &script_text, now),
            Message::CursorPosition { position, .. } => {
                if sender != self.local.peer_id {
                    self.roster.set_cursor(sender, position);
                    self.events.push_back(SessionEvent::CursorMoved {
                        member: sender,
                        position,
                    });
                }
            }
            Message::Select { start, end, .. } => {
                if sender != self.local.peer_id {
                    let selection = Selection::new(start, end);
                    self.roster.set_selection(sender, selection);
                    self.events.push_back(SessionEvent::SelectionChanged {
                        member: sender,
                        selection,
                    });
                }
            }
            Message::MemberJoinedSession { member } => {
                if member.peer_id != self.local.peer_id {
                    log::info!("{} joined script {}", member.name, self.script_id);
                    self.roster.join(member.clone());
                    self.events.push_back(SessionEvent::MemberJoined(member));
                }
            }
            Message::MemberLeftSession { member } => {
                if self.roster.leave(&member) {
                    self.events.push_back(SessionEvent::MemberLeft(member));
                }
            }
            Message::SessionClosed => {
                log::info!("server closed script {}", self.script_id);
                self.remote_active = false;
                self.roster.mark_all_inactive();
                self.timers.retain(|key| matches!(key, TimerKey::EditAck(_)));
                self.events.push_back(SessionEvent::SessionClosed);
            }
            request @ (Message::JoinSession { .. }
            | Message::RejoinSession { .. }
            | Message::LeaveSession
            | Message::RequestSync
            | Message::CheckSessionStatus { .. }
            | Message::GetScriptText) => {
                log::debug!("ignoring server-bound {:?} from {sender}", request.message_type());
            }
        }
    }

    fn on_joined(&mut self, state: u64, script_text: &str, members: Vec<PeerInfo>) {
        self.document.replace_text(script_text);
        self.sync.rebaseline(state);
        self.timers.clear();
        self.roster.set_active_members(&members);
        self.phase = SessionPhase::Active;
        self.remote_active = true;
        self.resync_pending = false;
        log::info!(
            "{} joined script {} at state {state} with {} members",
            self.local.name,
            self.script_id,
            members.len()
        );
        self.events.push_back(SessionEvent::Joined { state, members });
    }

    fn on_edit(&mut self, id: EditId, state: u64, edit: Operation, now: Instant) {
        // The remote edit is about to land in the document; anything the
        // user typed must be in the buffer first so it gets transformed.
        self.submit_uncaptured(now);
        if self.phase != SessionPhase::Active || self.resync_pending {
            log::trace!("discarding edit at state {state} while synchronizing");
            return;
        }

        match self.sync.handle_echo(id, state, edit) {
            EchoOutcome::Acknowledged { id, next } => {
                self.timers.cancel(&TimerKey::EditAck(id));
                self.events.push_back(SessionEvent::Acknowledged {
                    id,
                    state: self.sync.state(),
                });
                match next {
                    Some(next) => self.transmit(next, now),
                    None => self.schedule_drift_check(now),
                }
            }
            EchoOutcome::StateMismatch { expected, actual } => {
                self.rejoin_with(SyncFault::StateMismatch { expected, actual }, now);
            }
            EchoOutcome::Remote(operation) => match self.document.apply_operation(&operation) {
                Ok(()) => {
                    self.roster.adjust(&operation);
                    self.events.push_back(SessionEvent::RemoteEdit {
                        operation,
                        state: self.sync.state(),
                    });
                    if self.sync.synchronized() {
                        self.schedule_drift_check(now);
                    }
                }
                Err(err) => self.rejoin_with(SyncFault::Document(err), now),
            },
            EchoOutcome::Unexplained { local, remote } => {
                let fault = SyncFault::UnexplainedState { local, remote };
                log::warn!("{fault}");
                self.events.push_back(SessionEvent::Synchronizing { fault, discarded: 0 });
                self.request_sync(now);
            }
        }
    }

    fn on_status(&mut self, active: bool, state: u64, now: Instant) {
        self.timers.cancel(&TimerKey::Status);
        if self.phase != SessionPhase::Active {
            return;
        }
        if !active {
            self.remote_active = false;
            self.rejoin_with(SyncFault::SessionInactive, now);
        } else if self.sync.synchronized() && state != self.sync.state() {
            self.rejoin_with(
                SyncFault::StatusMismatch {
                    local: self.sync.state(),
                    server: state,
                },
                now,
            );
        } else {
            log::debug!("session status ok at state {state}");
        }
    }

    fn on_script_text(&mut self, state: u64, script_text: &str, now: Instant) {
        self.timers.cancel(&TimerKey::TextProbe);
        self.submit_uncaptured(now);
        // Only comparable when nothing is in flight and both sides agree on
        // the state.
        if self.phase != SessionPhase::Active
            || self.resync_pending
            || !self.sync.synchronized()
            || state != self.sync.state()
        {
            log::trace!("discarding text probe for state {state}");
            return;
        }
        if self.document.text() != script_text {
            self.rejoin_with(SyncFault::DriftDetected, now);
        } else {
            log::debug!("drift check passed at state {state}");
        }
    }

    // ─── local edits ─────────────────────────────────────────────

    /// Submit an edit the user already made to the document.
    pub fn local_edit(&mut self, operation: Operation, now: Instant) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Active {
            return Err(SessionError::NotActive);
        }
        if operation.is_noop() {
            return Ok(());
        }
        if !self.remote_active {
            // The server dropped the session; the rejoin baseline replaces
            // this edit.
            self.rejoin_with(SyncFault::SessionInactive, now);
            return Ok(());
        }

        self.timers.cancel(&TimerKey::DriftCheck);
        let transmit = self.sync.push_local(operation);
        if let Some(edit) = transmit {
            if !self.resync_pending {
                self.transmit(edit, now);
            }
        }
        Ok(())
    }

    /// Apply `operation` to the document and submit it.
    pub fn apply_local_edit(&mut self, operation: Operation, now: Instant) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Active {
            return Err(SessionError::NotActive);
        }
        self.document.apply_operation(&operation)?;
        let position = operation.adjust_index(self.roster.local_cursor());
        self.roster.set_local_cursor(position);
        self.local_edit(operation, now)
    }

    /// Pull the user's edits out of the document and submit them. Returns
    /// whether there was anything to submit.
    pub fn capture_local_edits(&mut self, now: Instant) -> Result<bool, SessionError> {
        if self.phase != SessionPhase::Active {
            return Err(SessionError::NotActive);
        }
        match self.document.capture_local_edit() {
            Some(operation) => self.local_edit(operation, now).map(|()| true),
            None => Ok(false),
        }
    }

    /// Move edits the user made directly in the document into the buffer.
    fn submit_uncaptured(&mut self, now: Instant) {
        if self.phase != SessionPhase::Active {
            return;
        }
        if let Some(operation) = self.document.capture_local_edit() {
            log::trace!("submitting uncaptured local edit {operation}");
            if let Err(err) = self.local_edit(operation, now) {
                log::warn!("dropping uncaptured local edit: {err}");
            }
        }
    }

    fn transmit(&mut self, edit: PendingEdit, now: Instant) {
        log::trace!("sending edit {} at state {}", edit.id, edit.state);
        self.timers
            .schedule(TimerKey::EditAck(edit.id), now, self.config.edit_timeout);
        self.send(Message::Edit {
            id: edit.id,
            state: edit.state,
            edit: edit.operation,
        });
    }

    // ─── presence ────────────────────────────────────────────────

    pub fn move_cursor(&mut self, position: usize) {
        self.roster.set_local_cursor(position);
        if self.phase == SessionPhase::Active {
            self.send(Message::CursorPosition {
                position,
                state: self.sync.state(),
            });
        }
    }

    pub fn select(&mut self, start: usize, end: usize) {
        self.roster.set_local_selection(Some(Selection::new(start, end)));
        if self.phase == SessionPhase::Active {
            self.send(Message::Select {
                start,
                end,
                state: self.sync.state(),
            });
        }
    }

    // ─── timers and recovery ─────────────────────────────────────

    /// Earliest instant at which [`Session::handle_timeout`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        for key in self.timers.expire(now) {
            match key {
                TimerKey::EditAck(edit) => {
                    if self.sync.awaiting() == Some(edit) {
                        self.rejoin_with(SyncFault::AckTimeout { edit }, now);
                    }
                }
                TimerKey::Handshake => {
                    let waiting_for = match self.phase {
                        SessionPhase::Joining => MessageType::JoinSession,
                        SessionPhase::Rejoining => MessageType::RejoinSession,
                        SessionPhase::Active | SessionPhase::Closed => continue,
                    };
                    log::warn!("no answer to {waiting_for:?}, retrying");
                    self.events
                        .push_back(SessionEvent::FailedToSynchronize { waiting_for });
                    self.send_handshake(now);
                }
                TimerKey::Status => {
                    self.events.push_back(SessionEvent::FailedToSynchronize {
                        waiting_for: MessageType::CheckSessionStatus,
                    });
                }
                TimerKey::Resync => {
                    self.resync_pending = false;
                    self.rejoin_with(SyncFault::ResyncTimeout, now);
                }
                TimerKey::TextProbe => {
                    self.events.push_back(SessionEvent::FailedToSynchronize {
                        waiting_for: MessageType::GetScriptText,
                    });
                }
                TimerKey::DriftCheck => {
                    self.submit_uncaptured(now);
                    if self.phase == SessionPhase::Active
                        && self.remote_active
                        && !self.resync_pending
                        && self.sync.synchronized()
                    {
                        log::trace!("drift check at state {}", self.sync.state());
                        self.send(Message::GetScriptText);
                        self.timers
                            .schedule(TimerKey::TextProbe, now, self.config.sync_timeout);
                    }
                }
            }
        }
    }

    fn schedule_drift_check(&mut self, now: Instant) {
        self.timers
            .schedule(TimerKey::DriftCheck, now, self.config.drift_check_delay);
    }

    /// Ask the server whether the session is alive and at our state.
    pub fn check_session_status(&mut self, now: Instant) {
        if self.phase != SessionPhase::Active {
            return;
        }
        self.send(Message::CheckSessionStatus {
            state: self.sync.state(),
        });
        self.timers
            .schedule(TimerKey::Status, now, self.config.sync_timeout);
    }

    /// Ask for the authoritative text. Edits are discarded until it arrives.
    pub fn request_sync(&mut self, now: Instant) {
        if self.phase != SessionPhase::Active || self.resync_pending {
            return;
        }
        self.resync_pending = true;
        self.timers.retain(|key| !matches!(key, TimerKey::EditAck(_)));
        self.send(Message::RequestSync);
        self.timers
            .schedule(TimerKey::Resync, now, self.config.sync_timeout);
    }

    /// Drop all unacknowledged state and re-handshake with the server.
    /// Returns how many local edits were discarded.
    pub fn rejoin(&mut self, now: Instant) -> usize {
        if self.phase == SessionPhase::Closed {
            return 0;
        }
        let discarded = self.sync.discard_pending();
        self.timers.clear();
        self.roster.mark_all_inactive();
        self.phase = SessionPhase::Rejoining;
        self.resync_pending = false;
        log::info!(
            "{} rejoining script {} from state {} ({discarded} edits discarded)",
            self.local.name,
            self.script_id,
            self.sync.state()
        );
        self.send_handshake(now);
        discarded
    }

    fn rejoin_with(&mut self, fault: SyncFault, now: Instant) {
        log::warn!("{fault}; rejoining script {}", self.script_id);
        let discarded = self.rejoin(now);
        self.events
            .push_back(SessionEvent::Synchronizing { fault, discarded });
    }

    fn adopt_server_text(&mut self, state: u64, script_text: &str) {
        self.document.replace_text(script_text);
        let discarded = self.sync.rebaseline(state);
        self.timers.clear();
        self.phase = SessionPhase::Active;
        self.remote_active = true;
        self.resync_pending = false;
        log::info!("resynced script {} to state {state}", self.script_id);
        self.events
            .push_back(SessionEvent::Resynced { state, discarded });
    }

    fn send_handshake(&mut self, now: Instant) {
        let member = self.local.clone();
        let state = self.sync.state();
        let message = match self.phase {
            SessionPhase::Joining => Message::JoinSession { member, state },
            _ => Message::RejoinSession { member, state },
        };
        self.send(message);
        self.timers
            .schedule(TimerKey::Handshake, now, self.config.sync_timeout);
    }

    /// Leave the session. Unacknowledged edits are lost.
    pub fn leave(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        log::info!("{} leaving script {}", self.local.name, self.script_id);
        self.send(Message::LeaveSession);
        self.close();
        self.events.push_back(SessionEvent::Left);
    }

    fn close(&mut self) {
        self.sync.discard_pending();
        self.timers.clear();
        self.phase = SessionPhase::Closed;
        self.remote_active = false;
        self.resync_pending = false;
    }

    fn send(&mut self, message: Message) {
        self.outbox
            .push_back(Envelope::new(self.script_id, self.local.peer_id, message));
    }

    // ─── output and accessors ────────────────────────────────────

    pub fn poll_outgoing(&mut self) -> Option<Envelope> {
        self.outbox.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn state(&self) -> u64 {
        self.sync.state()
    }

    pub fn synchronized(&self) -> bool {
        self.sync.synchronized()
    }

    pub fn pending_len(&self) -> usize {
        self.sync.pending_len()
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    pub fn is_remote_active(&self) -> bool {
        self.remote_active
    }

    pub fn is_resyncing(&self) -> bool {
        self.resync_pending
    }

    pub fn script_id(&self) -> Uuid {
        self.script_id
    }

    pub fn local(&self) -> &PeerInfo {
        &self.local
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn document(&self) -> &D {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut D {
        &mut self.document
    }
}
