//! Local edit buffer and the client half of the state counter.
//!
//! ```text
//!                 push_local                 handle_echo(own id)
//!  Synchronized ─────────────► Pending ────────────────────────► Pending
//!       ▲                         │      (head popped, next sent)   │
//!       │                         │                                  │
//!       └─────────────────────────┴──────────────────────────────────┘
//!                       handle_echo(own id), buffer empty
//! ```
//!
//! Only the head of the buffer is ever in flight. Edits behind it wait with
//! a provisional state of `state + position`, and every remote edit that
//! arrives in the meantime is threaded through the whole buffer so the
//! waiting edits stay relative to the client's view of the server document.

use std::collections::{BTreeMap, VecDeque};

use cowrite_core::{transform, Operation};
use uuid::Uuid;

use crate::protocol::EditId;

/// Default number of applied operations kept for inspection.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// A local edit not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdit {
    pub id: EditId,
    /// Server state this edit is relative to.
    pub state: u64,
    pub operation: Operation,
}

/// What an `Edit` echoed by the server means for the buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum EchoOutcome {
    /// The in-flight edit was applied by the server. `next` is the new
    /// head, which must be transmitted now.
    Acknowledged {
        id: EditId,
        next: Option<PendingEdit>,
    },
    /// The acknowledgment or the promoted head disagrees with the local
    /// counter.
    StateMismatch { expected: u64, actual: u64 },
    /// Another member's edit, transformed against every buffered edit and
    /// ready to apply to the local document.
    Remote(Operation),
    /// A remote edit at a state this client cannot explain.
    Unexplained { local: u64, remote: u64 },
}

/// Per-session sync bookkeeping.
#[derive(Debug, Clone)]
pub struct SyncState {
    state: u64,
    buffer: VecDeque<PendingEdit>,
    history: BTreeMap<u64, Operation>,
    history_limit: usize,
}

impl SyncState {
    pub fn new(state: u64) -> Self {
        Self::with_history_limit(state, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(state: u64, history_limit: usize) -> Self {
        Self {
            state,
            buffer: VecDeque::new(),
            history: BTreeMap::new(),
            history_limit,
        }
    }

    pub fn state(&self) -> u64 {
        self.state
    }

    /// True iff no local edit awaits acknowledgment.
    pub fn synchronized(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Correlation id of the in-flight edit.
    pub fn awaiting(&self) -> Option<EditId> {
        self.buffer.front().map(|edit| edit.id)
    }

    pub fn buffer(&self) -> impl Iterator<Item = &PendingEdit> {
        self.buffer.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Operations applied at each recent state.
    pub fn history(&self) -> &BTreeMap<u64, Operation> {
        &self.history
    }

    /// Queue a local edit. Returns the edit to transmit when it became the
    /// head of an empty buffer.
    pub fn push_local(&mut self, operation: Operation) -> Option<PendingEdit> {
        let edit = PendingEdit {
            id: Uuid::new_v4(),
            state: self.state + self.buffer.len() as u64,
            operation,
        };
        let transmit = self.buffer.is_empty();
        log::trace!(
            "buffering local edit {} at provisional state {} ({} pending)",
            edit.id,
            edit.state,
            self.buffer.len()
        );
        self.buffer.push_back(edit.clone());
        transmit.then_some(edit)
    }

    /// Process an `Edit` echoed by the server at `state`.
    pub fn handle_echo(&mut self, id: EditId, state: u64, operation: Operation) -> EchoOutcome {
        if self.awaiting() == Some(id) {
            return self.acknowledge(id, state, operation);
        }

        if state != self.state {
            return EchoOutcome::Unexplained {
                local: self.state,
                remote: state,
            };
        }

        if !self.buffer.is_empty() {
            log::debug!(
                "adjusting {} buffered edits for remote edit at state {state}",
                self.buffer.len()
            );
        }
        self.record(state, operation.clone());

        let mut remote = operation;
        for pending in self.buffer.iter_mut() {
            let (next, local) = transform(&remote, &pending.operation);
            pending.operation = local;
            pending.state += 1;
            remote = next;
        }
        self.state += 1;
        EchoOutcome::Remote(remote)
    }

    fn acknowledge(&mut self, id: EditId, state: u64, operation: Operation) -> EchoOutcome {
        if state != self.state {
            return EchoOutcome::StateMismatch {
                expected: self.state,
                actual: state,
            };
        }

        self.buffer.pop_front();
        self.record(state, operation);
        self.state += 1;
        log::debug!("client -> server in sync: {}", self.state);

        let next = self.buffer.front().cloned();
        if let Some(head) = &next {
            if head.state != self.state {
                return EchoOutcome::StateMismatch {
                    expected: self.state,
                    actual: head.state,
                };
            }
        }
        EchoOutcome::Acknowledged { id, next }
    }

    fn record(&mut self, state: u64, operation: Operation) {
        self.history.insert(state, operation);
        while self.history.len() > self.history_limit {
            self.history.pop_first();
        }
    }

    /// Drop every unacknowledged edit and the history, adopting `state`.
    /// Returns how many local edits were discarded.
    pub fn rebaseline(&mut self, state: u64) -> usize {
        let discarded = self.discard_pending();
        self.state = state;
        discarded
    }

    /// Drop the buffer and history but keep the counter.
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.history.clear();
        discarded
    }
}
