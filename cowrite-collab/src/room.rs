//! Authoritative document held by the server for one script.
//!
//! The room serializes every edit into one global order. An edit computed
//! against an older state is transformed against each operation applied
//! since, history first, so the server breaks ties the same way clients do
//! when they transform a remote edit against their buffer.

use std::collections::VecDeque;

use cowrite_core::{check_bounds, transform, DocumentAdapter, DocumentError, Operation, TextBuffer};
use thiserror::Error;

/// Why an edit was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("edit based on state {base} is ahead of the server state {current}")]
    FutureState { base: u64, current: u64 },
    #[error("edit based on state {base} predates the retained history (oldest {oldest})")]
    HistoryTruncated { base: u64, oldest: u64 },
    #[error(transparent)]
    Document(#[from] DocumentError),
}

pub struct DocumentRoom {
    text: TextBuffer,
    state: u64,
    history: VecDeque<Operation>,
    history_limit: usize,
}

impl DocumentRoom {
    pub fn new(text: &str, history_limit: usize) -> Self {
        Self {
            text: TextBuffer::new(text),
            state: 0,
            history: VecDeque::new(),
            history_limit,
        }
    }

    pub fn state(&self) -> u64 {
        self.state
    }

    pub fn text(&self) -> String {
        self.text.text()
    }

    /// Current state and full text.
    pub fn snapshot(&self) -> (u64, String) {
        (self.state, self.text.text())
    }

    /// Oldest state an incoming edit may still be based on.
    pub fn oldest_state(&self) -> u64 {
        self.state - self.history.len() as u64
    }

    /// Apply an edit computed against `base`. Returns the state it was
    /// applied at and the operation as applied.
    pub fn apply_edit(&mut self, base: u64, edit: Operation) -> Result<(u64, Operation), RoomError> {
        if base > self.state {
            return Err(RoomError::FutureState {
                base,
                current: self.state,
            });
        }
        let oldest = self.oldest_state();
        if base < oldest {
            return Err(RoomError::HistoryTruncated { base, oldest });
        }

        let missed = (base - oldest) as usize;
        // Offsets come off the wire; check them against the text the sender
        // saw before any transform arithmetic touches them.
        let since: isize = self.history.iter().skip(missed).map(Operation::len_delta).sum();
        let base_len = (self.text.len_chars() as isize - since) as usize;
        check_bounds(&edit, base_len)?;

        let mut operation = edit;
        for applied in self.history.iter().skip(missed) {
            operation = transform(applied, &operation).1;
        }
        if base < self.state {
            log::debug!(
                "transformed edit from state {base} through {} operations",
                self.state - base
            );
        }

        self.text.apply_operation(&operation)?;
        let applied_at = self.state;
        self.history.push_back(operation.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self.state += 1;
        Ok((applied_at, operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_edits_apply_directly() {
        let mut room = DocumentRoom::new("abc", 16);
        assert_eq!(room.apply_edit(0, Operation::insert(3, "d")).unwrap(), (0, Operation::insert(3, "d")));
        assert_eq!(room.apply_edit(1, Operation::remove(0, 1)).unwrap().0, 1);
        assert_eq!(room.snapshot(), (2, "bcd".to_string()));
    }

    #[test]
    fn test_concurrent_inserts_same_offset() {
        let base = "0123456789";
        let mut room = DocumentRoom::new(base, 16);
        room.apply_edit(0, Operation::insert(5, "abc")).unwrap();
        let (at, applied) = room.apply_edit(0, Operation::insert(5, "XY")).unwrap();
        assert_eq!(at, 1);
        assert_eq!(applied, Operation::insert(8, "XY"));
        assert_eq!(room.text(), "01234abcXY56789");
    }

    #[test]
    fn test_late_edit_is_transformed_through_history() {
        let mut room = DocumentRoom::new("0123456789abcdefghij", 16);
        room.apply_edit(0, Operation::insert(15, "Z")).unwrap();
        room.apply_edit(1, Operation::insert(0, ">")).unwrap();

        // Computed against state 0, before either insert.
        let (at, applied) = room.apply_edit(0, Operation::remove(10, 10)).unwrap();
        assert_eq!(at, 2);
        assert_eq!(
            applied,
            Operation::mult(vec![Operation::remove(11, 5), Operation::remove(12, 5)])
        );
        assert_eq!(room.text(), ">0123456789Z");
    }

    #[test]
    fn test_future_state_is_rejected() {
        let mut room = DocumentRoom::new("abc", 16);
        assert_eq!(
            room.apply_edit(3, Operation::insert(0, "x")),
            Err(RoomError::FutureState { base: 3, current: 0 })
        );
        assert_eq!(room.state(), 0);
    }

    #[test]
    fn test_truncated_history_is_rejected() {
        let mut room = DocumentRoom::new("", 2);
        for state in 0..5 {
            room.apply_edit(state, Operation::insert(0, "x")).unwrap();
        }
        assert_eq!(room.oldest_state(), 3);
        assert_eq!(
            room.apply_edit(1, Operation::insert(0, "y")),
            Err(RoomError::HistoryTruncated { base: 1, oldest: 3 })
        );
        assert!(room.apply_edit(3, Operation::insert(0, "y")).is_ok());
    }

    #[test]
    fn test_edit_outside_document_is_rejected() {
        let mut room = DocumentRoom::new("abc", 16);
        assert!(matches!(
            room.apply_edit(0, Operation::remove(1, 9)),
            Err(RoomError::Document(DocumentError::OutOfBounds { .. }))
        ));
        assert_eq!(room.snapshot(), (0, "abc".to_string()));
    }

    #[test]
    fn test_overflowing_offsets_are_rejected() {
        let mut room = DocumentRoom::new("abc", 16);
        room.apply_edit(0, Operation::insert(0, "x")).unwrap();

        for base in [0, 1] {
            assert!(matches!(
                room.apply_edit(base, Operation::remove(usize::MAX, 2)),
                Err(RoomError::Document(DocumentError::OutOfBounds { end: usize::MAX, .. }))
            ));
            assert!(matches!(
                room.apply_edit(base, Operation::insert(usize::MAX, "y")),
                Err(RoomError::Document(DocumentError::OutOfBounds { .. }))
            ));
        }
        assert_eq!(room.snapshot(), (1, "xabc".to_string()));
    }

    #[test]
    fn test_late_edit_is_checked_against_its_base_text() {
        let mut room = DocumentRoom::new("abc", 16);
        room.apply_edit(0, Operation::insert(3, "def")).unwrap();

        // Fits the current text but not the text at state 0.
        assert!(matches!(
            room.apply_edit(0, Operation::remove(2, 3)),
            Err(RoomError::Document(DocumentError::OutOfBounds { start: 2, end: 5, len: 3 }))
        ));
        assert_eq!(room.apply_edit(0, Operation::remove(1, 2)).unwrap().0, 1);
        assert_eq!(room.text(), "adef");
    }
}
