//! The live text buffer seen by the collaboration engine.
//!
//! The engine never touches the editor's text directly. It goes through
//! [`DocumentAdapter`]: remote edits are applied with
//! [`DocumentAdapter::apply_operation`], and the user's own edits are
//! collected with [`DocumentAdapter::capture_local_edit`].
//!
//! [`TextBuffer`] is the in-memory adapter backed by a `ropey::Rope`.

use ropey::Rope;
use thiserror::Error;

use crate::operation::{Insert, Operation, Remove};

/// Errors raised while applying an operation to a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("operation range {start}..{end} exceeds document length {len}")]
    OutOfBounds { start: usize, end: usize, len: usize },
}

/// The two-way boundary between the engine and the editor's text.
pub trait DocumentAdapter {
    /// Mutate the live text per `op`. Either the whole operation applies or
    /// the document is left untouched.
    fn apply_operation(&mut self, op: &Operation) -> Result<(), DocumentError>;

    /// The user's edits since the last call, or `None` if there were none.
    fn capture_local_edit(&mut self) -> Option<Operation>;

    /// Current full text.
    fn text(&self) -> String;

    /// Replace the whole text with the server's authoritative copy.
    fn replace_text(&mut self, text: &str);
}

/// Rope-backed document that records local edits for capture.
#[derive(Debug, Clone, Default)]
pub struct TextBuffer {
    rope: Rope,
    local_edits: Vec<Operation>,
}

impl TextBuffer {
    pub fn new(text: &str) -> Self {
        Self {
            rope: Rope::from_str(text),
            local_edits: Vec::new(),
        }
    }

    /// Length in chars.
    pub fn len_chars(&self) -> usize {
        self.rope.len_chars()
    }

    pub fn is_empty(&self) -> bool {
        self.rope.len_chars() == 0
    }

    /// A user typed `text` at `start`.
    pub fn insert(&mut self, start: usize, text: &str) -> Result<(), DocumentError> {
        self.local_edit(Insert::new(start, text).into())
    }

    /// A user deleted `len` chars at `start`.
    pub fn remove(&mut self, start: usize, len: usize) -> Result<(), DocumentError> {
        self.local_edit(Remove::new(start, len).into())
    }

    /// Apply a user edit and record it for the next capture.
    pub fn local_edit(&mut self, op: Operation) -> Result<(), DocumentError> {
        self.apply_operation(&op)?;
        if !op.is_noop() {
            self.local_edits.push(op);
        }
        Ok(())
    }

    pub fn has_local_edits(&self) -> bool {
        !self.local_edits.is_empty()
    }

    pub fn rope(&self) -> &Rope {
        &self.rope
    }
}

impl DocumentAdapter for TextBuffer {
    fn apply_operation(&mut self, op: &Operation) -> Result<(), DocumentError> {
        // Rope clones share their nodes, so a failed `mult` costs nothing to
        // roll back.
        let mut scratch = self.rope.clone();
        apply_to_rope(&mut scratch, op)?;
        self.rope = scratch;
        Ok(())
    }

    fn capture_local_edit(&mut self) -> Option<Operation> {
        match self.local_edits.len() {
            0 => None,
            1 => self.local_edits.pop(),
            _ => Some(Operation::Mult(std::mem::take(&mut self.local_edits)).normalize()),
        }
    }

    fn text(&self) -> String {
        self.rope.to_string()
    }

    fn replace_text(&mut self, text: &str) {
        self.rope = Rope::from_str(text);
        self.local_edits.clear();
    }
}

/// Check that `op` fits a document of `len` chars without applying it.
/// Returns the length the document would have afterwards.
pub fn check_bounds(op: &Operation, len: usize) -> Result<usize, DocumentError> {
    match op {
        Operation::Insert(ins) => {
            if ins.start > len {
                return Err(DocumentError::OutOfBounds {
                    start: ins.start,
                    end: ins.start,
                    len,
                });
            }
            Ok(len + ins.len())
        }
        Operation::Remove(rem) => match rem.start.checked_add(rem.len) {
            Some(end) if end <= len => Ok(len - rem.len),
            end => Err(DocumentError::OutOfBounds {
                start: rem.start,
                end: end.unwrap_or(usize::MAX),
                len,
            }),
        },
        Operation::Mult(ops) => ops.iter().try_fold(len, |len, op| check_bounds(op, len)),
    }
}

fn apply_to_rope(rope: &mut Rope, op: &Operation) -> Result<(), DocumentError> {
    let len = rope.len_chars();
    match op {
        Operation::Insert(ins) => {
            if ins.start > len {
                return Err(DocumentError::OutOfBounds {
                    start: ins.start,
                    end: ins.start,
                    len,
                });
            }
            rope.insert(ins.start, &ins.text);
        }
        Operation::Remove(rem) => {
            if rem.end() > len {
                return Err(DocumentError::OutOfBounds {
                    start: rem.start,
                    end: rem.end(),
                    len,
                });
            }
            if !rem.is_empty() {
                rope.remove(rem.start..rem.end());
            }
        }
        Operation::Mult(ops) => {
            for op in ops {
                apply_to_rope(rope, op)?;
            }
        }
    }
    Ok(())
}
