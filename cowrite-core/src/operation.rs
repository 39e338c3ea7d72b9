//! Text edit operations exchanged between collaborators.
//!
//! Offsets and lengths count `char`s, not bytes, so an operation means the
//! same thing on every peer regardless of how the text is stored.
//!
//! ```text
//! Operation
//!   ├── Insert { start, text }      len = text.chars().count()
//!   ├── Remove { start, len }       end = start + len
//!   └── Mult [ op, op, ... ]        children applied in order
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Insert `text` at char offset `start`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Insert {
    pub start: usize,
    pub text: String,
}

impl Insert {
    pub fn new(start: usize, text: impl Into<String>) -> Self {
        Self {
            start,
            text: text.into(),
        }
    }

    /// Number of chars inserted.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn end(&self) -> usize {
        self.start.saturating_add(self.len())
    }

    pub(crate) fn at(&self, start: usize) -> Self {
        Self {
            start,
            text: self.text.clone(),
        }
    }
}

/// Remove `len` chars starting at char offset `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Remove {
    pub start: usize,
    pub len: usize,
}

impl Remove {
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    /// A zero-length removal anchored at `start`.
    pub fn empty(start: usize) -> Self {
        Self { start, len: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Saturates, so a nonsense offset still compares as out of range.
    pub fn end(&self) -> usize {
        self.start.saturating_add(self.len)
    }
}

/// An atomic or composite text edit.
///
/// The children of a [`Operation::Mult`] are applied strictly in sequence:
/// each child's offsets are relative to the document left behind by the
/// children before it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Insert(Insert),
    Remove(Remove),
    Mult(Vec<Operation>),
}

/// Discriminant of an [`Operation`], mostly for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Insert,
    Remove,
    Mult,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Insert => "insert",
            Action::Remove => "remove",
            Action::Mult => "mult",
        })
    }
}

impl Operation {
    pub fn insert(start: usize, text: impl Into<String>) -> Self {
        Operation::Insert(Insert::new(start, text))
    }

    pub fn remove(start: usize, len: usize) -> Self {
        Operation::Remove(Remove::new(start, len))
    }

    pub fn mult(operations: Vec<Operation>) -> Self {
        Operation::Mult(operations)
    }

    /// The canonical no-op: a zero-length removal at offset 0.
    pub fn noop() -> Self {
        Operation::Remove(Remove::empty(0))
    }

    pub fn action(&self) -> Action {
        match self {
            Operation::Insert(_) => Action::Insert,
            Operation::Remove(_) => Action::Remove,
            Operation::Mult(_) => Action::Mult,
        }
    }

    /// True when applying this operation leaves any document unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Operation::Insert(op) => op.is_empty(),
            Operation::Remove(op) => op.is_empty(),
            Operation::Mult(ops) => ops.iter().all(Operation::is_noop),
        }
    }

    /// Change in document length (in chars) caused by applying this operation.
    pub fn len_delta(&self) -> isize {
        match self {
            Operation::Insert(op) => op.len() as isize,
            Operation::Remove(op) => -(op.len as isize),
            Operation::Mult(ops) => ops.iter().map(Operation::len_delta).sum(),
        }
    }

    /// Flatten nested `Mult`s, drop no-op children and unwrap single-child
    /// `Mult`s. The result applies identically and is a fixed point.
    pub fn normalize(self) -> Operation {
        match self {
            Operation::Mult(ops) => {
                let mut flat = Vec::with_capacity(ops.len());
                for op in ops {
                    match op.normalize() {
                        Operation::Mult(children) => flat.extend(children),
                        op if op.is_noop() => {}
                        op => flat.push(op),
                    }
                }
                match flat.len() {
                    0 => Operation::noop(),
                    1 => flat.remove(0),
                    _ => Operation::Mult(flat),
                }
            }
            op => op,
        }
    }

    /// Map a char index in the document before this operation to the
    /// matching index after it.
    ///
    /// An insert at or before the index pushes it right. A removal before the
    /// index pulls it left; an index inside the removed range lands on the
    /// removal start.
    pub fn adjust_index(&self, index: usize) -> usize {
        match self {
            Operation::Insert(op) => {
                if op.start <= index {
                    index + op.len()
                } else {
                    index
                }
            }
            Operation::Remove(op) => {
                if op.start < index {
                    if op.end() <= index {
                        index - op.len
                    } else {
                        op.start
                    }
                } else {
                    index
                }
            }
            Operation::Mult(ops) => ops.iter().fold(index, |index, op| op.adjust_index(index)),
        }
    }
}

impl From<Insert> for Operation {
    fn from(op: Insert) -> Self {
        Operation::Insert(op)
    }
}

impl From<Remove> for Operation {
    fn from(op: Remove) -> Self {
        Operation::Remove(op)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert(op) => write!(f, "insert({}, {:?})", op.start, op.text),
            Operation::Remove(op) => write!(f, "remove({}, {})", op.start, op.len),
            Operation::Mult(ops) => {
                f.write_str("mult[")?;
                for (i, op) in ops.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{op}")?;
                }
                f.write_str("]")
            }
        }
    }
}
