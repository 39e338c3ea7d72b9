//! # cowrite-core — Operational transform for collaborative text editing
//!
//! Pure, synchronous building blocks shared by the server and every client.
//!
//! ## Modules
//!
//! - [`operation`] — `insert` / `remove` / `mult` edits with char offsets
//! - [`transform`] — pairwise OT: `transform(a, b) -> (a', b')`
//! - [`document`] — the `DocumentAdapter` boundary and a rope-backed `TextBuffer`
//!
//! ```text
//!   base ──a──► A          transform(a, b) = (a', b')
//!    │          │
//!    b          b'         apply(apply(base, a), b') == apply(apply(base, b), a')
//!    ▼          ▼
//!    B ──a'───► *
//! ```

pub mod document;
pub mod operation;
pub mod transform;

pub use document::{check_bounds, DocumentAdapter, DocumentError, TextBuffer};
pub use operation::{Action, Insert, Operation, Remove};
pub use transform::transform;
