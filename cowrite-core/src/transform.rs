//! Pairwise operational transform.
//!
//! `transform(a, b)` takes two operations computed against the same document
//! and returns `(a', b')` such that applying `a` then `b'` yields the same
//! text as applying `b` then `a'`.
//!
//! ```text
//!          a
//!     * ------> *
//!     |         |
//!   b |         | b'
//!     v         v
//!     * ------> *
//!          a'
//! ```
//!
//! The first operand wins ties: two inserts at the same offset put the first
//! operand's text before the second's. The server transforms incoming edits
//! as `transform(history, incoming)` and clients transform buffered edits as
//! `transform(remote, local)`, so both sides always favour the operation the
//! server ordered first.
//!
//! Inputs are never mutated; every result is a fresh value.

use crate::operation::{Insert, Operation, Remove};

/// Transform two concurrent operations against each other.
pub fn transform(a: &Operation, b: &Operation) -> (Operation, Operation) {
    match (a, b) {
        (Operation::Mult(children), _) => {
            let mut other = b.clone();
            let children = children
                .iter()
                .map(|child| {
                    let (child, next) = transform(child, &other);
                    other = next;
                    child
                })
                .collect();
            (Operation::Mult(children), other)
        }
        (_, Operation::Mult(children)) => {
            let mut other = a.clone();
            let children = children
                .iter()
                .map(|child| {
                    let (next, child) = transform(&other, child);
                    other = next;
                    child
                })
                .collect();
            (other, Operation::Mult(children))
        }
        (Operation::Insert(a), Operation::Insert(b)) => insert_insert(a, b),
        (Operation::Insert(a), Operation::Remove(b)) => insert_remove(a, b),
        (Operation::Remove(a), Operation::Insert(b)) => {
            let (b, a) = insert_remove(b, a);
            (a, b)
        }
        (Operation::Remove(a), Operation::Remove(b)) => remove_remove(a, b),
    }
}

fn insert_insert(a: &Insert, b: &Insert) -> (Operation, Operation) {
    if a.start <= b.start {
        (a.clone().into(), b.at(b.start + a.len()).into())
    } else {
        (a.at(a.start + b.len()).into(), b.clone().into())
    }
}

/// Returns `(insert', remove')`.
fn insert_remove(ins: &Insert, rem: &Remove) -> (Operation, Operation) {
    if ins.start <= rem.start {
        let rem = Remove::new(rem.start + ins.len(), rem.len);
        (ins.clone().into(), rem.into())
    } else if rem.end() <= ins.start {
        (ins.at(ins.start - rem.len).into(), (*rem).into())
    } else {
        // The insertion point lies strictly inside the removed range: the
        // removal is threaded around the inserted text, which survives at the
        // removal start.
        let before = ins.start - rem.start;
        let after = rem.end() - ins.start;
        (
            ins.at(rem.start).into(),
            split_remove(rem.start, before, rem.start + ins.len(), after),
        )
    }
}

fn remove_remove(a: &Remove, b: &Remove) -> (Operation, Operation) {
    let (a_start, a_end) = (a.start, a.end());
    let (b_start, b_end) = (b.start, b.end());

    if a_end <= b_start {
        (
            (*a).into(),
            Remove::new(b_start - a.len, b.len).into(),
        )
    } else if b_end <= a_start {
        (
            Remove::new(a_start - b.len, a.len).into(),
            (*b).into(),
        )
    } else if a_start == b_start && a_end == b_end {
        // Both removed the same range; neither has anything left to do.
        (Remove::empty(a_start).into(), Remove::empty(b_start).into())
    } else if a_start <= b_start && a_end <= b_end {
        // a's tail overlaps b's head.
        (
            Remove::new(a_start, b_start - a_start).into(),
            Remove::new(a_start, b_end - a_end).into(),
        )
    } else if b_start <= a_start && b_end <= a_end {
        // b's tail overlaps a's head.
        (
            Remove::new(b_start, a_end - b_end).into(),
            Remove::new(b_start, a_start - b_start).into(),
        )
    } else if a_start <= b_start && b_end <= a_end {
        // a contains b.
        (
            split_remove(a_start, b_start - a_start, a_start, a_end - b_end),
            Remove::empty(a_start).into(),
        )
    } else {
        // b contains a.
        (
            Remove::empty(b_start).into(),
            split_remove(b_start, a_start - b_start, b_start, b_end - a_end),
        )
    }
}

/// Two sequential removals; collapses to one when either piece is empty.
fn split_remove(
    first_start: usize,
    first_len: usize,
    second_start: usize,
    second_len: usize,
) -> Operation {
    match (first_len, second_len) {
        (0, _) => Remove::new(second_start, second_len).into(),
        (_, 0) => Remove::new(first_start, first_len).into(),
        _ => Operation::Mult(vec![
            Remove::new(first_start, first_len).into(),
            Remove::new(second_start, second_len).into(),
        ]),
    }
}
