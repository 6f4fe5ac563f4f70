//! # scribe-ot - Operational transformation for plain text
//!
//! Pure functions over text operations. No state, no I/O, safe to call
//! from any thread.
//!
//! ## Model
//!
//! ```text
//! Op = [ Component, Component, ... ]        applied left to right,
//!                                           each against the evolving text
//! Component = Insert { p, i } | Delete { p, d }
//! ```
//!
//! Positions and lengths count `char`s (Unicode scalar values).
//!
//! ## Operations
//!
//! | fn | law |
//! |----|-----|
//! | [`apply`] | fails fast if a delete does not match the text |
//! | [`compose`] | `apply(s, compose(a, b)) == apply(apply(s, a), b)` |
//! | [`invert`] | `apply(apply(s, op), invert(op)) == s` |
//! | [`normalize`] | `normalize(normalize(op)) == normalize(op)` |
//! | [`transform`] | `apply(apply(s, a), transform(b, a, Right)) == apply(apply(s, b), transform(a, b, Left))` |
//! | [`transform_x`] | both sides of the above in one pass |
//!
//! Reference: Ellis & Gibbs, "Concurrency control in groupware systems" (1989)

pub mod component;
pub mod op;
pub mod text;
pub mod transform;

pub use component::Component;
pub use op::{Op, RawOp, compose, compress, invert, normalize};
pub use text::apply;
pub use transform::{Side, transform, transform_cursor, transform_position, transform_x};

/// Errors raised when an operation does not fit the text it is applied to
/// or cannot be reconciled with a concurrent operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OtError {
    /// A delete names text that is not present at its position.
    #[error("Delete component '{expected}' does not match deleted text '{found}' at {position}")]
    OpMismatch {
        position: usize,
        expected: String,
        found: String,
    },
    /// Two concurrent deletes remove different text from the same region.
    #[error("Delete ops delete different text in the same region of the document (at {position})")]
    ConflictingDelete { position: usize },
    /// A component addresses a position past the end of the text.
    #[error("Position {position} is out of bounds for text of length {len}")]
    OutOfBounds { position: usize, len: usize },
}
