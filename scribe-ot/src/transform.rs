//! Transformation of concurrent operations.
//!
//! Given two ops `a` and `b` computed against the same text, `transform`
//! rewrites one of them so it applies after the other:
//!
//! ```text
//!            s
//!      a   /   \   b
//!         /     \
//!      s·a       s·b
//!         \     /
//! b' = T(b,a,R) T(a,b,L) = a'
//!           \ /
//!      s·a·b' == s·b·a'
//! ```
//!
//! Ties (two inserts at one position) go to the `Left` side: its insert
//! stays in front and the `Right` insert shifts past it. Peers must use
//! opposite sides for the same pair of ops.

use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::op::Op;
use crate::text::{char_len, char_slice};
use crate::OtError;

/// Which of two concurrent ops wins an insert tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// Where `pos` moves to once `c` has been applied.
///
/// With `insert_after`, an insert exactly at `pos` pushes it forward.
pub fn transform_position(pos: usize, c: &Component, insert_after: bool) -> usize {
    match c {
        Component::Insert { position, text } => {
            if *position < pos || (*position == pos && insert_after) {
                pos + char_len(text)
            } else {
                pos
            }
        }
        Component::Delete { position, text } => {
            let len = char_len(text);
            if pos <= *position {
                pos
            } else if pos <= position + len {
                *position
            } else {
                pos - len
            }
        }
    }
}

/// Where a cursor at `pos` moves to once `op` has been applied.
pub fn transform_cursor(pos: usize, op: &Op, insert_after: bool) -> usize {
    op.iter().fold(pos, |p, c| transform_position(p, c, insert_after))
}

/// Rebase `c` over `other` and append the result (zero, one or two
/// components) to `dest`.
fn transform_component(
    dest: &mut Op,
    c: &Component,
    other: &Component,
    side: Side,
) -> Result<(), OtError> {
    match (c, other) {
        (Component::Insert { position, text }, _) => {
            let position = transform_position(*position, other, side == Side::Right);
            dest.append(Component::insert(position, text.clone()));
        }

        (
            Component::Delete { position, text },
            Component::Insert {
                position: other_pos,
                text: other_text,
            },
        ) => {
            // The insert may land inside the deleted range: split around it.
            let len = char_len(text);
            let mut rest = text.clone();
            if position < other_pos {
                let head = (other_pos - position).min(len);
                dest.append(Component::delete(*position, char_slice(text, 0, head)));
                rest = char_slice(text, head, len);
            }
            if !rest.is_empty() {
                dest.append(Component::delete(position + char_len(other_text), rest));
            }
        }

        (
            Component::Delete { position, text },
            Component::Delete {
                position: other_pos,
                text: other_text,
            },
        ) => {
            let len = char_len(text);
            let other_len = char_len(other_text);

            if *position >= other_pos + other_len {
                dest.append(Component::delete(position - other_len, text.clone()));
            } else if position + len <= *other_pos {
                dest.append(c.clone());
            } else {
                // Overlap: keep whatever `other` did not already remove.
                let mut remaining = String::new();
                if position < other_pos {
                    remaining.push_str(&char_slice(text, 0, other_pos - position));
                }
                if position + len > other_pos + other_len {
                    remaining.push_str(&char_slice(text, other_pos + other_len - position, len));
                }

                let start = (*position).max(*other_pos);
                let end = (position + len).min(other_pos + other_len);
                let mine = char_slice(text, start - position, end - position);
                let theirs = char_slice(other_text, start - other_pos, end - other_pos);
                if mine != theirs {
                    return Err(OtError::ConflictingDelete { position: start });
                }

                let position = if remaining.is_empty() {
                    *position
                } else {
                    transform_position(*position, other, false)
                };
                dest.append(Component::delete(position, remaining));
            }
        }
    }

    Ok(())
}

/// Transform `left` and `right` against each other.
///
/// Returns `(left', right')` such that
/// `apply(apply(s, left), right') == apply(apply(s, right), left')`.
///
/// A right component that splits while crossing the left op is resolved
/// by recursing on the split pieces against the left components it has
/// not yet crossed.
pub fn transform_x(left: &Op, right: &Op) -> Result<(Op, Op), OtError> {
    let mut left_op = left.clone();
    let mut new_right = Op::new();

    for right_component in right.iter() {
        let mut current = Some(right_component.clone());
        let mut new_left = Op::new();

        for (k, lc) in left_op.iter().enumerate() {
            let Some(rc) = current.take() else {
                // The right component was fully absorbed or already resolved.
                new_left.append(lc.clone());
                continue;
            };

            let mut next = Op::new();
            transform_component(&mut new_left, lc, &rc, Side::Left)?;
            transform_component(&mut next, &rc, lc, Side::Right)?;

            match next.len() {
                0 => {}
                1 => current = next.into_components().pop(),
                _ => {
                    let rest = Op::from(left_op.components()[k + 1..].to_vec());
                    let (l, r) = transform_x(&rest, &next)?;
                    new_left.extend(l);
                    new_right.extend(r);
                    break;
                }
            }
        }

        if let Some(rc) = current {
            new_right.append(rc);
        }
        left_op = new_left;
    }

    Ok((left_op, new_right))
}

/// Rebase `op` so it applies after `other`, both having been computed
/// against the same text.
pub fn transform(op: &Op, other: &Op, side: Side) -> Result<Op, OtError> {
    if other.is_empty() {
        return Ok(op.clone());
    }

    if op.len() == 1 && other.len() == 1 {
        let mut out = Op::new();
        transform_component(&mut out, &op.components()[0], &other.components()[0], side)?;
        return Ok(out);
    }

    match side {
        Side::Left => transform_x(op, other).map(|(left, _)| left),
        Side::Right => transform_x(other, op).map(|(_, right)| right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply;

    fn op(cs: Vec<Component>) -> Op {
        Op::from(cs)
    }

    fn converges(s: &str, a: &Op, b: &Op) -> String {
        let left = apply(&apply(s, a).unwrap(), &transform(b, a, Side::Right).unwrap()).unwrap();
        let right = apply(&apply(s, b).unwrap(), &transform(a, b, Side::Left).unwrap()).unwrap();
        assert_eq!(left, right, "diverged on {s:?} with a={a:?} b={b:?}");
        left
    }

    #[test]
    fn test_position_past_insert() {
        let c = Component::insert(2, "abc");
        assert_eq!(transform_position(1, &c, false), 1);
        assert_eq!(transform_position(2, &c, false), 2);
        assert_eq!(transform_position(2, &c, true), 5);
        assert_eq!(transform_position(4, &c, false), 7);
    }

    #[test]
    fn test_position_around_delete() {
        let c = Component::delete(2, "abc");
        assert_eq!(transform_position(2, &c, false), 2);
        assert_eq!(transform_position(4, &c, false), 2);
        assert_eq!(transform_position(5, &c, false), 2);
        assert_eq!(transform_position(9, &c, false), 6);
    }

    #[test]
    fn test_cursor_through_op() {
        let o = op(vec![Component::insert(0, "ab"), Component::delete(5, "x")]);
        assert_eq!(transform_cursor(3, &o, false), 5);
        assert_eq!(transform_cursor(9, &o, false), 10);
    }

    #[test]
    fn test_insert_insert_tie_break() {
        let a = op(vec![Component::insert(1, "A")]);
        let b = op(vec![Component::insert(1, "B")]);
        assert_eq!(transform(&a, &b, Side::Left).unwrap(), a);
        assert_eq!(
            transform(&b, &a, Side::Right).unwrap(),
            op(vec![Component::insert(2, "B")])
        );
        assert_eq!(converges("xy", &a, &b), "xABy");
    }

    #[test]
    fn test_insert_after_remote_insert() {
        // "hello": A inserts "X" at 0, B inserts "!" at 5
        let a = op(vec![Component::insert(0, "X")]);
        let b = op(vec![Component::insert(5, "!")]);
        assert_eq!(
            transform(&b, &a, Side::Left).unwrap(),
            op(vec![Component::insert(6, "!")])
        );
        assert_eq!(converges("hello", &a, &b), "Xhello!");
    }

    #[test]
    fn test_insert_inside_deleted_range_clamps() {
        let ins = op(vec![Component::insert(3, "Z")]);
        let del = op(vec![Component::delete(1, "bcd")]);
        assert_eq!(
            transform(&ins, &del, Side::Left).unwrap(),
            op(vec![Component::insert(1, "Z")])
        );
        assert_eq!(converges("abcde", &ins, &del), "aZe");
    }

    #[test]
    fn test_delete_split_by_insert() {
        let del = op(vec![Component::delete(1, "bcd")]);
        let ins = op(vec![Component::insert(2, "XY")]);
        let rebased = transform(&del, &ins, Side::Left).unwrap();
        assert_eq!(
            rebased,
            op(vec![Component::delete(1, "b"), Component::delete(3, "cd")])
        );
        assert_eq!(converges("abcde", &del, &ins), "aXYe");
    }

    #[test]
    fn test_delete_after_delete_shifts() {
        let a = op(vec![Component::delete(4, "e")]);
        let b = op(vec![Component::delete(0, "ab")]);
        assert_eq!(
            transform(&a, &b, Side::Left).unwrap(),
            op(vec![Component::delete(2, "e")])
        );
        assert_eq!(converges("abcde", &a, &b), "cd");
    }

    #[test]
    fn test_identical_deletes_collapse() {
        let a = op(vec![Component::delete(0, "a")]);
        let rebased = transform(&a, &a, Side::Left).unwrap();
        assert!(rebased.is_empty());
        assert_eq!(converges("ab", &a, &a), "b");
    }

    #[test]
    fn test_partial_overlap_keeps_remainder() {
        let a = op(vec![Component::delete(1, "bcd")]);
        let b = op(vec![Component::delete(2, "cdef")]);
        assert_eq!(
            transform(&a, &b, Side::Left).unwrap(),
            op(vec![Component::delete(1, "b")])
        );
        assert_eq!(
            transform(&b, &a, Side::Right).unwrap(),
            op(vec![Component::delete(1, "ef")])
        );
        assert_eq!(converges("abcdefg", &a, &b), "ag");
    }

    #[test]
    fn test_conflicting_delete() {
        let a = op(vec![Component::delete(0, "a")]);
        let b = op(vec![Component::delete(0, "b")]);
        assert_eq!(
            transform(&b, &a, Side::Left),
            Err(OtError::ConflictingDelete { position: 0 })
        );
    }

    #[test]
    fn test_transform_against_empty() {
        let a = op(vec![Component::insert(0, "a"), Component::insert(3, "b")]);
        assert_eq!(transform(&a, &Op::new(), Side::Right).unwrap(), a);
    }

    #[test]
    fn test_transform_x_multi_component() {
        let left = op(vec![Component::insert(0, "AB"), Component::delete(4, "cd")]);
        let right = op(vec![Component::delete(1, "bc"), Component::insert(2, "Z")]);
        let s = "abcdef";
        let (l2, r2) = transform_x(&left, &right).unwrap();
        let via_left = apply(&apply(s, &left).unwrap(), &r2).unwrap();
        let via_right = apply(&apply(s, &right).unwrap(), &l2).unwrap();
        assert_eq!(via_left, via_right);
    }

    #[test]
    fn test_transform_x_with_split() {
        // The right delete is split by the first left insert and both pieces
        // must still cross the second left component.
        let left = op(vec![Component::insert(2, "XY"), Component::insert(0, "Q")]);
        let right = op(vec![Component::delete(1, "bcd")]);
        let s = "abcde";
        let (l2, r2) = transform_x(&left, &right).unwrap();
        let via_left = apply(&apply(s, &left).unwrap(), &r2).unwrap();
        let via_right = apply(&apply(s, &right).unwrap(), &l2).unwrap();
        assert_eq!(via_left, via_right);
        assert_eq!(via_left, "QaXYe");
    }
}
