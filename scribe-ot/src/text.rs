//! Char-indexed string helpers and [`apply`].

use crate::{Component, Op, OtError};

/// Number of chars in `s`.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of char index `idx`, or `None` when `idx > char_len(s)`.
pub(crate) fn byte_offset(s: &str, idx: usize) -> Option<usize> {
    s.char_indices()
        .map(|(b, _)| b)
        .chain(std::iter::once(s.len()))
        .nth(idx)
}

/// Chars `start..end` of `s`, clamped to the string.
pub(crate) fn char_slice(s: &str, start: usize, end: usize) -> String {
    s.chars().skip(start).take(end.saturating_sub(start)).collect()
}

/// `s` with `ins` inserted at char index `pos` (clamped to the end).
pub(crate) fn inject(s: &str, pos: usize, ins: &str) -> String {
    let at = byte_offset(s, pos).unwrap_or(s.len());
    let mut out = String::with_capacity(s.len() + ins.len());
    out.push_str(&s[..at]);
    out.push_str(ins);
    out.push_str(&s[at..]);
    out
}

/// Apply `op` to `snapshot`, returning the new text.
///
/// Every delete is checked against the text actually present; a mismatch
/// means the op was computed against a different document state and the
/// whole application fails without producing partial output.
pub fn apply(snapshot: &str, op: &Op) -> Result<String, OtError> {
    let mut doc = snapshot.to_owned();

    for component in op.iter() {
        match component {
            Component::Insert { position, text } => {
                let at = byte_offset(&doc, *position).ok_or_else(|| OtError::OutOfBounds {
                    position: *position,
                    len: char_len(&doc),
                })?;
                doc.insert_str(at, text);
            }
            Component::Delete { position, text } => {
                let start = byte_offset(&doc, *position).ok_or_else(|| OtError::OutOfBounds {
                    position: *position,
                    len: char_len(&doc),
                })?;
                let found: String = doc[start..].chars().take(char_len(text)).collect();
                if found != *text {
                    return Err(OtError::OpMismatch {
                        position: *position,
                        expected: text.clone(),
                        found,
                    });
                }
                doc.replace_range(start..start + found.len(), "");
            }
        }
    }

    Ok(doc)
}
