//! Operations: ordered component lists, and the compaction primitives
//! `append`, `compose`, `normalize` and `invert`.

use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::text::inject;

/// An ordered list of components. Each component's position is relative to
/// the text produced by the components before it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Op(Vec<Component>);

impl Op {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn components(&self) -> &[Component] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Component> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_components(self) -> Vec<Component> {
        self.0
    }

    /// Push `c`, compacting as it goes.
    ///
    /// Empty components are dropped. An insert landing inside or at either
    /// edge of a trailing insert is merged into it; a delete whose range
    /// covers the position of a trailing delete absorbs it.
    pub fn append(&mut self, c: Component) {
        if c.is_noop() {
            return;
        }

        let Some(last) = self.0.last_mut() else {
            self.0.push(c);
            return;
        };

        let merged = match (&*last, &c) {
            (
                Component::Insert { position: lp, text: lt },
                Component::Insert { position: cp, text: ct },
            ) if *lp <= *cp && *cp <= lp + lt.chars().count() => {
                Some(Component::insert(*lp, inject(lt, cp - lp, ct)))
            }
            (
                Component::Delete { position: lp, text: lt },
                Component::Delete { position: cp, text: ct },
            ) if *cp <= *lp && *lp <= cp + ct.chars().count() => {
                Some(Component::delete(*cp, inject(ct, lp - cp, lt)))
            }
            _ => None,
        };

        match merged {
            Some(m) => *last = m,
            None => self.0.push(c),
        }
    }

    /// Append every component of `other` in order.
    pub fn extend(&mut self, other: impl IntoIterator<Item = Component>) {
        for c in other {
            self.append(c);
        }
    }
}

impl From<Vec<Component>> for Op {
    /// Wrap components as-is, without compaction.
    fn from(components: Vec<Component>) -> Self {
        Self(components)
    }
}

impl From<Component> for Op {
    fn from(c: Component) -> Self {
        Self(vec![c])
    }
}

impl IntoIterator for Op {
    type Item = Component;
    type IntoIter = std::vec::IntoIter<Component>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Op {
    type Item = &'a Component;
    type IntoIter = std::slice::Iter<'a, Component>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// An op as submitted by a client: one bare component or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawOp {
    One(Component),
    Many(Vec<Component>),
}

impl From<Component> for RawOp {
    fn from(c: Component) -> Self {
        RawOp::One(c)
    }
}

impl From<Vec<Component>> for RawOp {
    fn from(cs: Vec<Component>) -> Self {
        RawOp::Many(cs)
    }
}

impl From<Op> for RawOp {
    fn from(op: Op) -> Self {
        RawOp::Many(op.0)
    }
}

/// Canonical compacted form of a submitted op.
pub fn normalize(raw: impl Into<RawOp>) -> Op {
    let mut op = Op::new();
    match raw.into() {
        RawOp::One(c) => op.append(c),
        RawOp::Many(cs) => op.extend(cs),
    }
    op
}

/// An op with the effect of `op1` followed by `op2`.
pub fn compose(op1: &Op, op2: &Op) -> Op {
    let mut out = op1.clone();
    out.extend(op2.iter().cloned());
    out
}

/// Compacted copy of `op`.
pub fn compress(op: &Op) -> Op {
    compose(&Op::new(), op)
}

/// The op that undoes `op`.
pub fn invert(op: &Op) -> Op {
    Op(op.iter().rev().map(Component::invert).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply;

    #[test]
    fn test_append_drops_empty() {
        let mut op = Op::new();
        op.append(Component::insert(3, ""));
        op.append(Component::delete(0, ""));
        assert!(op.is_empty());
    }

    #[test]
    fn test_append_merges_typing() {
        let mut op = Op::new();
        op.append(Component::insert(0, "ab"));
        op.append(Component::insert(2, "c"));
        op.append(Component::insert(1, "X"));
        assert_eq!(op, Op::from(Component::insert(0, "aXbc")));
    }

    #[test]
    fn test_append_merges_backspace() {
        // "hello", backspace twice from the end
        let mut op = Op::new();
        op.append(Component::delete(4, "o"));
        op.append(Component::delete(3, "l"));
        assert_eq!(op, Op::from(Component::delete(3, "lo")));
        assert_eq!(apply("hello", &op).unwrap(), "hel");
    }

    #[test]
    fn test_append_keeps_disjoint() {
        let mut op = Op::new();
        op.append(Component::insert(0, "a"));
        op.append(Component::insert(5, "b"));
        op.append(Component::delete(0, "a"));
        assert_eq!(op.len(), 3);
    }

    #[test]
    fn test_normalize_single_component() {
        let raw: RawOp = serde_json::from_str(r#"{"i":"x"}"#).unwrap();
        assert_eq!(normalize(raw), Op::from(Component::insert(0, "x")));
    }

    #[test]
    fn test_normalize_list() {
        let raw: RawOp =
            serde_json::from_str(r#"[{"p":0,"i":"ab"},{"p":2,"i":"c"},{"p":1,"d":""}]"#).unwrap();
        let op = normalize(raw);
        assert_eq!(op, Op::from(Component::insert(0, "abc")));
        assert_eq!(normalize(op.clone()), op);
    }

    #[test]
    fn test_compose_merges_adjacent() {
        let a = Op::from(Component::insert(0, "he"));
        let b = Op::from(Component::insert(2, "y"));
        assert_eq!(compose(&a, &b), Op::from(Component::insert(0, "hey")));
    }

    #[test]
    fn test_compose_matches_sequential_apply() {
        let a = Op::from(vec![Component::insert(1, "XY"), Component::delete(0, "a")]);
        let b = Op::from(vec![Component::delete(1, "Y"), Component::insert(0, "!")]);
        let s = "abc";
        let seq = apply(&apply(s, &a).unwrap(), &b).unwrap();
        assert_eq!(apply(s, &compose(&a, &b)).unwrap(), seq);
    }

    #[test]
    fn test_invert_round_trip() {
        let op = Op::from(vec![
            Component::insert(0, "X"),
            Component::delete(3, "ll"),
            Component::insert(3, "!"),
        ]);
        let s = "hello";
        let applied = apply(s, &op).unwrap();
        assert_eq!(applied, "Xhe!o");
        assert_eq!(apply(&applied, &invert(&op)).unwrap(), s);
    }

    #[test]
    fn test_op_wire_form() {
        let op = Op::from(vec![Component::insert(0, "a"), Component::delete(3, "b")]);
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"[{"p":0,"i":"a"},{"p":3,"d":"b"}]"#);
        assert_eq!(serde_json::from_str::<Op>(&json).unwrap(), op);
    }
}
