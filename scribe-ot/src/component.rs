//! Insert/delete components.
//!
//! Wire form (JSON):
//! ```text
//! { "p": 4, "i": "text" }   insert "text" at 4
//! { "p": 4, "d": "text" }   delete "text" found at 4
//! ```
//! A missing `p` defaults to 0.

use serde::{Deserialize, Serialize};

use crate::text::char_len;

/// A single edit. Deletes carry the removed text so they can be verified
/// against the document and inverted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Component {
    Insert {
        #[serde(rename = "p", default)]
        position: usize,
        #[serde(rename = "i")]
        text: String,
    },
    Delete {
        #[serde(rename = "p", default)]
        position: usize,
        #[serde(rename = "d")]
        text: String,
    },
}

impl Component {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Component::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, text: impl Into<String>) -> Self {
        Component::Delete {
            position,
            text: text.into(),
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Component::Insert { position, .. } | Component::Delete { position, .. } => *position,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Component::Insert { text, .. } | Component::Delete { text, .. } => text,
        }
    }

    /// Length of the inserted or deleted text in chars.
    pub fn char_len(&self) -> usize {
        char_len(self.text())
    }

    /// Empty components are no-ops and are dropped by [`crate::Op::append`].
    pub fn is_noop(&self) -> bool {
        self.text().is_empty()
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Component::Insert { .. })
    }

    /// The component that undoes this one when applied right after it.
    pub fn invert(&self) -> Self {
        match self {
            Component::Insert { position, text } => Component::delete(*position, text.clone()),
            Component::Delete { position, text } => Component::insert(*position, text.clone()),
        }
    }
}
