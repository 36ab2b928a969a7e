//! Entity identifiers and stream cursors
//!
//! Providers stream [`EntityIdWithRevision`] values in ascending order. The
//! last one seen becomes a [`StreamCursor`], the lower bound for the next
//! request to that provider.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An entity identifier together with its latest known revision
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityIdWithRevision {
    pub entity_id: String,
    pub revision: u64,
}

impl EntityIdWithRevision {
    pub fn new(entity_id: impl Into<String>, revision: u64) -> Self {
        Self {
            entity_id: entity_id.into(),
            revision,
        }
    }
}

impl fmt::Display for EntityIdWithRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.entity_id, self.revision)
    }
}

/// Position in a provider's stream: everything up to and including it was seen
///
/// Ordered by entity id, then revision. The empty cursor sorts before every
/// other cursor and means "from the beginning".
///
/// # Example
///
/// ```
/// use virta::cursor::{EntityIdWithRevision, StreamCursor};
///
/// let seen = EntityIdWithRevision::new("thing:42", 7);
/// let cursor = StreamCursor::from(&seen);
/// assert!(StreamCursor::empty() < cursor);
/// assert!(!cursor.is_empty());
/// ```
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StreamCursor {
    entity_id: String,
    revision: u64,
}

impl StreamCursor {
    /// The cursor before the first element
    pub const fn empty() -> Self {
        Self {
            entity_id: String::new(),
            revision: 0,
        }
    }

    pub fn new(entity_id: impl Into<String>, revision: u64) -> Self {
        Self {
            entity_id: entity_id.into(),
            revision,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entity_id.is_empty()
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl From<&EntityIdWithRevision> for StreamCursor {
    fn from(element: &EntityIdWithRevision) -> Self {
        Self::new(element.entity_id.clone(), element.revision)
    }
}

impl From<EntityIdWithRevision> for StreamCursor {
    fn from(element: EntityIdWithRevision) -> Self {
        Self {
            entity_id: element.entity_id,
            revision: element.revision,
        }
    }
}

impl fmt::Display for StreamCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("<start>")
        } else {
            write!(f, "{}@{}", self.entity_id, self.revision)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cursor_sorts_first() {
        let mut cursors = vec![
            StreamCursor::new("b", 1),
            StreamCursor::empty(),
            StreamCursor::new("a", 9),
            StreamCursor::new("a", 2),
        ];
        cursors.sort();

        assert_eq!(
            cursors,
            vec![
                StreamCursor::empty(),
                StreamCursor::new("a", 2),
                StreamCursor::new("a", 9),
                StreamCursor::new("b", 1),
            ]
        );
    }

    #[test]
    fn test_default_is_empty() {
        assert_eq!(StreamCursor::default(), StreamCursor::empty());
        assert!(StreamCursor::default().is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(StreamCursor::empty().to_string(), "<start>");
        assert_eq!(
            StreamCursor::from(EntityIdWithRevision::new("ns:thing", 3)).to_string(),
            "ns:thing@3"
        );
    }
}
