//! Identifiers shared between the engine and the authoring layer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a scene entity that owns sound instances.
///
/// Entities are created by the authoring layer; the audio engine never
/// allocates them, it only keys its per-entity state by them.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create an EntityId from a raw value
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned for a fire-and-forget one-shot sound.
///
/// Ids increase monotonically per engine, so comparing two ids also tells
/// which one-shot was admitted first.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OneShotId(pub u64);

impl OneShotId {
    /// Get the raw u64 value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for OneShotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OneShotId({})", self.0)
    }
}

impl fmt::Display for OneShotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw() {
        let id = EntityId::from_raw(42);
        assert_eq!(id.raw(), 42);
        assert_eq!(format!("{id:?}"), "EntityId(42)");
    }

    #[test]
    fn test_serde_transparent() {
        let id: EntityId = serde_json::from_str("7").unwrap();
        assert_eq!(id, EntityId(7));
        assert_eq!(serde_json::to_string(&OneShotId(3)).unwrap(), "3");
    }

    #[test]
    fn test_one_shot_ordering() {
        assert!(OneShotId(1) < OneShotId(2));
    }
}
