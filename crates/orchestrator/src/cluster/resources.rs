//! Node-local cache of compiled deployment resources.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Which cached resources a refresh invalidates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ResourceBundle {
    /// Everything cached on the node.
    Global,
    /// Resources of one owner, e.g. one process definition.
    Scoped { kind: String, id: String },
}

impl ResourceBundle {
    /// Bundle scoped to one owner.
    pub fn scoped(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Scoped {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Scoped { kind, id } => write!(f, "{kind}:{id}"),
        }
    }
}

/// Compiled resources keyed by `(kind, id)`.
#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl ResourceCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache a compiled resource.
    pub fn insert(&self, kind: impl Into<String>, id: impl Into<String>, compiled: Vec<u8>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind.into(), id.into()), compiled);
    }

    /// Look up a compiled resource.
    #[must_use]
    pub fn get(&self, kind: &str, id: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of cached resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the entries covered by `bundle`; returns how many were dropped.
    pub fn invalidate(&self, bundle: &ResourceBundle) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        match bundle {
            ResourceBundle::Global => entries.clear(),
            ResourceBundle::Scoped { kind, id } => {
                entries.remove(&(kind.clone(), id.clone()));
            }
        }
        before.saturating_sub(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_invalidation_keeps_others() {
        let cache = ResourceCache::new();
        cache.insert("definition", "def-1", vec![1]);
        cache.insert("definition", "def-2", vec![2]);

        assert_eq!(cache.invalidate(&ResourceBundle::scoped("definition", "def-1")), 1);
        assert!(cache.get("definition", "def-1").is_none());
        assert_eq!(cache.get("definition", "def-2"), Some(vec![2]));
    }

    #[test]
    fn test_global_invalidation_clears_all() {
        let cache = ResourceCache::new();
        cache.insert("definition", "def-1", vec![1]);
        cache.insert("form", "f-1", vec![2]);

        assert_eq!(cache.invalidate(&ResourceBundle::Global), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_bundle_display() {
        assert_eq!(ResourceBundle::Global.to_string(), "global");
        assert_eq!(ResourceBundle::scoped("definition", "d").to_string(), "definition:d");
    }
}
