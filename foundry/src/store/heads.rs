//! Namespace head map — `namespace → promoted artifact id`.
//!
//! Promotion is a compare-and-set on `(old_id, new_id)`; readers observe
//! the old head or the new head, never a torn state.

use std::collections::HashMap;

/// Outcome of a failed compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadCasConflict {
    pub namespace: String,
    /// Head observed at swap time.
    pub actual: Option<String>,
}

/// The promoted-head mapping.
#[derive(Debug, Default)]
pub struct HeadMap {
    map: HashMap<String, String>,
}

impl HeadMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            map: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, namespace: &str) -> Option<&str> {
        self.map.get(namespace).map(|s| s.as_str())
    }

    /// Atomically swap the head for `namespace` from `expected_old` to
    /// `new_id`. Fails when the current head differs from the expectation.
    pub fn compare_and_set(
        &mut self,
        namespace: &str,
        expected_old: Option<&str>,
        new_id: &str,
    ) -> Result<(), HeadCasConflict> {
        let current = self.map.get(namespace).map(|s| s.as_str());
        if current != expected_old {
            return Err(HeadCasConflict {
                namespace: namespace.to_string(),
                actual: current.map(|s| s.to_string()),
            });
        }
        self.map.insert(namespace.to_string(), new_id.to_string());
        Ok(())
    }

    /// Sorted `(namespace, head)` pairs for persistence and listing.
    pub fn export(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_from_empty() {
        let mut heads = HeadMap::new();
        heads.compare_and_set("translator", None, "art-1").unwrap();
        assert_eq!(heads.get("translator"), Some("art-1"));
    }

    #[test]
    fn test_cas_replaces_expected() {
        let mut heads = HeadMap::new();
        heads.compare_and_set("translator", None, "art-1").unwrap();
        heads
            .compare_and_set("translator", Some("art-1"), "art-2")
            .unwrap();
        assert_eq!(heads.get("translator"), Some("art-2"));
    }

    #[test]
    fn test_cas_conflict_on_stale_expectation() {
        let mut heads = HeadMap::new();
        heads.compare_and_set("translator", None, "art-1").unwrap();

        let err = heads
            .compare_and_set("translator", Some("art-0"), "art-2")
            .unwrap_err();
        assert_eq!(err.actual.as_deref(), Some("art-1"));
        // Head unchanged after a failed swap.
        assert_eq!(heads.get("translator"), Some("art-1"));
    }

    #[test]
    fn test_cas_conflict_when_head_appeared() {
        let mut heads = HeadMap::new();
        heads.compare_and_set("translator", None, "art-1").unwrap();
        assert!(heads.compare_and_set("translator", None, "art-2").is_err());
    }

    #[test]
    fn test_export_sorted() {
        let mut heads = HeadMap::new();
        heads.compare_and_set("zeta", None, "art-z").unwrap();
        heads.compare_and_set("alpha", None, "art-a").unwrap();
        let pairs = heads.export();
        assert_eq!(pairs[0].0, "alpha");
        assert_eq!(pairs[1].0, "zeta");
    }
}
