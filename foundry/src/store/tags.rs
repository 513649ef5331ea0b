//! Inverted tag index: tag → artifact ids.

use std::collections::{BTreeSet, HashMap};

/// Inverted index from tag to the set of artifact ids carrying it.
#[derive(Debug, Default)]
pub struct TagIndex {
    map: HashMap<String, BTreeSet<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: &str, tags: &BTreeSet<String>) {
        for tag in tags {
            self.map
                .entry(tag.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    pub fn remove(&mut self, id: &str) {
        self.map.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
    }

    /// Ids carrying every one of `tags`. Empty query matches nothing.
    pub fn ids_matching_all(&self, tags: &BTreeSet<String>) -> BTreeSet<String> {
        let mut iter = tags.iter();
        let Some(first) = iter.next() else {
            return BTreeSet::new();
        };
        let mut result = self.map.get(first).cloned().unwrap_or_default();
        for tag in iter {
            match self.map.get(tag) {
                Some(ids) => result.retain(|id| ids.contains(id)),
                None => return BTreeSet::new(),
            }
        }
        result
    }

    /// Export as sorted pairs for persistence.
    pub fn export(&self) -> Vec<(String, Vec<String>)> {
        let mut out: Vec<(String, Vec<String>)> = self
            .map
            .iter()
            .map(|(tag, ids)| (tag.clone(), ids.iter().cloned().collect()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_insert_and_match_single() {
        let mut idx = TagIndex::new();
        idx.insert("a1", &tags(&["math", "fast"]));
        idx.insert("a2", &tags(&["math"]));

        let hits = idx.ids_matching_all(&tags(&["math"]));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_match_all_is_intersection() {
        let mut idx = TagIndex::new();
        idx.insert("a1", &tags(&["math", "fast"]));
        idx.insert("a2", &tags(&["math"]));

        let hits = idx.ids_matching_all(&tags(&["math", "fast"]));
        assert_eq!(hits, tags(&["a1"]));
    }

    #[test]
    fn test_unknown_tag_matches_nothing() {
        let mut idx = TagIndex::new();
        idx.insert("a1", &tags(&["math"]));
        assert!(idx.ids_matching_all(&tags(&["math", "nope"])).is_empty());
    }

    #[test]
    fn test_empty_query_matches_nothing() {
        let mut idx = TagIndex::new();
        idx.insert("a1", &tags(&["math"]));
        assert!(idx.ids_matching_all(&BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_remove_clears_everywhere() {
        let mut idx = TagIndex::new();
        idx.insert("a1", &tags(&["math", "fast"]));
        idx.remove("a1");
        assert!(idx.ids_matching_all(&tags(&["math"])).is_empty());
        assert!(idx.export().is_empty());
    }
}
