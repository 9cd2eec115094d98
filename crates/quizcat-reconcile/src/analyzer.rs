//! Identifier set algebra across collections and build output.
//!
//! Every result is a `BTreeSet`/`BTreeMap` so listings come out sorted by id and
//! audit output diffs cleanly between runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use quizcat_core::{CatalogEntry, CatalogIssue, RegistryEntry};
use serde::Serialize;

pub fn id_set<T: CatalogEntry>(records: &[T]) -> BTreeSet<String> {
    records.iter().map(|r| r.id().to_string()).collect()
}

/// Ids that occur more than once, with their occurrence counts.
pub fn duplicates<T: CatalogEntry>(records: &[T]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        *counts.entry(record.id().to_string()).or_default() += 1;
    }
    counts.retain(|_, count| *count > 1);
    counts
}

pub fn duplicate_issues(collection: &str, duplicates: &BTreeMap<String, usize>) -> Vec<CatalogIssue> {
    duplicates
        .iter()
        .map(|(id, count)| CatalogIssue::DuplicateIdentifier {
            collection: collection.to_string(),
            id: id.clone(),
            count: *count,
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentityDiff {
    /// In expected, not in actual.
    pub missing: BTreeSet<String>,
    /// In actual, not in expected.
    pub extra: BTreeSet<String>,
}

impl IdentityDiff {
    pub fn is_aligned(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

pub fn diff(expected: &BTreeSet<String>, actual: &BTreeSet<String>) -> IdentityDiff {
    IdentityDiff {
        missing: expected.difference(actual).cloned().collect(),
        extra: actual.difference(expected).cloned().collect(),
    }
}

pub fn unbuilt(source: &BTreeSet<String>, built: &BTreeSet<String>) -> BTreeSet<String> {
    source.difference(built).cloned().collect()
}

/// Ids present in both the content store and the registry.
pub fn buildable(content: &BTreeSet<String>, registry: &BTreeSet<String>) -> BTreeSet<String> {
    content.intersection(registry).cloned().collect()
}

/// Build outputs with no content store record behind them.
pub fn orphaned_outputs(built: &BTreeSet<String>, content: &BTreeSet<String>) -> BTreeSet<String> {
    built.difference(content).cloned().collect()
}

/// An id annotated with its registry position, when it has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryRef {
    pub number: Option<u32>,
    pub id: String,
    pub title: Option<String>,
}

/// Sort ids by their registry `number` (first registry occurrence wins), then by
/// id; ids unknown to the registry sort last.
pub fn ordered_by_registry(ids: &BTreeSet<String>, registry: &[RegistryEntry]) -> Vec<RegistryRef> {
    let mut first_seen: HashMap<&str, &RegistryEntry> = HashMap::new();
    for entry in registry {
        first_seen.entry(entry.id.as_str()).or_insert(entry);
    }

    let mut refs: Vec<RegistryRef> = ids
        .iter()
        .map(|id| match first_seen.get(id.as_str()) {
            Some(entry) => RegistryRef {
                number: Some(entry.number),
                id: id.clone(),
                title: Some(entry.title.clone()),
            },
            None => RegistryRef {
                number: None,
                id: id.clone(),
                title: None,
            },
        })
        .collect();
    refs.sort_by(|a, b| {
        a.number
            .unwrap_or(u32::MAX)
            .cmp(&b.number.unwrap_or(u32::MAX))
            .then_with(|| a.id.cmp(&b.id))
    });
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn diff_reports_missing_and_extra() {
        let result = diff(&ids(&["a", "b", "c"]), &ids(&["b", "c", "d"]));
        assert_eq!(result.missing, ids(&["a"]));
        assert_eq!(result.extra, ids(&["d"]));
        assert!(result.missing.is_disjoint(&result.extra));
        assert!(!result.is_aligned());
    }

    #[test]
    fn identical_sets_are_aligned() {
        assert!(diff(&ids(&["a", "b"]), &ids(&["b", "a"])).is_aligned());
    }

    #[test]
    fn duplicates_only_reports_repeated_ids() {
        let registry = vec![
            RegistryEntry::new(1, "a", "A"),
            RegistryEntry::new(2, "b", "B"),
            RegistryEntry::new(3, "a", "A-dup"),
            RegistryEntry::new(4, "a", "A-dup-2"),
        ];
        let dups = duplicates(&registry);
        assert_eq!(dups.len(), 1);
        assert_eq!(dups.get("a"), Some(&3));

        let issues = duplicate_issues("registry", &dups);
        assert_eq!(
            issues,
            vec![CatalogIssue::DuplicateIdentifier {
                collection: "registry".into(),
                id: "a".into(),
                count: 3,
            }]
        );
    }

    #[test]
    fn build_output_set_algebra() {
        let content = ids(&["a", "b", "c"]);
        let registry = ids(&["a", "b", "z"]);
        let built = ids(&["a", "stale"]);

        let can_build = buildable(&content, &registry);
        assert_eq!(can_build, ids(&["a", "b"]));
        assert_eq!(unbuilt(&can_build, &built), ids(&["b"]));
        assert_eq!(orphaned_outputs(&built, &content), ids(&["stale"]));
    }

    #[test]
    fn registry_ordering_uses_number_then_id() {
        let registry = vec![
            RegistryEntry::new(3, "c", "C"),
            RegistryEntry::new(1, "a", "A"),
            RegistryEntry::new(9, "a", "A again"),
        ];
        let ordered = ordered_by_registry(&ids(&["zzz", "c", "a"]), &registry);
        let order: Vec<_> = ordered.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["a", "c", "zzz"]);
        assert_eq!(ordered[0].title.as_deref(), Some("A"));
        assert_eq!(ordered[2].number, None);
    }
}
