//! Classify ids missing from a target collection against a backup snapshot,
//! and merge recoverable records back when the caller asks for it.

use std::collections::{BTreeSet, HashSet};

use quizcat_core::{CatalogEntry, CatalogIssue, QuizRecord};
use serde::Serialize;

use crate::analyzer::id_set;
use crate::dedup::dedupe;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryPlan {
    pub recoverable: BTreeSet<String>,
    pub unrecoverable: BTreeSet<String>,
}

impl RecoveryPlan {
    pub fn gaps(&self) -> Vec<CatalogIssue> {
        self.unrecoverable
            .iter()
            .map(|id| CatalogIssue::RecoveryGap { id: id.clone() })
            .collect()
    }
}

/// Holds a backup store that has already been through the deduplicator.
#[derive(Debug, Clone, Default)]
pub struct RecoveryResolver {
    backup: Vec<QuizRecord>,
    backup_ids: BTreeSet<String>,
    duplicates_discarded: usize,
}

impl RecoveryResolver {
    pub fn new(backup: Vec<QuizRecord>) -> Self {
        let outcome = dedupe(backup);
        let backup_ids = id_set(&outcome.records);
        Self {
            backup: outcome.records,
            backup_ids,
            duplicates_discarded: outcome.removed.len(),
        }
    }

    /// Resolver with nothing to recover from.
    pub fn without_backup() -> Self {
        Self::default()
    }

    pub fn backup_ids(&self) -> &BTreeSet<String> {
        &self.backup_ids
    }

    pub fn duplicates_discarded(&self) -> usize {
        self.duplicates_discarded
    }

    pub fn classify(&self, missing: &BTreeSet<String>) -> RecoveryPlan {
        let (recoverable, unrecoverable) = missing
            .iter()
            .cloned()
            .partition(|id| self.backup_ids.contains(id));
        RecoveryPlan {
            recoverable,
            unrecoverable,
        }
    }

    /// Append the plan's recoverable records to `target` in backup order, skipping
    /// ids `target` already holds. When `target` carries sequence numbers they are
    /// rewritten densely afterwards; otherwise merged records are left unnumbered.
    /// Returns the merged ids in the order they were appended.
    pub fn merge_into(&self, plan: &RecoveryPlan, target: &mut Vec<QuizRecord>) -> Vec<String> {
        let present: HashSet<String> = target.iter().map(|r| r.id().to_string()).collect();
        let numbered = target.iter().any(|r| r.number.is_some());

        let mut merged = Vec::new();
        for record in &self.backup {
            if plan.recoverable.contains(&record.id) && !present.contains(&record.id) {
                let mut recovered = record.clone();
                recovered.number = None;
                merged.push(recovered.id.clone());
                target.push(recovered);
            }
        }

        if numbered {
            for (index, record) in target.iter_mut().enumerate() {
                record.set_number(index as u32 + 1);
            }
        }
        merged
    }
}
