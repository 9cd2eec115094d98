//! First-occurrence-wins deduplication with sequential renumbering.

use std::collections::HashMap;

use quizcat_core::CatalogEntry;
use serde::Serialize;

/// A discarded later occurrence of an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedDuplicate {
    /// 0-based position in the input sequence.
    pub position: usize,
    /// 0-based input position of the occurrence that was kept.
    pub kept_position: usize,
    pub id: String,
    pub title: String,
    pub original_number: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DedupOutcome<T> {
    pub records: Vec<T>,
    pub removed: Vec<RemovedDuplicate>,
}

impl<T> DedupOutcome<T> {
    pub fn changed(&self) -> bool {
        !self.removed.is_empty()
    }
}

/// Keep the first record seen for each id, in input order, then rewrite
/// `number` to 1..=N. Prior `number` values are discarded.
pub fn dedupe<T: CatalogEntry>(records: Vec<T>) -> DedupOutcome<T> {
    let mut kept_at: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut kept = Vec::with_capacity(records.len());
    let mut removed = Vec::new();

    for (position, record) in records.into_iter().enumerate() {
        if let Some(&kept_position) = kept_at.get(record.id()) {
            removed.push(RemovedDuplicate {
                position,
                kept_position,
                id: record.id().to_string(),
                title: record.title().to_string(),
                original_number: record.number(),
            });
            continue;
        }
        kept_at.insert(record.id().to_string(), position);
        kept.push(record);
    }

    for (index, record) in kept.iter_mut().enumerate() {
        record.set_number(index as u32 + 1);
    }

    DedupOutcome {
        records: kept,
        removed,
    }
}
