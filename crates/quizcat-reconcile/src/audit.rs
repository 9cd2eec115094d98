//! Field-level description upsert and catalog description audit.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use quizcat_core::{DescriptionEntry, QuizRecord, META_DESCRIPTION_MAX_CHARS};
use serde::Serialize;
use strsim::jaro_winkler;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub updated: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
    pub records_without_description: BTreeSet<String>,
    pub descriptions_without_record: BTreeSet<String>,
}

/// Write `metaDescription` from `descriptions` onto matching records. Only that
/// field is touched; the first description listed for an id wins.
pub fn upsert_descriptions(records: &mut [QuizRecord], descriptions: &[DescriptionEntry]) -> UpsertReport {
    let mut by_id: HashMap<&str, &str> = HashMap::with_capacity(descriptions.len());
    for entry in descriptions {
        by_id
            .entry(entry.id.as_str())
            .or_insert(entry.meta_description.as_str());
    }

    let mut report = UpsertReport::default();
    let mut matched: BTreeSet<String> = BTreeSet::new();
    for record in records.iter_mut() {
        match by_id.get(record.id.as_str()) {
            Some(description) => {
                matched.insert(record.id.clone());
                if record.meta_description.as_deref() == Some(*description) {
                    report.unchanged.insert(record.id.clone());
                } else {
                    record.meta_description = Some(description.to_string());
                    report.updated.insert(record.id.clone());
                }
            }
            None => {
                report.records_without_description.insert(record.id.clone());
            }
        }
    }

    report.descriptions_without_record = by_id
        .keys()
        .filter(|id| !matched.contains(**id))
        .map(|id| id.to_string())
        .collect();
    report
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlongDescription {
    pub id: String,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarDescriptions {
    pub id_a: String,
    pub id_b: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct SimilarityConfig {
    pub review_threshold: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.92,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DescriptionAudit {
    /// Description text -> ids sharing it (only texts used more than once).
    pub collisions: BTreeMap<String, Vec<String>>,
    pub overlong: Vec<OverlongDescription>,
    pub missing: BTreeSet<String>,
    /// Near-identical pairs for manual review; not a defect on their own.
    pub similar: Vec<SimilarDescriptions>,
}

impl DescriptionAudit {
    pub fn is_clean(&self) -> bool {
        self.collisions.is_empty() && self.overlong.is_empty() && self.missing.is_empty()
    }
}

fn similarity_key(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn audit_descriptions(records: &[QuizRecord], config: SimilarityConfig) -> DescriptionAudit {
    let mut audit = DescriptionAudit::default();
    let mut owners: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for record in records {
        match &record.meta_description {
            Some(text) => {
                owners.entry(text.clone()).or_default().push(record.id.clone());
                let length = text.chars().count();
                if length > META_DESCRIPTION_MAX_CHARS {
                    audit.overlong.push(OverlongDescription {
                        id: record.id.clone(),
                        length,
                    });
                }
            }
            None => {
                audit.missing.insert(record.id.clone());
            }
        }
    }
    audit.overlong.sort_by(|a, b| a.id.cmp(&b.id));

    // one representative (first owner) per distinct text
    let distinct: Vec<(String, &str)> = owners
        .iter()
        .map(|(text, ids)| (similarity_key(text), ids[0].as_str()))
        .collect();
    for i in 0..distinct.len() {
        for j in (i + 1)..distinct.len() {
            let score = jaro_winkler(&distinct[i].0, &distinct[j].0);
            if score >= config.review_threshold {
                let (a, b) = if distinct[i].1 <= distinct[j].1 {
                    (distinct[i].1, distinct[j].1)
                } else {
                    (distinct[j].1, distinct[i].1)
                };
                audit.similar.push(SimilarDescriptions {
                    id_a: a.to_string(),
                    id_b: b.to_string(),
                    score,
                });
            }
        }
    }
    audit.similar.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.id_a.cmp(&b.id_a))
            .then_with(|| a.id_b.cmp(&b.id_b))
    });

    owners.retain(|_, ids| ids.len() > 1);
    for ids in owners.values_mut() {
        ids.sort();
    }
    audit.collisions = owners;
    audit
}
