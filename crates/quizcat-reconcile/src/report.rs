//! Pass reports: serializable for the JSON audit trail, renderable for stdout.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use quizcat_core::CatalogIssue;
use quizcat_storage::WrittenCollection;
use serde::Serialize;

use crate::analyzer::{IdentityDiff, RegistryRef};
use crate::audit::{DescriptionAudit, UpsertReport};
use crate::dedup::RemovedDuplicate;
use crate::descriptions::{DescribedRecord, DescriptionStats};
use crate::recovery::RecoveryPlan;

/// Listings longer than this are cut short on stdout; JSON reports stay complete.
const LIST_LIMIT: usize = 10;

pub trait PassReport: Serialize {
    const PASS: &'static str;

    /// True when the report carries something a human has to resolve.
    fn needs_attention(&self) -> bool;

    fn render(&self) -> String;
}

fn heading(lines: &mut Vec<String>, title: &str) {
    lines.push(title.to_string());
    lines.push("=".repeat(title.chars().count()));
}

fn push_list<I, S>(lines: &mut Vec<String>, label: &str, items: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let items: Vec<S> = items.into_iter().collect();
    if items.is_empty() {
        return;
    }
    lines.push(String::new());
    lines.push(format!("{label} ({}):", items.len()));
    for (i, item) in items.iter().take(LIST_LIMIT).enumerate() {
        lines.push(format!("  {:>2}. {}", i + 1, item.as_ref()));
    }
    if items.len() > LIST_LIMIT {
        lines.push(format!("  ... and {} more", items.len() - LIST_LIMIT));
    }
}

fn registry_ref_line(r: &RegistryRef) -> String {
    match (&r.number, &r.title) {
        (Some(number), Some(title)) => format!("#{number:>3} {} - {title}", r.id),
        _ => r.id.clone(),
    }
}

fn duplicate_lines(dups: &BTreeMap<String, usize>) -> Vec<String> {
    dups.iter()
        .map(|(id, count)| format!("{id}: {count} times"))
        .collect()
}

fn written_line(w: &WrittenCollection) -> String {
    format!(
        "{} ({} records, {} bytes, sha256 {})",
        w.path.display(),
        w.records,
        w.bytes,
        w.sha256
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct CountReport {
    pub registry_total: usize,
    pub registry_unique: usize,
    pub content_total: usize,
    pub content_unique: usize,
    pub content_duplicates: BTreeMap<String, usize>,
    pub diff: IdentityDiff,
    pub built_total: usize,
    pub buildable_total: usize,
    pub unbuilt: BTreeSet<String>,
    pub orphaned_outputs: BTreeSet<String>,
    pub issues: Vec<CatalogIssue>,
}

impl PassReport for CountReport {
    const PASS: &'static str = "count";

    fn needs_attention(&self) -> bool {
        !self.content_duplicates.is_empty()
            || !self.diff.is_aligned()
            || !self.unbuilt.is_empty()
            || !self.orphaned_outputs.is_empty()
    }

    fn render(&self) -> String {
        let mut lines = Vec::new();
        heading(&mut lines, "Quiz count analysis");
        lines.push(format!("Registry entries:        {}", self.registry_total));
        lines.push(format!("Registry unique ids:     {}", self.registry_unique));
        lines.push(format!("Content store records:   {}", self.content_total));
        lines.push(format!("Content store unique:    {}", self.content_unique));
        lines.push(format!("Buildable (both):        {}", self.buildable_total));
        lines.push(format!("Built pages:             {}", self.built_total));
        lines.push(format!("Missing from content:    {}", self.diff.missing.len()));
        lines.push(format!("Extra in content:        {}", self.diff.extra.len()));
        lines.push(format!("Failed to build:         {}", self.unbuilt.len()));
        lines.push(format!("Orphaned build outputs:  {}", self.orphaned_outputs.len()));
        push_list(
            &mut lines,
            "Duplicate ids in content store",
            duplicate_lines(&self.content_duplicates),
        );
        push_list(&mut lines, "Missing from content store", &self.diff.missing);
        push_list(&mut lines, "Extra in content store", &self.diff.extra);
        push_list(&mut lines, "Failed to build", &self.unbuilt);
        push_list(&mut lines, "Orphaned build outputs", &self.orphaned_outputs);
        push_list(&mut lines, "Skipped entries", self.issues.iter().map(|i| i.to_string()));
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MismatchReport {
    pub registry_total: usize,
    pub content_total: usize,
    pub registry_duplicates: BTreeMap<String, usize>,
    pub content_duplicates: BTreeMap<String, usize>,
    pub missing: Vec<RegistryRef>,
    pub extra: BTreeSet<String>,
    pub issues: Vec<CatalogIssue>,
}

impl PassReport for MismatchReport {
    const PASS: &'static str = "mismatch";

    fn needs_attention(&self) -> bool {
        !self.registry_duplicates.is_empty()
            || !self.content_duplicates.is_empty()
            || !self.missing.is_empty()
            || !self.extra.is_empty()
            || !self.issues.is_empty()
    }

    fn render(&self) -> String {
        let mut lines = Vec::new();
        heading(&mut lines, "Registry / content store mismatch");
        lines.push(format!("Registry entries:      {}", self.registry_total));
        lines.push(format!("Content store records: {}", self.content_total));
        lines.push(format!(
            "Difference:            {}",
            self.registry_total as i64 - self.content_total as i64
        ));
        push_list(&mut lines, "Entries without a usable id", self.issues.iter().map(|i| i.to_string()));
        push_list(&mut lines, "Duplicates in registry", duplicate_lines(&self.registry_duplicates));
        push_list(&mut lines, "Duplicates in content store", duplicate_lines(&self.content_duplicates));
        push_list(&mut lines, "Missing from content store", self.missing.iter().map(registry_ref_line));
        push_list(&mut lines, "Extra in content store", &self.extra);
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupStatus {
    pub available: bool,
    pub total: usize,
    pub duplicates_discarded: usize,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissingReport {
    pub registry_total: usize,
    pub content_total: usize,
    pub missing: Vec<RegistryRef>,
    pub backup: BackupStatus,
    pub plan: RecoveryPlan,
}

impl PassReport for MissingReport {
    const PASS: &'static str = "missing";

    fn needs_attention(&self) -> bool {
        !self.missing.is_empty()
    }

    fn render(&self) -> String {
        let mut lines = Vec::new();
        heading(&mut lines, "Missing quizzes");
        lines.push(format!("Registry entries:      {}", self.registry_total));
        lines.push(format!("Content store records: {}", self.content_total));
        lines.push(format!("Missing ids:           {}", self.missing.len()));
        push_list(&mut lines, "Missing", self.missing.iter().map(registry_ref_line));
        lines.push(String::new());
        if self.backup.available {
            lines.push(format!(
                "Backup store: {} records ({} duplicates discarded)",
                self.backup.total, self.backup.duplicates_discarded
            ));
            lines.push(format!("Recoverable from backup: {}", self.plan.recoverable.len()));
            lines.push(format!("Missing everywhere:      {}", self.plan.unrecoverable.len()));
            if !self.plan.recoverable.is_empty() {
                lines.push(format!(
                    "Run `quizcat recover` to merge {} records back.",
                    self.plan.recoverable.len()
                ));
            }
        } else {
            lines.push(format!(
                "Backup store unavailable: {}",
                self.backup.reason.as_deref().unwrap_or("unknown")
            ));
        }
        push_list(&mut lines, "Missing everywhere", &self.plan.unrecoverable);
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoverReport {
    pub backup: BackupStatus,
    pub plan: RecoveryPlan,
    pub merged: Vec<String>,
    /// Content store entries that failed to parse; written back unchanged.
    pub kept_malformed: Vec<CatalogIssue>,
    pub written: Option<WrittenCollection>,
}

impl PassReport for RecoverReport {
    const PASS: &'static str = "recover";

    fn needs_attention(&self) -> bool {
        !self.plan.unrecoverable.is_empty()
    }

    fn render(&self) -> String {
        let mut lines = Vec::new();
        heading(&mut lines, "Recovery from backup");
        if !self.backup.available {
            lines.push(format!(
                "Backup store unavailable: {}",
                self.backup.reason.as_deref().unwrap_or("unknown")
            ));
        }
        lines.push(format!("Recoverable: {}", self.plan.recoverable.len()));
        lines.push(format!("Merged:      {}", self.merged.len()));
        lines.push(format!("Gaps:        {}", self.plan.unrecoverable.len()));
        push_list(&mut lines, "Merged into content store", &self.merged);
        push_list(
            &mut lines,
            "Recovery gaps (manual intervention needed)",
            self.plan.gaps().iter().map(|i| i.to_string()),
        );
        push_list(
            &mut lines,
            "Malformed entries kept as-is",
            self.kept_malformed.iter().map(|i| i.to_string()),
        );
        if let Some(written) = &self.written {
            lines.push(String::new());
            lines.push(format!("Wrote {}", written_line(written)));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupeRegistryReport {
    pub original_total: usize,
    pub final_total: usize,
    pub removed: Vec<RemovedDuplicate>,
    pub dropped_malformed: Vec<CatalogIssue>,
    /// Problems found reading the staged copy back; any problem blocks promotion.
    pub verification_problems: Vec<String>,
    /// Deduplicated registry ids against the content store.
    pub content_diff: IdentityDiff,
    pub promoted: bool,
    /// The replaced registry when promoted, the staged copy otherwise.
    pub written: WrittenCollection,
}

impl PassReport for DedupeRegistryReport {
    const PASS: &'static str = "dedupe-registry";

    fn needs_attention(&self) -> bool {
        !self.promoted || !self.content_diff.is_aligned()
    }

    fn render(&self) -> String {
        let mut lines = Vec::new();
        heading(&mut lines, "Registry deduplication");
        lines.push(format!("Original entries:   {}", self.original_total));
        lines.push(format!("Unique entries:     {}", self.final_total));
        lines.push(format!("Duplicates removed: {}", self.removed.len()));
        push_list(
            &mut lines,
            "Removed duplicates",
            self.removed.iter().map(|r| {
                format!(
                    "#{} {} - {}",
                    r.original_number
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    r.id,
                    r.title
                )
            }),
        );
        push_list(
            &mut lines,
            "Malformed entries not written back",
            self.dropped_malformed.iter().map(|i| i.to_string()),
        );
        lines.push(String::new());
        lines.push(format!(
            "Against content store: missing {}, extra {}",
            self.content_diff.missing.len(),
            self.content_diff.extra.len()
        ));
        push_list(&mut lines, "Missing from content store", &self.content_diff.missing);
        push_list(&mut lines, "Extra in content store", &self.content_diff.extra);
        lines.push(String::new());
        if self.promoted {
            lines.push(format!("Registry replaced: {}", written_line(&self.written)));
        } else {
            push_list(&mut lines, "Verification failed", &self.verification_problems);
            lines.push(format!(
                "Registry left untouched; corrected copy staged at {}",
                self.written.path.display()
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreDedupResult {
    pub collection: String,
    pub available: bool,
    pub original_total: usize,
    pub removed: Vec<RemovedDuplicate>,
    pub kept_malformed: Vec<CatalogIssue>,
    pub verification_problems: Vec<String>,
    pub staged_path: Option<PathBuf>,
    pub written: Option<WrittenCollection>,
}

impl StoreDedupResult {
    pub fn promoted(&self) -> bool {
        self.available && self.verification_problems.is_empty() && self.written.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupeStoresReport {
    pub stores: Vec<StoreDedupResult>,
}

impl PassReport for DedupeStoresReport {
    const PASS: &'static str = "dedupe-stores";

    fn needs_attention(&self) -> bool {
        self.stores
            .iter()
            .any(|s| s.available && !s.verification_problems.is_empty())
    }

    fn render(&self) -> String {
        let mut lines = Vec::new();
        heading(&mut lines, "Store deduplication");
        for store in &self.stores {
            lines.push(String::new());
            if !store.available {
                lines.push(format!("{}: unavailable, skipped", store.collection));
                continue;
            }
            lines.push(format!(
                "{}: {} records, {} duplicates removed",
                store.collection,
                store.original_total,
                store.removed.len()
            ));
            push_list(
                &mut lines,
                "Removed duplicates",
                store.removed.iter().map(|r| format!("[{}] {}", r.position, r.id)),
            );
            push_list(
                &mut lines,
                "Malformed entries kept as-is",
                store.kept_malformed.iter().map(|i| i.to_string()),
            );
            if store.promoted() {
                if let Some(written) = &store.written {
                    lines.push(format!("  replaced {}", written_line(written)));
                }
            } else {
                push_list(&mut lines, "Verification failed", &store.verification_problems);
                if let Some(staged) = &store.staged_path {
                    lines.push(format!("  original untouched; staged copy at {}", staged.display()));
                }
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DescribeReport {
    pub generator: String,
    pub registry_duplicates_skipped: usize,
    pub resumed: usize,
    /// Progress entries whose text collided with an earlier one and were generated again.
    pub requeued: Vec<String>,
    pub described: Vec<DescribedRecord>,
    pub stats: DescriptionStats,
    pub written: WrittenCollection,
}

impl PassReport for DescribeReport {
    const PASS: &'static str = "describe";

    fn needs_attention(&self) -> bool {
        self.stats.duplicates > 0 || self.stats.max_length > quizcat_core::META_DESCRIPTION_MAX_CHARS
    }

    fn render(&self) -> String {
        let mut lines = Vec::new();
        heading(&mut lines, "Meta description generation");
        lines.push(format!("Generator:            {}", self.generator));
        lines.push(format!("Resumed from progress: {}", self.resumed));
        lines.push(format!("Newly described:      {}", self.described.len()));
        push_list(&mut lines, "Requeued from progress", &self.requeued);
        if self.registry_duplicates_skipped > 0 {
            lines.push(format!(
                "Duplicate registry ids skipped: {}",
                self.registry_duplicates_skipped
            ));
        }
        lines.push(String::new());
        lines.push(format!("Total:        {}", self.stats.total));
        lines.push(format!("Unique:       {}", self.stats.unique));
        lines.push(format!("Duplicates:   {}", self.stats.duplicates));
        lines.push(format!("Avg length:   {:.1}", self.stats.average_length));
        lines.push(format!("Min length:   {}", self.stats.min_length));
        lines.push(format!("Max length:   {}", self.stats.max_length));
        for (source, count) in &self.stats.by_source {
            lines.push(format!("  {source}: {count}"));
        }
        push_list(
            &mut lines,
            "Samples",
            self.described
                .iter()
                .take(5)
                .map(|d| format!("{} -> {}", d.entry.id, d.entry.meta_description)),
        );
        lines.push(String::new());
        lines.push(format!("Wrote {}", written_line(&self.written)));
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreUpsert {
    pub collection: String,
    pub available: bool,
    pub reason: Option<String>,
    pub upsert: UpsertReport,
    pub kept_malformed: Vec<CatalogIssue>,
    pub written: Option<WrittenCollection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyDescriptionsReport {
    pub descriptions_total: usize,
    pub stores: Vec<StoreUpsert>,
}

impl PassReport for ApplyDescriptionsReport {
    const PASS: &'static str = "apply-descriptions";

    fn needs_attention(&self) -> bool {
        self.stores
            .iter()
            .any(|s| !s.upsert.records_without_description.is_empty())
    }

    fn render(&self) -> String {
        let mut lines = Vec::new();
        heading(&mut lines, "Apply meta descriptions");
        lines.push(format!("Descriptions loaded: {}", self.descriptions_total));
        for store in &self.stores {
            lines.push(String::new());
            if !store.available {
                lines.push(format!(
                    "{}: skipped ({})",
                    store.collection,
                    store.reason.as_deref().unwrap_or("unavailable")
                ));
                continue;
            }
            lines.push(format!(
                "{}: {} updated, {} unchanged",
                store.collection,
                store.upsert.updated.len(),
                store.upsert.unchanged.len()
            ));
            push_list(
                &mut lines,
                "Records without a description",
                &store.upsert.records_without_description,
            );
            push_list(
                &mut lines,
                "Descriptions without a record",
                &store.upsert.descriptions_without_record,
            );
            push_list(
                &mut lines,
                "Malformed entries kept as-is",
                store.kept_malformed.iter().map(|i| i.to_string()),
            );
            if let Some(written) = &store.written {
                lines.push(format!("  wrote {}", written_line(written)));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportRegistryReport {
    pub total: usize,
    pub duplicates: BTreeMap<String, usize>,
    pub issues: Vec<CatalogIssue>,
    pub written: WrittenCollection,
}

impl PassReport for ExportRegistryReport {
    const PASS: &'static str = "export-registry";

    fn needs_attention(&self) -> bool {
        !self.duplicates.is_empty()
    }

    fn render(&self) -> String {
        let mut lines = Vec::new();
        heading(&mut lines, "Registry export");
        lines.push(format!("Exported {} entries", self.total));
        push_list(
            &mut lines,
            "Duplicate ids carried over (run `quizcat dedupe-registry`)",
            duplicate_lines(&self.duplicates),
        );
        push_list(&mut lines, "Skipped entries", self.issues.iter().map(|i| i.to_string()));
        lines.push(String::new());
        lines.push(format!("Wrote {}", written_line(&self.written)));
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditDescriptionsReport {
    pub total: usize,
    pub audit: DescriptionAudit,
}

impl PassReport for AuditDescriptionsReport {
    const PASS: &'static str = "audit-descriptions";

    fn needs_attention(&self) -> bool {
        !self.audit.is_clean()
    }

    fn render(&self) -> String {
        let mut lines = Vec::new();
        heading(&mut lines, "Meta description audit");
        lines.push(format!("Records checked:        {}", self.total));
        lines.push(format!("Colliding descriptions: {}", self.audit.collisions.len()));
        lines.push(format!("Over the length limit:  {}", self.audit.overlong.len()));
        lines.push(format!("Without a description:  {}", self.audit.missing.len()));
        lines.push(format!("Near-duplicate pairs:   {}", self.audit.similar.len()));
        push_list(
            &mut lines,
            "Collisions",
            self.audit
                .collisions
                .iter()
                .map(|(text, ids)| format!("{} x{}: {}", ids.join(", "), ids.len(), text)),
        );
        push_list(
            &mut lines,
            "Over the length limit",
            self.audit
                .overlong
                .iter()
                .map(|o| format!("{} ({} chars)", o.id, o.length)),
        );
        push_list(&mut lines, "Without a description", &self.audit.missing);
        push_list(
            &mut lines,
            "Near duplicates (review)",
            self.audit
                .similar
                .iter()
                .map(|s| format!("{} ~ {} ({:.3})", s.id_a, s.id_b, s.score)),
        );
        lines.join("\n")
    }
}
