//! Reconciliation passes over the quiz catalog.
//!
//! Each pass loads the collections it needs through [`CollectionStore`], runs the
//! pure analysis in the submodules, writes corrected collections only where a
//! safe rule exists and returns a [`PassReport`] for stdout and `reports/`.

mod analyzer;
mod audit;
mod dedup;
mod descriptions;
mod recovery;
mod report;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quizcat_adapters::{generator_for_config, GeneratorConfig};
use quizcat_core::{
    with_rejected, CatalogEntry, CatalogIssue, DescriptionEntry, FromRecordValue, LoadedCollection,
    QuizRecord, RegistryEntry,
};
use quizcat_storage::{CollectionStore, StagedCollection};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use analyzer::{
    buildable, diff, duplicate_issues, duplicates, id_set, ordered_by_registry, orphaned_outputs,
    unbuilt, IdentityDiff, RegistryRef,
};
pub use audit::{
    audit_descriptions, upsert_descriptions, DescriptionAudit, OverlongDescription,
    SimilarDescriptions, SimilarityConfig, UpsertReport,
};
pub use dedup::{dedupe, DedupOutcome, RemovedDuplicate};
pub use descriptions::{
    disambiguate, enforce_length, normalize_candidate, statistics, DescribedRecord,
    DescriptionEngine, DescriptionLedger, DescriptionPolicy, DescriptionRun, DescriptionSource,
    DescriptionStats, FallbackRule, FallbackTemplates, NoopProgressHook, ProgressHook,
    ResumedProgress,
};
pub use recovery::{RecoveryPlan, RecoveryResolver};
pub use report::{
    ApplyDescriptionsReport, AuditDescriptionsReport, BackupStatus, CountReport,
    DedupeRegistryReport, DedupeStoresReport, DescribeReport, ExportRegistryReport,
    MismatchReport, MissingReport, PassReport, RecoverReport, StoreDedupResult, StoreUpsert,
};

pub const CRATE_NAME: &str = "quizcat-reconcile";

pub const REGISTRY: &str = "registry";
pub const CONTENT_STORE: &str = "content store";
pub const BACKUP_STORE: &str = "backup store";
pub const DESCRIPTIONS: &str = "descriptions";
pub const DESCRIPTION_PROGRESS: &str = "description progress";

/// Collection locations relative to the workspace root.
#[derive(Debug, Clone)]
pub struct CatalogPaths {
    pub registry: PathBuf,
    pub content_store: PathBuf,
    pub backup_store: PathBuf,
    pub build_output: PathBuf,
    pub descriptions: PathBuf,
    pub description_progress: PathBuf,
    pub fallback_rules: PathBuf,
    pub reports: PathBuf,
}

impl Default for CatalogPaths {
    fn default() -> Self {
        Self {
            registry: PathBuf::from("quiz_titles_and_ids.json"),
            content_store: PathBuf::from("data/quizzes.json"),
            backup_store: PathBuf::from("data/quizzes-backup.json"),
            build_output: PathBuf::from("out/quiz"),
            descriptions: PathBuf::from("quiz_meta_descriptions_final.json"),
            description_progress: PathBuf::from("quiz_meta_descriptions_progress.json"),
            fallback_rules: PathBuf::from("rules/fallback.yaml"),
            reports: PathBuf::from("reports"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub workspace_root: PathBuf,
    pub paths: CatalogPaths,
    pub generator: GeneratorConfig,
    pub policy: DescriptionPolicy,
    pub similarity: SimilarityConfig,
}

impl CatalogConfig {
    /// Defaults for a workspace, with no generator credentials.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: root.into(),
            paths: CatalogPaths::default(),
            generator: GeneratorConfig {
                endpoint: "https://api.groq.com/openai/v1/chat/completions".to_string(),
                api_key: None,
                model: "llama-3.1-8b-instant".to_string(),
                timeout: Duration::from_secs(30),
            },
            policy: DescriptionPolicy::default(),
            similarity: SimilarityConfig::default(),
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::for_workspace(
            std::env::var("QUIZCAT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        );
        Self {
            generator: GeneratorConfig {
                endpoint: std::env::var("QUIZCAT_GENERATOR_URL")
                    .unwrap_or(defaults.generator.endpoint),
                api_key: std::env::var("QUIZCAT_API_KEY")
                    .ok()
                    .filter(|key| !key.trim().is_empty()),
                model: std::env::var("QUIZCAT_MODEL").unwrap_or(defaults.generator.model),
                timeout: Duration::from_secs(env_or("QUIZCAT_HTTP_TIMEOUT_SECS", 30)),
            },
            policy: DescriptionPolicy {
                request_delay: Duration::from_millis(env_or("QUIZCAT_REQUEST_DELAY_MS", 3000)),
                rate_limit_delay: Duration::from_millis(env_or(
                    "QUIZCAT_RATE_LIMIT_DELAY_MS",
                    10_000,
                )),
                progress_every: env_or("QUIZCAT_PROGRESS_EVERY", 10),
                ..defaults.policy
            },
            ..defaults
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Envelope written to `reports/<run_id>/<pass>.json`.
#[derive(Serialize)]
struct PassRecord<'a, R> {
    run_id: Uuid,
    pass: &'static str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    needs_attention: bool,
    report: &'a R,
}

/// Persists description progress as `prior + completed` so an interrupted run can resume.
pub struct JsonProgressHook {
    store: CollectionStore,
    rel: PathBuf,
    prior: Vec<DescriptionEntry>,
}

impl JsonProgressHook {
    pub fn new(store: CollectionStore, rel: impl Into<PathBuf>, prior: Vec<DescriptionEntry>) -> Self {
        Self {
            store,
            rel: rel.into(),
            prior,
        }
    }
}

#[async_trait]
impl ProgressHook for JsonProgressHook {
    async fn checkpoint(&self, completed: &[DescriptionEntry]) -> Result<()> {
        let mut snapshot = self.prior.clone();
        snapshot.extend_from_slice(completed);
        let written = self.store.write_collection(&self.rel, &snapshot).await?;
        debug!(records = written.records, path = %written.path.display(), "progress saved");
        Ok(())
    }
}

pub struct CatalogPipeline {
    config: CatalogConfig,
    store: CollectionStore,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

impl CatalogPipeline {
    pub fn new(config: CatalogConfig) -> Self {
        let store = CollectionStore::new(config.workspace_root.clone());
        Self {
            config,
            store,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn count(&self) -> Result<CountReport> {
        let paths = &self.config.paths;
        let registry = self.store.load::<RegistryEntry>(REGISTRY, &paths.registry)?;
        let content = self.store.load::<QuizRecord>(CONTENT_STORE, &paths.content_store)?;
        let built = self.store.list_build_output(&paths.build_output)?;

        let registry_ids = registry.ids();
        let content_ids = content.ids();
        let content_duplicates = duplicates(&content.records);
        for issue in duplicate_issues(CONTENT_STORE, &content_duplicates) {
            warn!(%issue, "duplicate id");
        }
        let can_build = buildable(&content_ids, &registry_ids);
        let orphaned = orphaned_outputs(&built, &content_ids);
        for id in &orphaned {
            let issue = CatalogIssue::OrphanedOutput { id: id.clone() };
            warn!(%issue, "orphaned build output");
        }

        let mut issues = registry.malformed;
        issues.extend(content.malformed);
        Ok(CountReport {
            registry_total: registry.records.len(),
            registry_unique: registry_ids.len(),
            content_total: content.records.len(),
            content_unique: content_ids.len(),
            content_duplicates,
            diff: diff(&registry_ids, &content_ids),
            built_total: built.len(),
            buildable_total: can_build.len(),
            unbuilt: unbuilt(&can_build, &built),
            orphaned_outputs: orphaned,
            issues,
        })
    }

    pub fn mismatch(&self) -> Result<MismatchReport> {
        let paths = &self.config.paths;
        let registry = self.store.load::<RegistryEntry>(REGISTRY, &paths.registry)?;
        let content = self.store.load::<QuizRecord>(CONTENT_STORE, &paths.content_store)?;

        let identity = diff(&registry.ids(), &content.ids());
        let registry_duplicates = duplicates(&registry.records);
        let content_duplicates = duplicates(&content.records);
        for issue in duplicate_issues(REGISTRY, &registry_duplicates)
            .into_iter()
            .chain(duplicate_issues(CONTENT_STORE, &content_duplicates))
        {
            warn!(%issue, "duplicate id");
        }

        let mut issues = registry.malformed;
        issues.extend(content.malformed);
        Ok(MismatchReport {
            registry_total: registry.records.len(),
            content_total: content.records.len(),
            registry_duplicates,
            content_duplicates,
            missing: ordered_by_registry(&identity.missing, &registry.records),
            extra: identity.extra,
            issues,
        })
    }

    pub fn missing(&self) -> Result<MissingReport> {
        let paths = &self.config.paths;
        let registry = self.store.load::<RegistryEntry>(REGISTRY, &paths.registry)?;
        let content = self.store.load::<QuizRecord>(CONTENT_STORE, &paths.content_store)?;

        let missing_ids = diff(&registry.ids(), &content.ids()).missing;
        let (resolver, backup) = self.backup_resolver();
        let plan = resolver.classify(&missing_ids);
        info!(
            missing = missing_ids.len(),
            recoverable = plan.recoverable.len(),
            gaps = plan.unrecoverable.len(),
            "classified missing ids"
        );

        Ok(MissingReport {
            registry_total: registry.records.len(),
            content_total: content.records.len(),
            missing: ordered_by_registry(&missing_ids, &registry.records),
            backup,
            plan,
        })
    }

    /// Merge recoverable records from the backup store into the content store.
    pub async fn recover(&self) -> Result<RecoverReport> {
        let paths = &self.config.paths;
        let registry = self.store.load::<RegistryEntry>(REGISTRY, &paths.registry)?;
        let content = self.store.load::<QuizRecord>(CONTENT_STORE, &paths.content_store)?;

        let missing_ids = diff(&registry.ids(), &content.ids()).missing;
        let (resolver, backup) = self.backup_resolver();
        let plan = resolver.classify(&missing_ids);
        for issue in plan.gaps() {
            warn!(%issue, "recovery gap");
        }

        let mut records = content.records;
        let merged = resolver.merge_into(&plan, &mut records);
        let written = if merged.is_empty() {
            None
        } else {
            let values = with_rejected(&records, &content.rejected)
                .context("serializing recovered content store")?;
            let written = self
                .store
                .write_collection(&paths.content_store, &values)
                .await
                .context("writing recovered content store")?;
            Some(written)
        };
        info!(merged = merged.len(), gaps = plan.unrecoverable.len(), "recovery finished");

        Ok(RecoverReport {
            backup,
            plan,
            merged,
            kept_malformed: content.malformed,
            written,
        })
    }

    /// Deduplicate the registry through a staged copy; the original is replaced
    /// only once the staged copy reads back with the same id set.
    pub async fn dedupe_registry(&self) -> Result<DedupeRegistryReport> {
        let paths = &self.config.paths;
        let registry = self.store.load::<RegistryEntry>(REGISTRY, &paths.registry)?;
        let content = self.store.load::<QuizRecord>(CONTENT_STORE, &paths.content_store)?;

        let original_total = registry.records.len();
        let expected = registry.ids();
        let outcome = dedupe(registry.records);
        let content_diff = diff(&id_set(&outcome.records), &content.ids());

        let staged = self.store.stage_collection(&paths.registry, &outcome.records).await?;
        let verification_problems =
            verify_staged::<RegistryEntry>(&self.store, REGISTRY, &staged, &expected, 0);
        let promoted = verification_problems.is_empty();
        let written = if promoted {
            self.store.promote(staged).await?
        } else {
            warn!(
                problems = verification_problems.len(),
                staged = %staged.staged.display(),
                "staged registry failed verification; original left in place"
            );
            staged.written
        };
        info!(
            removed = outcome.removed.len(),
            total = outcome.records.len(),
            promoted,
            "registry deduplicated"
        );

        Ok(DedupeRegistryReport {
            original_total,
            final_total: outcome.records.len(),
            removed: outcome.removed,
            dropped_malformed: registry.malformed,
            verification_problems,
            content_diff,
            promoted,
            written,
        })
    }

    /// Deduplicate the content and backup stores. A missing backup store is skipped.
    pub async fn dedupe_stores(&self) -> Result<DedupeStoresReport> {
        let paths = &self.config.paths;
        let mut stores = Vec::new();
        for (name, rel, required) in [
            (CONTENT_STORE, &paths.content_store, true),
            (BACKUP_STORE, &paths.backup_store, false),
        ] {
            let loaded = match self.store.load::<QuizRecord>(name, rel) {
                Ok(loaded) => loaded,
                Err(err) if !required => {
                    warn!(collection = name, error = %err, "store unavailable; skipping");
                    stores.push(StoreDedupResult {
                        collection: name.to_string(),
                        available: false,
                        original_total: 0,
                        removed: Vec::new(),
                        kept_malformed: Vec::new(),
                        verification_problems: Vec::new(),
                        staged_path: None,
                        written: None,
                    });
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            stores.push(self.dedupe_store(name, rel, loaded).await?);
        }
        Ok(DedupeStoresReport { stores })
    }

    async fn dedupe_store(
        &self,
        name: &str,
        rel: &Path,
        loaded: LoadedCollection<QuizRecord>,
    ) -> Result<StoreDedupResult> {
        let original_total = loaded.records.len();
        let expected = loaded.ids();
        let outcome = dedupe(loaded.records);

        let values = with_rejected(&outcome.records, &loaded.rejected)
            .with_context(|| format!("serializing {name}"))?;
        let staged = self.store.stage_collection(rel, &values).await?;
        let staged_path = staged.staged.clone();
        let verification_problems = verify_staged::<QuizRecord>(
            &self.store,
            name,
            &staged,
            &expected,
            loaded.rejected.len(),
        );
        let written = if verification_problems.is_empty() {
            Some(self.store.promote(staged).await?)
        } else {
            warn!(
                collection = name,
                problems = verification_problems.len(),
                staged = %staged_path.display(),
                "staged store failed verification; original left in place"
            );
            None
        };
        info!(
            collection = name,
            removed = outcome.removed.len(),
            total = outcome.records.len(),
            promoted = written.is_some(),
            "store deduplicated"
        );

        Ok(StoreDedupResult {
            collection: name.to_string(),
            available: true,
            original_total,
            removed: outcome.removed,
            kept_malformed: loaded.malformed,
            staged_path: written.is_none().then_some(staged_path),
            verification_problems,
            written,
        })
    }

    /// Generate a unique meta description for every registry entry, resuming from
    /// the progress file when one exists.
    pub async fn describe(&self) -> Result<DescribeReport> {
        let paths = &self.config.paths;
        let registry = self.store.load::<RegistryEntry>(REGISTRY, &paths.registry)?;
        let deduped = dedupe(registry.records);
        let entries = deduped.records;

        let progress = DescriptionLedger::resume(self.load_progress(&entries));
        if !progress.requeued.is_empty() {
            warn!(
                requeued = progress.requeued.len(),
                "progress entries broke the length or uniqueness rules; generating them again"
            );
        }
        let resumed = progress.kept.len();
        let done = id_set(&progress.kept);
        let pending: Vec<RegistryEntry> = entries
            .iter()
            .filter(|entry| !done.contains(&entry.id))
            .cloned()
            .collect();

        let generator = generator_for_config(&self.config.generator)?;
        let templates = FallbackTemplates::load(&self.store.resolve(&paths.fallback_rules))?;
        info!(
            generator = generator.name(),
            pending = pending.len(),
            resumed,
            "generating meta descriptions"
        );

        let engine = DescriptionEngine::new(generator.as_ref(), &templates, self.config.policy);
        let hook = JsonProgressHook::new(
            self.store.clone(),
            paths.description_progress.clone(),
            progress.kept.clone(),
        );
        let run = engine.run(progress.ledger, &pending, &hook).await;

        let position: HashMap<&str, usize> = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.id.as_str(), index))
            .collect();
        let mut all = progress.kept;
        all.extend(run.described.iter().map(|d| d.entry.clone()));
        all.sort_by_key(|entry| position.get(entry.id.as_str()).copied().unwrap_or(usize::MAX));

        let written = self
            .store
            .write_collection(&paths.descriptions, &all)
            .await
            .context("writing meta descriptions")?;
        self.store.remove(&paths.description_progress).await?;
        let stats = statistics(&all, &run.described);
        info!(
            total = stats.total,
            unique = stats.unique,
            duplicates = stats.duplicates,
            "meta descriptions written"
        );

        Ok(DescribeReport {
            generator: generator.name().to_string(),
            registry_duplicates_skipped: deduped.removed.len(),
            resumed,
            requeued: progress.requeued,
            described: run.described,
            stats,
            written,
        })
    }

    /// Completed entries from an earlier interrupted run, limited to ids still in
    /// the registry. An unreadable progress file means starting over.
    fn load_progress(&self, registry: &[RegistryEntry]) -> Vec<DescriptionEntry> {
        let rel = &self.config.paths.description_progress;
        if !self.store.exists(rel) {
            return Vec::new();
        }
        match self.store.load::<DescriptionEntry>(DESCRIPTION_PROGRESS, rel) {
            Ok(loaded) => {
                let known = id_set(registry);
                dedupe(loaded.records)
                    .records
                    .into_iter()
                    .filter(|entry| known.contains(&entry.id))
                    .collect()
            }
            Err(err) => {
                warn!(error = %err, "ignoring unreadable progress file");
                Vec::new()
            }
        }
    }

    /// Upsert `metaDescription` into the backup and content stores.
    pub async fn apply_descriptions(&self) -> Result<ApplyDescriptionsReport> {
        let paths = &self.config.paths;
        let descriptions = self
            .store
            .load::<DescriptionEntry>(DESCRIPTIONS, &paths.descriptions)?;

        let mut stores = Vec::new();
        for (name, rel) in [
            (BACKUP_STORE, &paths.backup_store),
            (CONTENT_STORE, &paths.content_store),
        ] {
            let loaded = match self.store.load::<QuizRecord>(name, rel) {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!(collection = name, error = %err, "store unavailable; skipping");
                    stores.push(StoreUpsert {
                        collection: name.to_string(),
                        available: false,
                        reason: Some(err.to_string()),
                        upsert: UpsertReport::default(),
                        kept_malformed: Vec::new(),
                        written: None,
                    });
                    continue;
                }
            };

            let mut records = loaded.records;
            let upsert = upsert_descriptions(&mut records, &descriptions.records);
            let written = if upsert.updated.is_empty() {
                None
            } else {
                let values = with_rejected(&records, &loaded.rejected)
                    .with_context(|| format!("serializing {name}"))?;
                let written = self
                    .store
                    .write_collection(rel, &values)
                    .await
                    .with_context(|| format!("writing {name}"))?;
                Some(written)
            };
            info!(
                collection = name,
                updated = upsert.updated.len(),
                unchanged = upsert.unchanged.len(),
                without_description = upsert.records_without_description.len(),
                "descriptions applied"
            );
            stores.push(StoreUpsert {
                collection: name.to_string(),
                available: true,
                reason: None,
                upsert,
                kept_malformed: loaded.malformed,
                written,
            });
        }

        Ok(ApplyDescriptionsReport {
            descriptions_total: descriptions.records.len(),
            stores,
        })
    }

    /// Rebuild the registry from the content store, numbered by position.
    pub async fn export_registry(&self) -> Result<ExportRegistryReport> {
        let paths = &self.config.paths;
        let content = self.store.load::<QuizRecord>(CONTENT_STORE, &paths.content_store)?;
        let entries: Vec<RegistryEntry> = content
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                RegistryEntry::new(index as u32 + 1, record.id.clone(), record.title.clone())
            })
            .collect();
        let duplicates = duplicates(&entries);
        let written = self
            .store
            .write_collection(&paths.registry, &entries)
            .await
            .context("writing registry")?;
        info!(total = entries.len(), duplicates = duplicates.len(), "registry exported");

        Ok(ExportRegistryReport {
            total: entries.len(),
            duplicates,
            issues: content.malformed,
            written,
        })
    }

    pub fn audit_descriptions(&self) -> Result<AuditDescriptionsReport> {
        let content = self
            .store
            .load::<QuizRecord>(CONTENT_STORE, &self.config.paths.content_store)?;
        let audit = audit::audit_descriptions(&content.records, self.config.similarity);
        Ok(AuditDescriptionsReport {
            total: content.records.len(),
            audit,
        })
    }

    /// Write `<pass>.json` and `<pass>.md` under `reports/<run_id>/`.
    pub async fn write_report<R: PassReport>(&self, report: &R) -> Result<PathBuf> {
        let reports_dir = self
            .store
            .resolve(&self.config.paths.reports)
            .join(self.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let record = PassRecord {
            run_id: self.run_id,
            pass: R::PASS,
            started_at: self.started_at,
            finished_at: Utc::now(),
            needs_attention: report.needs_attention(),
            report,
        };
        let json = serde_json::to_vec_pretty(&record)
            .with_context(|| format!("serializing {} report", R::PASS))?;
        fs::write(reports_dir.join(format!("{}.json", R::PASS)), json)
            .await
            .with_context(|| format!("writing {}.json", R::PASS))?;
        fs::write(reports_dir.join(format!("{}.md", R::PASS)), report.render())
            .await
            .with_context(|| format!("writing {}.md", R::PASS))?;
        Ok(reports_dir)
    }

    fn backup_resolver(&self) -> (RecoveryResolver, BackupStatus) {
        match self
            .store
            .load::<QuizRecord>(BACKUP_STORE, &self.config.paths.backup_store)
        {
            Ok(backup) => {
                let total = backup.records.len();
                let resolver = RecoveryResolver::new(backup.records);
                let status = BackupStatus {
                    available: true,
                    total,
                    duplicates_discarded: resolver.duplicates_discarded(),
                    reason: None,
                };
                (resolver, status)
            }
            Err(err) => {
                warn!(error = %err, "backup store unavailable; every missing id is a gap");
                (
                    RecoveryResolver::without_backup(),
                    BackupStatus {
                        available: false,
                        total: 0,
                        duplicates_discarded: 0,
                        reason: Some(err.to_string()),
                    },
                )
            }
        }
    }
}

/// Read a staged collection back and list anything that would make promoting it lossy.
/// `expected_malformed` counts the unparseable entries deliberately carried over.
fn verify_staged<T: FromRecordValue + CatalogEntry>(
    store: &CollectionStore,
    name: &str,
    staged: &StagedCollection,
    expected: &BTreeSet<String>,
    expected_malformed: usize,
) -> Vec<String> {
    let loaded = match store.load::<T>(name, &staged.staged) {
        Ok(loaded) => loaded,
        Err(err) => return vec![format!("staged copy unreadable: {err}")],
    };

    let mut problems = Vec::new();
    if loaded.malformed.len() != expected_malformed {
        problems.push(format!(
            "{} malformed entries in staged copy, expected {expected_malformed}",
            loaded.malformed.len()
        ));
    }
    for (id, count) in duplicates(&loaded.records) {
        problems.push(format!("id {id} still appears {count} times"));
    }
    let identity = diff(expected, &loaded.ids());
    for id in identity.missing {
        problems.push(format!("id {id} lost"));
    }
    for id in identity.extra {
        problems.push(format!("id {id} appeared"));
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};
    use tempfile::{tempdir, TempDir};

    fn write_json(dir: &Path, rel: &str, value: JsonValue) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, serde_json::to_vec_pretty(&value).expect("json")).expect("write");
    }

    fn read_json(dir: &Path, rel: &str) -> JsonValue {
        serde_json::from_slice(&std::fs::read(dir.join(rel)).expect("read")).expect("parse")
    }

    fn ids_of(value: &JsonValue) -> Vec<String> {
        value
            .as_array()
            .expect("array")
            .iter()
            .map(|v| v["id"].as_str().expect("id").to_string())
            .collect()
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn pipeline(dir: &TempDir) -> CatalogPipeline {
        let mut config = CatalogConfig::for_workspace(dir.path());
        config.policy.request_delay = Duration::ZERO;
        config.policy.rate_limit_delay = Duration::ZERO;
        CatalogPipeline::new(config)
    }

    /// Registry a,b,c,d,e (b listed twice); content holds b,c,d,x; backup holds a,x.
    fn seed_catalog(dir: &Path) {
        write_json(
            dir,
            "quiz_titles_and_ids.json",
            json!([
                {"number": 1, "id": "a", "title": "Alpha Quiz"},
                {"number": 2, "id": "b", "title": "Bravo Quiz"},
                {"number": 3, "id": "c", "title": "Charlie Quiz"},
                {"number": 4, "id": "d", "title": "Delta Quiz"},
                {"number": 5, "id": "e", "title": "Echo Quiz"},
                {"number": 6, "id": "b", "title": "Bravo Quiz"}
            ]),
        );
        write_json(
            dir,
            "data/quizzes.json",
            json!([
                {"id": "b", "title": "Bravo Quiz", "questions": [1, 2]},
                {"id": "c", "title": "Charlie Quiz"},
                {"id": "d", "title": "Delta Quiz"},
                {"id": "x", "title": "Xray Quiz"}
            ]),
        );
        write_json(
            dir,
            "data/quizzes-backup.json",
            json!([
                {"id": "a", "title": "Alpha Quiz", "category": "tv"},
                {"id": "x", "title": "Xray Quiz"}
            ]),
        );
    }

    #[test]
    fn count_reports_diff_and_build_state() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        std::fs::create_dir_all(dir.path().join("out/quiz/b")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("out/quiz/stale")).expect("mkdir");

        let report = pipeline(&dir).count().expect("count");
        assert_eq!(report.registry_total, 6);
        assert_eq!(report.registry_unique, 5);
        assert_eq!(report.content_total, 4);
        assert_eq!(report.diff.missing, set(&["a", "e"]));
        assert_eq!(report.diff.extra, set(&["x"]));
        assert_eq!(report.buildable_total, 3);
        assert_eq!(report.unbuilt, set(&["c", "d"]));
        assert_eq!(report.orphaned_outputs, set(&["stale"]));
        assert!(report.needs_attention());
    }

    #[test]
    fn count_without_registry_is_fatal() {
        let dir = tempdir().expect("tempdir");
        write_json(dir.path(), "data/quizzes.json", json!([]));
        let err = pipeline(&dir).count().unwrap_err();
        assert!(err.to_string().contains("registry unavailable"));
    }

    #[test]
    fn missing_orders_by_registry_and_classifies_against_backup() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        let report = pipeline(&dir).missing().expect("missing");
        let order: Vec<_> = report.missing.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["a", "e"]);
        assert!(report.backup.available);
        assert_eq!(report.plan.recoverable, set(&["a"]));
        assert_eq!(report.plan.unrecoverable, set(&["e"]));
    }

    #[test]
    fn missing_backup_is_not_fatal() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        std::fs::remove_file(dir.path().join("data/quizzes-backup.json")).expect("rm");
        let report = pipeline(&dir).missing().expect("missing");
        assert!(!report.backup.available);
        assert!(report.plan.recoverable.is_empty());
        assert_eq!(report.plan.unrecoverable.len(), 2);
    }

    #[tokio::test]
    async fn recover_merges_backup_records_into_content_store() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        let report = pipeline(&dir).recover().await.expect("recover");
        assert_eq!(report.merged, vec!["a".to_string()]);
        assert!(report.written.is_some());
        assert!(report.needs_attention());

        let content = read_json(dir.path(), "data/quizzes.json");
        assert_eq!(ids_of(&content), vec!["b", "c", "d", "x", "a"]);
        assert_eq!(content[4]["category"], "tv");
        assert_eq!(content[0]["questions"], json!([1, 2]));
    }

    #[tokio::test]
    async fn recover_writes_unparseable_entries_back_in_place() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        write_json(
            dir.path(),
            "data/quizzes.json",
            json!([
                {"id": "b", "title": "Bravo Quiz"},
                {"slug": "draft", "questions": [1, 2, 3]},
                {"id": "c", "title": "Charlie Quiz"}
            ]),
        );

        let report = pipeline(&dir).recover().await.expect("recover");
        assert_eq!(report.merged, vec!["a".to_string()]);
        assert_eq!(report.kept_malformed.len(), 1);

        let content = read_json(dir.path(), "data/quizzes.json");
        let entries = content.as_array().expect("array");
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1], json!({"slug": "draft", "questions": [1, 2, 3]}));
        assert_eq!(entries[3]["id"], "a");
    }

    #[tokio::test]
    async fn dedupe_registry_promotes_verified_copy() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        let report = pipeline(&dir).dedupe_registry().await.expect("dedupe");
        assert!(report.promoted);
        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.removed[0].original_number, Some(6));
        assert!(!dir.path().join("quiz_titles_and_ids.json.staged").exists());

        let registry = read_json(dir.path(), "quiz_titles_and_ids.json");
        assert_eq!(ids_of(&registry), vec!["a", "b", "c", "d", "e"]);
        let numbers: Vec<_> = registry
            .as_array()
            .expect("array")
            .iter()
            .map(|v| v["number"].as_u64().expect("number"))
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        // content store still lacks a and e
        assert!(report.needs_attention());
    }

    #[tokio::test]
    async fn dedupe_stores_handles_both_stores() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        write_json(
            dir.path(),
            "data/quizzes.json",
            json!([
                {"id": "b", "title": "Bravo Quiz"},
                {"id": "b", "title": "Bravo Quiz (old)"},
                {"id": "c", "title": "Charlie Quiz"}
            ]),
        );
        std::fs::remove_file(dir.path().join("data/quizzes-backup.json")).expect("rm");

        let report = pipeline(&dir).dedupe_stores().await.expect("dedupe stores");
        assert_eq!(report.stores.len(), 2);
        assert!(report.stores[0].promoted());
        assert_eq!(report.stores[0].removed.len(), 1);
        assert!(!report.stores[1].available);
        assert!(!report.needs_attention());

        let content = read_json(dir.path(), "data/quizzes.json");
        assert_eq!(ids_of(&content), vec!["b", "c"]);
        assert_eq!(content[0]["title"], "Bravo Quiz");
        assert_eq!(content[1]["number"], 2);
    }

    #[tokio::test]
    async fn describe_offline_writes_unique_descriptions_and_clears_progress() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        write_json(
            dir.path(),
            "quiz_meta_descriptions_progress.json",
            json!([
                {"id": "c", "title": "Charlie Quiz", "meta_description": "Carried over from last time.", "length": 1},
                {"id": "gone", "title": "Gone", "meta_description": "No longer listed.", "length": 17}
            ]),
        );

        let report = pipeline(&dir).describe().await.expect("describe");
        assert_eq!(report.generator, "offline");
        assert_eq!(report.resumed, 1);
        assert_eq!(report.registry_duplicates_skipped, 1);
        assert_eq!(report.described.len(), 4);
        assert_eq!(report.stats.total, 5);
        assert_eq!(report.stats.duplicates, 0);
        assert!(!report.needs_attention());
        assert!(!dir.path().join("quiz_meta_descriptions_progress.json").exists());

        let written = read_json(dir.path(), "quiz_meta_descriptions_final.json");
        assert_eq!(ids_of(&written), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(written[2]["meta_description"], "Carried over from last time.");
        assert_eq!(written[2]["length"], 28);
    }

    #[tokio::test]
    async fn describe_revalidates_resumed_progress() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        write_json(
            dir.path(),
            "quiz_meta_descriptions_progress.json",
            json!([
                {"id": "a", "title": "Alpha Quiz", "meta_description": "Same text", "length": 9},
                {"id": "b", "title": "Bravo Quiz", "meta_description": "Same text", "length": 9},
                {"id": "c", "title": "Charlie Quiz", "meta_description": "y".repeat(200), "length": 200}
            ]),
        );

        let report = pipeline(&dir).describe().await.expect("describe");
        assert_eq!(report.resumed, 2);
        assert_eq!(report.requeued, vec!["b".to_string()]);
        assert!(report.described.iter().any(|d| d.entry.id == "b"));
        assert_eq!(report.stats.total, 5);
        assert_eq!(report.stats.duplicates, 0);
        assert!(report.stats.max_length <= quizcat_core::META_DESCRIPTION_MAX_CHARS);
        assert!(!report.needs_attention());

        let written = read_json(dir.path(), "quiz_meta_descriptions_final.json");
        assert_eq!(written[0]["meta_description"], "Same text");
        assert_ne!(written[1]["meta_description"], "Same text");
        assert_eq!(written[2]["length"], 160);
    }

    #[tokio::test]
    async fn apply_descriptions_changes_nothing_but_the_description() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        let draft = json!({"slug": "no-id-yet", "questions": [1, 2, 3]});
        let untouched = json!({"id": "b", "title": "B", "metaDescription": "", "number": "7"});
        write_json(
            dir.path(),
            "data/quizzes.json",
            json!([
                {"id": "a", "title": "A", "category": "tv"},
                untouched.clone(),
                draft.clone()
            ]),
        );
        write_json(
            dir.path(),
            "quiz_meta_descriptions_final.json",
            json!([
                {"id": "a", "title": "A", "meta_description": "Alpha trivia for everyone.", "length": 26}
            ]),
        );

        let applied = pipeline(&dir).apply_descriptions().await.expect("apply");
        let content = &applied.stores[1];
        assert_eq!(content.upsert.updated, set(&["a"]));
        assert_eq!(content.kept_malformed.len(), 1);

        let stored = read_json(dir.path(), "data/quizzes.json");
        let entries = stored.as_array().expect("array");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1], untouched);
        assert_eq!(entries[2], draft);
        let keys: Vec<_> = entries[0].as_object().expect("object").keys().cloned().collect();
        assert_eq!(keys, vec!["id", "title", "category", "metaDescription"]);
    }

    #[tokio::test]
    async fn apply_then_audit_is_clean() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        write_json(
            dir.path(),
            "data/quizzes.json",
            json!([
                {"id": "b", "title": "Bravo Quiz", "questions": [1]},
                {"id": "c", "title": "Charlie Quiz"}
            ]),
        );
        write_json(
            dir.path(),
            "quiz_meta_descriptions_final.json",
            json!([
                {"id": "b", "title": "Bravo Quiz", "meta_description": "Bravo trivia for sharp minds.", "length": 29},
                {"id": "c", "title": "Charlie Quiz", "meta_description": "Charlie trivia, tougher than it looks.", "length": 38}
            ]),
        );
        let pipeline = pipeline(&dir);

        let applied = pipeline.apply_descriptions().await.expect("apply");
        let backup = &applied.stores[0];
        assert_eq!(backup.collection, BACKUP_STORE);
        assert_eq!(backup.upsert.records_without_description.len(), 2);
        let content = &applied.stores[1];
        assert_eq!(content.upsert.updated.len(), 2);
        assert!(content.written.is_some());

        let stored = read_json(dir.path(), "data/quizzes.json");
        assert_eq!(stored[0]["metaDescription"], "Bravo trivia for sharp minds.");
        assert_eq!(stored[0]["questions"], json!([1]));

        let audit = pipeline.audit_descriptions().expect("audit");
        assert_eq!(audit.total, 2);
        assert!(audit.audit.is_clean());
    }

    #[tokio::test]
    async fn export_registry_numbers_content_records() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        let report = pipeline(&dir).export_registry().await.expect("export");
        assert_eq!(report.total, 4);
        assert!(report.duplicates.is_empty());

        let registry = read_json(dir.path(), "quiz_titles_and_ids.json");
        assert_eq!(registry[3], json!({"number": 4, "id": "x", "title": "Xray Quiz"}));
    }

    #[tokio::test]
    async fn reports_land_under_run_id() {
        let dir = tempdir().expect("tempdir");
        seed_catalog(dir.path());
        let pipeline = pipeline(&dir);
        let report = pipeline.mismatch().expect("mismatch");
        let reports_dir = pipeline.write_report(&report).await.expect("write report");

        assert_eq!(
            reports_dir,
            dir.path().join("reports").join(pipeline.run_id().to_string())
        );
        let json = read_json(&reports_dir, "mismatch.json");
        assert_eq!(json["pass"], "mismatch");
        assert_eq!(json["needs_attention"], true);
        assert_eq!(json["report"]["extra"], json!(["x"]));
        let text = std::fs::read_to_string(reports_dir.join("mismatch.md")).expect("md");
        assert!(text.starts_with("Registry / content store mismatch"));
    }
}
