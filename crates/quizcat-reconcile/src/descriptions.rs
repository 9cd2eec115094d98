//! Catalog-wide meta description generation with length and uniqueness enforcement.
//!
//! Uniqueness state lives in an explicit [`DescriptionLedger`] that callers
//! thread through [`DescriptionEngine::describe`] / [`DescriptionEngine::run`].
//! Candidates come from a [`DescriptionGenerator`]; when it fails or keeps
//! signalling rate limits, a keyword template stands in. Collisions that survive
//! the bounded regeneration budget get a deterministic ` - Quiz #n` suffix.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quizcat_adapters::{description_prompt, DescriptionGenerator, GenerationOptions, GenerationOutcome};
use quizcat_core::{CatalogIssue, DescriptionEntry, RegistryEntry, ELLIPSIS, META_DESCRIPTION_MAX_CHARS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const QUOTE_CHARS: &[char] = &['"', '\'', '“', '”', '‘', '’', '`'];
const EDGE_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':'];
const LABEL_PREFIX: &str = "meta description:";

/// Descriptions already handed out in this pass, mapped to the id that owns each.
#[derive(Debug, Clone, Default)]
pub struct DescriptionLedger {
    assigned: HashMap<String, String>,
}

impl DescriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a ledger from an earlier run's output. Over-long text is capped; an entry
    /// whose text is blank or already owned by an earlier entry is requeued instead.
    pub fn resume(entries: Vec<DescriptionEntry>) -> ResumedProgress {
        let mut resumed = ResumedProgress::default();
        for entry in entries {
            let text = enforce_length(entry.meta_description.trim());
            if text.is_empty() || !resumed.ledger.commit(&entry.id, &text) {
                resumed.requeued.push(entry.id);
                continue;
            }
            resumed.kept.push(DescriptionEntry::new(entry.id, entry.title, text));
        }
        resumed
    }

    pub fn contains(&self, description: &str) -> bool {
        self.assigned.contains_key(description)
    }

    pub fn owner(&self, description: &str) -> Option<&str> {
        self.assigned.get(description).map(String::as_str)
    }

    /// Returns false (and changes nothing) when the description is already taken.
    pub fn commit(&mut self, id: &str, description: &str) -> bool {
        if self.assigned.contains_key(description) {
            return false;
        }
        self.assigned.insert(description.to_string(), id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}

/// Earlier output re-checked against the length and uniqueness rules.
#[derive(Debug, Clone, Default)]
pub struct ResumedProgress {
    pub ledger: DescriptionLedger,
    pub kept: Vec<DescriptionEntry>,
    pub requeued: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRule {
    pub contains_all: Vec<String>,
    pub template: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FallbackRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    generic: Option<String>,
    #[serde(default)]
    rules: Vec<FallbackRule>,
}

/// Keyword -> template table used when the generator cannot produce a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackTemplates {
    generic: String,
    rules: Vec<FallbackRule>,
}

const GENERIC_TEMPLATE: &str =
    "Test your {topic} knowledge with this engaging trivia quiz! Challenge yourself today.";

impl Default for FallbackTemplates {
    fn default() -> Self {
        let rule = |words: &[&str], template: &str| FallbackRule {
            contains_all: words.iter().map(|w| w.to_string()).collect(),
            template: template.to_string(),
        };
        Self {
            generic: GENERIC_TEMPLATE.to_string(),
            rules: vec![
                rule(
                    &["deadpool", "wolverine"],
                    "Test your Marvel superhero knowledge! Challenge yourself with Deadpool & Wolverine trivia questions.",
                ),
                rule(
                    &["friends"],
                    "Could you BE any more ready for this Friends quiz? Test your knowledge of the iconic TV show!",
                ),
                rule(
                    &["breaking", "bad"],
                    "Say my name! Test your Breaking Bad knowledge with this comprehensive TV series quiz.",
                ),
                rule(
                    &["game", "thrones"],
                    "Winter is coming! Challenge your Game of Thrones expertise with this epic fantasy quiz.",
                ),
                rule(
                    &["machine", "learning"],
                    "Master machine learning concepts! Test your AI and data science knowledge with this tech quiz.",
                ),
                rule(
                    &["taylor", "swift"],
                    "Shake it off and test your Swiftie knowledge! Challenge yourself with Taylor Swift trivia.",
                ),
            ],
        }
    }
}

impl FallbackTemplates {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: FallbackRulesFile = serde_yaml::from_str(text).context("parsing fallback rules")?;
        Ok(Self {
            generic: file.generic.unwrap_or_else(|| GENERIC_TEMPLATE.to_string()),
            rules: file.rules,
        })
    }

    /// Load rules from a YAML file; the built-in table is used when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no fallback rules file; using built-in templates");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn render(&self, title: &str) -> String {
        let words: Vec<String> = title
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        for rule in &self.rules {
            if rule
                .contains_all
                .iter()
                .all(|keyword| words.contains(&keyword.to_lowercase()))
            {
                return rule.template.clone();
            }
        }
        let topic = title.split_whitespace().next().unwrap_or("trivia");
        self.generic.replace("{topic}", topic)
    }
}

/// Collapse whitespace, drop a `Meta description:` label, wrapping quotes and
/// leading/trailing punctuation.
pub fn normalize_candidate(raw: &str) -> String {
    let mut text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    loop {
        let before = text.len();
        let trimmed = text.trim_matches(QUOTE_CHARS).trim();
        let trimmed = match trimmed.get(..LABEL_PREFIX.len()) {
            Some(head) if head.eq_ignore_ascii_case(LABEL_PREFIX) => trimmed[LABEL_PREFIX.len()..].trim(),
            _ => trimmed,
        };
        let trimmed = trimmed
            .trim_matches(|c: char| EDGE_PUNCTUATION.contains(&c) || c.is_whitespace());
        text = trimmed.to_string();
        if text.len() == before {
            return text;
        }
    }
}

/// Cap at [`META_DESCRIPTION_MAX_CHARS`] characters, ending in [`ELLIPSIS`] when cut.
pub fn enforce_length(text: &str) -> String {
    if text.chars().count() <= META_DESCRIPTION_MAX_CHARS {
        return text.to_string();
    }
    let keep = META_DESCRIPTION_MAX_CHARS - ELLIPSIS.len();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

fn with_suffix(base: &str, suffix: &str) -> String {
    let base = base.trim_end();
    let suffix_len = suffix.chars().count();
    if base.chars().count() + suffix_len <= META_DESCRIPTION_MAX_CHARS {
        return format!("{base}{suffix}");
    }
    let keep = META_DESCRIPTION_MAX_CHARS - suffix_len - ELLIPSIS.len();
    let head: String = base.chars().take(keep).collect();
    format!("{}{ELLIPSIS}{suffix}", head.trim_end())
}

/// First ` - Quiz #n` variant (n = 2, 3, ...) not yet in the ledger.
pub fn disambiguate(base: &str, ledger: &DescriptionLedger) -> (String, u32) {
    let mut n = 2u32;
    loop {
        let candidate = with_suffix(base, &format!(" - Quiz #{n}"));
        if !ledger.contains(&candidate) {
            return (candidate, n);
        }
        n += 1;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptionPolicy {
    /// Cap on regenerations after a collision, and on calls per candidate under rate limiting.
    pub max_attempts: usize,
    pub base_temperature: f32,
    pub temperature_step: f32,
    pub max_tokens: u32,
    pub request_delay: Duration,
    pub rate_limit_delay: Duration,
    pub progress_every: usize,
}

impl Default for DescriptionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_temperature: 0.7,
            temperature_step: 0.1,
            max_tokens: 80,
            request_delay: Duration::from_secs(3),
            rate_limit_delay: Duration::from_secs(10),
            progress_every: 10,
        }
    }
}

impl DescriptionPolicy {
    pub fn options_for_attempt(&self, attempt: usize) -> GenerationOptions {
        GenerationOptions {
            temperature: self.base_temperature + self.temperature_step * attempt as f32,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DescriptionSource {
    Generated,
    Regenerated { attempts: usize },
    Fallback,
    Disambiguated { suffix: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescribedRecord {
    pub entry: DescriptionEntry,
    #[serde(flatten)]
    pub source: DescriptionSource,
    pub issues: Vec<CatalogIssue>,
}

#[derive(Debug)]
pub struct DescriptionRun {
    pub ledger: DescriptionLedger,
    pub described: Vec<DescribedRecord>,
}

/// Receives the completed entries every `progress_every` records.
#[async_trait]
pub trait ProgressHook: Send + Sync {
    async fn checkpoint(&self, completed: &[DescriptionEntry]) -> Result<()>;
}

#[derive(Default)]
pub struct NoopProgressHook;

#[async_trait]
impl ProgressHook for NoopProgressHook {
    async fn checkpoint(&self, _completed: &[DescriptionEntry]) -> Result<()> {
        Ok(())
    }
}

struct Candidate {
    text: String,
    generated: bool,
}

pub struct DescriptionEngine<'a> {
    generator: &'a dyn DescriptionGenerator,
    templates: &'a FallbackTemplates,
    policy: DescriptionPolicy,
}

impl<'a> DescriptionEngine<'a> {
    pub fn new(
        generator: &'a dyn DescriptionGenerator,
        templates: &'a FallbackTemplates,
        policy: DescriptionPolicy,
    ) -> Self {
        Self {
            generator,
            templates,
            policy,
        }
    }

    /// One candidate: generator output normalized and capped, or the template
    /// fallback once the generator fails or stays rate limited.
    async fn candidate(
        &self,
        entry: &RegistryEntry,
        attempt: usize,
        issues: &mut Vec<CatalogIssue>,
    ) -> Candidate {
        let prompt = description_prompt(&entry.title);
        let options = self.policy.options_for_attempt(attempt);
        let mut calls = 0usize;

        while calls < self.policy.max_attempts.max(1) {
            calls += 1;
            match self.generator.generate(&prompt, &options).await {
                GenerationOutcome::Success(raw) => {
                    let normalized = normalize_candidate(&raw);
                    if !normalized.is_empty() {
                        return Candidate {
                            text: enforce_length(&normalized),
                            generated: true,
                        };
                    }
                    issues.push(CatalogIssue::GenerationFailure {
                        id: entry.id.clone(),
                        reason: "empty completion".to_string(),
                    });
                    break;
                }
                GenerationOutcome::RateLimited => {
                    issues.push(CatalogIssue::RateLimited {
                        id: entry.id.clone(),
                        attempt: calls,
                    });
                    if calls >= self.policy.max_attempts {
                        break;
                    }
                    warn!(
                        id = %entry.id,
                        delay_ms = self.policy.rate_limit_delay.as_millis() as u64,
                        "rate limited; backing off"
                    );
                    tokio::time::sleep(self.policy.rate_limit_delay).await;
                }
                GenerationOutcome::Failure(reason) => {
                    debug!(id = %entry.id, generator = self.generator.name(), %reason, "generation failed");
                    issues.push(CatalogIssue::GenerationFailure {
                        id: entry.id.clone(),
                        reason,
                    });
                    break;
                }
            }
        }

        Candidate {
            text: enforce_length(&self.templates.render(&entry.title)),
            generated: false,
        }
    }

    /// Produce, dedupe-check and commit one description.
    pub async fn describe(
        &self,
        ledger: &mut DescriptionLedger,
        entry: &RegistryEntry,
    ) -> DescribedRecord {
        let mut issues = Vec::new();
        let mut candidate = self.candidate(entry, 0, &mut issues).await;
        let mut source = if candidate.generated {
            DescriptionSource::Generated
        } else {
            DescriptionSource::Fallback
        };

        let mut regenerations = 0usize;
        while ledger.contains(&candidate.text) && regenerations < self.policy.max_attempts {
            regenerations += 1;
            debug!(id = %entry.id, attempt = regenerations, "duplicate description; regenerating");
            candidate = self.candidate(entry, regenerations, &mut issues).await;
            source = if candidate.generated {
                DescriptionSource::Regenerated {
                    attempts: regenerations,
                }
            } else {
                DescriptionSource::Fallback
            };
        }

        let mut text = candidate.text;
        if ledger.contains(&text) {
            let (unique, suffix) = disambiguate(&text, ledger);
            debug!(id = %entry.id, suffix, "description still colliding; disambiguated");
            text = unique;
            source = DescriptionSource::Disambiguated { suffix };
        }

        ledger.commit(&entry.id, &text);
        DescribedRecord {
            entry: DescriptionEntry::new(entry.id.clone(), entry.title.clone(), text),
            source,
            issues,
        }
    }

    /// Describe every entry in order, checkpointing through `progress` and pacing
    /// requests. The ledger is taken and handed back with the run.
    pub async fn run(
        &self,
        mut ledger: DescriptionLedger,
        entries: &[RegistryEntry],
        progress: &dyn ProgressHook,
    ) -> DescriptionRun {
        let mut described: Vec<DescribedRecord> = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let record = self.describe(&mut ledger, entry).await;
            info!(
                done = index + 1,
                total = entries.len(),
                id = %entry.id,
                length = record.entry.length,
                source = ?record.source,
                "described"
            );
            described.push(record);

            let done = index + 1;
            if self.policy.progress_every > 0 && done % self.policy.progress_every == 0 {
                let completed: Vec<DescriptionEntry> =
                    described.iter().map(|d| d.entry.clone()).collect();
                if let Err(err) = progress.checkpoint(&completed).await {
                    warn!(error = %format!("{err:#}"), "progress checkpoint failed; continuing");
                }
            }

            if done < entries.len() && !self.policy.request_delay.is_zero() {
                tokio::time::sleep(self.policy.request_delay).await;
            }
        }
        DescriptionRun { ledger, described }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DescriptionStats {
    pub total: usize,
    pub unique: usize,
    pub duplicates: usize,
    pub average_length: f64,
    pub min_length: usize,
    pub max_length: usize,
    pub by_source: BTreeMap<String, usize>,
}

pub fn statistics(entries: &[DescriptionEntry], described: &[DescribedRecord]) -> DescriptionStats {
    if entries.is_empty() {
        return DescriptionStats::default();
    }
    let unique = entries
        .iter()
        .map(|e| e.meta_description.as_str())
        .collect::<std::collections::HashSet<_>>()
        .len();
    let lengths: Vec<usize> = entries.iter().map(|e| e.length).collect();
    let mut by_source: BTreeMap<String, usize> = BTreeMap::new();
    for record in described {
        let key = match record.source {
            DescriptionSource::Generated => "generated",
            DescriptionSource::Regenerated { .. } => "regenerated",
            DescriptionSource::Fallback => "fallback",
            DescriptionSource::Disambiguated { .. } => "disambiguated",
        };
        *by_source.entry(key.to_string()).or_default() += 1;
    }
    DescriptionStats {
        total: entries.len(),
        unique,
        duplicates: entries.len() - unique,
        average_length: lengths.iter().sum::<usize>() as f64 / lengths.len() as f64,
        min_length: lengths.iter().copied().min().unwrap_or(0),
        max_length: lengths.iter().copied().max().unwrap_or(0),
        by_source,
    }
}
