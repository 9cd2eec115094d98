//! File-backed collection storage, build output listing and HTTP plumbing for quizcat.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use quizcat_core::{CatalogError, FromRecordValue, LoadedCollection};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "quizcat-storage";

/// Suffix of the sibling file a collection is written to before it is promoted.
pub const STAGED_SUFFIX: &str = "staged";

/// Outcome of writing one collection file.
#[derive(Debug, Clone, Serialize)]
pub struct WrittenCollection {
    pub path: PathBuf,
    pub records: usize,
    pub bytes: usize,
    pub sha256: String,
}

/// A collection written next to its target, waiting for verification before it replaces it.
#[derive(Debug, Clone, Serialize)]
pub struct StagedCollection {
    pub target: PathBuf,
    pub staged: PathBuf,
    pub written: WrittenCollection,
}

/// JSON collections addressed by paths relative to one workspace root.
#[derive(Debug, Clone)]
pub struct CollectionStore {
    root: PathBuf,
}

impl CollectionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.resolve(rel).is_file()
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Load a named collection. Entries that fail the record parse boundary are
    /// returned in `malformed`; only an unreadable or non-array source is an error.
    pub fn load<T: FromRecordValue>(
        &self,
        name: &str,
        rel: impl AsRef<Path>,
    ) -> Result<LoadedCollection<T>, CatalogError> {
        let path = self.resolve(rel);
        let unavailable = |reason: String| CatalogError::SourceUnavailable {
            collection: name.to_string(),
            path: path.display().to_string(),
            reason,
        };

        let text = std::fs::read_to_string(&path).map_err(|e| unavailable(e.to_string()))?;
        let value: JsonValue =
            serde_json::from_str(&text).map_err(|e| unavailable(format!("invalid JSON: {e}")))?;
        let JsonValue::Array(values) = value else {
            return Err(unavailable("top-level value is not an array".to_string()));
        };

        let loaded = LoadedCollection::from_values(name, values);
        for issue in &loaded.malformed {
            warn!(collection = name, %issue, "skipping malformed record");
        }
        debug!(
            collection = name,
            records = loaded.records.len(),
            malformed = loaded.malformed.len(),
            path = %path.display(),
            "loaded collection"
        );
        Ok(loaded)
    }

    /// Write a collection in place through a temp file + rename.
    pub async fn write_collection<T: Serialize>(
        &self,
        rel: impl AsRef<Path>,
        records: &[T],
    ) -> anyhow::Result<WrittenCollection> {
        let path = self.resolve(rel);
        write_json_atomically(&path, records).await
    }

    /// Write a collection to `<target>.staged`, leaving the target untouched.
    pub async fn stage_collection<T: Serialize>(
        &self,
        rel: impl AsRef<Path>,
        records: &[T],
    ) -> anyhow::Result<StagedCollection> {
        let target = self.resolve(rel);
        let staged = staged_path_for(&target);
        let written = write_json_atomically(&staged, records).await?;
        Ok(StagedCollection {
            target,
            staged,
            written,
        })
    }

    /// Replace the target with its staged file.
    pub async fn promote(&self, staged: StagedCollection) -> anyhow::Result<WrittenCollection> {
        fs::rename(&staged.staged, &staged.target)
            .await
            .with_context(|| {
                format!(
                    "promoting {} -> {}",
                    staged.staged.display(),
                    staged.target.display()
                )
            })?;
        Ok(WrittenCollection {
            path: staged.target,
            ..staged.written
        })
    }

    /// Delete a collection file. Returns false when there was nothing to delete.
    pub async fn remove(&self, rel: impl AsRef<Path>) -> anyhow::Result<bool> {
        let path = self.resolve(rel);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }

    /// Immediate child directory names under the build output root. A missing
    /// root means nothing has been built yet.
    pub fn list_build_output(&self, rel: impl AsRef<Path>) -> Result<BTreeSet<String>, CatalogError> {
        let root = self.resolve(rel);
        if !root.exists() {
            debug!(path = %root.display(), "build output root absent; treating as zero built");
            return Ok(BTreeSet::new());
        }
        let entries = std::fs::read_dir(&root).map_err(|e| CatalogError::SourceUnavailable {
            collection: "build output".to_string(),
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect())
    }
}

pub fn staged_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(STAGED_SUFFIX);
    target.with_file_name(name)
}

async fn write_json_atomically<T: Serialize>(
    path: &Path,
    records: &[T],
) -> anyhow::Result<WrittenCollection> {
    let bytes = serde_json::to_vec_pretty(records)
        .with_context(|| format!("serializing {}", path.display()))?;

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(WrittenCollection {
        path: path.to_path_buf(),
        records: records.len(),
        bytes: bytes.len(),
        sha256: CollectionStore::sha256_hex(&bytes),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    RateLimited,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("rate limited by {url}")]
    RateLimited { url: String },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
}

/// JSON-over-HTTP client. Transient failures (5xx, timeouts, refused
/// connections) are retried with backoff; a 429 is surfaced immediately so the
/// caller owns rate-limit pacing.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn post_json<B: Serialize + Sync + ?Sized>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<JsonValue, FetchError> {
        self.post_json_with_retries(url, bearer, body)
            .instrument(info_span!("http_post", url))
            .await
    }

    async fn post_json_with_retries<B: Serialize + Sync + ?Sized>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<JsonValue, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.post(url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.json::<JsonValue>().await?);
                    }

                    match classify_status(status) {
                        RetryDisposition::RateLimited => {
                            return Err(FetchError::RateLimited { url: final_url });
                        }
                        RetryDisposition::Retryable if attempt < self.backoff.max_retries => {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                        }
                        _ => {
                            let body = resp.text().await.unwrap_or_default();
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                                body,
                            });
                        }
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quizcat_core::{CatalogIssue, QuizRecord, RecordDefect, RegistryEntry};
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        let hash = CollectionStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn missing_source_is_unavailable() {
        let dir = tempdir().expect("tempdir");
        let store = CollectionStore::new(dir.path());
        let err = store
            .load::<RegistryEntry>("registry", "quiz_titles_and_ids.json")
            .unwrap_err();
        let CatalogError::SourceUnavailable { collection, .. } = err;
        assert_eq!(collection, "registry");
    }

    #[test]
    fn non_array_source_is_unavailable() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("quizzes.json"), r#"{"id": "a"}"#).expect("write");
        let store = CollectionStore::new(dir.path());
        assert!(store.load::<QuizRecord>("content store", "quizzes.json").is_err());
    }

    #[test]
    fn malformed_entries_are_flagged_not_fatal() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("quizzes.json"),
            r#"[{"id": "a", "title": "A"}, {"title": "orphan"}, 42]"#,
        )
        .expect("write");
        let store = CollectionStore::new(dir.path());
        let loaded = store
            .load::<QuizRecord>("content store", "quizzes.json")
            .expect("load");
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.malformed.len(), 2);
        assert!(matches!(
            &loaded.malformed[1],
            CatalogIssue::MalformedRecord {
                index: 2,
                defect: RecordDefect::NotAnObject,
                ..
            }
        ));
    }

    #[test]
    fn absent_build_root_means_zero_built() {
        let dir = tempdir().expect("tempdir");
        let store = CollectionStore::new(dir.path());
        assert!(store.list_build_output("out/quiz").expect("list").is_empty());
    }

    #[test]
    fn build_output_lists_only_directories() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("out/quiz");
        std::fs::create_dir_all(root.join("friends")).expect("mkdir");
        std::fs::create_dir_all(root.join("breaking-bad")).expect("mkdir");
        std::fs::write(root.join("index.html"), "<html/>").expect("write");
        let store = CollectionStore::new(dir.path());
        let built = store.list_build_output("out/quiz").expect("list");
        assert_eq!(
            built.into_iter().collect::<Vec<_>>(),
            vec!["breaking-bad".to_string(), "friends".to_string()]
        );
    }

    #[tokio::test]
    async fn write_then_load_preserves_records() {
        let dir = tempdir().expect("tempdir");
        let store = CollectionStore::new(dir.path());
        let records = vec![
            RegistryEntry::new(1, "a", "Ä quiz"),
            RegistryEntry::new(2, "b", "B"),
        ];
        let written = store
            .write_collection("nested/registry.json", &records)
            .await
            .expect("write");
        assert_eq!(written.records, 2);
        assert!(written.path.exists());

        let text = std::fs::read_to_string(&written.path).expect("read");
        assert!(text.contains("Ä quiz"));
        assert_eq!(CollectionStore::sha256_hex(text.as_bytes()), written.sha256);

        let loaded = store
            .load::<RegistryEntry>("registry", "nested/registry.json")
            .expect("load");
        assert_eq!(loaded.records, records);

        let leftovers = std::fs::read_dir(dir.path().join("nested"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn staged_write_leaves_target_until_promoted() {
        let dir = tempdir().expect("tempdir");
        let store = CollectionStore::new(dir.path());
        store
            .write_collection("registry.json", &[RegistryEntry::new(1, "old", "Old")])
            .await
            .expect("seed");

        let staged = store
            .stage_collection("registry.json", &[RegistryEntry::new(1, "new", "New")])
            .await
            .expect("stage");
        assert_eq!(staged.staged, dir.path().join("registry.json.staged"));
        let before = store
            .load::<RegistryEntry>("registry", "registry.json")
            .expect("load");
        assert_eq!(before.records[0].id, "old");

        let promoted = store.promote(staged).await.expect("promote");
        assert_eq!(promoted.path, dir.path().join("registry.json"));
        assert!(!dir.path().join("registry.json.staged").exists());
        let after = store
            .load::<RegistryEntry>("registry", "registry.json")
            .expect("load");
        assert_eq!(after.records[0].id, "new");
    }

    #[tokio::test]
    async fn remove_tolerates_absent_files() {
        let dir = tempdir().expect("tempdir");
        let store = CollectionStore::new(dir.path());
        store
            .write_collection("progress.json", &[RegistryEntry::new(1, "a", "A")])
            .await
            .expect("seed");
        assert!(store.remove("progress.json").await.expect("remove"));
        assert!(!store.exists("progress.json"));
        assert!(!store.remove("progress.json").await.expect("second remove"));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn too_many_requests_is_not_retried_here() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }
}
