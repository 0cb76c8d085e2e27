//! Durable "already notified" ledger for Tender Watch: the storage port and
//! its local-file, remote-object, and in-memory backends.

use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tw_core::TenderRecord;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tw-storage";

/// One committed "this tender was already included in a sent notification"
/// fact. The full record is kept alongside the key for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub key: String,
    pub notified_at: DateTime<Utc>,
    pub record: TenderRecord,
}

/// In-memory view of the persisted notified set, keyed by tender detail URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifiedLedger {
    entries: BTreeMap<String, LedgerEntry>,
}

impl NotifiedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries. A duplicated key keeps the last
    /// occurrence, matching the commit-side dedup rule.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        let mut map = BTreeMap::new();
        for entry in entries {
            map.insert(entry.key.clone(), entry);
        }
        Self { entries: map }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    pub fn to_entries(&self) -> Vec<LedgerEntry> {
        self.entries.values().cloned().collect()
    }

    /// The subset of `candidates` not yet notified, in candidate order.
    ///
    /// Candidates are deduplicated by key first. The merge engine already
    /// guarantees unique keys upstream, but the ledger must hold the
    /// at-most-once invariant on its own when used standalone.
    pub fn diff(&self, candidates: &[TenderRecord]) -> Vec<TenderRecord> {
        let mut seen: HashSet<&str> = HashSet::new();
        candidates
            .iter()
            .filter(|record| seen.insert(record.key()) && !self.contains(record.key()))
            .cloned()
            .collect()
    }

    /// Insert or replace entries for `records`. Re-recording a key keeps the
    /// latest record body instead of duplicating the entry. Returns how many
    /// keys were not previously present.
    pub fn record(&mut self, records: &[TenderRecord], notified_at: DateTime<Utc>) -> usize {
        let mut added = 0;
        for record in records {
            let entry = LedgerEntry {
                key: record.key().to_string(),
                notified_at,
                record: record.clone(),
            };
            if self.entries.insert(entry.key.clone(), entry).is_none() {
                added += 1;
            }
        }
        added
    }

    /// Keep only entries for which `keep` returns true. Maintenance
    /// (compaction) support; the notification path never removes entries.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&LedgerEntry) -> bool,
    {
        self.entries.retain(|_, entry| keep(entry));
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger i/o at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger at {location} is corrupt: {source}")]
    Corrupt {
        location: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding ledger: {0}")]
    Encode(serde_json::Error),
    #[error("ledger endpoint returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("ledger request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
}

/// Storage port for the persisted notified ledger.
///
/// `load` returns an empty ledger when nothing was ever persisted (first-run
/// bootstrap) but fails loudly on corrupt state — silently treating
/// corruption as empty would mass re-notify every tender ever sent.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load(&self) -> Result<NotifiedLedger, LedgerError>;

    /// Append `newly_notified` to the persisted set and flush durably.
    /// Idempotent: committing a key twice replaces its entry. Returns the
    /// number of keys not previously present.
    async fn commit(
        &self,
        newly_notified: &[TenderRecord],
        notified_at: DateTime<Utc>,
    ) -> Result<usize, LedgerError>;

    /// Overwrite the persisted ledger wholesale. Compaction only; the
    /// notification path never shrinks the ledger.
    async fn replace(&self, ledger: &NotifiedLedger) -> Result<(), LedgerError>;
}

/// Ledger persisted as a JSON array in a local file, written atomically via
/// temp file + rename.
#[derive(Debug, Clone)]
pub struct LocalLedgerStore {
    path: PathBuf,
}

impl LocalLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_ledger(&self) -> Result<NotifiedLedger, LedgerError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<LedgerEntry>>(&bytes)
                .map(NotifiedLedger::from_entries)
                .map_err(|source| LedgerError::Corrupt {
                    location: self.path.display().to_string(),
                    source,
                }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no ledger file yet; starting empty");
                Ok(NotifiedLedger::new())
            }
            Err(source) => Err(LedgerError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn write_ledger(&self, ledger: &NotifiedLedger) -> Result<(), LedgerError> {
        let bytes =
            serde_json::to_vec_pretty(&ledger.to_entries()).map_err(LedgerError::Encode)?;

        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };

        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_err(source))
            }
        }
    }
}

#[async_trait]
impl LedgerStore for LocalLedgerStore {
    async fn load(&self) -> Result<NotifiedLedger, LedgerError> {
        self.read_ledger().await
    }

    async fn commit(
        &self,
        newly_notified: &[TenderRecord],
        notified_at: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let mut ledger = self.read_ledger().await?;
        let added = ledger.record(newly_notified, notified_at);
        self.write_ledger(&ledger).await?;
        info!(
            path = %self.path.display(),
            added,
            total = ledger.len(),
            "committed notified ledger"
        );
        Ok(added)
    }

    async fn replace(&self, ledger: &NotifiedLedger) -> Result<(), LedgerError> {
        self.write_ledger(ledger).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
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

/// Ledger persisted as a single JSON object in bucket-style storage behind a
/// plain HTTP GET/PUT endpoint. A 404 on load is the first-run bootstrap;
/// transient upstream failures are retried with exponential backoff.
#[derive(Debug)]
pub struct RemoteLedgerStore {
    client: reqwest::Client,
    object_url: String,
    backoff: BackoffPolicy,
}

impl RemoteLedgerStore {
    pub fn new(object_url: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            object_url: object_url.into(),
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    async fn fetch_ledger(&self) -> Result<NotifiedLedger, LedgerError> {
        for attempt in 0..=self.backoff.max_retries {
            let result = self.client.get(&self.object_url).send().await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::NOT_FOUND {
                        info!(url = %self.object_url, "no remote ledger object yet; starting empty");
                        return Ok(NotifiedLedger::new());
                    }
                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        return serde_json::from_slice::<Vec<LedgerEntry>>(&bytes)
                            .map(NotifiedLedger::from_entries)
                            .map_err(|source| LedgerError::Corrupt {
                                location: self.object_url.clone(),
                                source,
                            });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(LedgerError::HttpStatus {
                        status: status.as_u16(),
                        url: self.object_url.clone(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url = %self.object_url, attempt, error = %err, "ledger fetch failed; retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(LedgerError::Request(err));
                }
            }
        }
        unreachable!("retry loop returns on final attempt")
    }

    async fn store_ledger(&self, ledger: &NotifiedLedger) -> Result<(), LedgerError> {
        let bytes =
            serde_json::to_vec_pretty(&ledger.to_entries()).map_err(LedgerError::Encode)?;

        for attempt in 0..=self.backoff.max_retries {
            let result = self
                .client
                .put(&self.object_url)
                .header(header::CONTENT_TYPE, "application/json")
                .body(bytes.clone())
                .send()
                .await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(LedgerError::HttpStatus {
                        status: status.as_u16(),
                        url: self.object_url.clone(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url = %self.object_url, attempt, error = %err, "ledger upload failed; retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(LedgerError::Request(err));
                }
            }
        }
        unreachable!("retry loop returns on final attempt")
    }
}

#[async_trait]
impl LedgerStore for RemoteLedgerStore {
    async fn load(&self) -> Result<NotifiedLedger, LedgerError> {
        self.fetch_ledger().await
    }

    async fn commit(
        &self,
        newly_notified: &[TenderRecord],
        notified_at: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let mut ledger = self.fetch_ledger().await?;
        let added = ledger.record(newly_notified, notified_at);
        self.store_ledger(&ledger).await?;
        info!(url = %self.object_url, added, total = ledger.len(), "committed notified ledger");
        Ok(added)
    }

    async fn replace(&self, ledger: &NotifiedLedger) -> Result<(), LedgerError> {
        self.store_ledger(ledger).await
    }
}

/// Process-local store used as the unit-test fake.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    inner: tokio::sync::Mutex<NotifiedLedger>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(ledger: NotifiedLedger) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(ledger),
        }
    }

    pub async fn snapshot(&self) -> NotifiedLedger {
        self.inner.lock().await.clone()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn load(&self) -> Result<NotifiedLedger, LedgerError> {
        Ok(self.inner.lock().await.clone())
    }

    async fn commit(
        &self,
        newly_notified: &[TenderRecord],
        notified_at: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        Ok(self.inner.lock().await.record(newly_notified, notified_at))
    }

    async fn replace(&self, ledger: &NotifiedLedger) -> Result<(), LedgerError> {
        *self.inner.lock().await = ledger.clone();
        Ok(())
    }
}
