//! Scraping-collaborator seam: the keyword registry and batch-bundle sources.
//!
//! The browser automation that drives the tender portal is a separate
//! deployable; it drops one capture bundle per search keyword, and the
//! sources here hand those bundles to the pipeline as plain batches.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use tw_core::KeywordBatch;

pub const CRATE_NAME: &str = "tw-adapters";

fn default_true() -> bool {
    true
}

/// One search keyword the portal is queried with, plus the English label
/// carried into reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordConfig {
    pub keyword: String,
    pub keyword_en: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRegistry {
    pub keywords: Vec<KeywordConfig>,
}

impl KeywordRegistry {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &KeywordConfig> {
        self.keywords.iter().filter(|k| k.enabled)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Where keyword batches come from.
#[async_trait]
pub trait TenderSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_batches(
        &self,
        registry: &KeywordRegistry,
    ) -> Result<Vec<KeywordBatch>, SourceError>;
}

/// Loads per-keyword capture bundles (`tenders_<keyword_en>.json`) from a
/// directory. A missing bundle is skipped with a warning — one failed
/// keyword scrape must not block the rest of the run.
#[derive(Debug, Clone)]
pub struct JsonBatchSource {
    dir: PathBuf,
}

impl JsonBatchSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn bundle_path(&self, keyword_en: &str) -> PathBuf {
        self.dir.join(format!("tenders_{keyword_en}.json"))
    }
}

#[async_trait]
impl TenderSource for JsonBatchSource {
    fn source_id(&self) -> &'static str {
        "json-batches"
    }

    async fn fetch_batches(
        &self,
        registry: &KeywordRegistry,
    ) -> Result<Vec<KeywordBatch>, SourceError> {
        let mut batches = Vec::new();
        for config in registry.enabled() {
            let path = self.bundle_path(&config.keyword_en);
            if !path.exists() {
                warn!(
                    keyword = %config.keyword_en,
                    path = %path.display(),
                    "no capture bundle for keyword; skipping"
                );
                continue;
            }
            let mut batch = load_batch_bundle(&path)?;
            if batch.keyword.is_empty() {
                batch.keyword = config.keyword.clone();
            }
            if batch.keyword_en.is_empty() {
                batch.keyword_en = config.keyword_en.clone();
            }
            batches.push(batch);
        }
        Ok(batches)
    }
}

pub fn load_batch_bundle(path: impl AsRef<Path>) -> Result<KeywordBatch> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
