//! Run orchestration for Tender Watch: the two-phase compute/commit
//! workflow, translation enrichment, report rendering, the notification
//! port, ledger compaction, and cron scheduling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tw_adapters::{KeywordRegistry, TenderSource};
use tw_core::{
    active_tenders, candidate_recent, merge_batches, normalize, parse_portal_date, KeywordBatch,
    TenderRecord,
};
use tw_storage::{LedgerStore, NotifiedLedger};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tw-pipeline";

/// How many tenders the notification body previews; the full list lives in
/// the report files.
const HTML_PREVIEW_ROWS: usize = 25;
const PLAIN_PREVIEW_ROWS: usize = 30;

const TRANSLATE_ENDPOINT: &str = "https://translate.googleapis.com/translate_a/single";
const TRANSLATE_PACING: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub batches_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub keywords_file: PathBuf,
    pub ledger_path: PathBuf,
    pub ledger_url: Option<String>,
    pub scheduler_enabled: bool,
    pub notify_cron: String,
    pub translate_enabled: bool,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("TW_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./tenderData"));
        Self {
            batches_dir: std::env::var("TW_BATCHES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("batches")),
            outbox_dir: std::env::var("TW_OUTBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("outbox")),
            keywords_file: std::env::var("TW_KEYWORDS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("keywords.yaml")),
            ledger_path: std::env::var("TW_LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("tenders_sent.json")),
            ledger_url: std::env::var("TW_LEDGER_URL").ok(),
            scheduler_enabled: std::env::var("TW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            notify_cron: std::env::var("TW_NOTIFY_CRON")
                .unwrap_or_else(|_| "0 0 8 * * *".to_string()),
            translate_enabled: std::env::var("TW_TRANSLATE_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            http_timeout_secs: std::env::var("TW_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            data_dir,
        }
    }
}

/// Output of the compute phase: everything the report and notification
/// stages need, with the ledger deliberately untouched.
#[derive(Debug, Clone)]
pub struct RunComputation {
    pub run_id: Uuid,
    pub now: NaiveDateTime,
    pub canonical: Vec<TenderRecord>,
    pub active: Vec<TenderRecord>,
    pub recent_unnotified: Vec<TenderRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batches: usize,
    pub canonical: usize,
    pub active: usize,
    pub recent_unnotified: usize,
    pub committed: usize,
    pub delivery: String,
    pub reports_dir: String,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn LedgerStore>,
    translator: Arc<dyn Translator>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn LedgerStore>) -> Self {
        Self {
            config,
            store,
            translator: Arc::new(NoopTranslator),
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Phase one: normalize every batch, merge into the canonical set,
    /// split into active / candidate-recent, and diff against the ledger.
    ///
    /// Does NOT commit anything — the caller decides when (and whether) the
    /// fresh tenders count as notified.
    pub async fn compute(
        &self,
        batches: &[KeywordBatch],
        now: NaiveDateTime,
    ) -> Result<RunComputation> {
        let mut normalized: Vec<Vec<TenderRecord>> = Vec::with_capacity(batches.len());
        for batch in batches {
            let mut records = Vec::with_capacity(batch.records.len());
            for raw in &batch.records {
                let record = normalize(raw, &batch.keyword, &batch.keyword_en, now);
                if record.key().is_empty() {
                    warn!(
                        title = %record.title,
                        keyword = %batch.keyword_en,
                        "dropping record without a detail url"
                    );
                    continue;
                }
                records.push(record);
            }
            normalized.push(records);
        }

        let canonical = merge_batches(normalized);
        let today = now.date();
        let active = active_tenders(&canonical, today);
        let candidates = candidate_recent(&canonical, today);

        let ledger = self
            .store
            .load()
            .await
            .context("loading notified ledger")?;
        let recent_unnotified = ledger.diff(&candidates);

        info!(
            canonical = canonical.len(),
            active = active.len(),
            candidates = candidates.len(),
            fresh = recent_unnotified.len(),
            already_notified = ledger.len(),
            "computed run sets"
        );

        Ok(RunComputation {
            run_id: Uuid::new_v4(),
            now,
            canonical,
            active,
            recent_unnotified,
        })
    }

    /// Phase two: mark this computation's fresh tenders as notified.
    ///
    /// Call only after the notification has been durably handed off. A
    /// failure here means notified state is now inconsistent (the tenders
    /// went out but are not marked), which is why the error carries that
    /// context for manual reconciliation.
    pub async fn commit(
        &self,
        computation: &RunComputation,
        notified_at: DateTime<Utc>,
    ) -> Result<usize> {
        if computation.recent_unnotified.is_empty() {
            return Ok(0);
        }
        self.store
            .commit(&computation.recent_unnotified, notified_at)
            .await
            .context("committing notified ledger; sent tenders may be unmarked")
    }

    /// The full workflow one trigger (cron or HTTP) runs: fetch batches,
    /// compute, translate, write reports, deliver the notification, and
    /// only then commit the ledger. Any failure before the commit leaves
    /// the ledger untouched so the next run retries the same tenders.
    pub async fn run_workflow(
        &self,
        source: &dyn TenderSource,
        registry: &KeywordRegistry,
        notifier: &dyn Notifier,
        now: DateTime<Utc>,
    ) -> Result<RunSummary> {
        let started_at = now;
        let batches = source
            .fetch_batches(registry)
            .await
            .context("fetching keyword batches")?;

        let mut computation = self.compute(&batches, now.naive_utc()).await?;

        translate_records(self.translator.as_ref(), &mut computation.active).await;
        translate_records(self.translator.as_ref(), &mut computation.recent_unnotified).await;

        let report = NotificationReport::build(&computation)?;
        let reports_dir = write_run_reports(&self.config.data_dir, &computation, &report)
            .await
            .context("writing run reports")?;

        let receipt = notifier
            .deliver(&report)
            .await
            .context("delivering notification")?;
        info!(notifier = %receipt.notifier, detail = %receipt.detail, "notification delivered");

        let committed = self.commit(&computation, now).await?;

        Ok(RunSummary {
            run_id: computation.run_id,
            started_at,
            finished_at: Utc::now(),
            batches: batches.len(),
            canonical: computation.canonical.len(),
            active: computation.active.len(),
            recent_unnotified: computation.recent_unnotified.len(),
            committed,
            delivery: receipt.detail,
            reports_dir: reports_dir.display().to_string(),
        })
    }
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> Result<String>;
}

/// Passes text through unchanged. Used in tests and when translation is
/// disabled by config.
#[derive(Default)]
pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    async fn translate(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

pub fn has_arabic(text: &str) -> bool {
    text.chars().any(|c| ('\u{0600}'..='\u{06FF}').contains(&c))
}

/// Calls the public Google translate web endpoint (the same one the
/// original deployment used). The response is a nested array; the
/// translation is the concatenation of each segment's first element.
pub struct GoogleWebTranslator {
    client: reqwest::Client,
    endpoint: String,
}

impl GoogleWebTranslator {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .build()
            .context("building translate client")?;
        Ok(Self {
            client,
            endpoint: TRANSLATE_ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Translator for GoogleWebTranslator {
    async fn translate(&self, text: &str) -> Result<String> {
        let value: serde_json::Value = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("client", "gtx"),
                ("sl", "ar"),
                ("tl", "en"),
                ("dt", "t"),
                ("q", text),
            ])
            .send()
            .await
            .context("requesting translation")?
            .error_for_status()
            .context("translation endpoint status")?
            .json()
            .await
            .context("decoding translation payload")?;

        let segments = value
            .get(0)
            .and_then(serde_json::Value::as_array)
            .context("unexpected translation payload shape")?;
        let mut out = String::new();
        for segment in segments {
            if let Some(part) = segment.get(0).and_then(serde_json::Value::as_str) {
                out.push_str(part);
            }
        }

        // Pace calls so the unauthenticated endpoint keeps answering.
        tokio::time::sleep(TRANSLATE_PACING).await;
        Ok(out)
    }
}

/// Fill the English display variants in place. Text without Arabic
/// codepoints passes through; a failed call degrades to the source text
/// rather than aborting the run.
pub async fn translate_records(translator: &dyn Translator, records: &mut [TenderRecord]) {
    for record in records.iter_mut() {
        record.title_en = Some(translate_field(translator, &record.title).await);
        record.organization_en = Some(translate_field(translator, &record.organization).await);
        record.sub_department_en = Some(translate_field(translator, &record.sub_department).await);
    }
}

async fn translate_field(translator: &dyn Translator, text: &str) -> String {
    if text.is_empty() || !has_arabic(text) {
        return text.to_string();
    }
    match translator.translate(text).await {
        Ok(english) => english,
        Err(err) => {
            warn!(error = %err, text, "translation failed; keeping source text");
            text.to_string()
        }
    }
}

const CSV_HEADERS: [&str; 14] = [
    "Title (English)",
    "Organization (English)",
    "Organization Sub Department (English)",
    "Tender Doc Purc Value",
    "Published Date",
    "Tender Open Days",
    "Inquiry Deadline",
    "Days Left to Send Inquiries",
    "Bid Deadline Date and Time",
    "Days left Until Bid Closing",
    "Keyword (English)",
    "keywords",
    "Detail Url",
    "Title (Arabic)",
];

/// "2024-01-20 @ 14:00" when the portal showed a closing time, else the
/// bare date.
pub fn bid_deadline_date_time(record: &TenderRecord) -> String {
    match (record.bid_deadline.as_deref(), record.bid_deadline_time.as_deref()) {
        (Some(date), Some(time)) => format!("{date} @ {time}"),
        (Some(date), None) => date.to_string(),
        (None, _) => String::new(),
    }
}

fn display_days(days: Option<i64>) -> String {
    days.map(|d| d.to_string()).unwrap_or_default()
}

fn csv_row(record: &TenderRecord) -> Vec<String> {
    vec![
        record.title_en.clone().unwrap_or_else(|| record.title.clone()),
        record
            .organization_en
            .clone()
            .unwrap_or_else(|| record.organization.clone()),
        record
            .sub_department_en
            .clone()
            .unwrap_or_else(|| record.sub_department.clone()),
        record.bid_value.clone(),
        record.publish_date.clone().unwrap_or_default(),
        display_days(record.tender_open_days),
        record.inquiry_deadline.clone().unwrap_or_default(),
        display_days(record.days_until_inquiry_deadline),
        bid_deadline_date_time(record),
        display_days(record.days_until_bid_deadline),
        record.keyword_en.clone(),
        record.matched_keywords.join(", "),
        record.detail_url.clone(),
        record.title.clone(),
    ]
}

/// CSV with a UTF-8 BOM prefix so Excel renders the Arabic columns.
pub fn render_csv(records: &[TenderRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(CSV_HEADERS)
        .context("writing csv header")?;
    for record in records {
        writer
            .write_record(csv_row(record))
            .context("writing csv row")?;
    }
    let data = writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv buffer: {err}"))?;

    let mut bytes = Vec::with_capacity(3 + data.len());
    bytes.extend_from_slice(b"\xEF\xBB\xBF");
    bytes.extend_from_slice(&data);
    Ok(bytes)
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

async fn write_set(
    reports_dir: &Path,
    stem: &str,
    records: &[TenderRecord],
) -> Result<Vec<(String, PathBuf)>> {
    let json_path = reports_dir.join(format!("{stem}.json"));
    let json = serde_json::to_vec_pretty(records).context("serializing report json")?;
    fs::write(&json_path, json)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;

    let csv_path = reports_dir.join(format!("{stem}.csv"));
    fs::write(&csv_path, render_csv(records)?)
        .await
        .with_context(|| format!("writing {}", csv_path.display()))?;

    Ok(vec![
        (format!("{stem}_json"), json_path),
        (format!("{stem}_csv"), csv_path),
    ])
}

/// Write the per-run report directory: all/active/recent sets as JSON and
/// BOM'd CSV, the rendered notification body, and a sha256 manifest.
pub async fn write_run_reports(
    data_dir: &Path,
    computation: &RunComputation,
    report: &NotificationReport,
) -> Result<PathBuf> {
    let reports_dir = data_dir
        .join("reports")
        .join(computation.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let mut written = Vec::new();
    written.extend(write_set(&reports_dir, "tenders_all", &computation.canonical).await?);
    written.extend(write_set(&reports_dir, "tenders_active", &computation.active).await?);
    written.extend(write_set(&reports_dir, "tenders_recent", &computation.recent_unnotified).await?);

    let html_path = reports_dir.join("notification.html");
    fs::write(&html_path, &report.html_body)
        .await
        .with_context(|| format!("writing {}", html_path.display()))?;
    written.push(("notification_html".to_string(), html_path));

    let manifest = ReportManifest {
        schema_version: 1,
        files: written
            .iter()
            .map(|(name, path)| manifest_entry(name, &reports_dir, path))
            .collect::<Result<Vec<_>>>()?,
    };
    let manifest_path = reports_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(reports_dir)
}

struct PreviewRow {
    title: String,
    organization: String,
    publish_date: String,
    bid_deadline: String,
    days_left: String,
    url: String,
}

#[derive(Template)]
#[template(path = "notification.html")]
struct NotificationTemplate<'a> {
    rows: &'a [PreviewRow],
    shown: usize,
    total: usize,
}

/// The rendered notification handed to whatever dispatches it.
#[derive(Debug, Clone)]
pub struct NotificationReport {
    pub run_id: Uuid,
    pub subject: String,
    pub html_body: String,
    pub plain_body: String,
    pub recent_count: usize,
    pub active_count: usize,
}

impl NotificationReport {
    pub fn build(computation: &RunComputation) -> Result<Self> {
        let recent = &computation.recent_unnotified;

        let plain_body = if recent.is_empty() {
            "No new tenders today.".to_string()
        } else {
            recent
                .iter()
                .take(PLAIN_PREVIEW_ROWS)
                .map(|r| {
                    let title = r.title_en.as_deref().unwrap_or(&r.title);
                    let org = r.organization_en.as_deref().unwrap_or(&r.organization);
                    format!("- {title} | {org} | {}", r.detail_url)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let rows: Vec<PreviewRow> = recent
            .iter()
            .take(HTML_PREVIEW_ROWS)
            .map(|r| PreviewRow {
                title: r.title_en.clone().unwrap_or_else(|| r.title.clone()),
                organization: r
                    .organization_en
                    .clone()
                    .unwrap_or_else(|| r.organization.clone()),
                publish_date: r.publish_date.clone().unwrap_or_default(),
                bid_deadline: bid_deadline_date_time(r),
                days_left: display_days(r.days_until_bid_deadline),
                url: r.detail_url.clone(),
            })
            .collect();

        let html_body = NotificationTemplate {
            rows: &rows,
            shown: rows.len(),
            total: recent.len(),
        }
        .render()
        .context("rendering notification body")?;

        Ok(Self {
            run_id: computation.run_id,
            subject: "Latest Tenders".to_string(),
            html_body,
            plain_body,
            recent_count: recent.len(),
            active_count: computation.active.len(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReceipt {
    pub notifier: String,
    pub detail: String,
}

/// Whatever actually dispatches the notification (the mail relay is a
/// separate deployable behind this seam).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, report: &NotificationReport) -> Result<DeliveryReceipt>;
}

/// Drops the rendered HTML and plain-text bodies into an outbox directory
/// for the mail relay to pick up.
#[derive(Debug, Clone)]
pub struct FileDropNotifier {
    outbox_dir: PathBuf,
}

impl FileDropNotifier {
    pub fn new(outbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            outbox_dir: outbox_dir.into(),
        }
    }
}

#[async_trait]
impl Notifier for FileDropNotifier {
    async fn deliver(&self, report: &NotificationReport) -> Result<DeliveryReceipt> {
        fs::create_dir_all(&self.outbox_dir)
            .await
            .with_context(|| format!("creating {}", self.outbox_dir.display()))?;

        let html_path = self.outbox_dir.join(format!("{}.html", report.run_id));
        fs::write(&html_path, &report.html_body)
            .await
            .with_context(|| format!("writing {}", html_path.display()))?;

        let text_path = self.outbox_dir.join(format!("{}.txt", report.run_id));
        let text = format!("Subject: {}\n\n{}\n", report.subject, report.plain_body);
        fs::write(&text_path, text)
            .await
            .with_context(|| format!("writing {}", text_path.display()))?;

        Ok(DeliveryReceipt {
            notifier: "file-drop".to_string(),
            detail: html_path.display().to_string(),
        })
    }
}

/// Maintenance: drop ledger entries whose bid deadline fell more than
/// `retain_days` before `today`. Entries without a parseable deadline are
/// kept — evicting a key the portal still lists would re-notify it.
pub fn compact_ledger(ledger: &mut NotifiedLedger, today: NaiveDate, retain_days: u64) -> usize {
    let cutoff = today - Days::new(retain_days);
    let before = ledger.len();
    ledger.retain(|entry| {
        match entry
            .record
            .bid_deadline
            .as_deref()
            .and_then(parse_portal_date)
        {
            Some(deadline) => deadline >= cutoff,
            None => true,
        }
    });
    before - ledger.len()
}

/// When enabled by config, schedule the daily workflow run.
pub async fn maybe_build_scheduler(
    pipeline: Arc<Pipeline>,
    registry: Arc<KeywordRegistry>,
    source: Arc<dyn TenderSource>,
    notifier: Arc<dyn Notifier>,
) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().notify_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let registry = registry.clone();
        let source = source.clone();
        let notifier = notifier.clone();
        Box::pin(async move {
            match pipeline
                .run_workflow(source.as_ref(), &registry, notifier.as_ref(), Utc::now())
                .await
            {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    fresh = summary.recent_unnotified,
                    committed = summary.committed,
                    "scheduled tender workflow finished"
                ),
                Err(err) => error!(?err, "scheduled tender workflow failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tw_core::RawTender;
    use tw_storage::LedgerEntry;

    fn record(detail_url: &str, publish: &str, bid_deadline: &str) -> TenderRecord {
        let raw = RawTender {
            title: "توريد معدات".to_string(),
            org_name: "وزارة الصحة".to_string(),
            detail_url: detail_url.to_string(),
            publish_date: publish.to_string(),
            bid_deadline: bid_deadline.to_string(),
            ..RawTender::default()
        };
        normalize(&raw, "صحة", "health", noon("2024-01-11"))
    }

    fn noon(date: &str) -> NaiveDateTime {
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn computation(recent: Vec<TenderRecord>) -> RunComputation {
        RunComputation {
            run_id: Uuid::new_v4(),
            now: noon("2024-01-11"),
            canonical: recent.clone(),
            active: recent.clone(),
            recent_unnotified: recent,
        }
    }

    #[test]
    fn arabic_detection_spans_the_block() {
        assert!(has_arabic("إنشاء طريق"));
        assert!(has_arabic("mixed نص here"));
        assert!(!has_arabic("all ascii"));
        assert!(!has_arabic(""));
    }

    #[test]
    fn csv_starts_with_bom_and_header() {
        let bytes = render_csv(&[record("https://portal/t/1", "2024-01-11", "2024-01-20")])
            .expect("render csv");
        assert_eq!(&bytes[..3], b"\xEF\xBB\xBF");
        let text = String::from_utf8(bytes[3..].to_vec()).expect("utf8");
        let mut lines = text.lines();
        assert!(lines.next().expect("header").starts_with("Title (English)"));
        assert!(lines.next().expect("row").contains("https://portal/t/1"));
    }

    #[test]
    fn bid_deadline_joins_date_and_time() {
        let mut r = record("https://portal/t/1", "2024-01-11", "2024-01-20");
        assert_eq!(bid_deadline_date_time(&r), "2024-01-20");
        r.bid_deadline_time = Some("14:00".to_string());
        assert_eq!(bid_deadline_date_time(&r), "2024-01-20 @ 14:00");
        r.bid_deadline = None;
        assert_eq!(bid_deadline_date_time(&r), "");
    }

    #[test]
    fn notification_body_has_empty_state() {
        let report = NotificationReport::build(&computation(vec![])).expect("build");
        assert_eq!(report.plain_body, "No new tenders today.");
        assert!(report
            .html_body
            .contains("No New Tenders Today Matching Our Keywords."));
    }

    #[test]
    fn notification_body_previews_rows_and_caps() {
        let recent: Vec<TenderRecord> = (0..30)
            .map(|i| record(&format!("https://portal/t/{i}"), "2024-01-11", "2024-01-20"))
            .collect();
        let report = NotificationReport::build(&computation(recent)).expect("build");

        assert_eq!(report.recent_count, 30);
        assert!(report.html_body.contains("https://portal/t/0"));
        assert!(report.html_body.contains("https://portal/t/24"));
        assert!(!report.html_body.contains("https://portal/t/25\""));
        assert!(report.html_body.contains("Showing 25 of 30"));
        assert_eq!(report.plain_body.lines().count(), 30);
    }

    #[test]
    fn compaction_drops_long_expired_keeps_unparseable() {
        let mut ledger = NotifiedLedger::new();
        let notified_at = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).single().unwrap();
        ledger.record(
            &[
                record("https://portal/t/old", "2023-09-01", "2023-10-01"),
                record("https://portal/t/fresh", "2024-01-10", "2024-02-01"),
                record("https://portal/t/odd", "2024-01-10", "whenever"),
            ],
            notified_at,
        );

        let today = NaiveDate::from_ymd_opt(2024, 1, 11).unwrap();
        let dropped = compact_ledger(&mut ledger, today, 30);

        assert_eq!(dropped, 1);
        assert!(!ledger.contains("https://portal/t/old"));
        assert!(ledger.contains("https://portal/t/fresh"));
        assert!(ledger.contains("https://portal/t/odd"));
    }

    #[test]
    fn compaction_boundary_is_inclusive() {
        let mut ledger = NotifiedLedger::new();
        let notified_at = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).single().unwrap();
        // Exactly retain_days old: kept.
        ledger.record(&[record("https://portal/t/edge", "2023-12-01", "2023-12-12")], notified_at);

        let today = NaiveDate::from_ymd_opt(2024, 1, 11).unwrap();
        assert_eq!(compact_ledger(&mut ledger, today, 30), 0);
        assert_eq!(compact_ledger(&mut ledger, today, 29), 1);
    }

    #[tokio::test]
    async fn translate_records_fills_variants_and_skips_non_arabic() {
        struct Upper;
        #[async_trait]
        impl Translator for Upper {
            async fn translate(&self, text: &str) -> Result<String> {
                Ok(format!("EN:{text}"))
            }
        }

        let mut records = vec![record("https://portal/t/1", "2024-01-11", "2024-01-20")];
        records[0].sub_department = "Already English".to_string();

        translate_records(&Upper, &mut records).await;

        assert_eq!(records[0].title_en.as_deref(), Some("EN:توريد معدات"));
        assert_eq!(records[0].organization_en.as_deref(), Some("EN:وزارة الصحة"));
        // No Arabic, no call: passes through unchanged.
        assert_eq!(records[0].sub_department_en.as_deref(), Some("Already English"));
    }

    #[tokio::test]
    async fn failing_translator_degrades_to_source_text() {
        struct Broken;
        #[async_trait]
        impl Translator for Broken {
            async fn translate(&self, _text: &str) -> Result<String> {
                anyhow::bail!("endpoint unavailable")
            }
        }

        let mut records = vec![record("https://portal/t/1", "2024-01-11", "2024-01-20")];
        translate_records(&Broken, &mut records).await;
        assert_eq!(records[0].title_en.as_deref(), Some("توريد معدات"));
    }

    #[test]
    fn ledger_entry_wire_shape_is_stable() {
        let entry = LedgerEntry {
            key: "https://portal/t/1".to_string(),
            notified_at: Utc.with_ymd_and_hms(2024, 1, 11, 8, 0, 0).single().unwrap(),
            record: record("https://portal/t/1", "2024-01-11", "2024-01-20"),
        };
        let json = serde_json::to_value(&entry).expect("serialize");
        assert!(json.get("notifiedAt").is_some());
        assert_eq!(
            json.pointer("/record/detailUrl").and_then(|v| v.as_str()),
            Some("https://portal/t/1")
        );
    }
}
