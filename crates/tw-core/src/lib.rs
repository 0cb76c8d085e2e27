//! Core domain model, normalization, merge, and freshness logic for Tender Watch.
//!
//! Everything in this crate is pure and synchronous: "now" is always injected,
//! and nothing here touches the filesystem or the network.

use std::collections::HashMap;

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tw-core";

/// Canonical calendar-date format used by the portal and by all string
/// comparisons in the freshness filter.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

const SECS_PER_DAY: i64 = 86_400;

/// Raw listing fields as captured from the portal, before normalization.
/// Blank strings mean "not present on the page".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTender {
    pub title: String,
    pub org_name: String,
    pub sub_dept_name: String,
    pub bid_value: String,
    pub publish_date: String,
    pub inquiry_deadline: String,
    pub bid_deadline: String,
    pub bid_deadline_time: String,
    pub detail_url: String,
}

/// One keyword's capture, the handoff contract from the scraping
/// collaborator into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordBatch {
    pub keyword: String,
    pub keyword_en: String,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    pub records: Vec<RawTender>,
}

/// Canonical tender representation with derived countdown fields.
///
/// The detail URL is the sole deduplication and ledger identity. Dates are
/// kept as the verbatim scraped strings; derived day counts are `None`
/// whenever the source date does not parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderRecord {
    pub detail_url: String,
    pub title: String,
    pub organization: String,
    pub sub_department: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_en: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_en: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_department_en: Option<String>,
    pub bid_value: String,
    pub publish_date: Option<String>,
    pub inquiry_deadline: Option<String>,
    pub bid_deadline: Option<String>,
    pub bid_deadline_time: Option<String>,
    pub keyword: String,
    pub keyword_en: String,
    /// Every keyword that surfaced this tender, in first-match order.
    /// Survives last-write-wins replacement during the merge.
    #[serde(default)]
    pub matched_keywords: Vec<String>,
    pub days_until_bid_deadline: Option<i64>,
    pub days_until_inquiry_deadline: Option<i64>,
    pub tender_open_days: Option<i64>,
}

impl TenderRecord {
    /// Deduplication and ledger identity.
    pub fn key(&self) -> &str {
        &self.detail_url
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse a canonical `YYYY-MM-DD` date; anything else is `None`.
pub fn parse_portal_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

fn parse_portal_time(value: &str) -> Option<NaiveTime> {
    let trimmed = value.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .ok()
}

/// Whole days from `now` until `deadline`, rounded up. Negative once past.
fn days_until(deadline: NaiveDateTime, now: NaiveDateTime) -> i64 {
    let secs = (deadline - now).num_seconds();
    (secs + SECS_PER_DAY - 1).div_euclid(SECS_PER_DAY)
}

/// The portal shows "مجانا" for documents with no purchase fee; everything
/// else is a decorated number. Returns the sentinel "Free" or bare digits.
pub fn normalize_bid_value(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains("مجانا") || trimmed.eq_ignore_ascii_case("free") {
        "Free".to_string()
    } else {
        trimmed.chars().filter(char::is_ascii_digit).collect()
    }
}

/// Canonicalize one raw scraped record surfaced by `keyword`.
///
/// Never fails: a date that does not parse leaves every field derived from
/// it `None`, while the raw string stays on the record for display.
pub fn normalize(
    raw: &RawTender,
    keyword: &str,
    keyword_en: &str,
    now: NaiveDateTime,
) -> TenderRecord {
    let publish_date = non_blank(&raw.publish_date);
    let inquiry_deadline = non_blank(&raw.inquiry_deadline);
    let bid_deadline = non_blank(&raw.bid_deadline);
    let bid_deadline_time = non_blank(&raw.bid_deadline_time);

    let bid_deadline_at = bid_deadline
        .as_deref()
        .and_then(parse_portal_date)
        .map(|date| {
            let time = bid_deadline_time
                .as_deref()
                .and_then(parse_portal_time)
                .unwrap_or(NaiveTime::MIN);
            date.and_time(time)
        });

    let days_until_bid_deadline = bid_deadline_at.map(|at| days_until(at, now));
    let tender_open_days = match (
        bid_deadline_at,
        publish_date.as_deref().and_then(parse_portal_date),
    ) {
        (Some(deadline), Some(published)) => {
            Some(days_until(deadline, published.and_time(NaiveTime::MIN)))
        }
        _ => None,
    };
    let days_until_inquiry_deadline = inquiry_deadline
        .as_deref()
        .and_then(parse_portal_date)
        .map(|date| days_until(date.and_time(NaiveTime::MIN), now));

    TenderRecord {
        detail_url: raw.detail_url.trim().to_string(),
        title: raw.title.trim().to_string(),
        organization: raw.org_name.trim().to_string(),
        sub_department: raw.sub_dept_name.trim().to_string(),
        title_en: None,
        organization_en: None,
        sub_department_en: None,
        bid_value: normalize_bid_value(&raw.bid_value),
        publish_date,
        inquiry_deadline,
        bid_deadline,
        bid_deadline_time,
        keyword: keyword.to_string(),
        keyword_en: keyword_en.to_string(),
        matched_keywords: vec![keyword.to_string()],
        days_until_bid_deadline,
        days_until_inquiry_deadline,
        tender_open_days,
    }
}

/// Merge per-keyword batches into one canonical set keyed by detail URL.
///
/// Batches are processed in the given order; a later batch's record
/// replaces an earlier one wholesale (last-write-wins, not a field merge) —
/// only the accumulated keyword list is carried across the replacement.
/// Output preserves first-seen key order. O(n) in total input records.
pub fn merge_batches<I>(batches: I) -> Vec<TenderRecord>
where
    I: IntoIterator<Item = Vec<TenderRecord>>,
{
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<TenderRecord> = Vec::new();

    for batch in batches {
        for record in batch {
            if let Some(&slot) = slots.get(record.key()) {
                let mut matched = std::mem::take(&mut merged[slot].matched_keywords);
                for kw in &record.matched_keywords {
                    if !matched.contains(kw) {
                        matched.push(kw.clone());
                    }
                }
                merged[slot] = record;
                merged[slot].matched_keywords = matched;
            } else {
                slots.insert(record.key().to_string(), merged.len());
                merged.push(record);
            }
        }
    }

    merged
}

/// Tenders still open for bidding: bid deadline `>=` today by string
/// comparison (both sides are canonical `YYYY-MM-DD`), or no deadline at
/// all — a deadline the portal never showed is treated as still open.
pub fn active_tenders(records: &[TenderRecord], today: NaiveDate) -> Vec<TenderRecord> {
    let today_str = today.format(DATE_FORMAT).to_string();
    records
        .iter()
        .filter(|r| match r.bid_deadline.as_deref() {
            Some(deadline) => deadline >= today_str.as_str(),
            None => true,
        })
        .cloned()
        .collect()
}

/// Tenders published today or yesterday (exact string match), sorted most
/// recent first. This is the candidate set *before* ledger filtering.
pub fn candidate_recent(records: &[TenderRecord], today: NaiveDate) -> Vec<TenderRecord> {
    let today_str = today.format(DATE_FORMAT).to_string();
    let yesterday_str = (today - Days::new(1)).format(DATE_FORMAT).to_string();

    let mut recent: Vec<TenderRecord> = records
        .iter()
        .filter(|r| match r.publish_date.as_deref() {
            Some(d) => d == today_str || d == yesterday_str,
            None => false,
        })
        .cloned()
        .collect();
    sort_by_publish_desc(&mut recent);
    recent
}

/// Stable descending sort by publish date. Records whose publish date does
/// not parse sort after every valid date; ties keep input order.
pub fn sort_by_publish_desc(records: &mut [TenderRecord]) {
    records.sort_by(|a, b| publish_sort_key(b).cmp(&publish_sort_key(a)));
}

fn publish_sort_key(record: &TenderRecord) -> Option<NaiveDate> {
    record.publish_date.as_deref().and_then(parse_portal_date)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(detail_url: &str, publish: &str, bid_deadline: &str) -> RawTender {
        RawTender {
            title: "إنشاء طريق".to_string(),
            org_name: "وزارة النقل".to_string(),
            sub_dept_name: "فرع الرياض".to_string(),
            bid_value: "500 ريال".to_string(),
            publish_date: publish.to_string(),
            inquiry_deadline: String::new(),
            bid_deadline: bid_deadline.to_string(),
            bid_deadline_time: String::new(),
            detail_url: detail_url.to_string(),
        }
    }

    fn noon(date: &str) -> NaiveDateTime {
        NaiveDate::parse_from_str(date, DATE_FORMAT)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn day(date: &str) -> NaiveDate {
        NaiveDate::parse_from_str(date, DATE_FORMAT).unwrap()
    }

    #[test]
    fn normalize_computes_countdowns_with_ceiling() {
        let mut input = raw("https://portal/t/1", "2024-01-08", "2024-01-20");
        input.inquiry_deadline = "2024-01-15".to_string();
        input.bid_deadline_time = "09:30".to_string();

        let record = normalize(&input, "طرق", "road", noon("2024-01-10"));

        // Deadline 2024-01-20T09:30 is 9d21.5h away from 2024-01-10T12:00.
        assert_eq!(record.days_until_bid_deadline, Some(10));
        // Midnight inquiry deadline, 4.5 days away.
        assert_eq!(record.days_until_inquiry_deadline, Some(5));
        // Open from publish midnight to deadline 09:30 twelve days later.
        assert_eq!(record.tender_open_days, Some(13));
        assert_eq!(record.key(), "https://portal/t/1");
        assert_eq!(record.matched_keywords, vec!["طرق".to_string()]);
    }

    #[test]
    fn normalize_degrades_bad_dates_to_none() {
        let mut input = raw("https://portal/t/2", "not-a-date", "also-bad");
        input.inquiry_deadline = "??".to_string();

        let record = normalize(&input, "طرق", "road", noon("2024-01-10"));

        assert_eq!(record.days_until_bid_deadline, None);
        assert_eq!(record.days_until_inquiry_deadline, None);
        assert_eq!(record.tender_open_days, None);
        // Raw strings survive verbatim for display.
        assert_eq!(record.publish_date.as_deref(), Some("not-a-date"));
        assert_eq!(record.bid_deadline.as_deref(), Some("also-bad"));
    }

    #[test]
    fn normalize_past_deadline_goes_negative() {
        let input = raw("https://portal/t/3", "2024-01-01", "2024-01-05");
        let record = normalize(&input, "طرق", "road", noon("2024-01-10"));
        assert_eq!(record.days_until_bid_deadline, Some(-5));
    }

    #[test]
    fn bid_value_free_sentinel_and_digit_stripping() {
        assert_eq!(normalize_bid_value("مجانا"), "Free");
        assert_eq!(normalize_bid_value("1,500 ريال"), "1500");
        assert_eq!(normalize_bid_value("Free"), "Free");
        assert_eq!(normalize_bid_value("غير محدد"), "");
    }

    #[test]
    fn merge_keeps_each_key_once() {
        let now = noon("2024-01-10");
        let a = normalize(&raw("https://portal/t/1", "2024-01-09", "2024-01-20"), "طرق", "road", now);
        let b = normalize(&raw("https://portal/t/2", "2024-01-09", "2024-01-21"), "طرق", "road", now);
        let c = normalize(&raw("https://portal/t/1", "2024-01-09", "2024-01-20"), "صحة", "health", now);

        let merged = merge_batches(vec![vec![a, b], vec![c]]);

        assert_eq!(merged.len(), 2);
        let keys: Vec<&str> = merged.iter().map(TenderRecord::key).collect();
        assert_eq!(keys, vec!["https://portal/t/1", "https://portal/t/2"]);
    }

    #[test]
    fn merge_last_write_wins_on_body() {
        let now = noon("2024-01-10");
        let mut first = normalize(&raw("https://portal/t/1", "2024-01-09", "2024-01-20"), "طرق", "road", now);
        first.title = "old title".to_string();
        let mut second = normalize(&raw("https://portal/t/1", "2024-01-10", "2024-01-21"), "صحة", "health", now);
        second.title = "new title".to_string();

        let merged = merge_batches(vec![vec![first], vec![second]]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].title, "new title");
        assert_eq!(merged[0].publish_date.as_deref(), Some("2024-01-10"));
        assert_eq!(merged[0].keyword, "صحة");
    }

    #[test]
    fn merge_accumulates_matched_keywords() {
        let now = noon("2024-01-10");
        let first = normalize(&raw("https://portal/t/1", "2024-01-09", "2024-01-20"), "طرق", "road", now);
        let second = normalize(&raw("https://portal/t/1", "2024-01-09", "2024-01-20"), "صحة", "health", now);

        let merged = merge_batches(vec![vec![first], vec![second]]);

        assert_eq!(
            merged[0].matched_keywords,
            vec!["طرق".to_string(), "صحة".to_string()]
        );
        // Display keyword is the last writer's.
        assert_eq!(merged[0].keyword, "صحة");
    }

    #[test]
    fn active_keeps_today_and_open_ended_drops_expired() {
        let now = noon("2024-01-10");
        let expired = normalize(&raw("https://portal/t/1", "2024-01-01", "2024-01-09"), "طرق", "road", now);
        let today = normalize(&raw("https://portal/t/2", "2024-01-01", "2024-01-10"), "طرق", "road", now);
        let open_ended = normalize(&raw("https://portal/t/3", "2024-01-01", ""), "طرق", "road", now);

        let active = active_tenders(&[expired, today, open_ended], day("2024-01-10"));

        let keys: Vec<&str> = active.iter().map(TenderRecord::key).collect();
        assert_eq!(keys, vec!["https://portal/t/2", "https://portal/t/3"]);
    }

    #[test]
    fn candidate_recent_boundary_is_exact() {
        let now = noon("2024-01-11");
        let today = normalize(&raw("https://portal/t/1", "2024-01-11", "2024-01-20"), "طرق", "road", now);
        let yesterday = normalize(&raw("https://portal/t/2", "2024-01-10", "2024-01-20"), "طرق", "road", now);
        let stale = normalize(&raw("https://portal/t/3", "2024-01-09", "2024-01-20"), "طرق", "road", now);

        let recent = candidate_recent(&[stale, yesterday, today], day("2024-01-11"));

        let keys: Vec<&str> = recent.iter().map(TenderRecord::key).collect();
        assert_eq!(keys, vec!["https://portal/t/1", "https://portal/t/2"]);
    }

    #[test]
    fn publish_sort_is_stable_and_tolerates_garbage() {
        let now = noon("2024-01-11");
        let mut records = vec![
            normalize(&raw("https://portal/t/1", "junk", "2024-01-20"), "طرق", "road", now),
            normalize(&raw("https://portal/t/2", "2024-01-10", "2024-01-20"), "طرق", "road", now),
            normalize(&raw("https://portal/t/3", "2024-01-11", "2024-01-20"), "طرق", "road", now),
            normalize(&raw("https://portal/t/4", "2024-01-11", "2024-01-20"), "صحة", "health", now),
        ];

        sort_by_publish_desc(&mut records);

        let keys: Vec<&str> = records.iter().map(TenderRecord::key).collect();
        // Valid dates descending, equal dates in input order, junk last.
        assert_eq!(
            keys,
            vec![
                "https://portal/t/3",
                "https://portal/t/4",
                "https://portal/t/2",
                "https://portal/t/1"
            ]
        );
    }

    #[test]
    fn record_round_trips_with_camel_case_wire_names() {
        let now = noon("2024-01-10");
        let record = normalize(&raw("https://portal/t/1", "2024-01-09", "2024-01-20"), "طرق", "road", now);

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("detailUrl").is_some());
        assert!(json.get("daysUntilBidDeadline").is_some());

        let back: TenderRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
