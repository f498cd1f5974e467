//! Read-side projections over the store, consumed by the HTTP API.
//!
//! Queries are read-only and tolerate arbitrary interleaving with scheduler
//! writes. Aggregates over status codes go through the normalized
//! `status_histogram` table; per-row maps come from the JSON columns.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::Serialize;
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::PumpkinError;
use crate::har::{self, FailedRequest};
use crate::store::Store;

const RUN_SUMMARY_SQL: &str = r#"
SELECT r.id, r.uuid, r.run_timestamp, r.total_urls, r.parallel_workers,
       r.total_duration_ms, r.passed, r.failed, r.status, r.notes,
       (SELECT COUNT(*) FROM url_tests t WHERE t.test_run_id = r.id) AS tests_completed,
       (SELECT AVG(t.total_page_load_ms) FROM url_tests t
         WHERE t.test_run_id = r.id AND t.total_page_load_ms IS NOT NULL) AS avg_page_load_ms,
       (SELECT AVG(t.time_to_first_byte_ms) FROM url_tests t
         WHERE t.test_run_id = r.id AND t.time_to_first_byte_ms IS NOT NULL) AS avg_ttfb_ms
FROM runs r
"#;

const TEST_SUMMARY_COLUMNS: &str = r#"
SELECT t.id, t.uuid, t.test_run_id, t.test_timestamp, t.url, t.domain,
       t.page_title, t.status, t.error_message, t.test_duration_ms,
       t.total_page_load_ms, t.time_to_first_byte_ms, t.dom_content_loaded_ms,
       t.total_resources, t.total_transfer_size
FROM url_tests t
"#;

/// Run header with aggregate averages over its tests.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: i64,
    pub uuid: String,
    pub run_timestamp: String,
    pub total_urls: i64,
    pub parallel_workers: i64,
    pub total_duration_ms: Option<i64>,
    pub passed: i64,
    pub failed: i64,
    pub status: String,
    pub notes: Option<String>,
    pub tests_completed: i64,
    pub avg_page_load_ms: Option<f64>,
    pub avg_ttfb_ms: Option<f64>,
}

/// Compact per-test view for listings.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UrlTestSummary {
    pub id: i64,
    pub uuid: String,
    pub test_run_id: i64,
    pub test_timestamp: String,
    pub url: String,
    pub domain: String,
    pub page_title: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub test_duration_ms: i64,
    pub total_page_load_ms: Option<f64>,
    pub time_to_first_byte_ms: Option<f64>,
    pub dom_content_loaded_ms: Option<f64>,
    pub total_resources: i64,
    pub total_transfer_size: i64,
}

#[derive(Debug, Clone, FromRow)]
struct UrlTestJoinedRow {
    pub id: i64,
    pub uuid: String,
    pub test_run_id: i64,
    pub run_timestamp: String,
    pub test_timestamp: String,
    pub url: String,
    pub domain: String,
    pub browser: String,
    pub user_agent: String,
    pub page_title: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub test_duration_ms: i64,
    pub scroll_duration_ms: i64,
    pub dns_lookup_ms: Option<f64>,
    pub tcp_connection_ms: Option<f64>,
    pub tls_negotiation_ms: Option<f64>,
    pub time_to_first_byte_ms: Option<f64>,
    pub response_time_ms: Option<f64>,
    pub dom_content_loaded_ms: Option<f64>,
    pub dom_interactive_ms: Option<f64>,
    pub total_page_load_ms: Option<f64>,
    pub doc_transfer_size: Option<i64>,
    pub doc_encoded_size: Option<i64>,
    pub doc_decoded_size: Option<i64>,
    pub total_resources: i64,
    pub total_transfer_size: i64,
    pub total_encoded_size: i64,
    pub resources_by_type: String,
    pub http_response_codes: String,
    pub screenshot_path: String,
    pub har_path: String,
}

/// Full per-test record, joined with its run and with web-facing artifact
/// paths (container prefix stripped).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlTestDetail {
    pub id: i64,
    pub uuid: String,
    pub test_run_id: i64,
    pub run_timestamp: String,
    pub test_timestamp: String,
    pub url: String,
    pub domain: String,
    pub browser: String,
    pub user_agent: String,
    pub page_title: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub test_duration_ms: i64,
    pub scroll_duration_ms: i64,
    pub dns_lookup_ms: Option<f64>,
    pub tcp_connection_ms: Option<f64>,
    pub tls_negotiation_ms: Option<f64>,
    pub time_to_first_byte_ms: Option<f64>,
    pub response_time_ms: Option<f64>,
    pub dom_content_loaded_ms: Option<f64>,
    pub dom_interactive_ms: Option<f64>,
    pub total_page_load_ms: Option<f64>,
    pub doc_transfer_size: Option<i64>,
    pub doc_encoded_size: Option<i64>,
    pub doc_decoded_size: Option<i64>,
    pub total_resources: i64,
    pub total_transfer_size: i64,
    pub total_encoded_size: i64,
    pub resources_by_type: BTreeMap<String, i64>,
    pub http_response_codes: BTreeMap<String, i64>,
    pub screenshot_path: String,
    pub har_path: String,
}

/// One calendar-day bucket of load times for a host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAverage {
    pub date: String,
    pub avg_ms: f64,
    pub count: i64,
}

fn tz_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_]+/[A-Za-z_]+$|^UTC$").expect("timezone pattern")
    })
}

/// Translates a stored container path to the path the dashboard fetches.
pub fn to_web_path(path: &str) -> String {
    path.strip_prefix("/app")
        .filter(|rest| rest.starts_with('/'))
        .unwrap_or(path)
        .to_string()
}

fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn parse_map(json: &str) -> BTreeMap<String, i64> {
    serde_json::from_str(json).unwrap_or_default()
}

impl UrlTestDetail {
    fn from_row(row: UrlTestJoinedRow) -> Self {
        Self {
            id: row.id,
            uuid: row.uuid,
            test_run_id: row.test_run_id,
            run_timestamp: row.run_timestamp,
            test_timestamp: row.test_timestamp,
            url: row.url,
            domain: row.domain,
            browser: row.browser,
            user_agent: row.user_agent,
            page_title: row.page_title,
            status: row.status,
            error_message: row.error_message,
            test_duration_ms: row.test_duration_ms,
            scroll_duration_ms: row.scroll_duration_ms,
            dns_lookup_ms: row.dns_lookup_ms,
            tcp_connection_ms: row.tcp_connection_ms,
            tls_negotiation_ms: row.tls_negotiation_ms,
            time_to_first_byte_ms: row.time_to_first_byte_ms,
            response_time_ms: row.response_time_ms,
            dom_content_loaded_ms: row.dom_content_loaded_ms,
            dom_interactive_ms: row.dom_interactive_ms,
            total_page_load_ms: row.total_page_load_ms,
            doc_transfer_size: row.doc_transfer_size,
            doc_encoded_size: row.doc_encoded_size,
            doc_decoded_size: row.doc_decoded_size,
            total_resources: row.total_resources,
            total_transfer_size: row.total_transfer_size,
            total_encoded_size: row.total_encoded_size,
            resources_by_type: parse_map(&row.resources_by_type),
            http_response_codes: parse_map(&row.http_response_codes),
            screenshot_path: to_web_path(&row.screenshot_path),
            har_path: to_web_path(&row.har_path),
        }
    }
}

/// Read-only query façade over the store.
#[derive(Clone)]
pub struct QueryLayer {
    store: Store,
}

impl QueryLayer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get_latest_run(&self) -> Result<RunSummary, PumpkinError> {
        sqlx::query_as::<_, RunSummary>("SELECT * FROM v_latest_test_run")
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| PumpkinError::NotFound("run".to_string()))
    }

    pub async fn list_runs(&self, limit: i64) -> Result<Vec<RunSummary>, PumpkinError> {
        let sql = format!("{RUN_SUMMARY_SQL} ORDER BY r.run_timestamp DESC LIMIT ?");
        Ok(sqlx::query_as::<_, RunSummary>(&sql)
            .bind(limit.clamp(1, 500))
            .fetch_all(self.store.pool())
            .await?)
    }

    pub async fn get_run(&self, run_id: i64) -> Result<RunSummary, PumpkinError> {
        let sql = format!("{RUN_SUMMARY_SQL} WHERE r.id = ?");
        sqlx::query_as::<_, RunSummary>(&sql)
            .bind(run_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| PumpkinError::NotFound(format!("run {run_id}")))
    }

    pub async fn list_url_tests_for_run(
        &self,
        run_id: i64,
    ) -> Result<Vec<UrlTestSummary>, PumpkinError> {
        // Ensure 404 for an absent run rather than an empty list.
        self.get_run(run_id).await?;
        let sql = format!(
            "{TEST_SUMMARY_COLUMNS} WHERE t.test_run_id = ? ORDER BY t.test_timestamp ASC, t.id ASC"
        );
        Ok(sqlx::query_as::<_, UrlTestSummary>(&sql)
            .bind(run_id)
            .fetch_all(self.store.pool())
            .await?)
    }

    pub async fn get_url_test(&self, test_id: i64) -> Result<UrlTestDetail, PumpkinError> {
        let row = sqlx::query_as::<_, UrlTestJoinedRow>(
            "SELECT t.*, r.run_timestamp FROM url_tests t
             JOIN runs r ON r.id = t.test_run_id
             WHERE t.id = ?",
        )
        .bind(test_id)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or_else(|| PumpkinError::NotFound(format!("url test {test_id}")))?;
        Ok(UrlTestDetail::from_row(row))
    }

    /// Failed requests for one test, read from its HAR recording, ascending
    /// by status code with archive order preserved within a code.
    pub async fn get_failed_requests_for_test(
        &self,
        test_id: i64,
    ) -> Result<Vec<FailedRequest>, PumpkinError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT har_path FROM url_tests WHERE id = ?")
                .bind(test_id)
                .fetch_optional(self.store.pool())
                .await?;
        let (har_path,) =
            row.ok_or_else(|| PumpkinError::NotFound(format!("url test {test_id}")))?;

        let summary = har::analyze_file(Path::new(&har_path));
        let mut failed = summary.failed_requests;
        failed.sort_by_key(|f| f.status_code);
        Ok(failed)
    }

    pub async fn list_slowest_in_latest(
        &self,
        limit: i64,
    ) -> Result<Vec<UrlTestSummary>, PumpkinError> {
        self.latest_ranked(limit, "DESC").await
    }

    pub async fn list_fastest_in_latest(
        &self,
        limit: i64,
    ) -> Result<Vec<UrlTestSummary>, PumpkinError> {
        self.latest_ranked(limit, "ASC").await
    }

    async fn latest_ranked(
        &self,
        limit: i64,
        direction: &str,
    ) -> Result<Vec<UrlTestSummary>, PumpkinError> {
        let sql = format!(
            "{TEST_SUMMARY_COLUMNS}
             WHERE t.test_run_id = (SELECT id FROM runs ORDER BY run_timestamp DESC LIMIT 1)
               AND t.total_page_load_ms IS NOT NULL
             ORDER BY t.total_page_load_ms {direction}
             LIMIT ?"
        );
        Ok(sqlx::query_as::<_, UrlTestSummary>(&sql)
            .bind(limit.clamp(1, 500))
            .fetch_all(self.store.pool())
            .await?)
    }

    /// Tests that failed outright or saw at least one 4xx/5xx response.
    pub async fn list_tests_with_errors(
        &self,
        limit: i64,
    ) -> Result<Vec<UrlTestSummary>, PumpkinError> {
        Ok(sqlx::query_as::<_, UrlTestSummary>(
            "SELECT t.id, t.uuid, t.test_run_id, t.test_timestamp, t.url, t.domain,
                    t.page_title, t.status, t.error_message, t.test_duration_ms,
                    t.total_page_load_ms, t.time_to_first_byte_ms, t.dom_content_loaded_ms,
                    t.total_resources, t.total_transfer_size
             FROM v_tests_with_errors t
             ORDER BY t.test_timestamp DESC
             LIMIT ?",
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(self.store.pool())
        .await?)
    }

    /// Time series for one hostname, flattened through the trends view.
    pub async fn domain_trend(
        &self,
        host: &str,
        limit: i64,
    ) -> Result<Vec<UrlTestSummary>, PumpkinError> {
        Ok(sqlx::query_as::<_, UrlTestSummary>(
            "SELECT id, uuid, test_run_id, test_timestamp, url, domain, page_title,
                    status, error_message, test_duration_ms, total_page_load_ms,
                    time_to_first_byte_ms, dom_content_loaded_ms, total_resources,
                    total_transfer_size
             FROM v_performance_trends
             WHERE domain = ?
             ORDER BY run_timestamp DESC
             LIMIT ?",
        )
        .bind(host)
        .bind(limit.clamp(1, 500))
        .fetch_all(self.store.pool())
        .await?)
    }

    pub async fn url_autocomplete(
        &self,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<String>, PumpkinError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT domain FROM url_tests
             WHERE domain LIKE ? ESCAPE '\\'
             ORDER BY domain ASC
             LIMIT ?",
        )
        .bind(format!("{}%", escape_like(prefix)))
        .bind(limit.clamp(1, 100))
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.into_iter().map(|(d,)| d).collect())
    }

    pub async fn tests_for_url(
        &self,
        host: &str,
        limit: i64,
    ) -> Result<Vec<UrlTestSummary>, PumpkinError> {
        let sql = format!(
            "{TEST_SUMMARY_COLUMNS}
             WHERE t.domain = ?
             ORDER BY t.test_timestamp DESC
             LIMIT ?"
        );
        Ok(sqlx::query_as::<_, UrlTestSummary>(&sql)
            .bind(host)
            .bind(limit.clamp(1, 500))
            .fetch_all(self.store.pool())
            .await?)
    }

    /// Average load time per calendar day in the requested IANA zone, over
    /// the trailing `days` window ending today. Days without tests are
    /// zero-filled.
    pub async fn daily_average_load_time(
        &self,
        host: &str,
        days: i64,
        tz: &str,
    ) -> Result<Vec<DailyAverage>, PumpkinError> {
        if !(1..=365).contains(&days) {
            return Err(PumpkinError::BadRequest(format!(
                "days must be between 1 and 365, got {days}"
            )));
        }
        if !tz_pattern().is_match(tz) {
            return Err(PumpkinError::BadRequest(format!("invalid timezone: {tz}")));
        }
        let zone: Tz = tz
            .parse()
            .map_err(|_| PumpkinError::BadRequest(format!("unknown timezone: {tz}")))?;

        let rows: Vec<(String, f64)> = sqlx::query_as(
            "SELECT test_timestamp, total_page_load_ms FROM url_tests
             WHERE domain = ? AND total_page_load_ms IS NOT NULL",
        )
        .bind(host)
        .fetch_all(self.store.pool())
        .await?;

        let mut buckets: BTreeMap<NaiveDate, (f64, i64)> = BTreeMap::new();
        for (timestamp, load_ms) in rows {
            let Ok(parsed) = DateTime::parse_from_rfc3339(&timestamp) else {
                continue;
            };
            let local_day = parsed.with_timezone(&zone).date_naive();
            let bucket = buckets.entry(local_day).or_insert((0.0, 0));
            bucket.0 += load_ms;
            bucket.1 += 1;
        }

        let today = Utc::now().with_timezone(&zone).date_naive();
        let start = today - ChronoDuration::days(days - 1);

        let mut result = Vec::with_capacity(days as usize);
        let mut day = start;
        while day <= today {
            let (sum, count) = buckets.get(&day).copied().unwrap_or((0.0, 0));
            result.push(DailyAverage {
                date: format!("{:04}-{:02}-{:02}", day.year(), day.month(), day.day()),
                avg_ms: if count > 0 { sum / count as f64 } else { 0.0 },
                count,
            });
            day = day + ChronoDuration::days(1);
        }
        Ok(result)
    }

    /// Calendar dates (UTC) with at least one run, newest first.
    pub async fn available_dates(&self) -> Result<Vec<String>, PumpkinError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT substr(run_timestamp, 1, 10) AS day FROM runs ORDER BY day DESC",
        )
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.into_iter().map(|(d,)| d).collect())
    }

    pub async fn runs_by_date(&self, date: &str) -> Result<Vec<RunSummary>, PumpkinError> {
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| PumpkinError::BadRequest(format!("invalid date: {date}")))?;
        let sql = format!(
            "{RUN_SUMMARY_SQL} WHERE substr(r.run_timestamp, 1, 10) = ?
             ORDER BY r.run_timestamp DESC"
        );
        Ok(sqlx::query_as::<_, RunSummary>(&sql)
            .bind(date)
            .fetch_all(self.store.pool())
            .await?)
    }
}
