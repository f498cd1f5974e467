//! Transactional ingestion of one URL test with its derived tables.
//!
//! One insert is one transaction across `url_tests`, `status_histogram` and
//! `resource_types`: either all three observe the measurement or none do.
//! The counter trigger on `url_tests` fires exactly once per committed
//! insert.

use sqlx::error::ErrorKind;
use tracing::warn;
use uuid::Uuid;

use crate::error::{is_connection_class, PumpkinError};
use crate::measurement::{TestMeasurement, TestStatus};
use crate::store::Store;
use crate::utils::db_timestamp;

/// Identity of a freshly inserted url_test row.
#[derive(Debug, Clone)]
pub struct InsertedTest {
    pub id: i64,
    pub uuid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    UniqueViolation,
    ForeignKeyViolation,
    Connection,
    Other,
}

fn classify(err: &sqlx::Error) -> FailureClass {
    if is_connection_class(err) {
        return FailureClass::Connection;
    }
    match err.as_database_error().map(|db| db.kind()) {
        Some(ErrorKind::UniqueViolation) => FailureClass::UniqueViolation,
        Some(ErrorKind::ForeignKeyViolation) => FailureClass::ForeignKeyViolation,
        _ => FailureClass::Other,
    }
}

/// Writes measurements into the store.
#[derive(Clone)]
pub struct Ingestor {
    store: Store,
}

impl Ingestor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Inserts one measurement atomically.
    ///
    /// Retry ladder: a uuid collision is retried once with a fresh uuid; a
    /// connection-class failure is retried once after the pool reconnects;
    /// a foreign-key violation is `RunMissing`; anything else is
    /// `IngestPersistent`.
    pub async fn insert_url_test(
        &self,
        run_id: i64,
        measurement: &TestMeasurement,
    ) -> Result<InsertedTest, PumpkinError> {
        let mut connection_retries = 1;
        let mut uuid_retries = 1;

        loop {
            let uuid = Uuid::new_v4().to_string();
            match self.try_insert(run_id, &uuid, measurement).await {
                Ok(inserted) => return Ok(inserted),
                Err(sqlx::Error::RowNotFound) => {
                    return Err(PumpkinError::RunMissing(run_id));
                }
                Err(e) => match classify(&e) {
                    FailureClass::UniqueViolation if uuid_retries > 0 => {
                        uuid_retries -= 1;
                        warn!("uuid collision on url_test insert, retrying with a fresh uuid");
                    }
                    FailureClass::Connection if connection_retries > 0 => {
                        connection_retries -= 1;
                        warn!("connection error during ingest, retrying once: {e}");
                    }
                    FailureClass::ForeignKeyViolation => {
                        return Err(PumpkinError::RunMissing(run_id));
                    }
                    _ => return Err(PumpkinError::IngestPersistent(e.to_string())),
                },
            }
        }
    }

    /// Fallback for a measurement whose first insert failed persistently:
    /// record it as `FAILED` so the run's accounting stays truthful. Errors
    /// here mean the measurement is dropped.
    pub async fn insert_as_failed(
        &self,
        run_id: i64,
        measurement: &TestMeasurement,
        reason: &str,
    ) -> Result<InsertedTest, PumpkinError> {
        let mut downgraded = measurement.clone();
        downgraded.status = TestStatus::Failed;
        downgraded.error_message = Some(reason.to_string());
        downgraded.http_response_codes.clear();
        downgraded.resources.by_type.clear();
        self.insert_url_test(run_id, &downgraded).await
    }

    async fn try_insert(
        &self,
        run_id: i64,
        uuid: &str,
        m: &TestMeasurement,
    ) -> Result<InsertedTest, sqlx::Error> {
        let mut tx = self.store.pool().begin().await?;

        // Finalized runs admit no further tests; checked inside the
        // transaction so the rule holds under concurrent finalization.
        let run_status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;
        match run_status {
            None => return Err(sqlx::Error::RowNotFound),
            Some((status,)) if status != "RUNNING" => {
                return Err(sqlx::Error::Protocol(format!(
                    "run {run_id} is {status}, not accepting url tests"
                )));
            }
            Some(_) => {}
        }

        let resources_json = serde_json::to_string(&m.resources.by_type)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        let codes_json = serde_json::to_string(&m.http_response_codes)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;

        let (test_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO url_tests
                (uuid, test_run_id, test_timestamp, url, domain, browser, user_agent,
                 page_title, status, error_message, test_duration_ms, scroll_duration_ms,
                 dns_lookup_ms, tcp_connection_ms, tls_negotiation_ms,
                 time_to_first_byte_ms, response_time_ms, dom_content_loaded_ms,
                 dom_interactive_ms, total_page_load_ms,
                 doc_transfer_size, doc_encoded_size, doc_decoded_size,
                 total_resources, total_transfer_size, total_encoded_size,
                 resources_by_type, http_response_codes, screenshot_path, har_path)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(uuid)
        .bind(run_id)
        .bind(db_timestamp(m.started_at))
        .bind(&m.url)
        .bind(&m.domain)
        .bind(&m.browser)
        .bind(&m.user_agent)
        .bind(&m.page_title)
        .bind(m.status.as_str())
        .bind(&m.error_message)
        .bind(m.test_duration_ms)
        .bind(m.scroll_duration_ms)
        .bind(m.timing.dns_lookup_ms)
        .bind(m.timing.tcp_connection_ms)
        .bind(m.timing.tls_negotiation_ms)
        .bind(m.timing.time_to_first_byte_ms)
        .bind(m.timing.response_time_ms)
        .bind(m.timing.dom_content_loaded_ms)
        .bind(m.timing.dom_interactive_ms)
        .bind(m.timing.total_page_load_ms)
        .bind(m.timing.doc_transfer_size)
        .bind(m.timing.doc_encoded_size)
        .bind(m.timing.doc_decoded_size)
        .bind(m.resources.total_resources)
        .bind(m.resources.total_transfer_size)
        .bind(m.resources.total_encoded_size)
        .bind(resources_json)
        .bind(codes_json)
        .bind(&m.screenshot_path)
        .bind(&m.har_path)
        .fetch_one(&mut *tx)
        .await?;

        for (code, count) in &m.http_response_codes {
            sqlx::query(
                "INSERT INTO status_histogram (url_test_id, status_code, response_count)
                 VALUES (?, ?, ?)",
            )
            .bind(test_id)
            .bind(*code as i64)
            .bind(count)
            .execute(&mut *tx)
            .await?;
        }

        for (resource_type, count) in &m.resources.by_type {
            sqlx::query(
                "INSERT INTO resource_types (url_test_id, resource_type, resource_count)
                 VALUES (?, ?, ?)",
            )
            .bind(test_id)
            .bind(resource_type)
            .bind(count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(InsertedTest {
            id: test_id,
            uuid: uuid.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{NavigationTiming, ResourceStats};
    use crate::store::test_support::temp_store;
    use chrono::Utc;
    use std::collections::BTreeMap;

    pub(crate) fn sample_measurement(url: &str, status: TestStatus) -> TestMeasurement {
        let mut codes = BTreeMap::new();
        codes.insert(200u16, 4i64);
        let mut by_type = BTreeMap::new();
        by_type.insert("script".to_string(), 3i64);
        by_type.insert("img".to_string(), 1i64);

        TestMeasurement {
            url: url.to_string(),
            domain: crate::utils::extract_domain(url),
            browser: "chromium".to_string(),
            user_agent: "test-agent".to_string(),
            page_title: Some("Example".to_string()),
            status,
            error_message: None,
            started_at: Utc::now(),
            test_duration_ms: 640,
            scroll_duration_ms: 120,
            timing: NavigationTiming {
                dns_lookup_ms: Some(12.3),
                time_to_first_byte_ms: Some(88.0),
                total_page_load_ms: Some(640.5),
                doc_transfer_size: Some(14_000),
                ..NavigationTiming::default()
            },
            resources: ResourceStats {
                total_resources: 4,
                total_transfer_size: 14_000,
                total_encoded_size: 13_500,
                by_type,
            },
            http_response_codes: codes,
            screenshot_path: "/app/test-history/x/screenshot.png".to_string(),
            har_path: "/app/test-history/x/network.har".to_string(),
        }
    }

    async fn seed_run(store: &Store) -> i64 {
        sqlx::query(
            "INSERT INTO runs (uuid, run_timestamp, total_urls, parallel_workers)
             VALUES (?, ?, 1, 1)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(db_timestamp(Utc::now()))
        .execute(store.pool())
        .await
        .unwrap();
        let (id,): (i64,) = sqlx::query_as("SELECT MAX(id) FROM runs")
            .fetch_one(store.pool())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn insert_writes_all_three_tables() {
        let (store, _tmp) = temp_store().await;
        let run_id = seed_run(&store).await;
        let ingestor = Ingestor::new(store.clone());

        let m = sample_measurement("https://example.com", TestStatus::Passed);
        let inserted = ingestor.insert_url_test(run_id, &m).await.unwrap();
        assert!(inserted.id > 0);

        // Normalized histogram matches the JSON map (key set and sum).
        let histogram: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT status_code, response_count FROM status_histogram WHERE url_test_id = ?",
        )
        .bind(inserted.id)
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(histogram, vec![(200, 4)]);

        let resources: Vec<(String, i64)> = sqlx::query_as(
            "SELECT resource_type, resource_count FROM resource_types
             WHERE url_test_id = ? ORDER BY resource_type",
        )
        .bind(inserted.id)
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(
            resources,
            vec![("img".to_string(), 1), ("script".to_string(), 3)]
        );

        // The counter trigger fired exactly once.
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.passed, 1);
        assert_eq!(run.failed, 0);
    }

    #[tokio::test]
    async fn non_passed_statuses_count_as_failed() {
        let (store, _tmp) = temp_store().await;
        let run_id = seed_run(&store).await;
        let ingestor = Ingestor::new(store.clone());

        for status in [TestStatus::Timeout, TestStatus::Error, TestStatus::Failed] {
            let m = sample_measurement("https://example.com", status);
            ingestor.insert_url_test(run_id, &m).await.unwrap();
        }

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.passed, 0);
        assert_eq!(run.failed, 3);
    }

    #[tokio::test]
    async fn missing_run_is_run_missing() {
        let (store, _tmp) = temp_store().await;
        let ingestor = Ingestor::new(store.clone());
        let m = sample_measurement("https://example.com", TestStatus::Passed);

        let err = ingestor.insert_url_test(4242, &m).await.unwrap_err();
        assert!(matches!(err, PumpkinError::RunMissing(4242)));
    }

    #[tokio::test]
    async fn finalized_run_rejects_inserts() {
        let (store, _tmp) = temp_store().await;
        let run_id = seed_run(&store).await;
        sqlx::query("UPDATE runs SET status = 'COMPLETED' WHERE id = ?")
            .bind(run_id)
            .execute(store.pool())
            .await
            .unwrap();

        let ingestor = Ingestor::new(store.clone());
        let m = sample_measurement("https://example.com", TestStatus::Passed);
        let err = ingestor.insert_url_test(run_id, &m).await.unwrap_err();
        assert!(matches!(err, PumpkinError::IngestPersistent(_)));
        assert_eq!(store.count_url_tests(run_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_fallback_clears_derived_maps() {
        let (store, _tmp) = temp_store().await;
        let run_id = seed_run(&store).await;
        let ingestor = Ingestor::new(store.clone());

        let m = sample_measurement("https://example.com", TestStatus::Passed);
        let inserted = ingestor
            .insert_as_failed(run_id, &m, "disk full while persisting")
            .await
            .unwrap();

        let (status, codes): (String, String) = sqlx::query_as(
            "SELECT status, http_response_codes FROM url_tests WHERE id = ?",
        )
        .bind(inserted.id)
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(status, "FAILED");
        assert_eq!(codes, "{}");
    }
}
