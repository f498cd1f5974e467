//! End-to-end scenarios across scheduler, ingestion, store and queries,
//! driven by a scripted driver instead of a real browser.

#[cfg(test)]
mod scenarios {
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    use crate::artifacts::ArtifactStore;
    use crate::coordinator::RunCoordinator;
    use crate::driver::{UrlDriver, UrlJob};
    use crate::error::PumpkinError;
    use crate::har::{Har, HarContent, HarEntry, HarLog, HarRequest, HarResponse};
    use crate::ingest::Ingestor;
    use crate::measurement::{NavigationTiming, ResourceStats, TestMeasurement, TestStatus};
    use crate::queries::QueryLayer;
    use crate::scheduler::{RunOutcome, Scheduler};
    use crate::store::test_support::temp_store;
    use crate::store::{RunStatus, Store};

    /// Writes realistic artifacts and measurements without a browser. URLs
    /// containing `timeout` produce a TIMEOUT with a partial HAR; URLs
    /// containing `failing-assets` produce a PASSED page whose HAR carries
    /// 4xx/5xx entries.
    struct ScriptedDriver;

    fn har_bytes(statuses: &[i64]) -> Vec<u8> {
        let entries = statuses
            .iter()
            .enumerate()
            .map(|(i, &status)| HarEntry {
                started_date_time: "2025-06-01T00:00:00.000Z".to_string(),
                time: 10.0,
                request: HarRequest {
                    method: "GET".to_string(),
                    url: format!("https://cdn.example/asset-{i}"),
                },
                response: HarResponse {
                    status,
                    status_text: String::new(),
                    content: HarContent {
                        size: 1000,
                        mime_type: "text/html".to_string(),
                    },
                },
            })
            .collect();
        serde_json::to_vec(&Har {
            log: HarLog {
                entries,
                ..HarLog::default()
            },
        })
        .unwrap()
    }

    #[async_trait]
    impl UrlDriver for ScriptedDriver {
        async fn measure(&self, job: &UrlJob) -> Result<TestMeasurement, PumpkinError> {
            std::fs::write(&job.dirs.screenshot_path, b"\x89PNG\r\n").unwrap();

            if job.url.contains("timeout") {
                // Partial recording: navigation started, nothing completed.
                std::fs::write(&job.dirs.har_path, har_bytes(&[-1])).unwrap();
                return Ok(TestMeasurement::synthetic(
                    &job.url,
                    "chromium",
                    &job.dirs,
                    Utc::now(),
                    TestStatus::Timeout,
                    Some("per-job deadline exceeded".to_string()),
                ));
            }

            let statuses: &[i64] = if job.url.contains("failing-assets") {
                &[200, 200, 404, 500, 500]
            } else {
                &[200, 200, 200, 200]
            };
            std::fs::write(&job.dirs.har_path, har_bytes(statuses)).unwrap();

            let mut by_type = BTreeMap::new();
            by_type.insert("script".to_string(), 3i64);
            by_type.insert("img".to_string(), 1i64);

            Ok(TestMeasurement {
                url: job.url.clone(),
                domain: crate::utils::extract_domain(&job.url),
                browser: "chromium".to_string(),
                user_agent: "HeadlessChrome/124.0".to_string(),
                page_title: Some("Example".to_string()),
                status: TestStatus::Passed,
                error_message: None,
                started_at: Utc::now(),
                test_duration_ms: 640,
                scroll_duration_ms: 130,
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
                    total_encoded_size: 13_000,
                    by_type,
                },
                http_response_codes: BTreeMap::new(),
                screenshot_path: job.dirs.screenshot_path.to_string_lossy().into_owned(),
                har_path: job.dirs.har_path.to_string_lossy().into_owned(),
            })
        }
    }

    struct Pipeline {
        scheduler: Scheduler,
        store: Store,
        queries: QueryLayer,
        artifact_root: TempDir,
        _db_tmp: TempDir,
    }

    async fn pipeline() -> Pipeline {
        let (store, db_tmp) = temp_store().await;
        let artifact_root = TempDir::new().unwrap();
        let scheduler = Scheduler::new(
            Arc::new(ScriptedDriver),
            ArtifactStore::new(artifact_root.path()),
            Ingestor::new(store.clone()),
            RunCoordinator::new(store.clone()),
            "chromium".to_string(),
        )
        .with_job_deadline(Duration::from_secs(5));

        Pipeline {
            scheduler,
            queries: QueryLayer::new(store.clone()),
            store,
            artifact_root,
            _db_tmp: db_tmp,
        }
    }

    fn no_shutdown() -> broadcast::Receiver<()> {
        broadcast::channel(1).1
    }

    #[tokio::test]
    async fn single_passed_url_lands_in_every_table() {
        let p = pipeline().await;
        let report = p
            .scheduler
            .run_batch(vec!["https://example.com".to_string()], 1, None, no_shutdown())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::AllPassed);
        assert_eq!(report.final_status, RunStatus::Completed);

        let run = p.store.get_run(report.run_id).await.unwrap().unwrap();
        assert_eq!(run.passed, 1);
        assert_eq!(run.failed, 0);
        assert_eq!(run.status, "COMPLETED");

        let tests = p.queries.list_url_tests_for_run(report.run_id).await.unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].status, "PASSED");
        assert_eq!(tests[0].total_page_load_ms, Some(640.5));

        let detail = p.queries.get_url_test(tests[0].id).await.unwrap();
        assert_eq!(detail.page_title.as_deref(), Some("Example"));
        assert_eq!(detail.time_to_first_byte_ms, Some(88.0));
        assert_eq!(detail.doc_transfer_size, Some(14_000));
        assert_eq!(detail.http_response_codes.get("200"), Some(&4));
        assert_eq!(detail.resources_by_type.get("script"), Some(&3));
        assert_eq!(detail.resources_by_type.get("img"), Some(&1));

        // Normalized satellites agree with the JSON maps.
        let histogram: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT status_code, response_count FROM status_histogram WHERE url_test_id = ?",
        )
        .bind(tests[0].id)
        .fetch_all(p.store.pool())
        .await
        .unwrap();
        assert_eq!(histogram, vec![(200, 4)]);

        let resources: Vec<(String, i64)> = sqlx::query_as(
            "SELECT resource_type, resource_count FROM resource_types
             WHERE url_test_id = ? ORDER BY resource_type",
        )
        .bind(tests[0].id)
        .fetch_all(p.store.pool())
        .await
        .unwrap();
        assert_eq!(resources, vec![("img".to_string(), 1), ("script".to_string(), 3)]);

        // The run row was touched by the counter trigger after the test row
        // was written.
        assert!(run.updated_at >= tests[0].test_timestamp);
    }

    #[tokio::test]
    async fn partial_run_keeps_both_artifact_dirs() {
        let p = pipeline().await;
        let report = p
            .scheduler
            .run_batch(
                vec![
                    "https://ok.example/".to_string(),
                    "https://timeout.example/".to_string(),
                ],
                2,
                None,
                no_shutdown(),
            )
            .await
            .unwrap();

        assert_eq!(report.final_status, RunStatus::Partial);
        assert_eq!(report.outcome, RunOutcome::SomePassed);

        let run = p.store.get_run(report.run_id).await.unwrap().unwrap();
        assert_eq!(run.passed, 1);
        assert_eq!(run.failed, 1);

        // Both directories exist and hold both files, including the TIMEOUT
        // one with its partial HAR.
        let paths: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT status, screenshot_path, har_path FROM url_tests WHERE test_run_id = ?",
        )
        .bind(report.run_id)
        .fetch_all(p.store.pool())
        .await
        .unwrap();
        assert_eq!(paths.len(), 2);
        for (_, screenshot, har) in &paths {
            assert!(std::path::Path::new(screenshot).exists(), "{screenshot}");
            assert!(std::path::Path::new(har).exists(), "{har}");
        }

        let timeout_row = paths.iter().find(|(s, _, _)| s == "TIMEOUT").unwrap();
        let har = std::fs::read(&timeout_row.2).unwrap();
        assert!(!har.is_empty());

        // TIMEOUT rows keep empty derived maps.
        let (codes,): (String,) = sqlx::query_as(
            "SELECT http_response_codes FROM url_tests WHERE test_run_id = ? AND status = 'TIMEOUT'",
        )
        .bind(report.run_id)
        .fetch_one(p.store.pool())
        .await
        .unwrap();
        assert_eq!(codes, "{}");
    }

    #[tokio::test]
    async fn failed_requests_extracted_in_code_order() {
        let p = pipeline().await;
        let report = p
            .scheduler
            .run_batch(
                vec!["https://failing-assets.example/".to_string()],
                1,
                None,
                no_shutdown(),
            )
            .await
            .unwrap();

        let tests = p.queries.list_url_tests_for_run(report.run_id).await.unwrap();
        let failed = p
            .queries
            .get_failed_requests_for_test(tests[0].id)
            .await
            .unwrap();

        assert_eq!(failed.len(), 3);
        assert_eq!(failed[0].status_code, 404);
        assert_eq!(failed[0].category.as_str(), "Client Error");
        assert_eq!(failed[1].status_code, 500);
        assert_eq!(failed[2].status_code, 500);
        assert_eq!(failed[1].category.as_str(), "Server Error");
        // Archive order preserved within equal codes.
        assert!(failed[1].request_url < failed[2].request_url);

        // The 4xx/5xx keys also make the test visible in the error view.
        let errors = p.queries.list_tests_with_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status, "PASSED");
    }

    #[tokio::test]
    async fn counters_match_row_counts_across_runs() {
        let p = pipeline().await;

        for batch in [
            vec!["https://a.example/".to_string(), "https://b.example/".to_string()],
            vec!["https://timeout.example/".to_string()],
            vec![],
        ] {
            let report = p
                .scheduler
                .run_batch(batch, 2, None, no_shutdown())
                .await
                .unwrap();
            let run = p.store.get_run(report.run_id).await.unwrap().unwrap();
            let rows = p.store.count_url_tests(report.run_id).await.unwrap();
            assert_eq!(run.passed + run.failed, rows);
            assert!(rows <= run.total_urls);
        }
    }

    #[tokio::test]
    async fn finalized_run_rejects_late_measurements() {
        let p = pipeline().await;
        let report = p
            .scheduler
            .run_batch(vec!["https://a.example/".to_string()], 1, None, no_shutdown())
            .await
            .unwrap();

        let ingestor = Ingestor::new(p.store.clone());
        let late = TestMeasurement::synthetic(
            "https://late.example/",
            "chromium",
            &ArtifactStore::new(p.artifact_root.path())
                .allocate_test_dir("https://late.example/", Utc::now())
                .unwrap(),
            Utc::now(),
            TestStatus::Passed,
            None,
        );
        let err = ingestor.insert_url_test(report.run_id, &late).await.unwrap_err();
        assert!(matches!(err, PumpkinError::IngestPersistent(_)));

        let run = p.store.get_run(report.run_id).await.unwrap().unwrap();
        assert_eq!(run.passed + run.failed, 1);
    }

    #[tokio::test]
    async fn api_serves_batch_results() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let p = pipeline().await;
        let report = p
            .scheduler
            .run_batch(
                vec!["https://a.example/".to_string(), "https://timeout.example/".to_string()],
                2,
                Some("api scenario"),
                no_shutdown(),
            )
            .await
            .unwrap();

        let state = crate::api::AppState {
            queries: p.queries.clone(),
            store: p.store.clone(),
        };
        let config = crate::config::Config {
            database_url: "unused".to_string(),
            artifact_root: p.artifact_root.path().to_path_buf(),
            ..crate::config::Config::default()
        };
        let app = crate::api::router(state, &config);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/runs/latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["id"].as_i64(), Some(report.run_id));
        assert_eq!(body["data"]["status"], "PARTIAL");
        assert_eq!(body["data"]["passed"].as_i64(), Some(1));
        assert_eq!(body["data"]["failed"].as_i64(), Some(1));
        assert_eq!(body["data"]["notes"], "api scenario");
    }
}
