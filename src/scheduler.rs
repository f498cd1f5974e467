//! Bounded worker pool fanning URL jobs out to browser drivers.
//!
//! Jobs flow through a channel consumed by `W` workers; measurements flow
//! back through a result channel into a single ingester loop, so database
//! writes are serialized without any application-level locking. Per-job
//! failures never escape: a crash or timeout becomes a synthetic measurement
//! and the batch continues.

use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::artifacts::{dir_name, ArtifactStore, TestDirs, HAR_FILE, SCREENSHOT_FILE};
use crate::config::{JOB_DEADLINE, SHUTDOWN_GRACE};
use crate::coordinator::RunCoordinator;
use crate::driver::{UrlDriver, UrlJob};
use crate::error::PumpkinError;
use crate::har;
use crate::ingest::Ingestor;
use crate::measurement::{TestMeasurement, TestStatus};
use crate::metrics::Metrics;
use crate::store::RunStatus;

/// Shell-facing outcome of a batch: drives the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    AllPassed,
    SomePassed,
    NoneCompleted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::AllPassed => 0,
            _ => 1,
        }
    }
}

/// Final accounting for one batch run.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub run_id: i64,
    pub run_uuid: String,
    pub duration_ms: i64,
    pub outcome: RunOutcome,
    pub final_status: RunStatus,
    pub passed: usize,
    pub failed: usize,
}

/// Per-worker accounting, exposed for progress logging.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicUsize,
    pub errors: AtomicUsize,
}

pub struct Scheduler {
    driver: Arc<dyn UrlDriver>,
    artifacts: ArtifactStore,
    ingestor: Ingestor,
    coordinator: RunCoordinator,
    metrics: Arc<Metrics>,
    browser_name: String,
    /// Backstop deadline applied around every driver call. The driver also
    /// enforces its own protocol deadline; this one catches a driver that
    /// stops responding entirely.
    job_deadline: Duration,
}

impl Scheduler {
    pub fn new(
        driver: Arc<dyn UrlDriver>,
        artifacts: ArtifactStore,
        ingestor: Ingestor,
        coordinator: RunCoordinator,
        browser_name: String,
    ) -> Self {
        Self {
            driver,
            artifacts,
            ingestor,
            coordinator,
            metrics: Arc::new(Metrics::new()),
            browser_name,
            job_deadline: JOB_DEADLINE,
        }
    }

    /// Overrides the backstop deadline; used by tests with stub drivers.
    pub fn with_job_deadline(mut self, deadline: Duration) -> Self {
        self.job_deadline = deadline;
        self
    }

    /// Runs one batch to completion.
    ///
    /// Every URL is accounted for: a measurement is ingested, or a synthetic
    /// error row stands in for it. `shutdown` cancels the run; in-flight jobs
    /// get a grace period, then the run transitions to FAILED.
    pub async fn run_batch(
        &self,
        urls: Vec<String>,
        workers: usize,
        notes: Option<&str>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<BatchReport, PumpkinError> {
        if workers == 0 {
            return Err(PumpkinError::BadRequest(
                "worker count must be at least 1".to_string(),
            ));
        }

        let total = urls.len();
        let created = self.coordinator.create_run(total, workers, notes).await?;
        self.metrics.runs_started.increment(1);
        let start = Instant::now();

        if total == 0 {
            let status = self.coordinator.finalize_run(created.id, 0).await?;
            return Ok(BatchReport {
                run_id: created.id,
                run_uuid: created.uuid,
                duration_ms: 0,
                outcome: RunOutcome::AllPassed,
                final_status: status,
                passed: 0,
                failed: 0,
            });
        }

        let (job_tx, job_rx) = mpsc::channel::<String>(total);
        let (result_tx, mut result_rx) = mpsc::channel::<TestMeasurement>(workers.max(1));
        let shared_jobs = Arc::new(Mutex::new(job_rx));
        let cancelled = Arc::new(AtomicBool::new(false));

        for url in urls {
            // Capacity equals the job count, so this never blocks.
            let _ = job_tx.send(url).await;
        }
        drop(job_tx);

        let mut worker_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let driver = self.driver.clone();
            let artifacts = self.artifacts.clone();
            let jobs = shared_jobs.clone();
            let results = result_tx.clone();
            let cancelled = cancelled.clone();
            let browser_name = self.browser_name.clone();
            let deadline = self.job_deadline;
            let metrics = self.metrics.clone();

            worker_handles.push(tokio::spawn(async move {
                let stats = WorkerStats::default();
                loop {
                    let url = { jobs.lock().await.recv().await };
                    let Some(url) = url else { break };
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }

                    metrics.active_jobs.increment(1.0);
                    let measurement =
                        run_one(driver.clone(), &artifacts, &browser_name, &url, deadline).await;
                    metrics.active_jobs.decrement(1.0);

                    stats.processed.fetch_add(1, Ordering::Relaxed);
                    if measurement.status != TestStatus::Passed {
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                    }

                    if results.send(measurement).await.is_err() {
                        break;
                    }
                }
                info!(
                    worker_id,
                    processed = stats.processed.load(Ordering::Relaxed),
                    errors = stats.errors.load(Ordering::Relaxed),
                    "worker finished"
                );
            }));
        }
        drop(result_tx);

        // Single ingester loop: measurements are enriched from their HAR and
        // written one at a time.
        let mut passed = 0usize;
        let mut failed = 0usize;
        let mut was_cancelled = false;
        let mut grace_deadline = tokio::time::Instant::now() + Duration::from_secs(86_400);

        loop {
            tokio::select! {
                maybe = result_rx.recv() => {
                    match maybe {
                        Some(measurement) => {
                            let ok = self.ingest_one(created.id, measurement).await;
                            if ok { passed += 1 } else { failed += 1 }
                        }
                        None => break,
                    }
                }
                _ = shutdown.recv(), if !was_cancelled => {
                    warn!(run_id = created.id, "cancellation requested, draining in-flight jobs");
                    was_cancelled = true;
                    cancelled.store(true, Ordering::SeqCst);
                    grace_deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
                }
                _ = tokio::time::sleep_until(grace_deadline), if was_cancelled => {
                    warn!(run_id = created.id, "grace period elapsed, abandoning remaining jobs");
                    break;
                }
            }
        }

        for handle in worker_handles {
            handle.abort();
        }

        let duration_ms = start.elapsed().as_millis() as i64;
        let (final_status, outcome) = if was_cancelled {
            self.coordinator.abort_run(created.id, duration_ms).await?;
            self.metrics.runs_aborted.increment(1);
            // An aborted run never counts as clean, even with zero failures:
            // queued jobs were abandoned.
            let outcome = if passed > 0 {
                RunOutcome::SomePassed
            } else {
                RunOutcome::NoneCompleted
            };
            (RunStatus::Failed, outcome)
        } else {
            let status = self.coordinator.finalize_run(created.id, duration_ms).await?;
            self.metrics.runs_finalized.increment(1);
            (status, outcome_tag(passed, failed))
        };

        info!(
            run_id = created.id,
            passed, failed, duration_ms, "batch run finished"
        );

        Ok(BatchReport {
            run_id: created.id,
            run_uuid: created.uuid,
            duration_ms,
            outcome,
            final_status,
            passed,
            failed,
        })
    }

    /// Enriches one measurement from its HAR recording and persists it.
    /// Returns whether the test counts as passed.
    async fn ingest_one(&self, run_id: i64, mut measurement: TestMeasurement) -> bool {
        // Timeout and error measurements keep empty derived maps; only a
        // completed capture is worth summarizing.
        if measurement.status == TestStatus::Passed {
            let summary = har::analyze_file(Path::new(&measurement.har_path));
            measurement.http_response_codes = summary.status_counts;
        }

        let duration = Duration::from_millis(measurement.test_duration_ms.max(0) as u64);
        match measurement.status {
            TestStatus::Timeout => self.metrics.record_timeout(),
            status => self
                .metrics
                .record_test(duration, status == TestStatus::Passed),
        }
        self.metrics
            .scroll_duration
            .record(measurement.scroll_duration_ms.max(0) as f64 / 1000.0);

        match self.ingestor.insert_url_test(run_id, &measurement).await {
            Ok(_) => measurement.status == TestStatus::Passed,
            Err(PumpkinError::DatabaseUnavailable(e)) => {
                // Filesystem artifacts survive; the row does not.
                self.metrics.record_ingest_failure();
                error!("database unavailable, measurement not persisted for {}: {e}", measurement.url);
                false
            }
            Err(e) => {
                self.metrics.record_ingest_failure();
                error!("ingest failed for {}: {e}", measurement.url);
                if let Err(fallback) = self
                    .ingestor
                    .insert_as_failed(run_id, &measurement, &e.to_string())
                    .await
                {
                    error!("dropping measurement for {}: {fallback}", measurement.url);
                }
                false
            }
        }
    }
}

fn outcome_tag(passed: usize, failed: usize) -> RunOutcome {
    if failed == 0 {
        RunOutcome::AllPassed
    } else if passed > 0 {
        RunOutcome::SomePassed
    } else {
        RunOutcome::NoneCompleted
    }
}

/// Runs one URL end to end, converting every failure into a measurement.
async fn run_one(
    driver: Arc<dyn UrlDriver>,
    artifacts: &ArtifactStore,
    browser_name: &str,
    url: &str,
    deadline: Duration,
) -> TestMeasurement {
    let started_at = Utc::now();

    let dirs = match artifacts.allocate_test_dir(url, started_at) {
        Ok(dirs) => dirs,
        Err(e) => {
            // Record the paths the test would have used; the row keeps its
            // reference even though the capture never started.
            warn!("artifact allocation failed for {url}: {e}");
            let dir = artifacts.root().join(dir_name(url, started_at));
            let dirs = TestDirs {
                screenshot_path: dir.join(SCREENSHOT_FILE),
                har_path: dir.join(HAR_FILE),
                dir,
            };
            return TestMeasurement::synthetic(
                url,
                browser_name,
                &dirs,
                started_at,
                TestStatus::Error,
                Some(e.to_string()),
            );
        }
    };

    let job = UrlJob {
        url: url.to_string(),
        dirs: dirs.clone(),
    };

    let mut handle = {
        let driver_job = job.clone();
        tokio::spawn(async move { driver.measure(&driver_job).await })
    };

    let measurement = match timeout(deadline, &mut handle).await {
        Err(_) => {
            handle.abort();
            warn!("backstop deadline hit for {url}");
            TestMeasurement::synthetic(
                url,
                browser_name,
                &dirs,
                started_at,
                TestStatus::Timeout,
                Some("per-job deadline exceeded".to_string()),
            )
        }
        Ok(Err(join_err)) => {
            error!("worker crashed on {url}: {join_err}");
            TestMeasurement::synthetic(
                url,
                browser_name,
                &dirs,
                started_at,
                TestStatus::Error,
                Some(format!("worker crashed: {join_err}")),
            )
        }
        Ok(Ok(Ok(measurement))) => measurement,
        Ok(Ok(Err(e))) => {
            error!("driver failed on {url}: {e}");
            TestMeasurement::synthetic(
                url,
                browser_name,
                &dirs,
                started_at,
                TestStatus::Error,
                Some(e.to_string()),
            )
        }
    };

    if measurement.status != TestStatus::Passed {
        ArtifactStore::ensure_placeholders(&dirs);
    }
    measurement
}
