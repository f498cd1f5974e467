//! Run lifecycle: creation, finalization, abort.
//!
//! A run is born `RUNNING` and transitions exactly once, to `COMPLETED`
//! (no failures, per the trigger-maintained counters), `PARTIAL` (at least
//! one failed test) or `FAILED` (the run itself was aborted). The update is
//! guarded on the current status, so a second transition attempt is rejected
//! rather than silently applied.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::PumpkinError;
use crate::store::{RunStatus, Store};
use crate::utils::db_timestamp;

/// Identity of a freshly created run.
#[derive(Debug, Clone)]
pub struct CreatedRun {
    pub id: i64,
    pub uuid: String,
}

#[derive(Clone)]
pub struct RunCoordinator {
    store: Store,
}

impl RunCoordinator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Inserts a new run in `RUNNING` state.
    pub async fn create_run(
        &self,
        total_urls: usize,
        workers: usize,
        notes: Option<&str>,
    ) -> Result<CreatedRun, PumpkinError> {
        let uuid = Uuid::new_v4().to_string();
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO runs (uuid, run_timestamp, total_urls, parallel_workers, notes)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&uuid)
        .bind(db_timestamp(Utc::now()))
        .bind(total_urls as i64)
        .bind(workers as i64)
        .bind(notes)
        .fetch_one(self.store.pool())
        .await?;

        info!(run_id = id, total_urls, workers, "run created");
        Ok(CreatedRun { id, uuid })
    }

    /// Finalizes a run after all ingestion has settled. The terminal status
    /// is decided by the trigger-maintained `failed` counter: zero failures
    /// is `COMPLETED`, anything else `PARTIAL`.
    pub async fn finalize_run(
        &self,
        run_id: i64,
        duration_ms: i64,
    ) -> Result<RunStatus, PumpkinError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(PumpkinError::RunMissing(run_id))?;

        let target = if run.failed == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };

        self.transition(run_id, target, duration_ms).await?;
        info!(
            run_id,
            status = target.as_str(),
            passed = run.passed,
            failed = run.failed,
            duration_ms,
            "run finalized"
        );
        Ok(target)
    }

    /// Marks an aborted run `FAILED`. Reserved for scheduler-level failure
    /// and cancellation; ordinary test failures finalize as `PARTIAL`.
    pub async fn abort_run(&self, run_id: i64, duration_ms: i64) -> Result<(), PumpkinError> {
        self.transition(run_id, RunStatus::Failed, duration_ms)
            .await?;
        info!(run_id, duration_ms, "run aborted");
        Ok(())
    }

    /// Resolves the run a single-test invocation should attribute its
    /// measurement to: an explicitly injected id, then `TEST_RUN_ID` from
    /// the environment-derived config, then a fresh single-job run.
    pub async fn ensure_run_context(
        &self,
        explicit: Option<i64>,
        config: &Config,
    ) -> Result<i64, PumpkinError> {
        if let Some(id) = explicit.or(config.test_run_id) {
            match self.store.get_run(id).await? {
                Some(_) => return Ok(id),
                None => return Err(PumpkinError::RunMissing(id)),
            }
        }
        let created = self.create_run(1, 1, Some("single-url run")).await?;
        Ok(created.id)
    }

    async fn transition(
        &self,
        run_id: i64,
        to: RunStatus,
        duration_ms: i64,
    ) -> Result<(), PumpkinError> {
        let result = sqlx::query(
            "UPDATE runs SET status = ?, total_duration_ms = ?
             WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(to.as_str())
        .bind(duration_ms)
        .bind(run_id)
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            let run = self
                .store
                .get_run(run_id)
                .await?
                .ok_or(PumpkinError::RunMissing(run_id))?;
            return Err(PumpkinError::InvalidTransition {
                from: RunStatus::parse(&run.status)
                    .map(|s| s.as_str())
                    .unwrap_or("UNKNOWN"),
                to: to.as_str(),
            });
        }
        Ok(())
    }
}
