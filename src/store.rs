//! Relational persistence on SQLite via sqlx.
//!
//! The database is the single consistency authority: the pass/fail counters
//! on `runs` are maintained exclusively by an insert trigger on `url_tests`,
//! and `updated_at` is refreshed by an update trigger. Application code never
//! computes either.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::{info, warn};

use crate::error::PumpkinError;

/// Tables, indices, triggers and views. Idempotent; applied on startup and by
/// the `init-db` subcommand.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    run_timestamp TEXT NOT NULL,
    total_urls INTEGER NOT NULL,
    parallel_workers INTEGER NOT NULL,
    total_duration_ms INTEGER,
    passed INTEGER NOT NULL DEFAULT 0 CHECK (passed >= 0),
    failed INTEGER NOT NULL DEFAULT 0 CHECK (failed >= 0),
    status TEXT NOT NULL DEFAULT 'RUNNING'
        CHECK (status IN ('RUNNING','COMPLETED','PARTIAL','FAILED')),
    notes TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);

CREATE INDEX IF NOT EXISTS idx_runs_timestamp ON runs(run_timestamp DESC);

CREATE TABLE IF NOT EXISTS url_tests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    test_run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    test_timestamp TEXT NOT NULL,
    url TEXT NOT NULL CHECK (length(url) <= 2048),
    domain TEXT NOT NULL CHECK (length(domain) <= 512),
    browser TEXT NOT NULL,
    user_agent TEXT NOT NULL,
    page_title TEXT,
    status TEXT NOT NULL CHECK (status IN ('PASSED','FAILED','TIMEOUT','ERROR')),
    error_message TEXT,
    test_duration_ms INTEGER NOT NULL,
    scroll_duration_ms INTEGER NOT NULL,
    dns_lookup_ms REAL,
    tcp_connection_ms REAL,
    tls_negotiation_ms REAL,
    time_to_first_byte_ms REAL,
    response_time_ms REAL,
    dom_content_loaded_ms REAL,
    dom_interactive_ms REAL,
    total_page_load_ms REAL,
    doc_transfer_size INTEGER,
    doc_encoded_size INTEGER,
    doc_decoded_size INTEGER,
    total_resources INTEGER NOT NULL DEFAULT 0,
    total_transfer_size INTEGER NOT NULL DEFAULT 0,
    total_encoded_size INTEGER NOT NULL DEFAULT 0,
    resources_by_type TEXT NOT NULL DEFAULT '{}',
    http_response_codes TEXT NOT NULL DEFAULT '{}',
    screenshot_path TEXT NOT NULL,
    har_path TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);

CREATE INDEX IF NOT EXISTS idx_url_tests_run ON url_tests(test_run_id);
CREATE INDEX IF NOT EXISTS idx_url_tests_timestamp ON url_tests(test_timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_url_tests_domain ON url_tests(domain);
CREATE INDEX IF NOT EXISTS idx_url_tests_status ON url_tests(status);
CREATE INDEX IF NOT EXISTS idx_url_tests_page_load ON url_tests(total_page_load_ms);
CREATE INDEX IF NOT EXISTS idx_url_tests_ttfb ON url_tests(time_to_first_byte_ms);

CREATE TABLE IF NOT EXISTS status_histogram (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url_test_id INTEGER NOT NULL REFERENCES url_tests(id) ON DELETE CASCADE,
    status_code INTEGER NOT NULL,
    response_count INTEGER NOT NULL CHECK (response_count >= 0),
    UNIQUE (url_test_id, status_code)
);

CREATE INDEX IF NOT EXISTS idx_status_histogram_test ON status_histogram(url_test_id);
CREATE INDEX IF NOT EXISTS idx_status_histogram_code ON status_histogram(status_code);

CREATE TABLE IF NOT EXISTS resource_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url_test_id INTEGER NOT NULL REFERENCES url_tests(id) ON DELETE CASCADE,
    resource_type TEXT NOT NULL,
    resource_count INTEGER NOT NULL CHECK (resource_count >= 0),
    UNIQUE (url_test_id, resource_type)
);

CREATE INDEX IF NOT EXISTS idx_resource_types_test ON resource_types(url_test_id);

-- Single source of truth for the run counters. Application code must not
-- compute passed/failed.
CREATE TRIGGER IF NOT EXISTS trg_url_tests_counters
AFTER INSERT ON url_tests
BEGIN
    UPDATE runs SET
        passed = passed + (NEW.status = 'PASSED'),
        failed = failed + (NEW.status <> 'PASSED')
    WHERE id = NEW.test_run_id;
END;

-- Every mutation of a run row advances updated_at.
CREATE TRIGGER IF NOT EXISTS trg_runs_touch
AFTER UPDATE ON runs
FOR EACH ROW
WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE runs SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
    WHERE id = NEW.id;
END;

CREATE VIEW IF NOT EXISTS v_latest_test_run AS
SELECT r.*,
       (SELECT COUNT(*) FROM url_tests t WHERE t.test_run_id = r.id) AS tests_completed,
       (SELECT AVG(t.total_page_load_ms) FROM url_tests t
         WHERE t.test_run_id = r.id AND t.total_page_load_ms IS NOT NULL) AS avg_page_load_ms,
       (SELECT AVG(t.time_to_first_byte_ms) FROM url_tests t
         WHERE t.test_run_id = r.id AND t.time_to_first_byte_ms IS NOT NULL) AS avg_ttfb_ms
FROM runs r
ORDER BY r.run_timestamp DESC
LIMIT 1;

CREATE VIEW IF NOT EXISTS v_performance_trends AS
SELECT t.id, t.uuid, t.test_run_id, r.run_timestamp, t.test_timestamp, t.url,
       t.domain, t.page_title, t.status, t.error_message, t.test_duration_ms,
       t.total_page_load_ms, t.time_to_first_byte_ms, t.dom_content_loaded_ms,
       t.total_resources, t.total_transfer_size
FROM url_tests t
JOIN runs r ON r.id = t.test_run_id;

CREATE VIEW IF NOT EXISTS v_tests_with_errors AS
SELECT t.*
FROM url_tests t
WHERE t.status <> 'PASSED'
   OR EXISTS (
        SELECT 1 FROM status_histogram h
        WHERE h.url_test_id = t.id AND h.status_code >= 400
   );
"#;

/// Lifecycle of a batch run. Born `Running`, transitions exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(RunStatus::Running),
            "COMPLETED" => Some(RunStatus::Completed),
            "PARTIAL" => Some(RunStatus::Partial),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// One row of `runs`.
#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
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
    pub created_at: String,
    pub updated_at: String,
}

/// One row of `url_tests`, fully hydrated.
#[derive(Debug, Clone, FromRow)]
pub struct UrlTestRow {
    pub id: i64,
    pub uuid: String,
    pub test_run_id: i64,
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
    pub created_at: String,
}

/// Handle on the database: a bounded connection pool plus schema management.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connects with a small retry budget, applies the schema, and returns
    /// the store. Exhausting the budget is `DatabaseUnavailable`.
    pub async fn connect(database_url: &str) -> Result<Self, PumpkinError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| PumpkinError::DatabaseUnavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let mut last_err = None;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }
            match SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options.clone())
                .await
            {
                Ok(pool) => {
                    let store = Self { pool };
                    store.apply_schema().await?;
                    info!("database connected: {database_url}");
                    return Ok(store);
                }
                Err(e) => {
                    warn!("database connect attempt {} failed: {e}", attempt + 1);
                    last_err = Some(e);
                }
            }
        }

        Err(PumpkinError::DatabaseUnavailable(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        ))
    }

    pub async fn apply_schema(&self) -> Result<(), PumpkinError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Liveness probe for `/health`.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<RunRow>, PumpkinError> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Count of url_tests attached to a run, straight from the table. Used to
    /// cross-check the trigger-maintained counters.
    pub async fn count_url_tests(&self, run_id: i64) -> Result<i64, PumpkinError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM url_tests WHERE test_run_id = ?")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// All screenshot paths currently referenced by url_tests rows.
    pub async fn referenced_screenshot_paths(&self) -> Result<Vec<String>, PumpkinError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT screenshot_path FROM url_tests")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
