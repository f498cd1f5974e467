//! # Pumpkin
//!
//! Batch web-performance measurement platform. A run visits a configured
//! list of URLs with a pool of headless browsers, captures per-page
//! navigation timings, a full-page screenshot and a HAR network recording,
//! and persists everything to a relational store alongside the on-disk
//! artifacts. A read-only JSON API serves the results to a dashboard.
//!
//! ## Pipeline
//!
//! ```text
//! URL list ──> Scheduler ──> worker pool ──> ChromiumDriver ──> TestMeasurement
//!                  │                                                  │
//!                  │            HAR analyzer <── network.har <────────┤
//!                  │                  │                               │
//!                  └──> RunCoordinator└──> Ingestor ──> SQLite (runs, url_tests,
//!                        (lifecycle)        (one tx)     status_histogram, resource_types)
//! ```
//!
//! The run counters (`passed`/`failed`) are maintained by a database trigger,
//! never by application code; per-job failures are converted into TIMEOUT or
//! ERROR measurements so a batch always accounts for every URL.
//!
//! ## CLI
//!
//! ```bash
//! # Batch run over a URL list with 8 workers
//! pumpkin run --input urls.txt --concurrency 8
//!
//! # One-off measurement
//! pumpkin single https://example.com
//!
//! # Read-only API + dashboard
//! pumpkin serve --port 3000
//!
//! # Remove artifact directories nothing references
//! pumpkin clean --dry-run
//! ```
//!
//! `DATABASE_URL` is required; `PORT`, `TEST_URL` and `TEST_RUN_ID` are
//! optional (see [`Config`]).

/// Read-only HTTP API over the query layer
pub mod api;

/// Per-test artifact directories (screenshot + HAR)
pub mod artifacts;

/// Pool of headless Chrome instances
pub mod browser_pool;

/// Command-line interface implementation
pub mod cli;

/// Configuration and environment handling
pub mod config;

/// Run lifecycle management
pub mod coordinator;

/// Per-URL browser measurement protocol
pub mod driver;

/// Error types
pub mod error;

/// HAR model and post-processing
pub mod har;

/// Transactional measurement ingestion
pub mod ingest;

/// Measurement records
pub mod measurement;

/// Pipeline counters and histograms
pub mod metrics;

/// Read-side query projections
pub mod queries;

/// Orphan artifact reconciliation
pub mod reconciler;

/// Bounded worker pool for batch runs
pub mod scheduler;

/// Relational persistence (sqlx/SQLite)
pub mod store;

/// Small shared helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use api::AppState;
pub use artifacts::{ArtifactStore, TestDirs};
pub use browser_pool::{BrowserPool, BrowserPoolStats};
pub use cli::{read_urls_from_file, setup_logging, Cli, CliRunner, Commands};
pub use config::{Config, Viewport};
pub use coordinator::{CreatedRun, RunCoordinator};
pub use driver::{ChromiumDriver, UrlDriver, UrlJob};
pub use error::PumpkinError;
pub use har::{FailedRequest, FailureCategory, Har, HarSummary};
pub use ingest::{InsertedTest, Ingestor};
pub use measurement::{NavigationTiming, ResourceStats, TestMeasurement, TestStatus};
pub use metrics::Metrics;
pub use queries::{DailyAverage, QueryLayer, RunSummary, UrlTestDetail, UrlTestSummary};
pub use reconciler::{CleanReport, Reconciler};
pub use scheduler::{BatchReport, RunOutcome, Scheduler};
pub use store::{RunStatus, Store};
