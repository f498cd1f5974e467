//! Command-line interface: batch runs, single-URL measurement, the API
//! server, artifact reconciliation and schema provisioning.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::artifacts::ArtifactStore;
use crate::browser_pool::BrowserPool;
use crate::config::Config;
use crate::coordinator::RunCoordinator;
use crate::driver::{ChromiumDriver, UrlDriver, UrlJob};
use crate::error::PumpkinError;
use crate::har;
use crate::ingest::Ingestor;
use crate::measurement::TestStatus;
use crate::queries::QueryLayer;
use crate::reconciler::Reconciler;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::utils::{format_bytes, format_duration, validate_url};

#[derive(Parser)]
#[command(name = "pumpkin")]
#[command(about = "Batch web-performance measurement platform")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Artifact root directory (test-history)")]
    pub artifact_root: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a batch over a URL list file
    Run {
        #[arg(short, long, help = "Input file containing URLs (one per line)")]
        input: PathBuf,

        #[arg(short, long, help = "Number of parallel browser workers")]
        concurrency: Option<usize>,

        #[arg(long, help = "Free-form notes stored with the run")]
        notes: Option<String>,
    },

    /// Measure a single URL
    Single {
        #[arg(help = "URL to measure (default: TEST_URL)")]
        url: Option<String>,

        #[arg(long, help = "Attach the measurement to an existing run id")]
        run_id: Option<i64>,
    },

    /// Serve the read-only JSON API and the dashboard
    Serve {
        #[arg(short, long, help = "Listen port (default: PORT or 3000)")]
        port: Option<u16>,

        #[arg(long, help = "Static dashboard directory served at /")]
        dashboard: Option<PathBuf>,
    },

    /// Remove artifact directories no database row references
    Clean {
        #[arg(long, help = "Report orphans without deleting")]
        dry_run: bool,
    },

    /// Apply the database schema
    InitDb,
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(mut config: Config, args: &Cli) -> Self {
        if let Some(chrome_path) = &args.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
        if let Some(artifact_root) = &args.artifact_root {
            config.artifact_root = artifact_root.clone();
        }
        Self { config }
    }

    /// Dispatches one subcommand and returns the process exit code.
    pub async fn run(
        &self,
        command: Commands,
        shutdown: broadcast::Sender<()>,
    ) -> Result<i32, PumpkinError> {
        match command {
            Commands::Run {
                input,
                concurrency,
                notes,
            } => {
                self.run_batch(&input, concurrency, notes.as_deref(), shutdown)
                    .await
            }
            Commands::Single { url, run_id } => self.run_single(url, run_id).await,
            Commands::Serve { port, dashboard } => self.run_serve(port, dashboard).await,
            Commands::Clean { dry_run } => self.run_clean(dry_run).await,
            Commands::InitDb => self.run_init_db().await,
        }
    }

    async fn run_batch(
        &self,
        input: &Path,
        concurrency: Option<usize>,
        notes: Option<&str>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<i32, PumpkinError> {
        let urls = read_urls_from_file(input).await?;
        let workers = concurrency.unwrap_or(self.config.workers).max(1);
        info!("loaded {} URLs from {}", urls.len(), input.display());

        let store = Store::connect(&self.config.database_url).await?;
        let pool = Arc::new(BrowserPool::new(self.config.clone(), workers).await?);
        let driver: Arc<dyn UrlDriver> =
            Arc::new(ChromiumDriver::new(pool.clone(), self.config.clone()));

        let scheduler = Scheduler::new(
            driver,
            ArtifactStore::new(&self.config.artifact_root),
            Ingestor::new(store.clone()),
            RunCoordinator::new(store.clone()),
            self.config.browser_name.clone(),
        );

        let report = scheduler
            .run_batch(urls, workers, notes, shutdown.subscribe())
            .await?;

        let stats = pool.stats().await;
        info!(
            pages = stats.total_pages,
            alive = stats.alive_instances,
            "browser pool served the batch"
        );
        pool.shutdown().await;
        store.close().await;

        println!(
            "run {} finished: {} passed, {} failed, {} ({:?})",
            report.run_id,
            report.passed,
            report.failed,
            format_duration(std::time::Duration::from_millis(
                report.duration_ms.max(0) as u64
            )),
            report.final_status,
        );
        Ok(report.outcome.exit_code())
    }

    async fn run_single(
        &self,
        url: Option<String>,
        run_id: Option<i64>,
    ) -> Result<i32, PumpkinError> {
        let url = url
            .or_else(|| self.config.test_url.clone())
            .ok_or_else(|| {
                PumpkinError::BadRequest(
                    "no URL given and TEST_URL is not set".to_string(),
                )
            })?;
        validate_url(&url)
            .map_err(|_| PumpkinError::BadRequest(format!("not an http(s) URL: {url}")))?;

        let store = Store::connect(&self.config.database_url).await?;
        let coordinator = RunCoordinator::new(store.clone());
        let ingestor = Ingestor::new(store.clone());
        let artifacts = ArtifactStore::new(&self.config.artifact_root);

        // Attach to the injected run when one exists, otherwise own a fresh
        // single-job run (and finalize it below).
        let attached = run_id.or(self.config.test_run_id).is_some();
        let run_id = coordinator.ensure_run_context(run_id, &self.config).await?;

        let pool = Arc::new(BrowserPool::new(self.config.clone(), 1).await?);
        let driver = ChromiumDriver::new(pool.clone(), self.config.clone());

        let started = std::time::Instant::now();
        let dirs = artifacts.allocate_test_dir(&url, chrono::Utc::now())?;
        let job = UrlJob {
            url: url.clone(),
            dirs,
        };
        let mut measurement = driver.measure(&job).await?;
        if measurement.status == TestStatus::Passed {
            let summary = har::analyze_file(Path::new(&measurement.har_path));
            measurement.http_response_codes = summary.status_counts;
        }
        let inserted = ingestor.insert_url_test(run_id, &measurement).await?;

        if !attached {
            coordinator
                .finalize_run(run_id, started.elapsed().as_millis() as i64)
                .await?;
        }

        pool.shutdown().await;
        store.close().await;

        println!(
            "{} -> {} (test {} in run {})",
            url,
            measurement.status.as_str(),
            inserted.id,
            run_id,
        );
        if let Some(load) = measurement.timing.total_page_load_ms {
            println!("  page load: {load:.1} ms");
        }
        if let Some(size) = measurement.timing.doc_transfer_size {
            println!("  document: {}", format_bytes(size.max(0) as u64));
        }
        Ok(if measurement.status == TestStatus::Passed {
            0
        } else {
            1
        })
    }

    async fn run_serve(
        &self,
        port: Option<u16>,
        dashboard: Option<PathBuf>,
    ) -> Result<i32, PumpkinError> {
        let mut config = self.config.clone();
        if let Some(port) = port {
            config.port = port;
        }
        if dashboard.is_some() {
            config.dashboard_dir = dashboard;
        }

        let store = Store::connect(&config.database_url).await?;
        let state = AppState {
            queries: QueryLayer::new(store.clone()),
            store,
        };
        api::serve(state, &config).await?;
        Ok(0)
    }

    async fn run_clean(&self, dry_run: bool) -> Result<i32, PumpkinError> {
        let store = Store::connect(&self.config.database_url).await?;
        let reconciler = Reconciler::new(store, ArtifactStore::new(&self.config.artifact_root));
        let report = reconciler.clean(dry_run).await?;

        println!(
            "{} kept, {} orphan(s){}",
            report.kept,
            report.orphans.len(),
            if dry_run { " (dry run)" } else { "" },
        );
        for name in &report.orphans {
            println!("  orphan: {name}");
        }
        if !dry_run {
            println!("deleted {} director(ies)", report.deleted.len());
        }
        Ok(0)
    }

    async fn run_init_db(&self) -> Result<i32, PumpkinError> {
        let store = Store::connect(&self.config.database_url).await?;
        store.apply_schema().await?;
        store.close().await;
        println!("database schema applied");
        Ok(0)
    }
}

/// Loads the URL list: one URL per line, trimmed; empty lines and `#`
/// comments skipped. Every URL must be http(s); a bad line aborts before any
/// run is created.
pub async fn read_urls_from_file(path: &Path) -> Result<Vec<String>, PumpkinError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        PumpkinError::RunAborted(format!("cannot read URL file {}: {e}", path.display()))
    })?;

    let mut urls = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if validate_url(line).is_err() {
            return Err(PumpkinError::RunAborted(format!(
                "invalid URL in list: {line}"
            )));
        }
        urls.push(line.to_string());
    }

    if urls.is_empty() {
        warn!("URL list {} is empty", path.display());
    }
    Ok(urls)
}

pub fn setup_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn url_file_parsing_skips_blanks_and_comments() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("urls.txt");
        tokio::fs::write(
            &path,
            "https://a.example/\n\n# comment\n  https://b.example/page  \n",
        )
        .await
        .unwrap();

        let urls = read_urls_from_file(&path).await.unwrap();
        assert_eq!(urls, vec!["https://a.example/", "https://b.example/page"]);
    }

    #[tokio::test]
    async fn url_file_rejects_non_http_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("urls.txt");
        tokio::fs::write(&path, "https://a.example/\nftp://bad.example/\n")
            .await
            .unwrap();

        let err = read_urls_from_file(&path).await.unwrap_err();
        assert!(matches!(err, PumpkinError::RunAborted(_)));
    }

    #[tokio::test]
    async fn missing_url_file_is_run_aborted() {
        let err = read_urls_from_file(Path::new("/nonexistent/urls.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, PumpkinError::RunAborted(_)));
    }
}
