//! Configuration for batch runs, the browser fleet and the HTTP API.
//!
//! Settings come from three layers: compiled defaults, environment variables
//! (`DATABASE_URL`, `PORT`, `TEST_URL`, `TEST_RUN_ID`) and CLI flags. The CLI
//! layer wins; `DATABASE_URL` is the only hard requirement.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PumpkinError;

/// Default HTTP listen port when `PORT` is absent.
pub const DEFAULT_PORT: u16 = 3000;

/// Navigation and load-event budget per page.
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Hard wall-clock ceiling for one URL job: navigation, settle, scroll,
/// metric read, screenshot and HAR flush together.
pub const JOB_DEADLINE: Duration = Duration::from_secs(120);

/// Settle delay after the load event, before the scroll phase.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Grace period granted to in-flight jobs when a run is cancelled.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Database connection string (`DATABASE_URL`). Required; startup refuses
    /// without it.
    pub database_url: String,

    /// HTTP API listen port (`PORT`, default 3000).
    pub port: u16,

    /// Root directory for per-test artifact directories. Paths stored in the
    /// database are absolute under this root.
    pub artifact_root: PathBuf,

    /// Optional static dashboard directory served at `/`.
    pub dashboard_dir: Option<PathBuf>,

    /// Number of parallel browser workers for a batch run.
    pub workers: usize,

    /// Default target URL for `single` when no argument is given (`TEST_URL`).
    pub test_url: Option<String>,

    /// Run id injected by the scheduler into worker environments
    /// (`TEST_RUN_ID`); absent means a single-job run is auto-created.
    pub test_run_id: Option<i64>,

    /// Browser family label recorded with every measurement.
    pub browser_name: String,

    /// Path to the Chrome/Chromium executable (default: auto-detect).
    pub chrome_path: Option<String>,

    /// Browser viewport used for navigation and screenshots.
    pub viewport: Viewport,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            port: DEFAULT_PORT,
            artifact_root: PathBuf::from("/app/test-history"),
            dashboard_dir: None,
            workers: num_cpus::get().clamp(1, 8),
            test_url: None,
            test_run_id: None,
            browser_name: "chromium".to_string(),
            chrome_path: None,
            viewport: Viewport::default(),
        }
    }
}

impl Config {
    /// Builds a configuration from the process environment.
    ///
    /// `DATABASE_URL` is mandatory; everything else falls back to defaults.
    pub fn from_env() -> Result<Self, PumpkinError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| PumpkinError::MissingEnv("DATABASE_URL"))?;

        let mut config = Config {
            database_url,
            ..Config::default()
        };

        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|_| PumpkinError::BadRequest(format!("PORT is not a port: {port}")))?;
        }

        if let Ok(url) = std::env::var("TEST_URL") {
            if !url.trim().is_empty() {
                config.test_url = Some(url.trim().to_string());
            }
        }

        if let Ok(run_id) = std::env::var("TEST_RUN_ID") {
            config.test_run_id = Some(run_id.parse().map_err(|_| {
                PumpkinError::BadRequest(format!("TEST_RUN_ID is not an integer: {run_id}"))
            })?);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PumpkinError> {
        if self.database_url.is_empty() {
            return Err(PumpkinError::MissingEnv("DATABASE_URL"));
        }
        if self.workers == 0 {
            return Err(PumpkinError::BadRequest(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(PumpkinError::BadRequest(
                "viewport dimensions must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Browser viewport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Chrome command-line arguments for one pooled instance.
///
/// Unique user-data and temp directories per instance avoid the Chrome
/// process-singleton when several browsers launch concurrently.
pub fn get_chrome_args(config: &Config, instance_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);

    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--ignore-certificate-errors".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-data-dir=/tmp/pumpkin-profile-{unique_id}"),
        format!("--remote-debugging-port={}", 9222 + instance_id),
    ]
}

pub fn create_browser_config(
    config: &Config,
    instance_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, PumpkinError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .args(get_chrome_args(config, instance_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(PumpkinError::DriverError)
}
