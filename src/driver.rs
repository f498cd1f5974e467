//! Per-URL measurement protocol on top of a pooled Chrome instance.
//!
//! One job drives a single page through navigation, settle, forced scroll,
//! Performance API extraction, full-page screenshot and teardown. Network
//! activity is recorded from CDP events and flushed as a HAR file when the
//! session closes, including after a timeout, so partial recordings survive.
//!
//! Sessions are isolated per job: every job gets a fresh page, and cookies
//! plus per-origin storage are wiped before navigation, so state written by
//! one job never reaches the next job on the same pooled instance.
//!
//! The scheduler depends on the `UrlDriver` trait, not on Chrome: any engine
//! exposing this capability set plugs in, and tests use a stub.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::storage::ClearDataForOriginParams;
use chromiumoxide::page::{Page, ScreenshotParams};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

use crate::artifacts::TestDirs;
use crate::browser_pool::BrowserPool;
use crate::config::{Config, JOB_DEADLINE, NAVIGATION_TIMEOUT, SETTLE_DELAY};
use crate::error::PumpkinError;
use crate::har::{Har, HarContent, HarEntry, HarLog, HarRequest, HarResponse};
use crate::measurement::{NavigationTiming, ResourceStats, TestMeasurement, TestStatus};
use crate::utils::{db_timestamp, extract_domain};

/// Scroll step height in pixels.
const SCROLL_STEP_PX: f64 = 100.0;
/// Delay between scroll steps.
const SCROLL_INTERVAL: Duration = Duration::from_millis(100);
/// Pause at the bottom before scrolling back up.
const SCROLL_BOTTOM_PAUSE: Duration = Duration::from_secs(1);
/// Pause at the top after scrolling back.
const SCROLL_TOP_PAUSE: Duration = Duration::from_millis(500);

/// One unit of work for a driver: the URL plus its allocated artifact paths.
#[derive(Debug, Clone)]
pub struct UrlJob {
    pub url: String,
    pub dirs: TestDirs,
}

/// The browser capability consumed by the scheduler.
///
/// `measure` always yields a measurement when the failure is scoped to the
/// page (timeouts and navigation errors become TIMEOUT/ERROR statuses); an
/// `Err` means the driver infrastructure itself is unusable for this job.
#[async_trait]
pub trait UrlDriver: Send + Sync {
    async fn measure(&self, job: &UrlJob) -> Result<TestMeasurement, PumpkinError>;
}

/// Reads the navigation entry and the resource entries in one round-trip.
/// Durations may come back negative for unmeasurable phases; the driver
/// clamps them to zero.
const PERFORMANCE_SCRIPT: &str = r#"
    (() => {
        const nav = performance.getEntriesByType('navigation')[0] || null;
        const resources = performance.getEntriesByType('resource');
        const byType = {};
        let transferSize = 0, encodedSize = 0;
        for (const r of resources) {
            const key = r.initiatorType || 'other';
            byType[key] = (byType[key] || 0) + 1;
            transferSize += r.transferSize || 0;
            encodedSize += r.encodedBodySize || 0;
        }
        return {
            nav: nav ? {
                dns: nav.domainLookupEnd - nav.domainLookupStart,
                tcp: nav.connectEnd - nav.connectStart,
                tls: nav.secureConnectionStart > 0
                    ? nav.connectEnd - nav.secureConnectionStart
                    : -1,
                ttfb: nav.responseStart - nav.requestStart,
                response: nav.responseEnd - nav.responseStart,
                dcl: nav.domContentLoadedEventEnd - nav.startTime,
                interactive: nav.domInteractive - nav.startTime,
                total: nav.loadEventEnd - nav.startTime,
                transferSize: nav.transferSize || 0,
                encodedBodySize: nav.encodedBodySize || 0,
                decodedBodySize: nav.decodedBodySize || 0
            } : null,
            resourceCount: resources.length,
            byType,
            totalTransferSize: transferSize,
            totalEncodedSize: encodedSize
        };
    })()
"#;

const SCROLL_METRICS_SCRIPT: &str = r#"
    (() => ({
        documentHeight: Math.max(
            document.body ? document.body.scrollHeight : 0,
            document.documentElement ? document.documentElement.scrollHeight : 0
        ),
        viewportHeight: window.innerHeight
    }))()
"#;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PerfSnapshot {
    nav: Option<NavEntry>,
    resource_count: i64,
    by_type: BTreeMap<String, i64>,
    total_transfer_size: f64,
    total_encoded_size: f64,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavEntry {
    dns: f64,
    tcp: f64,
    tls: f64,
    ttfb: f64,
    response: f64,
    dcl: f64,
    interactive: f64,
    total: f64,
    transfer_size: f64,
    encoded_body_size: f64,
    decoded_body_size: f64,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrollMetrics {
    document_height: f64,
    viewport_height: f64,
}

/// In-flight network recording, keyed by CDP request id.
#[derive(Debug, Default)]
struct NetLog {
    order: Vec<String>,
    entries: HashMap<String, NetEntry>,
}

#[derive(Debug, Default, Clone)]
struct NetEntry {
    url: String,
    method: String,
    status: i64,
    status_text: String,
    mime_type: String,
    size: i64,
    started: String,
}

impl NetLog {
    fn on_request(&mut self, id: String, url: String, method: String) {
        if !self.entries.contains_key(&id) {
            self.order.push(id.clone());
        }
        let entry = self.entries.entry(id).or_default();
        entry.url = url;
        entry.method = method;
        entry.status = -1;
        entry.started = db_timestamp(Utc::now());
    }

    fn on_response(&mut self, id: &str, status: i64, status_text: String, mime_type: String) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.status = status;
            entry.status_text = status_text;
            entry.mime_type = mime_type;
        }
    }

    fn on_finished(&mut self, id: &str, encoded_data_length: f64) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.size = encoded_data_length as i64;
        }
    }

    fn on_failed(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.status = -1;
        }
    }

    fn to_har(&self) -> Har {
        let entries = self
            .order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| HarEntry {
                started_date_time: entry.started.clone(),
                time: 0.0,
                request: HarRequest {
                    method: entry.method.clone(),
                    url: entry.url.clone(),
                },
                response: HarResponse {
                    status: entry.status,
                    status_text: entry.status_text.clone(),
                    content: HarContent {
                        size: entry.size,
                        mime_type: entry.mime_type.clone(),
                    },
                },
            })
            .collect();

        Har {
            log: HarLog {
                entries,
                ..HarLog::default()
            },
        }
    }
}

/// Everything the protocol produced before teardown.
struct ProtocolResult {
    page_title: Option<String>,
    user_agent: String,
    scroll_duration_ms: i64,
    timing: NavigationTiming,
    resources: ResourceStats,
}

/// Chrome-backed driver.
pub struct ChromiumDriver {
    pool: Arc<BrowserPool>,
    config: Config,
}

impl ChromiumDriver {
    pub fn new(pool: Arc<BrowserPool>, config: Config) -> Self {
        Self { pool, config }
    }

    async fn open_page(&self) -> Result<(Page, crate::browser_pool::BrowserLease), PumpkinError> {
        let lease = self.pool.get_browser().await?;
        let page = {
            let browser = lease.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| PumpkinError::DriverError(format!("new page: {e}")))?
        };
        if let Err(e) = Self::reset_session(&page).await {
            let _ = page.close().await;
            return Err(e);
        }
        Ok((page, lease))
    }

    /// Wipes session state left behind by whatever job last held this
    /// instance: cookies across the browser, then localStorage, IndexedDB,
    /// service workers and the rest of the per-origin stores. Runs before
    /// every navigation, so a lease always starts from a blank slate even if
    /// the previous job's teardown was cut short.
    async fn reset_session(page: &Page) -> Result<(), PumpkinError> {
        page.execute(network::ClearBrowserCookiesParams::default())
            .await
            .map_err(|e| PumpkinError::DriverError(format!("clear cookies: {e}")))?;
        page.execute(ClearDataForOriginParams::new("*", "all"))
            .await
            .map_err(|e| PumpkinError::DriverError(format!("clear storage: {e}")))?;
        Ok(())
    }

    /// Subscribes to the CDP network events feeding the HAR recording.
    async fn spawn_collectors(
        page: &Page,
        log: Arc<Mutex<NetLog>>,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>, PumpkinError> {
        page.execute(network::EnableParams::default())
            .await
            .map_err(|e| PumpkinError::DriverError(format!("network enable: {e}")))?;

        let mut handles = Vec::with_capacity(4);

        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|e| PumpkinError::DriverError(format!("event listener: {e}")))?;
        let request_log = log.clone();
        handles.push(tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                request_log.lock().unwrap().on_request(
                    event.request_id.inner().clone(),
                    event.request.url.clone(),
                    event.request.method.clone(),
                );
            }
        }));

        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| PumpkinError::DriverError(format!("event listener: {e}")))?;
        let response_log = log.clone();
        handles.push(tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                response_log.lock().unwrap().on_response(
                    event.request_id.inner(),
                    event.response.status,
                    event.response.status_text.clone(),
                    event.response.mime_type.clone(),
                );
            }
        }));

        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(|e| PumpkinError::DriverError(format!("event listener: {e}")))?;
        let finished_log = log.clone();
        handles.push(tokio::spawn(async move {
            while let Some(event) = finished.next().await {
                finished_log
                    .lock()
                    .unwrap()
                    .on_finished(event.request_id.inner(), event.encoded_data_length);
            }
        }));

        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(|e| PumpkinError::DriverError(format!("event listener: {e}")))?;
        let failed_log = log;
        handles.push(tokio::spawn(async move {
            while let Some(event) = failed.next().await {
                failed_log.lock().unwrap().on_failed(event.request_id.inner());
            }
        }));

        Ok(handles)
    }

    async fn run_protocol(
        &self,
        page: &Page,
        job: &UrlJob,
    ) -> Result<ProtocolResult, PumpkinError> {
        timeout(NAVIGATION_TIMEOUT, page.goto(job.url.as_str()))
            .await
            .map_err(|_| PumpkinError::DriverTimeout(NAVIGATION_TIMEOUT))?
            .map_err(|e| PumpkinError::DriverError(format!("navigation: {e}")))?;

        // Wait for the load event, then give deferred content a moment.
        if let Ok(result) = timeout(NAVIGATION_TIMEOUT, page.wait_for_navigation()).await {
            if let Err(e) = result {
                debug!("load wait ended early: {e}");
            }
        } else {
            return Err(PumpkinError::DriverTimeout(NAVIGATION_TIMEOUT));
        }
        sleep(SETTLE_DELAY).await;

        let scroll_duration_ms = self.forced_scroll(page).await?;

        let (timing, resources) = self.read_performance(page).await?;

        let screenshot = page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(true)
                    .build(),
            )
            .await
            .map_err(|e| PumpkinError::DriverError(format!("screenshot: {e}")))?;
        tokio::fs::write(&job.dirs.screenshot_path, screenshot).await?;

        let page_title = page.get_title().await.ok().flatten().filter(|t| !t.is_empty());
        let user_agent = page
            .evaluate("navigator.userAgent")
            .await
            .ok()
            .and_then(|result| result.into_value::<String>().ok())
            .unwrap_or_default();

        Ok(ProtocolResult {
            page_title,
            user_agent,
            scroll_duration_ms,
            timing,
            resources,
        })
    }

    /// Forced scroll: step down the whole document to trigger lazy-loaded
    /// content, pause, return to the top. Returns the phase's wall-clock
    /// duration in milliseconds.
    async fn forced_scroll(&self, page: &Page) -> Result<i64, PumpkinError> {
        let start = Instant::now();

        let metrics: ScrollMetrics = page
            .evaluate(SCROLL_METRICS_SCRIPT)
            .await
            .map_err(|e| PumpkinError::DriverError(format!("scroll metrics: {e}")))?
            .into_value()
            .map_err(|e| PumpkinError::DriverError(format!("scroll metrics: {e}")))?;

        let target = (metrics.document_height - metrics.viewport_height).max(0.0);
        let mut scrolled = 0.0;
        while scrolled < target {
            page.evaluate(format!("window.scrollBy(0, {SCROLL_STEP_PX})"))
                .await
                .map_err(|e| PumpkinError::DriverError(format!("scroll: {e}")))?;
            scrolled += SCROLL_STEP_PX;
            sleep(SCROLL_INTERVAL).await;
        }

        sleep(SCROLL_BOTTOM_PAUSE).await;
        page.evaluate("window.scrollTo(0, 0)")
            .await
            .map_err(|e| PumpkinError::DriverError(format!("scroll reset: {e}")))?;
        sleep(SCROLL_TOP_PAUSE).await;

        Ok(start.elapsed().as_millis() as i64)
    }

    async fn read_performance(
        &self,
        page: &Page,
    ) -> Result<(NavigationTiming, ResourceStats), PumpkinError> {
        let snapshot: PerfSnapshot = page
            .evaluate(PERFORMANCE_SCRIPT)
            .await
            .map_err(|e| PumpkinError::DriverError(format!("performance read: {e}")))?
            .into_value()
            .map_err(|e| PumpkinError::DriverError(format!("performance decode: {e}")))?;

        let mut timing = NavigationTiming::default();
        if let Some(nav) = snapshot.nav {
            timing.dns_lookup_ms = Some(nav.dns);
            timing.tcp_connection_ms = Some(nav.tcp);
            timing.tls_negotiation_ms = Some(nav.tls);
            timing.time_to_first_byte_ms = Some(nav.ttfb);
            timing.response_time_ms = Some(nav.response);
            timing.dom_content_loaded_ms = Some(nav.dcl);
            timing.dom_interactive_ms = Some(nav.interactive);
            timing.total_page_load_ms = Some(nav.total);
            timing.doc_transfer_size = Some(nav.transfer_size as i64);
            timing.doc_encoded_size = Some(nav.encoded_body_size as i64);
            timing.doc_decoded_size = Some(nav.decoded_body_size as i64);
        }
        timing.clamp_negatives();

        let resources = ResourceStats {
            total_resources: snapshot.resource_count,
            total_transfer_size: snapshot.total_transfer_size as i64,
            total_encoded_size: snapshot.total_encoded_size as i64,
            by_type: snapshot.by_type,
        };

        Ok((timing, resources))
    }

    /// Flushes the HAR recording and closes the page. Runs on every exit
    /// path, including timeouts, so partial recordings reach disk.
    async fn teardown(
        &self,
        page: Page,
        collectors: Vec<tokio::task::JoinHandle<()>>,
        log: &Mutex<NetLog>,
        job: &UrlJob,
    ) {
        for collector in collectors {
            collector.abort();
        }

        let har = log.lock().unwrap().to_har();
        match serde_json::to_vec(&har) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&job.dirs.har_path, bytes).await {
                    warn!("HAR flush failed for {}: {e}", job.url);
                }
            }
            Err(e) => warn!("HAR serialization failed for {}: {e}", job.url),
        }

        if let Err(e) = page.close().await {
            debug!("page close: {e}");
        }
    }
}

#[async_trait]
impl UrlDriver for ChromiumDriver {
    async fn measure(&self, job: &UrlJob) -> Result<TestMeasurement, PumpkinError> {
        let started_at: DateTime<Utc> = Utc::now();
        let start = Instant::now();

        let (page, lease) = self.open_page().await?;
        let log = Arc::new(Mutex::new(NetLog::default()));
        let collectors = match Self::spawn_collectors(&page, log.clone()).await {
            Ok(collectors) => collectors,
            Err(e) => {
                let _ = page.close().await;
                drop(lease);
                return Err(e);
            }
        };

        let outcome = timeout(JOB_DEADLINE, self.run_protocol(&page, job)).await;

        self.teardown(page, collectors, &log, job).await;
        drop(lease);

        let elapsed_ms = start.elapsed().as_millis() as i64;
        let measurement = match outcome {
            Ok(Ok(result)) => TestMeasurement {
                url: job.url.clone(),
                domain: extract_domain(&job.url),
                browser: self.config.browser_name.clone(),
                user_agent: result.user_agent,
                page_title: result.page_title,
                status: TestStatus::Passed,
                error_message: None,
                started_at,
                test_duration_ms: elapsed_ms,
                scroll_duration_ms: result.scroll_duration_ms,
                timing: result.timing,
                resources: result.resources,
                http_response_codes: BTreeMap::new(),
                screenshot_path: job.dirs.screenshot_path.to_string_lossy().into_owned(),
                har_path: job.dirs.har_path.to_string_lossy().into_owned(),
            },
            Ok(Err(PumpkinError::DriverTimeout(_))) | Err(_) => {
                warn!("job timed out: {}", job.url);
                TestMeasurement::synthetic(
                    &job.url,
                    &self.config.browser_name,
                    &job.dirs,
                    started_at,
                    TestStatus::Timeout,
                    Some("per-job deadline exceeded".to_string()),
                )
            }
            Ok(Err(e)) => {
                warn!("job failed: {}: {e}", job.url);
                TestMeasurement::synthetic(
                    &job.url,
                    &self.config.browser_name,
                    &job.dirs,
                    started_at,
                    TestStatus::Error,
                    Some(e.to_string()),
                )
            }
        };

        Ok(measurement)
    }
}
