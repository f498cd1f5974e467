//! Measurement records produced by the browser driver and consumed by the
//! ingestor. One `TestMeasurement` is the complete account of one URL visit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::artifacts::TestDirs;
use crate::utils::extract_domain;

/// Final status of one URL test. Assigned once, never mutated after insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    /// Full capture completed.
    Passed,
    /// Measurement completed but could not be persisted.
    Failed,
    /// Per-job deadline or navigation timeout hit.
    Timeout,
    /// Any non-timeout driver failure.
    Error,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "PASSED",
            TestStatus::Failed => "FAILED",
            TestStatus::Timeout => "TIMEOUT",
            TestStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PASSED" => Some(TestStatus::Passed),
            "FAILED" => Some(TestStatus::Failed),
            "TIMEOUT" => Some(TestStatus::Timeout),
            "ERROR" => Some(TestStatus::Error),
            _ => None,
        }
    }
}

/// Navigation timing phases in milliseconds, read from the page's
/// `PerformanceNavigationTiming` entry. A phase the browser could not measure
/// is `None`; negative raw values (e.g. TLS on plain http) clamp to zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NavigationTiming {
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
}

impl NavigationTiming {
    /// Clamps every negative duration to zero, in place.
    pub fn clamp_negatives(&mut self) {
        for field in [
            &mut self.dns_lookup_ms,
            &mut self.tcp_connection_ms,
            &mut self.tls_negotiation_ms,
            &mut self.time_to_first_byte_ms,
            &mut self.response_time_ms,
            &mut self.dom_content_loaded_ms,
            &mut self.dom_interactive_ms,
            &mut self.total_page_load_ms,
        ] {
            if let Some(v) = field {
                if *v < 0.0 {
                    *field = Some(0.0);
                }
            }
        }
    }
}

/// Aggregate network activity observed via `PerformanceResourceTiming`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStats {
    pub total_resources: i64,
    pub total_transfer_size: i64,
    pub total_encoded_size: i64,
    /// Per-initiator-type resource counts (`script`, `img`, ...).
    pub by_type: BTreeMap<String, i64>,
}

/// The complete record of one URL visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMeasurement {
    pub url: String,
    pub domain: String,
    pub browser: String,
    pub user_agent: String,
    pub page_title: Option<String>,

    pub status: TestStatus,
    pub error_message: Option<String>,

    /// Wall-clock start of the job, UTC.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the whole job.
    pub test_duration_ms: i64,
    /// Wall-clock duration of the forced-scroll phase.
    pub scroll_duration_ms: i64,

    pub timing: NavigationTiming,
    pub resources: ResourceStats,

    /// HTTP status code histogram derived from the HAR recording.
    pub http_response_codes: BTreeMap<u16, i64>,

    pub screenshot_path: String,
    pub har_path: String,
}

impl TestMeasurement {
    /// Skeleton measurement for a job that produced no usable capture: a
    /// scheduler-level timeout or a crashed worker. Derived maps stay empty.
    pub fn synthetic(
        url: &str,
        browser: &str,
        dirs: &TestDirs,
        started_at: DateTime<Utc>,
        status: TestStatus,
        error_message: Option<String>,
    ) -> Self {
        Self {
            url: url.to_string(),
            domain: extract_domain(url),
            browser: browser.to_string(),
            user_agent: String::new(),
            page_title: None,
            status,
            error_message,
            started_at,
            test_duration_ms: (Utc::now() - started_at).num_milliseconds().max(0),
            scroll_duration_ms: 0,
            timing: NavigationTiming::default(),
            resources: ResourceStats::default(),
            http_response_codes: BTreeMap::new(),
            screenshot_path: dirs.screenshot_path.to_string_lossy().into_owned(),
            har_path: dirs.har_path.to_string_lossy().into_owned(),
        }
    }
}
