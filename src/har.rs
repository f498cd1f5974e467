//! HAR (HTTP Archive) model and post-processing.
//!
//! The browser driver writes HAR 1.2 files from CDP network events; this
//! module owns the serde model for those files and derives the per-test
//! status-code histogram and failed-request inventory from them.
//!
//! Parsing is total: any byte sequence yields either a real summary or an
//! empty one. Malformed archives are logged and skipped, never fatal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Har {
    pub log: HarLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarLog {
    #[serde(default = "har_version")]
    pub version: String,
    #[serde(default)]
    pub creator: HarCreator,
    #[serde(default)]
    pub entries: Vec<HarEntry>,
}

impl Default for HarLog {
    fn default() -> Self {
        Self {
            version: har_version(),
            creator: HarCreator::default(),
            entries: Vec::new(),
        }
    }
}

fn har_version() -> String {
    "1.2".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

impl Default for HarCreator {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    #[serde(default)]
    pub started_date_time: String,
    /// Total entry time in milliseconds.
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub request: HarRequest,
    #[serde(default)]
    pub response: HarResponse,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    /// HTTP status; recorders emit -1 for requests that never completed.
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub content: HarContent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub mime_type: String,
}

/// Failure class of a request with status >= 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCategory {
    #[serde(rename = "Client Error")]
    ClientError,
    #[serde(rename = "Server Error")]
    ServerError,
}

impl FailureCategory {
    pub fn for_status(status: u16) -> Self {
        if status >= 500 {
            FailureCategory::ServerError
        } else {
            FailureCategory::ClientError
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::ClientError => "Client Error",
            FailureCategory::ServerError => "Server Error",
        }
    }
}

/// One request that completed with an error status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRequest {
    pub request_url: String,
    pub status_code: u16,
    pub category: FailureCategory,
}

/// Derived view of one HAR recording.
#[derive(Debug, Clone, Default)]
pub struct HarSummary {
    /// Count per HTTP status code; entries with status <= 0 are dropped.
    pub status_counts: BTreeMap<u16, i64>,
    /// Requests with status >= 400, in archive order.
    pub failed_requests: Vec<FailedRequest>,
}

/// Summarizes raw HAR bytes. Never fails; malformed input yields an empty
/// summary and a warning.
pub fn analyze_bytes(bytes: &[u8]) -> HarSummary {
    let har: Har = match serde_json::from_slice(bytes) {
        Ok(har) => har,
        Err(e) => {
            warn!("malformed HAR, returning empty summary: {e}");
            return HarSummary::default();
        }
    };
    summarize(&har)
}

/// Summarizes a HAR file on disk. Missing or unreadable files yield an empty
/// summary.
pub fn analyze_file(path: &Path) -> HarSummary {
    match std::fs::read(path) {
        Ok(bytes) => analyze_bytes(&bytes),
        Err(e) => {
            warn!("cannot read HAR {}: {e}", path.display());
            HarSummary::default()
        }
    }
}

pub fn summarize(har: &Har) -> HarSummary {
    let mut summary = HarSummary::default();

    for entry in &har.log.entries {
        let status = entry.response.status;
        if status <= 0 || status > u16::MAX as i64 {
            continue;
        }
        let status = status as u16;
        *summary.status_counts.entry(status).or_insert(0) += 1;

        if status >= 400 {
            summary.failed_requests.push(FailedRequest {
                request_url: entry.request.url.clone(),
                status_code: status,
                category: FailureCategory::for_status(status),
            });
        }
    }

    summary
}
