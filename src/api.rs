//! Read-only JSON facade over the query layer, plus static file surfaces.
//!
//! Every payload uses the `{success, data?, error?}` envelope. Validation
//! failures map to 400, absent entities to 404, anything unexpected to 500;
//! internal error detail never reaches clients.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::config::Config;
use crate::error::PumpkinError;
use crate::har::FailedRequest;
use crate::queries::{DailyAverage, QueryLayer, RunSummary, UrlTestDetail, UrlTestSummary};
use crate::store::Store;

const DEFAULT_LIMIT: i64 = 20;

/// Response envelope shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    })
}

/// Error half of the envelope, carrying the mapped status code.
pub struct ApiError(PumpkinError);

impl From<PumpkinError> for ApiError {
    fn from(err: PumpkinError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PumpkinError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PumpkinError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => {
                error!("api error: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(Envelope::<()> {
            success: false,
            data: None,
            error: Some(self.0.public_message()),
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub queries: QueryLayer,
    pub store: Store,
}

#[derive(Debug, Deserialize)]
struct LimitParam {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AutocompleteParams {
    q: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DateParam {
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DailyAverageParams {
    days: Option<i64>,
    timezone: Option<String>,
}

pub fn router(state: AppState, config: &Config) -> Router {
    let mut app = Router::new()
        .route("/api/runs", get(list_runs))
        .route("/api/runs/latest", get(latest_run))
        .route("/api/runs/:id", get(get_run))
        .route("/api/runs/:id/tests", get(run_tests))
        .route("/api/tests/:id", get(get_test))
        .route("/api/tests/:id/failed-requests", get(failed_requests))
        .route("/api/stats/latest", get(latest_run))
        .route("/api/stats/slowest", get(slowest))
        .route("/api/stats/fastest", get(fastest))
        .route("/api/stats/errors", get(tests_with_errors))
        .route("/api/calendar/available-dates", get(available_dates))
        .route("/api/calendar/runs-by-date", get(runs_by_date))
        .route("/api/urls/autocomplete", get(autocomplete))
        .route("/api/urls/:host/tests", get(tests_for_url))
        .route("/api/urls/:host/trend", get(domain_trend))
        .route("/api/urls/:host/daily-averages", get(daily_averages))
        .route("/health", get(health))
        .nest_service(
            "/test-history",
            ServeDir::new(&config.artifact_root).append_index_html_on_directories(false),
        );

    if let Some(dashboard) = &config.dashboard_dir {
        app = app.fallback_service(ServeDir::new(dashboard));
    }

    app.layer(CorsLayer::permissive()).with_state(state)
}

/// Binds and serves until the process exits.
pub async fn serve(state: AppState, config: &Config) -> Result<(), PumpkinError> {
    let app = router(state, config);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .map_err(|e| PumpkinError::Storage(format!("bind port {}: {e}", config.port)))?;
    info!("HTTP API listening on port {}", config.port);
    axum::serve(listener, app)
        .await
        .map_err(|e| PumpkinError::Storage(format!("http server: {e}")))?;
    Ok(())
}

async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<LimitParam>,
) -> ApiResult<Vec<RunSummary>> {
    let runs = state
        .queries
        .list_runs(params.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;
    Ok(ok(runs))
}

async fn latest_run(State(state): State<AppState>) -> ApiResult<RunSummary> {
    Ok(ok(state.queries.get_latest_run().await?))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<RunSummary> {
    Ok(ok(state.queries.get_run(id).await?))
}

async fn run_tests(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<UrlTestSummary>> {
    Ok(ok(state.queries.list_url_tests_for_run(id).await?))
}

async fn get_test(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<UrlTestDetail> {
    Ok(ok(state.queries.get_url_test(id).await?))
}

async fn failed_requests(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<FailedRequest>> {
    Ok(ok(state.queries.get_failed_requests_for_test(id).await?))
}

async fn slowest(
    State(state): State<AppState>,
    Query(params): Query<LimitParam>,
) -> ApiResult<Vec<UrlTestSummary>> {
    Ok(ok(state
        .queries
        .list_slowest_in_latest(params.limit.unwrap_or(DEFAULT_LIMIT))
        .await?))
}

async fn fastest(
    State(state): State<AppState>,
    Query(params): Query<LimitParam>,
) -> ApiResult<Vec<UrlTestSummary>> {
    Ok(ok(state
        .queries
        .list_fastest_in_latest(params.limit.unwrap_or(DEFAULT_LIMIT))
        .await?))
}

async fn tests_with_errors(
    State(state): State<AppState>,
    Query(params): Query<LimitParam>,
) -> ApiResult<Vec<UrlTestSummary>> {
    Ok(ok(state
        .queries
        .list_tests_with_errors(params.limit.unwrap_or(DEFAULT_LIMIT))
        .await?))
}

async fn available_dates(State(state): State<AppState>) -> ApiResult<Vec<String>> {
    Ok(ok(state.queries.available_dates().await?))
}

async fn runs_by_date(
    State(state): State<AppState>,
    Query(params): Query<DateParam>,
) -> ApiResult<Vec<RunSummary>> {
    let date = params
        .date
        .ok_or_else(|| PumpkinError::BadRequest("missing required param: date".to_string()))?;
    Ok(ok(state.queries.runs_by_date(&date).await?))
}

async fn autocomplete(
    State(state): State<AppState>,
    Query(params): Query<AutocompleteParams>,
) -> ApiResult<Vec<String>> {
    let prefix = params.q.unwrap_or_default();
    Ok(ok(state
        .queries
        .url_autocomplete(&prefix, params.limit.unwrap_or(DEFAULT_LIMIT))
        .await?))
}

async fn tests_for_url(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(params): Query<LimitParam>,
) -> ApiResult<Vec<UrlTestSummary>> {
    Ok(ok(state
        .queries
        .tests_for_url(&host, params.limit.unwrap_or(DEFAULT_LIMIT))
        .await?))
}

async fn domain_trend(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(params): Query<LimitParam>,
) -> ApiResult<Vec<UrlTestSummary>> {
    Ok(ok(state
        .queries
        .domain_trend(&host, params.limit.unwrap_or(DEFAULT_LIMIT))
        .await?))
}

async fn daily_averages(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(params): Query<DailyAverageParams>,
) -> ApiResult<Vec<DailyAverage>> {
    let timezone = params.timezone.unwrap_or_else(|| "UTC".to_string());
    Ok(ok(state
        .queries
        .daily_average_load_time(&host, params.days.unwrap_or(7), &timezone)
        .await?))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    database: String,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let connected = state.store.ping().await;
    let body = Json(HealthResponse {
        status: if connected { "ok" } else { "degraded" }.to_string(),
        database: if connected {
            "connected"
        } else {
            "disconnected"
        }
        .to_string(),
    });
    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Store, tempfile::TempDir) {
        let (store, tmp) = temp_store().await;
        let state = AppState {
            queries: QueryLayer::new(store.clone()),
            store: store.clone(),
        };
        let config = Config {
            database_url: "unused".to_string(),
            artifact_root: tmp.path().to_path_buf(),
            ..Config::default()
        };
        (router(state, &config), store, tmp)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    async fn seed(store: &Store) -> i64 {
        let (run_id,): (i64,) = sqlx::query_as(
            "INSERT INTO runs (uuid, run_timestamp, total_urls, parallel_workers)
             VALUES ('r-1', '2025-06-01T08:00:00.000Z', 1, 1) RETURNING id",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO url_tests
             (uuid, test_run_id, test_timestamp, url, domain, browser, user_agent,
              status, test_duration_ms, scroll_duration_ms, total_page_load_ms,
              screenshot_path, har_path)
             VALUES ('t-1', ?, '2025-06-01T08:00:01.000Z', 'https://a.example/',
                     'a.example', 'chromium', 'ua', 'PASSED', 100, 10, 250.0, '/s', '/h')",
        )
        .bind(run_id)
        .execute(store.pool())
        .await
        .unwrap();
        run_id
    }

    #[tokio::test]
    async fn latest_run_wraps_in_envelope() {
        let (app, store, _tmp) = test_app().await;
        seed(&store).await;

        let (status, body) = get_json(&app, "/api/runs/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["uuid"], "r-1");
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn latest_run_404_when_empty() {
        let (app, _store, _tmp) = test_app().await;
        let (status, body) = get_json(&app, "/api/runs/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn unknown_entities_are_404() {
        let (app, store, _tmp) = test_app().await;
        seed(&store).await;
        for uri in ["/api/runs/999", "/api/tests/999", "/api/tests/999/failed-requests"] {
            let (status, body) = get_json(&app, uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(body["success"], false, "{uri}");
        }
    }

    #[tokio::test]
    async fn run_tests_listing_and_detail() {
        let (app, store, _tmp) = test_app().await;
        let run_id = seed(&store).await;

        let (status, body) = get_json(&app, &format!("/api/runs/{run_id}/tests")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        let test_id = body["data"][0]["id"].as_i64().unwrap();

        let (status, body) = get_json(&app, &format!("/api/tests/{test_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["domain"], "a.example");
        assert_eq!(body["data"]["runTimestamp"], "2025-06-01T08:00:00.000Z");
    }

    #[tokio::test]
    async fn bad_timezone_is_400() {
        let (app, store, _tmp) = test_app().await;
        seed(&store).await;
        let (status, body) = get_json(
            &app,
            "/api/urls/a.example/daily-averages?days=3&timezone=bogus!",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn daily_averages_defaults_to_utc() {
        let (app, store, _tmp) = test_app().await;
        seed(&store).await;
        let (status, body) = get_json(&app, "/api/urls/a.example/daily-averages?days=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_date_param_is_400() {
        let (app, _store, _tmp) = test_app().await;
        let (status, _) = get_json(&app, "/api/calendar/runs-by-date").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_database_state() {
        let (app, _store, _tmp) = test_app().await;
        let (status, body) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], "connected");
    }

    #[tokio::test]
    async fn stats_endpoints_respond() {
        let (app, store, _tmp) = test_app().await;
        seed(&store).await;
        for uri in [
            "/api/stats/latest",
            "/api/stats/slowest",
            "/api/stats/fastest",
            "/api/stats/errors",
            "/api/calendar/available-dates",
            "/api/urls/autocomplete?q=a",
            "/api/urls/a.example/tests",
            "/api/urls/a.example/trend",
        ] {
            let (status, body) = get_json(&app, uri).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(body["success"], true, "{uri}");
        }
    }
}
