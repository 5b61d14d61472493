//! HTTP API handlers for epidash.
//!
//! Every endpoint returns a renderer-ready JSON structure wrapped with its
//! freshness:
//!
//! ```json
//! { "data": { ... }, "stale": false, "generated_at": "2020-02-01T02:00:00Z" }
//! ```
//!
//! When the upstream fetch fails and there is no previous result to fall back
//! on, the response is `503` with `{"status": "unavailable"}`.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::dashboard::{Dashboard, RefreshReport, Served};
use crate::error::PipelineError;
use crate::model::RegionLevel;
use crate::render::{AnimationFrame, ChoroplethMap, CounterPanel, TrendChart, animation_frames};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dashboard: Dashboard,
}

/// Error response: a status code plus a small JSON body.
pub type ApiError = (StatusCode, Json<Value>);

/// Build the router with every endpoint mounted.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/trend", get(get_trend))
        .route("/counts", get(get_counts))
        .route("/maps/provinces", get(get_province_map))
        .route("/maps/cities", get(get_city_map))
        .route("/timeline", get(get_timeline))
        .route("/refresh", post(post_refresh))
        .with_state(state)
}

fn unavailable() -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "status": "unavailable" })),
    )
}

fn error_response(e: &PipelineError) -> ApiError {
    match e {
        PipelineError::EmptyRange { start, end } => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "empty_range", "start": start, "end": end })),
        ),
        _ => unavailable(),
    }
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /trend - Daily national series as a two-panel line chart.
#[instrument(skip(state))]
pub async fn get_trend(State(state): State<AppState>) -> Result<Json<Served<TrendChart>>, ApiError> {
    match state.dashboard.trend().await {
        Ok(served) => {
            info!(
                days = served.data.len(),
                stale = served.stale,
                "Trend queried"
            );
            Ok(Json(served.map(|series| TrendChart::from_series(&series))))
        }
        Err(e) => {
            warn!(error = %e, "Failed to build trend");
            Err(error_response(&e))
        }
    }
}

/// GET /counts - Headline counters.
///
/// # Response
///
/// ```json
/// {
///     "data": {
///         "update_time": "2020-02-01 10:00",
///         "confirmed": "11821",
///         "suspected": "17988",
///         "dead": "00259",
///         "cured": "00275"
///     },
///     "stale": false,
///     "generated_at": "2020-02-01T02:00:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn get_counts(State(state): State<AppState>) -> Result<Json<Served<CounterPanel>>, ApiError> {
    match state.dashboard.totals().await {
        Ok(served) => {
            info!(stale = served.stale, "Counts queried");
            Ok(Json(served.map(|totals| CounterPanel::from(&totals))))
        }
        Err(e) => {
            warn!(error = %e, "Failed to fetch global totals");
            Err(error_response(&e))
        }
    }
}

async fn region_map(state: &AppState, level: RegionLevel) -> Result<Json<Served<ChoroplethMap>>, ApiError> {
    match state.dashboard.region_table(level).await {
        Ok(served) => {
            info!(
                level = %level,
                regions = served.data.len(),
                stale = served.stale,
                "Region map queried"
            );
            let boundary = state.dashboard.boundary(level);
            Ok(Json(served.map(|table| ChoroplethMap::from_table(&table, boundary))))
        }
        Err(e) => {
            warn!(level = %level, error = %e, "Failed to build region map");
            Err(error_response(&e))
        }
    }
}

/// GET /maps/provinces - Province-level choropleth.
#[instrument(skip(state))]
pub async fn get_province_map(
    State(state): State<AppState>,
) -> Result<Json<Served<ChoroplethMap>>, ApiError> {
    region_map(&state, RegionLevel::Province).await
}

/// GET /maps/cities - City-level choropleth.
#[instrument(skip(state))]
pub async fn get_city_map(State(state): State<AppState>) -> Result<Json<Served<ChoroplethMap>>, ApiError> {
    region_map(&state, RegionLevel::City).await
}

/// Query parameters for the timeline endpoint.
#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    /// First local date, `YYYY-MM-DD`.
    pub start: NaiveDate,
    /// Last local date, inclusive.
    pub end: NaiveDate,
}

/// Animation frames for a date range.
#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub frames: Vec<AnimationFrame>,
}

/// GET /timeline - Time-lapse frames over the accumulated province history.
///
/// # Query Parameters
///
/// - `start` (required): first date, inclusive
/// - `end` (required): last date, inclusive
///
/// Returns `404` when no history falls inside the range.
#[instrument(skip(state))]
pub async fn get_timeline(
    State(state): State<AppState>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<TimelineResponse>, ApiError> {
    if query.start > query.end {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "invalid_range" })),
        ));
    }

    match state.dashboard.timeline(query.start, query.end).await {
        Ok(index) => {
            let frames = animation_frames(&index, state.dashboard.boundary(RegionLevel::Province));
            info!(
                start = %query.start,
                end = %query.end,
                frames = frames.len(),
                "Timeline queried"
            );
            Ok(Json(TimelineResponse {
                start: query.start,
                end: query.end,
                frames,
            }))
        }
        Err(e) => {
            warn!(start = %query.start, end = %query.end, error = %e, "Failed to build timeline");
            Err(error_response(&e))
        }
    }
}

/// POST /refresh - Run one refresh cycle now.
///
/// Returns `502` if a primary fetch failed; the error text is in the body.
#[instrument(skip(state))]
pub async fn post_refresh(State(state): State<AppState>) -> Result<Json<RefreshReport>, ApiError> {
    match state.dashboard.refresh().await {
        Ok(report) => {
            info!(
                provinces = report.provinces,
                cities = report.cities,
                "Manual refresh complete"
            );
            Ok(Json(report))
        }
        Err(e) => {
            warn!(error = %e, "Manual refresh failed");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({ "status": "refresh_failed", "error": e.to_string() })),
            ))
        }
    }
}
