//! JSON routes consumed by the monitoring dashboard shell.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::refresh::{DashboardService, RecommendationsReport, RefreshReport};
use crate::telemetry::LookbackDays;

/// What the routes need from a refresh backend.
pub trait DashboardSource: Send + Sync + 'static {
    fn refresh(&self, lookback: LookbackDays) -> RefreshReport;
    fn recommendations(&self, lookback: LookbackDays) -> RecommendationsReport;
}

impl DashboardSource for DashboardService {
    fn refresh(&self, lookback: LookbackDays) -> RefreshReport {
        DashboardService::refresh(self, lookback)
    }

    fn recommendations(&self, lookback: LookbackDays) -> RecommendationsReport {
        DashboardService::recommendations(self, lookback)
    }
}

pub fn dashboard_router(source: Arc<dyn DashboardSource>) -> Router {
    Router::new()
        .route("/dashboard/refresh", get(get_refresh))
        .route("/dashboard/recommendations", get(get_recommendations))
        .with_state(DashboardAppState { source })
}

#[derive(Clone)]
struct DashboardAppState {
    source: Arc<dyn DashboardSource>,
}

#[derive(Debug, Default, Deserialize)]
struct LookbackQuery {
    days: Option<String>,
}

impl LookbackQuery {
    fn lookback(&self) -> Result<LookbackDays, ApiError> {
        let Some(raw) = self.days.as_deref() else {
            return Ok(LookbackDays::default());
        };
        let days: u32 = raw.trim().parse().map_err(|_| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("days must be 7, 14 or 30, got {raw:?}"),
            )
        })?;
        LookbackDays::try_from(days)
            .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn get_refresh(
    State(state): State<DashboardAppState>,
    Query(query): Query<LookbackQuery>,
) -> Result<Json<RefreshReport>, ApiError> {
    let lookback = query.lookback()?;
    info!(
        component = "dashboard",
        event = "http.refresh.request",
        lookback_days = lookback.days()
    );

    let source = Arc::clone(&state.source);
    let report = tokio::task::spawn_blocking(move || source.refresh(lookback))
        .await
        .map_err(|err| join_failure("refresh", err))?;
    Ok(Json(report))
}

async fn get_recommendations(
    State(state): State<DashboardAppState>,
    Query(query): Query<LookbackQuery>,
) -> Result<Json<RecommendationsReport>, ApiError> {
    let lookback = query.lookback()?;
    info!(
        component = "dashboard",
        event = "http.recommendations.request",
        lookback_days = lookback.days()
    );

    let source = Arc::clone(&state.source);
    let report = tokio::task::spawn_blocking(move || source.recommendations(lookback))
        .await
        .map_err(|err| join_failure("recommendations", err))?;
    Ok(Json(report))
}

fn join_failure(route: &'static str, err: tokio::task::JoinError) -> ApiError {
    error!(
        component = "dashboard",
        event = "http.task.failed",
        route,
        error = %err
    );
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "refresh task failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_days_defaults_to_one_week() {
        let query = LookbackQuery::default();
        assert_eq!(query.lookback().ok(), Some(LookbackDays::Seven));
    }

    #[test]
    fn unsupported_days_are_a_bad_request() {
        let query = LookbackQuery {
            days: Some("3".to_string()),
        };
        let err = query.lookback().expect_err("3 days is not offered");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("3"));
    }

    #[test]
    fn non_numeric_days_are_a_bad_request() {
        let query = LookbackQuery {
            days: Some("week".to_string()),
        };
        let err = query.lookback().expect_err("not a number");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("\"week\""));
    }

    #[test]
    fn padded_days_are_accepted() {
        let query = LookbackQuery {
            days: Some(" 14 ".to_string()),
        };
        assert_eq!(query.lookback().ok(), Some(LookbackDays::Fourteen));
    }
}
