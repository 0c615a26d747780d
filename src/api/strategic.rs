use super::state::{ApiError, ApiState};
use crate::error::ValidationError;
use crate::hub::LatestStrategic;
use crate::strategic::StrategicAnalysis;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct LatestQuery {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct HistoryQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default = "default_history_limit")]
    limit: i64,
}

fn default_history_limit() -> i64 {
    10
}

#[derive(Deserialize, Default)]
pub(super) struct RefreshRequest {
    #[serde(default)]
    user_id: Option<String>,
    /// Skip the rollup gate.
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
pub(super) struct RefreshResponse {
    generated: bool,
    analysis: Option<StrategicAnalysis>,
}

#[derive(Serialize)]
pub(super) struct HistoryResponse {
    analyses: Vec<StrategicAnalysis>,
}

pub(super) async fn latest(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LatestQuery>,
) -> Result<Json<LatestStrategic>, ApiError> {
    let user_id = state.user_or_default(query.user_id);
    Ok(Json(state.hub.latest_strategic_analysis(&user_id).await?))
}

pub(super) async fn history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let user_id = state.user_or_default(query.user_id);
    let analyses = state.hub.strategic().list(&user_id, query.limit).await?;
    Ok(Json(HistoryResponse { analyses }))
}

pub(super) async fn refresh(
    State(state): State<Arc<ApiState>>,
    body: Bytes,
) -> Result<Json<RefreshResponse>, ApiError> {
    let request: RefreshRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RefreshRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|error| ValidationError::InvalidParameter {
            name: "body",
            value: error.to_string(),
        })?
    };
    let user_id = state.user_or_default(request.user_id);
    let analysis = state.hub.refresh_strategic(&user_id, request.force).await?;

    Ok(Json(RefreshResponse {
        generated: analysis.is_some(),
        analysis,
    }))
}
