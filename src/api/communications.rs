use super::state::{ApiError, ApiState};
use crate::Provider;
use crate::analysis::{Analysis, BatchOutcome, ReanalyzeOutcome};
use crate::communications::{Communication, CommunicationStatus};
use crate::error::{PipelineError, ValidationError};
use crate::hub::HubStats;
use crate::ingestion::SyncReport;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct UserQuery {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct ListQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_list_limit")]
    limit: i64,
}

fn default_list_limit() -> i64 {
    50
}

#[derive(Deserialize)]
pub(super) struct AnalyzeRequest {
    /// Empty means "everything pending for the user".
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct ReanalyzeRequest {
    ids: Vec<String>,
}

#[derive(Deserialize)]
pub(super) struct ExcludeRequest {
    excluded: bool,
}

#[derive(Serialize)]
pub(super) struct CommunicationListResponse {
    communications: Vec<Communication>,
}

#[derive(Serialize)]
pub(super) struct CommunicationDetailResponse {
    communication: Communication,
    analysis: Option<Analysis>,
}

pub(super) async fn sync_provider(
    State(state): State<Arc<ApiState>>,
    Path(provider): Path<String>,
) -> Result<Json<SyncReport>, ApiError> {
    let provider =
        Provider::parse(&provider).ok_or_else(|| ValidationError::UnknownProvider(provider.clone()))?;
    let report = state.hub.sync_now(provider).await?;
    Ok(Json(report))
}

pub(super) async fn list_communications(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<CommunicationListResponse>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(value) => Some(CommunicationStatus::parse(value).ok_or_else(|| {
            ValidationError::InvalidParameter {
                name: "status",
                value: value.to_string(),
            }
        })?),
    };
    let user_id = state.user_or_default(query.user_id);
    let communications = state
        .hub
        .communications()
        .list(&user_id, status, query.limit)
        .await?;

    Ok(Json(CommunicationListResponse { communications }))
}

pub(super) async fn get_communication(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<CommunicationDetailResponse>, ApiError> {
    let communication = state
        .hub
        .communications()
        .get(&id)
        .await?
        .ok_or_else(|| PipelineError::NotFound { id: id.clone() })?;
    let analysis = state.hub.analyses().get_for_communication(&id).await?;

    Ok(Json(CommunicationDetailResponse {
        communication,
        analysis,
    }))
}

pub(super) async fn analyze_pending(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<BatchOutcome>, ApiError> {
    let outcome = if request.ids.is_empty() {
        let user_id = state.user_or_default(request.user_id);
        state.hub.analyze_all_pending(&user_id).await?
    } else {
        state.hub.analyze_pending(&request.ids).await
    };
    Ok(Json(outcome))
}

pub(super) async fn reanalyze(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ReanalyzeRequest>,
) -> Result<Json<ReanalyzeOutcome>, ApiError> {
    if request.ids.is_empty() {
        return Err(ValidationError::MissingField("ids".into()).into());
    }
    Ok(Json(state.hub.reanalyze(&request.ids).await))
}

pub(super) async fn set_excluded(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(request): Json<ExcludeRequest>,
) -> Result<Json<CommunicationDetailResponse>, ApiError> {
    state.hub.set_excluded(&id, request.excluded).await?;
    get_communication(State(state), Path(id)).await
}

pub(super) async fn stats(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<HubStats>, ApiError> {
    let user_id = state.user_or_default(query.user_id);
    Ok(Json(state.hub.stats(&user_id).await?))
}
