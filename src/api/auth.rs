//! Gmail OAuth connect flow.

use super::state::{ApiError, ApiState};
use crate::Provider;
use crate::error::{ProviderError, ValidationError};
use crate::providers::GmailClient;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::Html;
use serde::{Deserialize, Serialize};

use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct UserQuery {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
pub(super) struct AuthUrlResponse {
    url: String,
}

#[derive(Serialize)]
pub(super) struct ConnectionResponse {
    provider: Provider,
    connected: bool,
}

fn gmail(state: &ApiState) -> Result<&GmailClient, ApiError> {
    state.hub.gmail().ok_or_else(|| {
        ApiError::from(ProviderError::NotConnected {
            provider: Provider::Gmail,
        })
    })
}

pub(super) async fn gmail_url(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<AuthUrlResponse>, ApiError> {
    let client = gmail(&state)?;
    let user_id = state.user_or_default(query.user_id);
    let oauth_state = state
        .hub
        .tokens()
        .create_oauth_state(Provider::Gmail, &user_id)
        .await?;

    Ok(Json(AuthUrlResponse {
        url: client.authorization_url(&oauth_state)?,
    }))
}

pub(super) async fn gmail_callback(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Html<&'static str>, ApiError> {
    if let Some(error) = query.error {
        tracing::warn!(%error, "gmail authorization was declined");
        return Err(ValidationError::InvalidParameter {
            name: "error",
            value: error,
        }
        .into());
    }
    let code = query
        .code
        .ok_or_else(|| ValidationError::MissingField("code".into()))?;
    let oauth_state = query
        .state
        .ok_or_else(|| ValidationError::MissingField("state".into()))?;

    let client = gmail(&state)?;
    let user_id = state
        .hub
        .tokens()
        .consume_oauth_state(Provider::Gmail, &oauth_state)
        .await?
        .ok_or(ValidationError::OAuthStateMismatch)?;

    client.exchange_auth_code(&user_id, &code).await?;
    tracing::info!(%user_id, "gmail connected");

    Ok(Html(
        "<!doctype html><html><body><p>Gmail connected. You can close this window.</p></body></html>",
    ))
}

pub(super) async fn gmail_status(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let user_id = state.user_or_default(query.user_id);
    let connected = match state.hub.gmail() {
        Some(client) => client.is_connected(&user_id).await?,
        None => false,
    };
    Ok(Json(ConnectionResponse {
        provider: Provider::Gmail,
        connected,
    }))
}

pub(super) async fn gmail_disconnect(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let client = gmail(&state)?;
    let user_id = state.user_or_default(query.user_id);
    client.disconnect(&user_id).await?;
    tracing::info!(%user_id, "gmail disconnected");

    Ok(Json(ConnectionResponse {
        provider: Provider::Gmail,
        connected: false,
    }))
}
