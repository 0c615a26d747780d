//! Telephony webhooks. Every payload is signature-checked before anything
//! else looks at it.

use super::state::{ApiError, ApiState};
use crate::error::ValidationError;
use crate::providers::twilio::{
    self, FormParams, SIGNATURE_HEADER, TwilioEvent, WebhookKind,
};

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Uri, header};
use axum::response::{IntoResponse, Response};

use std::sync::Arc;

const RECORDING_PATH: &str = "/webhooks/twilio/recording";
const TRANSCRIPTION_PATH: &str = "/webhooks/twilio/transcription";

/// The URL the provider signed: the public base plus the request path and
/// query exactly as received.
fn signed_url(state: &ApiState, uri: &Uri) -> String {
    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |path| path.as_str());
    format!(
        "{}{path}",
        state.hub.config().api.public_base_url.trim_end_matches('/')
    )
}

fn public_url(state: &ApiState, path: &str) -> String {
    format!(
        "{}{path}",
        state.hub.config().api.public_base_url.trim_end_matches('/')
    )
}

fn verify(
    state: &ApiState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
    kind: WebhookKind,
) -> Result<TwilioEvent, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let url = signed_url(state, uri);

    let verified = state
        .hub
        .webhook_verifier()
        .is_some_and(|verifier| verifier.verify(&url, body, signature));
    if !verified {
        tracing::warn!(?kind, %url, has_signature = signature.is_some(), "rejected unsigned or mis-signed webhook");
        return Err(ValidationError::InvalidSignature.into());
    }

    let params = FormParams::parse(body);
    Ok(TwilioEvent::parse(kind, &params)?)
}

fn twiml(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/xml; charset=utf-8")], body).into_response()
}

pub(super) async fn voice(
    State(state): State<Arc<ApiState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let event = verify(&state, &uri, &headers, &body, WebhookKind::Voice)?;
    state.hub.handle_webhook(&event).await?;

    let config = &state.hub.config().twilio;
    let transcribe_callback = config
        .transcribe
        .then(|| public_url(&state, TRANSCRIPTION_PATH));
    Ok(twiml(twilio::voice_twiml(
        &config.voice_greeting,
        &public_url(&state, RECORDING_PATH),
        transcribe_callback.as_deref(),
        config.max_recording_secs,
    )))
}

pub(super) async fn recording(
    State(state): State<Arc<ApiState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let event = verify(&state, &uri, &headers, &body, WebhookKind::Recording)?;
    state.hub.handle_webhook(&event).await?;
    Ok(twiml(twilio::recording_ack_twiml()))
}

pub(super) async fn transcription(
    State(state): State<Arc<ApiState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let event = verify(&state, &uri, &headers, &body, WebhookKind::Transcription)?;
    state.hub.handle_webhook(&event).await?;
    Ok(twiml(twilio::empty_twiml()))
}

pub(super) async fn sms(
    State(state): State<Arc<ApiState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let event = verify(&state, &uri, &headers, &body, WebhookKind::Sms)?;
    state.hub.handle_webhook(&event).await?;
    Ok(twiml(twilio::empty_twiml()))
}
