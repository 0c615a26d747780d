//! Gmail API v1 client.
//!
//! Tokens live in the [`TokenStore`] as an opaque blob and are reloaded before
//! every call, so a reconnect through the OAuth flow takes effect without a
//! restart. A missing blob is reported as `NOT_CONNECTED`; a refresh the
//! provider refuses is `AUTH_EXPIRED`.

use super::token_store::TokenStore;
use crate::config::GmailConfig;
use crate::error::{ConfigError, ProviderError, Result};
use crate::retry::{RetryPolicy, retry_transient};
use crate::Provider;

use anyhow::Context as _;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use std::time::Duration;

/// Read-only mail scope requested during authorization.
pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Tokens are refreshed this long before they actually expire.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Clone, Serialize, Deserialize)]
pub struct GmailTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for GmailTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GmailTokens")
            .field("access_token", &"[redacted]")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl GmailTokens {
    /// Without a recorded expiry the token is assumed stale.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + chrono::Duration::seconds(EXPIRY_SKEW_SECS),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailHeader {
    pub name: String,
    pub value: String,
}

/// Provider-native message, flattened from the MIME tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMailMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub label_ids: Vec<String>,
    pub snippet: Option<String>,
    pub internal_date_ms: Option<i64>,
    pub headers: Vec<MailHeader>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

impl RawMailMessage {
    /// Header lookup, case-insensitive on the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }
}

/// Read access to a mailbox. The reconciler only depends on this.
#[async_trait::async_trait]
pub trait MailSource: Send + Sync {
    async fn list_inbox(&self, user_id: &str, query: &str, max_results: u32) -> Result<Vec<MessageRef>>;

    async fn fetch_message(&self, user_id: &str, message_id: &str) -> Result<RawMailMessage>;
}

// API response shapes.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStub {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct PartBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl From<MessageDetail> for RawMailMessage {
    fn from(detail: MessageDetail) -> Self {
        let payload = detail.payload.unwrap_or_default();
        Self {
            body_text: find_part_text(&payload, "text/plain"),
            body_html: find_part_text(&payload, "text/html"),
            headers: payload
                .headers
                .into_iter()
                .map(|header| MailHeader {
                    name: header.name,
                    value: header.value,
                })
                .collect(),
            id: detail.id,
            thread_id: detail.thread_id,
            label_ids: detail.label_ids,
            snippet: detail.snippet,
            internal_date_ms: detail.internal_date.and_then(|value| value.parse().ok()),
        }
    }
}

/// Depth-first search for the first part of `mime_type` with a body.
fn find_part_text(part: &MessagePart, mime_type: &str) -> Option<String> {
    if part.mime_type.eq_ignore_ascii_case(mime_type)
        && let Some(text) = part
            .body
            .as_ref()
            .and_then(|body| body.data.as_deref())
            .and_then(decode_body)
    {
        return Some(text);
    }
    part.parts
        .iter()
        .find_map(|child| find_part_text(child, mime_type))
}

/// Gmail bodies are URL-safe base64, sometimes padded.
fn decode_body(data: &str) -> Option<String> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .ok()?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    (!text.trim().is_empty()).then_some(text)
}

pub struct GmailClient {
    http: reqwest::Client,
    config: GmailConfig,
    tokens: TokenStore,
    retry: RetryPolicy,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for GmailClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GmailClient")
            .field("api_base_url", &self.config.api_base_url)
            .finish()
    }
}

impl GmailClient {
    pub fn new(config: &GmailConfig, tokens: TokenStore, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build Gmail HTTP client")?;

        Ok(Self {
            http,
            config: config.clone(),
            tokens,
            retry: RetryPolicy::default(),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    #[cfg(test)]
    fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn client_credentials(&self) -> Result<(&str, &str)> {
        let client_id = self
            .config
            .client_id
            .as_deref()
            .ok_or_else(|| ConfigError::MissingKey("gmail.client_id".into()))?;
        let client_secret = self
            .config
            .client_secret
            .as_deref()
            .ok_or_else(|| ConfigError::MissingKey("gmail.client_secret".into()))?;
        Ok((client_id, client_secret))
    }

    /// Consent-screen URL for the authorization-code flow.
    pub fn authorization_url(&self, state: &str) -> Result<String> {
        let (client_id, _) = self.client_credentials()?;
        Ok(format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&state={}",
            self.config.auth_uri,
            urlencoding::encode(client_id),
            urlencoding::encode(&self.config.redirect_uri),
            urlencoding::encode(GMAIL_READONLY_SCOPE),
            urlencoding::encode(state),
        ))
    }

    /// Trade an authorization code for tokens and persist them.
    pub async fn exchange_auth_code(&self, user_id: &str, code: &str) -> Result<GmailTokens> {
        let (client_id, client_secret) = self.client_credentials()?;
        let form = [
            ("code", code),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];

        let response = self.post_token_form(&form).await?;
        let tokens = GmailTokens {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: response
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scope: response.scope,
        };

        self.tokens.save(Provider::Gmail, user_id, &tokens).await?;
        tracing::info!(user_id, "gmail connected");
        Ok(tokens)
    }

    /// Return `tokens` untouched while still valid, otherwise refresh and
    /// persist the result.
    pub async fn refresh_if_needed(&self, user_id: &str, tokens: GmailTokens) -> Result<GmailTokens> {
        if !tokens.is_expired(Utc::now()) {
            return Ok(tokens);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(current) = self.tokens.load::<GmailTokens>(Provider::Gmail, user_id).await?
            && !current.is_expired(Utc::now())
        {
            return Ok(current);
        }

        let refresh_token = tokens.refresh_token.as_deref().ok_or_else(|| ProviderError::AuthExpired {
            provider: Provider::Gmail,
            message: "access token expired and no refresh token is stored".into(),
        })?;
        let (client_id, client_secret) = self.client_credentials()?;
        let form = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self.post_token_form(&form).await?;
        let refreshed = GmailTokens {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(tokens.refresh_token),
            expires_at: response
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scope: response.scope.or(tokens.scope),
        };

        self.tokens.save(Provider::Gmail, user_id, &refreshed).await?;
        tracing::debug!(user_id, "gmail access token refreshed");
        Ok(refreshed)
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.config.token_uri)
            .form(form)
            .send()
            .await
            .map_err(|error| ProviderError::from_reqwest(Provider::Gmail, error))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let lowered = body.to_lowercase();
            if matches!(status.as_u16(), 400 | 401) && lowered.contains("invalid_grant") {
                return Err(ProviderError::AuthExpired {
                    provider: Provider::Gmail,
                    message: "authorization was revoked or has expired".into(),
                }
                .into());
            }
            return Err(ProviderError::from_status(Provider::Gmail, status.as_u16(), body).into());
        }

        serde_json::from_str(&body).map_err(|error| {
            ProviderError::Permanent {
                provider: Provider::Gmail,
                message: format!("unexpected token response: {error}"),
            }
            .into()
        })
    }

    pub async fn is_connected(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .tokens
            .load::<GmailTokens>(Provider::Gmail, user_id)
            .await?
            .is_some())
    }

    pub async fn disconnect(&self, user_id: &str) -> Result<bool> {
        self.tokens.delete(Provider::Gmail, user_id).await
    }

    async fn access_token(&self, user_id: &str) -> Result<String> {
        let tokens = self
            .tokens
            .load::<GmailTokens>(Provider::Gmail, user_id)
            .await?
            .ok_or(ProviderError::NotConnected {
                provider: Provider::Gmail,
            })?;
        Ok(self.refresh_if_needed(user_id, tokens).await?.access_token)
    }

    /// Authorized GET with transient-failure retry. Tokens are reloaded on
    /// each attempt.
    async fn get_json<T: DeserializeOwned>(
        &self,
        user_id: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!(
            "{}/gmail/v1/users/me/{path}",
            self.config.api_base_url.trim_end_matches('/')
        );
        retry_transient(&self.retry, "gmail_request", || {
            self.get_json_once(user_id, &url, query)
        })
        .await
    }

    async fn get_json_once<T: DeserializeOwned>(
        &self,
        user_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let access_token = self.access_token(user_id).await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&access_token)
            .query(query)
            .send()
            .await
            .map_err(|error| ProviderError::from_reqwest(Provider::Gmail, error))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            let mut error = ProviderError::from_status(Provider::Gmail, status.as_u16(), body);
            if let ProviderError::Transient {
                retry_after_secs: slot,
                ..
            } = &mut error
            {
                *slot = retry_after_secs;
            }
            return Err(error.into());
        }

        let parsed = response
            .json::<T>()
            .await
            .map_err(|error| ProviderError::from_reqwest(Provider::Gmail, error))?;
        Ok(parsed)
    }
}

#[async_trait::async_trait]
impl MailSource for GmailClient {
    async fn list_inbox(&self, user_id: &str, query: &str, max_results: u32) -> Result<Vec<MessageRef>> {
        let list: MessageListResponse = self
            .get_json(
                user_id,
                "messages",
                &[
                    ("q", query.to_string()),
                    ("maxResults", max_results.clamp(1, 500).to_string()),
                ],
            )
            .await?;

        Ok(list
            .messages
            .into_iter()
            .map(|stub| MessageRef {
                id: stub.id,
                thread_id: stub.thread_id,
            })
            .collect())
    }

    async fn fetch_message(&self, user_id: &str, message_id: &str) -> Result<RawMailMessage> {
        let detail: MessageDetail = self
            .get_json(
                user_id,
                &format!("messages/{}", urlencoding::encode(message_id)),
                &[("format", "full".to_string())],
            )
            .await?;
        Ok(detail.into())
    }
}
