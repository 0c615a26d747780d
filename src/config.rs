//! Configuration loading and validation.
//!
//! Values come from an optional TOML file; secrets can be supplied (or
//! overridden) through environment variables so they never need to live on
//! disk.

use crate::error::{ConfigError, Result};

use anyhow::Context as _;
use serde::Deserialize;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Hub configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path.
    pub data_dir: PathBuf,
    pub api: ApiConfig,
    pub llm: LlmConfig,
    pub gmail: GmailConfig,
    pub twilio: TwilioConfig,
    pub pipeline: PipelineConfig,
    pub rollup: RollupConfig,
    pub owner: OwnerConfig,
}

/// HTTP listener and the externally visible URL webhooks are signed against.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    /// Base URL the telephony provider posts to, e.g. `https://hub.example.org`.
    pub public_base_url: String,
}

/// LLM provider configuration (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GmailConfig {
    pub enabled: bool,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub api_base_url: String,
    /// Mail search query used for each sync window.
    pub sync_query: String,
    pub max_results: u32,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TwilioConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub phone_number: Option<String>,
    /// Spoken to callers before the recording starts.
    pub voice_greeting: String,
    pub max_recording_secs: u32,
    pub transcribe: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Communications classified concurrently per batch.
    pub classify_batch_size: usize,
    /// Candidates fetched and normalized concurrently during a mail sync.
    pub ingest_concurrency: usize,
    /// Timeout applied to every provider call.
    pub request_timeout_secs: u64,
    /// Upper bound on one classification, LLM retries included.
    pub classify_timeout_secs: u64,
    /// Rows stuck in `processing` longer than this are failed by the sweep.
    pub stale_processing_secs: u64,
    pub sweep_interval_secs: u64,
    /// Maximum pending rows picked up by one sweep.
    pub sweep_limit: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    /// New processed communications needed before a fresh snapshot.
    pub threshold: i64,
    /// Snapshot age that also triggers generation. Zero disables it.
    pub max_age_hours: u64,
    /// How far back the rollup looks for analysed communications.
    pub window_days: i64,
    pub max_communications: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OwnerConfig {
    /// User every inbound communication is attached to in a single-tenant
    /// deployment.
    pub default_user_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .map(|d| d.join("constituent-hub"))
                .unwrap_or_else(|| PathBuf::from("./data")),
            api: ApiConfig::default(),
            llm: LlmConfig::default(),
            gmail: GmailConfig::default(),
            twilio: TwilioConfig::default(),
            pipeline: PipelineConfig::default(),
            rollup: RollupConfig::default(),
            owner: OwnerConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            public_base_url: "http://localhost:8080".into(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            timeout_secs: 60,
            temperature: 0.2,
        }
    }
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            client_id: None,
            client_secret: None,
            redirect_uri: "http://localhost:8080/api/auth/gmail/callback".into(),
            auth_uri: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token_uri: "https://oauth2.googleapis.com/token".into(),
            api_base_url: "https://gmail.googleapis.com".into(),
            sync_query: "in:inbox newer_than:7d".into(),
            max_results: 50,
            poll_interval_secs: 300,
        }
    }
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: None,
            auth_token: None,
            phone_number: None,
            voice_greeting: "Thank you for calling. Please leave your message after the tone."
                .into(),
            max_recording_secs: 180,
            transcribe: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classify_batch_size: 5,
            ingest_concurrency: 5,
            request_timeout_secs: 30,
            classify_timeout_secs: 180,
            stale_processing_secs: 600,
            sweep_interval_secs: 120,
            sweep_limit: 50,
        }
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            threshold: 4,
            max_age_hours: 4,
            window_days: 30,
            max_communications: 200,
        }
    }
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            default_user_id: "admin".into(),
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_secs(self.classify_timeout_secs.max(1))
    }
}

impl Config {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self> {
        Self::finish(Self::default())
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(error),
        })?;
        Self::finish(Self::from_toml(&raw)?)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|error| ConfigError::Parse(error.to_string()).into())
    }

    fn finish(mut config: Self) -> Result<Self> {
        config.apply_env();
        config.validate()?;

        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!(
                "failed to create data directory: {}",
                config.data_dir.display()
            )
        })?;

        Ok(config)
    }

    fn apply_env(&mut self) {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());

        if let Some(dir) = env("HUB_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(bind) = env("HUB_BIND") {
            self.api.bind = bind;
        }
        if let Some(url) = env("HUB_PUBLIC_BASE_URL") {
            self.api.public_base_url = url;
        }
        if let Some(key) = env("LLM_API_KEY").or_else(|| env("OPENAI_API_KEY")) {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = env("LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = env("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(id) = env("GMAIL_CLIENT_ID") {
            self.gmail.client_id = Some(id);
        }
        if let Some(secret) = env("GMAIL_CLIENT_SECRET") {
            self.gmail.client_secret = Some(secret);
        }
        if let Some(sid) = env("TWILIO_ACCOUNT_SID") {
            self.twilio.account_sid = Some(sid);
        }
        if let Some(token) = env("TWILIO_AUTH_TOKEN") {
            self.twilio.auth_token = Some(token);
        }
        if let Some(number) = env("TWILIO_PHONE_NUMBER") {
            self.twilio.phone_number = Some(number);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.classify_batch_size == 0 {
            return Err(ConfigError::Invalid("pipeline.classify_batch_size must be >= 1".into()).into());
        }
        if self.pipeline.ingest_concurrency == 0 {
            return Err(ConfigError::Invalid("pipeline.ingest_concurrency must be >= 1".into()).into());
        }
        if self.rollup.threshold < 1 {
            return Err(ConfigError::Invalid("rollup.threshold must be >= 1".into()).into());
        }
        if self.owner.default_user_id.trim().is_empty() {
            return Err(ConfigError::MissingKey("owner.default_user_id".into()).into());
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.api
            .bind
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid api.bind: {}", self.api.bind)).into())
    }

    /// Get the SQLite database path.
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("constituent-hub.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_contract() {
        let config = Config::default();
        assert_eq!(config.pipeline.classify_batch_size, 5);
        assert_eq!(config.rollup.threshold, 4);
        assert_eq!(config.rollup.max_age_hours, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config = Config::from_toml(
            r#"
            data_dir = "/tmp/hub"

            [pipeline]
            classify_batch_size = 2

            [rollup]
            threshold = 10

            [twilio]
            phone_number = "+15559999999"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.data_dir, PathBuf::from("/tmp/hub"));
        assert_eq!(config.pipeline.classify_batch_size, 2);
        assert_eq!(config.pipeline.ingest_concurrency, 5);
        assert_eq!(config.rollup.threshold, 10);
        assert_eq!(config.twilio.phone_number.as_deref(), Some("+15559999999"));
        assert_eq!(config.gmail.max_results, 50);
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = Config::default();
        config.pipeline.classify_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_path_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hub.toml");
        std::fs::write(
            &path,
            format!("data_dir = \"{}\"\n", dir.path().join("data").display()),
        )
        .expect("write config");

        let config = Config::load_from_path(&path).expect("config should load");
        assert!(config.data_dir.exists());
    }
}
