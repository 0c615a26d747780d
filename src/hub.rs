//! The hub facade: wires stores, provider clients, the classifier, and the
//! rollup engine together, and exposes the operations the API and CLI call.

use crate::analysis::{AnalysisStore, BatchOutcome, ClassifyOutcome, Classifier, ReanalyzeOutcome};
use crate::communications::CommunicationStore;
use crate::config::Config;
use crate::error::{PipelineError, ProviderError, Result};
use crate::ingestion::{InboxOwnerResolver, Reconciler, SingleTenantOwner, SyncReport, WebhookOutcome};
use crate::llm::{LlmClient, OpenAiCompatibleClient, PromptEngine};
use crate::providers::{GmailClient, MailSource, TokenStore, TwilioEvent, TwilioWebhookVerifier};
use crate::strategic::{RollupEngine, StrategicAnalysis, StrategicStore};
use crate::Provider;

use serde::Serialize;
use sqlx::SqlitePool;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Externally constructed collaborators. Everything else the hub needs is
/// derived from these and the config.
#[derive(Clone)]
pub struct HubDeps {
    pub pool: SqlitePool,
    pub llm: Arc<dyn LlmClient>,
    pub owners: Arc<dyn InboxOwnerResolver>,
    /// Mail source used by syncs. Usually the Gmail client below.
    pub mail: Option<Arc<dyn MailSource>>,
    /// Needed for the OAuth connect flow.
    pub gmail: Option<Arc<GmailClient>>,
    pub webhook_verifier: Option<TwilioWebhookVerifier>,
}

impl HubDeps {
    /// Build the production clients from configuration.
    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let llm: Arc<dyn LlmClient> = Arc::new(OpenAiCompatibleClient::new(&config.llm)?);

        let gmail = if config.gmail.enabled {
            let client = GmailClient::new(
                &config.gmail,
                TokenStore::new(pool.clone()),
                config.pipeline.request_timeout(),
            )?;
            Some(Arc::new(client))
        } else {
            tracing::info!("gmail disabled, mail sync will not run");
            None
        };

        let webhook_verifier = config
            .twilio
            .auth_token
            .as_deref()
            .map(TwilioWebhookVerifier::new);
        if webhook_verifier.is_none() {
            tracing::warn!("no twilio auth token configured, telephony webhooks will be rejected");
        }

        Ok(Self {
            pool,
            llm,
            owners: Arc::new(SingleTenantOwner::new(config.owner.default_user_id.clone())),
            mail: gmail.clone().map(|client| client as Arc<dyn MailSource>),
            gmail,
            webhook_verifier,
        })
    }
}

/// Latest snapshot plus how much has accrued since it.
#[derive(Debug, Clone, Serialize)]
pub struct LatestStrategic {
    pub analysis: Option<StrategicAnalysis>,
    pub pending_count: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HubStats {
    pub by_status: BTreeMap<String, i64>,
    pub by_source: BTreeMap<String, i64>,
    pub by_kind: BTreeMap<String, i64>,
    pub by_category: BTreeMap<String, i64>,
    pub by_sentiment: BTreeMap<String, i64>,
}

#[derive(Clone)]
pub struct Hub {
    config: Arc<Config>,
    communications: CommunicationStore,
    tokens: TokenStore,
    classifier: Classifier,
    rollup: RollupEngine,
    reconciler: Reconciler,
    mail: Option<Arc<dyn MailSource>>,
    gmail: Option<Arc<GmailClient>>,
    webhook_verifier: Option<TwilioWebhookVerifier>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("classifier", &self.classifier)
            .field("rollup", &self.rollup)
            .field("mail", &self.mail.is_some())
            .field("webhooks", &self.webhook_verifier.is_some())
            .finish()
    }
}

impl Hub {
    pub fn new(config: Arc<Config>, deps: HubDeps) -> Result<Self> {
        let prompts = Arc::new(PromptEngine::new()?);
        let communications = CommunicationStore::new(deps.pool.clone());
        let analyses = AnalysisStore::new(deps.pool.clone());

        let classifier = Classifier::new(
            communications.clone(),
            analyses.clone(),
            deps.llm.clone(),
            prompts.clone(),
            &config.pipeline,
        );
        let rollup = RollupEngine::new(
            StrategicStore::new(deps.pool.clone()),
            analyses,
            communications.clone(),
            deps.llm,
            prompts,
            config.rollup,
            config.pipeline.classify_timeout(),
        );
        let reconciler = Reconciler::new(
            communications.clone(),
            classifier.clone(),
            deps.owners,
            config.pipeline.ingest_concurrency,
        );

        Ok(Self {
            config,
            communications,
            tokens: TokenStore::new(deps.pool),
            classifier,
            rollup,
            reconciler,
            mail: deps.mail,
            gmail: deps.gmail,
            webhook_verifier: deps.webhook_verifier,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn default_user(&self) -> &str {
        &self.config.owner.default_user_id
    }

    pub fn communications(&self) -> &CommunicationStore {
        &self.communications
    }

    pub fn analyses(&self) -> &AnalysisStore {
        self.classifier.analyses()
    }

    pub fn strategic(&self) -> &StrategicStore {
        self.rollup.store()
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn gmail(&self) -> Option<&GmailClient> {
        self.gmail.as_deref()
    }

    pub fn webhook_verifier(&self) -> Option<&TwilioWebhookVerifier> {
        self.webhook_verifier.as_ref()
    }

    /// Pull the provider's current window into the store. Telephony is
    /// push-only, so syncing it is a no-op.
    pub async fn sync_now(&self, provider: Provider) -> Result<SyncReport> {
        match provider {
            Provider::Gmail => {
                let mail = self.mail.as_deref().ok_or(ProviderError::NotConnected {
                    provider: Provider::Gmail,
                })?;
                self.reconciler
                    .reconcile_batch(mail, &self.config.gmail.sync_query, self.config.gmail.max_results)
                    .await
            }
            Provider::Twilio => {
                tracing::debug!("twilio delivers by webhook, nothing to sync");
                Ok(SyncReport::default())
            }
        }
    }

    pub async fn handle_webhook(&self, event: &TwilioEvent) -> Result<WebhookOutcome> {
        self.reconciler.reconcile_webhook_event(event).await
    }

    pub async fn classify(&self, id: &str) -> Result<ClassifyOutcome> {
        self.classifier.classify(id).await
    }

    /// Classify the given ids. Per-item failures are reported, never raised.
    pub async fn analyze_pending(&self, ids: &[String]) -> BatchOutcome {
        self.classifier.classify_many(ids).await
    }

    /// Classify whatever is pending for `user_id`, up to the sweep limit.
    pub async fn analyze_all_pending(&self, user_id: &str) -> Result<BatchOutcome> {
        let ids = self
            .communications
            .list_analyzable_ids(user_id, self.config.pipeline.sweep_limit)
            .await?;
        if ids.is_empty() {
            return Ok(BatchOutcome::default());
        }
        Ok(self.analyze_pending(&ids).await)
    }

    pub async fn reanalyze(&self, ids: &[String]) -> ReanalyzeOutcome {
        self.classifier.reanalyze(ids).await
    }

    /// Operator override. Excluding a row keeps it out of every future
    /// classification; an existing analysis is left in place.
    pub async fn set_excluded(&self, id: &str, excluded: bool) -> Result<()> {
        if !self.communications.set_excluded(id, excluded).await? {
            return Err(PipelineError::NotFound { id: id.to_string() }.into());
        }
        tracing::info!(communication_id = id, excluded, "analysis exclusion updated");
        Ok(())
    }

    pub async fn latest_strategic_analysis(&self, user_id: &str) -> Result<LatestStrategic> {
        Ok(LatestStrategic {
            analysis: self.rollup.store().latest(user_id).await?,
            pending_count: self.rollup.pending_since_last(user_id).await?,
        })
    }

    pub async fn should_generate_strategic(&self, user_id: &str) -> Result<bool> {
        self.rollup.should_generate(user_id).await
    }

    /// Generate a snapshot when the gate allows it, or always with `force`.
    pub async fn refresh_strategic(&self, user_id: &str, force: bool) -> Result<Option<StrategicAnalysis>> {
        self.rollup.refresh(user_id, force).await
    }

    pub async fn stats(&self, user_id: &str) -> Result<HubStats> {
        let analyses = self.classifier.analyses();
        Ok(HubStats {
            by_status: self.communications.count_by_status(user_id).await?.into_iter().collect(),
            by_source: self.communications.count_by_source(user_id).await?.into_iter().collect(),
            by_kind: self.communications.count_by_kind(user_id).await?.into_iter().collect(),
            by_category: analyses.count_by_category(user_id).await?.into_iter().collect(),
            by_sentiment: analyses.count_by_sentiment(user_id).await?.into_iter().collect(),
        })
    }

    /// Fail rows whose classification has been running longer than the grace
    /// period. A crash mid-classification leaves them behind.
    pub async fn recover_stale(&self) -> Result<u64> {
        let grace = chrono::Duration::seconds(self.config.pipeline.stale_processing_secs as i64);
        let recovered = self
            .communications
            .recover_stale_processing(chrono::Utc::now() - grace)
            .await?;
        if recovered > 0 {
            tracing::warn!(recovered, "failed stale processing claims");
        }
        Ok(recovered)
    }

    /// One pass of background work for `user_id`: optional mail sync, stale
    /// recovery, pending sweep, gated rollup. Each step logs and continues.
    pub async fn run_cycle(&self, user_id: &str, sync_mail: bool) {
        if sync_mail && self.mail.is_some() {
            match self.sync_now(Provider::Gmail).await {
                Ok(report) => tracing::debug!(new = report.new_count, "background mail sync"),
                Err(error) => tracing::warn!(%error, code = error.code(), "background mail sync failed"),
            }
        }

        if let Err(error) = self.recover_stale().await {
            tracing::warn!(%error, "stale claim recovery failed");
        }

        match self.analyze_all_pending(user_id).await {
            Ok(outcome) if !outcome.success.is_empty() || !outcome.failed.is_empty() => {
                tracing::info!(
                    success = outcome.success.len(),
                    failed = outcome.failed.len(),
                    "background classification sweep"
                );
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "pending sweep failed"),
        }

        match self.refresh_strategic(user_id, false).await {
            Ok(Some(snapshot)) => tracing::info!(snapshot_id = %snapshot.id, "background rollup generated"),
            Ok(None) => {}
            Err(error) => tracing::warn!(%error, "background rollup failed"),
        }
    }

    /// Run [`Hub::run_cycle`] on the sweep interval until `shutdown` flips.
    pub fn spawn_background(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let user_id = hub.default_user().to_string();
            let sweep_every = Duration::from_secs(hub.config.pipeline.sweep_interval_secs.max(1));
            let sync_every = Duration::from_secs(hub.config.gmail.poll_interval_secs.max(1));

            let mut ticker = tokio::time::interval(sweep_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_sync: Option<tokio::time::Instant> = None;

            tracing::info!(?sweep_every, ?sync_every, "background loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let sync_mail = last_sync.is_none_or(|at| at.elapsed() >= sync_every);
                if sync_mail {
                    last_sync = Some(tokio::time::Instant::now());
                }
                hub.run_cycle(&user_id, sync_mail).await;
            }
            tracing::info!("background loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::classifier::tests::ScriptedLlm;
    use crate::analysis::model::tests::POSITIVE_REPLY;
    use crate::communications::CommunicationStatus;
    use crate::communications::store::tests::sms_draft;
    use crate::db::Db;

    async fn setup_hub() -> Hub {
        let db = Db::connect_in_memory().await.expect("in-memory sqlite");
        let deps = HubDeps {
            pool: db.sqlite,
            llm: ScriptedLlm::always(POSITIVE_REPLY),
            owners: Arc::new(SingleTenantOwner::new("admin")),
            mail: None,
            gmail: None,
            webhook_verifier: None,
        };
        Hub::new(Arc::new(Config::default()), deps).unwrap()
    }

    #[tokio::test]
    async fn gmail_sync_without_client_is_not_connected() {
        let hub = setup_hub().await;
        let error = hub.sync_now(Provider::Gmail).await.unwrap_err();
        assert_eq!(error.code(), "NOT_CONNECTED");

        let report = hub.sync_now(Provider::Twilio).await.unwrap();
        assert_eq!((report.total, report.new_count), (0, 0));
    }

    #[tokio::test]
    async fn cycle_classifies_pending_rows() {
        let hub = setup_hub().await;
        let id = hub
            .communications()
            .insert_if_absent("admin", &sms_draft("SM1", "Thanks for your help!"))
            .await
            .unwrap()
            .into_communication()
            .id;

        let before = hub.latest_strategic_analysis("admin").await.unwrap();
        assert!(before.analysis.is_none());
        assert_eq!(before.pending_count, 0);
        assert!(hub.should_generate_strategic("admin").await.unwrap());

        hub.run_cycle("admin", true).await;

        let stored = hub.communications().get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommunicationStatus::Processed);

        let stats = hub.stats("admin").await.unwrap();
        assert_eq!(stats.by_status.get("processed"), Some(&1));
        assert_eq!(stats.by_sentiment.get("positive"), Some(&1));
    }

    #[tokio::test]
    async fn reanalyze_unknown_id_reports_failure() {
        let hub = setup_hub().await;
        let outcome = hub.reanalyze(&["missing".to_string()]).await;
        assert_eq!(outcome.reanalyzed, 0);
        assert_eq!(outcome.results.failed.len(), 1);
    }
}
