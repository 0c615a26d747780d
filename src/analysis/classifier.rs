//! Classification pipeline.
//!
//! Every communication that enters here ends in exactly one terminal state:
//! `processed` with one analysis row, `failed` with the reason in metadata,
//! untouched when it is skipped before being claimed, or back in `pending`
//! when a callback replaced its content while the model was running.

use super::model::{ANALYSIS_SCHEMA_VERSION, Analysis, Classification};
use super::store::AnalysisStore;
use crate::communications::{Communication, CommunicationStore};
use crate::config::PipelineConfig;
use crate::error::{ErrorClass, LlmError, PipelineError, Result};
use crate::llm::{CompletionRequest, LlmClient, PromptEngine};
use crate::strategic::StrategicStore;

use anyhow::Context as _;
use futures::future::join_all;
use serde::Serialize;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a communication was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Operator excluded it, or it was detected as automated/system mail.
    Excluded,
    /// Voice call still waiting for its recording or transcription.
    AwaitingContent,
    /// Another worker holds it, or it is already terminal.
    NotPending,
    /// Content changed mid-classification; the row is pending again.
    Superseded,
}

#[derive(Debug, Clone)]
pub enum ClassifyOutcome {
    Processed(Box<Analysis>),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedItem {
    pub id: String,
    pub error: String,
    pub class: ErrorClass,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedItem {
    pub id: String,
    pub reason: SkipReason,
}

/// Per-item results of a batch run. One failure never aborts its siblings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub success: Vec<String>,
    pub failed: Vec<FailedItem>,
    pub skipped: Vec<SkippedItem>,
}

impl BatchOutcome {
    fn record(&mut self, id: String, result: Result<ClassifyOutcome>) {
        match result {
            Ok(ClassifyOutcome::Processed(_)) => self.success.push(id),
            Ok(ClassifyOutcome::Skipped(reason)) => self.skipped.push(SkippedItem { id, reason }),
            Err(error) => self.failed.push(FailedItem {
                id,
                class: error.class(),
                error: error.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReanalyzeOutcome {
    pub reanalyzed: usize,
    pub results: BatchOutcome,
}

/// Fails a claimed row if the classification future is dropped before it
/// reaches a terminal state.
struct ClaimGuard {
    communications: CommunicationStore,
    id: String,
    armed: bool,
}

impl ClaimGuard {
    fn new(communications: CommunicationStore, id: &str) -> Self {
        Self {
            communications,
            id: id.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(communication_id = %self.id, "classification dropped outside a runtime; row left processing");
            return;
        };
        let communications = self.communications.clone();
        let id = std::mem::take(&mut self.id);
        handle.spawn(async move {
            if let Err(error) = communications
                .mark_failed(&id, "classification cancelled")
                .await
            {
                tracing::warn!(communication_id = %id, %error, "failed to release cancelled claim");
            }
        });
    }
}

#[derive(Clone)]
pub struct Classifier {
    communications: CommunicationStore,
    analyses: AnalysisStore,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptEngine>,
    batch_size: usize,
    timeout: Duration,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("model", &self.llm.model_name())
            .field("batch_size", &self.batch_size)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Classifier {
    pub fn new(
        communications: CommunicationStore,
        analyses: AnalysisStore,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptEngine>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            communications,
            analyses,
            llm,
            prompts,
            batch_size: config.classify_batch_size.max(1),
            timeout: config.classify_timeout(),
        }
    }

    /// Classify one communication and persist the result.
    pub async fn classify(&self, id: &str) -> Result<ClassifyOutcome> {
        let communication = self
            .communications
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound { id: id.to_string() })?;

        if communication.is_excluded_from_analysis() {
            tracing::debug!(communication_id = %id, origin = communication.origin.as_str(), "skipping excluded communication");
            return Ok(ClassifyOutcome::Skipped(SkipReason::Excluded));
        }
        if communication.awaiting_content() {
            tracing::debug!(communication_id = %id, "skipping communication without content");
            return Ok(ClassifyOutcome::Skipped(SkipReason::AwaitingContent));
        }
        if !self.communications.claim_for_processing(id).await? {
            tracing::debug!(communication_id = %id, status = %communication.status, "communication not claimable");
            return Ok(ClassifyOutcome::Skipped(SkipReason::NotPending));
        }

        let mut guard = ClaimGuard::new(self.communications.clone(), id);
        let result = self.run_claimed(&communication).await;
        guard.disarm();

        match result {
            Ok(Some(analysis)) => {
                tracing::info!(
                    communication_id = %id,
                    category = %analysis.categories.primary,
                    priority = analysis.priority,
                    sentiment = analysis.sentiment.label.as_str(),
                    processing_time_ms = analysis.processing_time_ms,
                    "communication classified"
                );
                Ok(ClassifyOutcome::Processed(Box::new(analysis)))
            }
            Ok(None) => {
                if !self.requeue(id, &communication.content).await? {
                    self.communications
                        .mark_failed(id, "content changed during classification")
                        .await?;
                }
                Ok(ClassifyOutcome::Skipped(SkipReason::Superseded))
            }
            Err(error) => {
                if matches!(self.requeue(id, &communication.content).await, Ok(true)) {
                    tracing::debug!(communication_id = %id, %error, "failure discarded for superseded content");
                    return Ok(ClassifyOutcome::Skipped(SkipReason::Superseded));
                }
                tracing::warn!(communication_id = %id, %error, class = ?error.class(), "classification failed");
                if let Err(mark_error) = self.communications.mark_failed(id, &error.to_string()).await {
                    tracing::error!(communication_id = %id, error = %mark_error, "failed to mark communication failed");
                }
                Err(error)
            }
        }
    }

    async fn requeue(&self, id: &str, analysed_content: &str) -> Result<bool> {
        let requeued = self
            .communications
            .requeue_superseded(id, analysed_content)
            .await?;
        if requeued {
            tracing::info!(communication_id = %id, "content replaced during classification, requeued");
        }
        Ok(requeued)
    }

    /// `None` when the content changed under the claim and nothing was stored.
    async fn run_claimed(&self, communication: &Communication) -> Result<Option<Analysis>> {
        let started = Instant::now();

        let request = CompletionRequest::json(
            self.prompts.classify_system()?,
            self.prompts.classify_user(
                communication.kind.as_str(),
                &communication.sender,
                communication.subject.as_deref(),
                &communication.content,
            )?,
        );

        let reply = tokio::time::timeout(self.timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                secs: self.timeout.as_secs(),
            })??;

        let classification = Classification::parse(&reply)?;
        let processing_time_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let analysis = Analysis::from_classification(
            &communication.id,
            classification,
            processing_time_ms,
            format!("{ANALYSIS_SCHEMA_VERSION}+{}", self.llm.model_name()),
        );

        if !self.persist(communication, &analysis).await? {
            return Ok(None);
        }
        Ok(Some(analysis))
    }

    /// Analysis row, status flip, and rollup counter commit together, or not
    /// at all when the stored content is no longer what was analysed.
    async fn persist(&self, communication: &Communication, analysis: &Analysis) -> Result<bool> {
        let mut tx = self
            .communications
            .pool()
            .begin()
            .await
            .context("failed to open classification transaction")?;

        AnalysisStore::insert_in(&mut *tx, analysis).await?;

        if !CommunicationStore::mark_processed_in(
            &mut *tx,
            &communication.id,
            &communication.content,
        )
        .await?
        {
            return Ok(false);
        }

        StrategicStore::increment_counter_in(&mut *tx, &communication.user_id).await?;

        tx.commit()
            .await
            .context("failed to commit classification transaction")?;
        Ok(true)
    }

    /// Classify in chunks of `batch_size`: concurrent within a chunk,
    /// sequential across chunks.
    pub async fn classify_many(&self, ids: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for chunk in ids.chunks(self.batch_size) {
            let results = join_all(
                chunk
                    .iter()
                    .map(|id| async move { (id.clone(), self.classify(id).await) }),
            )
            .await;

            for (id, result) in results {
                outcome.record(id, result);
            }
        }

        tracing::info!(
            requested = ids.len(),
            success = outcome.success.len(),
            failed = outcome.failed.len(),
            skipped = outcome.skipped.len(),
            "classification batch finished"
        );
        outcome
    }

    /// Drop the existing analysis and return the row to `pending`. Refuses
    /// rows currently being processed.
    pub async fn reset_for_reanalysis(&self, id: &str) -> Result<bool> {
        let mut tx = self
            .communications
            .pool()
            .begin()
            .await
            .context("failed to open reanalysis transaction")?;

        let reset = CommunicationStore::reset_to_pending_in(&mut *tx, id).await?;
        if reset {
            AnalysisStore::delete_for_communication_in(&mut *tx, id).await?;
        }

        tx.commit()
            .await
            .context("failed to commit reanalysis transaction")?;
        Ok(reset)
    }

    /// Reset then reclassify each id. `reanalyzed` counts the ids that ended
    /// up with a fresh analysis.
    pub async fn reanalyze(&self, ids: &[String]) -> ReanalyzeOutcome {
        let mut results = BatchOutcome::default();
        let mut ready = Vec::with_capacity(ids.len());

        for id in ids {
            match self.reset_for_reanalysis(id).await {
                Ok(true) => ready.push(id.clone()),
                Ok(false) => match self.communications.get(id).await {
                    Ok(Some(_)) => results.record(id.clone(), Ok(ClassifyOutcome::Skipped(SkipReason::NotPending))),
                    Ok(None) => results.record(
                        id.clone(),
                        Err(PipelineError::NotFound { id: id.clone() }.into()),
                    ),
                    Err(error) => results.record(id.clone(), Err(error)),
                },
                Err(error) => results.record(id.clone(), Err(error)),
            }
        }

        let classified = self.classify_many(&ready).await;
        results.success.extend(classified.success);
        results.failed.extend(classified.failed);
        results.skipped.extend(classified.skipped);

        ReanalyzeOutcome {
            reanalyzed: results.success.len(),
            results,
        }
    }

    pub fn analyses(&self) -> &AnalysisStore {
        &self.analyses
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::analysis::model::tests::POSITIVE_REPLY;
    use crate::communications::store::tests::sms_draft;
    use crate::communications::{CommunicationStatus, Origin};
    use crate::db::Db;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays canned replies in order, repeating the last one.
    pub(crate) struct ScriptedLlm {
        replies: Mutex<Vec<Result<String>>>,
        pub(crate) calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedLlm {
        pub(crate) fn always(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(vec![Ok(reply.to_string())]),
                calls: AtomicUsize::new(0),
                delay: None,
            })
        }

        pub(crate) fn sequence(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
                delay: None,
            })
        }

        fn slow(reply: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(vec![Ok(reply.to_string())]),
                calls: AtomicUsize::new(0),
                delay: Some(delay),
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _request: CompletionRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                return replies.remove(0);
            }
            match replies.first() {
                Some(Ok(reply)) => Ok(reply.clone()),
                Some(Err(_)) | None => Err(LlmError::EmptyResponse.into()),
            }
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    async fn setup(llm: Arc<dyn LlmClient>) -> (Classifier, CommunicationStore, StrategicStore) {
        let db = Db::connect_in_memory().await.expect("in-memory sqlite");
        let communications = CommunicationStore::new(db.sqlite.clone());
        let strategic = StrategicStore::new(db.sqlite.clone());
        let config = PipelineConfig {
            classify_timeout_secs: 1,
            ..PipelineConfig::default()
        };
        let classifier = Classifier::new(
            communications.clone(),
            AnalysisStore::new(db.sqlite.clone()),
            llm,
            Arc::new(PromptEngine::new().unwrap()),
            &config,
        );
        (classifier, communications, strategic)
    }

    async fn insert(store: &CommunicationStore, source_id: &str, body: &str) -> String {
        store
            .insert_if_absent("user-1", &sms_draft(source_id, body))
            .await
            .unwrap()
            .into_communication()
            .id
    }

    #[tokio::test]
    async fn classifies_positive_sms() {
        let (classifier, store, _) = setup(ScriptedLlm::always(POSITIVE_REPLY)).await;
        let id = insert(&store, "SM1", "Thanks for your help!").await;

        let outcome = classifier.classify(&id).await.unwrap();
        let ClassifyOutcome::Processed(analysis) = outcome else {
            panic!("expected processed outcome");
        };
        assert_eq!(analysis.sentiment.label.as_str(), "positive");
        assert!(analysis.version.ends_with("scripted"));

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommunicationStatus::Processed);
        assert_eq!(classifier.analyses().count_for_communication(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn excluded_rows_are_never_sent_to_the_model() {
        let llm = ScriptedLlm::always(POSITIVE_REPLY);
        let (classifier, store, _) = setup(llm.clone()).await;

        let mut automated = sms_draft("SM1", "Your verification code is 1234");
        automated.origin = Origin::Automated;
        let automated_id = store
            .insert_if_absent("user-1", &automated)
            .await
            .unwrap()
            .into_communication()
            .id;

        let manual_id = insert(&store, "SM2", "Please fix the streetlight").await;
        store.set_excluded(&manual_id, true).await.unwrap();

        let outcome = classifier
            .classify_many(&[automated_id.clone(), manual_id.clone()])
            .await;

        assert_eq!(outcome.skipped.len(), 2);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        for id in [automated_id, manual_id] {
            let stored = store.get(&id).await.unwrap().unwrap();
            assert_eq!(stored.status, CommunicationStatus::Pending);
        }
    }

    #[tokio::test]
    async fn empty_call_waits_for_content() {
        let llm = ScriptedLlm::always(POSITIVE_REPLY);
        let (classifier, store, _) = setup(llm.clone()).await;
        let id = insert(&store, "CA1", "").await;

        let outcome = classifier.classify(&id).await.unwrap();
        assert!(matches!(outcome, ClassifyOutcome::Skipped(SkipReason::AwaitingContent)));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_output_fails_without_an_analysis() {
        let (classifier, store, _) =
            setup(ScriptedLlm::always(r#"{"sentiment": {"label": "meh"}}"#)).await;
        let id = insert(&store, "SM1", "The bridge is closed again").await;

        let error = classifier.classify(&id).await.unwrap_err();
        assert_eq!(error.class(), ErrorClass::Validation);

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommunicationStatus::Failed);
        assert!(stored.metadata.last_error.is_some());
        assert_eq!(classifier.analyses().count_for_communication(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn slow_model_times_out_and_fails() {
        let (classifier, store, _) =
            setup(ScriptedLlm::slow(POSITIVE_REPLY, Duration::from_secs(5))).await;
        let id = insert(&store, "SM1", "Hello").await;

        let error = classifier.classify(&id).await.unwrap_err();
        assert!(error.to_string().contains("timed out"));
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommunicationStatus::Failed);
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let mut replies: Vec<Result<String>> =
            (0..4).map(|_| Ok(POSITIVE_REPLY.to_string())).collect();
        replies.insert(2, Ok("not json at all".to_string()));
        let (classifier, store, _) = setup(ScriptedLlm::sequence(replies)).await;

        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(insert(&store, &format!("SM{n}"), "Message body").await);
        }

        let outcome = classifier.classify_many(&ids).await;
        assert_eq!(outcome.success.len(), 4);
        assert_eq!(outcome.failed.len(), 1);
        assert!(outcome.skipped.is_empty());

        let failed = store.get(&outcome.failed[0].id).await.unwrap().unwrap();
        assert_eq!(failed.status, CommunicationStatus::Failed);
        for id in &outcome.success {
            let status = store.get(id).await.unwrap().unwrap().status;
            assert_eq!(status, CommunicationStatus::Processed);
            assert_eq!(classifier.analyses().count_for_communication(id).await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn transcript_arriving_mid_classification_is_requeued() {
        let (classifier, store, _) =
            setup(ScriptedLlm::slow(POSITIVE_REPLY, Duration::from_millis(300))).await;
        let mut recording = sms_draft(
            "CA1",
            "Voicemail recording (9 seconds). Transcription not yet available.",
        );
        recording.kind = crate::communications::CommunicationKind::Call;
        let id = store
            .upsert_by_source("user-1", &recording)
            .await
            .unwrap()
            .communication
            .id;

        let transcript = crate::communications::CommunicationDraft {
            content: "Bridge on Elm collapsed, people hurt".into(),
            ..recording.clone()
        };
        let (outcome, upsert) = tokio::join!(classifier.classify(&id), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.upsert_by_source("user-1", &transcript).await
        });
        assert_eq!(upsert.unwrap().previous_status, Some(CommunicationStatus::Processing));
        assert!(matches!(
            outcome.unwrap(),
            ClassifyOutcome::Skipped(SkipReason::Superseded)
        ));

        let requeued = store.get(&id).await.unwrap().unwrap();
        assert_eq!(requeued.status, CommunicationStatus::Pending);
        assert_eq!(classifier.analyses().count_for_communication(&id).await.unwrap(), 0);
        assert_eq!(store.list_analyzable_ids("user-1", 10).await.unwrap(), vec![id.clone()]);

        assert!(matches!(
            classifier.classify(&id).await.unwrap(),
            ClassifyOutcome::Processed(_)
        ));
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().status,
            CommunicationStatus::Processed
        );
    }

    #[tokio::test]
    async fn concurrent_classification_of_one_row_yields_one_analysis() {
        let (classifier, store, _) = setup(ScriptedLlm::always(POSITIVE_REPLY)).await;
        let id = insert(&store, "SM1", "Thanks!").await;

        let (first, second) = tokio::join!(classifier.classify(&id), classifier.classify(&id));
        let processed = [first.unwrap(), second.unwrap()]
            .iter()
            .filter(|outcome| matches!(outcome, ClassifyOutcome::Processed(_)))
            .count();

        assert_eq!(processed, 1);
        assert_eq!(classifier.analyses().count_for_communication(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reanalysis_replaces_the_analysis() {
        let (classifier, store, _) = setup(ScriptedLlm::always(POSITIVE_REPLY)).await;
        let id = insert(&store, "SM1", "Thanks!").await;
        classifier.classify(&id).await.unwrap();

        let first = classifier.reanalyze(std::slice::from_ref(&id)).await;
        let second = classifier.reanalyze(std::slice::from_ref(&id)).await;

        assert_eq!(first.reanalyzed, 1);
        assert_eq!(second.reanalyzed, 1);
        assert_eq!(classifier.analyses().count_for_communication(&id).await.unwrap(), 1);
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().status,
            CommunicationStatus::Processed
        );
    }

    #[tokio::test]
    async fn processed_rows_bump_the_rollup_counter() {
        let (classifier, store, strategic) = setup(ScriptedLlm::always(POSITIVE_REPLY)).await;
        strategic
            .insert(&crate::strategic::store::tests::empty_snapshot("user-1"))
            .await
            .unwrap();

        let ids = vec![
            insert(&store, "SM1", "one").await,
            insert(&store, "SM2", "two").await,
        ];
        classifier.classify_many(&ids).await;

        let latest = strategic.latest("user-1").await.unwrap().unwrap();
        assert_eq!(latest.new_communications_count, 2);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (classifier, _, _) = setup(ScriptedLlm::always(POSITIVE_REPLY)).await;
        let error = classifier.classify("missing").await.unwrap_err();
        assert_eq!(error.code(), "NOT_FOUND");
    }
}
