//! Dedup-and-idempotency core of ingestion.
//!
//! Everything keys on `(source_id, source, user_id)`. Mail syncs insert only
//! what is missing; voice webhooks upsert so that the call-started, recording,
//! and transcription callbacks for one call converge on a single row.

use super::owner::InboxOwnerResolver;
use crate::analysis::Classifier;
use crate::communications::{Communication, CommunicationStatus, CommunicationStore};
use crate::error::{ErrorClass, Result};
use crate::normalize;
use crate::providers::twilio::TwilioEvent;
use crate::providers::{MailSource, MessageRef};
use crate::Provider;

use futures::StreamExt as _;
use serde::Serialize;

use std::sync::Arc;

/// Gmail's alias for the authenticated mailbox.
const GMAIL_SELF: &str = "me";

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub source_id: String,
    pub error: String,
    pub class: ErrorClass,
}

/// Aggregate result of one mail sync.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Candidates the provider returned.
    pub total: usize,
    #[serde(rename = "new")]
    pub new_count: usize,
    pub failed: Vec<ItemFailure>,
}

#[derive(Debug, Clone)]
pub struct WebhookOutcome {
    pub communication: Communication,
    pub created: bool,
    /// The row had been analysed on older content and was sent back to
    /// `pending`.
    pub reset_for_reanalysis: bool,
}

#[derive(Clone)]
pub struct Reconciler {
    communications: CommunicationStore,
    classifier: Classifier,
    owners: Arc<dyn InboxOwnerResolver>,
    concurrency: usize,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        communications: CommunicationStore,
        classifier: Classifier,
        owners: Arc<dyn InboxOwnerResolver>,
        concurrency: usize,
    ) -> Self {
        Self {
            communications,
            classifier,
            owners,
            concurrency: concurrency.max(1),
        }
    }

    /// Pull the current inbox window and insert every message not yet stored.
    ///
    /// Listing errors propagate (an expired token must surface as such).
    /// Failures on individual candidates are collected and the rest continue.
    pub async fn reconcile_batch(
        &self,
        mail: &dyn MailSource,
        query: &str,
        max_results: u32,
    ) -> Result<SyncReport> {
        let user_id = self
            .owners
            .resolve_inbox_owner(Provider::Gmail, GMAIL_SELF)
            .await?;
        let candidates = mail.list_inbox(&user_id, query, max_results).await?;

        let total = candidates.len();
        let user_id = user_id.as_str();
        let results: Vec<(String, Result<bool>)> = futures::stream::iter(candidates)
            .map(move |reference: MessageRef| async move {
                let result = self.ingest_candidate(mail, user_id, &reference).await;
                (reference.id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = SyncReport {
            total,
            ..SyncReport::default()
        };
        for (source_id, result) in results {
            match result {
                Ok(true) => report.new_count += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(%source_id, %error, "failed to ingest message");
                    report.failed.push(ItemFailure {
                        source_id,
                        class: error.class(),
                        error: error.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            user_id,
            total = report.total,
            new = report.new_count,
            failed = report.failed.len(),
            "mail sync finished"
        );
        Ok(report)
    }

    /// Returns whether a new row was created.
    async fn ingest_candidate(
        &self,
        mail: &dyn MailSource,
        user_id: &str,
        reference: &MessageRef,
    ) -> Result<bool> {
        if self
            .communications
            .exists(user_id, Provider::Gmail, &reference.id)
            .await?
        {
            tracing::debug!(source_id = %reference.id, "message already ingested");
            return Ok(false);
        }

        let message = mail.fetch_message(user_id, &reference.id).await?;
        let draft = normalize::normalize_mail(&message);
        let outcome = self.communications.insert_if_absent(user_id, &draft).await?;
        if !outcome.is_new() {
            tracing::debug!(source_id = %reference.id, "message ingested concurrently");
        }
        Ok(outcome.is_new())
    }

    /// Apply one verified telephony webhook.
    pub async fn reconcile_webhook_event(&self, event: &TwilioEvent) -> Result<WebhookOutcome> {
        let account = match event {
            TwilioEvent::CallStarted(call) => call.to.as_deref(),
            TwilioEvent::RecordingCompleted(recording) => recording.to.as_deref(),
            TwilioEvent::TranscriptionCompleted(transcription) => transcription.to.as_deref(),
            TwilioEvent::SmsReceived(sms) => sms.to.as_deref(),
        }
        .unwrap_or_default();
        let user_id = self
            .owners
            .resolve_inbox_owner(Provider::Twilio, account)
            .await?;

        let draft = match event {
            TwilioEvent::SmsReceived(sms) => {
                let draft = normalize::normalize_sms(sms);
                let outcome = self.communications.insert_if_absent(&user_id, &draft).await?;
                let created = outcome.is_new();
                tracing::info!(source_id = %draft.source_id, created, "sms received");
                return Ok(WebhookOutcome {
                    communication: outcome.into_communication(),
                    created,
                    reset_for_reanalysis: false,
                });
            }
            TwilioEvent::CallStarted(call) => normalize::normalize_call_started(call),
            TwilioEvent::RecordingCompleted(recording) => normalize::normalize_recording(recording),
            TwilioEvent::TranscriptionCompleted(transcription) => {
                normalize::normalize_transcription(transcription)
            }
        };

        let upsert = self.communications.upsert_by_source(&user_id, &draft).await?;
        let mut communication = upsert.communication;

        let analysed_on_stale_content = upsert.content_changed
            && matches!(
                upsert.previous_status,
                Some(CommunicationStatus::Processed | CommunicationStatus::Failed)
            );
        let mut reset = false;
        if analysed_on_stale_content {
            reset = self.classifier.reset_for_reanalysis(&communication.id).await?;
            if let Some(refreshed) = self.communications.get(&communication.id).await? {
                communication = refreshed;
            }
        } else if upsert.content_changed
            && upsert.previous_status == Some(CommunicationStatus::Processing)
        {
            // The in-flight classification sees the new content at commit
            // time and puts the row back in pending.
            tracing::info!(
                communication_id = %communication.id,
                "content changed while classification was in flight"
            );
        }

        tracing::info!(
            communication_id = %communication.id,
            source_id = %draft.source_id,
            created = upsert.created,
            content_changed = upsert.content_changed,
            reset,
            "voice event reconciled"
        );

        Ok(WebhookOutcome {
            communication,
            created: upsert.created,
            reset_for_reanalysis: reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::classifier::tests::ScriptedLlm;
    use crate::analysis::model::tests::POSITIVE_REPLY;
    use crate::analysis::{AnalysisStore, ClassifyOutcome};
    use crate::config::PipelineConfig;
    use crate::db::Db;
    use crate::error::ProviderError;
    use crate::ingestion::SingleTenantOwner;
    use crate::llm::PromptEngine;
    use crate::providers::RawMailMessage;
    use crate::providers::gmail::MailHeader;
    use crate::providers::twilio::{
        RecordingEvent, SmsEvent, TranscriptionEvent, VoiceCallEvent,
    };

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeMailbox {
        messages: HashMap<String, RawMailMessage>,
        listed: Vec<String>,
        fetches: AtomicUsize,
    }

    impl FakeMailbox {
        fn new(ids: &[&str]) -> Self {
            let messages = ids
                .iter()
                .map(|id| {
                    let message = RawMailMessage {
                        id: id.to_string(),
                        body_text: Some(format!("Message {id} about the library hours")),
                        headers: vec![MailHeader {
                            name: "From".into(),
                            value: "resident@example.org".into(),
                        }],
                        ..Default::default()
                    };
                    (id.to_string(), message)
                })
                .collect();
            Self {
                messages,
                listed: ids.iter().map(|id| id.to_string()).collect(),
                fetches: AtomicUsize::new(0),
            }
        }

        fn listing(mut self, ids: &[&str]) -> Self {
            self.listed = ids.iter().map(|id| id.to_string()).collect();
            self
        }
    }

    #[async_trait::async_trait]
    impl MailSource for FakeMailbox {
        async fn list_inbox(&self, _user_id: &str, _query: &str, max_results: u32) -> Result<Vec<MessageRef>> {
            Ok(self
                .listed
                .iter()
                .take(max_results as usize)
                .map(|id| MessageRef {
                    id: id.clone(),
                    thread_id: None,
                })
                .collect())
        }

        async fn fetch_message(&self, _user_id: &str, message_id: &str) -> Result<RawMailMessage> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.messages.get(message_id).cloned().ok_or_else(|| {
                ProviderError::Permanent {
                    provider: Provider::Gmail,
                    message: format!("no message {message_id}"),
                }
                .into()
            })
        }
    }

    async fn setup() -> (Reconciler, CommunicationStore, Classifier) {
        let db = Db::connect_in_memory().await.expect("in-memory sqlite");
        let communications = CommunicationStore::new(db.sqlite.clone());
        let classifier = Classifier::new(
            communications.clone(),
            AnalysisStore::new(db.sqlite.clone()),
            ScriptedLlm::always(POSITIVE_REPLY),
            Arc::new(PromptEngine::new().unwrap()),
            &PipelineConfig::default(),
        );
        let reconciler = Reconciler::new(
            communications.clone(),
            classifier.clone(),
            Arc::new(SingleTenantOwner::new("admin")),
            3,
        );
        (reconciler, communications, classifier)
    }

    async fn count_rows(store: &CommunicationStore) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM communications")
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn overlapping_syncs_never_duplicate() {
        let (reconciler, store, _) = setup().await;

        let first = FakeMailbox::new(&["m1", "m2", "m3", "m4"]).listing(&["m1", "m2", "m3"]);
        let report = reconciler.reconcile_batch(&first, "in:inbox", 50).await.unwrap();
        assert_eq!((report.total, report.new_count), (3, 3));

        let second = FakeMailbox::new(&["m1", "m2", "m3", "m4"]).listing(&["m2", "m3", "m4"]);
        let report = reconciler.reconcile_batch(&second, "in:inbox", 50).await.unwrap();
        assert_eq!((report.total, report.new_count), (3, 1));
        assert_eq!(second.fetches.load(Ordering::SeqCst), 1);

        let report = reconciler.reconcile_batch(&second, "in:inbox", 50).await.unwrap();
        assert_eq!(report.new_count, 0);
        assert_eq!(count_rows(&store).await, 4);
    }

    #[tokio::test]
    async fn concurrent_syncs_converge() {
        let (reconciler, store, _) = setup().await;
        let mailbox = FakeMailbox::new(&["m1", "m2", "m3", "m4", "m5"]);

        let (a, b) = tokio::join!(
            reconciler.reconcile_batch(&mailbox, "in:inbox", 50),
            reconciler.reconcile_batch(&mailbox, "in:inbox", 50),
        );
        assert_eq!(a.unwrap().new_count + b.unwrap().new_count, 5);
        assert_eq!(count_rows(&store).await, 5);
    }

    #[tokio::test]
    async fn one_bad_candidate_does_not_abort_the_batch() {
        let (reconciler, store, _) = setup().await;
        let mailbox = FakeMailbox::new(&["m1", "m2"]).listing(&["m1", "gone", "m2"]);

        let report = reconciler.reconcile_batch(&mailbox, "in:inbox", 50).await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.new_count, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].source_id, "gone");
        assert_eq!(report.failed[0].class, ErrorClass::Permanent);
        assert_eq!(count_rows(&store).await, 2);
    }

    #[tokio::test]
    async fn sync_runs_on_a_spawned_task() {
        let (reconciler, store, _) = setup().await;
        let mailbox: Arc<dyn MailSource> = Arc::new(FakeMailbox::new(&["m1", "m2"]));

        let report = tokio::spawn(async move {
            reconciler
                .reconcile_batch(mailbox.as_ref(), "in:inbox", 50)
                .await
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!((report.total, report.new_count), (2, 2));
        assert_eq!(count_rows(&store).await, 2);
    }

    fn call_started() -> TwilioEvent {
        TwilioEvent::CallStarted(VoiceCallEvent {
            call_sid: "CA1".into(),
            from: "+15551234567".into(),
            to: Some("+15559999999".into()),
            call_status: Some("ringing".into()),
            caller_city: None,
            caller_state: None,
        })
    }

    fn recording_completed() -> TwilioEvent {
        TwilioEvent::RecordingCompleted(RecordingEvent {
            call_sid: "CA1".into(),
            from: Some("+15551234567".into()),
            to: Some("+15559999999".into()),
            recording_sid: Some("RE1".into()),
            recording_url: "https://api.twilio.com/rec/RE1".into(),
            recording_duration_secs: Some(30),
        })
    }

    #[tokio::test]
    async fn voice_callbacks_converge_on_one_row() {
        let (reconciler, store, _) = setup().await;

        let started = reconciler.reconcile_webhook_event(&call_started()).await.unwrap();
        assert!(started.created);
        assert!(started.communication.content.is_empty());
        assert_eq!(started.communication.status, CommunicationStatus::Pending);

        let recorded = reconciler
            .reconcile_webhook_event(&recording_completed())
            .await
            .unwrap();
        assert!(!recorded.created);
        assert_eq!(recorded.communication.id, started.communication.id);
        assert!(recorded.communication.content.contains("30 seconds"));
        assert_eq!(recorded.communication.sender, "+15551234567");
        assert_eq!(recorded.communication.metadata.call_status.as_deref(), Some("completed"));
        assert_eq!(count_rows(&store).await, 1);
    }

    #[tokio::test]
    async fn transcription_after_analysis_resets_the_row() {
        let (reconciler, store, classifier) = setup().await;
        reconciler.reconcile_webhook_event(&call_started()).await.unwrap();
        let recorded = reconciler
            .reconcile_webhook_event(&recording_completed())
            .await
            .unwrap();

        let outcome = classifier.classify(&recorded.communication.id).await.unwrap();
        assert!(matches!(outcome, ClassifyOutcome::Processed(_)));

        let transcribed = reconciler
            .reconcile_webhook_event(&TwilioEvent::TranscriptionCompleted(TranscriptionEvent {
                call_sid: "CA1".into(),
                from: None,
                to: Some("+15559999999".into()),
                transcription_text: Some("The streetlight on Oak Ave is out.".into()),
                transcription_status: Some("completed".into()),
                recording_url: None,
            }))
            .await
            .unwrap();

        assert!(transcribed.reset_for_reanalysis);
        assert_eq!(transcribed.communication.status, CommunicationStatus::Pending);
        assert_eq!(transcribed.communication.content, "The streetlight on Oak Ave is out.");
        assert_eq!(
            transcribed.communication.metadata.recording_url.as_deref(),
            Some("https://api.twilio.com/rec/RE1")
        );
        assert_eq!(
            classifier
                .analyses()
                .count_for_communication(&transcribed.communication.id)
                .await
                .unwrap(),
            0
        );
        assert_eq!(count_rows(&store).await, 1);
    }

    #[tokio::test]
    async fn repeated_sms_webhook_is_idempotent() {
        let (reconciler, store, _) = setup().await;
        let event = TwilioEvent::SmsReceived(SmsEvent {
            message_sid: "SM1".into(),
            from: "+15551234567".into(),
            to: Some("+15559999999".into()),
            body: "Thanks for your help!".into(),
            num_media: 0,
        });

        let first = reconciler.reconcile_webhook_event(&event).await.unwrap();
        let second = reconciler.reconcile_webhook_event(&event).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.communication.id, second.communication.id);
        assert_eq!(first.communication.user_id, "admin");
        assert_eq!(count_rows(&store).await, 1);
    }
}
