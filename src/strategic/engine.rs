//! Rollup gate and snapshot generation.

use super::model::{CriticalIssue, RollupReply, SampleCommunication, StrategicAnalysis};
use super::store::StrategicStore;
use crate::analysis::{AnalysisStore, AnalyzedCommunication};
use crate::communications::CommunicationStore;
use crate::config::RollupConfig;
use crate::error::{LlmError, Result};
use crate::llm::prompts::{CategoryPromptRow, HighPriorityPromptRow};
use crate::llm::{CompletionRequest, LlmClient, PromptEngine};

use chrono::{DateTime, Utc};
use serde::Serialize;

use std::sync::Arc;
use std::time::Duration;

/// Evidence samples attached to each critical issue.
const SAMPLES_PER_ISSUE: usize = 3;
/// High-priority items quoted verbatim in the rollup prompt.
const HIGH_PRIORITY_PROMPT_LIMIT: usize = 25;

/// Why a new snapshot is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupTrigger {
    NoSnapshot,
    Threshold,
    Stale,
}

/// Analysed communications sharing a primary category.
#[derive(Debug, Clone)]
pub struct CategoryBucket {
    pub name: String,
    pub communications: Vec<AnalyzedCommunication>,
}

impl CategoryBucket {
    /// Share of the bucket with priority 4 or higher.
    pub fn priority_weight(&self) -> f64 {
        if self.communications.is_empty() {
            return 0.0;
        }
        let high = self
            .communications
            .iter()
            .filter(|communication| communication.priority >= 4)
            .count();
        high as f64 / self.communications.len() as f64
    }

    /// Group rows by primary category, largest bucket first. Row order within
    /// a bucket is preserved.
    pub fn group(rows: &[AnalyzedCommunication]) -> Vec<CategoryBucket> {
        let mut buckets: Vec<CategoryBucket> = Vec::new();
        for row in rows {
            let name = row.primary_category.trim().to_lowercase();
            match buckets.iter_mut().find(|bucket| bucket.name == name) {
                Some(bucket) => bucket.communications.push(row.clone()),
                None => buckets.push(CategoryBucket {
                    name,
                    communications: vec![row.clone()],
                }),
            }
        }
        buckets.sort_by(|a, b| b.communications.len().cmp(&a.communications.len()));
        buckets
    }
}

/// Pure gate: count threshold and snapshot age are independent triggers.
pub fn rollup_trigger(
    latest: Option<&StrategicAnalysis>,
    config: &RollupConfig,
    now: DateTime<Utc>,
) -> Option<RollupTrigger> {
    let Some(latest) = latest else {
        return Some(RollupTrigger::NoSnapshot);
    };
    if latest.new_communications_count >= config.threshold {
        return Some(RollupTrigger::Threshold);
    }
    if config.max_age_hours > 0 && latest.new_communications_count > 0 {
        let max_age = chrono::Duration::hours(i64::try_from(config.max_age_hours).unwrap_or(i64::MAX / 3600));
        if now - latest.generated_at >= max_age {
            return Some(RollupTrigger::Stale);
        }
    }
    None
}

#[derive(Clone)]
pub struct RollupEngine {
    store: StrategicStore,
    analyses: AnalysisStore,
    communications: CommunicationStore,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptEngine>,
    config: RollupConfig,
    timeout: Duration,
}

impl std::fmt::Debug for RollupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollupEngine")
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RollupEngine {
    pub fn new(
        store: StrategicStore,
        analyses: AnalysisStore,
        communications: CommunicationStore,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptEngine>,
        config: RollupConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            analyses,
            communications,
            llm,
            prompts,
            config,
            timeout,
        }
    }

    pub fn store(&self) -> &StrategicStore {
        &self.store
    }

    pub async fn trigger(&self, user_id: &str) -> Result<Option<RollupTrigger>> {
        let latest = self.store.latest(user_id).await?;
        Ok(rollup_trigger(latest.as_ref(), &self.config, Utc::now()))
    }

    pub async fn should_generate(&self, user_id: &str) -> Result<bool> {
        Ok(self.trigger(user_id).await?.is_some())
    }

    pub async fn increment_counter(&self, user_id: &str) -> Result<bool> {
        self.store.increment_counter(user_id).await
    }

    /// New processed communications since the latest snapshot. Without a
    /// snapshot every processed communication counts.
    pub async fn pending_since_last(&self, user_id: &str) -> Result<i64> {
        match self.store.latest(user_id).await? {
            Some(latest) => Ok(latest.new_communications_count),
            None => self.communications.count_processed(user_id).await,
        }
    }

    /// Generate and persist a snapshot from explicit inputs. Nothing is
    /// written unless the model reply parses.
    pub async fn generate(
        &self,
        user_id: &str,
        categories: &[CategoryBucket],
        high_priority: &[AnalyzedCommunication],
    ) -> Result<StrategicAnalysis> {
        let category_rows: Vec<CategoryPromptRow<'_>> = categories
            .iter()
            .map(|bucket| CategoryPromptRow {
                name: &bucket.name,
                count: bucket.communications.len(),
                priority_weight: bucket.priority_weight(),
            })
            .collect();
        let high_priority_rows: Vec<HighPriorityPromptRow<'_>> = high_priority
            .iter()
            .take(HIGH_PRIORITY_PROMPT_LIMIT)
            .map(|communication| HighPriorityPromptRow {
                category: &communication.primary_category,
                priority: communication.priority,
                sentiment: communication.sentiment_label.as_str(),
                summary: &communication.summary,
            })
            .collect();

        let request = CompletionRequest::json(
            self.prompts.rollup_system()?,
            self.prompts.rollup_user(
                self.config.window_days,
                &category_rows,
                &high_priority_rows,
            )?,
        );

        let reply = tokio::time::timeout(self.timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                secs: self.timeout.as_secs(),
            })??;
        let reply = RollupReply::parse(&reply)?;

        let critical_issues = reply
            .critical_issues
            .into_iter()
            .map(|issue| {
                let bucket = categories.iter().find(|bucket| bucket.name == issue.category);
                if bucket.is_none() {
                    tracing::warn!(category = %issue.category, "rollup referenced a category absent from its input");
                }
                let count = bucket.map_or(0, |bucket| bucket.communications.len() as i64);
                if let Some(reported) = issue.reported_count
                    && reported != count
                {
                    tracing::debug!(category = %issue.category, reported, count, "replacing model-reported issue count");
                }
                let samples = bucket
                    .map(|bucket| {
                        bucket
                            .communications
                            .iter()
                            .take(SAMPLES_PER_ISSUE)
                            .map(sample_from)
                            .collect()
                    })
                    .unwrap_or_default();

                CriticalIssue {
                    category: issue.category,
                    description: issue.description,
                    urgency: issue.urgency,
                    affected_area: issue.affected_area,
                    count,
                    samples,
                }
            })
            .collect();

        let snapshot = StrategicAnalysis {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            generated_at: Utc::now(),
            summary: reply.situation_overview,
            critical_issues,
            recommended_actions: reply.recommended_actions,
            monitoring_priorities: reply.monitoring_priorities,
            new_communications_count: 0,
        };

        self.store.insert(&snapshot).await?;
        tracing::info!(
            user_id,
            snapshot_id = %snapshot.id,
            categories = categories.len(),
            critical_issues = snapshot.critical_issues.len(),
            "strategic analysis generated"
        );
        Ok(snapshot)
    }

    /// Load the rollup window from the store and generate. Returns `None`
    /// when there is nothing analysed to roll up.
    pub async fn generate_from_store(&self, user_id: &str) -> Result<Option<StrategicAnalysis>> {
        let since = Utc::now() - chrono::Duration::days(self.config.window_days.max(1));
        let rows = self
            .analyses
            .list_for_rollup(user_id, since, self.config.max_communications)
            .await?;

        if rows.is_empty() {
            tracing::debug!(user_id, "no analysed communications in rollup window");
            return Ok(None);
        }

        let categories = CategoryBucket::group(&rows);
        let high_priority: Vec<AnalyzedCommunication> = rows
            .into_iter()
            .filter(|communication| communication.priority >= 4)
            .collect();

        self.generate(user_id, &categories, &high_priority)
            .await
            .map(Some)
    }

    /// Generate when the gate is open, or unconditionally with `force`.
    pub async fn refresh(&self, user_id: &str, force: bool) -> Result<Option<StrategicAnalysis>> {
        if !force {
            match self.trigger(user_id).await? {
                Some(trigger) => tracing::info!(user_id, ?trigger, "strategic rollup triggered"),
                None => return Ok(None),
            }
        }
        self.generate_from_store(user_id).await
    }
}

fn sample_from(communication: &AnalyzedCommunication) -> SampleCommunication {
    SampleCommunication {
        communication_id: communication.communication_id.clone(),
        sender: communication.sender.clone(),
        subject: communication.subject.clone(),
        summary: communication.summary.clone(),
        priority: communication.priority,
        received_at: communication.received_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::classifier::tests::ScriptedLlm;
    use crate::analysis::SentimentLabel;
    use crate::communications::CommunicationKind;
    use crate::db::Db;

    fn snapshot_with(count: i64, age: chrono::Duration) -> StrategicAnalysis {
        let mut snapshot = crate::strategic::store::tests::empty_snapshot("user-1");
        snapshot.new_communications_count = count;
        snapshot.generated_at = Utc::now() - age;
        snapshot
    }

    fn analyzed(id: &str, category: &str, priority: i64) -> AnalyzedCommunication {
        AnalyzedCommunication {
            communication_id: id.to_string(),
            kind: CommunicationKind::Email,
            sender: "resident@example.org".into(),
            subject: Some("Bridge".into()),
            received_at: Utc::now(),
            primary_category: category.to_string(),
            priority,
            sentiment_label: SentimentLabel::Negative,
            sentiment_score: -0.7,
            summary: format!("summary of {id}"),
        }
    }

    #[test]
    fn gate_opens_at_threshold() {
        let config = RollupConfig {
            max_age_hours: 0,
            ..RollupConfig::default()
        };
        let now = Utc::now();
        let fresh = chrono::Duration::minutes(5);

        assert_eq!(rollup_trigger(None, &config, now), Some(RollupTrigger::NoSnapshot));
        assert_eq!(rollup_trigger(Some(&snapshot_with(3, fresh)), &config, now), None);
        assert_eq!(
            rollup_trigger(Some(&snapshot_with(4, fresh)), &config, now),
            Some(RollupTrigger::Threshold)
        );
    }

    #[test]
    fn stale_snapshot_needs_at_least_one_new_communication() {
        let config = RollupConfig::default();
        let now = Utc::now();
        let old = chrono::Duration::hours(5);

        assert_eq!(rollup_trigger(Some(&snapshot_with(0, old)), &config, now), None);
        assert_eq!(
            rollup_trigger(Some(&snapshot_with(1, old)), &config, now),
            Some(RollupTrigger::Stale)
        );
    }

    #[test]
    fn priority_weight_is_high_priority_share() {
        let buckets = CategoryBucket::group(&[
            analyzed("a", "infrastructure", 5),
            analyzed("b", "Infrastructure", 2),
            analyzed("c", "education", 1),
        ]);
        assert_eq!(buckets[0].name, "infrastructure");
        assert!((buckets[0].priority_weight() - 0.5).abs() < f64::EPSILON);
        assert_eq!(buckets[1].priority_weight(), 0.0);
    }

    async fn engine(llm: Arc<dyn LlmClient>) -> RollupEngine {
        let db = Db::connect_in_memory().await.expect("in-memory sqlite");
        RollupEngine::new(
            StrategicStore::new(db.sqlite.clone()),
            AnalysisStore::new(db.sqlite.clone()),
            CommunicationStore::new(db.sqlite),
            llm,
            Arc::new(PromptEngine::new().unwrap()),
            RollupConfig::default(),
            Duration::from_secs(5),
        )
    }

    const ROLLUP_REPLY: &str = r#"{
        "situationOverview": "Bridge closure is the dominant concern.",
        "criticalIssues": [
            {"category": "infrastructure", "description": "Bridge closed", "urgency": "critical", "affectedArea": "Downtown", "count": 40},
            {"category": "aliens", "description": "Made up", "urgency": "low", "affectedArea": "Nowhere", "count": 3}
        ],
        "recommendedActions": ["Request DOT timeline"],
        "monitoringPriorities": ["Detour traffic"]
    }"#;

    #[tokio::test]
    async fn counts_and_samples_come_from_input() {
        let engine = engine(ScriptedLlm::always(ROLLUP_REPLY)).await;
        let rows: Vec<_> = (0..5)
            .map(|n| analyzed(&format!("c{n}"), "infrastructure", 4))
            .collect();
        let buckets = CategoryBucket::group(&rows);

        let snapshot = engine.generate("user-1", &buckets, &rows).await.unwrap();

        assert_eq!(snapshot.new_communications_count, 0);
        assert_eq!(snapshot.critical_issues[0].count, 5);
        assert_eq!(snapshot.critical_issues[0].samples.len(), SAMPLES_PER_ISSUE);
        assert_eq!(snapshot.critical_issues[1].count, 0);
        assert!(snapshot.critical_issues[1].samples.is_empty());

        let latest = engine.store().latest("user-1").await.unwrap().unwrap();
        assert_eq!(latest.id, snapshot.id);
    }

    #[tokio::test]
    async fn failed_generation_keeps_previous_latest() {
        let engine = engine(ScriptedLlm::always("the model rambled instead")).await;
        let previous = snapshot_with(6, chrono::Duration::hours(1));
        engine.store().insert(&previous).await.unwrap();

        let rows = vec![analyzed("c1", "infrastructure", 5)];
        let buckets = CategoryBucket::group(&rows);
        assert!(engine.generate("user-1", &buckets, &rows).await.is_err());

        let latest = engine.store().latest("user-1").await.unwrap().unwrap();
        assert_eq!(latest.id, previous.id);
        assert_eq!(latest.new_communications_count, 6);
    }

    #[tokio::test]
    async fn pending_count_falls_back_to_processed_total() {
        let engine = engine(ScriptedLlm::always(ROLLUP_REPLY)).await;
        assert_eq!(engine.pending_since_last("user-1").await.unwrap(), 0);
        assert!(engine.should_generate("user-1").await.unwrap());

        engine.store().insert(&snapshot_with(2, chrono::Duration::minutes(1))).await.unwrap();
        assert_eq!(engine.pending_since_last("user-1").await.unwrap(), 2);
        assert!(!engine.should_generate("user-1").await.unwrap());
    }
}
