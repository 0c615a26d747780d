//! Communication storage (SQLite).
//!
//! The `(source_id, source, user_id)` UNIQUE constraint is what upholds the
//! dedup invariant; every insert path here goes through it rather than a
//! check-then-insert. Status updates are guarded by the transition table on
//! [`CommunicationStatus`].

use super::model::{
    Communication, CommunicationDraft, CommunicationKind, CommunicationMetadata,
    CommunicationStatus, Direction, Origin,
};
use crate::error::{DbError, PipelineError, Result};
use crate::Provider;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqliteConnection, SqlitePool};

/// `status IN (...)` over the given statuses. The values are the static
/// status names, never caller input.
fn status_in(statuses: &[CommunicationStatus]) -> String {
    let names = statuses
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("status IN ({names})")
}

const COMMUNICATION_COLUMNS: &str = "id, user_id, source, source_id, kind, direction, subject, sender, content, raw_content, metadata, status, origin, exclude_from_analysis, parent_communication_id, received_at, created_at, updated_at";

/// Result of a dedup insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(Communication),
    Existing(Communication),
}

impl InsertOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }

    pub fn communication(&self) -> &Communication {
        match self {
            InsertOutcome::Created(c) | InsertOutcome::Existing(c) => c,
        }
    }

    pub fn into_communication(self) -> Communication {
        match self {
            InsertOutcome::Created(c) | InsertOutcome::Existing(c) => c,
        }
    }
}

/// Result of an upsert by natural key.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub communication: Communication,
    pub created: bool,
    /// Status before the upsert touched the row (`None` when created).
    pub previous_status: Option<CommunicationStatus>,
    pub content_changed: bool,
}

#[derive(Debug, Clone)]
pub struct CommunicationStore {
    pool: SqlitePool,
}

impl CommunicationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn exists(&self, user_id: &str, source: Provider, source_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM communications WHERE source_id = ? AND source = ? AND user_id = ?",
        )
        .bind(source_id)
        .bind(source.as_str())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to check communication existence")?;

        Ok(found.is_some())
    }

    /// Insert a draft as `Pending` unless a row with the same natural key
    /// already exists. Concurrent callers racing on the same key converge on
    /// the single stored row.
    pub async fn insert_if_absent(
        &self,
        user_id: &str,
        draft: &CommunicationDraft,
    ) -> Result<InsertOutcome> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection for insert")?;
        let inserted = insert_draft(&mut conn, user_id, draft).await?;
        let stored = fetch_by_source(&mut conn, user_id, draft.source, &draft.source_id)
            .await?
            .context("communication missing after insert")?;

        Ok(if inserted {
            InsertOutcome::Created(stored)
        } else {
            InsertOutcome::Existing(stored)
        })
    }

    /// Create the row or fold the draft into the existing one. Content is only
    /// replaced when the draft carries some; metadata is merged.
    ///
    /// The insert runs first so the transaction holds the write lock before it
    /// reads; concurrent callbacks for the same call serialize on it and the
    /// loser folds into the winner's row.
    pub async fn upsert_by_source(
        &self,
        user_id: &str,
        draft: &CommunicationDraft,
    ) -> Result<UpsertOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open upsert transaction")?;

        let created = insert_draft(&mut tx, user_id, draft).await?;
        let current = fetch_by_source(&mut tx, user_id, draft.source, &draft.source_id)
            .await?
            .context("communication missing after upsert insert")?;

        if created {
            tx.commit()
                .await
                .context("failed to commit upsert transaction")?;
            return Ok(UpsertOutcome {
                communication: current,
                created: true,
                previous_status: None,
                content_changed: !draft.content.is_empty(),
            });
        }

        let content_changed = !draft.content.is_empty() && draft.content != current.content;
        let content = if content_changed {
            draft.content.as_str()
        } else {
            current.content.as_str()
        };
        let raw_content = draft.raw_content.clone().or_else(|| current.raw_content.clone());
        let subject = draft.subject.clone().or_else(|| current.subject.clone());
        let mut metadata = current.metadata.clone();
        metadata.merge(draft.metadata.clone());
        let metadata_json =
            serde_json::to_string(&metadata).context("failed to serialize metadata")?;

        sqlx::query(
            "UPDATE communications SET content = ?, raw_content = ?, subject = ?, metadata = ?, updated_at = ? WHERE id = ?",
        )
        .bind(content)
        .bind(&raw_content)
        .bind(&subject)
        .bind(&metadata_json)
        .bind(Utc::now())
        .bind(&current.id)
        .execute(&mut *tx)
        .await
        .context("failed to update communication during upsert")?;

        let communication = fetch_by_id(&mut tx, &current.id)
            .await?
            .context("communication missing after upsert")?;
        tx.commit()
            .await
            .context("failed to commit upsert transaction")?;

        Ok(UpsertOutcome {
            communication,
            created: false,
            previous_status: Some(current.status),
            content_changed,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Communication>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection")?;
        fetch_by_id(&mut conn, id).await
    }

    pub async fn get_by_source(
        &self,
        user_id: &str,
        source: Provider,
        source_id: &str,
    ) -> Result<Option<Communication>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection")?;
        fetch_by_source(&mut conn, user_id, source, source_id).await
    }

    pub async fn list(
        &self,
        user_id: &str,
        status: Option<CommunicationStatus>,
        limit: i64,
    ) -> Result<Vec<Communication>> {
        let mut query = format!("SELECT {COMMUNICATION_COLUMNS} FROM communications WHERE user_id = ?");
        if status.is_some() {
            query.push_str(" AND status = ?");
        }
        query.push_str(" ORDER BY received_at DESC LIMIT ?");

        let mut sql = sqlx::query(&query).bind(user_id);
        if let Some(status) = status {
            sql = sql.bind(status.as_str());
        }
        let rows = sql
            .bind(limit.clamp(1, 1000))
            .fetch_all(&self.pool)
            .await
            .context("failed to list communications")?;

        rows.into_iter().map(communication_from_row).collect()
    }

    /// Ids of pending rows that are eligible for classification.
    pub async fn list_analyzable_ids(&self, user_id: &str, limit: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM communications \
             WHERE user_id = ? AND status = 'pending' AND exclude_from_analysis = 0 \
               AND origin = 'human' AND TRIM(content) != '' \
             ORDER BY received_at ASC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .context("failed to list analyzable communications")?;

        Ok(ids)
    }

    /// Atomically move `pending -> processing`. Returns false when another
    /// caller already claimed the row or it is not pending.
    pub async fn claim_for_processing(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE communications SET status = 'processing', updated_at = ? WHERE id = ? AND {}",
            status_in(&CommunicationStatus::sources_of(CommunicationStatus::Processing))
        ))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to claim communication")?;

        Ok(result.rows_affected() == 1)
    }

    /// `processing -> processed` inside the caller's transaction, provided
    /// the stored content is still what was analysed. Returns false when the
    /// content was replaced mid-classification.
    pub async fn mark_processed_in(
        conn: &mut SqliteConnection,
        id: &str,
        analysed_content: &str,
    ) -> Result<bool> {
        let next = CommunicationStatus::Processed;
        let result = sqlx::query(&format!(
            "UPDATE communications SET status = 'processed', updated_at = ?, metadata = json_remove(metadata, '$.last_error') WHERE id = ? AND content = ? AND {}",
            status_in(&CommunicationStatus::sources_of(next))
        ))
        .bind(Utc::now())
        .bind(id)
        .bind(analysed_content)
        .execute(&mut *conn)
        .await
        .context("failed to mark communication processed")?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        current_status(conn, id).await?.validate_transition(next)?;
        Ok(false)
    }

    /// `processing -> failed`, recording the reason in metadata.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<()> {
        let next = CommunicationStatus::Failed;
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection")?;
        let result = sqlx::query(&format!(
            "UPDATE communications SET status = 'failed', updated_at = ?, metadata = json_set(metadata, '$.last_error', ?) WHERE id = ? AND {}",
            status_in(&CommunicationStatus::sources_of(next))
        ))
        .bind(Utc::now())
        .bind(reason)
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("failed to mark communication failed")?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        current_status(&mut conn, id).await?.validate_transition(next)?;
        Ok(())
    }

    /// `processing -> pending` when the stored content no longer matches what
    /// the in-flight classification read. Returns whether the row was requeued.
    pub async fn requeue_superseded(&self, id: &str, analysed_content: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE communications SET status = 'pending', updated_at = ? WHERE id = ? AND content != ? AND {}",
            status_in(&CommunicationStatus::sources_of(CommunicationStatus::Pending))
        ))
        .bind(Utc::now())
        .bind(id)
        .bind(analysed_content)
        .execute(&self.pool)
        .await
        .context("failed to requeue communication")?;

        Ok(result.rows_affected() == 1)
    }

    /// Reanalysis reset: back to `pending` from any state but `processing`.
    pub async fn reset_to_pending_in(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE communications SET status = 'pending', updated_at = ? WHERE id = ? AND {}",
            status_in(&CommunicationStatus::resettable())
        ))
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await
        .context("failed to reset communication status")?;

        Ok(result.rows_affected() == 1)
    }

    /// Fail rows left in `processing` by a crashed or cancelled run.
    pub async fn recover_stale_processing(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!(
            "UPDATE communications SET status = 'failed', updated_at = ?, metadata = json_set(metadata, '$.last_error', 'processing abandoned') WHERE {} AND updated_at < ?",
            status_in(&CommunicationStatus::sources_of(CommunicationStatus::Failed))
        ))
        .bind(Utc::now())
        .bind(older_than)
        .execute(&self.pool)
        .await
        .context("failed to recover stale processing rows")?;

        Ok(result.rows_affected())
    }

    /// Operator override of the analysis exclusion flag.
    pub async fn set_excluded(&self, id: &str, excluded: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE communications SET exclude_from_analysis = ?, updated_at = ? WHERE id = ?",
        )
        .bind(excluded)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to update exclusion flag")?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn count_by_status(&self, user_id: &str) -> Result<Vec<(String, i64)>> {
        self.grouped_count("status", user_id).await
    }

    pub async fn count_by_source(&self, user_id: &str) -> Result<Vec<(String, i64)>> {
        self.grouped_count("source", user_id).await
    }

    pub async fn count_by_kind(&self, user_id: &str) -> Result<Vec<(String, i64)>> {
        self.grouped_count("kind", user_id).await
    }

    async fn grouped_count(&self, column: &'static str, user_id: &str) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(&format!(
            "SELECT {column} AS bucket, COUNT(*) AS total FROM communications WHERE user_id = ? GROUP BY {column} ORDER BY total DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to count communications by {column}"))?;

        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get("bucket").context("failed to read bucket")?,
                    row.try_get("total").context("failed to read total")?,
                ))
            })
            .collect()
    }

    pub async fn count_processed(&self, user_id: &str) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM communications WHERE user_id = ? AND status = 'processed'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count processed communications")?;

        Ok(total)
    }
}

async fn fetch_by_id(conn: &mut SqliteConnection, id: &str) -> Result<Option<Communication>> {
    let row = sqlx::query(&format!(
        "SELECT {COMMUNICATION_COLUMNS} FROM communications WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
    .context("failed to fetch communication")?;

    row.map(communication_from_row).transpose()
}

async fn fetch_by_source(
    conn: &mut SqliteConnection,
    user_id: &str,
    source: Provider,
    source_id: &str,
) -> Result<Option<Communication>> {
    let row = sqlx::query(&format!(
        "SELECT {COMMUNICATION_COLUMNS} FROM communications WHERE source_id = ? AND source = ? AND user_id = ?"
    ))
    .bind(source_id)
    .bind(source.as_str())
    .bind(user_id)
    .fetch_optional(conn)
    .await
    .context("failed to fetch communication by source id")?;

    row.map(communication_from_row).transpose()
}

async fn current_status(conn: &mut SqliteConnection, id: &str) -> Result<CommunicationStatus> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT status FROM communications WHERE id = ?")
            .bind(id)
            .fetch_optional(conn)
            .await
            .context("failed to read communication status")?;

    let value = value.ok_or_else(|| PipelineError::NotFound { id: id.to_string() })?;
    Ok(CommunicationStatus::parse(&value)
        .ok_or_else(|| DbError::Corrupt(format!("invalid status: {value}")))?)
}

/// Insert a draft as a new `pending` row. A duplicate natural key is a no-op
/// and `false` is returned.
async fn insert_draft(
    conn: &mut SqliteConnection,
    user_id: &str,
    draft: &CommunicationDraft,
) -> Result<bool> {
    let metadata_json =
        serde_json::to_string(&draft.metadata).context("failed to serialize metadata")?;
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO communications (
            id, user_id, source, source_id, kind, direction, subject, sender, content,
            raw_content, metadata, status, origin, exclude_from_analysis, received_at,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?)
        ON CONFLICT(source_id, source, user_id) DO NOTHING
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(draft.source.as_str())
    .bind(&draft.source_id)
    .bind(draft.kind.as_str())
    .bind(draft.direction.as_str())
    .bind(&draft.subject)
    .bind(&draft.sender)
    .bind(&draft.content)
    .bind(&draft.raw_content)
    .bind(&metadata_json)
    .bind(draft.origin.as_str())
    .bind(draft.origin != Origin::Human)
    .bind(draft.received_at)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await
    .context("failed to insert communication")?;

    Ok(result.rows_affected() == 1)
}

fn communication_from_row(row: SqliteRow) -> Result<Communication> {
    let source_value: String = row.try_get("source").context("failed to read source")?;
    let kind_value: String = row.try_get("kind").context("failed to read kind")?;
    let direction_value: String = row.try_get("direction").context("failed to read direction")?;
    let status_value: String = row.try_get("status").context("failed to read status")?;
    let origin_value: String = row.try_get("origin").context("failed to read origin")?;
    let metadata_value: String = row.try_get("metadata").unwrap_or_else(|_| "{}".to_string());

    let corrupt = |what: &str, value: &str| DbError::Corrupt(format!("invalid {what}: {value}"));

    Ok(Communication {
        id: row.try_get("id").context("failed to read id")?,
        user_id: row.try_get("user_id").context("failed to read user_id")?,
        source: Provider::parse(&source_value).ok_or_else(|| corrupt("source", &source_value))?,
        source_id: row.try_get("source_id").context("failed to read source_id")?,
        kind: CommunicationKind::parse(&kind_value).ok_or_else(|| corrupt("kind", &kind_value))?,
        direction: Direction::parse(&direction_value)
            .ok_or_else(|| corrupt("direction", &direction_value))?,
        subject: row.try_get::<Option<String>, _>("subject").ok().flatten(),
        sender: row.try_get("sender").context("failed to read sender")?,
        content: row.try_get::<String, _>("content").unwrap_or_default(),
        raw_content: row.try_get::<Option<String>, _>("raw_content").ok().flatten(),
        metadata: CommunicationMetadata::parse(&metadata_value),
        status: CommunicationStatus::parse(&status_value)
            .ok_or_else(|| corrupt("status", &status_value))?,
        origin: Origin::parse(&origin_value).ok_or_else(|| corrupt("origin", &origin_value))?,
        exclude_from_analysis: row
            .try_get("exclude_from_analysis")
            .context("failed to read exclude_from_analysis")?,
        parent_communication_id: row
            .try_get::<Option<String>, _>("parent_communication_id")
            .ok()
            .flatten(),
        received_at: row
            .try_get("received_at")
            .context("failed to read received_at")?,
        created_at: row.try_get("created_at").context("failed to read created_at")?,
        updated_at: row.try_get("updated_at").context("failed to read updated_at")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::communications::model::TranscriptionStatus;
    use crate::db::Db;

    pub(crate) fn sms_draft(source_id: &str, body: &str) -> CommunicationDraft {
        CommunicationDraft {
            source: Provider::Twilio,
            source_id: source_id.to_string(),
            kind: CommunicationKind::Sms,
            direction: Direction::Inbound,
            subject: None,
            sender: "+15551234567".to_string(),
            content: body.to_string(),
            raw_content: None,
            metadata: CommunicationMetadata::default(),
            origin: Origin::Human,
            received_at: Utc::now(),
        }
    }

    async fn setup_store() -> CommunicationStore {
        let db = Db::connect_in_memory()
            .await
            .expect("in-memory sqlite should connect");
        CommunicationStore::new(db.sqlite)
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_no_op() {
        let store = setup_store().await;
        let draft = sms_draft("SM1", "hello");

        let first = store.insert_if_absent("user-1", &draft).await.unwrap();
        let second = store.insert_if_absent("user-1", &draft).await.unwrap();

        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.communication().id, second.communication().id);

        let all = store.list("user-1", None, 100).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, CommunicationStatus::Pending);
    }

    #[tokio::test]
    async fn same_source_id_for_other_user_is_distinct() {
        let store = setup_store().await;
        let draft = sms_draft("SM1", "hello");

        store.insert_if_absent("user-1", &draft).await.unwrap();
        let other = store.insert_if_absent("user-2", &draft).await.unwrap();

        assert!(other.is_new());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = setup_store().await;
        let created = store
            .insert_if_absent("user-1", &sms_draft("SM1", "hello"))
            .await
            .unwrap()
            .into_communication();

        assert!(store.claim_for_processing(&created.id).await.unwrap());
        assert!(!store.claim_for_processing(&created.id).await.unwrap());

        store.mark_failed(&created.id, "boom").await.unwrap();
        let failed = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(failed.status, CommunicationStatus::Failed);
        assert_eq!(failed.metadata.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn upsert_merges_into_existing_row() {
        let store = setup_store().await;
        let mut started = sms_draft("CA1", "");
        started.kind = CommunicationKind::Call;
        started.metadata.call_status = Some("ringing".into());

        let created = store.upsert_by_source("user-1", &started).await.unwrap();
        assert!(created.created);

        let mut recorded = started.clone();
        recorded.content = "Voice message recording".into();
        recorded.metadata = CommunicationMetadata {
            recording_url: Some("https://example.test/RE1".into()),
            ..Default::default()
        };

        let updated = store.upsert_by_source("user-1", &recorded).await.unwrap();
        assert!(!updated.created);
        assert!(updated.content_changed);
        assert_eq!(updated.communication.id, created.communication.id);
        assert_eq!(updated.communication.content, "Voice message recording");
        assert_eq!(
            updated.communication.metadata.call_status.as_deref(),
            Some("ringing")
        );
        assert_eq!(store.list("user-1", None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn analyzable_ids_skip_excluded_and_empty() {
        let store = setup_store().await;
        let human = store
            .insert_if_absent("user-1", &sms_draft("SM1", "pothole on Main St"))
            .await
            .unwrap()
            .into_communication();

        let mut automated = sms_draft("SM2", "Your code is 1234");
        automated.origin = Origin::Automated;
        store.insert_if_absent("user-1", &automated).await.unwrap();

        store
            .insert_if_absent("user-1", &sms_draft("CA1", ""))
            .await
            .unwrap();

        let ids = store.list_analyzable_ids("user-1", 50).await.unwrap();
        assert_eq!(ids, vec![human.id]);
    }

    #[tokio::test]
    async fn stale_processing_rows_are_failed() {
        let store = setup_store().await;
        let claimed = store
            .insert_if_absent("user-1", &sms_draft("SM1", "hello"))
            .await
            .unwrap()
            .into_communication();
        let untouched = store
            .insert_if_absent("user-1", &sms_draft("SM2", "still pending"))
            .await
            .unwrap()
            .into_communication();
        assert!(store.claim_for_processing(&claimed.id).await.unwrap());

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.recover_stale_processing(cutoff).await.unwrap(), 1);

        let recovered = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, CommunicationStatus::Failed);
        assert_eq!(
            recovered.metadata.last_error.as_deref(),
            Some("processing abandoned")
        );
        let pending = store.get(&untouched.id).await.unwrap().unwrap();
        assert_eq!(pending.status, CommunicationStatus::Pending);
    }

    fn call_draft(call_sid: &str, content: &str, metadata: CommunicationMetadata) -> CommunicationDraft {
        CommunicationDraft {
            kind: CommunicationKind::Call,
            metadata,
            ..sms_draft(call_sid, content)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn simultaneous_first_callbacks_share_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::connect(dir.path()).await.unwrap();
        let store = CommunicationStore::new(db.sqlite.clone());

        let mut callbacks = Vec::new();
        for n in 0..20 {
            let call_sid = format!("CA{n}");
            let recording = call_draft(
                &call_sid,
                "Voicemail recording (12 seconds). Transcription not yet available.",
                CommunicationMetadata {
                    recording_url: Some(format!("https://example.test/RE{n}")),
                    ..Default::default()
                },
            );
            let transcription = call_draft(
                &call_sid,
                "The bridge on Elm is cracked",
                CommunicationMetadata {
                    transcription_status: Some(TranscriptionStatus::Completed),
                    ..Default::default()
                },
            );
            for draft in [recording, transcription] {
                let store = store.clone();
                callbacks.push(tokio::spawn(async move {
                    store.upsert_by_source("user-1", &draft).await
                }));
            }
        }

        let mut created = 0;
        for callback in futures::future::join_all(callbacks).await {
            if callback.unwrap().unwrap().created {
                created += 1;
            }
        }
        assert_eq!(created, 20);

        let rows = store.list("user-1", None, 100).await.unwrap();
        assert_eq!(rows.len(), 20);
        for row in rows {
            assert!(row.metadata.recording_url.is_some(), "{}", row.source_id);
            assert_eq!(
                row.metadata.transcription_status,
                Some(TranscriptionStatus::Completed)
            );
        }
        db.close().await;
    }

    #[tokio::test]
    async fn replaced_content_blocks_processed_and_requeues() {
        let store = setup_store().await;
        let placeholder = "Voicemail recording (12 seconds). Transcription not yet available.";
        let created = store
            .upsert_by_source("user-1", &call_draft("CA1", placeholder, Default::default()))
            .await
            .unwrap()
            .communication;
        assert!(store.claim_for_processing(&created.id).await.unwrap());

        store
            .upsert_by_source(
                "user-1",
                &call_draft("CA1", "Bridge on Elm collapsed", Default::default()),
            )
            .await
            .unwrap();

        let mut tx = store.pool().begin().await.unwrap();
        assert!(
            !CommunicationStore::mark_processed_in(&mut tx, &created.id, placeholder)
                .await
                .unwrap()
        );
        drop(tx);

        assert!(store.requeue_superseded(&created.id, placeholder).await.unwrap());
        let requeued = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, CommunicationStatus::Pending);
        assert_eq!(requeued.content, "Bridge on Elm collapsed");
    }

    #[tokio::test]
    async fn status_updates_reject_invalid_transitions() {
        let store = setup_store().await;
        let created = store
            .insert_if_absent("user-1", &sms_draft("SM1", "hello"))
            .await
            .unwrap()
            .into_communication();

        let error = store.mark_failed(&created.id, "boom").await.unwrap_err();
        assert_eq!(error.code(), "VALIDATION");
        assert!(error.to_string().contains("pending"));

        let mut tx = store.pool().begin().await.unwrap();
        let error = CommunicationStore::mark_processed_in(&mut tx, &created.id, "hello")
            .await
            .unwrap_err();
        assert_eq!(error.code(), "VALIDATION");
        drop(tx);

        let error = store.mark_failed("missing", "boom").await.unwrap_err();
        assert_eq!(error.code(), "NOT_FOUND");

        assert!(!store.requeue_superseded(&created.id, "other").await.unwrap());
    }
}
