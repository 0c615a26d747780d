//! Analysis storage (SQLite).

use super::model::{Analysis, Categories, Entities, Sentiment, SentimentLabel};
use crate::communications::CommunicationKind;
use crate::db::is_unique_violation;
use crate::error::{DbError, PipelineError, Result};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqliteConnection, SqlitePool};

const ANALYSIS_COLUMNS: &str = "id, communication_id, sentiment_label, sentiment_score, sentiment_reasoning, primary_category, secondary_categories, priority, entities, intentions, summary, confidence, processing_time_ms, version, created_at";

/// A processed communication joined with its analysis, as consumed by the
/// strategic rollup.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzedCommunication {
    pub communication_id: String,
    pub kind: CommunicationKind,
    pub sender: String,
    pub subject: Option<String>,
    pub received_at: DateTime<Utc>,
    pub primary_category: String,
    pub priority: i64,
    pub sentiment_label: SentimentLabel,
    pub sentiment_score: f64,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct AnalysisStore {
    pool: SqlitePool,
}

impl AnalysisStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert inside the caller's transaction. A second analysis for the same
    /// communication is rejected by the UNIQUE constraint.
    pub async fn insert_in(conn: &mut SqliteConnection, analysis: &Analysis) -> Result<()> {
        let secondary = serde_json::to_string(&analysis.categories.secondary)
            .context("failed to serialize secondary categories")?;
        let entities =
            serde_json::to_string(&analysis.entities).context("failed to serialize entities")?;
        let intentions =
            serde_json::to_string(&analysis.intentions).context("failed to serialize intentions")?;

        sqlx::query(&format!(
            "INSERT INTO analyses ({ANALYSIS_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&analysis.id)
        .bind(&analysis.communication_id)
        .bind(analysis.sentiment.label.as_str())
        .bind(analysis.sentiment.score)
        .bind(&analysis.sentiment.reasoning)
        .bind(&analysis.categories.primary)
        .bind(&secondary)
        .bind(analysis.priority)
        .bind(&entities)
        .bind(&intentions)
        .bind(&analysis.summary)
        .bind(analysis.confidence)
        .bind(analysis.processing_time_ms)
        .bind(&analysis.version)
        .bind(analysis.created_at)
        .execute(conn)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                PipelineError::PersistFailed {
                    id: analysis.communication_id.clone(),
                    reason: "analysis already exists".into(),
                }
                .into()
            } else {
                crate::Error::from(anyhow::Error::new(error).context("failed to insert analysis"))
            }
        })?;

        Ok(())
    }

    pub async fn delete_for_communication_in(
        conn: &mut SqliteConnection,
        communication_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM analyses WHERE communication_id = ?")
            .bind(communication_id)
            .execute(conn)
            .await
            .context("failed to delete analysis")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_for_communication(&self, communication_id: &str) -> Result<Option<Analysis>> {
        let row = sqlx::query(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analyses WHERE communication_id = ?"
        ))
        .bind(communication_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch analysis")?;

        row.map(analysis_from_row).transpose()
    }

    pub async fn count_for_communication(&self, communication_id: &str) -> Result<i64> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM analyses WHERE communication_id = ?")
                .bind(communication_id)
                .fetch_one(&self.pool)
                .await
                .context("failed to count analyses")?;

        Ok(total)
    }

    /// Processed communications received since `since`, highest priority
    /// first.
    pub async fn list_for_rollup(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AnalyzedCommunication>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS communication_id, c.kind, c.sender, c.subject, c.received_at,
                   a.primary_category, a.priority, a.sentiment_label, a.sentiment_score, a.summary
            FROM communications c
            JOIN analyses a ON a.communication_id = c.id
            WHERE c.user_id = ? AND c.status = 'processed' AND c.received_at >= ?
            ORDER BY a.priority DESC, c.received_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(since)
        .bind(limit.clamp(1, 5000))
        .fetch_all(&self.pool)
        .await
        .context("failed to list analyses for rollup")?;

        rows.into_iter().map(analyzed_from_row).collect()
    }

    pub async fn count_by_category(&self, user_id: &str) -> Result<Vec<(String, i64)>> {
        self.grouped_count("a.primary_category", user_id).await
    }

    pub async fn count_by_sentiment(&self, user_id: &str) -> Result<Vec<(String, i64)>> {
        self.grouped_count("a.sentiment_label", user_id).await
    }

    async fn grouped_count(&self, column: &'static str, user_id: &str) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(&format!(
            "SELECT {column} AS bucket, COUNT(*) AS total FROM analyses a \
             JOIN communications c ON c.id = a.communication_id \
             WHERE c.user_id = ? GROUP BY {column} ORDER BY total DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to count analyses by {column}"))?;

        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get("bucket").context("failed to read bucket")?,
                    row.try_get("total").context("failed to read total")?,
                ))
            })
            .collect()
    }
}

fn parse_json_column<T: serde::de::DeserializeOwned + Default>(row: &SqliteRow, column: &str) -> T {
    row.try_get::<String, _>(column)
        .ok()
        .and_then(|value| serde_json::from_str(&value).ok())
        .unwrap_or_default()
}

fn sentiment_label(row: &SqliteRow) -> Result<SentimentLabel> {
    let value: String = row
        .try_get("sentiment_label")
        .context("failed to read sentiment_label")?;
    SentimentLabel::parse(&value)
        .ok_or_else(|| DbError::Corrupt(format!("invalid sentiment label: {value}")).into())
}

fn analysis_from_row(row: SqliteRow) -> Result<Analysis> {
    Ok(Analysis {
        id: row.try_get("id").context("failed to read id")?,
        communication_id: row
            .try_get("communication_id")
            .context("failed to read communication_id")?,
        sentiment: Sentiment {
            label: sentiment_label(&row)?,
            score: row
                .try_get("sentiment_score")
                .context("failed to read sentiment_score")?,
            reasoning: row.try_get("sentiment_reasoning").unwrap_or_default(),
        },
        categories: Categories {
            primary: row
                .try_get("primary_category")
                .context("failed to read primary_category")?,
            secondary: parse_json_column(&row, "secondary_categories"),
        },
        priority: row.try_get("priority").context("failed to read priority")?,
        entities: parse_json_column::<Entities>(&row, "entities"),
        intentions: parse_json_column(&row, "intentions"),
        summary: row.try_get("summary").context("failed to read summary")?,
        confidence: row.try_get("confidence").context("failed to read confidence")?,
        processing_time_ms: row
            .try_get("processing_time_ms")
            .context("failed to read processing_time_ms")?,
        version: row.try_get("version").context("failed to read version")?,
        created_at: row.try_get("created_at").context("failed to read created_at")?,
    })
}

fn analyzed_from_row(row: SqliteRow) -> Result<AnalyzedCommunication> {
    let kind_value: String = row.try_get("kind").context("failed to read kind")?;

    Ok(AnalyzedCommunication {
        communication_id: row
            .try_get("communication_id")
            .context("failed to read communication_id")?,
        kind: CommunicationKind::parse(&kind_value)
            .ok_or_else(|| DbError::Corrupt(format!("invalid kind: {kind_value}")))?,
        sender: row.try_get("sender").context("failed to read sender")?,
        subject: row.try_get::<Option<String>, _>("subject").ok().flatten(),
        received_at: row
            .try_get("received_at")
            .context("failed to read received_at")?,
        primary_category: row
            .try_get("primary_category")
            .context("failed to read primary_category")?,
        priority: row.try_get("priority").context("failed to read priority")?,
        sentiment_label: sentiment_label(&row)?,
        sentiment_score: row
            .try_get("sentiment_score")
            .context("failed to read sentiment_score")?,
        summary: row.try_get("summary").context("failed to read summary")?,
    })
}
