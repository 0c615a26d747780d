//! Strategic snapshot storage (SQLite).

use super::model::StrategicAnalysis;
use crate::error::Result;

use anyhow::Context as _;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqliteConnection, SqlitePool};

const LATEST_ID_SUBQUERY: &str = "SELECT id FROM strategic_analyses WHERE user_id = ? ORDER BY generated_at DESC, rowid DESC LIMIT 1";

#[derive(Debug, Clone)]
pub struct StrategicStore {
    pool: SqlitePool,
}

impl StrategicStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, snapshot: &StrategicAnalysis) -> Result<()> {
        let critical_issues = serde_json::to_string(&snapshot.critical_issues)
            .context("failed to serialize critical issues")?;
        let recommended_actions = serde_json::to_string(&snapshot.recommended_actions)
            .context("failed to serialize recommended actions")?;
        let monitoring_priorities = serde_json::to_string(&snapshot.monitoring_priorities)
            .context("failed to serialize monitoring priorities")?;

        sqlx::query(
            r#"
            INSERT INTO strategic_analyses (
                id, user_id, generated_at, summary, critical_issues, recommended_actions,
                monitoring_priorities, new_communications_count
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.user_id)
        .bind(snapshot.generated_at)
        .bind(&snapshot.summary)
        .bind(&critical_issues)
        .bind(&recommended_actions)
        .bind(&monitoring_priorities)
        .bind(snapshot.new_communications_count)
        .execute(&self.pool)
        .await
        .context("failed to insert strategic analysis")?;

        Ok(())
    }

    pub async fn latest(&self, user_id: &str) -> Result<Option<StrategicAnalysis>> {
        let row = sqlx::query(
            "SELECT * FROM strategic_analyses WHERE user_id = ? ORDER BY generated_at DESC, rowid DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch latest strategic analysis")?;

        row.map(snapshot_from_row).transpose()
    }

    pub async fn list(&self, user_id: &str, limit: i64) -> Result<Vec<StrategicAnalysis>> {
        let rows = sqlx::query(
            "SELECT * FROM strategic_analyses WHERE user_id = ? ORDER BY generated_at DESC, rowid DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await
        .context("failed to list strategic analyses")?;

        rows.into_iter().map(snapshot_from_row).collect()
    }

    /// Bump the latest snapshot's counter. A no-op (returns false) when the
    /// user has no snapshot yet.
    pub async fn increment_counter(&self, user_id: &str) -> Result<bool> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection for counter increment")?;
        Self::increment_counter_in(&mut *conn, user_id).await
    }

    /// Counter bump inside the caller's transaction.
    pub async fn increment_counter_in(conn: &mut SqliteConnection, user_id: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE strategic_analyses SET new_communications_count = new_communications_count + 1 WHERE id = ({LATEST_ID_SUBQUERY})"
        ))
        .bind(user_id)
        .execute(conn)
        .await
        .context("failed to increment strategic counter")?;

        Ok(result.rows_affected() == 1)
    }
}

fn json_list<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Vec<T>> {
    let raw: String = row
        .try_get(column)
        .with_context(|| format!("failed to read {column}"))?;
    let parsed = serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {column}"))?;
    Ok(parsed)
}

fn snapshot_from_row(row: SqliteRow) -> Result<StrategicAnalysis> {
    Ok(StrategicAnalysis {
        id: row.try_get("id").context("failed to read id")?,
        user_id: row.try_get("user_id").context("failed to read user_id")?,
        generated_at: row
            .try_get("generated_at")
            .context("failed to read generated_at")?,
        summary: row.try_get("summary").context("failed to read summary")?,
        critical_issues: json_list(&row, "critical_issues")?,
        recommended_actions: json_list(&row, "recommended_actions")?,
        monitoring_priorities: json_list(&row, "monitoring_priorities")?,
        new_communications_count: row
            .try_get("new_communications_count")
            .context("failed to read new_communications_count")?,
    })
}
