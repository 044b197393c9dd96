//! Terminal session database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{NewTerminalAccess, TerminalAccessData, TerminalMetadata, TerminalStatus};

const COLUMNS: &str = "id, user_id, cluster_id, node_name, pod_name, metadata, status, \
                       status_reason, created_at, updated_at";

/// Repository for session rows.
#[derive(Debug, Clone)]
pub struct TerminalAccessRepository {
    pool: SqlitePool,
}

impl TerminalAccessRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new row in `Starting` and return it with its id.
    pub async fn save(&self, new: &NewTerminalAccess) -> Result<TerminalAccessData> {
        let now = Utc::now().to_rfc3339();
        let metadata = serde_json::to_string(&new.metadata).context("encoding metadata")?;
        let id = sqlx::query(
            r#"
            INSERT INTO user_terminal_access_data (
                user_id, cluster_id, node_name, pod_name, metadata,
                status, status_reason, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(new.user_id)
        .bind(new.cluster_id)
        .bind(&new.node_name)
        .bind(&new.pod_name)
        .bind(&metadata)
        .bind(TerminalStatus::Starting.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("saving terminal session")?
        .last_insert_rowid();

        self.get(id)
            .await?
            .context("terminal session vanished after insert")
    }

    pub async fn get(&self, id: i64) -> Result<Option<TerminalAccessData>> {
        let row = sqlx::query_as::<_, TerminalAccessData>(&format!(
            "SELECT {COLUMNS} FROM user_terminal_access_data WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching terminal session")?;

        Ok(row)
    }

    /// Move a row to `status`. Writes that would break the state machine are ignored;
    /// returns whether the row was updated.
    pub async fn update_status(
        &self,
        id: i64,
        status: TerminalStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let allowed = status.allowed_from();
        let placeholders = vec!["?"; allowed.len()].join(", ");
        let sql = format!(
            "UPDATE user_terminal_access_data SET status = ?, status_reason = ?, updated_at = ? \
             WHERE id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(status.to_string())
            .bind(reason)
            .bind(Utc::now().to_rfc3339())
            .bind(id);
        for from in allowed {
            query = query.bind(from.to_string());
        }
        let result = query
            .execute(&self.pool)
            .await
            .context("updating terminal session status")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_metadata(&self, id: i64, metadata: &TerminalMetadata) -> Result<()> {
        let metadata = serde_json::to_string(metadata).context("encoding metadata")?;
        sqlx::query(
            "UPDATE user_terminal_access_data SET metadata = ?, updated_at = ? WHERE id = ?",
        )
        .bind(metadata)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating terminal session metadata")?;

        Ok(())
    }

    pub async fn update_node_name(&self, id: i64, node_name: &str) -> Result<()> {
        sqlx::query(
            "UPDATE user_terminal_access_data SET node_name = ?, updated_at = ? WHERE id = ?",
        )
        .bind(node_name)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating terminal session node")?;

        Ok(())
    }

    /// Starting/Running rows of one user.
    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<TerminalAccessData>> {
        let rows = sqlx::query_as::<_, TerminalAccessData>(&format!(
            "SELECT {COLUMNS} FROM user_terminal_access_data \
             WHERE user_id = ? AND status IN ('Starting', 'Running') ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing live sessions for user")?;

        Ok(rows)
    }

    /// Starting/Running rows of every user.
    pub async fn list_all_live(&self) -> Result<Vec<TerminalAccessData>> {
        let rows = sqlx::query_as::<_, TerminalAccessData>(&format!(
            "SELECT {COLUMNS} FROM user_terminal_access_data \
             WHERE status IN ('Starting', 'Running') ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing live sessions")?;

        Ok(rows)
    }
}
