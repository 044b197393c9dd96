//! Ephemeral container audit trail.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::{EphemeralAction, EphemeralContainerRecord, NewEphemeralRecord};

/// Repository for ephemeral container actions.
#[derive(Debug, Clone)]
pub struct EphemeralContainerRepository {
    pool: SqlitePool,
}

impl EphemeralContainerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an action.
    #[instrument(skip(self, record), fields(container = %record.container_name, action = %record.action))]
    pub async fn record(&self, record: &NewEphemeralRecord) -> Result<()> {
        debug!("Recording ephemeral container action");

        sqlx::query(
            r#"
            INSERT INTO ephemeral_container_actions
                (cluster_id, namespace, pod_name, container_name, target_container, image,
                 manifest, action, user_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.cluster_id)
        .bind(&record.namespace)
        .bind(&record.pod_name)
        .bind(&record.container_name)
        .bind(&record.target_container)
        .bind(&record.image)
        .bind(&record.manifest)
        .bind(record.action.to_string())
        .bind(record.user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("inserting ephemeral container action")?;

        Ok(())
    }

    /// The Create record of a container, if this service created it.
    pub async fn find_created(
        &self,
        cluster_id: i64,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
    ) -> Result<Option<EphemeralContainerRecord>> {
        let record = sqlx::query_as::<_, EphemeralContainerRecord>(
            r#"
            SELECT id, cluster_id, namespace, pod_name, container_name, target_container, image,
                   manifest, action, user_id, created_at
            FROM ephemeral_container_actions
            WHERE cluster_id = ? AND namespace = ? AND pod_name = ? AND container_name = ?
              AND action = ?
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(cluster_id)
        .bind(namespace)
        .bind(pod_name)
        .bind(container_name)
        .bind(EphemeralAction::Create.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("fetching ephemeral container record")?;

        Ok(record)
    }

    /// Every action recorded for a pod, oldest first.
    pub async fn list_for_pod(
        &self,
        cluster_id: i64,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Vec<EphemeralContainerRecord>> {
        let records = sqlx::query_as::<_, EphemeralContainerRecord>(
            r#"
            SELECT id, cluster_id, namespace, pod_name, container_name, target_container, image,
                   manifest, action, user_id, created_at
            FROM ephemeral_container_actions
            WHERE cluster_id = ? AND namespace = ? AND pod_name = ?
            ORDER BY id
            "#,
        )
        .bind(cluster_id)
        .bind(namespace)
        .bind(pod_name)
        .fetch_all(&self.pool)
        .await
        .context("listing ephemeral container actions")?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn record(container: &str, action: EphemeralAction) -> NewEphemeralRecord {
        NewEphemeralRecord {
            cluster_id: 1,
            namespace: "default".to_string(),
            pod_name: "web-0".to_string(),
            container_name: container.to_string(),
            target_container: "nginx".to_string(),
            image: "alpine:latest".to_string(),
            manifest: None,
            action,
            user_id: 2,
        }
    }

    #[tokio::test]
    async fn only_create_records_count_as_created() {
        let db = Database::in_memory().await.unwrap();
        let repo = EphemeralContainerRepository::new(db.pool().clone());

        repo.record(&record("dbg-ab12c", EphemeralAction::Accessed))
            .await
            .unwrap();
        assert!(
            repo.find_created(1, "default", "web-0", "dbg-ab12c")
                .await
                .unwrap()
                .is_none()
        );

        repo.record(&record("dbg-ab12c", EphemeralAction::Create))
            .await
            .unwrap();
        let found = repo
            .find_created(1, "default", "web-0", "dbg-ab12c")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.action, EphemeralAction::Create);
        assert_eq!(found.user_id, 2);

        assert!(
            repo.find_created(1, "other", "web-0", "dbg-ab12c")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(repo.list_for_pod(1, "default", "web-0").await.unwrap().len(), 2);
    }
}
