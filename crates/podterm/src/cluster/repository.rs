//! Cluster credential store.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// Stored connection details for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClusterRecord {
    pub id: i64,
    pub name: String,
    pub server_url: String,
    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,
    #[serde(skip_serializing)]
    pub certificate_authority_data: Option<String>,
    pub insecure_skip_tls_verify: bool,
    pub created_at: String,
}

/// Input for registering a cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCluster {
    pub name: String,
    pub server_url: String,
    pub bearer_token: Option<String>,
    pub certificate_authority_data: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

const CLUSTER_COLUMNS: &str = "id, name, server_url, bearer_token, certificate_authority_data, \
     insecure_skip_tls_verify, created_at";

/// Repository for cluster credentials.
#[derive(Debug, Clone)]
pub struct ClusterRepository {
    pool: SqlitePool,
}

impl ClusterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, cluster: &NewCluster) -> Result<ClusterRecord> {
        let id = sqlx::query(
            r#"
            INSERT INTO clusters (
                name, server_url, bearer_token, certificate_authority_data, insecure_skip_tls_verify
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cluster.name)
        .bind(&cluster.server_url)
        .bind(&cluster.bearer_token)
        .bind(&cluster.certificate_authority_data)
        .bind(cluster.insecure_skip_tls_verify)
        .execute(&self.pool)
        .await
        .context("creating cluster")?
        .last_insert_rowid();

        self.get(id)
            .await?
            .context("cluster vanished after insert")
    }

    pub async fn get(&self, id: i64) -> Result<Option<ClusterRecord>> {
        let query = format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = ?");
        let record = sqlx::query_as::<_, ClusterRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching cluster")?;
        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<ClusterRecord>> {
        let query = format!("SELECT {CLUSTER_COLUMNS} FROM clusters ORDER BY id");
        let records = sqlx::query_as::<_, ClusterRecord>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing clusters")?;
        Ok(records)
    }

    /// Returns true when a row was removed.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting cluster")?;
        Ok(result.rows_affected() > 0)
    }
}
