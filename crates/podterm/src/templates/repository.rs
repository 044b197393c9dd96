//! Template database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::TerminalTemplate;

/// Repository for debug pod templates.
#[derive(Debug, Clone)]
pub struct TemplateRepository {
    pool: SqlitePool,
}

impl TemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// All templates in apply order.
    pub async fn fetch_all(&self) -> Result<Vec<TerminalTemplate>> {
        let templates = sqlx::query_as::<_, TerminalTemplate>(
            r#"
            SELECT id, template_name, template_data, gvk, apply_order, updated_at
            FROM terminal_access_templates
            ORDER BY apply_order, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("fetching terminal templates")?;

        Ok(templates)
    }

    pub async fn fetch_by_name(&self, name: &str) -> Result<Option<TerminalTemplate>> {
        let template = sqlx::query_as::<_, TerminalTemplate>(
            r#"
            SELECT id, template_name, template_data, gvk, apply_order, updated_at
            FROM terminal_access_templates
            WHERE template_name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("fetching terminal template")?;

        Ok(template)
    }

    /// Insert or replace a template by name.
    pub async fn upsert(&self, name: &str, data: &str, gvk: &str, apply_order: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO terminal_access_templates (template_name, template_data, gvk, apply_order)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(template_name) DO UPDATE SET
                template_data = excluded.template_data,
                gvk = excluded.gvk,
                apply_order = excluded.apply_order,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            "#,
        )
        .bind(name)
        .bind(data)
        .bind(gvk)
        .bind(apply_order)
        .execute(&self.pool)
        .await
        .context("saving terminal template")?;

        Ok(())
    }
}
