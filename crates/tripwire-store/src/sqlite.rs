use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::{Document, StoreError, TriggerStore};

/// SQLite-based store implementation.
///
/// Each document is a single JSON row keyed by `(workspace, document_id)`.
pub struct SqliteTriggerStore {
  pool: SqlitePool,
}

impl SqliteTriggerStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  /// Provision a workspace. Provisioning an existing workspace is a no-op.
  pub async fn create_workspace(&self, workspace: &str) -> Result<(), StoreError> {
    sqlx::query(
      r#"
            INSERT INTO workspaces (workspace, created_at)
            VALUES (?, ?)
            ON CONFLICT (workspace) DO NOTHING
            "#,
    )
    .bind(workspace)
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn fetch_document(
    tx: &mut Transaction<'_, Sqlite>,
    workspace: &str,
    document_id: &str,
  ) -> Result<Option<Document>, StoreError> {
    let row: Option<(String,)> = sqlx::query_as(
      r#"
            SELECT data
            FROM documents
            WHERE workspace = ? AND document_id = ?
            "#,
    )
    .bind(workspace)
    .bind(document_id)
    .fetch_optional(&mut **tx)
    .await?;

    row
      .map(|(data,)| {
        serde_json::from_str::<Document>(&data).map_err(|e| StoreError::Corrupt {
          workspace: workspace.to_string(),
          document_id: document_id.to_string(),
          message: e.to_string(),
        })
      })
      .transpose()
  }

  async fn upsert_document(
    tx: &mut Transaction<'_, Sqlite>,
    workspace: &str,
    document_id: &str,
    data: &Document,
  ) -> Result<(), StoreError> {
    let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM workspaces WHERE workspace = ?")
      .bind(workspace)
      .fetch_optional(&mut **tx)
      .await?;
    if exists.is_none() {
      return Err(StoreError::Unavailable(format!(
        "workspace '{}' is not provisioned",
        workspace
      )));
    }

    sqlx::query(
      r#"
            INSERT INTO documents (workspace, document_id, data, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (workspace, document_id)
            DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
            "#,
    )
    .bind(workspace)
    .bind(document_id)
    .bind(Json(data))
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;

    Ok(())
  }
}

#[async_trait]
impl TriggerStore for SqliteTriggerStore {
  async fn workspace_exists(&self, workspace: &str) -> Result<bool, StoreError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM workspaces WHERE workspace = ?")
      .bind(workspace)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.is_some())
  }

  async fn key_exists(
    &self,
    workspace: &str,
    document_id: &str,
    key: &str,
  ) -> Result<bool, StoreError> {
    Ok(self.get(workspace, document_id).await?.contains_key(key))
  }

  async fn get(&self, workspace: &str, document_id: &str) -> Result<Document, StoreError> {
    let mut tx = self.pool.begin().await?;
    let document = Self::fetch_document(&mut tx, workspace, document_id).await?;
    tx.commit().await?;
    Ok(document.unwrap_or_default())
  }

  async fn put(
    &self,
    workspace: &str,
    document_id: &str,
    data: Document,
  ) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;
    Self::upsert_document(&mut tx, workspace, document_id, &data).await?;
    tx.commit().await?;
    debug!(workspace, document_id, entries = data.len(), "document_put");
    Ok(())
  }

  async fn set_key(
    &self,
    workspace: &str,
    document_id: &str,
    key: &str,
    value: serde_json::Value,
  ) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;
    let mut document = Self::fetch_document(&mut tx, workspace, document_id)
      .await?
      .unwrap_or_default();
    document.insert(key.to_string(), value);
    Self::upsert_document(&mut tx, workspace, document_id, &document).await?;
    tx.commit().await?;
    debug!(workspace, document_id, key, "document_set_key");
    Ok(())
  }
}
