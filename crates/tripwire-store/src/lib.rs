//! Tripwire Store
//!
//! This crate provides the per-workspace document store contract used by the
//! trigger engine, plus an in-memory and a SQLite implementation.
//!
//! The [`TriggerStore`] trait is deliberately small:
//! - Workspace existence checks
//! - Whole-document reads and writes
//! - Single-key writes within a document
//!
//! Writes are last-writer-wins per document and there are no cross-document
//! transactions. Callers that read a document, merge into it and write it back
//! own the consistency of that sequence.

mod memory;
mod sqlite;

pub use memory::InMemoryTriggerStore;
pub use sqlite::SqliteTriggerStore;

use async_trait::async_trait;

/// A stored document: a JSON object keyed by entry id.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The backend could not serve the request.
  #[error("store unavailable: {0}")]
  Unavailable(String),

  /// A stored document could not be decoded.
  #[error("corrupt document '{document_id}' in workspace '{workspace}': {message}")]
  Corrupt {
    workspace: String,
    document_id: String,
    message: String,
  },
}

impl From<sqlx::Error> for StoreError {
  fn from(e: sqlx::Error) -> Self {
    StoreError::Unavailable(e.to_string())
  }
}

/// Document store scoped by workspace.
#[async_trait]
pub trait TriggerStore: Send + Sync {
  /// Whether the workspace has been provisioned.
  async fn workspace_exists(&self, workspace: &str) -> Result<bool, StoreError>;

  /// Whether `key` is present in the given document.
  async fn key_exists(
    &self,
    workspace: &str,
    document_id: &str,
    key: &str,
  ) -> Result<bool, StoreError>;

  /// Read a whole document. A missing document reads as empty.
  async fn get(&self, workspace: &str, document_id: &str) -> Result<Document, StoreError>;

  /// Replace a whole document.
  async fn put(&self, workspace: &str, document_id: &str, data: Document)
  -> Result<(), StoreError>;

  /// Write a single key within a document, creating the document if needed.
  async fn set_key(
    &self,
    workspace: &str,
    document_id: &str,
    key: &str,
    value: serde_json::Value,
  ) -> Result<(), StoreError>;
}
