use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Document, StoreError, TriggerStore};

type Workspaces = HashMap<String, HashMap<String, Document>>;

/// In-memory store implementation.
///
/// Cloning is cheap and clones share the same data, so one instance can be
/// handed to a worker while a test inspects it.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTriggerStore {
  workspaces: Arc<RwLock<Workspaces>>,
  unavailable: Arc<AtomicBool>,
  writes: Arc<AtomicUsize>,
}

impl InMemoryTriggerStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Provision a workspace. Existing documents are kept.
  pub async fn create_workspace(&self, workspace: &str) {
    self
      .workspaces
      .write()
      .await
      .entry(workspace.to_string())
      .or_default();
  }

  /// Simulate an outage: every subsequent call fails until reset.
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  /// Number of successful `put` and `set_key` calls so far.
  pub fn writes(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  fn check(&self) -> Result<(), StoreError> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
    }
    Ok(())
  }

  fn missing(workspace: &str) -> StoreError {
    StoreError::Unavailable(format!("workspace '{}' is not provisioned", workspace))
  }
}

#[async_trait]
impl TriggerStore for InMemoryTriggerStore {
  async fn workspace_exists(&self, workspace: &str) -> Result<bool, StoreError> {
    self.check()?;
    Ok(self.workspaces.read().await.contains_key(workspace))
  }

  async fn key_exists(
    &self,
    workspace: &str,
    document_id: &str,
    key: &str,
  ) -> Result<bool, StoreError> {
    self.check()?;
    let workspaces = self.workspaces.read().await;
    Ok(
      workspaces
        .get(workspace)
        .and_then(|docs| docs.get(document_id))
        .is_some_and(|doc| doc.contains_key(key)),
    )
  }

  async fn get(&self, workspace: &str, document_id: &str) -> Result<Document, StoreError> {
    self.check()?;
    let workspaces = self.workspaces.read().await;
    Ok(
      workspaces
        .get(workspace)
        .and_then(|docs| docs.get(document_id))
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn put(
    &self,
    workspace: &str,
    document_id: &str,
    data: Document,
  ) -> Result<(), StoreError> {
    self.check()?;
    let mut workspaces = self.workspaces.write().await;
    let docs = workspaces
      .get_mut(workspace)
      .ok_or_else(|| Self::missing(workspace))?;
    docs.insert(document_id.to_string(), data);
    self.writes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn set_key(
    &self,
    workspace: &str,
    document_id: &str,
    key: &str,
    value: serde_json::Value,
  ) -> Result<(), StoreError> {
    self.check()?;
    let mut workspaces = self.workspaces.write().await;
    let docs = workspaces
      .get_mut(workspace)
      .ok_or_else(|| Self::missing(workspace))?;
    docs
      .entry(document_id.to_string())
      .or_default()
      .insert(key.to_string(), value);
    self.writes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_in_memory_store() {
    let store = InMemoryTriggerStore::new();
    assert!(!store.workspace_exists("ws").await.unwrap());

    store.create_workspace("ws").await;
    assert!(store.workspace_exists("ws").await.unwrap());
    assert!(store.get("ws", "triggers").await.unwrap().is_empty());

    store
      .set_key("ws", "triggers", "t1", json!({"trigger_id": "t1"}))
      .await
      .unwrap();
    assert!(store.key_exists("ws", "triggers", "t1").await.unwrap());
    assert!(!store.key_exists("ws", "triggers", "t2").await.unwrap());

    let mut doc = store.get("ws", "triggers").await.unwrap();
    doc.insert("t2".to_string(), json!({"trigger_id": "t2"}));
    store.put("ws", "triggers", doc).await.unwrap();

    assert_eq!(store.get("ws", "triggers").await.unwrap().len(), 2);
    assert_eq!(store.writes(), 2);
  }

  #[tokio::test]
  async fn test_unprovisioned_workspace_rejects_writes() {
    let store = InMemoryTriggerStore::new();
    let result = store.set_key("nope", "triggers", "t1", json!({})).await;
    assert!(matches!(result, Err(StoreError::Unavailable(_))));
  }

  #[tokio::test]
  async fn test_outage() {
    let store = InMemoryTriggerStore::new();
    store.create_workspace("ws").await;
    store.set_unavailable(true);

    assert!(store.get("ws", "triggers").await.is_err());
    assert!(store.workspace_exists("ws").await.is_err());

    store.set_unavailable(false);
    assert!(store.get("ws", "triggers").await.is_ok());
  }
}
