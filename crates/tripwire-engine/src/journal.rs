use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tripwire_action::{Journal, JournalError};
use tripwire_store::{Document, TriggerStore};

use crate::documents::CHECKPOINTS;

/// Checkpoint journal for one execution key, persisted in the workspace's
/// `checkpoints` document.
///
/// The entry is read once when the journal is opened and written through on
/// every record. Concurrent records from parallel branches are serialized by
/// the journal's own lock.
pub struct StoreJournal {
  store: Arc<dyn TriggerStore>,
  workspace: String,
  key: String,
  steps: Mutex<Document>,
}

impl StoreJournal {
  pub async fn open(
    store: Arc<dyn TriggerStore>,
    workspace: &str,
    key: &str,
  ) -> Result<Self, JournalError> {
    let document = store
      .get(workspace, CHECKPOINTS)
      .await
      .map_err(|e| JournalError(e.to_string()))?;
    let steps = match document.get(key) {
      Some(serde_json::Value::Object(steps)) => steps.clone(),
      _ => Document::new(),
    };

    Ok(Self {
      store,
      workspace: workspace.to_string(),
      key: key.to_string(),
      steps: Mutex::new(steps),
    })
  }
}

#[async_trait]
impl Journal for StoreJournal {
  async fn load(&self, step: &str) -> Result<Option<serde_json::Value>, JournalError> {
    Ok(self.steps.lock().await.get(step).cloned())
  }

  async fn record(&self, step: &str, output: &serde_json::Value) -> Result<(), JournalError> {
    let mut steps = self.steps.lock().await;
    let mut updated = steps.clone();
    updated.insert(step.to_string(), output.clone());

    self
      .store
      .set_key(
        &self.workspace,
        CHECKPOINTS,
        &self.key,
        serde_json::Value::Object(updated.clone()),
      )
      .await
      .map_err(|e| JournalError(e.to_string()))?;
    *steps = updated;
    Ok(())
  }

  /// Removes the entry from the `checkpoints` document.
  ///
  /// Read-modify-write of the whole document: callers release only once no
  /// other journal of the workspace is recording.
  async fn release(&self) -> Result<(), JournalError> {
    let mut steps = self.steps.lock().await;
    let mut document = self
      .store
      .get(&self.workspace, CHECKPOINTS)
      .await
      .map_err(|e| JournalError(e.to_string()))?;
    if document.remove(&self.key).is_some() {
      self
        .store
        .put(&self.workspace, CHECKPOINTS, document)
        .await
        .map_err(|e| JournalError(e.to_string()))?;
    }
    steps.clear();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tripwire_store::InMemoryTriggerStore;

  #[tokio::test]
  async fn test_survives_reopen() {
    let store = InMemoryTriggerStore::new();
    store.create_workspace("ws1").await;
    let store: Arc<dyn TriggerStore> = Arc::new(store);

    let journal = StoreJournal::open(store.clone(), "ws1", "ws1/0/1#t1").await.unwrap();
    journal.record("0", &json!({"charged": true})).await.unwrap();
    journal.record("1.b0.0", &json!(3)).await.unwrap();

    let reopened = StoreJournal::open(store.clone(), "ws1", "ws1/0/1#t1").await.unwrap();
    assert_eq!(reopened.load("0").await.unwrap(), Some(json!({"charged": true})));
    assert_eq!(reopened.load("1.b0.0").await.unwrap(), Some(json!(3)));
    assert_eq!(reopened.load("2").await.unwrap(), None);

    let other = StoreJournal::open(store.clone(), "ws1", "ws1/0/1#t2").await.unwrap();
    assert_eq!(other.load("0").await.unwrap(), None);

    reopened.release().await.unwrap();
    let released = StoreJournal::open(store.clone(), "ws1", "ws1/0/1#t1").await.unwrap();
    assert_eq!(released.load("0").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_release_removes_only_its_entry() {
    let store = InMemoryTriggerStore::new();
    store.create_workspace("ws1").await;
    let store: Arc<dyn TriggerStore> = Arc::new(store);

    let first = StoreJournal::open(store.clone(), "ws1", "ws1/0/1#t1").await.unwrap();
    let second = StoreJournal::open(store.clone(), "ws1", "ws1/0/1#t2").await.unwrap();
    first.record("0", &json!(1)).await.unwrap();
    second.record("0", &json!(2)).await.unwrap();

    first.release().await.unwrap();
    let document = store.get("ws1", CHECKPOINTS).await.unwrap();
    assert!(!document.contains_key("ws1/0/1#t1"));
    assert_eq!(document.get("ws1/0/1#t2"), Some(&json!({"0": 2})));

    second.release().await.unwrap();
    first.release().await.unwrap();
    assert!(store.get("ws1", CHECKPOINTS).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_record_fails_when_store_is_down() {
    let memory = InMemoryTriggerStore::new();
    memory.create_workspace("ws1").await;
    let journal = StoreJournal::open(Arc::new(memory.clone()), "ws1", "k").await.unwrap();

    memory.set_unavailable(true);
    assert!(journal.record("0", &json!(1)).await.is_err());

    memory.set_unavailable(false);
    assert_eq!(journal.load("0").await.unwrap(), None);
  }
}
