//! Durable checkpoints for task steps.
//!
//! Before a task step runs, the executor asks the journal whether the step
//! already completed in an earlier attempt of the same execution. If so, the
//! recorded output is reused and the task is not invoked again.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct JournalError(pub String);

/// Per-execution record of completed task step outputs.
#[async_trait]
pub trait Journal: Send + Sync {
  /// Output recorded for `step`, if it completed before.
  async fn load(&self, step: &str) -> Result<Option<serde_json::Value>, JournalError>;

  /// Record that `step` completed with `output`.
  async fn record(&self, step: &str, output: &serde_json::Value) -> Result<(), JournalError>;

  /// Drop everything recorded for this execution.
  async fn release(&self) -> Result<(), JournalError>;
}

/// A journal that remembers nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJournal;

#[async_trait]
impl Journal for NoopJournal {
  async fn load(&self, _step: &str) -> Result<Option<serde_json::Value>, JournalError> {
    Ok(None)
  }

  async fn record(&self, _step: &str, _output: &serde_json::Value) -> Result<(), JournalError> {
    Ok(())
  }

  async fn release(&self) -> Result<(), JournalError> {
    Ok(())
  }
}

/// Process-local journal. Suitable for tests and single-run use.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
  steps: Mutex<HashMap<String, serde_json::Value>>,
}

impl InMemoryJournal {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn len(&self) -> usize {
    self.steps.lock().await.len()
  }
}

#[async_trait]
impl Journal for InMemoryJournal {
  async fn load(&self, step: &str) -> Result<Option<serde_json::Value>, JournalError> {
    Ok(self.steps.lock().await.get(step).cloned())
  }

  async fn record(&self, step: &str, output: &serde_json::Value) -> Result<(), JournalError> {
    self
      .steps
      .lock()
      .await
      .insert(step.to_string(), output.clone());
    Ok(())
  }

  async fn release(&self) -> Result<(), JournalError> {
    self.steps.lock().await.clear();
    Ok(())
  }
}
