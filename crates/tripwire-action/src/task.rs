//! External units of work invoked by `task` actions.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome of a failed task call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskFailure {
  /// Worth retrying.
  #[error("transient: {0}")]
  Transient(String),

  /// Retrying will not help.
  #[error("permanent: {0}")]
  Permanent(String),

  /// The handler honored a cancellation request.
  #[error("cancelled")]
  Cancelled,
}

/// Input handed to a task handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
  pub instance_id: String,
  pub trigger_id: String,
  /// Step path of the task within the chain, stable across restarts.
  pub step: String,
  /// 1-based attempt number.
  pub attempt: u32,
  pub input: serde_json::Value,
  pub context: serde_json::Value,
}

/// A unit of work reachable from `task` actions.
///
/// The token is cancelled when the execution is shutting down or a sibling
/// branch failed. Handlers that can stop early should return
/// [`TaskFailure::Cancelled`]; handlers that cannot may ignore it and finish.
#[async_trait]
pub trait TaskHandler: Send + Sync {
  async fn call(
    &self,
    request: TaskRequest,
    cancel: CancellationToken,
  ) -> Result<serde_json::Value, TaskFailure>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
  F: Fn(TaskRequest, CancellationToken) -> Fut + Send + Sync,
  Fut: Future<Output = Result<serde_json::Value, TaskFailure>> + Send + 'static,
{
  async fn call(
    &self,
    request: TaskRequest,
    cancel: CancellationToken,
  ) -> Result<serde_json::Value, TaskFailure> {
    (self.0)(request, cancel).await
  }
}

/// Returns its input unchanged.
pub struct EchoTask;

#[async_trait]
impl TaskHandler for EchoTask {
  async fn call(
    &self,
    request: TaskRequest,
    _cancel: CancellationToken,
  ) -> Result<serde_json::Value, TaskFailure> {
    Ok(request.input)
  }
}

/// Logs its input and returns it unchanged.
pub struct LogTask;

#[async_trait]
impl TaskHandler for LogTask {
  async fn call(
    &self,
    request: TaskRequest,
    _cancel: CancellationToken,
  ) -> Result<serde_json::Value, TaskFailure> {
    info!(
      instance_id = %request.instance_id,
      trigger_id = %request.trigger_id,
      step = %request.step,
      input = %request.input,
      "task_log"
    );
    Ok(request.input)
  }
}

/// Name-to-handler map for task actions.
#[derive(Clone, Default)]
pub struct TaskRegistry {
  handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry holding the `echo` and `log` handlers.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    registry.register("echo", EchoTask);
    registry.register("log", LogTask);
    registry
  }

  pub fn register(&mut self, name: impl Into<String>, handler: impl TaskHandler + 'static) {
    self.handlers.insert(name.into(), Arc::new(handler));
  }

  /// Register a closure as a handler.
  pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
  where
    F: Fn(TaskRequest, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskFailure>> + Send + 'static,
  {
    self.register(name, FnHandler(f));
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
    self.handlers.get(name).cloned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn request(input: serde_json::Value) -> TaskRequest {
    TaskRequest {
      instance_id: "i".to_string(),
      trigger_id: "t".to_string(),
      step: "0".to_string(),
      attempt: 1,
      input,
      context: json!({}),
    }
  }

  #[tokio::test]
  async fn test_builtin_echo() {
    let registry = TaskRegistry::with_builtins();
    let echo = registry.get("echo").unwrap();
    let output = echo
      .call(request(json!({"a": 1})), CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(output, json!({"a": 1}));
    assert!(registry.get("missing").is_none());
  }

  #[tokio::test]
  async fn test_register_fn() {
    let mut registry = TaskRegistry::new();
    registry.register_fn("double", |req: TaskRequest, _cancel| async move {
      let n = req.input.as_i64().ok_or_else(|| TaskFailure::Permanent("not a number".into()))?;
      Ok(json!(n * 2))
    });

    let double = registry.get("double").unwrap();
    assert_eq!(
      double.call(request(json!(21)), CancellationToken::new()).await,
      Ok(json!(42))
    );
    assert_eq!(
      double.call(request(json!("x")), CancellationToken::new()).await,
      Err(TaskFailure::Permanent("not a number".into()))
    );
  }
}
