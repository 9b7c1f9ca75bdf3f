//! Worker lifecycle per workspace.
//!
//! The [`Controller`] is an ordinary value owned by the caller. It keeps one
//! live [`WorkerHandle`] per workspace in its [`WorkerRegistry`] and opens
//! event sources through a [`SourceProvider`], handing over the credentials
//! the caller supplied.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use tripwire_action::ActionExecutor;
use tripwire_condition::ConditionEvaluator;
use tripwire_source::{EventSource, InMemoryEventLog, SourceError};
use tripwire_store::{StoreError, TriggerStore};

use crate::worker::{Worker, WorkerConfig, WorkerHandle, WorkerStatus};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
  #[error("workspace '{0}' does not exist")]
  NotFound(String),

  #[error("workspace '{0}' already has a running worker")]
  AlreadyRunning(String),

  #[error("workspace '{0}' has no active worker")]
  NotActive(String),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Source(#[from] SourceError),
}

/// Credentials for the event backend.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub username: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub password: Option<String>,
  /// Backend-specific settings, e.g. bootstrap servers.
  #[serde(default, flatten)]
  pub options: serde_json::Map<String, serde_json::Value>,
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("username", &self.username)
      .field("password", &self.password.as_ref().map(|_| "<redacted>"))
      .field("options", &self.options.keys().collect::<Vec<_>>())
      .finish()
  }
}

/// Opens an event source for a workspace.
///
/// The returned source must consume as consumer group `workspace`; the
/// worker subscribes it to the workspace topic.
#[async_trait]
pub trait SourceProvider: Send + Sync {
  async fn open(
    &self,
    workspace: &str,
    credentials: &Credentials,
  ) -> Result<Box<dyn EventSource>, SourceError>;
}

#[async_trait]
impl SourceProvider for InMemoryEventLog {
  async fn open(
    &self,
    workspace: &str,
    _credentials: &Credentials,
  ) -> Result<Box<dyn EventSource>, SourceError> {
    Ok(Box::new(self.consumer(workspace)))
  }
}

/// Workspace to live worker handle.
#[derive(Default)]
pub struct WorkerRegistry {
  workers: HashMap<String, WorkerHandle>,
}

impl WorkerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, workspace: &str) -> Option<&WorkerHandle> {
    self.workers.get(workspace)
  }

  pub fn insert(&mut self, handle: WorkerHandle) {
    self.workers.insert(handle.workspace().to_string(), handle);
  }

  pub fn remove(&mut self, workspace: &str) -> Option<WorkerHandle> {
    self.workers.remove(workspace)
  }

  pub fn drain(&mut self) -> Vec<WorkerHandle> {
    self.workers.drain().map(|(_, handle)| handle).collect()
  }

  pub fn len(&self) -> usize {
    self.workers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.workers.is_empty()
  }

  fn workspaces(&self) -> impl Iterator<Item = (&String, &WorkerHandle)> {
    self.workers.iter()
  }
}

/// Starts and stops workspace workers.
pub struct Controller {
  store: Arc<dyn TriggerStore>,
  provider: Arc<dyn SourceProvider>,
  evaluator: ConditionEvaluator,
  executor: ActionExecutor,
  config: WorkerConfig,
  registry: Mutex<WorkerRegistry>,
}

impl Controller {
  pub fn new(
    store: Arc<dyn TriggerStore>,
    provider: Arc<dyn SourceProvider>,
    evaluator: ConditionEvaluator,
    executor: ActionExecutor,
    config: WorkerConfig,
  ) -> Self {
    Self {
      store,
      provider,
      evaluator,
      executor,
      config,
      registry: Mutex::new(WorkerRegistry::new()),
    }
  }

  /// Start consuming events for `workspace`.
  ///
  /// A stopped or failed worker left in the registry is replaced.
  #[instrument(name = "controller_start", skip(self, credentials))]
  pub async fn start(&self, workspace: &str, credentials: Credentials) -> Result<(), ControllerError> {
    let mut registry = self.registry.lock().await;

    if let Some(existing) = registry.get(workspace) {
      if existing.is_running() {
        return Err(ControllerError::AlreadyRunning(workspace.to_string()));
      }
      if let Some(dead) = registry.remove(workspace) {
        let status = dead.status();
        if let Err(e) = dead.stop().await {
          warn!(workspace, error = %e, "replacing failed worker");
        } else {
          info!(workspace, status = ?status, "replacing stopped worker");
        }
      }
    }

    if !self.store.workspace_exists(workspace).await? {
      return Err(ControllerError::NotFound(workspace.to_string()));
    }

    let source = self.provider.open(workspace, &credentials).await?;
    let worker = Worker::new(
      workspace,
      self.store.clone(),
      source,
      self.evaluator.clone(),
      self.executor.clone(),
      self.config.clone(),
    );
    registry.insert(worker.spawn().await?);

    info!(workspace, "workspace started");
    Ok(())
  }

  /// Stop the worker for `workspace` and wait for it to settle.
  #[instrument(name = "controller_stop", skip(self))]
  pub async fn stop(&self, workspace: &str) -> Result<(), ControllerError> {
    let handle = self
      .registry
      .lock()
      .await
      .remove(workspace)
      .ok_or_else(|| ControllerError::NotActive(workspace.to_string()))?;

    if let Err(e) = handle.stop().await {
      warn!(workspace, error = %e, "worker had failed before stop");
    }
    info!(workspace, "workspace stopped");
    Ok(())
  }

  /// Status of the workspace's worker, if one is registered.
  pub async fn status(&self, workspace: &str) -> Option<WorkerStatus> {
    self.registry.lock().await.get(workspace).map(WorkerHandle::status)
  }

  /// Workspaces with a running worker, sorted.
  pub async fn active(&self) -> Vec<String> {
    let registry = self.registry.lock().await;
    let mut active: Vec<String> = registry
      .workspaces()
      .filter(|(_, handle)| handle.is_running())
      .map(|(workspace, _)| workspace.clone())
      .collect();
    active.sort();
    active
  }

  /// Stop every worker.
  pub async fn shutdown(&self) {
    let handles = self.registry.lock().await.drain();
    info!(workers = handles.len(), "shutting down");
    for handle in handles {
      let workspace = handle.workspace().to_string();
      if let Err(e) = handle.stop().await {
        warn!(workspace = %workspace, error = %e, "worker had failed before shutdown");
      }
    }
  }
}
