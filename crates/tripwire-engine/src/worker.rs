//! Per-workspace worker.
//!
//! A worker owns its workspace's event stream. For every event it reads the
//! trigger document, evaluates conditions, executes the matches that have not
//! already been processed, records their outcomes and then commits the
//! event's position. A position is committed only once every match for it has
//! a final outcome, so an event interrupted by a stop or crash is delivered
//! again and resumes from its checkpoints.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tripwire_action::{ActionExecutor, ExecutionError, Journal, JournalError};
use tripwire_condition::ConditionEvaluator;
use tripwire_source::{EventSource, SourceError};
use tripwire_store::{StoreError, TriggerStore};
use tripwire_trigger::{Event, InstanceStatus, Position, Trigger, WorkflowInstance};

use crate::documents::{INSTANCES, PROCESSED, TRIGGERS};
use crate::journal::StoreJournal;
use crate::{decode_triggers, execution_key};

/// Errors that stop a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Source(#[from] SourceError),

  #[error("checkpoint journal failed: {0}")]
  Journal(#[from] JournalError),

  #[error("worker task panicked: {0}")]
  Panicked(String),

  #[error("position {0} left unfinished without a stop request")]
  Unfinished(Position),
}

/// Lifecycle state of a worker, published through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum WorkerStatus {
  Running,
  Stopped,
  Failed(String),
}

/// Worker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Prefixed to the workspace name to form the topic the worker consumes.
  pub topic_prefix: String,
  /// Upper bound on concurrently running executions for one event.
  pub max_concurrent_executions: usize,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      topic_prefix: String::new(),
      max_concurrent_executions: 16,
    }
  }
}

impl WorkerConfig {
  pub fn topic(&self, workspace: &str) -> String {
    format!("{}{}", self.topic_prefix, workspace)
  }
}

/// Outcome of one matched execution, collected before any of them is
/// recorded so that a store failure never abandons a running sibling.
enum Outcome {
  Finished {
    key: String,
    trigger: Trigger,
    journal: Arc<StoreJournal>,
    instance: WorkflowInstance,
  },
  Unfinished,
  Broken(WorkerError),
}

/// The consume loop for one workspace.
///
/// The source is not `Sync`, so the loop only ever holds the worker by
/// unique reference across await points.
pub struct Worker {
  workspace: String,
  store: Arc<dyn TriggerStore>,
  source: Box<dyn EventSource>,
  evaluator: ConditionEvaluator,
  executor: ActionExecutor,
  config: WorkerConfig,
  /// Last offset this worker committed, per (topic, partition).
  committed: HashMap<(String, u32), u64>,
}

impl Worker {
  pub fn new(
    workspace: impl Into<String>,
    store: Arc<dyn TriggerStore>,
    source: Box<dyn EventSource>,
    evaluator: ConditionEvaluator,
    executor: ActionExecutor,
    config: WorkerConfig,
  ) -> Self {
    Self {
      workspace: workspace.into(),
      store,
      source,
      evaluator,
      executor,
      config,
      committed: HashMap::new(),
    }
  }

  /// Subscribe to the workspace topic and start the loop on its own task.
  ///
  /// Subscription errors are returned here; anything later is reported
  /// through the handle's status.
  pub async fn spawn(mut self) -> Result<WorkerHandle, SourceError> {
    let topic = self.config.topic(&self.workspace);
    self.source.subscribe(&topic).await?;

    let cancel = CancellationToken::new();
    let (status_tx, status_rx) = watch::channel(WorkerStatus::Running);
    let workspace = self.workspace.clone();

    let join = tokio::spawn(self.run(cancel.clone(), status_tx));

    info!(workspace = %workspace, topic = %topic, "worker started");
    Ok(WorkerHandle {
      workspace,
      cancel,
      status: status_rx,
      join,
    })
  }

  async fn run(
    mut self,
    cancel: CancellationToken,
    status: watch::Sender<WorkerStatus>,
  ) -> Result<(), WorkerError> {
    let result = loop {
      let next = tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!(workspace = %self.workspace, "worker cancelled");
          break Ok(());
        }
        next = self.source.recv() => next,
      };

      match next {
        Ok(Some(event)) => {
          let position = event.position.clone();
          match self.process(event, &cancel).await {
            Ok(true) => {}
            // Later commits would cover this position, so nothing more is
            // consumed until it is redelivered.
            Ok(false) if cancel.is_cancelled() => {
              info!(workspace = %self.workspace, position = %position, "worker cancelled mid-event");
              break Ok(());
            }
            Ok(false) => break Err(WorkerError::Unfinished(position)),
            Err(e) => break Err(e),
          }
        }
        Ok(None) => {
          info!(workspace = %self.workspace, "event stream ended");
          break Ok(());
        }
        Err(e) => break Err(WorkerError::Source(e)),
      }
    };

    match &result {
      Ok(()) => {
        status.send_replace(WorkerStatus::Stopped);
      }
      Err(e) => {
        error!(workspace = %self.workspace, error = %e, "worker failed");
        status.send_replace(WorkerStatus::Failed(e.to_string()));
      }
    }
    result
  }

  #[instrument(
    name = "worker_event",
    skip_all,
    fields(workspace = %self.workspace, position = %event.position)
  )]
  /// Returns whether the event's position was committed (or needed no
  /// commit); `false` means it is left for redelivery.
  async fn process(&mut self, event: Event, cancel: &CancellationToken) -> Result<bool, WorkerError> {
    let document = self.store.get(&self.workspace, TRIGGERS).await?;
    let triggers = decode_triggers(&self.workspace, &document);
    let matched = self.evaluator.evaluate(&event, &triggers);

    let mut pending = Vec::new();
    for trigger in matched {
      let key = execution_key(&event.position, &trigger.trigger_id);
      if self.store.key_exists(&self.workspace, PROCESSED, &key).await? {
        debug!(key = %key, "already processed");
        continue;
      }
      pending.push((key, trigger.clone()));
    }

    let outcomes = self.execute(&event, pending, cancel).await;

    let mut complete = true;
    let mut finished = Vec::new();
    for outcome in outcomes {
      match outcome {
        Outcome::Finished {
          key,
          trigger,
          journal,
          instance,
        } => finished.push((key, trigger, journal, instance)),
        Outcome::Unfinished => complete = false,
        Outcome::Broken(e) => return Err(e),
      }
    }

    let mut spent = Vec::new();
    for (key, trigger, journal, instance) in finished {
      self.record(&key, &instance).await?;
      journal.release().await?;
      if trigger.transient {
        spent.push(trigger.trigger_id);
      }
    }
    self.remove_spent(spent).await?;

    if complete {
      self.commit(&event.position).await?;
    } else {
      info!(position = %event.position, "leaving position uncommitted for redelivery");
    }
    Ok(complete)
  }

  /// Run every pending match concurrently, bounded by the configured limit.
  async fn execute(
    &mut self,
    event: &Event,
    pending: Vec<(String, Trigger)>,
    cancel: &CancellationToken,
  ) -> Vec<Outcome> {
    let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_executions.max(1)));
    let event = Arc::new(event.clone());
    let mut set = JoinSet::new();

    for (key, trigger) in pending {
      let store = self.store.clone();
      let workspace = self.workspace.clone();
      let executor = self.executor.clone();
      let semaphore = semaphore.clone();
      let event = event.clone();
      let token = cancel.child_token();

      set.spawn(async move {
        let Ok(_permit) = semaphore.acquire_owned().await else {
          return Outcome::Unfinished;
        };
        let journal = match StoreJournal::open(store, &workspace, &key).await {
          Ok(journal) => Arc::new(journal),
          Err(e) => return Outcome::Broken(e.into()),
        };

        // Run on its own task so a panicking handler fails only this
        // execution.
        let run = {
          let trigger = trigger.clone();
          let event = event.clone();
          let shared: Arc<dyn Journal> = journal.clone();
          tokio::spawn(async move { executor.execute(&trigger, &event, shared, token).await })
        };

        let instance = match run.await {
          Ok(Ok(instance)) if instance.status == InstanceStatus::Cancelled => {
            info!(key = %key, "execution cancelled, checkpoints kept");
            return Outcome::Unfinished;
          }
          Ok(Ok(instance)) => instance,
          Ok(Err(ExecutionError::Journal(e))) => return Outcome::Broken(e.into()),
          Ok(Err(e)) => {
            error!(key = %key, error = %e, "execution aborted");
            aborted(&trigger, &event, e.to_string())
          }
          Err(e) => {
            error!(key = %key, error = %e, "execution panicked");
            aborted(&trigger, &event, format!("execution panicked: {}", e))
          }
        };
        Outcome::Finished {
          key,
          trigger,
          journal,
          instance,
        }
      });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = set.join_next().await {
      match joined {
        Ok(outcome) => outcomes.push(outcome),
        Err(e) => outcomes.push(Outcome::Broken(WorkerError::Panicked(e.to_string()))),
      }
    }
    outcomes
  }

  /// Persist the final outcome of an execution: the instance record, then
  /// the processed marker that stops it from running again.
  async fn record(&mut self, key: &str, instance: &WorkflowInstance) -> Result<(), WorkerError> {
    let record = serde_json::to_value(instance)
      .map_err(|e| StoreError::Unavailable(format!("instance not encodable: {}", e)))?;
    self
      .store
      .set_key(&self.workspace, INSTANCES, key, record)
      .await?;

    let marker = json!({
      "instance_id": instance.instance_id,
      "status": instance.status,
      "finished_at": instance.finished_at,
    });
    self
      .store
      .set_key(&self.workspace, PROCESSED, key, marker)
      .await?;

    match instance.status {
      InstanceStatus::Succeeded => info!(key = %key, "execution succeeded"),
      _ => warn!(
        key = %key,
        error = instance.error.as_deref().unwrap_or_default(),
        "execution failed"
      ),
    }
    Ok(())
  }

  /// Drop transient triggers that have fired.
  async fn remove_spent(&mut self, spent: Vec<String>) -> Result<(), WorkerError> {
    if spent.is_empty() {
      return Ok(());
    }

    let mut document = self.store.get(&self.workspace, TRIGGERS).await?;
    let before = document.len();
    for trigger_id in &spent {
      document.remove(trigger_id);
    }
    if document.len() != before {
      self.store.put(&self.workspace, TRIGGERS, document).await?;
      info!(workspace = %self.workspace, removed = ?spent, "transient triggers removed");
    }
    Ok(())
  }

  async fn commit(&mut self, position: &Position) -> Result<(), WorkerError> {
    let partition = (position.topic.clone(), position.partition);
    if let Some(&last) = self.committed.get(&partition) {
      if position.offset <= last {
        debug!(position = %position, last, "position already committed");
        return Ok(());
      }
    }

    self.source.commit(position).await?;
    self.committed.insert(partition, position.offset);
    debug!(position = %position, "position committed");
    Ok(())
  }
}

fn aborted(trigger: &Trigger, event: &Event, reason: String) -> WorkflowInstance {
  let instance_id = uuid::Uuid::new_v4().to_string();
  WorkflowInstance::aborted(instance_id, &trigger.trigger_id, event.position.clone(), reason)
}

/// Handle to a running worker.
pub struct WorkerHandle {
  workspace: String,
  cancel: CancellationToken,
  status: watch::Receiver<WorkerStatus>,
  join: JoinHandle<Result<(), WorkerError>>,
}

impl WorkerHandle {
  pub fn workspace(&self) -> &str {
    &self.workspace
  }

  pub fn status(&self) -> WorkerStatus {
    if self.join.is_finished() && *self.status.borrow() == WorkerStatus::Running {
      return WorkerStatus::Failed("worker task exited unexpectedly".to_string());
    }
    self.status.borrow().clone()
  }

  pub fn is_running(&self) -> bool {
    self.status() == WorkerStatus::Running
  }

  /// A receiver that observes every status change.
  pub fn watch(&self) -> watch::Receiver<WorkerStatus> {
    self.status.clone()
  }

  /// Stop consuming and wait for in-flight executions to settle.
  ///
  /// Returns the loop's own result, so a worker that had already failed
  /// reports its failure here.
  pub async fn stop(self) -> Result<(), WorkerError> {
    self.cancel.cancel();
    match self.join.await {
      Ok(result) => {
        info!(workspace = %self.workspace, "worker stopped");
        result
      }
      Err(e) => Err(WorkerError::Panicked(e.to_string())),
    }
  }
}
