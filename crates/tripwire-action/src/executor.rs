//! Action chain interpreter.
//!
//! A chain runs step by step, threading a JSON state value: the event payload
//! enters the first step, each step's output becomes the next step's input,
//! and the last output is the instance output.
//!
//! Steps are addressed by path. Top-level steps are `"0"`, `"1"`, ...; nested
//! chains append a segment for the container and the index inside it:
//! `"2.b1.0"` (parallel branch), `"3.i4.0"` (map element), `"1.c0.2"` (choice
//! branch), `"1.default.0"` (choice default). Paths depend only on the chain
//! shape and item indices, so they are stable across restarts and key the
//! checkpoint journal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use tripwire_condition::ExpressionEngine;
use tripwire_trigger::{
  Action, ChoiceAction, ElementFailure, Event, InstanceStatus, MapAction, ParallelAction,
  TaskAction, Trigger, WorkflowInstance,
};

use crate::error::ExecutionError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::journal::Journal;
use crate::task::{TaskFailure, TaskRegistry, TaskRequest};

/// Executor tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
  /// Element concurrency for map nodes that don't set `max_concurrency`.
  pub default_map_concurrency: usize,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      default_map_concurrency: 8,
    }
  }
}

/// Runs a trigger's action chain for one event.
#[derive(Clone)]
pub struct ActionExecutor {
  inner: Arc<Inner>,
}

struct Inner {
  tasks: TaskRegistry,
  expressions: ExpressionEngine,
  notifier: Arc<dyn ExecutionNotifier>,
  config: ExecutorConfig,
}

/// Result of running a chain: either it ran off its end, or an `end` step
/// stopped it early.
enum Flow {
  Next(Value),
  Ended(Value),
}

impl Flow {
  fn into_value(self) -> Value {
    match self {
      Flow::Next(value) | Flow::Ended(value) => value,
    }
  }
}

/// Per-instance state shared by every step of one execution.
#[derive(Clone)]
struct RunContext {
  instance_id: String,
  trigger_id: String,
  event: Arc<Value>,
  context: Arc<Value>,
  journal: Arc<dyn Journal>,
  failures: Arc<Mutex<Vec<ElementFailure>>>,
}

impl ActionExecutor {
  pub fn new(tasks: TaskRegistry, config: ExecutorConfig) -> Self {
    Self::with_notifier(tasks, config, NoopNotifier)
  }

  pub fn with_notifier(
    tasks: TaskRegistry,
    config: ExecutorConfig,
    notifier: impl ExecutionNotifier + 'static,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        tasks,
        expressions: ExpressionEngine::new(),
        notifier: Arc::new(notifier),
        config,
      }),
    }
  }

  /// Execute `trigger`'s action chain for `event`.
  ///
  /// Business failures (a task that gives up, an unmatched choice, a map over
  /// its failure tolerance) and cancellation are reported through the
  /// returned instance's status. Only journal failures are returned as
  /// errors: they mean the execution state could not be persisted, and the
  /// caller must not treat the instance as finished.
  #[instrument(
    name = "instance_execute",
    skip_all,
    fields(trigger_id = %trigger.trigger_id, position = %event.position)
  )]
  pub async fn execute(
    &self,
    trigger: &Trigger,
    event: &Event,
    journal: Arc<dyn Journal>,
    cancel: CancellationToken,
  ) -> Result<WorkflowInstance, ExecutionError> {
    let mut instance = WorkflowInstance {
      instance_id: uuid::Uuid::new_v4().to_string(),
      trigger_id: trigger.trigger_id.clone(),
      position: event.position.clone(),
      status: InstanceStatus::Pending,
      output: Value::Null,
      error: None,
      element_failures: vec![],
      started_at: Utc::now(),
      finished_at: None,
    };

    if cancel.is_cancelled() {
      instance.status = instance.status.transition(InstanceStatus::Cancelled)?;
      instance.error = Some(ExecutionError::Cancelled.to_string());
      instance.finished_at = Some(Utc::now());
      return Ok(instance);
    }

    instance.status = instance.status.transition(InstanceStatus::Running)?;
    self.notify(ExecutionEvent::InstanceStarted {
      instance_id: instance.instance_id.clone(),
      trigger_id: instance.trigger_id.clone(),
      position: instance.position.clone(),
    });

    let ctx = RunContext {
      instance_id: instance.instance_id.clone(),
      trigger_id: trigger.trigger_id.clone(),
      event: Arc::new(json!({
        "source": event.source,
        "key": event.key,
        "payload": event.payload,
        "position": event.position,
      })),
      context: Arc::new(trigger.context.clone()),
      journal,
      failures: Arc::new(Mutex::new(vec![])),
    };

    let result = self
      .run_chain(&trigger.action_chain, String::new(), event.payload.clone(), &ctx, &cancel)
      .await;

    instance.element_failures = std::mem::take(&mut *ctx.failures.lock().await);

    match result {
      Ok(flow) => {
        instance.status = instance.status.transition(InstanceStatus::Succeeded)?;
        instance.output = flow.into_value();
      }
      Err(ExecutionError::Journal(e)) => {
        warn!(instance_id = %instance.instance_id, error = %e, "checkpoint journal failed");
        return Err(ExecutionError::Journal(e));
      }
      // A task that gives up on its own is a failure; only the caller's
      // token leaves the instance resumable.
      Err(ExecutionError::Cancelled) if cancel.is_cancelled() => {
        instance.status = instance.status.transition(InstanceStatus::Cancelled)?;
        instance.error = Some(ExecutionError::Cancelled.to_string());
      }
      Err(e) => {
        instance.status = instance.status.transition(InstanceStatus::Failed)?;
        instance.error = Some(e.to_string());
      }
    }
    instance.finished_at = Some(Utc::now());

    info!(
      instance_id = %instance.instance_id,
      status = ?instance.status,
      element_failures = instance.element_failures.len(),
      "instance finished"
    );
    self.notify(ExecutionEvent::InstanceFinished {
      instance_id: instance.instance_id.clone(),
      status: instance.status,
    });

    Ok(instance)
  }

  fn notify(&self, event: ExecutionEvent) {
    self.inner.notifier.notify(event);
  }

  fn run_chain<'a>(
    &'a self,
    chain: &'a [Action],
    path: String,
    state: Value,
    ctx: &'a RunContext,
    cancel: &'a CancellationToken,
  ) -> BoxFuture<'a, Result<Flow, ExecutionError>> {
    Box::pin(async move {
      let mut state = state;
      for (index, action) in chain.iter().enumerate() {
        if cancel.is_cancelled() {
          return Err(ExecutionError::Cancelled);
        }
        let step = if path.is_empty() {
          index.to_string()
        } else {
          format!("{}.{}", path, index)
        };
        debug!(step = %step, kind = action.kind(), "step started");

        match self.run_action(action, &step, state, ctx, cancel).await? {
          Flow::Next(output) => state = output,
          Flow::Ended(output) => return Ok(Flow::Ended(output)),
        }
      }
      Ok(Flow::Next(state))
    })
  }

  async fn run_action(
    &self,
    action: &Action,
    step: &str,
    state: Value,
    ctx: &RunContext,
    cancel: &CancellationToken,
  ) -> Result<Flow, ExecutionError> {
    match action {
      Action::Pass { result } => Ok(Flow::Next(result.clone().unwrap_or(state))),
      Action::Task(task) => self
        .run_task(task, step, state, ctx, cancel)
        .await
        .map(Flow::Next),
      Action::Choice(choice) => self.run_choice(choice, step, state, ctx, cancel).await,
      Action::Parallel(parallel) => self
        .run_parallel(parallel, step, state, ctx, cancel)
        .await
        .map(Flow::Next),
      Action::Map(map) => self
        .run_map(map, step, state, ctx, cancel)
        .await
        .map(Flow::Next),
      Action::End => Ok(Flow::Ended(state)),
      Action::Unknown => Err(ExecutionError::permanent(format!(
        "unknown action kind at step {}",
        step
      ))),
    }
  }

  async fn run_task(
    &self,
    task: &TaskAction,
    step: &str,
    state: Value,
    ctx: &RunContext,
    cancel: &CancellationToken,
  ) -> Result<Value, ExecutionError> {
    if let Some(output) = ctx.journal.load(step).await? {
      debug!(step = %step, task = %task.task, "task replayed from journal");
      self.notify(ExecutionEvent::TaskReplayed {
        instance_id: ctx.instance_id.clone(),
        step: step.to_string(),
        task: task.task.clone(),
      });
      return Ok(output);
    }

    let handler = self.inner.tasks.get(&task.task).ok_or_else(|| {
      ExecutionError::permanent(format!("unknown task handler '{}'", task.task))
    })?;
    let input = task.input.clone().unwrap_or(state);
    let max_attempts = task.retry.max_attempts.max(1);

    let mut attempt = 0;
    loop {
      attempt += 1;
      let request = TaskRequest {
        instance_id: ctx.instance_id.clone(),
        trigger_id: ctx.trigger_id.clone(),
        step: step.to_string(),
        attempt,
        input: input.clone(),
        context: ctx.context.as_ref().clone(),
      };

      let call = handler.call(request, cancel.clone());
      let result = match task.timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call).await {
          Ok(result) => result,
          Err(_) => Err(TaskFailure::Transient(format!("timed out after {}ms", ms))),
        },
        None => call.await,
      };

      let message = match result {
        Ok(output) => {
          ctx.journal.record(step, &output).await?;
          self.notify(ExecutionEvent::TaskCompleted {
            instance_id: ctx.instance_id.clone(),
            step: step.to_string(),
            task: task.task.clone(),
            attempt,
          });
          return Ok(output);
        }
        Err(TaskFailure::Transient(message)) => message,
        Err(failure) => return Err(failure.into()),
      };

      warn!(
        step = %step,
        task = %task.task,
        attempt,
        max_attempts,
        error = %message,
        "task attempt failed"
      );
      self.notify(ExecutionEvent::TaskAttemptFailed {
        instance_id: ctx.instance_id.clone(),
        step: step.to_string(),
        task: task.task.clone(),
        attempt,
        error: message.clone(),
      });

      if attempt >= max_attempts {
        return Err(ExecutionError::permanent(format!(
          "task '{}' failed after {} attempts: {}",
          task.task, attempt, message
        )));
      }

      let delay = task.retry.delay_after(attempt);
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
      }
    }
  }

  async fn run_choice(
    &self,
    choice: &ChoiceAction,
    step: &str,
    state: Value,
    ctx: &RunContext,
    cancel: &CancellationToken,
  ) -> Result<Flow, ExecutionError> {
    let vars = json!({
      "state": state,
      "event": ctx.event.as_ref(),
      "context": ctx.context.as_ref(),
    });

    for (index, branch) in choice.choices.iter().enumerate() {
      let matched = self
        .inner
        .expressions
        .is_true(&branch.condition, &vars)
        .map_err(|e| ExecutionError::permanent(e.to_string()))?;
      if matched {
        debug!(step = %step, branch = index, "choice matched");
        let path = format!("{}.c{}", step, index);
        return self.run_chain(&branch.next, path, state, ctx, cancel).await;
      }
    }

    match &choice.default {
      Some(default) => {
        let path = format!("{}.default", step);
        self.run_chain(default, path, state, ctx, cancel).await
      }
      None => Err(ExecutionError::permanent(format!(
        "no-matching-choice at step {}",
        step
      ))),
    }
  }

  /// Run every branch concurrently against the same input.
  ///
  /// The first failure cancels each branch that is still running, exactly
  /// once, and the node fails with that first error after the cancelled
  /// branches have wound down.
  async fn run_parallel(
    &self,
    parallel: &ParallelAction,
    step: &str,
    state: Value,
    ctx: &RunContext,
    cancel: &CancellationToken,
  ) -> Result<Value, ExecutionError> {
    let count = parallel.branches.len();
    let tokens: Vec<CancellationToken> = (0..count).map(|_| cancel.child_token()).collect();

    let mut set = JoinSet::new();
    let mut indices = HashMap::new();
    for (index, branch) in parallel.branches.iter().enumerate() {
      let executor = self.clone();
      let branch = branch.clone();
      let path = format!("{}.b{}", step, index);
      let state = state.clone();
      let ctx = ctx.clone();
      let token = tokens[index].clone();

      let handle = set.spawn(async move {
        executor
          .run_chain(&branch, path, state, &ctx, &token)
          .await
          .map(Flow::into_value)
      });
      indices.insert(handle.id(), index);
    }

    let mut outputs = vec![Value::Null; count];
    let mut finished = vec![false; count];
    let mut failure: Option<ExecutionError> = None;

    while let Some(joined) = set.join_next_with_id().await {
      let (index, result) = match joined {
        Ok((id, result)) => (indices[&id], result),
        Err(e) => (
          indices[&e.id()],
          Err(ExecutionError::permanent(format!("branch panicked: {}", e))),
        ),
      };
      finished[index] = true;

      match result {
        Ok(output) => outputs[index] = output,
        Err(e) => {
          if failure.is_some() {
            continue;
          }
          warn!(step = %step, branch = index, error = %e, "parallel branch failed");
          for (sibling, token) in tokens.iter().enumerate() {
            if !finished[sibling] && !token.is_cancelled() {
              token.cancel();
              self.notify(ExecutionEvent::BranchCancelled {
                instance_id: ctx.instance_id.clone(),
                step: step.to_string(),
                branch: sibling,
              });
            }
          }
          failure = Some(e);
        }
      }
    }

    match failure {
      Some(e) => Err(e),
      None => Ok(Value::Array(outputs)),
    }
  }

  /// Run the iterator chain once per item with bounded concurrency.
  ///
  /// Up to `tolerated_failure_count` element failures are recorded on the
  /// instance and leave a null in the output array. One more cancels the
  /// remaining elements and fails the node.
  async fn run_map(
    &self,
    map: &MapAction,
    step: &str,
    state: Value,
    ctx: &RunContext,
    cancel: &CancellationToken,
  ) -> Result<Value, ExecutionError> {
    let items = match &map.items {
      Some(expression) => {
        let vars = json!({
          "state": state,
          "event": ctx.event.as_ref(),
          "context": ctx.context.as_ref(),
        });
        self
          .inner
          .expressions
          .evaluate(expression, &vars)
          .map_err(|e| ExecutionError::permanent(e.to_string()))?
      }
      None => state,
    };
    let Value::Array(items) = items else {
      return Err(ExecutionError::permanent(format!(
        "map items at step {} are not an array",
        step
      )));
    };

    let limit = map
      .max_concurrency
      .unwrap_or(self.inner.config.default_map_concurrency)
      .max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let group = cancel.child_token();
    let count = items.len();

    let mut set = JoinSet::new();
    let mut indices = HashMap::new();
    for (index, item) in items.into_iter().enumerate() {
      let executor = self.clone();
      let iterator = map.iterator.clone();
      let path = format!("{}.i{}", step, index);
      let ctx = ctx.clone();
      let token = group.clone();
      let semaphore = semaphore.clone();

      let handle = set.spawn(async move {
        let permit = tokio::select! {
          permit = semaphore.acquire_owned() => permit.ok(),
          _ = token.cancelled() => None,
        };
        let Some(_permit) = permit else {
          return Err(ExecutionError::Cancelled);
        };
        executor
          .run_chain(&iterator, path, item, &ctx, &token)
          .await
          .map(Flow::into_value)
      });
      indices.insert(handle.id(), index);
    }

    let mut outputs = vec![Value::Null; count];
    let mut failed = 0;
    let mut fatal: Option<ExecutionError> = None;

    while let Some(joined) = set.join_next_with_id().await {
      let (index, result) = match joined {
        Ok((id, result)) => (indices[&id], result),
        Err(e) => (
          indices[&e.id()],
          Err(ExecutionError::permanent(format!("element panicked: {}", e))),
        ),
      };

      match result {
        Ok(output) => outputs[index] = output,
        Err(ExecutionError::Cancelled) if fatal.is_some() || cancel.is_cancelled() => {}
        Err(e @ ExecutionError::Journal(_)) => {
          group.cancel();
          if !matches!(fatal, Some(ExecutionError::Journal(_))) {
            fatal = Some(e);
          }
        }
        Err(e) => {
          failed += 1;
          warn!(step = %step, index, error = %e, "map element failed");
          self.notify(ExecutionEvent::ElementFailed {
            instance_id: ctx.instance_id.clone(),
            step: step.to_string(),
            index,
            error: e.to_string(),
          });
          ctx.failures.lock().await.push(ElementFailure {
            path: step.to_string(),
            index,
            error: e.to_string(),
          });

          if failed > map.tolerated_failure_count && fatal.is_none() {
            group.cancel();
            fatal = Some(ExecutionError::permanent(format!(
              "map at step {} exceeded tolerated failures ({} > {})",
              step, failed, map.tolerated_failure_count
            )));
          }
        }
      }
    }

    if let Some(e) = fatal {
      return Err(e);
    }
    if cancel.is_cancelled() {
      return Err(ExecutionError::Cancelled);
    }
    Ok(Value::Array(outputs))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::journal::NoopJournal;
  use tripwire_trigger::{Condition, Position};

  fn fixture(chain: Value) -> (Trigger, Event) {
    let trigger = Trigger {
      trigger_id: "t1".to_string(),
      transient: false,
      condition: Condition::new("always"),
      action_chain: serde_json::from_value(chain).unwrap(),
      context: json!({"threshold": 10}),
    };
    let event = Event {
      source: "orders".to_string(),
      key: None,
      payload: json!({"amount": 42}),
      position: Position::new("events", 0, 7),
    };
    (trigger, event)
  }

  #[tokio::test]
  async fn test_pass_and_end() {
    let executor = ActionExecutor::new(TaskRegistry::new(), ExecutorConfig::default());
    let (trigger, event) = fixture(json!([
      {"type": "pass", "result": {"stage": 1}},
      {"type": "end"},
      {"type": "pass", "result": {"stage": 2}},
    ]));

    let instance = executor
      .execute(&trigger, &event, Arc::new(NoopJournal), CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.output, json!({"stage": 1}));
    assert_eq!(instance.position, Position::new("events", 0, 7));
    assert!(instance.finished_at.is_some());
  }

  #[tokio::test]
  async fn test_empty_chain_outputs_payload() {
    let executor = ActionExecutor::new(TaskRegistry::new(), ExecutorConfig::default());
    let (trigger, event) = fixture(json!([]));

    let instance = executor
      .execute(&trigger, &event, Arc::new(NoopJournal), CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.output, json!({"amount": 42}));
  }

  #[tokio::test]
  async fn test_unknown_action_fails() {
    let executor = ActionExecutor::new(TaskRegistry::new(), ExecutorConfig::default());
    let (trigger, event) = fixture(json!([{"type": "wait", "seconds": 5}]));

    let instance = executor
      .execute(&trigger, &event, Arc::new(NoopJournal), CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error.unwrap().contains("unknown action kind"));
  }

  #[tokio::test]
  async fn test_cancelled_before_start() {
    let executor = ActionExecutor::new(TaskRegistry::new(), ExecutorConfig::default());
    let (trigger, event) = fixture(json!([{"type": "pass"}]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let instance = executor
      .execute(&trigger, &event, Arc::new(NoopJournal), cancel)
      .await
      .unwrap();
    assert_eq!(instance.status, InstanceStatus::Cancelled);
  }
}
