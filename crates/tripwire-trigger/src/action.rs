//! Action chain definitions.
//!
//! A chain is an ordered list of actions. `choice`, `parallel` and `map` carry
//! nested chains, which gives the workflow graph its branching shape.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Ordered list of actions executed in sequence.
pub type ActionChain = Vec<Action>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
  /// Identity transition. When `result` is set it replaces the state.
  Pass {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
  },
  Task(TaskAction),
  Choice(ChoiceAction),
  Parallel(ParallelAction),
  Map(MapAction),
  /// Terminates the enclosing workflow with the current state.
  End,
  /// Any action type this build does not know about.
  #[serde(other)]
  Unknown,
}

impl Action {
  pub fn kind(&self) -> &'static str {
    match self {
      Action::Pass { .. } => "pass",
      Action::Task(_) => "task",
      Action::Choice(_) => "choice",
      Action::Parallel(_) => "parallel",
      Action::Map(_) => "map",
      Action::End => "end",
      Action::Unknown => "unknown",
    }
  }
}

/// Invokes an external unit of work registered under `task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAction {
  pub task: String,
  /// Input override. The current state is sent when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub input: Option<serde_json::Value>,
  #[serde(default)]
  pub retry: RetryPolicy,
  /// Per-attempt timeout. A timed out attempt counts as a transient failure.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceAction {
  pub choices: Vec<ChoiceBranch>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<ActionChain>,
}

/// A guarded branch. `condition` is an expression over `state`, `event` and
/// `context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceBranch {
  pub condition: String,
  #[serde(default)]
  pub next: ActionChain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelAction {
  pub branches: Vec<ActionChain>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapAction {
  /// Expression selecting the items to iterate. Defaults to the state itself.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub items: Option<String>,
  pub iterator: ActionChain,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_concurrency: Option<usize>,
  #[serde(default)]
  pub tolerated_failure_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
  Constant,
  Linear,
  Exponential,
}

/// Bounded retry policy for task actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_interval_ms")]
  pub interval_ms: u64,
  #[serde(default = "default_backoff")]
  pub backoff: RetryBackoff,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_interval_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
  3
}

fn default_interval_ms() -> u64 {
  100
}

fn default_backoff() -> RetryBackoff {
  RetryBackoff::Exponential
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      interval_ms: default_interval_ms(),
      backoff: default_backoff(),
      max_interval_ms: None,
    }
  }
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      ..Self::default()
    }
  }

  /// Delay to wait after the given failed attempt (1-based).
  pub fn delay_after(&self, attempt: u32) -> Duration {
    let step = attempt.max(1) as u64;
    let ms = match self.backoff {
      RetryBackoff::Constant => self.interval_ms,
      RetryBackoff::Linear => self.interval_ms.saturating_mul(step),
      RetryBackoff::Exponential => {
        let exp = (step - 1).min(32) as u32;
        self.interval_ms.saturating_mul(1u64 << exp)
      }
    };
    let ms = match self.max_interval_ms {
      Some(max) => ms.min(max),
      None => ms,
    };
    Duration::from_millis(ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_exponential_backoff() {
    let policy = RetryPolicy {
      max_attempts: 5,
      interval_ms: 10,
      backoff: RetryBackoff::Exponential,
      max_interval_ms: Some(50),
    };

    assert_eq!(policy.delay_after(1), Duration::from_millis(10));
    assert_eq!(policy.delay_after(2), Duration::from_millis(20));
    assert_eq!(policy.delay_after(3), Duration::from_millis(40));
    assert_eq!(policy.delay_after(4), Duration::from_millis(50));
  }

  #[test]
  fn test_linear_and_constant_backoff() {
    let mut policy = RetryPolicy {
      interval_ms: 10,
      backoff: RetryBackoff::Linear,
      ..RetryPolicy::default()
    };
    assert_eq!(policy.delay_after(3), Duration::from_millis(30));

    policy.backoff = RetryBackoff::Constant;
    assert_eq!(policy.delay_after(3), Duration::from_millis(10));
  }

  #[test]
  fn test_unknown_action_type() {
    let chain: ActionChain = serde_json::from_value(json!([
      { "type": "pass" },
      { "type": "wait", "seconds": 5 }
    ]))
    .unwrap();

    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1], Action::Unknown);
  }

  #[test]
  fn test_nested_chain() {
    let action: Action = serde_json::from_value(json!({
      "type": "choice",
      "choices": [
        { "condition": "state.amount > 10", "next": [{ "type": "task", "task": "audit" }] }
      ],
      "default": [{ "type": "end" }]
    }))
    .unwrap();

    match action {
      Action::Choice(choice) => {
        assert_eq!(choice.choices.len(), 1);
        match &choice.choices[0].next[0] {
          Action::Task(task) => {
            assert_eq!(task.task, "audit");
            assert_eq!(task.retry, RetryPolicy::default());
          }
          other => panic!("expected task, got {:?}", other),
        }
        assert_eq!(choice.default, Some(vec![Action::End]));
      }
      other => panic!("expected choice, got {:?}", other),
    }
  }
}
