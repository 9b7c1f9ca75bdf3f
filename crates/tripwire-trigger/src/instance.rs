use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Position;

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
  Pending,
  Running,
  Succeeded,
  Failed,
  Cancelled,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid instance transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
  pub from: InstanceStatus,
  pub to: InstanceStatus,
}

impl InstanceStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      InstanceStatus::Succeeded | InstanceStatus::Failed | InstanceStatus::Cancelled
    )
  }

  /// Validate and apply a transition.
  ///
  /// Allowed: `pending -> running`, `pending -> cancelled`, and
  /// `running -> {succeeded, failed, cancelled}`.
  pub fn transition(self, to: InstanceStatus) -> Result<InstanceStatus, InvalidTransition> {
    use InstanceStatus::*;
    match (self, to) {
      (Pending, Running) | (Pending, Cancelled) => Ok(to),
      (Running, Succeeded) | (Running, Failed) | (Running, Cancelled) => Ok(to),
      _ => Err(InvalidTransition { from: self, to }),
    }
  }
}

/// A tolerated (or fatal) failure of one map element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementFailure {
  /// Step path of the map node that produced the failure.
  pub path: String,
  pub index: usize,
  pub error: String,
}

/// One execution of a matched trigger's action chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
  pub instance_id: String,
  pub trigger_id: String,
  pub position: Position,
  pub status: InstanceStatus,
  #[serde(default)]
  pub output: serde_json::Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub element_failures: Vec<ElementFailure>,
  pub started_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
  /// A failed instance for an execution that ended without producing its
  /// own record.
  pub fn aborted(
    instance_id: impl Into<String>,
    trigger_id: impl Into<String>,
    position: Position,
    reason: impl Into<String>,
  ) -> Self {
    let now = Utc::now();
    Self {
      instance_id: instance_id.into(),
      trigger_id: trigger_id.into(),
      position,
      status: InstanceStatus::Failed,
      output: serde_json::Value::Null,
      error: Some(reason.into()),
      element_failures: vec![],
      started_at: now,
      finished_at: Some(now),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transitions() {
    let status = InstanceStatus::Pending;
    let status = status.transition(InstanceStatus::Running).unwrap();
    assert!(!status.is_terminal());
    let status = status.transition(InstanceStatus::Succeeded).unwrap();
    assert!(status.is_terminal());

    assert!(status.transition(InstanceStatus::Running).is_err());
    assert!(
      InstanceStatus::Pending
        .transition(InstanceStatus::Succeeded)
        .is_err()
    );
  }

  #[test]
  fn test_aborted_is_terminal_failure() {
    let position = Position::new("ws1", 0, 3);
    let instance = WorkflowInstance::aborted("i-1", "t1", position.clone(), "boom");
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.status.is_terminal());
    assert_eq!(instance.position, position);
    assert_eq!(instance.error.as_deref(), Some("boom"));
    assert!(instance.finished_at.is_some());
  }
}
