//! Execution events and notifiers for observability.
//!
//! Events are emitted while an action chain runs so that consumers can
//! observe progress, persist state, stream to UIs, etc.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tripwire_trigger::{InstanceStatus, Position};

/// Events emitted during action chain execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// An instance moved to running.
  InstanceStarted {
    instance_id: String,
    trigger_id: String,
    position: Position,
  },

  /// A task step produced output.
  TaskCompleted {
    instance_id: String,
    step: String,
    task: String,
    attempt: u32,
  },

  /// A task step was skipped because the journal already holds its output.
  TaskReplayed {
    instance_id: String,
    step: String,
    task: String,
  },

  /// A task attempt failed; it may still be retried.
  TaskAttemptFailed {
    instance_id: String,
    step: String,
    task: String,
    attempt: u32,
    error: String,
  },

  /// A parallel branch was cancelled because a sibling failed.
  BranchCancelled {
    instance_id: String,
    step: String,
    branch: usize,
  },

  /// A map element failed.
  ElementFailed {
    instance_id: String,
    step: String,
    index: usize,
    error: String,
  },

  /// The instance reached a terminal status.
  InstanceFinished {
    instance_id: String,
    status: InstanceStatus,
  },
}

/// Trait for receiving execution events.
///
/// The executor calls `notify` for each event; implementations decide what
/// to do with them.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls execution. Volume is a handful
  // of events per step.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
