//! Execution error types.

use tripwire_trigger::InvalidTransition;

use crate::journal::JournalError;
use crate::task::TaskFailure;

/// Errors that can occur while executing an action chain.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
  /// A retryable failure, e.g. a task attempt that timed out.
  #[error("transient execution failure: {0}")]
  Transient(String),

  /// A failure that retrying will not fix: exhausted retries, an unmatched
  /// choice, an unknown action kind or task handler.
  #[error("permanent execution failure: {0}")]
  Permanent(String),

  /// Execution was cancelled.
  #[error("execution cancelled")]
  Cancelled,

  /// The checkpoint journal could not be read or written.
  #[error("checkpoint journal failed: {0}")]
  Journal(#[from] JournalError),

  #[error(transparent)]
  InvalidTransition(#[from] InvalidTransition),
}

impl ExecutionError {
  pub fn is_transient(&self) -> bool {
    matches!(self, ExecutionError::Transient(_))
  }

  pub(crate) fn permanent(message: impl Into<String>) -> Self {
    ExecutionError::Permanent(message.into())
  }
}

impl From<TaskFailure> for ExecutionError {
  fn from(failure: TaskFailure) -> Self {
    match failure {
      TaskFailure::Transient(message) => ExecutionError::Transient(message),
      TaskFailure::Permanent(message) => ExecutionError::Permanent(message),
      TaskFailure::Cancelled => ExecutionError::Cancelled,
    }
  }
}
