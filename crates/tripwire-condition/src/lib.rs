//! Tripwire Condition
//!
//! Matches events against trigger conditions.
//!
//! Conditions are tagged by `kind`. The [`ConditionEvaluator`] does not know
//! any kind itself: it looks the kind up in a [`ConditionRegistry`] and hands
//! over the event, the condition parameters and the trigger context. Adding a
//! kind is a matter of registering another [`ConditionKind`].
//!
//! Built-in kinds:
//! - `always`: matches every event
//! - `event-match`: source/key equality plus payload field filters
//! - `expression`: a minijinja expression over `event`, `payload` and `context`

mod evaluator;
mod expression;
mod kinds;
mod registry;

pub use evaluator::ConditionEvaluator;
pub use expression::{ExpressionEngine, ExpressionError};
pub use kinds::{Always, EventMatch, ExpressionCondition, lookup_path};
pub use registry::{ConditionKind, ConditionRegistry};

/// Errors raised by a condition kind.
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
  /// The condition parameters are malformed for this kind.
  #[error("invalid '{kind}' condition: {message}")]
  InvalidParams { kind: String, message: String },

  #[error(transparent)]
  Expression(#[from] ExpressionError),
}
