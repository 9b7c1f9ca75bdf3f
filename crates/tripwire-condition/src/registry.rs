use std::collections::HashMap;
use std::sync::Arc;

use tripwire_trigger::{Condition, Event};

use crate::ConditionError;
use crate::kinds::{Always, EventMatch, ExpressionCondition};

/// A condition implementation.
///
/// Implementations must be pure: the same inputs always give the same answer
/// and nothing outside the call is touched.
pub trait ConditionKind: Send + Sync {
  fn matches(
    &self,
    event: &Event,
    condition: &Condition,
    context: &serde_json::Value,
  ) -> Result<bool, ConditionError>;
}

/// Name-to-implementation map for condition kinds.
#[derive(Clone, Default)]
pub struct ConditionRegistry {
  kinds: HashMap<String, Arc<dyn ConditionKind>>,
}

impl ConditionRegistry {
  /// An empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry holding `always`, `event-match` and `expression`.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    registry.register("always", Always);
    registry.register("event-match", EventMatch);
    registry.register("expression", ExpressionCondition::new());
    registry
  }

  /// Register (or replace) a kind.
  pub fn register(&mut self, name: impl Into<String>, kind: impl ConditionKind + 'static) {
    self.kinds.insert(name.into(), Arc::new(kind));
  }

  pub fn get(&self, name: &str) -> Option<&Arc<dyn ConditionKind>> {
    self.kinds.get(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.kinds.contains_key(name)
  }
}
