use tracing::{debug, warn};
use tripwire_trigger::{Event, Trigger};

use crate::registry::ConditionRegistry;

/// Matches one event against a trigger set.
#[derive(Clone)]
pub struct ConditionEvaluator {
  registry: ConditionRegistry,
}

impl ConditionEvaluator {
  pub fn new(registry: ConditionRegistry) -> Self {
    Self { registry }
  }

  pub fn registry(&self) -> &ConditionRegistry {
    &self.registry
  }

  /// Whether `trigger`'s condition holds for `event`.
  ///
  /// Unknown kinds and kinds that error count as no-match.
  pub fn matches(&self, event: &Event, trigger: &Trigger) -> bool {
    let condition = &trigger.condition;
    let Some(kind) = self.registry.get(&condition.kind) else {
      warn!(
        trigger_id = %trigger.trigger_id,
        kind = %condition.kind,
        "unknown condition kind, treating as no-match"
      );
      return false;
    };

    match kind.matches(event, condition, &trigger.context) {
      Ok(matched) => matched,
      Err(e) => {
        warn!(
          trigger_id = %trigger.trigger_id,
          kind = %condition.kind,
          error = %e,
          "condition evaluation failed, treating as no-match"
        );
        false
      }
    }
  }

  /// Return the triggers whose condition holds for `event`, in input order.
  pub fn evaluate<'a, I>(&self, event: &Event, triggers: I) -> Vec<&'a Trigger>
  where
    I: IntoIterator<Item = &'a Trigger>,
  {
    let matched: Vec<&Trigger> = triggers
      .into_iter()
      .filter(|trigger| self.matches(event, trigger))
      .collect();

    debug!(
      position = %event.position,
      matched = matched.len(),
      "conditions_evaluated"
    );
    matched
  }
}

impl Default for ConditionEvaluator {
  fn default() -> Self {
    Self::new(ConditionRegistry::with_builtins())
  }
}
