use serde::{Deserialize, Serialize};

use crate::action::ActionChain;

/// A trigger as submitted for registration.
///
/// `trigger_id` may be omitted only when the trigger is transient; the commit
/// protocol generates an id in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDef {
  #[serde(default)]
  pub trigger_id: Option<String>,
  #[serde(default)]
  pub transient: bool,
  pub condition: Condition,
  #[serde(default)]
  pub action_chain: ActionChain,
  #[serde(default)]
  pub context: serde_json::Value,
}

impl TriggerDef {
  /// Settle the definition into a stored trigger under the given id.
  pub fn into_trigger(self, trigger_id: String) -> Trigger {
    Trigger {
      trigger_id,
      transient: self.transient,
      condition: self.condition,
      action_chain: self.action_chain,
      context: self.context,
    }
  }
}

/// A trigger as persisted in a workspace's trigger document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
  pub trigger_id: String,
  #[serde(default)]
  pub transient: bool,
  pub condition: Condition,
  #[serde(default)]
  pub action_chain: ActionChain,
  #[serde(default)]
  pub context: serde_json::Value,
}

/// A condition predicate.
///
/// `kind` selects the implementation from the condition registry; every other
/// field is handed to that implementation untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
  pub kind: String,
  #[serde(flatten)]
  pub params: serde_json::Map<String, serde_json::Value>,
}

impl Condition {
  pub fn new(kind: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      params: serde_json::Map::new(),
    }
  }

  /// Builder-style helper for attaching a parameter.
  pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
    self.params.insert(key.into(), value);
    self
  }
}
