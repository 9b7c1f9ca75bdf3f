//! Built-in condition kinds.

use serde_json::{Value, json};
use tripwire_trigger::{Condition, Event};

use crate::ConditionError;
use crate::expression::ExpressionEngine;
use crate::registry::ConditionKind;

/// Prefix marking a filter value that is read from the trigger context.
const CONTEXT_REF: &str = "$context.";

/// Resolve a dotted path (`a.b.0.c`) inside a JSON value.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
  if path.is_empty() {
    return Some(value);
  }
  path.split('.').try_fold(value, |current, segment| match current {
    Value::Object(map) => map.get(segment),
    Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
    _ => None,
  })
}

/// Matches every event.
pub struct Always;

impl ConditionKind for Always {
  fn matches(&self, _event: &Event, _condition: &Condition, _context: &Value) -> Result<bool, ConditionError> {
    Ok(true)
  }
}

/// Structural match on the event.
///
/// ```json
/// { "kind": "event-match", "source": "orders", "key": "eu",
///   "filter": { "status": "paid", "customer.tier": "$context.tier" } }
/// ```
///
/// Every present field must match. `source` may be `"*"`.
pub struct EventMatch;

impl EventMatch {
  fn invalid(message: impl Into<String>) -> ConditionError {
    ConditionError::InvalidParams {
      kind: "event-match".to_string(),
      message: message.into(),
    }
  }

  fn string_param<'a>(condition: &'a Condition, name: &str) -> Result<Option<&'a str>, ConditionError> {
    match condition.params.get(name) {
      None | Some(Value::Null) => Ok(None),
      Some(Value::String(s)) => Ok(Some(s)),
      Some(other) => Err(Self::invalid(format!("'{}' must be a string, got {}", name, other))),
    }
  }

  /// Replace `$context.<path>` references with the referenced context value.
  fn resolve_expected<'a>(expected: &'a Value, context: &'a Value) -> Result<&'a Value, ConditionError> {
    let Some(path) = expected.as_str().and_then(|s| s.strip_prefix(CONTEXT_REF)) else {
      return Ok(expected);
    };
    lookup_path(context, path)
      .ok_or_else(|| Self::invalid(format!("context has no value at '{}'", path)))
  }
}

impl ConditionKind for EventMatch {
  fn matches(&self, event: &Event, condition: &Condition, context: &Value) -> Result<bool, ConditionError> {
    if let Some(source) = Self::string_param(condition, "source")?
      && source != "*"
      && source != event.source
    {
      return Ok(false);
    }

    if let Some(key) = Self::string_param(condition, "key")?
      && event.key.as_deref() != Some(key)
    {
      return Ok(false);
    }

    let filter = match condition.params.get("filter") {
      None | Some(Value::Null) => return Ok(true),
      Some(Value::Object(filter)) => filter,
      Some(other) => return Err(Self::invalid(format!("'filter' must be an object, got {}", other))),
    };

    for (path, expected) in filter {
      let expected = Self::resolve_expected(expected, context)?;
      if lookup_path(&event.payload, path) != Some(expected) {
        return Ok(false);
      }
    }
    Ok(true)
  }
}

/// Expression predicate.
///
/// ```json
/// { "kind": "expression", "expression": "payload.amount > context.threshold" }
/// ```
pub struct ExpressionCondition {
  engine: ExpressionEngine,
}

impl ExpressionCondition {
  pub fn new() -> Self {
    Self {
      engine: ExpressionEngine::new(),
    }
  }
}

impl Default for ExpressionCondition {
  fn default() -> Self {
    Self::new()
  }
}

impl ConditionKind for ExpressionCondition {
  fn matches(&self, event: &Event, condition: &Condition, context: &Value) -> Result<bool, ConditionError> {
    let expression = match condition.params.get("expression") {
      Some(Value::String(expression)) => expression,
      _ => {
        return Err(ConditionError::InvalidParams {
          kind: "expression".to_string(),
          message: "'expression' must be a string".to_string(),
        });
      }
    };

    let vars = json!({
      "event": {
        "source": event.source,
        "key": event.key,
        "payload": event.payload,
        "position": event.position.to_string(),
      },
      "payload": event.payload,
      "context": context,
    });
    Ok(self.engine.is_true(expression, &vars)?)
  }
}
