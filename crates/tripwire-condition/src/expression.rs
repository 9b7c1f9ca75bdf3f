//! Expression evaluation via minijinja.
//!
//! Expressions use the minijinja expression syntax, e.g.
//! `payload.amount > context.threshold and event.source == "orders"`.
//! Missing attributes evaluate to undefined (falsy) instead of failing.

use minijinja::{Environment, UndefinedBehavior};

#[derive(Debug, thiserror::Error)]
#[error("expression '{expression}' failed: {message}")]
pub struct ExpressionError {
  pub expression: String,
  pub message: String,
}

/// Compiles and evaluates expressions against JSON variables.
pub struct ExpressionEngine {
  env: Environment<'static>,
}

impl ExpressionEngine {
  pub fn new() -> Self {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    Self { env }
  }

  /// Evaluate `expression` and convert the result back to JSON.
  pub fn evaluate(
    &self,
    expression: &str,
    vars: &serde_json::Value,
  ) -> Result<serde_json::Value, ExpressionError> {
    let value = self.eval(expression, vars)?;
    if value.is_undefined() || value.is_none() {
      return Ok(serde_json::Value::Null);
    }
    serde_json::to_value(&value).map_err(|e| ExpressionError {
      expression: expression.to_string(),
      message: format!("result is not representable as JSON: {}", e),
    })
  }

  /// Evaluate `expression` for truthiness.
  pub fn is_true(&self, expression: &str, vars: &serde_json::Value) -> Result<bool, ExpressionError> {
    Ok(self.eval(expression, vars)?.is_true())
  }

  fn eval(
    &self,
    expression: &str,
    vars: &serde_json::Value,
  ) -> Result<minijinja::Value, ExpressionError> {
    let error = |e: minijinja::Error| ExpressionError {
      expression: expression.to_string(),
      message: e.to_string(),
    };
    let compiled = self.env.compile_expression(expression).map_err(error)?;
    compiled.eval(vars).map_err(error)
  }
}

impl Default for ExpressionEngine {
  fn default() -> Self {
    Self::new()
  }
}
