//! Tripwire Engine
//!
//! Ties the store, event source, condition evaluator and action executor
//! together:
//!
//! - [`TriggerService`]: validates and persists trigger registrations
//! - [`Worker`]: the per-workspace consume, match, execute, commit loop
//! - [`Controller`]: the registry of live workers, keyed by workspace

mod commit;
mod controller;
mod journal;
mod worker;

pub use commit::{CommitError, CommitReport, TriggerService};
pub use controller::{Controller, ControllerError, Credentials, SourceProvider, WorkerRegistry};
pub use journal::StoreJournal;
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerHandle, WorkerStatus};

use tracing::warn;
use tripwire_store::Document;
use tripwire_trigger::{Position, Trigger};

/// Ids of the per-workspace documents the engine keeps.
pub mod documents {
  /// trigger_id -> trigger definition.
  pub const TRIGGERS: &str = "triggers";
  /// execution key -> marker for executions that reached a final outcome.
  pub const PROCESSED: &str = "processed";
  /// execution key -> step path -> task output.
  pub const CHECKPOINTS: &str = "checkpoints";
  /// execution key -> last workflow instance record.
  pub const INSTANCES: &str = "instances";
}

/// Dedup identity of one trigger firing for one event.
pub fn execution_key(position: &Position, trigger_id: &str) -> String {
  format!("{}#{}", position, trigger_id)
}

/// Decode a trigger document, skipping entries that don't decode.
pub(crate) fn decode_triggers(workspace: &str, document: &Document) -> Vec<Trigger> {
  document
    .iter()
    .filter_map(|(id, value)| match serde_json::from_value::<Trigger>(value.clone()) {
      Ok(trigger) => Some(trigger),
      Err(e) => {
        warn!(workspace, trigger_id = %id, error = %e, "skipping undecodable trigger");
        None
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_execution_key() {
    let position = Position::new("ws1", 2, 40);
    assert_eq!(execution_key(&position, "t1"), "ws1/2/40#t1");
  }

  #[test]
  fn test_decode_skips_bad_entries() {
    let mut document = Document::new();
    document.insert(
      "good".to_string(),
      json!({
        "trigger_id": "good",
        "condition": {"kind": "always"},
        "action_chain": [],
      }),
    );
    document.insert("bad".to_string(), json!("not a trigger"));

    let triggers = decode_triggers("ws1", &document);
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].trigger_id, "good");
  }
}
