//! Trigger registration.
//!
//! Every submitted trigger gets an outcome. A named trigger is accepted only
//! if its id is free; an unnamed trigger is accepted only if it is transient,
//! and gets a fresh UUID v4 id.
//!
//! A single submission goes straight to the store with `key_exists` followed
//! by `set_key`. A batch reads the trigger document once, applies the rules
//! in submission order against that snapshot (including ids accepted earlier
//! in the same batch), and writes the merged document back once.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};
use tripwire_store::{Document, StoreError, TriggerStore};
use tripwire_trigger::{Trigger, TriggerDef};

use crate::documents::TRIGGERS;

/// Errors from trigger registration and lookup.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("trigger '{0}' already exists")]
  Conflict(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Outcome per submission index: the stored id, or why the item was rejected.
pub type CommitReport = BTreeMap<usize, Result<String, CommitError>>;

/// Registers, reads and removes a workspace's triggers.
#[derive(Clone)]
pub struct TriggerService {
  store: Arc<dyn TriggerStore>,
}

impl TriggerService {
  pub fn new(store: Arc<dyn TriggerStore>) -> Self {
    Self { store }
  }

  /// Register `triggers` in `workspace`.
  ///
  /// Returns `Err` only when nothing could be attempted: an empty submission,
  /// an unknown workspace, or a store failure. Per-item rejections are in the
  /// report.
  #[instrument(name = "add_triggers", skip(self, triggers), fields(count = triggers.len()))]
  pub async fn add_triggers(
    &self,
    workspace: &str,
    triggers: Vec<TriggerDef>,
  ) -> Result<CommitReport, CommitError> {
    if triggers.is_empty() {
      return Err(CommitError::InvalidArgument(
        "at least one trigger is required".to_string(),
      ));
    }
    if !self.store.workspace_exists(workspace).await? {
      return Err(CommitError::NotFound(format!("workspace '{}'", workspace)));
    }

    let report = if triggers.len() == 1 {
      self.add_one(workspace, triggers).await?
    } else {
      self.add_batch(workspace, triggers).await?
    };

    let accepted = report.values().filter(|r| r.is_ok()).count();
    info!(
      workspace,
      accepted,
      rejected = report.len() - accepted,
      "triggers committed"
    );
    Ok(report)
  }

  async fn add_one(
    &self,
    workspace: &str,
    mut triggers: Vec<TriggerDef>,
  ) -> Result<CommitReport, CommitError> {
    let mut report = CommitReport::new();
    let Some(def) = triggers.pop() else {
      return Ok(report);
    };

    let outcome = match requested_id(&def) {
      Some(id) if self.store.key_exists(workspace, TRIGGERS, id).await? => {
        Err(CommitError::Conflict(id.to_string()))
      }
      Some(id) => Ok(id.to_string()),
      None if def.transient => Ok(generate_id(|_| false)),
      None => Err(unnamed_persistent()),
    };

    let outcome = match outcome {
      Ok(id) => {
        let trigger = def.into_trigger(id.clone());
        self
          .store
          .set_key(workspace, TRIGGERS, &id, encode(&trigger)?)
          .await?;
        Ok(id)
      }
      Err(e) => Err(e),
    };

    report.insert(0, outcome);
    Ok(report)
  }

  async fn add_batch(
    &self,
    workspace: &str,
    triggers: Vec<TriggerDef>,
  ) -> Result<CommitReport, CommitError> {
    let mut document = self.store.get(workspace, TRIGGERS).await?;
    let mut report = CommitReport::new();
    let mut accepted = 0;

    for (index, def) in triggers.into_iter().enumerate() {
      let id = match requested_id(&def) {
        Some(id) if document.contains_key(id) => {
          debug!(index, trigger_id = %id, "trigger id taken");
          report.insert(index, Err(CommitError::Conflict(id.to_string())));
          continue;
        }
        Some(id) => id.to_string(),
        None if def.transient => generate_id(|candidate| document.contains_key(candidate)),
        None => {
          report.insert(index, Err(unnamed_persistent()));
          continue;
        }
      };

      let trigger = def.into_trigger(id.clone());
      document.insert(id.clone(), encode(&trigger)?);
      report.insert(index, Ok(id));
      accepted += 1;
    }

    if accepted > 0 {
      self.store.put(workspace, TRIGGERS, document).await?;
    }
    Ok(report)
  }

  /// Read one trigger.
  pub async fn get_trigger(&self, workspace: &str, trigger_id: &str) -> Result<Trigger, CommitError> {
    let document = self.triggers_document(workspace).await?;
    let value = document
      .get(trigger_id)
      .ok_or_else(|| CommitError::NotFound(format!("trigger '{}'", trigger_id)))?;
    decode(workspace, value)
  }

  /// Every trigger in the workspace, ordered by id.
  pub async fn list_triggers(&self, workspace: &str) -> Result<Vec<Trigger>, CommitError> {
    let document = self.triggers_document(workspace).await?;
    document
      .values()
      .map(|value| decode(workspace, value))
      .collect()
  }

  /// Remove one trigger.
  #[instrument(name = "delete_trigger", skip(self))]
  pub async fn delete_trigger(&self, workspace: &str, trigger_id: &str) -> Result<(), CommitError> {
    let mut document = self.triggers_document(workspace).await?;
    if document.remove(trigger_id).is_none() {
      return Err(CommitError::NotFound(format!("trigger '{}'", trigger_id)));
    }
    self.store.put(workspace, TRIGGERS, document).await?;
    info!(workspace, trigger_id, "trigger deleted");
    Ok(())
  }

  async fn triggers_document(&self, workspace: &str) -> Result<Document, CommitError> {
    if !self.store.workspace_exists(workspace).await? {
      return Err(CommitError::NotFound(format!("workspace '{}'", workspace)));
    }
    Ok(self.store.get(workspace, TRIGGERS).await?)
  }
}

/// The submitted id, with an empty id counting as none.
fn requested_id(def: &TriggerDef) -> Option<&str> {
  def.trigger_id.as_deref().filter(|id| !id.is_empty())
}

fn unnamed_persistent() -> CommitError {
  CommitError::InvalidArgument("a trigger without an id must be transient".to_string())
}

/// A fresh UUID v4 that `taken` does not report as used.
fn generate_id(taken: impl Fn(&str) -> bool) -> String {
  loop {
    let id = uuid::Uuid::new_v4().to_string();
    if !taken(&id) {
      return id;
    }
  }
}

fn encode(trigger: &Trigger) -> Result<serde_json::Value, CommitError> {
  serde_json::to_value(trigger).map_err(|e| CommitError::InvalidArgument(e.to_string()))
}

fn decode(workspace: &str, value: &serde_json::Value) -> Result<Trigger, CommitError> {
  serde_json::from_value(value.clone()).map_err(|e| {
    CommitError::Store(StoreError::Corrupt {
      workspace: workspace.to_string(),
      document_id: TRIGGERS.to_string(),
      message: e.to_string(),
    })
  })
}
