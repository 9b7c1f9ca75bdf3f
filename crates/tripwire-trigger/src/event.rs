use std::fmt;

use serde::{Deserialize, Serialize};

/// Resumable marker of an event within a topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
  pub topic: String,
  pub partition: u32,
  pub offset: u64,
}

impl Position {
  pub fn new(topic: impl Into<String>, partition: u32, offset: u64) -> Self {
    Self {
      topic: topic.into(),
      partition,
      offset,
    }
  }
}

impl fmt::Display for Position {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.topic, self.partition, self.offset)
  }
}

/// An inbound event delivered by an event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  /// Logical producer of the event, e.g. "orders".
  pub source: String,

  /// Partitioning key, if the producer supplied one.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key: Option<String>,

  pub payload: serde_json::Value,

  pub position: Position,
}
