//! Tripwire Source
//!
//! This crate defines how the trigger engine consumes events. An
//! [`EventSource`] is subscribed to one topic, yields events in partition
//! order and accepts manual position commits. Nothing is committed
//! implicitly: a consumer that restarts resumes after the last committed
//! position and sees every later event again (at-least-once delivery).
//!
//! Backends:
//! - [`InMemoryEventLog`]: a partitioned, replayable log with committed
//!   offsets per consumer group. New groups start from the earliest record.
//! - [`ChannelEventSource`]: a push-fed source backed by an mpsc channel,
//!   used when events arrive from another in-process producer.
//!
//! Wire adapters for real brokers implement the same two traits.

mod channel;
mod log;

pub use channel::{ChannelEventSource, EventSender};
pub use log::{InMemoryEventLog, LogSubscription};

use async_trait::async_trait;
use tripwire_trigger::{Event, Position};

/// Error type for event source operations.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
  #[error("unknown topic: {0}")]
  UnknownTopic(String),

  #[error("topic already exists: {0}")]
  TopicExists(String),

  #[error("source is not subscribed to a topic")]
  NotSubscribed,

  #[error("position {0} does not belong to the subscribed topic")]
  ForeignPosition(String),

  #[error("event source closed")]
  Closed,

  #[error("event source unavailable: {0}")]
  Unavailable(String),
}

/// An inbound event stream with manual position commits.
///
/// `recv` must be cancel safe: dropping its future before completion must not
/// lose an event.
#[async_trait]
pub trait EventSource: Send {
  /// Start (or restart) consumption of `topic` from the last committed position.
  async fn subscribe(&mut self, topic: &str) -> Result<(), SourceError>;

  /// Receive the next event. `None` means the stream has ended.
  async fn recv(&mut self) -> Result<Option<Event>, SourceError>;

  /// Durably record that everything up to and including `position` is done.
  async fn commit(&mut self, position: &Position) -> Result<(), SourceError>;
}

/// Topic provisioning. Not used on the per-event path.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
  async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), SourceError>;

  async fn delete_topic(&self, topic: &str) -> Result<(), SourceError>;
}

#[async_trait]
impl EventSource for Box<dyn EventSource> {
  async fn subscribe(&mut self, topic: &str) -> Result<(), SourceError> {
    (**self).subscribe(topic).await
  }

  async fn recv(&mut self) -> Result<Option<Event>, SourceError> {
    (**self).recv().await
  }

  async fn commit(&mut self, position: &Position) -> Result<(), SourceError> {
    (**self).commit(position).await
  }
}
