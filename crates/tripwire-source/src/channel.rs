//! Push-fed event source.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use tripwire_trigger::{Event, Position};

use crate::{EventSource, SourceError};

struct Pushed {
  source: String,
  key: Option<String>,
  payload: serde_json::Value,
}

/// Producer handle for a [`ChannelEventSource`].
///
/// This can be given to webhooks, stdin readers, pollers, etc.
#[derive(Clone)]
pub struct EventSender {
  sender: mpsc::Sender<Pushed>,
  committed: Arc<AtomicU64>,
}

impl EventSender {
  /// Push an event. Fails once the source has been dropped.
  pub async fn send(
    &self,
    source: impl Into<String>,
    key: Option<String>,
    payload: serde_json::Value,
  ) -> Result<(), SourceError> {
    self
      .sender
      .send(Pushed {
        source: source.into(),
        key,
        payload,
      })
      .await
      .map_err(|_| SourceError::Closed)
  }

  /// Number of events the consumer has committed so far.
  pub fn committed(&self) -> u64 {
    self.committed.load(Ordering::SeqCst)
  }
}

/// Single-partition source fed through an mpsc channel.
///
/// Offsets are assigned in arrival order. There is no replay: events that were
/// received but never committed are gone once the source is dropped.
pub struct ChannelEventSource {
  topic: String,
  subscribed: bool,
  receiver: mpsc::Receiver<Pushed>,
  next_offset: u64,
  committed: Arc<AtomicU64>,
}

impl ChannelEventSource {
  /// Create a source for `topic` and the sender that feeds it.
  pub fn new(topic: impl Into<String>, buffer_size: usize) -> (Self, EventSender) {
    let (sender, receiver) = mpsc::channel(buffer_size);
    let committed = Arc::new(AtomicU64::new(0));
    let source = Self {
      topic: topic.into(),
      subscribed: false,
      receiver,
      next_offset: 0,
      committed: committed.clone(),
    };
    (source, EventSender { sender, committed })
  }
}

#[async_trait]
impl EventSource for ChannelEventSource {
  async fn subscribe(&mut self, topic: &str) -> Result<(), SourceError> {
    if topic != self.topic {
      return Err(SourceError::UnknownTopic(topic.to_string()));
    }
    self.subscribed = true;
    Ok(())
  }

  async fn recv(&mut self) -> Result<Option<Event>, SourceError> {
    if !self.subscribed {
      return Err(SourceError::NotSubscribed);
    }

    match self.receiver.recv().await {
      Some(pushed) => {
        let position = Position::new(self.topic.clone(), 0, self.next_offset);
        self.next_offset += 1;
        Ok(Some(Event {
          source: pushed.source,
          key: pushed.key,
          payload: pushed.payload,
          position,
        }))
      }
      None => Ok(None),
    }
  }

  async fn commit(&mut self, position: &Position) -> Result<(), SourceError> {
    if !self.subscribed {
      return Err(SourceError::NotSubscribed);
    }
    if position.topic != self.topic || position.partition != 0 {
      return Err(SourceError::ForeignPosition(position.to_string()));
    }
    self
      .committed
      .fetch_max(position.offset + 1, Ordering::SeqCst);
    debug!(position = %position, "position_committed");
    Ok(())
  }
}
