//! In-memory partitioned event log.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};
use tripwire_trigger::{Event, Position};

use crate::{EventSource, SourceError, TopicAdmin};

#[derive(Debug, Clone)]
struct Record {
  source: String,
  key: Option<String>,
  payload: serde_json::Value,
}

#[derive(Debug, Default)]
struct Topic {
  partitions: Vec<Vec<Record>>,
  round_robin: usize,
}

/// (group, topic, partition)
type OffsetKey = (String, String, u32);

#[derive(Debug, Default)]
struct LogState {
  topics: HashMap<String, Topic>,
  /// Next offset to deliver for a group, i.e. last committed offset + 1.
  committed: HashMap<OffsetKey, u64>,
  /// Every commit call in arrival order, per group.
  commit_log: HashMap<String, Vec<Position>>,
}

/// A replayable, partitioned in-memory log.
///
/// Records are kept forever, so a consumer group that re-subscribes after a
/// crash sees every record after its last committed offset again. Cloning
/// shares the log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventLog {
  state: Arc<Mutex<LogState>>,
  notify: Arc<Notify>,
}

impl InMemoryEventLog {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append an event to `topic`.
  ///
  /// Keyed events always land on the same partition; unkeyed events are
  /// spread round-robin.
  pub async fn publish(
    &self,
    topic: &str,
    source: &str,
    key: Option<&str>,
    payload: serde_json::Value,
  ) -> Result<Position, SourceError> {
    let position = {
      let mut state = self.state.lock().await;
      let entry = state
        .topics
        .get_mut(topic)
        .ok_or_else(|| SourceError::UnknownTopic(topic.to_string()))?;

      let count = entry.partitions.len();
      let partition = match key {
        Some(key) => {
          let mut hasher = DefaultHasher::new();
          key.hash(&mut hasher);
          (hasher.finish() % count as u64) as usize
        }
        None => {
          entry.round_robin = (entry.round_robin + 1) % count;
          entry.round_robin
        }
      };

      let records = &mut entry.partitions[partition];
      records.push(Record {
        source: source.to_string(),
        key: key.map(str::to_string),
        payload,
      });
      Position::new(topic, partition as u32, (records.len() - 1) as u64)
    };

    self.notify.notify_waiters();
    Ok(position)
  }

  /// Open a consumer for the given group. Call `subscribe` before `recv`.
  pub fn consumer(&self, group: &str) -> LogSubscription {
    LogSubscription {
      log: self.clone(),
      group: group.to_string(),
      topic: None,
      cursors: Vec::new(),
      next_partition: 0,
    }
  }

  /// Next offset the group will read from the partition, if it ever committed.
  pub async fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
    let state = self.state.lock().await;
    state
      .committed
      .get(&(group.to_string(), topic.to_string(), partition))
      .copied()
  }

  /// Every position committed by the group, in commit order.
  pub async fn commits(&self, group: &str) -> Vec<Position> {
    let state = self.state.lock().await;
    state.commit_log.get(group).cloned().unwrap_or_default()
  }
}

#[async_trait]
impl TopicAdmin for InMemoryEventLog {
  async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), SourceError> {
    let mut state = self.state.lock().await;
    if state.topics.contains_key(topic) {
      return Err(SourceError::TopicExists(topic.to_string()));
    }
    let partitions = partitions.max(1) as usize;
    state.topics.insert(
      topic.to_string(),
      Topic {
        partitions: vec![Vec::new(); partitions],
        round_robin: partitions - 1,
      },
    );
    info!(topic, partitions, "topic_created");
    Ok(())
  }

  async fn delete_topic(&self, topic: &str) -> Result<(), SourceError> {
    {
      let mut state = self.state.lock().await;
      if state.topics.remove(topic).is_none() {
        return Err(SourceError::UnknownTopic(topic.to_string()));
      }
      state.committed.retain(|(_, t, _), _| t != topic);
    }
    self.notify.notify_waiters();
    info!(topic, "topic_deleted");
    Ok(())
  }
}

/// A consumer-group view over an [`InMemoryEventLog`].
pub struct LogSubscription {
  log: InMemoryEventLog,
  group: String,
  topic: Option<String>,
  cursors: Vec<u64>,
  next_partition: usize,
}

impl LogSubscription {
  /// Take the next undelivered record, rotating across partitions.
  fn take_next(&mut self, topic_name: &str, topic: &Topic) -> Option<Event> {
    let count = topic.partitions.len();
    for step in 0..count {
      let partition = (self.next_partition + step) % count;
      let cursor = self.cursors[partition];
      if let Some(record) = topic.partitions[partition].get(cursor as usize) {
        self.cursors[partition] = cursor + 1;
        self.next_partition = (partition + 1) % count;
        return Some(Event {
          source: record.source.clone(),
          key: record.key.clone(),
          payload: record.payload.clone(),
          position: Position::new(topic_name, partition as u32, cursor),
        });
      }
    }
    None
  }
}

#[async_trait]
impl EventSource for LogSubscription {
  async fn subscribe(&mut self, topic: &str) -> Result<(), SourceError> {
    let state = self.log.state.lock().await;
    let entry = state
      .topics
      .get(topic)
      .ok_or_else(|| SourceError::UnknownTopic(topic.to_string()))?;

    self.cursors = (0..entry.partitions.len() as u32)
      .map(|partition| {
        state
          .committed
          .get(&(self.group.clone(), topic.to_string(), partition))
          .copied()
          .unwrap_or(0)
      })
      .collect();
    self.next_partition = 0;
    self.topic = Some(topic.to_string());

    info!(group = %self.group, topic, cursors = ?self.cursors, "subscribed");
    Ok(())
  }

  async fn recv(&mut self) -> Result<Option<Event>, SourceError> {
    let topic = self.topic.clone().ok_or(SourceError::NotSubscribed)?;
    let log = self.log.clone();

    loop {
      // Register interest before checking so a publish in between is not missed.
      let mut notified = std::pin::pin!(log.notify.notified());
      notified.as_mut().enable();

      {
        let state = log.state.lock().await;
        let Some(entry) = state.topics.get(&topic) else {
          return Ok(None);
        };
        if let Some(event) = self.take_next(&topic, entry) {
          return Ok(Some(event));
        }
      }

      notified.await;
    }
  }

  async fn commit(&mut self, position: &Position) -> Result<(), SourceError> {
    let topic = self.topic.as_deref().ok_or(SourceError::NotSubscribed)?;
    if position.topic != topic || position.partition as usize >= self.cursors.len() {
      return Err(SourceError::ForeignPosition(position.to_string()));
    }

    let mut state = self.log.state.lock().await;
    let key = (self.group.clone(), topic.to_string(), position.partition);
    let next = state.committed.entry(key).or_insert(0);
    *next = (*next).max(position.offset + 1);
    state
      .commit_log
      .entry(self.group.clone())
      .or_default()
      .push(position.clone());

    debug!(group = %self.group, position = %position, "position_committed");
    Ok(())
  }
}
