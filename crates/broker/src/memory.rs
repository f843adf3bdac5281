//! In-memory stand-in for [`Broker`], implementing the same consumer-group
//! semantics (new-entry delivery via `read_group`, idle-based reclaim via
//! `claim`, ack removes from the pending set) so stage unit tests exercise
//! the real at-least-once contract without a Redis instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use pipeline_domain::ports::{Broker, BrokerError, GroupInfo, PendingEntry, StreamId, StreamInfo};
use pipeline_domain::Fields;

#[derive(Clone)]
struct PendingRecord {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

struct GroupState {
    /// Index into the stream's entry log of the next entry this group has
    /// not yet delivered to any consumer.
    next_undelivered: usize,
    pending: HashMap<StreamId, PendingRecord>,
}

impl GroupState {
    fn new() -> Self {
        Self { next_undelivered: 0, pending: HashMap::new() }
    }
}

struct StreamState {
    entries: Vec<(StreamId, Fields)>,
    next_id: u64,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn new() -> Self {
        Self { entries: Vec::new(), next_id: 1, groups: HashMap::new() }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_insert_with(StreamState::new);
        state.groups.entry(group.to_string()).or_insert_with(GroupState::new);
        Ok(())
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<StreamId, BrokerError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_insert_with(StreamState::new);
        let id = format!("{}-0", state.next_id);
        state.next_id += 1;
        state.entries.push((id.clone(), fields));
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<(StreamId, Fields)>, BrokerError> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::NotFound(stream.to_string()))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::NotFound(format!("{stream}/{group}")))?;

        let start = group_state.next_undelivered;
        let end = (start + count).min(state.entries.len());
        let mut out = Vec::new();
        for (id, fields) in &state.entries[start..end] {
            group_state.pending.insert(
                id.clone(),
                PendingRecord { consumer: consumer.to_string(), delivered_at: Instant::now(), deliveries: 1 },
            );
            out.push((id.clone(), fields.clone()));
        }
        group_state.next_undelivered = end;
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::NotFound(stream.to_string()))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::NotFound(format!("{stream}/{group}")))?;
        group_state.pending.remove(id);
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::NotFound(stream.to_string()))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::NotFound(format!("{stream}/{group}")))?;
        Ok(group_state
            .pending
            .iter()
            .map(|(id, record)| PendingEntry {
                id: id.clone(),
                consumer: record.consumer.clone(),
                idle_ms: record.delivered_at.elapsed().as_millis() as u64,
                deliveries: record.deliveries,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<(StreamId, Fields)>, BrokerError> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::NotFound(stream.to_string()))?;
        let entries_by_id: HashMap<StreamId, Fields> = state.entries.iter().cloned().collect();
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::NotFound(format!("{stream}/{group}")))?;

        let stale_ids: Vec<StreamId> = group_state
            .pending
            .iter()
            .filter(|(_, record)| record.delivered_at.elapsed().as_millis() as u64 >= min_idle_ms)
            .map(|(id, _)| id.clone())
            .collect();

        let mut out = Vec::new();
        for id in stale_ids {
            if let Some(fields) = entries_by_id.get(&id) {
                let record = group_state.pending.get_mut(&id).unwrap();
                record.consumer = consumer.to_string();
                record.delivered_at = Instant::now();
                record.deliveries += 1;
                out.push((id, fields.clone()));
            }
        }
        Ok(out)
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError> {
        let streams = self.streams.lock().await;
        let state = streams
            .get(stream)
            .ok_or_else(|| BrokerError::NotFound(stream.to_string()))?;
        Ok(StreamInfo {
            length: state.entries.len() as u64,
            first_id: state.entries.first().map(|(id, _)| id.clone()),
            last_id: state.entries.last().map(|(id, _)| id.clone()),
        })
    }

    async fn group_info(&self, stream: &str, group: &str) -> Result<GroupInfo, BrokerError> {
        let streams = self.streams.lock().await;
        let state = streams
            .get(stream)
            .ok_or_else(|| BrokerError::NotFound(stream.to_string()))?;
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| BrokerError::NotFound(format!("{stream}/{group}")))?;
        Ok(GroupInfo {
            name: group.to_string(),
            consumers: group_state.pending.values().map(|r| r.consumer.clone()).collect::<std::collections::HashSet<_>>().len() as u64,
            pending: group_state.pending.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn append_then_read_group_then_ack_clears_pending() {
        let broker = MemoryBroker::new();
        broker.ensure_group("s", "g").await.unwrap();
        broker.append("s", fields(&[("a", "1")])).await.unwrap();

        let batch = broker.read_group("s", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 1);
        let (id, _) = &batch[0];

        let pending = broker.pending("s", "g").await.unwrap();
        assert_eq!(pending.len(), 1);

        broker.ack("s", "g", id).await.unwrap();
        let pending = broker.pending("s", "g").await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unacked_entry_is_reclaimed_by_claim() {
        let broker = MemoryBroker::new();
        broker.ensure_group("s", "g").await.unwrap();
        broker.append("s", fields(&[("a", "1")])).await.unwrap();
        broker.read_group("s", "g", "c1", 10, 0).await.unwrap();

        let claimed = broker.claim("s", "g", "c2", 0).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let pending = broker.pending("s", "g").await.unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].deliveries, 2);
    }

    #[tokio::test]
    async fn read_group_only_returns_new_entries_once() {
        let broker = MemoryBroker::new();
        broker.ensure_group("s", "g").await.unwrap();
        broker.append("s", fields(&[("a", "1")])).await.unwrap();

        let first = broker.read_group("s", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = broker.read_group("s", "g", "c1", 10, 0).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn stream_info_reports_length_and_bounds() {
        let broker = MemoryBroker::new();
        broker.append("s", fields(&[("a", "1")])).await.unwrap();
        broker.append("s", fields(&[("a", "2")])).await.unwrap();
        let info = broker.stream_info("s").await.unwrap();
        assert_eq!(info.length, 2);
        assert!(info.first_id.is_some());
        assert!(info.last_id.is_some());
    }
}
