//! In-process stream backend
//!
//! Local-only implementation of [`StreamBackend`]: a VecDeque log per
//! topic with consumer-group cursors and pending tracking, and a `Notify`
//! per topic for immediate reader wakeup (no polling delay).
//!
//! Suitable for single-process runs and tests. Process crash loses all
//! entries; for durability and multi-machine deployments use the Redis
//! backend.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;

use super::backend::{Offset, RangeStart, StreamBackend, StreamReader, StreamStats};
use super::envelope::RawEntry;
use super::error::BusError;
use crate::utils::time::now_ms;

/// Entry id: `<ms>-<seq>`, ordered by append time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct EntryId {
    ms: i64,
    seq: u64,
}

impl EntryId {
    const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    fn parse(s: &str) -> Option<EntryId> {
        let (ms, seq) = s.split_once('-')?;
        Some(EntryId {
            ms: ms.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

struct MemoryEntry {
    id: EntryId,
    fields: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
struct GroupState {
    /// Group-level delivery cursor: entries at or before it have been
    /// handed to some consumer
    cursor: EntryId,
    /// Delivered but unacked: id -> (consumer, delivery time ms)
    pending: HashMap<EntryId, (String, i64)>,
}

struct TopicState {
    entries: VecDeque<MemoryEntry>,
    groups: HashMap<String, GroupState>,
    /// Last generated id; keeps growing even after trims
    last: EntryId,
    notify: Arc<Notify>,
}

impl Default for TopicState {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            groups: HashMap::new(),
            last: EntryId::ZERO,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// In-process stream backend
pub struct MemoryStreamBackend {
    topics: Arc<RwLock<HashMap<String, TopicState>>>,
}

impl Clone for MemoryStreamBackend {
    fn clone(&self) -> Self {
        Self {
            topics: Arc::clone(&self.topics),
        }
    }
}

impl Default for MemoryStreamBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStreamBackend {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn notifier(&self, topic: &str) -> Arc<Notify> {
        let mut topics = self.topics.write();
        Arc::clone(&topics.entry(topic.to_string()).or_default().notify)
    }

    fn next_id(state: &mut TopicState) -> EntryId {
        let ms = now_ms();
        let id = if ms <= state.last.ms {
            EntryId {
                ms: state.last.ms,
                seq: state.last.seq + 1,
            }
        } else {
            EntryId { ms, seq: 0 }
        };
        state.last = id;
        id
    }

    fn trim(state: &mut TopicState, max_len: u64) {
        while state.entries.len() as u64 > max_len {
            if let Some(entry) = state.entries.pop_front() {
                for group in state.groups.values_mut() {
                    group.pending.remove(&entry.id);
                }
            }
        }
    }

    fn resolve_offset(state: &TopicState, offset: &Offset) -> Result<EntryId, BusError> {
        match offset {
            Offset::Begin => Ok(EntryId::ZERO),
            Offset::Now => Ok(state.last),
            Offset::Cursor(c) => EntryId::parse(c)
                .ok_or_else(|| BusError::Stream(format!("invalid cursor: {c}"))),
        }
    }

    /// Collect up to `count` undelivered entries for a group, marking them
    /// pending. Returns an empty vec when the group is fully caught up.
    fn take_for_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Vec<RawEntry> {
        let mut topics = self.topics.write();
        let Some(state) = topics.get_mut(topic) else {
            return Vec::new();
        };
        let group = state.groups.entry(group.to_string()).or_default();

        let now = now_ms();
        let mut taken = Vec::new();
        for entry in &state.entries {
            if taken.len() >= count {
                break;
            }
            if entry.id > group.cursor {
                group.cursor = entry.id;
                group
                    .pending
                    .insert(entry.id, (consumer.to_string(), now));
                taken.push(RawEntry {
                    id: entry.id.to_string(),
                    fields: entry.fields.clone(),
                });
            }
        }
        taken
    }

    fn take_after(&self, topic: &str, after: EntryId, count: usize) -> Vec<RawEntry> {
        let topics = self.topics.read();
        let Some(state) = topics.get(topic) else {
            return Vec::new();
        };
        state
            .entries
            .iter()
            .filter(|e| e.id > after)
            .take(count)
            .map(|e| RawEntry {
                id: e.id.to_string(),
                fields: e.fields.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl StreamBackend for MemoryStreamBackend {
    async fn append(
        &self,
        topic: &str,
        fields: &[(&str, Vec<u8>)],
        max_len: Option<u64>,
    ) -> Result<String, BusError> {
        let (id, notify) = {
            let mut topics = self.topics.write();
            let state = topics.entry(topic.to_string()).or_default();
            let id = Self::next_id(state);
            state.entries.push_back(MemoryEntry {
                id,
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            });
            if let Some(max_len) = max_len {
                Self::trim(state, max_len);
            }
            (id, Arc::clone(&state.notify))
        };
        notify.notify_waiters();
        Ok(id.to_string())
    }

    async fn range(
        &self,
        topic: &str,
        start: RangeStart,
        limit: usize,
    ) -> Result<Vec<RawEntry>, BusError> {
        let after = match start {
            RangeStart::Begin => EntryId::ZERO,
            RangeStart::After(id) => EntryId::parse(&id)
                .ok_or_else(|| BusError::Stream(format!("invalid cursor: {id}")))?,
        };
        Ok(self.take_after(topic, after, limit))
    }

    async fn last_id(&self, topic: &str) -> Result<Option<String>, BusError> {
        let topics = self.topics.read();
        Ok(topics.get(topic).and_then(|state| {
            (state.last != EntryId::ZERO).then(|| state.last.to_string())
        }))
    }

    async fn ensure_group(
        &self,
        topic: &str,
        group: &str,
        offset: &Offset,
    ) -> Result<(), BusError> {
        let mut topics = self.topics.write();
        let state = topics.entry(topic.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(());
        }
        let cursor = Self::resolve_offset(state, offset)?;
        state.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), BusError> {
        let id = EntryId::parse(id)
            .ok_or_else(|| BusError::Ack(format!("invalid message id: {id}")))?;
        let mut topics = self.topics.write();
        if let Some(state) = topics.get_mut(topic)
            && let Some(group) = state.groups.get_mut(group)
        {
            group.pending.remove(&id);
        }
        Ok(())
    }

    async fn open_reader(&self) -> Result<Box<dyn StreamReader>, BusError> {
        Ok(Box::new(MemoryReader {
            backend: self.clone(),
        }))
    }

    async fn stats(&self, topic: &str, group: &str) -> Result<StreamStats, BusError> {
        let topics = self.topics.read();
        let Some(state) = topics.get(topic) else {
            return Ok(StreamStats::default());
        };
        let Some(group) = state.groups.get(group) else {
            return Ok(StreamStats {
                length: state.entries.len() as u64,
                ..StreamStats::default()
            });
        };
        let mut consumers: Vec<&str> = group
            .pending
            .values()
            .map(|(consumer, _)| consumer.as_str())
            .collect();
        consumers.sort_unstable();
        consumers.dedup();
        Ok(StreamStats {
            length: state.entries.len() as u64,
            pending: group.pending.len() as u64,
            consumers: consumers.len() as u64,
        })
    }

    async fn health_check(&self) -> Result<(), BusError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryReader {
    backend: MemoryStreamBackend,
}

impl MemoryReader {
    /// Run `take` until it yields entries or the block window elapses.
    /// The Notified future is registered before the check so a publish
    /// racing the check cannot be missed.
    async fn blocking_read<T>(
        &self,
        topic: &str,
        block: Duration,
        mut take: impl FnMut(&MemoryStreamBackend) -> Vec<T>,
    ) -> Vec<T> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notify = self.backend.notifier(topic);
            let mut notified = pin!(notify.notified());
            notified.as_mut().enable();

            let taken = take(&self.backend);
            if !taken.is_empty() {
                return taken;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Vec::new(),
            }
        }
    }
}

#[async_trait]
impl StreamReader for MemoryReader {
    async fn read_group(
        &mut self,
        topic: &str,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<RawEntry>, BusError> {
        Ok(self
            .blocking_read(topic, block, |backend| {
                backend.take_for_group(topic, group, consumer, count)
            })
            .await)
    }

    async fn read_tail(
        &mut self,
        topic: &str,
        after: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<RawEntry>, BusError> {
        let after = EntryId::parse(after)
            .ok_or_else(|| BusError::Stream(format!("invalid cursor: {after}")))?;
        Ok(self
            .blocking_read(topic, block, |backend| {
                backend.take_after(topic, after, count)
            })
            .await)
    }

    async fn close(self: Box<Self>, _unhealthy: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(tag: &str) -> Vec<(&'static str, Vec<u8>)> {
        vec![("type", tag.as_bytes().to_vec())]
    }

    #[tokio::test]
    async fn append_assigns_ordered_ids() {
        let backend = MemoryStreamBackend::new();
        let a = backend.append("t", &fields("a"), None).await.unwrap();
        let b = backend.append("t", &fields("b"), None).await.unwrap();
        assert!(EntryId::parse(&a).unwrap() < EntryId::parse(&b).unwrap());
        assert_eq!(backend.last_id("t").await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn range_from_cursor_is_exclusive() {
        let backend = MemoryStreamBackend::new();
        let a = backend.append("t", &fields("a"), None).await.unwrap();
        let b = backend.append("t", &fields("b"), None).await.unwrap();

        let all = backend.range("t", RangeStart::Begin, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let rest = backend.range("t", RangeStart::After(a), 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, b);
    }

    #[tokio::test]
    async fn group_delivers_each_entry_once() {
        let backend = MemoryStreamBackend::new();
        backend
            .ensure_group("t", "g", &Offset::Begin)
            .await
            .unwrap();
        backend.append("t", &fields("a"), None).await.unwrap();
        backend.append("t", &fields("b"), None).await.unwrap();

        let first = backend.take_for_group("t", "g", "c1", 1);
        let second = backend.take_for_group("t", "g", "c2", 10);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);

        let stats = backend.stats("t", "g").await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.consumers, 2);
    }

    #[tokio::test]
    async fn ack_clears_pending() {
        let backend = MemoryStreamBackend::new();
        backend
            .ensure_group("t", "g", &Offset::Begin)
            .await
            .unwrap();
        backend.append("t", &fields("a"), None).await.unwrap();

        let taken = backend.take_for_group("t", "g", "c1", 10);
        backend.ack("t", "g", &taken[0].id).await.unwrap();

        let stats = backend.stats("t", "g").await.unwrap();
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn group_offset_now_skips_history() {
        let backend = MemoryStreamBackend::new();
        backend.append("t", &fields("old"), None).await.unwrap();
        backend.ensure_group("t", "g", &Offset::Now).await.unwrap();
        backend.append("t", &fields("new"), None).await.unwrap();

        let taken = backend.take_for_group("t", "g", "c1", 10);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].fields[0].1, b"new");
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let backend = MemoryStreamBackend::new();
        backend.append("t", &fields("a"), None).await.unwrap();
        backend
            .ensure_group("t", "g", &Offset::Begin)
            .await
            .unwrap();
        let taken = backend.take_for_group("t", "g", "c1", 10);
        assert_eq!(taken.len(), 1);

        // re-creating with a different offset must not move the cursor
        backend.ensure_group("t", "g", &Offset::Now).await.unwrap();
        backend.append("t", &fields("b"), None).await.unwrap();
        let taken = backend.take_for_group("t", "g", "c1", 10);
        assert_eq!(taken.len(), 1);
    }

    #[tokio::test]
    async fn trim_drops_oldest_and_their_pending() {
        let backend = MemoryStreamBackend::new();
        backend
            .ensure_group("t", "g", &Offset::Begin)
            .await
            .unwrap();
        for i in 0..5 {
            backend
                .append("t", &fields(&format!("m{i}")), None)
                .await
                .unwrap();
        }
        backend.take_for_group("t", "g", "c1", 10);

        backend.append("t", &fields("m5"), Some(3)).await.unwrap();
        let stats = backend.stats("t", "g").await.unwrap();
        assert_eq!(stats.length, 3);
        // pending entries for trimmed ids were swept
        assert!(stats.pending <= 3);
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_publish() {
        let backend = MemoryStreamBackend::new();
        backend
            .ensure_group("t", "g", &Offset::Begin)
            .await
            .unwrap();
        let mut reader = backend.open_reader().await.unwrap();

        let publisher = backend.clone();
        let publish = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.append("t", &fields("late"), None).await.unwrap();
        });

        let entries = reader
            .read_group("t", "g", "c1", Duration::from_secs(5), 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        publish.await.unwrap();
        reader.close(false).await;
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty() {
        let backend = MemoryStreamBackend::new();
        backend
            .ensure_group("t", "g", &Offset::Begin)
            .await
            .unwrap();
        let mut reader = backend.open_reader().await.unwrap();
        let entries = reader
            .read_group("t", "g", "c1", Duration::from_millis(30), 10)
            .await
            .unwrap();
        assert!(entries.is_empty());
        reader.close(false).await;
    }
}
