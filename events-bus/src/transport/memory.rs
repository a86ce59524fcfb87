use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{GroupReader, StreamEntry, StreamInfo, StreamTransport};
use crate::error::{EventBusError, Result};

/// In-process stream backend with the same observable semantics the bus
/// relies on from Redis Streams: capped appends, consumer groups with a
/// per-group cursor and pending set, idle-based claiming, and blocking
/// reads that wake on append.
///
/// Cloning shares the underlying state, matching how a connection handle
/// to a real backend behaves.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<MemoryState>,
}

struct MemoryState {
    streams: Mutex<HashMap<String, MemStream>>,
    appended: Notify,
}

#[derive(Default)]
struct MemStream {
    entries: VecDeque<MemEntry>,
    last_id: EntryId,
    groups: HashMap<String, MemGroup>,
}

#[derive(Clone)]
struct MemEntry {
    id: EntryId,
    fields: HashMap<String, String>,
}

#[derive(Default)]
struct MemGroup {
    /// Highest entry id ever delivered to any consumer of this group.
    cursor: EntryId,
    /// Delivered but not yet acknowledged, keyed in id order.
    pending: BTreeMap<EntryId, PendingDelivery>,
}

struct PendingDelivery {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    fn next_after(last: EntryId) -> EntryId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        if now > last.ms {
            EntryId { ms: now, seq: 0 }
        } else {
            EntryId {
                ms: last.ms,
                seq: last.seq + 1,
            }
        }
    }

    fn render(&self) -> String {
        format!("{}-{}", self.ms, self.seq)
    }

    fn parse(raw: &str) -> Option<Self> {
        let (ms, seq) = raw.split_once('-')?;
        Some(Self {
            ms: ms.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MemoryState {
                streams: Mutex::new(HashMap::new()),
                appended: Notify::new(),
            }),
        }
    }
}

impl MemoryState {
    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| EventBusError::Transport(format!("no such stream `{stream}`")))?;
        let MemStream {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| {
            EventBusError::Transport(format!("no such group `{group}` on stream `{stream}`"))
        })?;

        let mut out = Vec::new();
        for entry in entries.iter() {
            if out.len() >= count {
                break;
            }
            if entry.id > group_state.cursor {
                group_state.cursor = entry.id;
                group_state.pending.insert(
                    entry.id,
                    PendingDelivery {
                        consumer: consumer.to_string(),
                        delivered_at: Instant::now(),
                        delivery_count: 1,
                    },
                );
                out.push(StreamEntry {
                    id: entry.id.render(),
                    fields: entry.fields.clone(),
                });
            }
        }
        Ok(out)
    }

    fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Vec<StreamEntry> {
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Vec::new();
        };
        let MemStream {
            entries, groups, ..
        } = state;
        let Some(group_state) = groups.get_mut(group) else {
            return Vec::new();
        };

        let stale: Vec<EntryId> = group_state
            .pending
            .iter()
            .filter(|(_, delivery)| delivery.delivered_at.elapsed() >= min_idle)
            .map(|(id, _)| *id)
            .take(count)
            .collect();

        let mut out = Vec::new();
        for id in stale {
            match entries.iter().find(|entry| entry.id == id) {
                Some(entry) => {
                    if let Some(delivery) = group_state.pending.get_mut(&id) {
                        delivery.consumer = consumer.to_string();
                        delivery.delivered_at = Instant::now();
                        delivery.delivery_count += 1;
                    }
                    out.push(StreamEntry {
                        id: entry.id.render(),
                        fields: entry.fields.clone(),
                    });
                }
                None => {
                    // entry was trimmed out from under the group
                    group_state.pending.remove(&id);
                }
            }
        }
        out
    }

    fn acknowledge(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let id = EntryId::parse(entry_id)
            .ok_or_else(|| EventBusError::Transport(format!("invalid entry id `{entry_id}`")))?;
        let mut streams = self.streams.lock();
        if let Some(state) = streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(&id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn append(
        &self,
        stream: &str,
        maxlen: usize,
        fields: &HashMap<String, String>,
    ) -> Result<String> {
        let id = {
            let mut streams = self.state.streams.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let id = EntryId::next_after(state.last_id);
            state.last_id = id;
            state.entries.push_back(MemEntry {
                id,
                fields: fields.clone(),
            });
            while state.entries.len() > maxlen {
                state.entries.pop_front();
            }
            id
        };
        self.state.appended.notify_waiters();
        Ok(id.render())
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut streams = self.state.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn open_reader(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn GroupReader>> {
        Ok(Box::new(MemoryGroupReader {
            state: self.state.clone(),
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        }))
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let streams = self.state.streams.lock();
        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(state
            .entries
            .iter()
            .take(count)
            .map(|entry| StreamEntry {
                id: entry.id.render(),
                fields: entry.fields.clone(),
            })
            .collect())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let streams = self.state.streams.lock();
        let Some(state) = streams.get(stream) else {
            return Ok(StreamInfo::missing());
        };
        Ok(StreamInfo {
            exists: true,
            length: state.entries.len() as u64,
            first_entry: state.entries.front().map(|entry| entry.id.render()),
            last_entry: state.entries.back().map(|entry| entry.id.render()),
            group_count: state.groups.len() as u64,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryGroupReader {
    state: Arc<MemoryState>,
    stream: String,
    group: String,
    consumer: String,
}

#[async_trait]
impl GroupReader for MemoryGroupReader {
    async fn read_new(&mut self, count: usize, block: Duration) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.state.appended.notified();
            tokio::pin!(notified);
            // Enable before checking: notify_waiters stores no permit, so
            // an un-enabled waiter misses appends landing between the
            // emptiness check and the select below.
            notified.as_mut().enable();
            let entries = self
                .state
                .take_new(&self.stream, &self.group, &self.consumer, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(deadline - now) => return Ok(Vec::new()),
            }
        }
    }

    async fn claim_stale(&mut self, min_idle: Duration, count: usize) -> Result<Vec<StreamEntry>> {
        Ok(self
            .state
            .claim_pending(&self.stream, &self.group, &self.consumer, min_idle, count))
    }

    async fn ack(&mut self, entry_id: &str) -> Result<()> {
        self.state.acknowledge(&self.stream, &self.group, entry_id)
    }
}
