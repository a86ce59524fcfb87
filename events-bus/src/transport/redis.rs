use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamInfoGroupsReply, StreamMaxlen, StreamPendingCountReply,
    StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{GroupReader, StreamEntry, StreamInfo, StreamTransport};
use crate::config::BusConfig;
use crate::error::{EventBusError, Result};

/// Redis Streams transport.
///
/// Publishes, acks and introspection share one auto-reconnecting
/// [`ConnectionManager`]. Each [`GroupReader`] gets its own connection
/// because `XREADGROUP ... BLOCK` parks the connection it runs on.
pub struct RedisTransport {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisTransport {
    /// Connect with the retry budget from `config`. The backoff grows
    /// linearly with the attempt number.
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| EventBusError::Connection(format!("invalid redis url: {e}")))?;

        let mut attempt = 0u32;
        let manager = loop {
            attempt += 1;
            match ConnectionManager::new(client.clone()).await {
                Ok(manager) => break manager,
                Err(e) if attempt < config.max_connect_attempts => {
                    warn!(attempt, error = %e, "redis connection attempt failed, retrying");
                    tokio::time::sleep(config.connect_backoff * attempt).await;
                }
                Err(e) => {
                    return Err(EventBusError::Connection(format!(
                        "redis unreachable after {attempt} attempts: {e}"
                    )));
                }
            }
        };
        info!("connected to redis");
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl StreamTransport for RedisTransport {
    async fn append(
        &self,
        stream: &str,
        maxlen: usize,
        fields: &HashMap<String, String>,
    ) -> Result<String> {
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let mut conn = self.manager.clone();
        let entry_id: String = conn
            .xadd_maxlen(stream, StreamMaxlen::Approx(maxlen), "*", &items)
            .await
            .map_err(|e| EventBusError::Transport(format!("XADD {stream} failed: {e}")))?;
        Ok(entry_id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let created: std::result::Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(_) => {
                debug!(stream, group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(EventBusError::Subscription(format!(
                "XGROUP CREATE {stream}/{group} failed: {e}"
            ))),
        }
    }

    async fn open_reader(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn GroupReader>> {
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| EventBusError::Connection(format!("reader connection failed: {e}")))?;
        Ok(Box::new(RedisGroupReader {
            conn,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        }))
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let mut conn = self.manager.clone();
        let reply: StreamRangeReply = conn
            .xrange_count(stream, "-", "+", count)
            .await
            .map_err(|e| EventBusError::Transport(format!("XRANGE {stream} failed: {e}")))?;
        Ok(reply.ids.into_iter().map(entry_from_stream_id).collect())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let mut conn = self.manager.clone();
        let exists: bool = conn
            .exists(stream)
            .await
            .map_err(|e| EventBusError::Transport(format!("EXISTS {stream} failed: {e}")))?;
        if !exists {
            return Ok(StreamInfo::missing());
        }

        let length: u64 = conn
            .xlen(stream)
            .await
            .map_err(|e| EventBusError::Transport(format!("XLEN {stream} failed: {e}")))?;
        let first: StreamRangeReply = conn
            .xrange_count(stream, "-", "+", 1)
            .await
            .map_err(|e| EventBusError::Transport(format!("XRANGE {stream} failed: {e}")))?;
        let last: StreamRangeReply = conn
            .xrevrange_count(stream, "+", "-", 1)
            .await
            .map_err(|e| EventBusError::Transport(format!("XREVRANGE {stream} failed: {e}")))?;
        let groups: StreamInfoGroupsReply = conn
            .xinfo_groups(stream)
            .await
            .map_err(|e| EventBusError::Transport(format!("XINFO GROUPS {stream} failed: {e}")))?;

        Ok(StreamInfo {
            exists: true,
            length,
            first_entry: first.ids.first().map(|entry| entry.id.clone()),
            last_entry: last.ids.first().map(|entry| entry.id.clone()),
            group_count: groups.groups.len() as u64,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| EventBusError::Connection(format!("redis ping failed: {e}")))?;
        Ok(())
    }
}

pub struct RedisGroupReader {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
}

#[async_trait]
impl GroupReader for RedisGroupReader {
    async fn read_new(&mut self, count: usize, block: Duration) -> Result<Vec<StreamEntry>> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count);
        // BLOCK 0 waits forever in Redis; a zero timeout here means one
        // non-blocking poll instead.
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }
        // a timed-out BLOCK returns nil rather than an empty reply
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await
            .map_err(|e| {
                EventBusError::Transport(format!("XREADGROUP {} failed: {e}", self.stream))
            })?;

        let mut entries = Vec::new();
        if let Some(reply) = reply {
            for key in reply.keys {
                entries.extend(key.ids.into_iter().map(entry_from_stream_id));
            }
        }
        Ok(entries)
    }

    async fn claim_stale(&mut self, min_idle: Duration, count: usize) -> Result<Vec<StreamEntry>> {
        let min_idle_ms = min_idle.as_millis() as usize;
        let pending: StreamPendingCountReply = self
            .conn
            .xpending_count(&self.stream, &self.group, "-", "+", count)
            .await
            .map_err(|e| {
                EventBusError::Transport(format!("XPENDING {} failed: {e}", self.stream))
            })?;

        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|entry| entry.last_delivered_ms >= min_idle_ms)
            .map(|entry| entry.id)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = self
            .conn
            .xclaim(&self.stream, &self.group, &self.consumer, min_idle_ms, &stale)
            .await
            .map_err(|e| EventBusError::Transport(format!("XCLAIM {} failed: {e}", self.stream)))?;
        Ok(claimed.ids.into_iter().map(entry_from_stream_id).collect())
    }

    async fn ack(&mut self, entry_id: &str) -> Result<()> {
        let _: i64 = self
            .conn
            .xack(&self.stream, &self.group, &[entry_id])
            .await
            .map_err(|e| EventBusError::Transport(format!("XACK {} failed: {e}", self.stream)))?;
        Ok(())
    }
}

fn entry_from_stream_id(entry: redis::streams::StreamId) -> StreamEntry {
    let mut fields = HashMap::with_capacity(entry.map.len());
    for (key, value) in entry.map {
        if let Ok(text) = redis::from_redis_value::<String>(&value) {
            fields.insert(key, text);
        }
    }
    StreamEntry {
        id: entry.id,
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::streams::StreamId;
    use redis::Value;

    #[test]
    fn test_entry_conversion_keeps_text_fields() {
        let mut map = HashMap::new();
        map.insert("event_type".to_string(), Value::Data(b"note.signed".to_vec()));
        map.insert("resource_id".to_string(), Value::Data(b"note-4".to_vec()));
        let entry = entry_from_stream_id(StreamId {
            id: "1700000000000-0".to_string(),
            map,
        });
        assert_eq!(entry.id, "1700000000000-0");
        assert_eq!(entry.fields["event_type"], "note.signed");
        assert_eq!(entry.fields["resource_id"], "note-4");
    }
}
