//! Redis Streams adapter. Streams map 1:1 onto Redis Streams primitives:
//! `append` → `XADD`, `read_group` → `XREADGROUP ... STREAMS stream >`,
//! `ack` → `XACK`, `pending`/`claim` → `XPENDING`/`XCLAIM`, `stream_info`/
//! `group_info` → `XINFO STREAM`/`XINFO GROUPS`.
//!
//! Grounded in the one example repo in the pack that depends on Redis
//! (`ItsKorayYT-antarcticom`'s `redis::Client::open` usage); the primary
//! teacher workspace is Postgres-backed, so this dependency is carried in
//! per the "supplement from the rest of the pack" allowance rather than
//! from the teacher directly.

use redis::aio::ConnectionManager;
use redis::Value;
use tracing::debug;

use pipeline_domain::ports::{Broker, BrokerError, GroupInfo, PendingEntry, StreamId, StreamInfo};
use pipeline_domain::Fields;

pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Opens a connection to `url` (e.g. `redis://127.0.0.1:6379`) backed by
    /// a [`ConnectionManager`], which reconnects transparently on transient
    /// network failures rather than requiring callers to retry connects.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(url).map_err(|err| BrokerError::ConnectionFailed(err.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|err| BrokerError::ConnectionFailed(err.to_string()))?;
        Ok(Self { conn })
    }
}

fn map_err(err: redis::RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        BrokerError::ConnectionFailed(err.to_string())
    } else {
        BrokerError::CommandFailed(err.to_string())
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Data(_) | Value::Status(_) => value_to_string(value)?.parse().ok(),
        _ => None,
    }
}

/// Parses one stream entry (`[id, [field, value, field, value, ...]]`).
fn parse_entry(entry: &Value) -> Option<(StreamId, Fields)> {
    let Value::Bulk(parts) = entry else { return None };
    if parts.len() != 2 {
        return None;
    }
    let id = value_to_string(&parts[0])?;
    let Value::Bulk(flat) = &parts[1] else { return None };
    let mut fields = Fields::new();
    let mut iter = flat.iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        if let (Some(key), Some(value)) = (value_to_string(key), value_to_string(value)) {
            fields.insert(key, value);
        }
    }
    Some((id, fields))
}

fn parse_entries(value: &Value) -> Vec<(StreamId, Fields)> {
    match value {
        Value::Bulk(entries) => entries.iter().filter_map(parse_entry).collect(),
        _ => Vec::new(),
    }
}

/// Parses the nested `XREAD`/`XREADGROUP` reply shape
/// (`[[stream_name, [entry, entry, ...]]]`) down to this one stream's
/// entries.
fn parse_xread_reply(value: Value, stream: &str) -> Vec<(StreamId, Fields)> {
    let Value::Bulk(streams) = value else { return Vec::new() };
    for entry in streams {
        let Value::Bulk(pair) = entry else { continue };
        if pair.len() != 2 {
            continue;
        }
        if value_to_string(&pair[0]).as_deref() == Some(stream) {
            return parse_entries(&pair[1]);
        }
    }
    Vec::new()
}

#[async_trait::async_trait]
impl Broker for RedisBroker {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(err) => Err(map_err(err)),
        }
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<StreamId, BrokerError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in &fields {
            cmd.arg(key).arg(value);
        }
        let id: String = cmd.query_async(&mut conn).await.map_err(map_err)?;
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(StreamId, Fields)>, BrokerError> {
        let mut conn = self.conn.clone();
        let value: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(parse_xread_reply(value, stream))
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError> {
        let mut conn = self.conn.clone();
        let value: Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(1000)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        let Value::Bulk(entries) = value else { return Ok(Vec::new()) };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let Value::Bulk(parts) = entry else { continue };
            if parts.len() != 4 {
                continue;
            }
            let id = value_to_string(&parts[0]).unwrap_or_default();
            let consumer = value_to_string(&parts[1]).unwrap_or_default();
            let idle_ms = value_to_i64(&parts[2]).unwrap_or(0).max(0) as u64;
            let deliveries = value_to_i64(&parts[3]).unwrap_or(1).max(1) as u32;
            out.push(PendingEntry { id, consumer, idle_ms, deliveries });
        }
        Ok(out)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<(StreamId, Fields)>, BrokerError> {
        let candidates = self.pending(stream, group).await?;
        let ids: Vec<String> = candidates
            .into_iter()
            .filter(|entry| entry.idle_ms >= min_idle_ms)
            .map(|entry| entry.id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(min_idle_ms);
        for id in &ids {
            cmd.arg(id);
        }
        let value: Value = cmd.query_async(&mut conn).await.map_err(map_err)?;
        Ok(parse_entries(&value))
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError> {
        let mut conn = self.conn.clone();
        let value: Value = redis::cmd("XINFO")
            .arg("STREAM")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        let mut info = StreamInfo::default();
        let Value::Bulk(items) = value else { return Ok(info) };
        let mut iter = items.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            let Some(key) = value_to_string(&key) else { continue };
            match key.as_str() {
                "length" => info.length = value_to_i64(&value).unwrap_or(0).max(0) as u64,
                "first-entry" => info.first_id = extract_entry_id(&value),
                "last-entry" => info.last_id = extract_entry_id(&value),
                _ => {}
            }
        }
        Ok(info)
    }

    async fn group_info(&self, stream: &str, group: &str) -> Result<GroupInfo, BrokerError> {
        let mut conn = self.conn.clone();
        let value: Value = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        let Value::Bulk(groups) = value else {
            return Err(BrokerError::NotFound(format!("{stream}/{group}")));
        };
        for entry in groups {
            let Value::Bulk(items) = entry else { continue };
            let mut info = GroupInfo::default();
            let mut iter = items.into_iter();
            while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                let Some(key) = value_to_string(&key) else { continue };
                match key.as_str() {
                    "name" => info.name = value_to_string(&value).unwrap_or_default(),
                    "consumers" => info.consumers = value_to_i64(&value).unwrap_or(0).max(0) as u64,
                    "pending" => info.pending = value_to_i64(&value).unwrap_or(0).max(0) as u64,
                    _ => {}
                }
            }
            if info.name == group {
                return Ok(info);
            }
        }
        Err(BrokerError::NotFound(format!("{stream}/{group}")))
    }
}

fn extract_entry_id(value: &Value) -> Option<StreamId> {
    let Value::Bulk(parts) = value else { return None };
    parts.first().and_then(value_to_string)
}
