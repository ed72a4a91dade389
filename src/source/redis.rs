// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams upstream.
//!
//! The upstream publishes each WAL record as one entry of the stream
//! `{key_prefix}{namespace}:wal`, using the record's offset as the entry ID:
//!
//! ```text
//! XADD demo:wal 3-17 op PUT key user.42 data <bytes> hash <sha256 hex>
//! XADD demo:wal 3-18 op DEL key user.7
//! ```
//!
//! Redis orders entry IDs exactly like [`Offset`], so `XREAD ... <resume>`
//! returns the records strictly after the replica's position. Redis refuses
//! the ID `0-0`, so the first record of a log is at least `0-1` and
//! [`Offset::ORIGIN`] always means "from the beginning".
//!
//! # Content Hash Validation
//!
//! When a PUT entry includes a `hash` field, the SHA256 of the decompressed
//! data must match. Payloads starting with the zstd magic are decompressed.
//! A malformed entry fails the read with `StreamParse`; it is never skipped.
//!
//! # Stream Trimming
//!
//! If retention removed records after the resume point, resuming would skip
//! them. On subscribe and on every tail refresh the resume point is checked
//! against the oldest retained entry:
//!
//! | Oldest retained entry | Verdict |
//! |-----------------------|---------|
//! | at or before resume, or directly after it | intact |
//! | same segment, offsets missing in between | fatal `StreamTrimmed` |
//! | a whole segment missing in between | fatal `StreamTrimmed` |
//! | the next segment | unverified: logged, streaming continues |
//!
//! Offsets are dense within a segment and segments are never empty, but the
//! first offset of a new segment is not known, so a segment rollover alone
//! proves nothing.

use super::{BatchStream, UpstreamSource};
use crate::batch::{WalBatch, WalOp, WalRecord};
use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::offset::Offset;
use crate::sink::BoxFuture;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// How often to refresh the upstream tail (in reads).
const TAIL_REFRESH_INTERVAL: u64 = 10;

/// Subscribes to WAL streams on a Redis server.
pub struct RedisSource {
    client: Client,
    url: String,
    key_prefix: String,
    block_timeout: Duration,
    batch_size: usize,
    connection_timeout: Duration,
}

impl RedisSource {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| RelayError::Config(format!("Invalid Redis URL '{}': {}", config.redis_url, e)))?;
        if config.batch_size == 0 {
            return Err(RelayError::Config("upstream.batch_size must be at least 1".to_string()));
        }
        Ok(Self {
            client,
            url: config.redis_url.clone(),
            key_prefix: config.key_prefix.clone(),
            block_timeout: config.block_timeout_duration(),
            batch_size: config.batch_size,
            connection_timeout: config.connection_timeout_duration(),
        })
    }

    /// Stream key holding the WAL for `namespace`.
    pub fn stream_key(&self, namespace: &str) -> String {
        format!("{}{}:wal", self.key_prefix, namespace)
    }
}

impl UpstreamSource for RedisSource {
    type Stream = RedisBatchStream;

    fn subscribe<'a>(&'a self, start: Offset, namespace: &'a str) -> BoxFuture<'a, Result<RedisBatchStream>> {
        Box::pin(async move {
            // Wrap connection attempt in a timeout to avoid hanging on unreachable hosts
            let conn = match timeout(self.connection_timeout, self.client.get_connection_manager()).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(RelayError::connection(&self.url, e.to_string())),
                Err(_) => {
                    return Err(RelayError::connection(
                        &self.url,
                        format!("connect timed out after {}ms", self.connection_timeout.as_millis()),
                    ))
                }
            };

            let mut stream = RedisBatchStream {
                conn,
                stream_key: self.stream_key(namespace),
                namespace: namespace.to_string(),
                cursor: ReadCursor::new(start),
                block_timeout: self.block_timeout,
                batch_size: self.batch_size,
                rollover_noted: None,
            };
            stream.refresh_tail().await?;

            info!(
                stream_key = %stream.stream_key,
                start = %start,
                tail = %stream.cursor.tail.map(|t| t.to_string()).unwrap_or_else(|| "empty".to_string()),
                "Subscribed to upstream WAL stream"
            );
            Ok(stream)
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Position bookkeeping for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadCursor {
    /// Offset of the last record handed out (exclusive start for the next read).
    resume: Offset,
    tail: Option<Offset>,
    reads: u64,
}

impl ReadCursor {
    fn new(resume: Offset) -> Self {
        Self {
            resume,
            tail: None,
            reads: 0,
        }
    }

    /// Account for one XREAD.
    ///
    /// Moves past the records just read before reporting whether a tail
    /// refresh is due, so retention is always judged from the new position.
    fn on_read(&mut self, records: Vec<WalRecord>) -> Result<(Option<WalBatch>, bool)> {
        self.reads += 1;
        let batch = if records.is_empty() {
            None
        } else {
            let batch = WalBatch::new(records).map_err(|e| RelayError::StreamParse(e.to_string()))?;
            self.resume = batch.position();
            self.raise_tail(self.resume);
            Some(batch)
        };
        Ok((batch, self.reads % TAIL_REFRESH_INTERVAL == 0))
    }

    fn raise_tail(&mut self, candidate: Offset) {
        if self.tail.map_or(true, |t| candidate > t) {
            self.tail = Some(candidate);
        }
    }
}

/// A live XREAD subscription.
pub struct RedisBatchStream {
    conn: ConnectionManager,
    stream_key: String,
    namespace: String,
    cursor: ReadCursor,
    block_timeout: Duration,
    batch_size: usize,
    /// Resume point already reported as crossing a segment rollover.
    rollover_noted: Option<Offset>,
}

impl RedisBatchStream {
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Oldest and newest entry IDs, or `None` for an empty/missing stream.
    async fn bounds(&mut self) -> Result<Option<(Offset, Offset)>> {
        // XRANGE key - + COUNT 1 returns the oldest entry
        let oldest: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| RelayError::redis("XRANGE", e))?;

        // XREVRANGE key + - COUNT 1 returns the newest entry
        let latest: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XREVRANGE")
            .arg(&self.stream_key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| RelayError::redis("XREVRANGE", e))?;

        match (oldest.first(), latest.first()) {
            (Some((oldest, _)), Some((latest, _))) => Ok(Some((parse_entry_id(oldest)?, parse_entry_id(latest)?))),
            _ => Ok(None),
        }
    }

    /// Re-read the upstream tail and check the resume point is still retained.
    async fn refresh_tail(&mut self) -> Result<()> {
        let Some((oldest, latest)) = self.bounds().await? else {
            return Ok(());
        };
        let resume = self.cursor.resume;
        match check_retention(resume, oldest) {
            Retention::Intact => {}
            Retention::Unverified => {
                if self.rollover_noted != Some(resume) {
                    warn!(
                        resume = %resume,
                        oldest = %oldest,
                        "Upstream retention passed a segment rollover; cannot verify no records were trimmed"
                    );
                    self.rollover_noted = Some(resume);
                }
            }
            Retention::Trimmed => {
                metrics::record_stream_trimmed(&self.namespace);
                return Err(RelayError::StreamTrimmed { resume, oldest });
            }
        }
        self.cursor.raise_tail(latest);
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<WalRecord>> {
        let opts = StreamReadOptions::default()
            .block(self.block_timeout.as_millis() as usize)
            .count(self.batch_size);

        let started = Instant::now();
        // XREAD BLOCK timeout COUNT batch STREAMS key resume
        let reply: StreamReadReply = self
            .conn
            .xread_options(&[&self.stream_key], &[self.cursor.resume.to_string()], &opts)
            .await
            .map_err(|e| RelayError::redis("XREAD", e))?;
        metrics::record_stream_read(&self.namespace, started.elapsed());

        let mut records = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                let record = parse_entry(&entry.id, &entry.map)?;
                trace!(offset = %record.offset, op = %record.op, key = %record.key, "Parsed WAL entry");
                records.push(record);
            }
        }
        Ok(records)
    }
}

impl BatchStream for RedisBatchStream {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<WalBatch>>> {
        Box::pin(async move {
            loop {
                let records = self.read().await?;
                let (batch, refresh_due) = self.cursor.on_read(records)?;
                if refresh_due {
                    self.refresh_tail().await?;
                }

                match batch {
                    Some(batch) => return Ok(Some(batch)),
                    // XREAD timeout: nothing new yet
                    None => debug!(stream_key = %self.stream_key, "No new WAL entries"),
                }
            }
        })
    }

    fn upstream_tail(&self) -> Option<Offset> {
        self.cursor.tail
    }
}

/// What the oldest retained entry says about records after `resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retention {
    Intact,
    /// Oldest entry is in the next segment; its first offset is unknown.
    Unverified,
    /// Records after `resume` are provably gone.
    Trimmed,
}

fn check_retention(resume: Offset, oldest: Offset) -> Retention {
    if resume == Offset::ORIGIN || resume >= oldest {
        return Retention::Intact;
    }
    if oldest.segment_id == resume.segment_id {
        return if resume.offset.checked_add(1) == Some(oldest.offset) {
            Retention::Intact
        } else {
            Retention::Trimmed
        };
    }
    // resume < oldest, so oldest is in a later segment
    if oldest.segment_id - resume.segment_id > 1 {
        Retention::Trimmed
    } else {
        Retention::Unverified
    }
}

fn parse_entry_id(id: &str) -> Result<Offset> {
    id.parse::<Offset>()
        .map_err(|e| RelayError::StreamParse(e.to_string()))
}

/// Parse a stream entry into a WalRecord.
fn parse_entry(entry_id: &str, fields: &HashMap<String, redis::Value>) -> Result<WalRecord> {
    let offset = parse_entry_id(entry_id)?;

    let op_str = get_string_field(fields, "op")?;
    let op = WalOp::parse(&op_str).ok_or_else(|| {
        RelayError::StreamParse(format!("Unknown op type at {}: {}", offset, op_str))
    })?;
    let key = get_string_field(fields, "key")?;

    if op == WalOp::Delete {
        return Ok(WalRecord::delete(offset, key));
    }

    // Data is binary, may be compressed
    let raw_data = get_bytes_field(fields, "data")?;
    let data = maybe_decompress(&raw_data)?;

    if let Ok(expected_hash) = get_string_field(fields, "hash") {
        let computed = compute_content_hash(&data);
        if computed != expected_hash {
            return Err(RelayError::StreamParse(format!(
                "Content hash mismatch at {} for key '{}': expected {}, got {}",
                offset, key, expected_hash, computed
            )));
        }
    }

    Ok(WalRecord::put(offset, key, data))
}

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| RelayError::StreamParse(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| RelayError::StreamParse(format!("Invalid UTF-8 in {}: {}", name, e))),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(RelayError::StreamParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Extract a bytes field from a stream entry.
fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| RelayError::StreamParse(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(RelayError::StreamParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| RelayError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| RelayError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// SHA256 content hash as hex string.
pub fn compute_content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
