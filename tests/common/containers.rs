// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up a Redis container acting as the WAL upstream
//! and to append WAL entries to it.

use redis::AsyncCommands;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};
use wal_relay::source::compute_content_hash;
use wal_relay::Offset;

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis upstream holding one namespace's WAL stream.
pub struct TestUpstream<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub namespace: String,
    pub redis_url: String,
}

impl<'a> TestUpstream<'a> {
    pub fn new(docker: &'a Cli, namespace: &str) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self {
            container,
            namespace: namespace.to_string(),
            redis_url,
        }
    }

    pub fn stream_key(&self) -> String {
        format!("{}:wal", self.namespace)
    }

    async fn connection(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Append a raw entry with an explicit ID (`segment-offset`).
    pub async fn add_entry(&self, offset: Offset, fields: &[(&str, &[u8])]) -> redis::RedisResult<String> {
        let mut conn = self.connection().await?;
        conn.xadd(self.stream_key(), offset.to_string(), fields).await
    }

    /// Append a PUT, optionally zstd-compressed, with its content hash.
    pub async fn add_put(&self, offset: Offset, key: &str, data: &[u8], compress: bool) -> redis::RedisResult<String> {
        let hash = compute_content_hash(data);
        let payload = if compress {
            zstd::encode_all(data, 3).map_err(|e| redis::RedisError::from((redis::ErrorKind::IoError, "zstd", e.to_string())))?
        } else {
            data.to_vec()
        };
        self.add_entry(
            offset,
            &[
                ("op", b"PUT".as_slice()),
                ("key", key.as_bytes()),
                ("data", payload.as_slice()),
                ("hash", hash.as_bytes()),
            ],
        )
        .await
    }

    pub async fn add_delete(&self, offset: Offset, key: &str) -> redis::RedisResult<String> {
        self.add_entry(offset, &[("op", b"DEL".as_slice()), ("key", key.as_bytes())])
            .await
    }

    /// Drop every entry older than `oldest`.
    pub async fn trim_before(&self, oldest: Offset) -> redis::RedisResult<usize> {
        let mut conn = self.connection().await?;
        redis::cmd("XTRIM")
            .arg(self.stream_key())
            .arg("MINID")
            .arg(oldest.to_string())
            .query_async(&mut conn)
            .await
    }

    pub async fn stream_len(&self) -> redis::RedisResult<usize> {
        let mut conn = self.connection().await?;
        conn.xlen(self.stream_key()).await
    }
}
