//! Redis Streams implementation of [`StreamStore`].
//!
//! Maps the consumer-group primitives onto `XGROUP`, `XPENDING`, `XCLAIM`,
//! `XREADGROUP`, `XACK`, `HGETALL` and `SCAN`. A single multiplexed
//! connection to the primary is shared by all shards through the
//! [`ConnectionManager`]; commands that fail at the transport level mark the
//! handle broken so the next caller reconnects.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use backbone_core::{Clock, EntryId, RawEntry, StreamKey};
use bytes::Bytes;
use redis::{
    aio::MultiplexedConnection,
    streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply},
    AsyncCommands, RedisError, RedisResult,
};
use tracing::{debug, warn};

use crate::{
    config::RedisCredentials,
    connection::{ConnectionManager, ConnectionSettings, Connector},
    error::{ChannelError, Result},
    store::{StoreFuture, StreamStore},
};

const SCAN_PAGE_SIZE: usize = 500;

/// Shared connection plus a broken flag raised by failed commands.
#[derive(Clone)]
pub struct RedisHandle {
    connection: MultiplexedConnection,
    broken: Arc<AtomicBool>,
}

impl RedisHandle {
    fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }
}

/// Opens multiplexed connections to the primary node.
pub struct RedisConnector {
    client: redis::Client,
    response_timeout: Duration,
    connect_timeout: Duration,
}

impl RedisConnector {
    /// Creates a connector for the given credentials.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the endpoint cannot be parsed.
    pub fn new(credentials: &RedisCredentials, response_timeout: Duration) -> Result<Self> {
        let (host, port) = credentials.host_and_port()?;
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo {
                password: credentials.password().map(str::to_string),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)
            .map_err(|error| ChannelError::configuration(format!("invalid redis endpoint: {error}")))?;
        Ok(Self { client, response_timeout, connect_timeout: response_timeout })
    }
}

impl Connector for RedisConnector {
    type Handle = RedisHandle;

    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<RedisHandle>> + Send + '_>> {
        Box::pin(async move {
            let mut connection = self
                .client
                .get_multiplexed_async_connection_with_timeouts(
                    self.response_timeout,
                    self.connect_timeout,
                )
                .await
                .map_err(|error| ChannelError::connection(error.to_string()))?;
            let _: String = redis::cmd("PING")
                .query_async(&mut connection)
                .await
                .map_err(|error| ChannelError::connection(error.to_string()))?;
            Ok(RedisHandle { connection, broken: Arc::new(AtomicBool::new(false)) })
        })
    }

    fn is_healthy(&self, handle: &RedisHandle) -> bool {
        !handle.broken.load(Ordering::Acquire)
    }

    fn close(&self, handle: RedisHandle) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // Multiplexed connections close once the last clone is dropped
        Box::pin(async move { drop(handle) })
    }
}

/// Stream store backed by Redis Streams.
pub struct RedisStreamStore {
    connections: ConnectionManager<RedisConnector>,
    response_timeout: Duration,
}

impl RedisStreamStore {
    /// Creates a store; the connection is opened on first use.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the credentials do not describe a valid
    /// endpoint.
    pub fn new(
        credentials: &RedisCredentials,
        settings: ConnectionSettings,
        response_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let connector = RedisConnector::new(credentials, response_timeout)?;
        Ok(Self { connections: ConnectionManager::new(connector, settings, clock), response_timeout })
    }

    /// Number of reconnects performed so far.
    pub fn reconnect_count(&self) -> u64 {
        self.connections.reconnect_count()
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, command: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let handle = self.connections.acquire().await?;
        command(handle.connection.clone())
            .await
            .map_err(|error| self.classify(operation, &handle, &error))
    }

    fn classify(&self, operation: &'static str, handle: &RedisHandle, error: &RedisError) -> ChannelError {
        if error.is_timeout() {
            return ChannelError::timeout(operation, self.response_timeout);
        }
        if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
            handle.mark_broken();
            warn!(operation, error = %error, "stream store connection broken");
            return ChannelError::connection(error.to_string());
        }
        ChannelError::store(format!("{operation}: {error}"))
    }
}

fn to_raw_entry(stream_id: StreamId) -> Result<RawEntry> {
    let mut fields = HashMap::with_capacity(stream_id.map.len());
    for (name, value) in &stream_id.map {
        let text: String = redis::from_redis_value(value)
            .map_err(|error| ChannelError::assembly(stream_id.id.clone(), error.to_string()))?;
        fields.insert(name.clone(), text);
    }
    Ok(RawEntry::new(stream_id.id, fields))
}

impl StreamStore for RedisStreamStore {
    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let _: String = self
                .run("PING", |mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
                .await?;
            Ok(())
        })
    }

    fn create_group_if_absent<'a>(
        &'a self,
        key: &'a StreamKey,
        group: &'a str,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let stream = key.to_string();
            let handle = self.connections.acquire().await?;
            let mut conn = handle.connection.clone();
            let created: RedisResult<()> = conn.xgroup_create_mkstream(&stream, group, "0").await;
            match created {
                Ok(()) => {
                    debug!(stream = %key, group, "created consumer group");
                    Ok(true)
                },
                Err(error) if error.code() == Some("BUSYGROUP") => Ok(false),
                Err(error) => Err(ChannelError::GroupCreation {
                    stream,
                    group: group.to_string(),
                    message: self.classify("XGROUP CREATE", &handle, &error).to_string(),
                }),
            }
        })
    }

    fn list_pending<'a>(
        &'a self,
        key: &'a StreamKey,
        group: &'a str,
        consumer: &'a str,
        after: Option<&'a EntryId>,
        count: usize,
    ) -> StoreFuture<'a, Vec<EntryId>> {
        Box::pin(async move {
            let stream = key.to_string();
            let start = after.map_or_else(|| "-".to_string(), |id| format!("({id}"));
            let reply: StreamPendingCountReply = self
                .run("XPENDING", |mut conn| async move {
                    conn.xpending_consumer_count(&stream, group, start, "+", count, consumer).await
                })
                .await?;
            Ok(reply.ids.into_iter().map(|pending| EntryId(pending.id)).collect())
        })
    }

    fn claim<'a>(
        &'a self,
        key: &'a StreamKey,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        ids: &'a [EntryId],
    ) -> StoreFuture<'a, Vec<RawEntry>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let stream = key.to_string();
            let ids: Vec<&str> = ids.iter().map(EntryId::as_str).collect();
            let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);
            let reply: StreamClaimReply = self
                .run("XCLAIM", |mut conn| async move {
                    conn.xclaim(&stream, group, consumer, min_idle_ms, &ids).await
                })
                .await?;
            reply.ids.into_iter().map(to_raw_entry).collect()
        })
    }

    fn read_new<'a>(
        &'a self,
        key: &'a StreamKey,
        group: &'a str,
        consumer: &'a str,
        count: usize,
    ) -> StoreFuture<'a, Vec<RawEntry>> {
        Box::pin(async move {
            let stream = key.to_string();
            let options = StreamReadOptions::default().group(group, consumer).count(count);
            let reply: Option<StreamReadReply> = self
                .run("XREADGROUP", |mut conn| async move {
                    conn.xread_options(&[&stream], &[">"], &options).await
                })
                .await?;
            reply
                .into_iter()
                .flat_map(|reply| reply.keys)
                .flat_map(|stream_key| stream_key.ids)
                .map(to_raw_entry)
                .collect()
        })
    }

    fn acknowledge<'a>(
        &'a self,
        key: &'a StreamKey,
        group: &'a str,
        id: &'a EntryId,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let stream = key.to_string();
            self.run("XACK", |mut conn| async move { conn.xack(&stream, group, &[id.as_str()]).await })
                .await
        })
    }

    fn hash_entries<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<(String, Bytes)>> {
        Box::pin(async move {
            let pairs: Vec<(String, Vec<u8>)> =
                self.run("HGETALL", |mut conn| async move { conn.hgetall(key).await }).await?;
            Ok(pairs.into_iter().map(|(field, value)| (field, Bytes::from(value))).collect())
        })
    }

    fn scan_keys<'a>(&'a self, pattern: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, page): (u64, Vec<String>) = self
                    .run("SCAN", |mut conn| async move {
                        redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(pattern)
                            .arg("COUNT")
                            .arg(SCAN_PAGE_SIZE)
                            .query_async(&mut conn)
                            .await
                    })
                    .await?;
                keys.extend(page);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(keys)
        })
    }
}
