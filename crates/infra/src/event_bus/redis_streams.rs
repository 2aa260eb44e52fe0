//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream per topic**: `<prefix>:<topic>` (default prefix `pulse:events`)
//! - **Consumer group per handler**: group name = handler name, created at
//!   the start of the stream (`0`) so a new consumer replays history
//! - **Dead-letter stream per topic**: `<prefix>:<topic>:dlq`
//!
//! ## Delivery
//!
//! Each worker first drains its own pending entries (delivered before a
//! crash, never acknowledged), then reads new ones with `XREADGROUP ... >`.
//! An entry is `XACK`ed after the handler succeeds or after it has been
//! copied to the dead-letter stream. Redelivery attempts are counted per
//! process lifetime.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use pulse_events::{
    BusError, BusHealth, BusResult, ConsumerRunner, ConsumerStats, Delivery, DeliveryOutcome,
    DeliveryPolicy, DeliverySource, EventBus, EventEnvelope, EventHandler,
};

const ENVELOPE_FIELD: &str = "envelope";
const READ_BATCH: usize = 10;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Closed,
}

struct ConsumerSlot {
    topic: String,
    handler: Arc<dyn EventHandler>,
    stats: Arc<ConsumerStats>,
    task: Option<JoinHandle<()>>,
}

struct State {
    lifecycle: Lifecycle,
    conn: Option<MultiplexedConnection>,
    consumers: Vec<ConsumerSlot>,
}

pub struct RedisStreamsBus {
    client: redis::Client,
    prefix: String,
    instance: String,
    policy: DeliveryPolicy,
    poll_interval: Duration,
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
}

impl RedisStreamsBus {
    /// Create a bus for `redis_url`. Nothing is contacted until `start`.
    pub fn new(
        redis_url: impl AsRef<str>,
        prefix: impl Into<String>,
        policy: DeliveryPolicy,
    ) -> BusResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BusError::Startup(format!("invalid redis url: {e}")))?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            prefix: prefix.into(),
            instance: "0".to_string(),
            policy,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: Mutex::new(State {
                lifecycle: Lifecycle::Created,
                conn: None,
                consumers: Vec::new(),
            }),
            shutdown,
        })
    }

    /// Distinguish replicas of the same consumer inside its group.
    ///
    /// Must be stable across restarts of one replica, otherwise its pending
    /// entries are never re-read.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.prefix, topic)
    }

    pub fn dlq_key(&self, topic: &str) -> String {
        format!("{}:{}:dlq", self.prefix, topic)
    }

    /// Create the consumer group if it does not exist.
    async fn ensure_group(
        conn: &mut MultiplexedConnection,
        stream_key: &str,
        group: &str,
    ) -> BusResult<()> {
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream_key, group, "0").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BusError::Register {
                topic: stream_key.to_string(),
                consumer: group.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn spawn_worker(
        &self,
        conn: &MultiplexedConnection,
        slot: &mut ConsumerSlot,
    ) -> BusResult<()> {
        let stream_key = self.stream_key(&slot.topic);
        let group = slot.handler.name().to_string();
        let mut conn = conn.clone();
        Self::ensure_group(&mut conn, &stream_key, &group).await?;

        let source = StreamCursor {
            conn,
            topic: slot.topic.clone(),
            consumer_name: format!("{group}:{}", self.instance),
            group,
            dlq_key: self.dlq_key(&slot.topic),
            stream_key,
            poll_interval: self.poll_interval,
            buffered: VecDeque::new(),
            backlog_drained: false,
            in_flight: None,
        };
        let runner = ConsumerRunner::new(
            slot.topic.clone(),
            slot.handler.clone(),
            self.policy.clone(),
            slot.stats.clone(),
        );
        slot.task = Some(runner.spawn(source, self.shutdown.subscribe()));
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisStreamsBus {
    async fn start(&self) -> BusResult<()> {
        let mut state = self.state.lock().await;
        match state.lifecycle {
            Lifecycle::Started => return Ok(()),
            Lifecycle::Closed => return Err(BusError::Closed),
            Lifecycle::Created => {}
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Startup(format!("redis connection failed: {e}")))?;

        for slot in state.consumers.iter_mut() {
            self.spawn_worker(&conn, slot)
                .await
                .map_err(|e| BusError::Startup(e.to_string()))?;
        }
        state.conn = Some(conn);
        state.lifecycle = Lifecycle::Started;
        info!(backend = "redis", prefix = %self.prefix, "bus started");
        Ok(())
    }

    #[instrument(
        skip(self, envelope),
        fields(event_id = %envelope.id(), tenant_id = %envelope.tenant_id()),
        err
    )]
    async fn publish(&self, topic: &str, envelope: &EventEnvelope<JsonValue>) -> BusResult<()> {
        let mut conn = {
            let state = self.state.lock().await;
            match (state.lifecycle, &state.conn) {
                (Lifecycle::Closed, _) => return Err(BusError::Closed),
                (_, Some(conn)) => conn.clone(),
                (_, None) => {
                    return Err(BusError::Publish {
                        topic: topic.to_string(),
                        reason: "bus not started".into(),
                    });
                }
            }
        };

        let payload =
            serde_json::to_string(envelope).map_err(|e| BusError::Serialization(e.to_string()))?;
        let fields = [
            ("event_id", envelope.id().to_string()),
            ("tenant_id", envelope.tenant_id().to_string()),
            (ENVELOPE_FIELD, payload),
        ];
        let entry_id: String = conn
            .xadd(self.stream_key(topic), "*", &fields)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: format!("XADD failed: {e}"),
            })?;
        debug!(entry_id = %entry_id, "event appended to stream");
        Ok(())
    }

    async fn register_consumer(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<()> {
        let mut state = self.state.lock().await;
        if state.lifecycle == Lifecycle::Closed {
            return Err(BusError::Closed);
        }
        if state
            .consumers
            .iter()
            .any(|c| c.topic == topic && c.handler.name() == handler.name())
        {
            return Err(BusError::Register {
                topic: topic.to_string(),
                consumer: handler.name().to_string(),
                reason: "a consumer with this name is already registered".into(),
            });
        }

        let mut slot = ConsumerSlot {
            topic: topic.to_string(),
            handler,
            stats: Arc::new(ConsumerStats::default()),
            task: None,
        };
        if let Some(conn) = state.conn.clone() {
            self.spawn_worker(&conn, &mut slot).await?;
        }
        info!(topic, consumer = slot.handler.name(), "consumer registered");
        state.consumers.push(slot);
        Ok(())
    }

    async fn health(&self) -> BusHealth {
        let (lifecycle, conn, consumers) = {
            let state = self.state.lock().await;
            (state.lifecycle, state.conn.clone(), state.consumers.len())
        };
        match (lifecycle, conn) {
            (Lifecycle::Closed, _) => BusHealth::unhealthy("redis", "closed"),
            (_, None) => BusHealth::unhealthy("redis", "not started"),
            (_, Some(mut conn)) => {
                let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
                match pong {
                    Ok(_) => BusHealth::healthy("redis")
                        .with_detail(format!("{consumers} consumers")),
                    Err(e) => BusHealth::unhealthy("redis", format!("PING failed: {e}")),
                }
            }
        }
    }

    async fn close(&self) -> BusResult<()> {
        let tasks: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock().await;
            if state.lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            state.lifecycle = Lifecycle::Closed;
            state.conn = None;
            state
                .consumers
                .iter_mut()
                .filter_map(|c| c.task.take())
                .collect()
        };

        self.shutdown.send_replace(true);
        for task in tasks {
            let _ = task.await;
        }
        info!(backend = "redis", "bus closed");
        Ok(())
    }
}

/// One consumer's read position in one stream.
struct StreamCursor {
    conn: MultiplexedConnection,
    topic: String,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer_name: String,
    poll_interval: Duration,
    buffered: VecDeque<(String, Delivery)>,
    /// Own pending entries are read first (`0`), new ones after (`>`).
    backlog_drained: bool,
    in_flight: Option<String>,
}

impl StreamCursor {
    async fn read(&mut self, start: &str) -> redis::RedisResult<Vec<StreamId>> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer_name)
            .count(READ_BATCH);
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream_key], &[start], &options)
            .await?;
        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    async fn ack(&mut self, entry_id: &str) {
        let acked: redis::RedisResult<i64> = self
            .conn
            .xack(&self.stream_key, &self.group, &[entry_id])
            .await;
        if let Err(e) = acked {
            error!(entry_id, error = %e, "XACK failed; entry stays pending");
        }
    }

    async fn dead_letter(&mut self, entry_id: &str, raw: &str, attempts: u32, reason: &str) {
        let fields = [
            ("original_entry_id", entry_id.to_string()),
            ("consumer", self.group.clone()),
            ("attempts", attempts.to_string()),
            ("reason", reason.to_string()),
            ("failed_at", Utc::now().to_rfc3339()),
            (ENVELOPE_FIELD, raw.to_string()),
        ];
        let added: redis::RedisResult<String> = self.conn.xadd(&self.dlq_key, "*", &fields).await;
        match added {
            Ok(_) => warn!(
                entry_id,
                consumer = %self.group,
                attempts,
                reason,
                "message sent to dead-letter stream"
            ),
            Err(e) => error!(entry_id, error = %e, "dead-letter XADD failed"),
        }
    }

    /// Buffer decodable entries; undecodable ones go straight to the DLQ.
    async fn accept(&mut self, entries: Vec<StreamId>) {
        for entry in entries {
            let raw: Option<String> = entry.get(ENVELOPE_FIELD);
            let decoded = raw
                .as_deref()
                .map(serde_json::from_str::<EventEnvelope<JsonValue>>);
            match (raw.as_deref(), decoded) {
                (Some(_), Some(Ok(envelope))) => {
                    let delivery = Delivery::new(self.topic.clone(), Arc::new(envelope));
                    self.buffered.push_back((entry.id, delivery));
                }
                (Some(raw), Some(Err(e))) => {
                    let reason = format!("undecodable envelope: {e}");
                    self.dead_letter(&entry.id, raw, 0, &reason).await;
                    self.ack(&entry.id).await;
                }
                _ => {
                    // Trimmed/deleted entry: nothing left to deliver.
                    self.ack(&entry.id).await;
                }
            }
        }
    }
}

#[async_trait]
impl DeliverySource for StreamCursor {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if let Some((entry_id, delivery)) = self.buffered.pop_front() {
                self.in_flight = Some(entry_id);
                return Some(delivery);
            }

            let start = if self.backlog_drained { ">" } else { "0" };
            match self.read(start).await {
                Ok(entries) if entries.is_empty() => {
                    if self.backlog_drained {
                        tokio::time::sleep(self.poll_interval).await;
                    } else {
                        self.backlog_drained = true;
                    }
                }
                Ok(entries) => self.accept(entries).await,
                Err(e) => {
                    warn!(stream = %self.stream_key, group = %self.group, error = %e, "XREADGROUP failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn settle(&mut self, delivery: &Delivery, outcome: &DeliveryOutcome) {
        let Some(entry_id) = self.in_flight.take() else {
            return;
        };
        if let DeliveryOutcome::DeadLettered { attempts, reason } = outcome {
            match serde_json::to_string(delivery.envelope()) {
                Ok(raw) => self.dead_letter(&entry_id, &raw, *attempts, reason).await,
                Err(e) => error!(entry_id, error = %e, "cannot encode dead letter"),
            }
        }
        self.ack(&entry_id).await;
    }
}
