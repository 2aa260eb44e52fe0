//! In-memory event bus for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::{
    BusError, BusHealth, BusResult, ConsumerRunner, ConsumerStats, ConsumerStatsSnapshot,
    DeadLetter, DeadLetterQueue, Delivery, DeliveryOutcome, DeliveryPolicy, DeliverySource,
    EventBus, EventEnvelope, EventHandler,
};

type SharedEnvelope = Arc<EventEnvelope<JsonValue>>;

/// Append-only log for one topic. The watch channel carries the log length
/// so idle consumers can wait for appends.
#[derive(Debug)]
struct TopicLog {
    entries: RwLock<Vec<SharedEnvelope>>,
    len_tx: watch::Sender<usize>,
}

impl TopicLog {
    fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            entries: RwLock::new(Vec::new()),
            len_tx,
        }
    }

    fn append(&self, envelope: SharedEnvelope) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push(envelope);
        // Sent under the write lock so the observed length never goes back.
        self.len_tx.send_replace(entries.len());
    }

    fn get(&self, index: usize) -> Option<SharedEnvelope> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Cursor of one consumer over one topic log.
struct LogCursor {
    topic: String,
    consumer: String,
    log: Arc<TopicLog>,
    position: usize,
    appended: watch::Receiver<usize>,
    dead_letters: Arc<DeadLetterQueue>,
}

#[async_trait]
impl DeliverySource for LogCursor {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if let Some(envelope) = self.log.get(self.position) {
                self.position += 1;
                return Some(Delivery::new(self.topic.clone(), envelope));
            }
            if self.appended.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn settle(&mut self, delivery: &Delivery, outcome: &DeliveryOutcome) {
        if let DeliveryOutcome::DeadLettered { attempts, reason } = outcome {
            self.dead_letters.push(DeadLetter::new(
                self.consumer.clone(),
                self.topic.clone(),
                delivery.envelope().clone(),
                *attempts,
                reason.clone(),
            ));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Closed,
}

/// In-process bus.
///
/// - Per-topic append-only log; nothing is ever evicted
/// - One sequential worker per (topic, consumer); a consumer registered late
///   replays the topic from the first entry
/// - Dead letters are kept in memory and exposed through [`dead_letters`](Self::dead_letters)
///
/// Registering a consumer before `start` is allowed; its worker begins once
/// the bus starts. Publishing before `start` is also allowed (entries wait in
/// the log).
pub struct InMemoryBus {
    topics: RwLock<HashMap<String, Arc<TopicLog>>>,
    policy: DeliveryPolicy,
    state: Mutex<BusState>,
    shutdown: watch::Sender<bool>,
    dead_letters: Arc<DeadLetterQueue>,
}

struct BusState {
    lifecycle: Lifecycle,
    consumers: Vec<ConsumerSlot>,
}

struct ConsumerSlot {
    topic: String,
    handler: Arc<dyn EventHandler>,
    stats: Arc<ConsumerStats>,
    task: Option<JoinHandle<()>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DeliveryPolicy::default())
    }
}

impl InMemoryBus {
    pub fn new(policy: DeliveryPolicy) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            topics: RwLock::new(HashMap::new()),
            policy,
            state: Mutex::new(BusState {
                lifecycle: Lifecycle::Created,
                consumers: Vec::new(),
            }),
            shutdown,
            dead_letters: Arc::new(DeadLetterQueue::new()),
        }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Number of envelopes accepted on `topic`.
    pub fn published_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, |log| log.len())
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Delivery counters for `consumer` on `topic`.
    pub fn consumer_stats(&self, topic: &str, consumer: &str) -> Option<ConsumerStatsSnapshot> {
        self.lock_state()
            .consumers
            .iter()
            .find(|c| c.topic == topic && c.handler.name() == consumer)
            .map(|c| c.stats.snapshot())
    }

    fn topic(&self, topic: &str) -> Arc<TopicLog> {
        if let Some(log) = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
        {
            return log.clone();
        }
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new()))
            .clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(&self, slot: &mut ConsumerSlot) {
        let log = self.topic(&slot.topic);
        let source = LogCursor {
            topic: slot.topic.clone(),
            consumer: slot.handler.name().to_string(),
            appended: log.len_tx.subscribe(),
            log,
            position: 0,
            dead_letters: self.dead_letters.clone(),
        };
        let runner = ConsumerRunner::new(
            slot.topic.clone(),
            slot.handler.clone(),
            self.policy.clone(),
            slot.stats.clone(),
        );
        slot.task = Some(runner.spawn(source, self.shutdown.subscribe()));
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn start(&self) -> BusResult<()> {
        let mut state = self.lock_state();
        match state.lifecycle {
            Lifecycle::Started => return Ok(()),
            Lifecycle::Closed => return Err(BusError::Closed),
            Lifecycle::Created => {}
        }
        state.lifecycle = Lifecycle::Started;
        for slot in state.consumers.iter_mut() {
            self.spawn_worker(slot);
        }
        info!(backend = "memory", consumers = state.consumers.len(), "bus started");
        Ok(())
    }

    #[instrument(
        skip(self, envelope),
        fields(
            event_id = %envelope.id(),
            tenant_id = %envelope.tenant_id(),
        ),
        err
    )]
    async fn publish(&self, topic: &str, envelope: &EventEnvelope<JsonValue>) -> BusResult<()> {
        if self.lock_state().lifecycle == Lifecycle::Closed {
            return Err(BusError::Closed);
        }
        self.topic(topic).append(Arc::new(envelope.clone()));
        debug!("event appended");
        Ok(())
    }

    async fn register_consumer(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<()> {
        let mut state = self.lock_state();
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
        if state.lifecycle == Lifecycle::Started {
            self.spawn_worker(&mut slot);
        }
        info!(topic, consumer = slot.handler.name(), "consumer registered");
        state.consumers.push(slot);
        Ok(())
    }

    async fn health(&self) -> BusHealth {
        let state = self.lock_state();
        let topics = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let detail = format!(
            "{topics} topics, {} consumers, {} dead letters",
            state.consumers.len(),
            self.dead_letters.len()
        );
        match state.lifecycle {
            Lifecycle::Started => BusHealth::healthy("memory").with_detail(detail),
            Lifecycle::Created => BusHealth::unhealthy("memory", "not started"),
            Lifecycle::Closed => BusHealth::unhealthy("memory", "closed"),
        }
    }

    async fn close(&self) -> BusResult<()> {
        let tasks: Vec<JoinHandle<()>> = {
            let mut state = self.lock_state();
            if state.lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            state.lifecycle = Lifecycle::Closed;
            state
                .consumers
                .iter_mut()
                .filter_map(|c| c.task.take())
                .collect()
        };

        self.shutdown.send_replace(true);
        for task in tasks {
            // A panicking handler already logged; closing still succeeds.
            let _ = task.await;
        }
        info!(backend = "memory", "bus closed");
        Ok(())
    }
}

impl Drop for InMemoryBus {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HandlerError, RetryPolicy, handler_fn};
    use pulse_core::{AppError, ErrorCode, TenantId};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn envelope(n: u32) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            "employee.created",
            1,
            "directory",
            TenantId::parse("t1").unwrap(),
            json!({ "n": n }),
        )
    }

    fn fast_bus(max_attempts: u32) -> InMemoryBus {
        InMemoryBus::new(DeliveryPolicy::new(
            RetryPolicy::fixed(max_attempts, Duration::from_millis(1)),
            Duration::from_millis(200),
        ))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn recorder(name: &str) -> (Arc<dyn EventHandler>, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn(name, move |d: Delivery| {
            let sink = sink.clone();
            async move {
                let n = d.envelope.payload()["n"].as_u64().unwrap_or_default();
                sink.lock().unwrap().push(n);
                Ok::<(), HandlerError>(())
            }
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn delivers_in_publish_order_per_consumer() {
        let bus = fast_bus(3);
        bus.start().await.unwrap();
        let (a, seen_a) = recorder("a");
        let (b, seen_b) = recorder("b");
        bus.register_consumer("employee.created", a).await.unwrap();
        bus.register_consumer("employee.created", b).await.unwrap();

        for n in 0..20 {
            bus.publish("employee.created", &envelope(n)).await.unwrap();
        }

        eventually(|| seen_a.lock().unwrap().len() == 20 && seen_b.lock().unwrap().len() == 20)
            .await;
        let expected: Vec<u64> = (0..20).collect();
        assert_eq!(*seen_a.lock().unwrap(), expected);
        assert_eq!(*seen_b.lock().unwrap(), expected);
        assert_eq!(bus.published_count("employee.created"), 20);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn late_consumers_replay_the_topic() {
        let bus = fast_bus(3);
        bus.start().await.unwrap();
        for n in 0..3 {
            bus.publish("employee.created", &envelope(n)).await.unwrap();
        }

        let (late, seen) = recorder("late");
        bus.register_consumer("employee.created", late).await.unwrap();

        eventually(|| seen.lock().unwrap().len() == 3).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn consumers_registered_before_start_begin_on_start() {
        let bus = fast_bus(3);
        let (early, seen) = recorder("early");
        bus.register_consumer("employee.created", early).await.unwrap();
        bus.publish("employee.created", &envelope(7)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().is_empty());

        bus.start().await.unwrap();
        eventually(|| seen.lock().unwrap().len() == 1).await;
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_land_in_the_dead_letter_list() {
        let bus = fast_bus(3);
        bus.start().await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = handler_fn("broken", move |_d: Delivery| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(HandlerError::from(AppError::new(
                    ErrorCode::LedgerUnavailable,
                    "down",
                )))
            }
        });
        bus.register_consumer("employee.created", handler).await.unwrap();
        bus.publish("employee.created", &envelope(1)).await.unwrap();

        eventually(|| bus.dead_letters().len() == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let letter = &bus.dead_letters().entries()[0];
        assert_eq!(letter.consumer, "broken");
        assert_eq!(letter.attempts, 3);
        assert_eq!(
            bus.consumer_stats("employee.created", "broken"),
            Some(ConsumerStatsSnapshot {
                acked: 0,
                redelivered: 2,
                dead_lettered: 1
            })
        );
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_consumer_names_are_rejected() {
        let bus = fast_bus(1);
        let (a, _) = recorder("same");
        let (b, _) = recorder("same");
        bus.register_consumer("employee.created", a).await.unwrap();
        let err = bus.register_consumer("employee.created", b).await.unwrap_err();
        assert!(matches!(err, BusError::Register { .. }));

        let (c, _) = recorder("same");
        bus.register_consumer("leave.requested", c).await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_rules() {
        let bus = fast_bus(1);
        assert!(!bus.health().await.healthy);

        // close before start, twice
        bus.close().await.unwrap();
        bus.close().await.unwrap();

        let err = bus.publish("employee.created", &envelope(1)).await.unwrap_err();
        assert!(matches!(err, BusError::Closed));
        assert!(matches!(bus.start().await, Err(BusError::Closed)));
        assert_eq!(bus.health().await.detail.as_deref(), Some("closed"));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_reports_health() {
        let bus = fast_bus(1);
        bus.start().await.unwrap();
        bus.start().await.unwrap();

        let health = bus.health().await;
        assert!(health.healthy);
        assert_eq!(health.backend, "memory");
        bus.close().await.unwrap();
    }
}
