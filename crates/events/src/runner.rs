//! Consumer task lifecycle.
//!
//! Every (topic, consumer) pair is served by one background task that pulls
//! deliveries from a backend-specific [`DeliverySource`], drives each one
//! through [`deliver`] and hands the outcome back to the source for
//! acknowledgement or dead-lettering. Deliveries are processed strictly one
//! at a time, which is what gives per-topic ordering for each consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::{Delivery, DeliveryOutcome, DeliveryPolicy, EventHandler, deliver};

/// Backend side of a consumer loop.
#[async_trait]
pub trait DeliverySource: Send {
    /// Wait for the next delivery. `None` ends the loop.
    async fn next(&mut self) -> Option<Delivery>;

    /// Record the final outcome (ack, or ack + dead-letter).
    async fn settle(&mut self, delivery: &Delivery, outcome: &DeliveryOutcome);
}

/// Per-consumer delivery counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub acked: u64,
    /// Extra attempts beyond the first, across all deliveries.
    pub redelivered: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    pub fn record(&self, outcome: &DeliveryOutcome) {
        let extra = u64::from(outcome.attempts().saturating_sub(1));
        self.redelivered.fetch_add(extra, Ordering::Relaxed);
        match outcome {
            DeliveryOutcome::Acked { .. } => self.acked.fetch_add(1, Ordering::Relaxed),
            DeliveryOutcome::DeadLettered { .. } => {
                self.dead_lettered.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            acked: self.acked.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Drives one consumer until its source ends or shutdown is signalled.
pub struct ConsumerRunner {
    topic: String,
    handler: Arc<dyn EventHandler>,
    policy: DeliveryPolicy,
    stats: Arc<ConsumerStats>,
}

impl ConsumerRunner {
    pub fn new(
        topic: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        policy: DeliveryPolicy,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            topic: topic.into(),
            handler,
            policy,
            stats,
        }
    }

    pub fn spawn<S>(self, source: S, shutdown: watch::Receiver<bool>) -> JoinHandle<()>
    where
        S: DeliverySource + 'static,
    {
        tokio::spawn(self.run(source, shutdown))
    }

    #[instrument(skip_all, fields(topic = %self.topic, consumer = self.handler.name()))]
    pub async fn run<S>(self, mut source: S, mut shutdown: watch::Receiver<bool>)
    where
        S: DeliverySource,
    {
        info!("consumer started");
        loop {
            let delivery = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                next = source.next() => match next {
                    Some(d) => d,
                    None => break,
                },
            };

            // An in-flight delivery abandoned at shutdown is not settled; the
            // backend decides whether it is redelivered later.
            let outcome = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                outcome = deliver(self.handler.as_ref(), delivery.clone(), &self.policy) => outcome,
            };

            self.stats.record(&outcome);
            source.settle(&delivery, &outcome).await;
        }
        info!("consumer stopped");
    }
}

/// Resolves once the flag is `true` or its sender is gone.
pub async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
