//! Pulse consumer worker.
//!
//! Loads configuration from the environment, registers the event schemas,
//! and runs idempotent consumers on the configured bus until ctrl-c.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use pulse_events::{Delivery, EventBus, EventHandler, HandlerError, SchemaRegistry, handler_fn};
use pulse_infra::{
    IdempotencyLedger, InMemoryLedger, PostgresLedger, PulseConfig, build_bus, idempotent,
};

#[derive(Debug, Deserialize)]
struct EmployeeCreated {
    employee_id: String,
    email: String,
    first_name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PulseConfig::from_env().context("invalid configuration")?;
    pulse_observability::init_with(config.log_format);

    let registry = Arc::new(SchemaRegistry::new());
    let loaded = registry
        .load_dir(&config.schema_dir)
        .with_context(|| format!("loading schemas from {}", config.schema_dir.display()))?;
    tracing::info!(schemas = loaded, dir = %config.schema_dir.display(), "schemas registered");

    let ledger = open_ledger(&config).await?;
    tracing::info!(ledger = ledger.backend(), "idempotency ledger ready");

    let bus = build_bus(&config).context("building event bus")?;
    bus.start().await.context("starting event bus")?;

    let topics: BTreeSet<String> = registry.keys().into_iter().map(|k| k.event_type).collect();
    for topic in &topics {
        bus.register_consumer(topic, idempotent(audit_trail(topic), ledger.clone()))
            .await
            .with_context(|| format!("registering audit-trail on {topic}"))?;
    }
    if topics.contains("employee.created") {
        bus.register_consumer("employee.created", idempotent(welcome_mailer(), ledger.clone()))
            .await
            .context("registering welcome-mailer")?;
    }

    tracing::info!(topics = topics.len(), health = ?bus.health().await, "worker running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    bus.close().await.context("closing event bus")?;
    Ok(())
}

async fn open_ledger(config: &PulseConfig) -> anyhow::Result<Arc<dyn IdempotencyLedger>> {
    match &config.database_url {
        Some(url) => {
            let ledger = PostgresLedger::connect(url)
                .await
                .context("connecting to the ledger database")?;
            ledger.migrate().await.context("migrating the ledger table")?;
            Ok(Arc::new(ledger))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; idempotency ledger is process-local");
            Ok(Arc::new(InMemoryLedger::new()))
        }
    }
}

/// One audit consumer per topic, so each topic deduplicates in its own
/// ledger namespace.
fn audit_trail(topic: &str) -> Arc<dyn EventHandler> {
    handler_fn(format!("audit-trail:{topic}"), |delivery: Delivery| async move {
        let envelope = delivery.envelope();
        tracing::info!(
            topic = %delivery.topic,
            event_id = %envelope.id(),
            tenant_id = %envelope.tenant_id(),
            version = envelope.version(),
            source = envelope.source(),
            "event received"
        );
        Ok::<(), HandlerError>(())
    })
}

fn welcome_mailer() -> Arc<dyn EventHandler> {
    handler_fn("welcome-mailer", |delivery: Delivery| async move {
        let employee = delivery
            .envelope()
            .decode::<EmployeeCreated>()
            .map_err(HandlerError::Terminal)?;
        let hire = employee.payload();
        tracing::info!(
            employee_id = %hire.employee_id,
            to = %hire.email,
            "sending welcome mail to {}",
            hire.first_name
        );
        Ok::<(), HandlerError>(())
    })
}
