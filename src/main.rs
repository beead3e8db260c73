use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use replica_sync::config::{Settings, StoreSettings};
use replica_sync::dlq::{DeadLetterSink, InMemoryDeadLetterSink, PostgresDeadLetterSink};
use replica_sync::gate::RateGate;
use replica_sync::health::{HealthMonitor, HealthRegistry};
use replica_sync::messaging::{connector_for, BrokerConnection, Connector, ConsumerRegistry, MessageHandler, Publisher};
use replica_sync::metrics::{self, Metrics};
use replica_sync::notify::{EmailSender, HttpEmailSender, LogEmailSender, NotificationDispatcher};
use replica_sync::outbox::{InMemoryOutboxStore, OutboxRelay, OutboxStore, PostgresOutboxStore};
use replica_sync::store::{InMemoryReplicaStore, PostgresReplicaStore, ReplicaStore};
use replica_sync::sync::{ApplyEngine, OrphanSweeper};
use replica_sync::topics::Topic;
use replica_sync::utils::Supervisor;

struct Stores {
    replicas: Arc<dyn ReplicaStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    outbox: Arc<dyn OutboxStore>,
}

async fn open_stores(settings: &StoreSettings) -> anyhow::Result<Stores> {
    let Some(url) = settings.database_url.as_deref() else {
        tracing::warn!("No database_url configured, using in-memory stores (state is lost on restart)");
        return Ok(Stores {
            replicas: Arc::new(InMemoryReplicaStore::new()),
            dead_letters: Arc::new(InMemoryDeadLetterSink::new(settings.dead_letter_capacity)),
            outbox: Arc::new(InMemoryOutboxStore::new()),
        });
    };

    tracing::info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;

    let replicas = PostgresReplicaStore::new(pool.clone());
    replicas.migrate().await?;
    let dead_letters = PostgresDeadLetterSink::new(pool.clone());
    dead_letters.migrate().await?;
    let outbox = PostgresOutboxStore::new(pool);
    outbox.migrate().await?;

    Ok(Stores {
        replicas: Arc::new(replicas),
        dead_letters: Arc::new(dead_letters),
        outbox: Arc::new(outbox),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,replica_sync=debug")))
        .init();

    let settings = Settings::load().context("failed to load configuration")?;
    let role = settings.service.role;
    tracing::info!(role = ?role, "🚀 Starting replica_sync");

    // === 1. Metrics and health endpoints ===
    let metrics = Arc::new(Metrics::new()?);
    let health = Arc::new(HealthRegistry::new());
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_health = health.clone();
    let metrics_port = settings.metrics.port;
    std::thread::spawn(move || match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(async {
            if let Err(e) = metrics::start_metrics_server(metrics_registry, metrics_health, metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }),
        Err(e) => tracing::error!("Failed to start metrics runtime: {}", e),
    });

    // === 2. Local stores ===
    let stores = open_stores(&settings.store).await?;

    // === 3. Broker connection, publisher and consumer registry ===
    let connector = connector_for(&settings.broker.url)?;
    tracing::info!(broker = %connector.describe(), "Using message broker");
    let connection = Arc::new(BrokerConnection::new(connector, settings.broker.connection()));

    let publisher = Arc::new(
        Publisher::new(
            connection.clone(),
            settings.broker.circuit_breaker(),
            settings.broker.operation_timeout(),
        )
        .with_metrics(metrics.clone()),
    );

    let registry = ConsumerRegistry::new(
        connection.clone(),
        stores.dead_letters.clone(),
        settings.consumer.to_config(&settings.broker),
    )
    .with_metrics(metrics.clone());

    // === 4. Handlers ===
    let mut tasks = Supervisor::new();

    let engine: Option<Arc<dyn MessageHandler>> = if role.replicates() {
        let sweeper = Arc::new(
            OrphanSweeper::new(
                stores.replicas.clone(),
                stores.dead_letters.clone(),
                settings.pending.sweep_interval(),
            )
            .with_metrics(metrics.clone()),
        );
        tasks.supervise("orphan_sweeper", move |shutdown| sweeper.clone().run(shutdown));

        let engine = ApplyEngine::new(stores.replicas.clone(), settings.pending.ttl()).with_metrics(metrics.clone());
        Some(Arc::new(engine))
    } else {
        None
    };

    let dispatcher: Option<Arc<dyn MessageHandler>> = if role.notifies() {
        let sender: Arc<dyn EmailSender> = match settings.notifications.relay_url.as_deref() {
            Some(url) => Arc::new(HttpEmailSender::new(
                url,
                settings.notifications.from.clone(),
                settings.notifications.timeout(),
            )?),
            None => {
                tracing::warn!("No mail relay configured, notification emails are only logged");
                Arc::new(LogEmailSender)
            }
        };
        let dispatcher = NotificationDispatcher::new(sender, settings.notifications.retry()).with_metrics(metrics.clone());
        Some(Arc::new(dispatcher))
    } else {
        None
    };

    for topic in role.topics() {
        let handler = if Topic::SELLER_DASHBOARD.contains(&topic) {
            engine.clone()
        } else {
            dispatcher.clone()
        };
        if let Some(handler) = handler {
            registry.subscribe(topic, handler)?;
        }
    }
    tracing::info!(queues = registry.subscribed_topics().len(), "✅ Consumers started");

    // === 5. Background tasks ===
    if settings.outbox.enabled {
        let relay = Arc::new(
            OutboxRelay::new(
                stores.outbox.clone(),
                publisher.clone(),
                stores.dead_letters.clone(),
                settings.outbox.relay(),
            )
            .with_metrics(metrics.clone()),
        );
        tasks.supervise("outbox_relay", move |shutdown| relay.clone().run(shutdown));
    }

    let gate = Arc::new(RateGate::new(settings.rate_gate.gate()).with_metrics(metrics.clone()));
    let gate_sweep = settings.rate_gate.sweep_interval();
    tasks.supervise("rate_gate_sweeper", move |shutdown| gate.clone().run_sweeper(gate_sweep, shutdown));

    let monitor = Arc::new(
        HealthMonitor::new(health.clone(), connection.clone())
            .with_publisher(publisher.clone())
            .with_metrics(metrics.clone())
            .with_interval(std::time::Duration::from_secs(settings.metrics.health_interval_secs.max(1))),
    );
    tasks.supervise("health_monitor", move |shutdown| monitor.clone().run(shutdown));
    tracing::info!(tasks = ?tasks.task_names(), "✅ Background tasks started");

    // === 6. Run until interrupted ===
    tracing::info!("Press Ctrl+C to stop...");
    tokio::signal::ctrl_c().await?;

    // Background loops publish through the connection the registry closes,
    // so they stop first.
    tracing::info!("🛑 Shutting down...");
    tasks.shutdown(settings.consumer.shutdown_grace()).await;
    registry.shutdown().await;
    tracing::info!("✅ Shutdown complete");

    Ok(())
}
