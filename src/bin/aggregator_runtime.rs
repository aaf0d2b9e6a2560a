//! Aggregator Runtime
//!
//! Wires the aggregation pipeline against a SQLite database:
//! - Runs schema migrations
//! - Starts the consumer thread and the snapshot writer task
//! - Spawns the live poller, the totals tick and the resync scheduler
//!
//! Usage:
//!   cargo run --release --bin aggregator_runtime
//!
//! Environment variables:
//!   TXAGG_DB_PATH - SQLite database path (default: txagg.db)
//!   TXAGG_SCHEMA_DIR - Migration directory (default: sql)
//!   TXAGG_POLL_INTERVAL_MS - Live polling period (default: 5000)
//!   TXAGG_TICK_INTERVAL_MS - Lifetime totals flush period (default: 5000)
//!   TXAGG_RESYNC_ENABLED - Resync scheduler switch (default: true)

use dotenv::dotenv;
use log::{error, info, warn};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use txagg::aggregation::{
    baseline::BaselineCache,
    config::AggregationConfig,
    context::{AggregationContext, AggregationRules, EngineStatus},
    db::{run_schema_migrations, SqliteAggregateStore, WatermarkStore},
    dispatcher::{spawn_consumer, Dispatcher},
    engine::AggregationEngine,
    oracle::{BalanceOracle, NoopBalanceOracle, RestBalanceOracle},
    registry::CachedContractRegistry,
    resync::ResyncCoordinator,
    sink::{channel_sink, run_snapshot_writer},
    source::{run_tick_producer, LiveGate, LivePoller, RateLimiter},
};

const REGISTRY_TTL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    info!("🚀 Aggregator Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match AggregationConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ {}", e);
            return Err(e.into());
        }
    };

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Queue capacity: {} events", config.queue_capacity);
    info!("   ├─ Poll interval: {}ms", config.poll_interval_ms);
    info!("   ├─ Tick interval: {}ms", config.tick_interval_ms);
    info!("   ├─ Block batch: {}", config.block_batch_size);
    info!("   ├─ Rate limit: {}/s", config.rate_limit);
    info!("   ├─ Lifetime date id: {}", config.total_date_id);
    info!(
        "   └─ Resync: {} (every {}s, ack timeout {}s)",
        if config.resync_enabled { "enabled" } else { "disabled" },
        config.resync_interval.as_secs(),
        config.resync_timeout.as_secs()
    );

    info!("🔧 Initializing database...");
    let mut conn = Connection::open(&config.db_path)?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;
    drop(conn);

    let store = Arc::new(SqliteAggregateStore::open(&config.db_path)?);
    let watermark = store.load_watermark()?;
    info!("✅ Database initialized (watermark: block {})", watermark);

    let oracle: Arc<dyn BalanceOracle> = match (&config.node_url, config.native_activation_block) {
        (Some(url), block) if block > 0 => {
            info!("🔧 Balance oracle: {} (from block {})", url, block);
            Arc::new(RestBalanceOracle::new(url.clone()))
        }
        _ => Arc::new(NoopBalanceOracle),
    };

    let status = EngineStatus::new();
    let context = AggregationContext::new(
        AggregationRules::from_config(&config),
        status.clone(),
        watermark,
    );
    let registry = Arc::new(CachedContractRegistry::new(
        config.native_contracts.clone(),
        store.clone(),
        REGISTRY_TTL,
    ));
    let baseline = BaselineCache::new(store.clone(), config.baseline_capacity, config.baseline_ttl);
    let (sink, sink_rx) = channel_sink();
    let engine = AggregationEngine::new(
        context,
        registry,
        oracle,
        baseline,
        store.clone(),
        Box::new(sink),
    );

    let (dispatcher, rx) = Dispatcher::channel(config.queue_capacity);
    let writer = tokio::spawn(run_snapshot_writer(
        sink_rx,
        store.clone(),
        dispatcher.downgrade(),
    ));
    let consumer = spawn_consumer(rx, engine)?;
    info!("✅ Consumer thread and snapshot writer running");

    info!("🚀 Spawning producers...");
    let gate = LiveGate::new();
    let mut producers = Vec::new();

    let poller = LivePoller::new(
        dispatcher.clone(),
        store.clone(),
        store.clone(),
        gate.clone(),
        status.clone(),
        RateLimiter::per_second(config.rate_limit),
        config.block_batch_size,
        watermark,
    );
    producers.push(tokio::spawn(
        poller.run(Duration::from_millis(config.poll_interval_ms)),
    ));
    info!("   ├─ ✅ Live poller spawned");

    producers.push(tokio::spawn(run_tick_producer(
        dispatcher.clone(),
        gate.clone(),
        status.clone(),
        Duration::from_millis(config.tick_interval_ms),
    )));
    info!("   ├─ ✅ Totals tick spawned");

    if config.resync_enabled {
        let coordinator = ResyncCoordinator::new(
            dispatcher.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            gate.clone(),
            status.clone(),
            RateLimiter::per_second(config.rate_limit),
            config.block_batch_size,
            config.resync_timeout,
        )
        .with_total_date_id(config.total_date_id);
        producers.push(tokio::spawn(coordinator.run(config.resync_interval)));
        info!("   └─ ✅ Resync scheduler spawned");
    } else {
        info!("   └─ ⚠️  Resync scheduler disabled");
    }

    info!("🔄 Press CTRL+C to shutdown gracefully");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    // Producers hold the remaining dispatcher clones
    for producer in producers {
        producer.abort();
    }
    drop(dispatcher);

    match tokio::task::spawn_blocking(move || consumer.join()).await {
        Ok(Ok(engine)) => {
            info!(
                "📊 {} transactions aggregated, last block {}",
                engine.aggregated(),
                engine.status().last_block_height()
            );
            // Dropping the engine closes the sink and lets the writer finish
            drop(engine);
        }
        Ok(Err(_)) => error!("❌ Consumer thread panicked"),
        Err(e) => error!("❌ Failed to join consumer thread: {}", e),
    }

    if let Err(e) = writer.await {
        warn!("⚠️  Snapshot writer ended abnormally: {}", e);
    }

    info!("✅ Aggregator runtime stopped");
    Ok(())
}
