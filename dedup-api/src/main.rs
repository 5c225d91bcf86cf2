use std::sync::Arc;
use std::time::Duration;

use dedup_common::metrics::{serve, setup_metrics_routes};
use dedup_common::store::{MemoryRecordStore, PgRecordStore, RecordStore};
use dedup_engine::cache::QueryCache;
use dedup_engine::DuplicateDetectionEngine;
use envconfig::Envconfig;
use eyre::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use config::Config;

mod api;
mod config;
mod handlers;

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

/// Sweep expired cache entries so idle ids do not sit in memory until the next insert.
async fn cache_cleanup_loop(cache: Arc<QueryCache>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let removed = cache.cleanup();
        debug!(removed, remaining = cache.len(), "query cache sweep");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env()?;

    let store: Arc<dyn RecordStore> = if config.in_memory_store {
        warn!("serving from an empty in-memory record store");
        Arc::new(MemoryRecordStore::new())
    } else {
        Arc::new(
            PgRecordStore::new(
                &config.database_url,
                config.records_table.as_str(),
                config.max_pg_connections,
                config.query_timeout.0,
            )
            .await?,
        )
    };

    let cache = Arc::new(QueryCache::from_config(&config.engine));
    let sweep_interval = config.engine.cache_ttl.0.max(Duration::from_secs(1));
    tokio::spawn(cache_cleanup_loop(cache.clone(), sweep_interval));

    let engine = Arc::new(DuplicateDetectionEngine::new(
        config.engine.clone(),
        store,
        cache,
    ));

    let app = handlers::app(engine, config.max_body_size);
    let app = if config.export_prometheus {
        setup_metrics_routes(app)?
    } else {
        app
    };

    let bind = config.bind();
    info!(bind = %bind, table = config.records_table.as_str(), "starting dedup api");
    serve(app, &bind).await?;

    Ok(())
}
