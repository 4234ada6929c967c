use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{Config, HashMode};
use crate::consent::CookieSettings;
use crate::enrichment::geoip::GeoIpClient;
use crate::enrichment::{Enricher, Geolocation};
use crate::identity::{DailySaltHasher, IdentityHasher, StaticSaltHasher};
use crate::limiters::RateLimiter;
use crate::pipeline::{log_failures, Pipeline};
use crate::processor::EventProcessor;
use crate::prometheus::setup_metrics_recorder;
use crate::router;
use crate::sinks::bigquery::BigQuerySink;
use crate::sinks::print::PrintSink;
use crate::sinks::EventSink;
use crate::stores::memory::MemoryStore;
use crate::stores::redis::RedisStore;
use crate::stores::{LocationCache, SaltStore};
use crate::time::SystemTime;

type Stores = (
    Arc<dyn SaltStore + Send + Sync>,
    Arc<dyn LocationCache + Send + Sync>,
);

async fn create_stores(config: &Config) -> anyhow::Result<Stores> {
    match &config.redis_url {
        Some(url) if !url.is_empty() => {
            let store = Arc::new(
                RedisStore::new(
                    url.clone(),
                    Some(Duration::from_millis(config.redis_response_timeout_ms)),
                )
                .await
                .context("failed to connect to redis")?,
            );
            let salts: Arc<dyn SaltStore + Send + Sync> = store.clone();
            Ok((salts, store))
        }
        _ => {
            warn!("no REDIS_URL configured, salts and locations are only kept in memory");
            let store = Arc::new(MemoryStore::new());
            let salts: Arc<dyn SaltStore + Send + Sync> = store.clone();
            Ok((salts, store))
        }
    }
}

fn create_sink(config: &Config) -> anyhow::Result<Arc<dyn EventSink + Send + Sync>> {
    if config.print_sink {
        // Print sink is only used for local debug
        return Ok(Arc::new(PrintSink {}));
    }

    if !config.warehouse.is_complete() {
        bail!("GCP_PROJECT_ID, GCP_DATASET_ID and GCP_TABLE_ID are required unless PRINT_SINK is set");
    }
    let sink = BigQuerySink::new(&config.warehouse).context("failed to create warehouse sink")?;
    Ok(Arc::new(sink))
}

fn create_geolocation(
    config: &Config,
    cache: Arc<dyn LocationCache + Send + Sync>,
) -> anyhow::Result<Geolocation> {
    let Some((account, key)) = config.geoip.credentials() else {
        warn!("no GeoIP credentials configured, geolocation disabled");
        return Ok(Geolocation::Disabled);
    };

    let client = GeoIpClient::new(&config.geoip.geo_host, account, key, config.geoip.timeout())
        .context("failed to create geoip client")?;
    Ok(Geolocation::Enabled { cache, client })
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let timesource = Arc::new(SystemTime {});
    let (salts, locations) = create_stores(&config).await?;

    let hasher: Arc<dyn IdentityHasher + Send + Sync> = match config.hash_mode {
        HashMode::Rotating => Arc::new(DailySaltHasher::new(salts, timesource.clone())),
        HashMode::Static => Arc::new(StaticSaltHasher::new(config.daily_salt.clone())),
    };

    let enricher = Enricher::new(create_geolocation(&config, locations)?);
    let sink = create_sink(&config)?;

    let (pipeline, failures, pipeline_handle) = Pipeline::start(
        enricher,
        sink,
        config.pipeline_queue_capacity,
        config.pipeline_concurrency,
    );
    tokio::spawn(log_failures(failures));

    let limiter = Arc::new(RateLimiter::new(
        time::Duration::milliseconds(config.rate_limit.rate_limit_window_ms as i64),
        config.rate_limit.rate_limit_max_requests,
        timesource.clone(),
    ));
    let cleanup = tokio::spawn(limiter.clone().run_cleanup());

    let processor = EventProcessor::new(
        hasher,
        CookieSettings {
            client_id_name: config.client_id_cookie_name.clone(),
            hash_name: config.hash_cookie_name.clone(),
            consent_name: config.consent_cookie_name.clone(),
            domain: config.cookie_domain.clone(),
        },
        pipeline,
        timesource,
    );

    // Don't install metrics unless asked to
    let metrics = if config.export_prometheus {
        Some(setup_metrics_recorder().context("failed to install metrics recorder")?)
    } else {
        None
    };

    let app = router::router(
        SystemTime {},
        processor,
        limiter,
        &config.service_name,
        &config.cors_origins(),
        metrics,
    );

    info!("listening on {:?}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error")?;

    cleanup.abort();

    // the router, and with it the last pipeline sender, is gone: let queued events finish
    let drain_timeout = Duration::from_millis(config.pipeline_drain_timeout_ms);
    match tokio::time::timeout(drain_timeout, pipeline_handle).await {
        Ok(Ok(())) => info!("pipeline drained"),
        Ok(Err(err)) => warn!("pipeline task failed: {}", err),
        Err(_) => warn!("pipeline did not drain within {:?}, dropping events", drain_timeout),
    }

    Ok(())
}
