//! Epidash server.
//!
//! # API Endpoints
//!
//! - `GET /trend` - Daily national series as a two-panel chart
//! - `GET /counts` - Headline counters
//! - `GET /maps/provinces` - Province-level choropleth
//! - `GET /maps/cities` - City-level choropleth
//! - `GET /timeline?start=YYYY-MM-DD&end=YYYY-MM-DD` - Time-lapse frames
//! - `POST /refresh` - Run a refresh cycle now
//! - `GET /health` - Health check

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use epidash::aggregation::{Aggregator, RegionContext};
use epidash::api::{AppState, router};
use epidash::boundary::BoundaryDataset;
use epidash::config::AppConfig;
use epidash::dashboard::Dashboard;
use epidash::data_sources::{Archive, EndpointRegistry, SnapshotFetcher};
use epidash::model::RegionLevel;
use epidash::normalize::NameNormalizer;
use epidash::storage::Storage;
use epidash::table_cache::TableCache;
use epidash::temporal::TemporalIndexer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("epidash=info".parse()?))
        .init();

    let config = AppConfig::from_env();
    info!(port = config.port, db_url = %config.database_url, "Starting epidash");

    // Initialize storage
    let storage = Storage::new(&config.database_url).await?;
    match storage.latest_observation().await? {
        Some(latest) => info!(%latest, "Database initialized with accumulated history"),
        None => info!("Database initialized"),
    }

    let provinces = BoundaryDataset::load(
        RegionLevel::Province,
        &config.province_name_property,
        &config.province_geojson,
    )
    .await?;
    let cities = BoundaryDataset::load(
        RegionLevel::City,
        &config.city_name_property,
        &config.city_geojson,
    )
    .await?;
    info!(
        provinces = provinces.len(),
        cities = cities.len(),
        "Boundary datasets loaded"
    );

    let registry = match &config.upstream_base_url {
        Some(base) => EndpointRegistry::rooted_at(base),
        None => EndpointRegistry::new(),
    };
    let fetcher = SnapshotFetcher::new(
        registry,
        Archive::new(config.archive_dir.clone(), config.utc_offset),
        config.request_timeout,
    )?;
    let aggregator = Aggregator::new(
        config.utc_offset,
        RegionContext::new(NameNormalizer::provinces(), provinces),
        RegionContext::new(NameNormalizer::cities(), cities),
    );
    let indexer = TemporalIndexer::new(config.bucket_interval, config.utc_offset);
    let tables = TableCache::new(config.data_dir.clone(), config.table_max_age);

    let dashboard = Dashboard::new(fetcher, aggregator, indexer, tables, storage, &config);

    // Periodic refresh; the first tick fires immediately.
    let refresher = dashboard.clone();
    let every = config.refresh_interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = refresher.refresh().await {
                warn!(error = %e, "Scheduled refresh failed");
            }
        }
    });

    let app = router(AppState { dashboard }).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, refresh_secs = every.as_secs(), "Epidash is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
