use std::sync::Arc;

use anyhow::{Context, Result};
use relay_common::AppConfig;
use relay_fanout::{
    CacheAdapter, Coordinator, CoordinatorConfig, PgNotifyPublisher, PgSearchIndex,
    PublisherAdapter, SearchAdapter,
};
use relay_store::PgPrimaryStore;
use tracing_subscriber::EnvFilter;

mod routes;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting relay-server");

    let config = AppConfig::from_env()?;
    let file_config = config.file_config()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Connected to database");

    let store = PgPrimaryStore::new(pool.clone());
    store.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Secondary views. The cache and search index are shared with the read routes.
    let cache = Arc::new(CacheAdapter::from_settings(&file_config.cache));
    let search_index = PgSearchIndex::new(pool.clone());
    let search = SearchAdapter::new(search_index.clone(), file_config.search.max_field_bytes);
    let publisher = PublisherAdapter::new(
        PgNotifyPublisher::new(pool.clone()),
        file_config.publisher.channel.clone(),
    );

    let coordinator = Coordinator::builder(store)
        .config(CoordinatorConfig::from(&file_config))
        .adapter(cache.clone())
        .adapter(search)
        .adapter(publisher)
        .build();

    let state = routes::AppState {
        coordinator,
        cache,
        search: Arc::new(search_index),
    };
    let app = routes::build_router(state, &config.allowed_origins);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "Listening");

    axum::serve(listener, app).await?;
    Ok(())
}
