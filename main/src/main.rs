use std::sync::Arc;
use std::time::Duration;

use common::{
    storage::db::SurrealDbClient,
    utils::{
        config::get_config,
        embedding::EmbeddingClient,
        llm::OpenAiModel,
    },
};
use engine::{EngineDeps, EngineTimeouts, TwinRegistry};
use memory_pipeline::{MemoryPipeline, PipelineConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ws_router::{ws_routes, PrincipalResolver, TransportConfig, WsState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized(config.embedding_dimensions).await?;

    let openai_client = async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    );
    let lm = Arc::new(OpenAiModel::new(openai_client));

    let embedder = Arc::new(EmbeddingClient::from_config(&config)?);
    info!(
        dimension = embedder.dimension(),
        backend = ?config.embedding_backend,
        "embedding client initialized"
    );

    let pipeline = MemoryPipeline::start(
        Arc::clone(&db),
        Arc::clone(&embedder),
        PipelineConfig {
            batch_max: config.ingest_batch_max,
            flush_interval: Duration::from_secs(config.ingest_flush_interval_secs),
            ..PipelineConfig::default()
        },
    );

    let deps = EngineDeps {
        db: Arc::clone(&db),
        lm,
        embedder,
        pipeline: Arc::clone(&pipeline),
    };
    let registry = Arc::new(TwinRegistry::new(
        deps,
        EngineTimeouts {
            llm_idle: Duration::from_secs(config.llm_idle_timeout_secs),
            synthesis: Duration::from_secs(config.synthesis_deadline_secs),
            store_query: Duration::from_secs(config.store_query_timeout_secs),
        },
    ));

    let state = WsState {
        db: Arc::clone(&db),
        registry,
        pipeline: Arc::clone(&pipeline),
        resolver: Arc::new(PrincipalResolver::new(Arc::clone(&db))),
        transport: TransportConfig::from(&config),
    };
    let app = ws_routes(state);

    let serve_address = format!("0.0.0.0:{}", config.http_port);
    info!("starting server listening on {serve_address}");
    let listener = tokio::net::TcpListener::bind(serve_address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the ingest queue before the process goes away.
    info!("flushing memory pipeline");
    pipeline.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "shutdown signal handler failed");
    }
}
