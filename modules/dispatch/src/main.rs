use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dispatch_rs::config::Config;
use dispatch_rs::executors::{FsScriptStore, InferenceProvider, LuaRuntime, OpenAiProvider};
use dispatch_rs::metrics::Metrics;
use dispatch_rs::routes::{self, AppState};
use dispatch_rs::{ConfigSnapshot, Dispatcher, HandlerEnv, RoutingHandle, RoutingTable};
use river::{InMemoryRiver, NatsRiver, River};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dispatch_rs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        bus_type = %config.bus_type,
        consumer_group = %config.dispatcher.consumer_group,
        pattern = %config.dispatcher.subscribe_pattern,
        "config loaded"
    );

    let river: Arc<dyn River> = match config.bus_type.to_lowercase().as_str() {
        "inmemory" => {
            tracing::info!("Using InMemory river");
            Arc::new(InMemoryRiver::with_visibility_timeout(config.visibility_timeout))
        }
        "nats" => {
            tracing::info!(nats_url = %config.nats_url, stream = %config.river_stream, "Connecting to NATS");
            let client = async_nats::connect(&config.nats_url).await?;
            Arc::new(
                NatsRiver::connect(
                    client,
                    &config.river_stream,
                    config.river_subjects.clone(),
                    config.visibility_timeout,
                )
                .await?,
            )
        }
        other => {
            return Err(format!("Invalid BUS_TYPE: {other}. Must be 'inmemory' or 'nats'").into())
        }
    };

    let mut handler_env = HandlerEnv::new(
        Arc::new(FsScriptStore::new(&config.script_root)),
        Arc::new(LuaRuntime::new()),
    )
    .with_defaults(config.handlers);
    if let Some(api_key) = &config.inference_api_key {
        let mut provider = OpenAiProvider::new(api_key, &config.inference_model);
        if let Some(url) = &config.inference_base_url {
            provider = provider.with_base_url(url);
        }
        tracing::info!(model = %config.inference_model, "inference provider configured");
        handler_env = handler_env.with_provider(Arc::new(provider) as Arc<dyn InferenceProvider>);
    }

    let raw = std::fs::read_to_string(&config.bindings_path)
        .map_err(|e| format!("cannot read {}: {e}", config.bindings_path.display()))?;
    let table = RoutingTable::load(&ConfigSnapshot::from_json(&raw)?, &handler_env)?;
    tracing::info!(
        generation = table.generation(),
        bindings = table.len(),
        "routing table loaded"
    );
    let routing = Arc::new(RoutingHandle::new(table));

    let metrics = Metrics::new()?;
    let dispatcher = Dispatcher::new(river, routing, config.dispatcher.clone(), metrics.clone())?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let dispatch_task = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = dispatcher.run_until(shutdown).await {
                tracing::error!(error = %e, "dispatcher stopped with error");
            }
        })
    };

    let state = Arc::new(AppState {
        dispatcher,
        metrics,
        handler_env,
        bindings_path: Some(config.bindings_path.clone()),
    });

    let app = routes::router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(());
    dispatch_task.await?;

    Ok(())
}
