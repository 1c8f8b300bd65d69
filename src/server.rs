/// Server setup and initialization
///
/// Wires together storage, registry, timers, engine, dispatcher and HTTP routes.

use crate::{
    api::{create_api_routes, AppState},
    config::Config,
    database,
    flow::{FlowRegistry, FlowStorage},
    instance::{InstanceStore, SqliteInstanceStore},
    runtime::{
        ActionExecutor, EventDispatcher, ExecutionEngine, HttpChannelExecutor, LoggingExecutor,
        TimerService,
    },
};
use anyhow::Result;
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};

/// Running application: the router plus the background services behind it
pub struct App {
    pub router: Router,
    pub timers: Arc<TimerService>,
    pub dispatcher: Arc<EventDispatcher>,
}

/// Build every component and start the background services
pub async fn create_app(config: Config) -> Result<App> {
    tracing::info!("📁 Opening automation database in {}", config.database.data_dir);
    let pool = database::open_pool(&config.database.data_dir).await?;

    tracing::info!("📊 Initializing flow registry");
    let storage = FlowStorage::new(pool.clone());
    let registry = Arc::new(FlowRegistry::new(storage.clone()));
    registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load flows from storage: {}", e))?;

    let store: Arc<dyn InstanceStore> = Arc::new(SqliteInstanceStore::new(pool));

    let actions: Arc<dyn ActionExecutor> = match &config.channel.gateway_url {
        Some(url) => {
            tracing::info!("📡 Delivering actions through channel gateway {}", url);
            Arc::new(HttpChannelExecutor::new(
                url.clone(),
                config.channel.api_token.clone(),
                Duration::from_secs(config.channel.timeout_secs),
            )?)
        }
        None => {
            tracing::warn!("⚠️ No channel gateway configured, actions are only logged");
            Arc::new(LoggingExecutor)
        }
    };

    tracing::info!("⏰ Initializing timer service");
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    let timers = Arc::new(
        TimerService::new(tick_tx)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize timer service: {}", e))?,
    );

    tracing::info!("🚀 Initializing execution engine");
    let engine = Arc::new(ExecutionEngine::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        timers.clone(),
        actions,
        config.engine.engine_config(),
    ));
    let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&engine), Arc::clone(&registry)));

    tokio::spawn(Arc::clone(&dispatcher).run_tick_worker(tick_rx));

    timers.start_sweeper(Arc::clone(&store), config.engine.sweep_interval()).await?;
    timers.start().await?;
    timers.recover(store.as_ref()).await?;

    let state = AppState {
        storage,
        registry,
        store,
        dispatcher: Arc::clone(&dispatcher),
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let router = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_api_routes())
        .with_state(state);

    tracing::info!("✅ Application initialized successfully");
    Ok(App {
        router,
        timers,
        dispatcher,
    })
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting convoflow server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.router.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    app.timers.shutdown().await?;
    Ok(())
}

/// Health check: liveness plus the number of loaded flows
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "flows": state.registry.list_flow_ids().len() }))
}
