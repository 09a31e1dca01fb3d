//! Phone Agent Server Entry Point

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use phone_agent_config::{load_settings, ConfigManager, Settings};
use phone_agent_dialer::Dialer;
use phone_agent_engine::engine::EngineCallActions;
use phone_agent_engine::CallEngine;
use phone_agent_providers::{ProviderRegistry, SharedProviderRegistry};
use phone_agent_server::{create_router, init_metrics, AppState};
use phone_agent_tools::{build_registry, SharedToolRegistry, ToolRegistry};
use phone_agent_transport::AriClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Priority: env vars > config/{env}.yaml > config/default.yaml > defaults
    let env = std::env::var("PHONE_AGENT_ENV").ok();
    let config = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized, use eprintln for early logging
            eprintln!("Warning: failed to load config: {e}. Using defaults.");
            Settings::default()
        }
    };

    init_tracing(&config);
    tracing::info!("Starting Phone Agent Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        environment = ?config.environment,
        config_env = env.as_deref().unwrap_or("default"),
        contexts = config.contexts.len(),
        providers = config.providers.len(),
        "Configuration loaded"
    );

    let _metrics_handle = init_metrics();
    tracing::info!("Initialized Prometheus metrics at /metrics");

    // Embedded storage (call history + outbound tables, WAL mode).
    let persistence = phone_agent_persistence::init(&config.persistence.database_path).await?;
    tracing::info!(path = %config.persistence.database_path, "Persistence initialized");

    let ari = AriClient::new(&config.asterisk);
    let providers = Arc::new(SharedProviderRegistry::new(ProviderRegistry::from_settings(
        &config,
    )));
    // Tools need the live-session store for transfer/hangup actions, so
    // the registry is populated right after the engine exists.
    let tools = Arc::new(SharedToolRegistry::new(ToolRegistry::new()));

    let dialer_config = config.dialer.clone();
    let dialer = if dialer_config.enabled {
        let dialer = Dialer::new(persistence.outbound.clone(), ari.clone(), dialer_config);
        dialer.spawn();
        tracing::info!("Outbound dialer running");
        Some(dialer)
    } else {
        None
    };

    let config_manager = Arc::new(ConfigManager::new(config.clone()));
    let engine = CallEngine::new(
        config_manager.clone(),
        ari.clone(),
        providers.clone(),
        tools.clone(),
        persistence.clone(),
        dialer.clone(),
    )
    .await?;

    let actions = Arc::new(EngineCallActions {
        ari: ari.clone(),
        sessions: engine.sessions().clone(),
        stasis_app: config.asterisk.stasis_app.clone(),
    });
    tools.swap(build_registry(&config, actions));

    // Daily retention sweep (no-op when retention_days is 0).
    let retention_days = config.persistence.retention_days;
    if retention_days > 0 {
        let history = persistence.call_history.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(24 * 3600));
            loop {
                ticker.tick().await;
                if let Err(e) = history.sweep_retention(retention_days).await {
                    tracing::error!("retention sweep failed: {e}");
                }
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = tokio::spawn(engine.clone().run(shutdown_rx));

    // Admin surface.
    let app = create_router(AppState {
        handles: engine.handles(),
    });
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Admin surface listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain live calls before exit.
    let _ = shutdown_tx.send(true);
    let _ = engine_task.await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Initialize tracing from the observability settings
fn init_tracing(config: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.observability.log_level;
        format!("phone_agent={level},tower_http=warn").into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
