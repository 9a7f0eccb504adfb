use anyhow::{Context, Result};
use axum::{Router, routing::get};
use chrono::Utc;
use clap::Parser;
use live_socket::{
    BroadcastHub, LiveEngine, LiveMetrics, MemoryPubSub, PubSubBridge, PubSubTransport,
    SessionStore, spawn_interval,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod db;
mod handlers;
mod model;
mod nats;
mod protocol;
mod session_store;
mod views;
mod ws;

use crate::config::{BroadcastConfig, FileConfig, SessionConfig, ThermostatConfig};
use crate::db::Database;
use crate::model::ThermoModel;
use crate::nats::NatsTransport;
use crate::session_store::SqliteSessionStore;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "thermostat")]
#[command(about = "Shared thermostat served as a live view")]
struct Cli {
    /// Custom data directory (defaults to ~/.thermostat)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// NATS server url; without one an in-process bus is used
    #[arg(long)]
    nats_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub engine: LiveEngine<ThermoModel>,
    pub session: Arc<SessionConfig>,
    pub db: Arc<Database>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Setup logging
    let default_directive = if args.debug {
        "thermostat=debug,live_socket=debug,tower_http=debug,info"
    } else {
        "thermostat=info,live_socket=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Thermostat is starting");

    let config = ThermostatConfig::new(args.data_dir)?;
    let mut file_config: FileConfig = config::load_config(&config.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {:?}", config.config_toml_path()))?;

    // CLI flags win over file and env
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    if args.nats_url.is_some() {
        file_config.nats.url = args.nats_url;
    }

    let session_config = Arc::new(SessionConfig::from_file(&file_config.session));
    let broadcast_config = BroadcastConfig::from_file(&file_config.broadcast);

    let db = Arc::new(Database::new(&config).await?);
    let store = Arc::new(SqliteSessionStore::new(db.pool.clone(), session_config.ttl));

    let metrics = Arc::new(LiveMetrics::new());
    let hub = Arc::new(BroadcastHub::new(
        broadcast_config.origin_policy,
        metrics.clone(),
    ));

    let transport: Arc<dyn PubSubTransport> = match &file_config.nats.url {
        Some(url) => Arc::new(NatsTransport::connect(url).await?),
        None => {
            info!("No NATS url configured, using in-process pub/sub");
            Arc::new(MemoryPubSub::new())
        }
    };
    let bridge = Arc::new(PubSubBridge::new(transport, hub.clone(), metrics.clone()));

    let engine = LiveEngine::new(
        model::live_handler(&file_config.nats.subject),
        store.clone(),
        hub.clone(),
        bridge.clone(),
        metrics,
        session_config.engine.clone(),
    );

    let clock = spawn_interval(hub, broadcast_config.clock_interval, "time", || {
        model::rfc1123(Utc::now())
    });

    let background = CancellationToken::new();
    spawn_session_purge(store, session_config.ttl, background.clone());

    let app_state = AppState {
        engine: engine.clone(),
        session: session_config,
        db,
    };

    let app = Router::new()
        .route("/thermostat", get(ws::thermostat_page))
        .route("/thermostat/ws", get(ws::thermostat_ws))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(app_state);

    let addr = config::listen_addr(&file_config.server)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Thermostat listening on http://{}/thermostat", actual_addr);

    // Sockets must close before the server can finish its graceful shutdown
    let engine_for_shutdown = engine.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
        engine_for_shutdown.shutdown().await;
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    clock.cancel();
    background.cancel();
    bridge.shutdown().await;

    info!("Shutdown complete");
    server_result
}

/// Periodically drop sessions past their TTL.
fn spawn_session_purge(store: Arc<dyn SessionStore>, ttl: Duration, cancel: CancellationToken) {
    let period = (ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(600));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => debug!(purged = n, "Purged expired sessions"),
                    Err(e) => warn!("Failed to purge expired sessions: {}", e),
                },
            }
        }
    });
}
