use shared::{AppConfig, PresenceResult};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use presence_server::handlers::websocket::handle_connection;
use presence_server::redis::connection::RedisConnectionManager;
use presence_server::redis::store::PresenceStore;
use presence_server::redis::subscriber::RedisSubscriber;
use presence_server::AppState;

#[tokio::main]
async fn main() -> PresenceResult<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    // Load application configuration
    let config = match AppConfig::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // Initialize logging
    init_logging(&config)?;

    info!("Starting presence server with configuration: {}", config);

    // One client for commands, one dedicated to subscriptions: a Redis
    // connection in subscriber mode cannot issue regular commands.
    let command_client = redis::Client::open(config.redis.url.as_str())?;
    let subscriber_client = redis::Client::open(config.redis.url.as_str())?;

    let manager = Arc::new(RedisConnectionManager::new(
        command_client,
        config.presence.pruning_interval_ms,
    ));
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run().await });
    }

    let subscriber = RedisSubscriber::spawn(subscriber_client);
    let store = Arc::new(PresenceStore::new(Arc::clone(&manager)));

    let state = AppState {
        store,
        manager,
        subscriber,
        config: Arc::clone(&config),
    };

    // Create server address
    let addr = config.ws_address();
    info!("Presence server listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, state).await {
                            error!("Connection error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                }
            },
        }
    }

    info!("Presence server shutdown complete");
    Ok(())
}

/// Initialize structured logging
fn init_logging(config: &AppConfig) -> PresenceResult<()> {
    let log_level = config.app.log_level.parse().unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("presence_server={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
