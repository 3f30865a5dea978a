use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use rusty_signal::auth::resolver_for;
use rusty_signal::config::ServerConfig;
use rusty_signal::core::ServerManager;
use rusty_signal::handlers::routes;

#[tokio::main]
async fn main() {
    // Initialize env
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    match dotenv_result {
        Ok(path) => info!("Environment variables loaded from {}", path.display()),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Load config from the environment
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: host={}, port={}, queue={}, identity={:?}, duplicates={:?}",
        config.host,
        config.port,
        config.outbound_queue_size,
        config.identity_source,
        config.duplicate_policy
    );

    // Build the server address
    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown_grace = config.shutdown_grace;
    let resolver = resolver_for(config.identity_source);
    let server = Arc::new(ServerManager::new(config));

    let (bound, serving) = match warp::serve(routes(server.clone(), resolver))
        .try_bind_with_graceful_shutdown(addr, shutdown_signal())
    {
        Ok(pair) => pair,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Starting Rusty Signal server on {}", bound);
    serving.await;

    info!("Listener closed, draining sessions");
    if let Err(e) = server.shutdown(shutdown_grace).await {
        warn!("{}", e);
    }
    info!("Server stopped");
}

// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
