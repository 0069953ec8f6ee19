//! Gateway service entry point.
//!
//! WebSocket gateway bridging clients to the message bus.

use anyhow::Result;
use bus_client::NatsBus;
use gateway::{create_router, AppState, Cache, CacheConfig, ConnRegistry};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting gateway service");

    // Read configuration from environment
    let nats_url = env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
    let http_port: u16 = env::var("HTTP_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .expect("HTTP_PORT must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9090".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let workers: usize = env::var("CACHE_WORKERS")
        .unwrap_or_else(|_| "4".to_string())
        .parse()
        .expect("CACHE_WORKERS must be a number");
    let request_timeout_ms: u64 = env::var("REQUEST_TIMEOUT_MS")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .expect("REQUEST_TIMEOUT_MS must be a number");
    let call_timeout_ms: u64 = env::var("CALL_TIMEOUT_MS")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .expect("CALL_TIMEOUT_MS must be a number");

    info!("Configuration:");
    info!("  NATS_URL: {}", nats_url);
    info!("  HTTP_PORT: {}", http_port);
    info!("  METRICS_PORT: {}", metrics_port);
    info!("  CACHE_WORKERS: {}", workers);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    // Connect to NATS
    let bus = NatsBus::connect(&nats_url).await?;
    info!("Connected to NATS");

    // Create and start the resource cache
    let cache = Cache::new(
        Arc::new(bus),
        CacheConfig {
            workers,
            request_timeout: Duration::from_millis(request_timeout_ms),
            call_timeout: Duration::from_millis(call_timeout_ms),
            ..Default::default()
        },
    );
    cache.start()?;

    let registry = Arc::new(ConnRegistry::new());
    let state = Arc::new(AppState {
        cache: cache.clone(),
        registry: registry.clone(),
    });

    // Start the WebSocket server
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown
    info!("Shutting down...");
    registry.close_all();
    cache.stop();

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
