use monitor::db::PgStore;
use monitor::store::{MemoryStore, SampleStore};
use monitor::{metrics, rest, Config, Monitor};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let http_addr = env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting industrial monitor");

    let config = Config::from_env();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }
    config.log_config();

    // Initialize metrics
    metrics::init_metrics();

    let store: Arc<dyn SampleStore> = match env::var("DATABASE_URL") {
        Ok(database_url) => {
            info!("Database: {}", database_url.split('@').last().unwrap_or("***"));
            match PgStore::connect(&database_url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Err(_) => {
            warn!("DATABASE_URL not set, samples are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let monitor = match Monitor::new(&config, store) {
        Ok(monitor) => Arc::new(monitor),
        Err(e) => {
            error!("Failed to build monitor: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = monitor.start().await {
        error!("Failed to start monitor: {}", e);
        std::process::exit(1);
    }

    let app = rest::create_router(Arc::clone(&monitor));

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    match monitor.shutdown().await {
        Ok(report) => info!("Final flush forwarded {} samples", report.forwarded),
        Err(e) => error!("Shutdown failed: {}", e),
    }
}
