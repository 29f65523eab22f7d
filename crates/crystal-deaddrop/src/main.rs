//! Dead-drop server entry point: wires the axum router to a TCP listener
//! and runs the TTL sweep on a periodic interval (spec §3 "Supplemented
//! features").

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

fn init_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_tokens(path: &std::path::Path) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to parse bearer-token map, starting with none");
            HashMap::new()
        }),
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "no bearer-token map found, starting with none");
            HashMap::new()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_logging();

    let data_dir = std::env::var("CRYSTAL_DEADDROP_DATA_DIR").unwrap_or_else(|_| "./deaddrop-data".to_string());
    let tokens_path = std::env::var("CRYSTAL_DEADDROP_TOKENS_PATH").unwrap_or_else(|_| "./deaddrop-tokens.json".to_string());
    let bind_addr: SocketAddr = std::env::var("CRYSTAL_DEADDROP_BIND")
        .unwrap_or_else(|_| "0.0.0.0:8787".to_string())
        .parse()?;

    let dead_drop = Arc::new(crystal_deaddrop::DeadDrop::open(&data_dir)?);
    let tokens = Arc::new(load_tokens(std::path::Path::new(&tokens_path)));

    let sweep_handle = {
        let dead_drop = Arc::clone(&dead_drop);
        tokio::spawn(crystal_deaddrop::run_sweep_loop(dead_drop, Duration::from_secs(3600)))
    };

    let app = crystal_deaddrop::router(crystal_deaddrop::AppState { dead_drop, tokens });
    tracing::info!(%bind_addr, data_dir, "crystal-deaddrop listening");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    sweep_handle.abort();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
