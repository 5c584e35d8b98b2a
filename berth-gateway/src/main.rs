//! Entry point for the `berth-gateway` HTTP server.

use std::sync::Arc;

use berth_core::CoreConfig;
use berth_driver::sim::SimDriver;
use berth_gateway::{core::Core, routes::create_router};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn load_config() -> CoreConfig {
    let Ok(path) = std::env::var("BERTH_CONFIG") else {
        info!("BERTH_CONFIG not set, using defaults");
        return CoreConfig::default();
    };
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(path = %path, error = %e, "failed to read config");
            std::process::exit(1);
        }
    };
    match serde_json::from_str(&raw) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %path, error = %e, "failed to parse config");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr =
        std::env::var("BERTH_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:2377".to_owned());
    let config = load_config();
    if config.debug_level > 2 {
        tracing::debug!(?config, "effective configuration");
    }

    // The hypervisor client is provided out of process; the built-in
    // simulator backs the server until one is wired in.
    let driver = Arc::new(SimDriver::new());

    let core = match Core::start(config, driver).await {
        Ok(core) => core,
        Err(e) => {
            tracing::error!(error = %e, "failed to start core");
            std::process::exit(1);
        }
    };
    if let Err(e) = Core::install(Arc::clone(&core)) {
        tracing::error!(error = %e, "core already installed");
        std::process::exit(1);
    }

    let app = create_router(Arc::clone(&core));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "berth-gateway listening");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }

    core.shutdown();
}
