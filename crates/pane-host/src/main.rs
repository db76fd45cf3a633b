//! Daemon wrapper around the runtime: load config, run until SIGTERM or
//! Ctrl-C, then shut down in order.
//!
//! Usage: pane-hostd [config.json]

use std::process;

use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pane_host::{PaneRuntime, ProxyPortConfig, RuntimeConfig};

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct DaemonConfig {
    #[serde(flatten)]
    runtime: RuntimeConfig,
    proxy_ports: Vec<ProxyPortConfig>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    error!(%path, %err, "failed to read config file");
                    process::exit(1);
                }
            };
            match serde_json::from_str::<DaemonConfig>(&raw) {
                Ok(config) => config,
                Err(err) => {
                    error!(%path, %err, "failed to parse config file");
                    process::exit(1);
                }
            }
        }
        None => DaemonConfig::default(),
    };

    let mut runtime = match PaneRuntime::start(config.runtime, config.proxy_ports).await {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to start runtime");
            process::exit(1);
        }
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = sigterm.recv() => info!("terminated, shutting down"),
    }

    runtime.shutdown().await;
}
