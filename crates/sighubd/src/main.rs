#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use sighubd::config::{Args, Config};
use sighubd::metrics::{start_metrics_server, HealthState};
use sighubd::{run_with_shutdown, ServerState};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, loaded_from_file) = if args.config.exists() {
        (Config::from_file(&args.config)?, true)
    } else {
        (Config::default(), false)
    };
    config.apply_overrides(&args);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if loaded_from_file {
        info!("loaded configuration from {}", args.config.display());
    } else {
        warn!(
            "config file {} not found, using built-in defaults",
            args.config.display()
        );
    }

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }
    if args.disable_ui {
        info!("admin UI disabled, running signaling-only");
    }

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!("bound to {}", config.listen_addr());

    let state = ServerState::new(config)?;

    let health_state = HealthState::new();
    tokio::spawn({
        let health_state = health_state.clone();
        let metrics_addr = args.metrics_addr;
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    run_with_shutdown(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
    })
    .await?;

    info!("shutdown complete");
    Ok(())
}
