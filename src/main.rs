use anyhow::Result;
use std::path::PathBuf;
use tracing::{error, info, warn};

use payjoin_gateway::{config::Config, GatewayApp};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let config = load_config().await?;

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        network = %config.node.network,
        dust_threshold_sats = config.payjoin.dust_threshold_sats,
        proposal_timeout_minutes = config.payjoin.proposal_timeout_minutes,
        fee_floor_sat_per_vb = config.payjoin.fee_floor_sat_per_vb,
        bind_address = %config.api.bind_address,
        "starting payjoin gateway"
    );

    if config.is_mainnet() && config.payjoin.fee_api_url.is_none() {
        warn!(
            fee_floor_sat_per_vb = config.payjoin.fee_floor_sat_per_vb,
            "running on mainnet without a fee estimation API; proposals will use the static floor"
        );
    }

    let app = GatewayApp::new(config)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received, draining");
                let _ = shutdown_tx.send(());
            }
            Err(e) => {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        }
    });

    app.run_with_shutdown(shutdown_rx).await?;

    info!("payjoin gateway stopped");
    Ok(())
}

/// Search the working directory, /etc and the user config directory for a
/// gateway config file; fall back to defaults when none exists.
async fn load_config() -> Result<Config> {
    let config_paths = vec![
        PathBuf::from("./payjoin-gateway.toml"),
        PathBuf::from("/etc/payjoin-gateway/payjoin-gateway.toml"),
        dirs::config_dir()
            .map(|d| d.join("payjoin-gateway/payjoin-gateway.toml"))
            .unwrap_or_default(),
    ];

    for path in config_paths {
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            let content = tokio::fs::read_to_string(&path).await?;
            let config: Config = toml::from_str(&content)?;
            return Ok(config);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(Config::default())
}
