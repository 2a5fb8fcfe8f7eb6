//! Faucet service binary

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use token_faucet::api::{self, AppState};
use token_faucet::distributor::erc20::Erc20Settings;
use token_faucet::metrics::MetricsCollector;
use token_faucet::store::{open_store, ClaimStore};
use token_faucet::{
    ClaimCoordinator, ClaimPolicy, CoordinatorSettings, Dispensation, Erc20Distributor,
    FaucetConfig, StoreConfig,
};
use tokio::signal;
use tracing::{info, warn};

/// Faucet service CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address
    #[arg(long)]
    server_addr: Option<String>,

    /// RPC URL
    #[arg(long)]
    rpc_url: Option<String>,

    /// Private key
    #[arg(long, env = "FAUCET_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Dispense amount (whole tokens)
    #[arg(long)]
    dispense_amount: Option<String>,

    /// Cooldown between claims of one address (hours)
    #[arg(long)]
    cooldown_hours: Option<f64>,

    /// Store claims in a sled database at this path
    #[arg(long)]
    sled_path: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = FaucetConfig::load(args.config.as_deref())?;

    // Override with CLI arguments
    if let Some(addr) = args.server_addr {
        config.server_addr = addr;
    }
    if let Some(rpc_url) = args.rpc_url {
        config.rpc_url = rpc_url;
    }
    if let Some(key) = args.private_key {
        config.private_key = key;
    }
    if let Some(amount) = args.dispense_amount {
        config.dispense_amount = amount;
    }
    if let Some(hours) = args.cooldown_hours {
        config.cooldown_hours = hours;
    }
    if let Some(path) = args.sled_path {
        config.store = StoreConfig::Sled { path };
    }
    if args.debug {
        config.log.level = "debug".to_string();
    }

    let _log_guard = config.log.init()?;
    config.validate()?;

    info!("Starting token faucet v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Server address: {}", config.server_addr);
    info!("  RPC URL: {}", config.rpc_url);
    info!("  Network: {}", config.network);
    info!("  Token: {} ({})", config.token_symbol, config.token_address);
    info!("  Dispense amount: {} {}", config.dispense_amount, config.token_symbol);
    info!("  Cooldown: {}h", config.cooldown_hours);

    let metrics = MetricsCollector::new().context("Failed to register metrics")?;

    let policy = ClaimPolicy::new(config.cooldown(), config.reservation_timeout());
    let store = open_store(&config.store, policy).await?;

    let distributor = Erc20Distributor::new(Erc20Settings {
        rpc_url: config.rpc_url.clone(),
        private_key: config.private_key.clone(),
        token_address: config.token_address.clone(),
        gas_limit: config.gas_limit,
        gas_price: config.gas_price_wei()?,
        chain_id: config.chain_id,
        request_timeout: config.submit_timeout(),
    })?;
    info!(
        "Faucet account: 0x{}",
        hex::encode(distributor.faucet_address())
    );

    let coordinator = Arc::new(ClaimCoordinator::new(
        store.clone(),
        Arc::new(distributor),
        Dispensation::from_config(&config)?,
        policy,
        CoordinatorSettings::from_config(&config),
    ));

    // Start purge task
    tokio::spawn(purge_loop(store, config.purge_interval()));

    let state = AppState {
        coordinator,
        metrics,
        network: config.network.clone(),
    };
    let app = api::router(state, config.cors_enabled);
    if config.cors_enabled {
        info!("CORS enabled");
    }

    // Start server
    let addr: SocketAddr = config
        .server_addr
        .parse()
        .with_context(|| format!("Invalid server address {}", config.server_addr))?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down gracefully");
    Ok(())
}

/// Periodically drop expired claim records.
async fn purge_loop(store: Arc<dyn ClaimStore>, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        match store.purge_expired(chrono::Utc::now()).await {
            Ok(0) => {}
            Ok(count) => info!(backend = store.backend(), "Purged {} expired claim records", count),
            Err(e) => warn!(backend = store.backend(), error = %e, "Purge failed"),
        }
    }
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
