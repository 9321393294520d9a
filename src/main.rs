//! Base <-> Solana Bridge Oracle
//!
//! Always-running service with two workers:
//!
//! 1. **Base watcher**: folds `MessageRegistered` events into the message
//!    accumulator, publishes its root to Solana at aligned block intervals
//!    and, with `AUTO_RELAY=true`, proves and executes covered messages.
//! 2. **Solana watcher**: decodes `MessageSent` deposits from program logs
//!    and submits each one to Base exactly once.
//!
//! Each watcher subscribes when its watch URL is a websocket and polls
//! otherwise. The process exits non-zero if any worker fails.

use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing::info;

use oracle::config::Config;
use oracle::dedup::SeenEvents;
use oracle::fees::FeeModel;
use oracle::handlers::{unix_now, DepositHandler, RegistryHandler};
use oracle::relayers::evm::EvmRelayer;
use oracle::relayers::solana::SolanaRelayer;
use oracle::shutdown::Shutdown;
use oracle::supervisor::Supervisor;
use oracle::watchers;

fn main() -> Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    init_logging();

    info!("Starting bridge oracle");

    let config = Config::load()?;
    info!(
        network = ?config.network,
        evm_rpc = %config.evm.rpc_url,
        solana_rpc = %config.solana.rpc_url,
        auto_relay = config.oracle.auto_relay,
        "Configuration loaded"
    );

    let commitment = config.network.commitment();
    let program_id = config.solana.program_id()?;
    let keypair = config.solana.load_keypair().wrap_err("Failed to load Solana keypair")?;
    let rpc_timeout = config.watcher.rpc_timeout();

    let solana_relayer = Arc::new(SolanaRelayer::new(
        &config.solana.rpc_url,
        keypair,
        program_id,
        commitment,
        rpc_timeout,
    ));
    solana_relayer
        .check_program()
        .await
        .wrap_err("Solana bridge program is not usable")?;
    let evm_relayer = Arc::new(EvmRelayer::new(&config.evm, rpc_timeout)?);

    let mut registry = RegistryHandler::new(
        solana_relayer.clone(),
        config.oracle.checkpoint_interval_blocks,
    );
    if config.oracle.auto_relay {
        registry = registry.with_auto_relay(solana_relayer);
    }

    let fees = Arc::new(FeeModel::new(
        config.fees.window_state(unix_now()),
        config.fees.params(),
    ));
    let deposits = DepositHandler::new(
        evm_relayer,
        SeenEvents::new(
            config.oracle.seen_event_cache_size,
            config.oracle.seen_event_ttl_secs,
        ),
        fees,
    );

    let shutdown = Shutdown::new();
    let mut supervisor = Supervisor::new(shutdown.clone());

    let evm = config.evm.clone();
    let timing = config.watcher.clone();
    let evm_shutdown = shutdown.clone();
    supervisor.spawn("evm", async move {
        watchers::evm::run(&evm, &timing, registry, evm_shutdown).await
    });

    let solana = config.solana.clone();
    let timing = config.watcher.clone();
    let solana_shutdown = shutdown.clone();
    supervisor.spawn("solana", async move {
        watchers::solana::run(&solana, commitment, &timing, deposits, solana_shutdown).await
    });

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown.trigger();
    });

    supervisor.run().await?;

    info!("Bridge oracle stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_oracle=debug,oracle=debug"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
