// =============================================================================
// Aurora Paper Nexus — Main Entry Point
// =============================================================================
//
// Multi-strategy paper-trading supervisor: periodically invokes external
// signal scripts, applies their signals to simulated portfolios, enforces
// per-strategy risk limits, marks option books to a pricer, and persists
// everything atomically across restarts. No real orders are ever placed.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod fees;
mod marks;
mod notifier;
mod options;
mod persistence;
mod portfolio;
mod pricer;
mod prices;
mod risk;
mod scheduler;
mod signal_runner;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::{Config, PricerMode};
use crate::notifier::DiscordNotifier;
use crate::pricer::black_scholes::BlackScholesPricer;
use crate::pricer::remote::RemotePricer;
use crate::pricer::OptionPricer;
use crate::prices::SpotPriceSource;
use crate::scheduler::Scheduler;

/// Multi-strategy paper-trading supervisor.
#[derive(Debug, Parser)]
#[command(name = "aurora-paper", version)]
struct Cli {
    /// Path to the supervisor config file.
    #[arg(long, default_value = "scheduler/config.json")]
    config: PathBuf,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Paper Nexus — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let cli = Cli::parse();

    // ── 2. Config & persisted state (failures here exit with code 1) ─────
    let config = Config::load(&cli.config)?;

    let state_path = Path::new(&config.state_file).to_path_buf();
    let mut state = persistence::load_state(&state_path)?;
    persistence::validate_loaded(&mut state);
    persistence::prune_to_config(&mut state, &config);

    info!(
        strategies = state.strategies.len(),
        cycle_count = state.cycle_count,
        "supervisor state ready"
    );

    // ── 3. Shared state & collaborators ──────────────────────────────────
    let app = Arc::new(AppState::new(config, state));

    let price_source = SpotPriceSource::new(app.config.price_source_url.clone());
    let pricer: Arc<dyn OptionPricer> = match app.config.pricer.mode {
        PricerMode::Remote => {
            info!(base_url = %app.config.pricer.base_url, "using remote option pricer");
            Arc::new(RemotePricer::new(app.config.pricer.base_url.clone()))
        }
        PricerMode::Local => {
            info!("using local Black-Scholes option pricer");
            Arc::new(BlackScholesPricer::new(price_source.clone()))
        }
    };
    let notifier = DiscordNotifier::from_config(&app.config.discord);

    // ── 4. Status API ────────────────────────────────────────────────────
    let api_state = app.clone();
    let bind_addr =
        std::env::var("AURORA_PAPER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    tokio::spawn(async move {
        let router = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "status API listening");
                if let Err(err) = axum::serve(listener, router).await {
                    error!(error = %err, "status API failed");
                }
            }
            Err(err) => {
                error!(addr = %bind_addr, error = %err, "failed to bind status API");
            }
        }
    });

    // ── 5. Shutdown handling ─────────────────────────────────────────────
    // First signal: finish the in-flight cycle, save, exit cleanly.
    // Second signal: force an immediate exit.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("shutdown signal received — finishing in-flight work");
        let _ = shutdown_tx.send(true);
        wait_for_signal().await;
        warn!("second shutdown signal — forcing exit");
        std::process::exit(1);
    });

    // ── 6. Supervisor loop ───────────────────────────────────────────────
    let scheduler = Scheduler::new(app, pricer, price_source, notifier);

    if cli.once {
        scheduler.run_cycle().await;
        info!("single cycle complete");
        return Ok(());
    }

    scheduler.run(&mut shutdown_rx).await?;

    info!("Aurora Paper Nexus shut down complete.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler — falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
