// ===============================
// src/main.rs
// ===============================
//
// delta-grid-bot — grid/martingale order-sync client for Delta Exchange.
//
// Polls mark price + position, computes the desired order set, and converges
// the exchange's open orders to it with deterministic client order ids.
// Subcommands: run (24/7 loop), cancel-all, status.
//
mod coid;
mod config;
mod domain;
mod engine;
mod exchange;
mod feed;
mod metrics;
mod quantize;
mod reconcile;
mod strategy;
mod transport;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::{BotConfig, Credentials};
use crate::domain::MarkPrice;
use crate::exchange::DeltaClient;
use crate::transport::Transport;

#[derive(Parser)]
#[command(name = "delta-grid-bot", version, about = "Grid/martingale trading bot for Delta Exchange")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bot 24/7
    Run,
    /// Cancel all open orders for the configured symbol
    CancelAll,
    /// Show mark price and current position
    Status,
}

fn build_client(cfg: &BotConfig, creds: &Credentials) -> Result<DeltaClient, transport::TransportError> {
    let transport = Transport::new(
        cfg.rest_url.clone(),
        cfg.fallback_rest_url.clone(),
        creds.api_key.clone(),
        creds.api_secret.clone(),
    )?;
    Ok(DeltaClient::new(transport))
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    // ---- Load config & credentials (fatal at startup) ----
    let (cfg, creds) = match config::load() {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(2);
        }
    };

    let client = match build_client(&cfg, &creds) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            std::process::exit(2);
        }
    };

    let code = match cli.cmd {
        Command::Run => run_bot(cfg, client).await,
        Command::CancelAll => cancel_all(cfg, client).await,
        Command::Status => status(cfg, client).await,
    };
    std::process::exit(code);
}

async fn run_bot(cfg: BotConfig, client: DeltaClient) -> i32 {
    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    let mode_str = match cfg.mode {
        config::ExchangeMode::Demo => "demo",
        config::ExchangeMode::Live => "live",
    };
    info!(
        symbol = %cfg.symbol,
        mode = %mode_str,
        rest = %cfg.rest_url,
        ws = %cfg.ws_url,
        poll_ms = cfg.poll_interval_ms,
        post_only = cfg.use_post_only,
        shade_ticks = cfg.shade_ticks,
        follow_ticks = cfg.follow_threshold_ticks,
        max_total_lots = cfg.strategy.max_total_lots,
        "startup config"
    );
    metrics::CONFIG_SYMBOL.with_label_values(&[&cfg.symbol]).set(1);
    metrics::CONFIG_MODE.with_label_values(&[mode_str]).set(1);

    // ---- Mark price feed (independent background task) ----
    let (mark_tx, mark_rx) = watch::channel(MarkPrice::default());
    tokio::spawn(feed::run_mark_price(cfg.ws_url.clone(), cfg.symbol.clone(), mark_tx));

    // ---- Shutdown: finish the in-flight cycle, then exit ----
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, finishing current cycle");
        let _ = shutdown_tx.send(true);
    });

    // ---- Control loop ----
    match engine::run(cfg, client, mark_rx, shutdown_rx).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "control loop halted");
            1
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn cancel_all(cfg: BotConfig, client: DeltaClient) -> i32 {
    let product = match client.get_product(&cfg.symbol).await {
        Ok(p) => p,
        Err(e) => {
            error!(symbol = %cfg.symbol, error = %e, "product lookup failed");
            return 1;
        }
    };
    match client.cancel_all(product.product_id).await {
        Ok(resp) => {
            info!(symbol = %cfg.symbol, response = %resp, "cancel-all issued");
            0
        }
        Err(e) => {
            error!(error = %e, "cancel-all failed");
            1
        }
    }
}

async fn status(cfg: BotConfig, client: DeltaClient) -> i32 {
    let product = match client.get_product(&cfg.symbol).await {
        Ok(p) => p,
        Err(e) => {
            error!(symbol = %cfg.symbol, error = %e, "product lookup failed");
            return 1;
        }
    };
    let mark = client.get_mark_price(&cfg.symbol).await;
    let position = client.get_position(product.product_id).await;
    match (mark, position) {
        (Ok(mark), Ok(pos)) => {
            info!(
                symbol = %cfg.symbol,
                product_id = product.product_id,
                tick_size = product.tick_size,
                mark,
                position = ?pos,
                "status"
            );
            0
        }
        (mark, position) => {
            error!(?mark, ?position, "status query failed");
            1
        }
    }
}
