// =============================================================================
// Vela Swing Engine — Main Entry Point
// =============================================================================
//
// Runs the swing strategy against live market data with simulated execution:
// the depth and RSI trackers consume the real venue feeds, while orders fill
// on the in-process paper venue whose mark follows the live book.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod clock;
mod config;
mod exchange;
mod indicators;
mod market_data;
mod order_coordinator;
mod rate_limit;
mod swing;
mod types;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::SystemClock;
use crate::config::SwingConfig;
use crate::exchange::PaperExchange;
use crate::market_data::{DepthTracker, RsiTracker};
use crate::market_data::rsi_tracker::RsiTrackerConfig;
use crate::swing::{EnginePhase, SignalFeed, SwingEngine};
use crate::types::MarketType;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Vela Swing Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = SwingConfig::load("swing_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        SwingConfig::default()
    });

    // Env overrides for the most common knobs.
    if let Ok(symbol) = std::env::var("VELA_SYMBOL") {
        config.symbol = symbol.trim().to_uppercase();
    }
    if let Ok(direction) = std::env::var("VELA_DIRECTION") {
        match serde_json::from_value(serde_json::Value::String(direction.trim().to_lowercase())) {
            Ok(d) => config.direction = d,
            Err(_) => warn!(%direction, "Unrecognised VELA_DIRECTION — keeping config value"),
        }
    }
    if let Ok(amount) = std::env::var("VELA_TRADE_AMOUNT") {
        match amount.trim().parse::<f64>() {
            Ok(a) if a > 0.0 => config.trade_amount = a,
            _ => warn!(%amount, "Unrecognised VELA_TRADE_AMOUNT — keeping config value"),
        }
    }

    info!(
        symbol = %config.symbol,
        direction = %config.direction,
        signal = %format!("{}@{}", config.signal_symbol, config.signal_interval),
        trade_amount = config.trade_amount,
        "Configured swing strategy (paper execution)"
    );

    // ── 2. Market data trackers ──────────────────────────────────────────
    let depth_tracker = Arc::new(DepthTracker::new(&config.symbol, config.depth.clone()));
    let rsi_tracker = Arc::new(RsiTracker::new(RsiTrackerConfig {
        symbol: config.signal_symbol.clone(),
        interval: config.signal_interval.clone(),
        period: config.rsi_period,
        kline_limit: config.signal_kline_limit,
        ws_base_url: config.depth.ws_base_url.clone(),
        rest_base_url: config.depth.rest_base_url.clone(),
    }));

    depth_tracker.start();
    rsi_tracker.start();

    // ── 3. Paper venue fed by the live book ──────────────────────────────
    let venue = Arc::new(PaperExchange::new(
        &config.symbol,
        MarketType::Futures,
        0.0,
    ));

    {
        let venue = venue.clone();
        let mut depth_rx = depth_tracker.subscribe();
        tokio::spawn(async move {
            loop {
                match depth_rx.recv().await {
                    Ok(snapshot) => {
                        if let Some(mid) = snapshot.mid_price {
                            venue.set_mark_price(mid);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "mark-price feed lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ── 4. Swing engine ──────────────────────────────────────────────────
    let signal: Arc<dyn SignalFeed> = rsi_tracker.clone();
    let engine = SwingEngine::new(
        config,
        venue,
        signal,
        Some(depth_tracker.clone()),
        Arc::new(SystemClock),
    );

    // Log phase transitions and trade activity from the snapshot stream.
    {
        let mut rx = engine.subscribe();
        tokio::spawn(async move {
            let mut last_phase: Option<EnginePhase> = None;
            let mut logged_trades = 0usize;
            loop {
                let snapshot = match rx.recv().await {
                    Ok(s) => s,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                if last_phase != Some(snapshot.phase) {
                    info!(
                        phase = ?snapshot.phase,
                        rsi = ?snapshot.rsi,
                        zone = ?snapshot.zone,
                        position = snapshot.position.position_amt,
                        pnl = snapshot.pnl,
                        "phase changed"
                    );
                    last_phase = Some(snapshot.phase);
                }

                for entry in snapshot.trade_log.iter().skip(logged_trades) {
                    info!(kind = %entry.kind, detail = %entry.detail, "trade log");
                }
                logged_trades = snapshot.trade_log.len();
            }
        });
    }

    engine.start();
    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    engine.stop();
    depth_tracker.stop();
    rsi_tracker.stop();

    info!("Vela swing engine shut down complete.");
    Ok(())
}
