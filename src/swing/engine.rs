// =============================================================================
// Swing Engine — glues signal feeds, swing logic, and the order coordinator
// =============================================================================
//
// Subscribes to the adapter's account/orders/depth/ticker streams, drives a
// fixed-cadence tick loop, and turns swing-logic actions into coordinator
// calls. A price-triggered kill-switch runs on every tick for any open
// position, independent of venue-side stop orders.
//
// Errors never escape: every failure path becomes a log entry plus a snapshot
// so observers always see the same stream the operator does.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SwingConfig;
use crate::exchange::ExchangeAdapter;
use crate::market_data::{DepthFeedSnapshot, DepthTracker, RsiTracker};
use crate::order_coordinator::{OrderCoordinator, OrderError, OrderSlot, SlippageGuard};
use crate::rate_limit::{CycleDecision, RateLimitController, RateLimitSnapshot};
use crate::swing::logic::{self, StepConfig, StepEvent, SwingAction, SwingState};
use crate::types::{
    AccountSnapshot, DepthSnapshot, MarketType, Order, OrderType, PositionSnapshot, Side,
    TickerSnapshot, TradeLogEntry,
};

/// Broadcast capacity for engine snapshots.
const CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Signal feed seam
// ---------------------------------------------------------------------------

/// The RSI signal surface the engine consumes; implemented by the live
/// tracker and by test stubs.
pub trait SignalFeed: Send + Sync {
    fn is_stable(&self) -> bool;
    fn value(&self) -> Option<f64>;
    fn last_close(&self) -> Option<f64>;
}

impl SignalFeed for RsiTracker {
    fn is_stable(&self) -> bool {
        RsiTracker::is_stable(self)
    }

    fn value(&self) -> Option<f64> {
        RsiTracker::value(self)
    }

    fn last_close(&self) -> Option<f64> {
        self.latest().and_then(|s| s.last_close)
    }
}

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Engine lifecycle phase, derived from readiness, position, and arm flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    Disabled,
    Initializing,
    Observing,
    WaitingOpenShort,
    WaitingOpenLong,
    WaitingCloseShort,
    WaitingCloseLong,
}

/// Where the current RSI sits relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsiZone {
    Overbought,
    Oversold,
    Neutral,
    Unknown,
}

/// Immutable engine snapshot emitted on every tick and state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub ready: bool,
    pub symbol: String,
    pub direction: crate::types::TradeDirection,
    pub phase: EnginePhase,
    pub last_price: Option<f64>,
    pub signal_symbol: String,
    pub signal_price: Option<f64>,
    pub rsi: Option<f64>,
    pub zone: RsiZone,
    pub armed_short_entry: bool,
    pub armed_short_exit: bool,
    pub armed_long_entry: bool,
    pub armed_long_exit: bool,
    pub position: PositionSnapshot,
    pub pnl: f64,
    pub session_volume: f64,
    pub stop_loss_price: Option<f64>,
    pub kill_switch_engaged: bool,
    pub open_orders: Vec<Order>,
    pub depth: Option<DepthSnapshot>,
    pub ticker: Option<TickerSnapshot>,
    pub signal_depth: Option<DepthFeedSnapshot>,
    pub rate_limit: RateLimitSnapshot,
    pub trade_log: Vec<TradeLogEntry>,
    pub error: Option<String>,
    /// Epoch millis.
    pub updated_at: i64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner {
    config: SwingConfig,
    adapter: Arc<dyn ExchangeAdapter>,
    clock: Arc<dyn Clock>,
    coordinator: OrderCoordinator,
    signal: Arc<dyn SignalFeed>,
    depth_tracker: Option<Arc<DepthTracker>>,

    swing_state: Mutex<SwingState>,
    rate_limiter: Mutex<RateLimitController>,

    account: RwLock<Option<AccountSnapshot>>,
    open_orders: RwLock<Option<Vec<Order>>>,
    depth: RwLock<Option<DepthSnapshot>>,
    ticker: RwLock<Option<TickerSnapshot>>,

    started: AtomicBool,
    disabled: AtomicBool,
    stopped: AtomicBool,
    kill_switch_engaged: AtomicBool,
    error: RwLock<Option<String>>,

    session_volume: Mutex<f64>,
    trade_log: Mutex<VecDeque<TradeLogEntry>>,

    latest: RwLock<Option<EngineSnapshot>>,
    tx: broadcast::Sender<EngineSnapshot>,
}

/// RSI swing strategy engine for one symbol.
pub struct SwingEngine {
    inner: Arc<EngineInner>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SwingEngine {
    pub fn new(
        config: SwingConfig,
        adapter: Arc<dyn ExchangeAdapter>,
        signal: Arc<dyn SignalFeed>,
        depth_tracker: Option<Arc<DepthTracker>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Venue-reported precision wins over configured fallbacks.
        let (price_tick, qty_step) = match adapter.precision() {
            Some(p) => (p.price_tick, p.qty_step),
            None => (config.price_tick, config.qty_step),
        };

        let coordinator = OrderCoordinator::new(
            adapter.clone(),
            clock.clone(),
            config.symbol.clone(),
            qty_step,
            price_tick,
            Duration::from_millis(config.order_lock_ttl_ms),
            Duration::from_millis(config.stop_debounce_ms),
        );

        let rate_limiter =
            RateLimitController::new(Duration::from_millis(config.rate_limit_max_pause_ms));

        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(EngineInner {
                config,
                adapter,
                clock,
                coordinator,
                signal,
                depth_tracker,
                swing_state: Mutex::new(SwingState::default()),
                rate_limiter: Mutex::new(rate_limiter),
                account: RwLock::new(None),
                open_orders: RwLock::new(None),
                depth: RwLock::new(None),
                ticker: RwLock::new(None),
                started: AtomicBool::new(false),
                disabled: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                kill_switch_engaged: AtomicBool::new(false),
                error: RwLock::new(None),
                session_volume: Mutex::new(0.0),
                trade_log: Mutex::new(VecDeque::new()),
                latest: RwLock::new(None),
                tx,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Install adapter subscriptions and spawn the tick loop. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        install_subscriptions(&self.inner);

        let inner = self.inner.clone();
        let poll = Duration::from_millis(inner.config.poll_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                run_tick(&inner).await;
            }
        });
        *self.handle.lock() = Some(handle);

        info!(
            symbol = %self.inner.config.symbol,
            direction = %self.inner.config.direction,
            adapter = self.inner.adapter.id(),
            "swing engine started"
        );
    }

    /// Stop the tick loop; in-flight submissions complete but their results
    /// are ignored.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        info!(symbol = %self.inner.config.symbol, "swing engine stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineSnapshot> {
        self.inner.tx.subscribe()
    }

    pub fn latest(&self) -> Option<EngineSnapshot> {
        self.inner.latest.read().clone()
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.disabled.load(Ordering::SeqCst)
    }
}

impl Drop for SwingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

fn install_subscriptions(inner: &Arc<EngineInner>) {
    let symbol = inner.config.symbol.clone();

    let account_inner = inner.clone();
    inner.adapter.watch_account(Arc::new(move |snapshot| {
        // Spot guard: a spot venue cannot hold the short side.
        if snapshot.market_type == MarketType::Spot
            && account_inner.config.direction.allows_short()
            && !account_inner.disabled.swap(true, Ordering::SeqCst)
        {
            let msg = format!(
                "spot account cannot trade direction '{}' — engine disabled",
                account_inner.config.direction
            );
            error!(symbol = %account_inner.config.symbol, "{msg}");
            *account_inner.error.write() = Some(msg.clone());
            push_log(&account_inner, "error", msg);
            emit_snapshot(&account_inner);
        }
        *account_inner.account.write() = Some(snapshot);
    }));

    let orders_inner = inner.clone();
    inner.adapter.watch_orders(Arc::new(move |orders| {
        orders_inner.coordinator.reconcile(&orders);
        *orders_inner.open_orders.write() = Some(orders);
    }));

    let depth_inner = inner.clone();
    inner.adapter.watch_depth(
        &symbol,
        Arc::new(move |snapshot| {
            *depth_inner.depth.write() = Some(snapshot);
        }),
    );

    let ticker_inner = inner.clone();
    inner.adapter.watch_ticker(
        &symbol,
        Arc::new(move |snapshot| {
            *ticker_inner.ticker.write() = Some(snapshot);
        }),
    );
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

async fn run_tick(inner: &Arc<EngineInner>) {
    let decision = {
        let now = inner.clock.now();
        inner.rate_limiter.lock().before_cycle(now)
    };
    if decision != CycleDecision::Run {
        debug!(?decision, "cycle withheld by rate-limit controller");
        emit_snapshot(inner);
        return;
    }

    if inner.disabled.load(Ordering::SeqCst) || !is_ready(inner) {
        emit_snapshot(inner);
        return;
    }

    let mut had_rate_limit = false;

    // ── Observations ────────────────────────────────────────────────────
    let Some(account) = inner.account.read().clone() else {
        emit_snapshot(inner);
        return;
    };
    let position = account.position_for(&inner.config.symbol);
    let depth = inner.depth.read().clone().unwrap_or_default();
    let ticker = inner.ticker.read().clone();
    let last_price = ticker.as_ref().map(|t| t.last_price);

    let top_bid = depth.best_bid().or(last_price);
    let top_ask = depth.best_ask().or(last_price);

    // Near-touch pnl: a long exits into the bid, a short into the ask.
    let pnl = near_touch_pnl(&position, top_bid, top_ask);

    // ── Swing step ──────────────────────────────────────────────────────
    let step_config = StepConfig {
        direction: inner.config.direction,
        rsi_high: inner.config.rsi_high,
        rsi_low: inner.config.rsi_low,
    };
    let event = StepEvent {
        rsi: inner.signal.value(),
        position_amt: position.position_amt,
        pnl,
    };

    let actions = {
        let mut state = inner.swing_state.lock();
        let (next, actions) = logic::step(&state, &step_config, &event);
        *state = next;
        actions
    };

    for action in actions {
        execute_action(
            inner,
            action,
            &position,
            top_bid,
            top_ask,
            last_price,
            &mut had_rate_limit,
        )
        .await;
    }

    // A venue backoff aborts the rest of the cycle.
    if had_rate_limit {
        inner.rate_limiter.lock().on_cycle_complete(true);
        emit_snapshot(inner);
        return;
    }

    // ── Stop-loss & kill-switch ─────────────────────────────────────────
    let reference = depth.mid_price().or(last_price);
    // Position may have just changed; re-read for stop management.
    let position = inner
        .account
        .read()
        .as_ref()
        .map(|a| a.position_for(&inner.config.symbol))
        .unwrap_or(position);
    handle_stop_loss(inner, &position, reference, &mut had_rate_limit).await;

    inner.rate_limiter.lock().on_cycle_complete(had_rate_limit);
    emit_snapshot(inner);
}

fn is_ready(inner: &Arc<EngineInner>) -> bool {
    inner.account.read().is_some()
        && inner.ticker.read().is_some()
        && inner.depth.read().is_some()
        && inner.open_orders.read().is_some()
        && inner.signal.is_stable()
        && inner.signal.value().is_some()
}

fn near_touch_pnl(position: &PositionSnapshot, top_bid: Option<f64>, top_ask: Option<f64>) -> f64 {
    if position.is_flat() {
        return 0.0;
    }
    let exit_price = if position.position_amt > 0.0 {
        top_bid
    } else {
        top_ask
    };
    match exit_price {
        Some(p) if p.is_finite() && position.entry_price.is_finite() => {
            (p - position.entry_price) * position.position_amt
        }
        _ => position.unrealized_profit,
    }
}

// ---------------------------------------------------------------------------
// Action execution
// ---------------------------------------------------------------------------

async fn execute_action(
    inner: &Arc<EngineInner>,
    action: SwingAction,
    position: &PositionSnapshot,
    top_bid: Option<f64>,
    top_ask: Option<f64>,
    last_price: Option<f64>,
    had_rate_limit: &mut bool,
) {
    let max_pct = inner.config.max_close_slippage_pct;
    let reference = last_price.unwrap_or(f64::NAN);

    // Entries gated by near-touch dominance when an exchange-side depth
    // tracker is attached: never open into a side the book is stacked
    // against.
    let summary = inner
        .depth_tracker
        .as_ref()
        .and_then(|t| t.latest())
        .map(|s| s.summary);

    let result = match action {
        SwingAction::OpenShort => {
            if summary.map_or(false, |s| s.skip_sell_side) {
                debug!("short entry skipped: bid side dominant near the touch");
                return;
            }
            inner
                .coordinator
                .place_market_order(
                    Side::Sell,
                    inner.config.trade_amount,
                    OrderSlot::Entry,
                    SlippageGuard {
                        reference,
                        expected: top_bid.unwrap_or(reference),
                        max_pct,
                    },
                )
                .await
                .map(Some)
        }
        SwingAction::OpenLong => {
            if summary.map_or(false, |s| s.skip_buy_side) {
                debug!("long entry skipped: ask side dominant near the touch");
                return;
            }
            inner
                .coordinator
                .place_market_order(
                    Side::Buy,
                    inner.config.trade_amount,
                    OrderSlot::Entry,
                    SlippageGuard {
                        reference,
                        expected: top_ask.unwrap_or(reference),
                        max_pct,
                    },
                )
                .await
                .map(Some)
        }
        SwingAction::ClosePosition => {
            let side = if position.position_amt > 0.0 {
                Side::Sell
            } else {
                Side::Buy
            };
            let expected = if side == Side::Sell { top_bid } else { top_ask };
            inner
                .coordinator
                .market_close(
                    side,
                    position.position_amt.abs(),
                    SlippageGuard {
                        reference,
                        expected: expected.unwrap_or(reference),
                        max_pct,
                    },
                )
                .await
        }
    };

    match result {
        Ok(Some(order)) => {
            let fill_price = order.price.or(last_price).unwrap_or(0.0);
            *inner.session_volume.lock() += order.executed_qty * fill_price;
            push_log(
                inner,
                action_kind(action),
                format!(
                    "{} {} {} @ ~{fill_price} (order {})",
                    order.side, order.executed_qty, order.symbol, order.order_id
                ),
            );
        }
        Ok(None) => {
            push_log(inner, action_kind(action), "position already closed".to_string());
        }
        Err(e) => handle_order_error(inner, action_kind(action), e, had_rate_limit),
    }
}

fn action_kind(action: SwingAction) -> &'static str {
    match action {
        SwingAction::OpenShort => "open_short",
        SwingAction::OpenLong => "open_long",
        SwingAction::ClosePosition => "close",
    }
}

fn handle_order_error(
    inner: &Arc<EngineInner>,
    kind: &'static str,
    error: OrderError,
    had_rate_limit: &mut bool,
) {
    match &error {
        OrderError::RateLimited { reason } => {
            let now = inner.clock.now();
            inner.rate_limiter.lock().register_rate_limit(now, reason);
            *had_rate_limit = true;
        }
        OrderError::SlotBusy(slot) => {
            debug!(%slot, kind, "submission already in flight — skipped");
            return;
        }
        OrderError::SlippageExceeded { .. } => {
            warn!(kind, error = %error, "action abandoned for this tick");
        }
        _ => {
            warn!(kind, error = %error, "order operation failed");
        }
    }
    push_log(inner, "error", format!("{kind}: {error}"));
}

// ---------------------------------------------------------------------------
// Stop-loss management
// ---------------------------------------------------------------------------

async fn handle_stop_loss(
    inner: &Arc<EngineInner>,
    position: &PositionSnapshot,
    reference: Option<f64>,
    had_rate_limit: &mut bool,
) {
    inner.kill_switch_engaged.store(false, Ordering::SeqCst);

    if position.is_flat() || !position.entry_price.is_finite() || position.entry_price <= 0.0 {
        cancel_leftover_stops(inner).await;
        return;
    }
    let Some(reference) = reference.filter(|r| r.is_finite()) else {
        return;
    };

    let long = position.position_amt > 0.0;
    let stop_pct = inner.config.stop_loss_pct.max(0.0);
    let stop_price = if long {
        position.entry_price * (1.0 - stop_pct)
    } else {
        position.entry_price * (1.0 + stop_pct)
    };
    let tick = inner.config.price_tick;
    let close_side = if long { Side::Sell } else { Side::Buy };

    // Kill-switch: local, price-triggered, independent of any venue stop.
    let breached = if long {
        reference <= stop_price + tick
    } else {
        reference >= stop_price - tick
    };

    if breached {
        inner.kill_switch_engaged.store(true, Ordering::SeqCst);
        warn!(
            symbol = %inner.config.symbol,
            reference,
            stop_price,
            "kill-switch triggered — closing at market"
        );

        let result = inner
            .coordinator
            .market_close(
                close_side,
                position.position_amt.abs(),
                SlippageGuard {
                    reference,
                    expected: reference,
                    max_pct: inner.config.max_close_slippage_pct,
                },
            )
            .await;

        match result {
            Ok(_) => push_log(
                inner,
                "kill_switch",
                format!("closed {} at ~{reference} (stop {stop_price})", inner.config.symbol),
            ),
            Err(e) => handle_order_error(inner, "kill_switch", e, had_rate_limit),
        }
        return;
    }

    // Otherwise make sure exactly one protective stop rests on the venue.
    let has_stop = inner
        .open_orders
        .read()
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|o| {
            o.order_type == OrderType::StopMarket
                && o.side == close_side
                && o.status.is_open()
                && (o.reduce_only || o.close_position)
        });

    if !has_stop {
        let result = inner
            .coordinator
            .place_stop_loss_order(
                close_side,
                stop_price,
                position.position_amt.abs(),
                reference,
                SlippageGuard {
                    reference,
                    expected: reference,
                    max_pct: inner.config.max_close_slippage_pct,
                },
            )
            .await;

        match result {
            Ok(Some(order)) => push_log(
                inner,
                "stop",
                format!(
                    "stop {} {} @ {} (order {})",
                    order.side,
                    order.orig_qty,
                    order.stop_price.unwrap_or(stop_price),
                    order.order_id
                ),
            ),
            Ok(None) => {} // debounced
            Err(e) => handle_order_error(inner, "stop", e, had_rate_limit),
        }
    }
}

/// With no position there is nothing for a reduce-only stop to protect;
/// cancel any that are still resting.
async fn cancel_leftover_stops(inner: &Arc<EngineInner>) {
    let stale_ids: Vec<String> = inner
        .open_orders
        .read()
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter(|o| {
            o.order_type == OrderType::StopMarket
                && o.status.is_open()
                && (o.reduce_only || o.close_position)
        })
        .map(|o| o.order_id.clone())
        .collect();

    if stale_ids.is_empty() {
        return;
    }

    debug!(count = stale_ids.len(), "cancelling leftover stop orders");
    if let Err(e) = inner
        .adapter
        .cancel_orders(&inner.config.symbol, &stale_ids)
        .await
    {
        warn!(error = %e, "failed to cancel leftover stop orders");
    }
}

// ---------------------------------------------------------------------------
// Snapshot emission
// ---------------------------------------------------------------------------

fn push_log(inner: &Arc<EngineInner>, kind: &str, detail: String) {
    let mut log = inner.trade_log.lock();
    log.push_back(TradeLogEntry {
        at: chrono::Utc::now().to_rfc3339(),
        kind: kind.to_string(),
        detail,
    });
    while log.len() > inner.config.max_log_entries {
        log.pop_front();
    }
}

fn derive_phase(
    disabled: bool,
    ready: bool,
    position: &PositionSnapshot,
    state: &SwingState,
) -> EnginePhase {
    if disabled {
        return EnginePhase::Disabled;
    }
    if !ready {
        return EnginePhase::Initializing;
    }
    if position.is_flat() {
        if state.armed_short_entry {
            return EnginePhase::WaitingOpenShort;
        }
        if state.armed_long_entry {
            return EnginePhase::WaitingOpenLong;
        }
    } else if position.position_amt < 0.0 {
        if state.armed_short_exit {
            return EnginePhase::WaitingCloseShort;
        }
    } else if state.armed_long_exit {
        return EnginePhase::WaitingCloseLong;
    }
    EnginePhase::Observing
}

fn derive_zone(rsi: Option<f64>, high: f64, low: f64) -> RsiZone {
    match rsi {
        None => RsiZone::Unknown,
        Some(v) if v >= high => RsiZone::Overbought,
        Some(v) if v <= low => RsiZone::Oversold,
        Some(_) => RsiZone::Neutral,
    }
}

fn emit_snapshot(inner: &Arc<EngineInner>) {
    let disabled = inner.disabled.load(Ordering::SeqCst);
    let ready = !disabled && is_ready(inner);

    let position = inner
        .account
        .read()
        .as_ref()
        .map(|a| a.position_for(&inner.config.symbol))
        .unwrap_or_else(|| PositionSnapshot::flat(&inner.config.symbol));

    let state = inner.swing_state.lock().clone();
    let depth = inner.depth.read().clone();
    let ticker = inner.ticker.read().clone();
    let rsi = inner.signal.value();

    let top_bid = depth.as_ref().and_then(|d| d.best_bid());
    let top_ask = depth.as_ref().and_then(|d| d.best_ask());
    let pnl = near_touch_pnl(&position, top_bid, top_ask);

    let stop_loss_price = if position.is_flat() || position.entry_price <= 0.0 {
        None
    } else {
        let pct = inner.config.stop_loss_pct.max(0.0);
        Some(if position.position_amt > 0.0 {
            position.entry_price * (1.0 - pct)
        } else {
            position.entry_price * (1.0 + pct)
        })
    };

    let snapshot = EngineSnapshot {
        ready,
        symbol: inner.config.symbol.clone(),
        direction: inner.config.direction,
        phase: derive_phase(disabled, ready, &position, &state),
        last_price: ticker.as_ref().map(|t| t.last_price),
        signal_symbol: inner.config.signal_symbol.clone(),
        signal_price: inner.signal.last_close(),
        rsi,
        zone: derive_zone(rsi, inner.config.rsi_high, inner.config.rsi_low),
        armed_short_entry: state.armed_short_entry,
        armed_short_exit: state.armed_short_exit,
        armed_long_entry: state.armed_long_entry,
        armed_long_exit: state.armed_long_exit,
        position,
        pnl,
        session_volume: *inner.session_volume.lock(),
        stop_loss_price,
        kill_switch_engaged: inner.kill_switch_engaged.load(Ordering::SeqCst),
        open_orders: inner.open_orders.read().clone().unwrap_or_default(),
        depth,
        ticker,
        signal_depth: inner.depth_tracker.as_ref().and_then(|t| t.latest()),
        rate_limit: inner.rate_limiter.lock().snapshot(inner.clock.now()),
        trade_log: inner.trade_log.lock().iter().cloned().collect(),
        error: inner.error.read().clone(),
        updated_at: inner.clock.now_ms(),
    };

    *inner.latest.write() = Some(snapshot.clone());
    let _ = inner.tx.send(snapshot);
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exchange::{OrderRequest, PaperExchange};
    use crate::types::TradeDirection;

    struct StubSignal {
        value: Mutex<Option<f64>>,
        stable: AtomicBool,
    }

    impl StubSignal {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                value: Mutex::new(None),
                stable: AtomicBool::new(false),
            })
        }

        fn set(&self, rsi: f64) {
            *self.value.lock() = Some(rsi);
            self.stable.store(true, Ordering::SeqCst);
        }
    }

    impl SignalFeed for StubSignal {
        fn is_stable(&self) -> bool {
            self.stable.load(Ordering::SeqCst)
        }

        fn value(&self) -> Option<f64> {
            *self.value.lock()
        }

        fn last_close(&self) -> Option<f64> {
            self.value.lock().map(|_| 0.05)
        }
    }

    fn test_config(direction: TradeDirection) -> SwingConfig {
        SwingConfig {
            symbol: "BTCUSDT".into(),
            direction,
            trade_amount: 1.0,
            stop_loss_pct: 0.05,
            price_tick: 0.1,
            qty_step: 0.001,
            ..SwingConfig::default()
        }
    }

    struct Harness {
        venue: Arc<PaperExchange>,
        signal: Arc<StubSignal>,
        engine: SwingEngine,
    }

    fn harness(direction: TradeDirection, market_type: MarketType) -> Harness {
        let venue = Arc::new(PaperExchange::new("BTCUSDT", market_type, 100.0));
        let signal = StubSignal::new();
        let clock = Arc::new(ManualClock::new());
        let engine = SwingEngine::new(
            test_config(direction),
            venue.clone(),
            signal.clone(),
            None,
            clock,
        );
        install_subscriptions(&engine.inner);
        Harness {
            venue,
            signal,
            engine,
        }
    }

    async fn tick(h: &Harness) {
        run_tick(&h.engine.inner).await;
    }

    // ---- readiness & phases ----------------------------------------------

    #[tokio::test]
    async fn initializing_until_signal_is_stable() {
        let h = harness(TradeDirection::Short, MarketType::Futures);

        tick(&h).await;
        let snap = h.engine.latest().unwrap();
        assert!(!snap.ready);
        assert_eq!(snap.phase, EnginePhase::Initializing);
        assert_eq!(snap.zone, RsiZone::Unknown);

        h.signal.set(50.0);
        tick(&h).await;
        let snap = h.engine.latest().unwrap();
        assert!(snap.ready);
        assert_eq!(snap.phase, EnginePhase::Observing);
        assert_eq!(snap.zone, RsiZone::Neutral);
    }

    #[tokio::test]
    async fn spot_account_with_short_direction_is_disabled() {
        let h = harness(TradeDirection::Short, MarketType::Spot);

        tick(&h).await;
        assert!(h.engine.is_disabled());
        let snap = h.engine.latest().unwrap();
        assert_eq!(snap.phase, EnginePhase::Disabled);
        assert!(snap.error.is_some());

        // Signal readiness must not resurrect a disabled engine.
        h.signal.set(75.0);
        tick(&h).await;
        assert_eq!(h.engine.latest().unwrap().phase, EnginePhase::Disabled);
        assert_eq!(h.venue.position_amt(), 0.0);
    }

    #[tokio::test]
    async fn spot_account_long_only_is_allowed() {
        let h = harness(TradeDirection::Long, MarketType::Spot);
        h.signal.set(50.0);
        tick(&h).await;
        assert!(!h.engine.is_disabled());
        assert!(h.engine.latest().unwrap().ready);
    }

    // ---- entry flow ------------------------------------------------------

    #[tokio::test]
    async fn short_entry_arms_then_fires() {
        let h = harness(TradeDirection::Short, MarketType::Futures);

        h.signal.set(69.0);
        tick(&h).await;
        assert_eq!(h.venue.position_amt(), 0.0);

        h.signal.set(71.0);
        tick(&h).await;
        let snap = h.engine.latest().unwrap();
        assert!(snap.armed_short_entry);
        assert_eq!(snap.phase, EnginePhase::WaitingOpenShort);
        assert_eq!(snap.zone, RsiZone::Overbought);
        assert_eq!(h.venue.position_amt(), 0.0);

        h.signal.set(69.0);
        tick(&h).await;
        assert_eq!(h.venue.position_amt(), -1.0);
        let snap = h.engine.latest().unwrap();
        assert!(!snap.armed_short_entry);
        assert!(snap.session_volume > 0.0);
        assert!(snap.trade_log.iter().any(|e| e.kind == "open_short"));
    }

    #[tokio::test]
    async fn long_entry_arms_then_fires() {
        let h = harness(TradeDirection::Long, MarketType::Futures);

        h.signal.set(31.0);
        tick(&h).await;
        h.signal.set(29.0);
        tick(&h).await;
        assert_eq!(
            h.engine.latest().unwrap().phase,
            EnginePhase::WaitingOpenLong
        );

        h.signal.set(31.0);
        tick(&h).await;
        assert_eq!(h.venue.position_amt(), 1.0);
    }

    // ---- stop-loss management --------------------------------------------

    #[tokio::test]
    async fn protective_stop_is_placed_for_open_position() {
        let h = harness(TradeDirection::Long, MarketType::Futures);
        h.venue
            .create_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0))
            .await
            .unwrap();

        h.signal.set(50.0);
        tick(&h).await;

        let stops = h.venue.open_orders();
        assert_eq!(stops.len(), 1);
        let stop = &stops[0];
        assert_eq!(stop.order_type, OrderType::StopMarket);
        assert_eq!(stop.side, Side::Sell);
        assert!(stop.reduce_only);
        // entry 100, stop_loss_pct 0.05, tick 0.1.
        assert!((stop.stop_price.unwrap() - 95.0).abs() < 1e-9);

        let snap = h.engine.latest().unwrap();
        assert_eq!(snap.stop_loss_price, Some(95.0));
        assert!(!snap.kill_switch_engaged);

        // A second tick must not stack another stop.
        tick(&h).await;
        assert_eq!(h.venue.open_orders().len(), 1);
    }

    #[tokio::test]
    async fn kill_switch_closes_long_at_stop_breach() {
        let h = harness(TradeDirection::Long, MarketType::Futures);
        h.venue
            .create_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0))
            .await
            .unwrap();

        // Reference 95.05 is inside stop(95.0) + tick(0.1).
        h.venue.set_mark_price(95.05);
        h.signal.set(50.0);
        tick(&h).await;

        assert_eq!(h.venue.position_amt(), 0.0);
        let snap = h.engine.latest().unwrap();
        assert!(snap.kill_switch_engaged);
        assert!(snap.trade_log.iter().any(|e| e.kind == "kill_switch"));
    }

    #[tokio::test]
    async fn kill_switch_closes_short_at_stop_breach() {
        let h = harness(TradeDirection::Short, MarketType::Futures);
        h.venue
            .create_order(OrderRequest::market("BTCUSDT", Side::Sell, 1.0))
            .await
            .unwrap();

        // Short entry 100: stop 105, trigger at >= 104.9.
        h.venue.set_mark_price(104.95);
        h.signal.set(50.0);
        tick(&h).await;

        assert_eq!(h.venue.position_amt(), 0.0);
        assert!(h.engine.latest().unwrap().kill_switch_engaged);
    }

    #[tokio::test]
    async fn healthy_position_does_not_trip_kill_switch() {
        let h = harness(TradeDirection::Long, MarketType::Futures);
        h.venue
            .create_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0))
            .await
            .unwrap();

        h.venue.set_mark_price(99.0);
        h.signal.set(50.0);
        tick(&h).await;

        assert_eq!(h.venue.position_amt(), 1.0);
        assert!(!h.engine.latest().unwrap().kill_switch_engaged);
    }

    // ---- exit flow -------------------------------------------------------

    #[tokio::test]
    async fn profitable_short_exit_closes_position() {
        let h = harness(TradeDirection::Short, MarketType::Futures);
        // Open a short at 100, then let the market drop: profitable.
        h.venue
            .create_order(OrderRequest::market("BTCUSDT", Side::Sell, 1.0))
            .await
            .unwrap();
        h.venue.set_mark_price(90.0);

        h.signal.set(31.0);
        tick(&h).await;
        h.signal.set(29.0);
        tick(&h).await;
        assert_eq!(
            h.engine.latest().unwrap().phase,
            EnginePhase::WaitingCloseShort
        );

        h.signal.set(31.0);
        tick(&h).await;
        assert_eq!(h.venue.position_amt(), 0.0);
        assert!(h
            .engine
            .latest()
            .unwrap()
            .trade_log
            .iter()
            .any(|e| e.kind == "close"));
    }

    // ---- phase derivation ------------------------------------------------

    #[test]
    fn phase_prefers_disabled_over_everything() {
        let state = SwingState {
            armed_short_entry: true,
            ..SwingState::default()
        };
        let flat = PositionSnapshot::flat("X");
        assert_eq!(
            derive_phase(true, true, &flat, &state),
            EnginePhase::Disabled
        );
        assert_eq!(
            derive_phase(false, false, &flat, &state),
            EnginePhase::Initializing
        );
        assert_eq!(
            derive_phase(false, true, &flat, &state),
            EnginePhase::WaitingOpenShort
        );
    }

    #[test]
    fn zone_thresholds() {
        assert_eq!(derive_zone(None, 70.0, 30.0), RsiZone::Unknown);
        assert_eq!(derive_zone(Some(70.0), 70.0, 30.0), RsiZone::Overbought);
        assert_eq!(derive_zone(Some(30.0), 70.0, 30.0), RsiZone::Oversold);
        assert_eq!(derive_zone(Some(50.0), 70.0, 30.0), RsiZone::Neutral);
    }
}
