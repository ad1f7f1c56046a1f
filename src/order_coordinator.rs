// =============================================================================
// Order Coordinator — per-slot submission locks, slippage guards, debounce
// =============================================================================
//
// At most one in-flight submission per logical slot (entry, stop). A lock is
// taken before the submit call and released when the order-update feed shows
// the recorded order out of the open set, or when the deadline expires so a
// dropped response cannot wedge a slot forever.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::exchange::{AdapterError, ExchangeAdapter, OrderRequest};
use crate::types::{Order, OrderStatus, Side};

// ---------------------------------------------------------------------------
// Slots, errors, guards
// ---------------------------------------------------------------------------

/// Logical submission channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderSlot {
    Entry,
    Stop,
}

impl std::fmt::Display for OrderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "entry"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// Failures surfaced to the engine.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("slot {0} is locked by an in-flight submission")]
    SlotBusy(OrderSlot),

    #[error("slippage guard tripped: reference {reference} vs expected {expected} (max {max_pct})")]
    SlippageExceeded {
        reference: f64,
        expected: f64,
        max_pct: f64,
    },

    #[error("quantity {0} quantises to zero")]
    ZeroQuantity(f64),

    #[error("venue rate limit: {reason}")]
    RateLimited { reason: String },

    #[error("unknown order")]
    UnknownOrder,

    #[error("unexpected order status {0:?}")]
    UnexpectedStatus(OrderStatus),

    #[error("order transport failure: {0}")]
    Transport(String),
}

impl From<AdapterError> for OrderError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::RateLimited { reason } => Self::RateLimited { reason },
            AdapterError::UnknownOrder => Self::UnknownOrder,
            AdapterError::Transport(e) => Self::Transport(e.to_string()),
        }
    }
}

/// Pre-submission price sanity check.
///
/// `reference` is the live mark; `expected` the price the decision was made
/// at. A buy is rejected when the market ran up past the tolerance, a sell
/// when it ran down.
#[derive(Debug, Clone, Copy)]
pub struct SlippageGuard {
    pub reference: f64,
    pub expected: f64,
    pub max_pct: f64,
}

impl SlippageGuard {
    fn check(&self, side: Side) -> Result<(), OrderError> {
        if !self.reference.is_finite() || !self.expected.is_finite() || self.expected <= 0.0 {
            // Nothing to compare against; let the venue decide.
            return Ok(());
        }

        let tripped = match side {
            Side::Buy => self.reference > self.expected * (1.0 + self.max_pct),
            Side::Sell => self.reference < self.expected * (1.0 - self.max_pct),
        };

        if tripped {
            return Err(OrderError::SlippageExceeded {
                reference: self.reference,
                expected: self.expected,
                max_pct: self.max_pct,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct SlotLock {
    pending_order_id: Option<String>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct LastStop {
    side: Side,
    stop_price: f64,
    at: Instant,
}

/// Coordinates order submissions for one symbol.
pub struct OrderCoordinator {
    adapter: Arc<dyn ExchangeAdapter>,
    clock: Arc<dyn Clock>,
    symbol: String,
    qty_step: f64,
    price_tick: f64,
    lock_ttl: Duration,
    stop_debounce: Duration,
    locks: Mutex<HashMap<OrderSlot, SlotLock>>,
    last_stop: Mutex<Option<LastStop>>,
}

impl OrderCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        clock: Arc<dyn Clock>,
        symbol: impl Into<String>,
        qty_step: f64,
        price_tick: f64,
        lock_ttl: Duration,
        stop_debounce: Duration,
    ) -> Self {
        Self {
            adapter,
            clock,
            symbol: symbol.into(),
            qty_step,
            price_tick,
            lock_ttl,
            stop_debounce,
            locks: Mutex::new(HashMap::new()),
            last_stop: Mutex::new(None),
        }
    }

    /// Whether `slot` currently holds an unexpired lock.
    pub fn is_locked(&self, slot: OrderSlot) -> bool {
        let now = self.clock.now();
        self.locks
            .lock()
            .get(&slot)
            .map_or(false, |l| l.expires_at > now)
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Submit a market order through `slot`.
    ///
    /// Succeeds once the venue confirms the order as NEW or FILLED; the slot
    /// stays locked until lock reconciliation sees the order leave the open
    /// set (or the deadline expires).
    pub async fn place_market_order(
        &self,
        side: Side,
        qty: f64,
        slot: OrderSlot,
        guard: SlippageGuard,
    ) -> Result<Order, OrderError> {
        guard.check(side)?;

        let qty = quantize_down(qty, self.qty_step);
        if qty <= 0.0 {
            return Err(OrderError::ZeroQuantity(qty));
        }

        self.acquire(slot)?;

        let request = OrderRequest {
            client_id: Some(Uuid::new_v4().to_string()),
            ..OrderRequest::market(self.symbol.clone(), side, qty)
        };

        match self.adapter.create_order(request).await {
            Ok(order) => self.confirm(slot, order),
            Err(e) => {
                self.release(slot);
                warn!(slot = %slot, side = %side, error = %e, "market order failed");
                Err(e.into())
            }
        }
    }

    /// Close (part of) a position at market, reduce-only.
    ///
    /// `Ok(None)` means the venue did not know the order — the position was
    /// already closed elsewhere, which close paths treat as success.
    pub async fn market_close(
        &self,
        side: Side,
        qty: f64,
        guard: SlippageGuard,
    ) -> Result<Option<Order>, OrderError> {
        guard.check(side)?;

        let qty = quantize_down(qty, self.qty_step);
        if qty <= 0.0 {
            return Err(OrderError::ZeroQuantity(qty));
        }

        let mut request = OrderRequest::market(self.symbol.clone(), side, qty);
        request.reduce_only = true;
        request.close_position = true;
        request.client_id = Some(Uuid::new_v4().to_string());

        match self.adapter.create_order(request).await {
            Ok(order) => {
                info!(side = %side, qty, order_id = %order.order_id, "position closed at market");
                Ok(Some(order))
            }
            Err(AdapterError::UnknownOrder) => {
                debug!(side = %side, "close reported unknown order — already flat");
                Ok(None)
            }
            Err(e) => {
                warn!(side = %side, error = %e, "market close failed");
                Err(e.into())
            }
        }
    }

    /// Place a reduce-only stop-market order through the stop slot.
    ///
    /// Identical submissions (same side, stop within one tick) inside the
    /// debounce window return `Ok(None)` without touching the venue.
    pub async fn place_stop_loss_order(
        &self,
        side: Side,
        stop_price: f64,
        qty: f64,
        _reference_price: f64,
        guard: SlippageGuard,
    ) -> Result<Option<Order>, OrderError> {
        let stop_price = quantize_nearest(stop_price, self.price_tick);
        let now = self.clock.now();

        if let Some(last) = *self.last_stop.lock() {
            if last.side == side
                && (last.stop_price - stop_price).abs() <= self.price_tick
                && now.duration_since(last.at) < self.stop_debounce
            {
                debug!(side = %side, stop_price, "duplicate stop submission debounced");
                return Ok(None);
            }
        }

        guard.check(side)?;

        let qty = quantize_down(qty, self.qty_step);
        if qty <= 0.0 {
            return Err(OrderError::ZeroQuantity(qty));
        }

        self.acquire(OrderSlot::Stop)?;

        let request = OrderRequest {
            client_id: Some(Uuid::new_v4().to_string()),
            ..OrderRequest::stop_market(self.symbol.clone(), side, stop_price, qty)
        };

        match self.adapter.create_order(request).await {
            Ok(order) => {
                *self.last_stop.lock() = Some(LastStop {
                    side,
                    stop_price,
                    at: now,
                });
                self.confirm(OrderSlot::Stop, order).map(Some)
            }
            Err(e) => {
                self.release(OrderSlot::Stop);
                warn!(side = %side, stop_price, error = %e, "stop order failed");
                Err(e.into())
            }
        }
    }

    /// Release slot locks against the latest open-order feed.
    ///
    /// A lock is released when its recorded order id is no longer in
    /// `{NEW, PARTIALLY_FILLED}`, when no match exists, or on expiry.
    pub fn reconcile(&self, open_orders: &[Order]) {
        let now = self.clock.now();
        let mut locks = self.locks.lock();

        locks.retain(|slot, lock| {
            if lock.expires_at <= now {
                warn!(slot = %slot, "order slot lock expired — releasing");
                return false;
            }

            let Some(pending) = &lock.pending_order_id else {
                // Submission still in flight; only expiry can release.
                return true;
            };

            match open_orders.iter().find(|o| &o.order_id == pending) {
                Some(order) if order.status.is_open() => true,
                Some(order) => {
                    debug!(slot = %slot, order_id = %pending, status = ?order.status, "lock released (terminal state)");
                    false
                }
                None => {
                    debug!(slot = %slot, order_id = %pending, "lock released (order left open set)");
                    false
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // Lock internals
    // -------------------------------------------------------------------------

    fn acquire(&self, slot: OrderSlot) -> Result<(), OrderError> {
        let now = self.clock.now();
        let mut locks = self.locks.lock();

        if let Some(existing) = locks.get(&slot) {
            if existing.expires_at > now {
                return Err(OrderError::SlotBusy(slot));
            }
        }

        locks.insert(
            slot,
            SlotLock {
                pending_order_id: None,
                expires_at: now + self.lock_ttl,
            },
        );
        Ok(())
    }

    fn release(&self, slot: OrderSlot) {
        self.locks.lock().remove(&slot);
    }

    /// Record the order id behind a held lock and validate the venue status.
    fn confirm(&self, slot: OrderSlot, order: Order) -> Result<Order, OrderError> {
        match order.status {
            OrderStatus::New | OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                if let Some(lock) = self.locks.lock().get_mut(&slot) {
                    lock.pending_order_id = Some(order.order_id.clone());
                }
                info!(
                    slot = %slot,
                    order_id = %order.order_id,
                    side = %order.side,
                    status = ?order.status,
                    "order confirmed"
                );
                Ok(order)
            }
            other => {
                self.release(slot);
                Err(OrderError::UnexpectedStatus(other))
            }
        }
    }
}

/// Quantise down to a multiple of `step` (order quantities must never round
/// up past available size).
fn quantize_down(value: f64, step: f64) -> f64 {
    if step <= 0.0 || !value.is_finite() {
        return value;
    }
    (value / step).floor() * step
}

/// Quantise to the nearest multiple of `step` (prices snap to the tick).
fn quantize_nearest(value: f64, step: f64) -> f64 {
    if step <= 0.0 || !value.is_finite() {
        return value;
    }
    (value / step).round() * step
}
