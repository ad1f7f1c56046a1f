// =============================================================================
// Paper Exchange — in-process venue with simulated fills
// =============================================================================
//
// Market orders fill instantly at the current mark; stop-market orders rest
// until the mark crosses their trigger. One symbol, one position, no fees.
// Used by demo mode and the engine tests.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::exchange::adapter::{
    AccountCallback, AdapterError, DepthCallback, ExchangeAdapter, KlineCallback, OrderRequest,
    OrdersCallback, Precision, TickerCallback,
};
use crate::types::{
    AccountSnapshot, DepthSnapshot, MarketType, Order, OrderStatus, OrderType, PositionSnapshot,
    Side, TickerSnapshot, FLAT_POSITION_EPS,
};

/// Synthetic half-spread applied around the mark for the depth feed.
const HALF_SPREAD_FRAC: f64 = 5e-5;
/// Synthetic size shown at the touch.
const TOUCH_QTY: f64 = 10.0;

struct PaperState {
    mark_price: f64,
    position_amt: f64,
    entry_price: f64,
    open_orders: Vec<Order>,
    next_order_id: u64,
}

struct PaperInner {
    symbol: String,
    market_type: MarketType,
    precision: Precision,
    state: Mutex<PaperState>,
    account_cbs: Mutex<Vec<AccountCallback>>,
    orders_cbs: Mutex<Vec<OrdersCallback>>,
    depth_cbs: Mutex<Vec<DepthCallback>>,
    ticker_cbs: Mutex<Vec<TickerCallback>>,
    kline_cbs: Mutex<Vec<KlineCallback>>,
}

/// Single-symbol simulated venue.
pub struct PaperExchange {
    inner: Arc<PaperInner>,
}

impl PaperExchange {
    pub fn new(symbol: impl Into<String>, market_type: MarketType, initial_price: f64) -> Self {
        Self {
            inner: Arc::new(PaperInner {
                symbol: symbol.into().to_uppercase(),
                market_type,
                precision: Precision {
                    price_tick: 0.1,
                    qty_step: 0.001,
                },
                state: Mutex::new(PaperState {
                    mark_price: initial_price,
                    position_amt: 0.0,
                    entry_price: 0.0,
                    open_orders: Vec::new(),
                    next_order_id: 1,
                }),
                account_cbs: Mutex::new(Vec::new()),
                orders_cbs: Mutex::new(Vec::new()),
                depth_cbs: Mutex::new(Vec::new()),
                ticker_cbs: Mutex::new(Vec::new()),
                kline_cbs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Move the mark, trigger any resting stops, and push fresh snapshots to
    /// all subscribers.
    pub fn set_mark_price(&self, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }

        let triggered = {
            let mut state = self.inner.state.lock();
            state.mark_price = price;

            let (fired, resting): (Vec<Order>, Vec<Order>) = state
                .open_orders
                .drain(..)
                .partition(|o| stop_triggered(o, price));
            state.open_orders = resting;

            for order in &fired {
                apply_fill(&mut state, order.side, order.orig_qty, price, true);
                info!(
                    order_id = %order.order_id,
                    side = %order.side,
                    stop_price = order.stop_price.unwrap_or(0.0),
                    mark = price,
                    "paper stop order triggered"
                );
            }
            !fired.is_empty()
        };

        self.notify_ticker();
        self.notify_depth();
        self.notify_account();
        if triggered {
            self.notify_orders();
        }
    }

    /// Current signed position amount (test helper).
    pub fn position_amt(&self) -> f64 {
        self.inner.state.lock().position_amt
    }

    /// Currently resting orders (test helper).
    pub fn open_orders(&self) -> Vec<Order> {
        self.inner.state.lock().open_orders.clone()
    }

    /// Deliver a kline to `watch_klines` subscribers (test helper).
    pub fn push_kline(&self, update: crate::exchange::adapter::KlineUpdate) {
        for cb in self.inner.kline_cbs.lock().iter() {
            cb(update);
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot builders & fan-out
    // -------------------------------------------------------------------------

    fn account_snapshot(&self) -> AccountSnapshot {
        let state = self.inner.state.lock();
        let unrealized = (state.mark_price - state.entry_price) * state.position_amt;
        AccountSnapshot {
            market_type: self.inner.market_type,
            positions: vec![PositionSnapshot {
                symbol: self.inner.symbol.clone(),
                position_amt: state.position_amt,
                entry_price: state.entry_price,
                mark_price: state.mark_price,
                unrealized_profit: unrealized,
            }],
            update_time: now_ms(),
        }
    }

    fn depth_snapshot(&self) -> DepthSnapshot {
        let mark = self.inner.state.lock().mark_price;
        let half_spread = mark * HALF_SPREAD_FRAC;
        DepthSnapshot {
            bids: vec![(mark - half_spread, TOUCH_QTY)],
            asks: vec![(mark + half_spread, TOUCH_QTY)],
            update_time: now_ms(),
        }
    }

    fn ticker_snapshot(&self) -> TickerSnapshot {
        TickerSnapshot {
            symbol: self.inner.symbol.clone(),
            last_price: self.inner.state.lock().mark_price,
            update_time: now_ms(),
        }
    }

    fn notify_account(&self) {
        let snap = self.account_snapshot();
        for cb in self.inner.account_cbs.lock().iter() {
            cb(snap.clone());
        }
    }

    fn notify_orders(&self) {
        let orders = self.inner.state.lock().open_orders.clone();
        for cb in self.inner.orders_cbs.lock().iter() {
            cb(orders.clone());
        }
    }

    fn notify_depth(&self) {
        let snap = self.depth_snapshot();
        for cb in self.inner.depth_cbs.lock().iter() {
            cb(snap.clone());
        }
    }

    fn notify_ticker(&self) {
        let snap = self.ticker_snapshot();
        for cb in self.inner.ticker_cbs.lock().iter() {
            cb(snap.clone());
        }
    }
}

/// Whether a resting stop fires at `mark`.
fn stop_triggered(order: &Order, mark: f64) -> bool {
    if order.order_type != OrderType::StopMarket {
        return false;
    }
    let Some(stop) = order.stop_price else {
        return false;
    };
    match order.side {
        Side::Sell => mark <= stop,
        Side::Buy => mark >= stop,
    }
}

/// Apply a fill to the single-symbol position.
///
/// Reduce-only fills are clamped so they can never flip the position.
fn apply_fill(state: &mut PaperState, side: Side, qty: f64, price: f64, reduce_only: bool) {
    let mut signed = match side {
        Side::Buy => qty,
        Side::Sell => -qty,
    };

    if reduce_only {
        if state.position_amt.abs() <= FLAT_POSITION_EPS
            || signed.signum() == state.position_amt.signum()
        {
            return;
        }
        signed = signed.clamp(-state.position_amt.abs(), state.position_amt.abs());
    }

    let old = state.position_amt;
    let new = old + signed;

    if new.abs() <= FLAT_POSITION_EPS {
        state.position_amt = 0.0;
        state.entry_price = 0.0;
        return;
    }

    if old.abs() <= FLAT_POSITION_EPS || old.signum() != new.signum() {
        // Fresh position (or flipped through zero): entry is this fill.
        state.entry_price = price;
    } else if new.abs() > old.abs() {
        // Same direction, increased: volume-weighted entry.
        state.entry_price =
            (state.entry_price * old.abs() + price * (new.abs() - old.abs())) / new.abs();
    }
    // Same direction, reduced: entry unchanged.

    state.position_amt = new;
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn id(&self) -> &str {
        "paper"
    }

    fn watch_account(&self, cb: AccountCallback) {
        cb(self.account_snapshot());
        self.inner.account_cbs.lock().push(cb);
    }

    fn watch_orders(&self, cb: OrdersCallback) {
        cb(self.inner.state.lock().open_orders.clone());
        self.inner.orders_cbs.lock().push(cb);
    }

    fn watch_depth(&self, _symbol: &str, cb: DepthCallback) {
        cb(self.depth_snapshot());
        self.inner.depth_cbs.lock().push(cb);
    }

    fn watch_ticker(&self, _symbol: &str, cb: TickerCallback) {
        cb(self.ticker_snapshot());
        self.inner.ticker_cbs.lock().push(cb);
    }

    fn watch_klines(&self, _symbol: &str, _interval: &str, cb: KlineCallback) {
        self.inner.kline_cbs.lock().push(cb);
    }

    async fn create_order(&self, request: OrderRequest) -> Result<Order, AdapterError> {
        let qty = request.quantity.unwrap_or(0.0);
        if !qty.is_finite() || qty <= 0.0 {
            return Err(AdapterError::Transport(anyhow::anyhow!(
                "invalid order quantity {qty}"
            )));
        }

        let order = {
            let mut state = self.inner.state.lock();
            let order_id = state.next_order_id.to_string();
            state.next_order_id += 1;
            let now = now_ms();

            match request.order_type {
                OrderType::Market => {
                    if state.mark_price <= 0.0 {
                        return Err(AdapterError::Transport(anyhow::anyhow!(
                            "no mark price yet — cannot fill market order"
                        )));
                    }
                    if (request.reduce_only || request.close_position)
                        && state.position_amt.abs() <= FLAT_POSITION_EPS
                    {
                        // Nothing to reduce: the venue would report the order
                        // as unknown.
                        return Err(AdapterError::UnknownOrder);
                    }

                    let mark = state.mark_price;
                    apply_fill(
                        &mut state,
                        request.side,
                        qty,
                        mark,
                        request.reduce_only || request.close_position,
                    );

                    Order {
                        order_id,
                        client_id: request.client_id,
                        symbol: request.symbol,
                        side: request.side,
                        order_type: OrderType::Market,
                        status: OrderStatus::Filled,
                        price: Some(mark),
                        stop_price: None,
                        orig_qty: qty,
                        executed_qty: qty,
                        reduce_only: request.reduce_only,
                        close_position: request.close_position,
                        time: now,
                        update_time: now,
                    }
                }
                OrderType::StopMarket => {
                    let order = Order {
                        order_id,
                        client_id: request.client_id,
                        symbol: request.symbol,
                        side: request.side,
                        order_type: OrderType::StopMarket,
                        status: OrderStatus::New,
                        price: None,
                        stop_price: request.stop_price,
                        orig_qty: qty,
                        executed_qty: 0.0,
                        reduce_only: request.reduce_only,
                        close_position: request.close_position,
                        time: now,
                        update_time: now,
                    };
                    state.open_orders.push(order.clone());
                    order
                }
                other => {
                    return Err(AdapterError::Transport(anyhow::anyhow!(
                        "paper venue does not support {other} orders"
                    )));
                }
            }
        };

        debug!(
            order_id = %order.order_id,
            side = %order.side,
            order_type = %order.order_type,
            qty = order.orig_qty,
            "paper order accepted"
        );

        self.notify_orders();
        self.notify_account();
        Ok(order)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), AdapterError> {
        let removed = {
            let mut state = self.inner.state.lock();
            let before = state.open_orders.len();
            state.open_orders.retain(|o| o.order_id != order_id);
            state.open_orders.len() != before
        };

        if !removed {
            return Err(AdapterError::UnknownOrder);
        }
        self.notify_orders();
        Ok(())
    }

    async fn cancel_orders(&self, symbol: &str, order_ids: &[String]) -> Result<(), AdapterError> {
        for id in order_ids {
            // Individually unknown orders are not an error for a batch cancel.
            let _ = self.cancel_order(symbol, id).await;
        }
        Ok(())
    }

    async fn cancel_all_orders(&self, _symbol: &str) -> Result<(), AdapterError> {
        self.inner.state.lock().open_orders.clear();
        self.notify_orders();
        Ok(())
    }

    async fn query_account_snapshot(&self) -> Result<Option<AccountSnapshot>, AdapterError> {
        Ok(Some(self.account_snapshot()))
    }

    fn precision(&self) -> Option<Precision> {
        Some(self.inner.precision)
    }

    fn supports_trailing_stops(&self) -> bool {
        false
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn venue() -> PaperExchange {
        PaperExchange::new("BTCUSDT", MarketType::Futures, 100.0)
    }

    #[tokio::test]
    async fn market_buy_opens_long_at_mark() {
        let venue = venue();
        let order = venue
            .create_order(OrderRequest::market("BTCUSDT", Side::Buy, 2.0))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.price, Some(100.0));
        assert_eq!(venue.position_amt(), 2.0);
    }

    #[tokio::test]
    async fn adding_to_position_averages_entry() {
        let venue = venue();
        venue
            .create_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0))
            .await
            .unwrap();
        venue.set_mark_price(110.0);
        venue
            .create_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0))
            .await
            .unwrap();

        let acct = venue.query_account_snapshot().await.unwrap().unwrap();
        let pos = acct.position_for("BTCUSDT");
        assert_eq!(pos.position_amt, 2.0);
        assert!((pos.entry_price - 105.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reduce_only_on_flat_is_unknown_order() {
        let venue = venue();
        let mut req = OrderRequest::market("BTCUSDT", Side::Sell, 1.0);
        req.reduce_only = true;
        req.close_position = true;

        let err = venue.create_order(req).await.unwrap_err();
        assert!(matches!(err, AdapterError::UnknownOrder));
    }

    #[tokio::test]
    async fn reduce_only_never_flips_position() {
        let venue = venue();
        venue
            .create_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0))
            .await
            .unwrap();

        let mut req = OrderRequest::market("BTCUSDT", Side::Sell, 5.0);
        req.reduce_only = true;
        venue.create_order(req).await.unwrap();

        assert_eq!(venue.position_amt(), 0.0);
    }

    #[tokio::test]
    async fn sell_stop_triggers_below_stop_price() {
        let venue = venue();
        venue
            .create_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0))
            .await
            .unwrap();
        venue
            .create_order(OrderRequest::stop_market("BTCUSDT", Side::Sell, 95.0, 1.0))
            .await
            .unwrap();
        assert_eq!(venue.open_orders().len(), 1);

        venue.set_mark_price(96.0);
        assert_eq!(venue.open_orders().len(), 1);
        assert_eq!(venue.position_amt(), 1.0);

        venue.set_mark_price(94.9);
        assert!(venue.open_orders().is_empty());
        assert_eq!(venue.position_amt(), 0.0);
    }

    #[tokio::test]
    async fn subscriptions_deliver_initial_snapshot() {
        let venue = venue();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        venue.watch_account(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let h = hits.clone();
        venue.watch_ticker("BTCUSDT", Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let h = hits.clone();
        venue.watch_depth("BTCUSDT", Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let h = hits.clone();
        venue.watch_orders(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancel_unknown_order_errors() {
        let venue = venue();
        let err = venue.cancel_order("BTCUSDT", "999").await.unwrap_err();
        assert!(matches!(err, AdapterError::UnknownOrder));
    }
}
