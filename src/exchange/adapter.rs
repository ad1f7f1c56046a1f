// =============================================================================
// Exchange Adapter contract — the only venue surface the engine consumes
// =============================================================================
//
// Each `watch_*` subscription must deliver at least one full snapshot when it
// is installed, then re-invoke the callback on every update. Callbacks receive
// value copies; the adapter must never hand out references into its own state.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{AccountSnapshot, DepthSnapshot, Order, OrderType, Side, TickerSnapshot};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Typed failures from adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Venue backoff signal (HTTP 429 or equivalent).
    #[error("venue rate limit hit: {reason}")]
    RateLimited { reason: String },

    /// The venue does not know the referenced order (already filled or
    /// cancelled elsewhere).
    #[error("unknown order")]
    UnknownOrder,

    /// Anything transport-shaped: connection failures, 5xx, parse errors.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Requests & auxiliary types
// ---------------------------------------------------------------------------

/// Parameters for `create_order`.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub client_id: Option<String>,
}

impl OrderRequest {
    /// A plain market order.
    pub fn market(symbol: impl Into<String>, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity: Some(quantity),
            price: None,
            stop_price: None,
            reduce_only: false,
            close_position: false,
            client_id: None,
        }
    }

    /// A reduce-only stop-market order.
    pub fn stop_market(
        symbol: impl Into<String>,
        side: Side,
        stop_price: f64,
        quantity: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::StopMarket,
            quantity: Some(quantity),
            price: None,
            stop_price: Some(stop_price),
            reduce_only: true,
            close_position: false,
            client_id: None,
        }
    }
}

/// Venue tick/step sizes, when the adapter knows them.
#[derive(Debug, Clone, Copy)]
pub struct Precision {
    pub price_tick: f64,
    pub qty_step: f64,
}

/// One live kline delivered by `watch_klines`.
#[derive(Debug, Clone, Copy)]
pub struct KlineUpdate {
    pub open_time: i64,
    pub close: f64,
    pub is_closed: bool,
}

// ---------------------------------------------------------------------------
// Callback aliases
// ---------------------------------------------------------------------------

pub type AccountCallback = Arc<dyn Fn(AccountSnapshot) + Send + Sync>;
pub type OrdersCallback = Arc<dyn Fn(Vec<Order>) + Send + Sync>;
pub type DepthCallback = Arc<dyn Fn(DepthSnapshot) + Send + Sync>;
pub type TickerCallback = Arc<dyn Fn(TickerSnapshot) + Send + Sync>;
pub type KlineCallback = Arc<dyn Fn(KlineUpdate) + Send + Sync>;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// The abstract venue surface the swing engine is written against.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Short stable identifier, e.g. `"paper"` or `"binance-futures"`.
    fn id(&self) -> &str;

    fn watch_account(&self, cb: AccountCallback);
    fn watch_orders(&self, cb: OrdersCallback);
    fn watch_depth(&self, symbol: &str, cb: DepthCallback);
    fn watch_ticker(&self, symbol: &str, cb: TickerCallback);
    fn watch_klines(&self, symbol: &str, interval: &str, cb: KlineCallback);

    async fn create_order(&self, request: OrderRequest) -> Result<Order, AdapterError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), AdapterError>;
    async fn cancel_orders(&self, symbol: &str, order_ids: &[String]) -> Result<(), AdapterError>;
    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), AdapterError>;

    /// Polled fallback when the account stream is quiet.
    async fn query_account_snapshot(&self) -> Result<Option<AccountSnapshot>, AdapterError>;

    /// Venue tick/step sizes, when known.
    fn precision(&self) -> Option<Precision>;

    fn supports_trailing_stops(&self) -> bool;
}
