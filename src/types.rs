// =============================================================================
// Shared types used across the Vela swing engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Positions with |amount| at or below this are treated as flat.
pub const FLAT_POSITION_EPS: f64 = 1e-5;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side that closes a position opened on `self`.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type as the venue understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::StopMarket => write!(f, "STOP_MARKET"),
            Self::TakeProfitMarket => write!(f, "TAKE_PROFIT_MARKET"),
        }
    }
}

/// Venue-side order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// An order still resting (or partially working) on the venue.
    pub fn is_open(self) -> bool {
        matches!(self, Self::New | Self::PartiallyFilled)
    }
}

/// A single order as reported by the exchange adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub status: OrderStatus,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    pub orig_qty: f64,
    #[serde(default)]
    pub executed_qty: f64,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
    /// Creation time, epoch millis.
    pub time: i64,
    /// Last update time, epoch millis.
    pub update_time: i64,
}

/// A single position as reported by the exchange adapter.
///
/// `position_amt` is signed: positive long, negative short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub position_amt: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_profit: f64,
}

impl PositionSnapshot {
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            position_amt: 0.0,
            entry_price: 0.0,
            mark_price: 0.0,
            unrealized_profit: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.position_amt.abs() <= FLAT_POSITION_EPS
    }
}

/// Spot venues cannot hold short positions; the engine refuses short-capable
/// direction configs against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Futures,
}

/// Full account snapshot delivered by the adapter's account stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub market_type: MarketType,
    #[serde(default)]
    pub positions: Vec<PositionSnapshot>,
    /// Epoch millis of the venue-side event, if known.
    #[serde(default)]
    pub update_time: i64,
}

impl AccountSnapshot {
    /// Position for `symbol`, or a flat placeholder when absent.
    pub fn position_for(&self, symbol: &str) -> PositionSnapshot {
        self.positions
            .iter()
            .find(|p| p.symbol == symbol)
            .cloned()
            .unwrap_or_else(|| PositionSnapshot::flat(symbol))
    }
}

/// Latest trade / mark price for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: String,
    pub last_price: f64,
    /// Epoch millis.
    pub update_time: i64,
}

/// Top-of-book depth delivered by the adapter's depth stream.
///
/// Levels are `(price, quantity)`, best first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepthSnapshot {
    #[serde(default)]
    pub bids: Vec<(f64, f64)>,
    #[serde(default)]
    pub asks: Vec<(f64, f64)>,
    #[serde(default)]
    pub update_time: i64,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|(p, _)| *p)
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }
}

/// Which sides the swing strategy is allowed to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Long,
    Short,
    Both,
}

impl TradeDirection {
    pub fn allows_long(self) -> bool {
        matches!(self, Self::Long | Self::Both)
    }

    pub fn allows_short(self) -> bool {
        matches!(self, Self::Short | Self::Both)
    }
}

impl Default for TradeDirection {
    fn default() -> Self {
        Self::Short
    }
}

impl std::fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// One line of the engine's in-memory trade log (shown in snapshots).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLogEntry {
    /// ISO 8601 timestamp.
    pub at: String,
    pub kind: String,
    pub detail: String,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_and_serde() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        let s: Side = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(s, Side::Sell);
    }

    #[test]
    fn order_status_open_predicate() {
        assert!(OrderStatus::New.is_open());
        assert!(OrderStatus::PartiallyFilled.is_open());
        assert!(!OrderStatus::Filled.is_open());
        assert!(!OrderStatus::Canceled.is_open());
        assert!(!OrderStatus::Rejected.is_open());
    }

    #[test]
    fn position_flat_threshold() {
        let mut pos = PositionSnapshot::flat("BTCUSDT");
        assert!(pos.is_flat());
        pos.position_amt = 9e-6;
        assert!(pos.is_flat());
        pos.position_amt = -2e-5;
        assert!(!pos.is_flat());
    }

    #[test]
    fn direction_permissions() {
        assert!(TradeDirection::Both.allows_long());
        assert!(TradeDirection::Both.allows_short());
        assert!(TradeDirection::Long.allows_long());
        assert!(!TradeDirection::Long.allows_short());
        assert!(!TradeDirection::Short.allows_long());
        assert!(TradeDirection::Short.allows_short());
        assert_eq!(TradeDirection::default(), TradeDirection::Short);
    }

    #[test]
    fn depth_snapshot_mid() {
        let depth = DepthSnapshot {
            bids: vec![(99.0, 1.0)],
            asks: vec![(101.0, 2.0)],
            update_time: 0,
        };
        assert_eq!(depth.mid_price(), Some(100.0));
        assert_eq!(DepthSnapshot::default().mid_price(), None);
    }

    #[test]
    fn account_position_lookup_defaults_flat() {
        let acct = AccountSnapshot {
            market_type: MarketType::Futures,
            positions: vec![PositionSnapshot {
                symbol: "ETHUSDT".into(),
                position_amt: -1.5,
                entry_price: 2000.0,
                mark_price: 1990.0,
                unrealized_profit: 15.0,
            }],
            update_time: 0,
        };
        assert_eq!(acct.position_for("ETHUSDT").position_amt, -1.5);
        assert!(acct.position_for("BTCUSDT").is_flat());
    }
}
