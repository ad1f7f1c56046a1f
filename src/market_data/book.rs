// =============================================================================
// Local Order Book — incremental diff-stream state for one symbol
// =============================================================================
//
// Levels are keyed by numeric price but retain the venue's canonical price
// string, so the key stays tick-exact and deletes always hit the level the
// venue addressed. Quantity 0 deletes a level; stored quantities are strictly
// positive.
//
// Diff sequencing contract (`U` = first_update_id, `u` = final_update_id):
//   - applied exactly when U <= local_last_update_id + 1 <= u
//   - u <= local_last_update_id  => stale duplicate, dropped
//   - U >  local_last_update_id + 1 => gap, caller must re-bootstrap
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Price key
// ---------------------------------------------------------------------------

/// Numeric price key with a total order (BTreeMap requires `Ord`).
#[derive(Debug, Clone, Copy, PartialEq)]
struct PriceKey(f64);

impl Eq for PriceKey {}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// One stored book level: canonical price string plus parsed views.
#[derive(Debug, Clone)]
struct BookLevel {
    price_raw: String,
    qty: f64,
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// One incremental update from the diff stream.
#[derive(Debug, Clone)]
pub struct DepthDiffEvent {
    pub first_update_id: u64,
    pub final_update_id: u64,
    /// `(canonical price string, quantity)`; quantity 0 deletes.
    pub bids: Vec<(String, f64)>,
    pub asks: Vec<(String, f64)>,
}

/// Full book snapshot from the REST endpoint.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<(String, f64)>,
    pub asks: Vec<(String, f64)>,
}

/// Outcome of applying one diff event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Event consumed, book advanced to its `final_update_id`.
    Applied,
    /// Duplicate or stale event (`u <= local`), dropped without effect.
    Stale,
    /// Sequence hole (`U > local + 1`); the book can no longer be trusted.
    Gap,
}

// ---------------------------------------------------------------------------
// Imbalance summary
// ---------------------------------------------------------------------------

/// Which side dominates near-touch liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Imbalance {
    BuyDominant,
    SellDominant,
    Balanced,
}

/// Near-touch liquidity summary over a basis-point window around the touch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImbalanceSummary {
    /// Bid quantity at price >= best_bid * (1 - window_bps/10_000).
    pub buy_sum: f64,
    /// Ask quantity at price <= best_ask * (1 + window_bps/10_000).
    pub sell_sum: f64,
    pub skip_buy_side: bool,
    pub skip_sell_side: bool,
    pub imbalance: Imbalance,
}

/// Lowest dominance ratio that still means anything; configs below are raised.
const MIN_IMBALANCE_RATIO: f64 = 1.01;

// ---------------------------------------------------------------------------
// Order book
// ---------------------------------------------------------------------------

/// Incremental local order book for a single symbol.
#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BTreeMap<PriceKey, BookLevel>,
    asks: BTreeMap<PriceKey, BookLevel>,
    last_update_id: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids
            .iter()
            .next_back()
            .map(|(k, l)| (k.0, l.qty))
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.iter().next().map(|(k, l)| (k.0, l.qty))
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some((b, _)), Some((a, _))) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    /// Top `n` levels per side, best first, with the venue's canonical price
    /// strings (tick-exact, suitable for republication).
    pub fn top_levels_raw(&self, n: usize) -> (Vec<(String, f64)>, Vec<(String, f64)>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(n)
            .map(|(_, l)| (l.price_raw.clone(), l.qty))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(n)
            .map(|(_, l)| (l.price_raw.clone(), l.qty))
            .collect();
        (bids, asks)
    }

    /// Top `n` levels per side, best first, as `(price, qty)` pairs.
    pub fn top_levels(&self, n: usize) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(n)
            .map(|(k, l)| (k.0, l.qty))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(n)
            .map(|(k, l)| (k.0, l.qty))
            .collect();
        (bids, asks)
    }

    /// Discard all state and load a REST snapshot.
    pub fn reset(&mut self, snapshot: &BookSnapshot) {
        self.bids.clear();
        self.asks.clear();
        apply_levels(&mut self.bids, &snapshot.bids);
        apply_levels(&mut self.asks, &snapshot.asks);
        self.last_update_id = snapshot.last_update_id;
    }

    /// Apply one diff event under the sequencing contract.
    pub fn apply(&mut self, event: &DepthDiffEvent) -> ApplyOutcome {
        if event.final_update_id <= self.last_update_id {
            return ApplyOutcome::Stale;
        }
        if event.first_update_id > self.last_update_id + 1 {
            return ApplyOutcome::Gap;
        }

        apply_levels(&mut self.bids, &event.bids);
        apply_levels(&mut self.asks, &event.asks);
        self.last_update_id = event.final_update_id;
        ApplyOutcome::Applied
    }

    /// Summarise near-touch liquidity over `window_bps` around the touch.
    ///
    /// `ratio` is the dominance multiple for the skip flags, floored at 1.01.
    pub fn imbalance(&self, window_bps: f64, ratio: f64) -> ImbalanceSummary {
        let ratio = ratio.max(MIN_IMBALANCE_RATIO);
        let window = window_bps.max(0.0) / 10_000.0;

        let buy_sum = match self.best_bid() {
            Some((best, _)) => {
                let floor = best * (1.0 - window);
                self.bids
                    .iter()
                    .rev()
                    .take_while(|(k, _)| k.0 >= floor)
                    .map(|(_, l)| l.qty)
                    .sum()
            }
            None => 0.0,
        };

        let sell_sum = match self.best_ask() {
            Some((best, _)) => {
                let ceil = best * (1.0 + window);
                self.asks
                    .iter()
                    .take_while(|(k, _)| k.0 <= ceil)
                    .map(|(_, l)| l.qty)
                    .sum()
            }
            None => 0.0,
        };

        let skip_sell_side = sell_sum == 0.0 || buy_sum > sell_sum * ratio;
        let skip_buy_side = buy_sum == 0.0 || sell_sum > buy_sum * ratio;

        let imbalance = if buy_sum > sell_sum * ratio {
            Imbalance::BuyDominant
        } else if sell_sum > buy_sum * ratio {
            Imbalance::SellDominant
        } else {
            Imbalance::Balanced
        };

        ImbalanceSummary {
            buy_sum,
            sell_sum,
            skip_buy_side,
            skip_sell_side,
            imbalance,
        }
    }
}

/// Upsert `(price, qty)` pairs into one side; qty <= 0 deletes, NaN is dropped.
fn apply_levels(side: &mut BTreeMap<PriceKey, BookLevel>, levels: &[(String, f64)]) {
    for (price_raw, qty) in levels {
        let Ok(price) = price_raw.parse::<f64>() else {
            continue;
        };
        if !price.is_finite() || !qty.is_finite() {
            continue;
        }
        let key = PriceKey(price);
        if *qty <= 0.0 {
            side.remove(&key);
        } else {
            side.insert(
                key,
                BookLevel {
                    price_raw: price_raw.clone(),
                    qty: *qty,
                },
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn levels(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(p, q)| (p.to_string(), *q)).collect()
    }

    fn seeded_book() -> OrderBook {
        let mut book = OrderBook::new();
        book.reset(&BookSnapshot {
            last_update_id: 100,
            bids: levels(&[("100.0", 2.0), ("99.5", 3.0), ("99.0", 5.0)]),
            asks: levels(&[("100.5", 1.0), ("101.0", 4.0), ("101.5", 6.0)]),
        });
        book
    }

    fn event(first: u64, last: u64) -> DepthDiffEvent {
        DepthDiffEvent {
            first_update_id: first,
            final_update_id: last,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    // ---- sequencing ------------------------------------------------------

    #[test]
    fn applied_events_advance_last_update_id() {
        let mut book = seeded_book();
        assert_eq!(book.apply(&event(101, 105)), ApplyOutcome::Applied);
        assert_eq!(book.last_update_id(), 105);
        assert_eq!(book.apply(&event(106, 110)), ApplyOutcome::Applied);
        assert_eq!(book.last_update_id(), 110);
    }

    #[test]
    fn overlapping_range_is_applied() {
        // U <= local + 1 <= u with U behind local is fine (snapshot overlap).
        let mut book = seeded_book();
        assert_eq!(book.apply(&event(95, 103)), ApplyOutcome::Applied);
        assert_eq!(book.last_update_id(), 103);
    }

    #[test]
    fn duplicate_event_is_a_noop() {
        let mut book = seeded_book();
        let before = book.best_bid();
        assert_eq!(book.apply(&event(90, 100)), ApplyOutcome::Stale);
        assert_eq!(book.apply(&event(100, 100)), ApplyOutcome::Stale);
        assert_eq!(book.last_update_id(), 100);
        assert_eq!(book.best_bid(), before);
    }

    #[test]
    fn sequence_hole_reports_gap() {
        let mut book = seeded_book();
        assert_eq!(book.apply(&event(110, 120)), ApplyOutcome::Gap);
        // Gap must not mutate anything.
        assert_eq!(book.last_update_id(), 100);
    }

    // ---- level maintenance -----------------------------------------------

    #[test]
    fn zero_quantity_deletes_level() {
        let mut book = seeded_book();
        let mut ev = event(101, 101);
        ev.bids = levels(&[("100.0", 0.0)]);
        assert_eq!(book.apply(&ev), ApplyOutcome::Applied);
        assert_eq!(book.best_bid(), Some((99.5, 3.0)));
    }

    #[test]
    fn no_zero_or_negative_quantities_stored() {
        let mut book = OrderBook::new();
        book.reset(&BookSnapshot {
            last_update_id: 1,
            bids: levels(&[("100.0", 0.0), ("99.0", -1.0), ("98.0", 2.0)]),
            asks: levels(&[("101.0", 1.0)]),
        });
        assert_eq!(book.best_bid(), Some((98.0, 2.0)));
    }

    #[test]
    fn malformed_prices_are_skipped() {
        let mut book = seeded_book();
        let mut ev = event(101, 101);
        ev.asks = levels(&[("not-a-price", 1.0), ("100.4", 2.5)]);
        assert_eq!(book.apply(&ev), ApplyOutcome::Applied);
        assert_eq!(book.best_ask(), Some((100.4, 2.5)));
    }

    #[test]
    fn best_bid_below_best_ask() {
        let book = seeded_book();
        let (bid, _) = book.best_bid().unwrap();
        let (ask, _) = book.best_ask().unwrap();
        assert!(bid < ask);
        assert_eq!(book.mid_price(), Some((100.0 + 100.5) / 2.0));
    }

    #[test]
    fn top_levels_are_best_first() {
        let book = seeded_book();
        let (bids, asks) = book.top_levels(2);
        assert_eq!(bids, vec![(100.0, 2.0), (99.5, 3.0)]);
        assert_eq!(asks, vec![(100.5, 1.0), (101.0, 4.0)]);
    }

    // ---- imbalance -------------------------------------------------------

    #[test]
    fn window_includes_only_near_touch_levels() {
        let mut book = OrderBook::new();
        book.reset(&BookSnapshot {
            last_update_id: 1,
            // 9 bps below 10000.0 is 9991.0: the 9992 level is in, 9950 out.
            bids: levels(&[("10000.0", 1.0), ("9992.0", 2.0), ("9950.0", 50.0)]),
            // 9 bps above 10000.5 is ~10009.5: 10008 in, 10100 out.
            asks: levels(&[("10000.5", 1.5), ("10008.0", 2.5), ("10100.0", 80.0)]),
        });

        let s = book.imbalance(9.0, 2.0);
        assert!((s.buy_sum - 3.0).abs() < 1e-12);
        assert!((s.sell_sum - 4.0).abs() < 1e-12);
        assert!(!s.skip_buy_side);
        assert!(!s.skip_sell_side);
        assert_eq!(s.imbalance, Imbalance::Balanced);
    }

    #[test]
    fn dominance_sets_skip_flags() {
        let mut book = OrderBook::new();
        book.reset(&BookSnapshot {
            last_update_id: 1,
            bids: levels(&[("100.0", 10.0)]),
            asks: levels(&[("100.1", 1.0)]),
        });

        let s = book.imbalance(9.0, 2.0);
        assert_eq!(s.imbalance, Imbalance::BuyDominant);
        assert!(s.skip_sell_side);
        assert!(!s.skip_buy_side);
    }

    #[test]
    fn empty_side_sets_both_zero_sums_and_skips() {
        let book = OrderBook::new();
        let s = book.imbalance(9.0, 2.0);
        assert_eq!(s.buy_sum, 0.0);
        assert_eq!(s.sell_sum, 0.0);
        assert!(s.skip_buy_side);
        assert!(s.skip_sell_side);
        assert_eq!(s.imbalance, Imbalance::Balanced);
    }

    #[test]
    fn skip_flags_symmetric_under_side_swap() {
        let mut a = OrderBook::new();
        a.reset(&BookSnapshot {
            last_update_id: 1,
            bids: levels(&[("100.0", 7.0)]),
            asks: levels(&[("100.1", 2.0)]),
        });
        let mut b = OrderBook::new();
        b.reset(&BookSnapshot {
            last_update_id: 1,
            bids: levels(&[("100.0", 2.0)]),
            asks: levels(&[("100.1", 7.0)]),
        });

        let sa = a.imbalance(9.0, 2.0);
        let sb = b.imbalance(9.0, 2.0);
        assert_eq!(sa.skip_sell_side, sb.skip_buy_side);
        assert_eq!(sa.skip_buy_side, sb.skip_sell_side);
        assert_eq!(sa.imbalance, Imbalance::BuyDominant);
        assert_eq!(sb.imbalance, Imbalance::SellDominant);
    }

    #[test]
    fn ratio_is_floored() {
        let mut book = OrderBook::new();
        book.reset(&BookSnapshot {
            last_update_id: 1,
            bids: levels(&[("100.0", 1.005)]),
            asks: levels(&[("100.1", 1.0)]),
        });

        // ratio 0.5 would make the bid side dominant; the floor keeps 1.01.
        let s = book.imbalance(9.0, 0.5);
        assert_eq!(s.imbalance, Imbalance::Balanced);
        assert!(!s.skip_sell_side);
    }

    #[test]
    fn raw_levels_keep_canonical_price_strings() {
        let mut book = OrderBook::new();
        book.reset(&BookSnapshot {
            last_update_id: 1,
            bids: levels(&[("100.50", 1.0), ("100.00", 2.0)]),
            asks: levels(&[("101.00", 3.0)]),
        });
        let (bids, asks) = book.top_levels_raw(5);
        assert_eq!(bids[0], ("100.50".to_string(), 1.0));
        assert_eq!(bids[1], ("100.00".to_string(), 2.0));
        assert_eq!(asks[0], ("101.00".to_string(), 3.0));
    }
}
