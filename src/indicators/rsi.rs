// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing, incremental
// =============================================================================
//
// RSI measures the speed and magnitude of recent price changes to evaluate
// whether an asset is overbought or oversold.
//
// Step 1 — Compute price changes (deltas) from consecutive closes.
// Step 2 — Seed average gain / average loss with the SMA of the first `period`
//          gains / losses.
// Step 3 — Apply Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// This implementation is incremental: `add` feeds one close at a time, and
// `replace` swaps the most recent close in place. Replace restores the exact
// smoothing state saved before the last `add` and re-applies, so repeated
// intra-bar updates of the forming candle never bias the averages.
// =============================================================================

/// Smoothing state saved before each `add`, restored on `replace`.
#[derive(Debug, Clone, Copy)]
struct Rollback {
    samples: usize,
    prev_close: f64,
    avg_gain: f64,
    avg_loss: f64,
}

/// Incremental Wilder RSI over a stream of close prices.
///
/// The value becomes available (`is_stable`) once `period + 1` closes have
/// been fed — `period` deltas seed the averages.
#[derive(Debug, Clone)]
pub struct WilderRsi {
    period: usize,
    /// Number of closes fed so far.
    samples: usize,
    prev_close: f64,
    /// Gain/loss sums while seeding, Wilder-smoothed averages afterwards.
    avg_gain: f64,
    avg_loss: f64,
    last: Option<Rollback>,
}

impl WilderRsi {
    /// Create a new RSI tracker. `period` must be at least 1.
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            samples: 0,
            prev_close: 0.0,
            avg_gain: 0.0,
            avg_loss: 0.0,
            last: None,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// True once enough closes have been fed to produce a value.
    pub fn is_stable(&self) -> bool {
        self.samples >= self.period + 1
    }

    /// Feed a new bar's close. Non-finite inputs are ignored.
    pub fn add(&mut self, close: f64) {
        if !close.is_finite() {
            return;
        }

        self.last = Some(Rollback {
            samples: self.samples,
            prev_close: self.prev_close,
            avg_gain: self.avg_gain,
            avg_loss: self.avg_loss,
        });

        if self.samples == 0 {
            self.prev_close = close;
            self.samples = 1;
            return;
        }

        let delta = close - self.prev_close;
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        let period_f = self.period as f64;

        if self.samples <= self.period {
            // Seeding: this is delta number `samples` of the first `period`.
            self.avg_gain += gain;
            self.avg_loss += loss;
            if self.samples == self.period {
                self.avg_gain /= period_f;
                self.avg_loss /= period_f;
            }
        } else {
            self.avg_gain = (self.avg_gain * (period_f - 1.0) + gain) / period_f;
            self.avg_loss = (self.avg_loss * (period_f - 1.0) + loss) / period_f;
        }

        self.prev_close = close;
        self.samples += 1;
    }

    /// Replace the most recent close in place (forming-bar update).
    ///
    /// Restores the smoothing state saved before the last `add`, then
    /// re-applies with `close`. Without a prior sample this degrades to `add`.
    pub fn replace(&mut self, close: f64) {
        if !close.is_finite() {
            return;
        }

        if let Some(rb) = self.last {
            self.samples = rb.samples;
            self.prev_close = rb.prev_close;
            self.avg_gain = rb.avg_gain;
            self.avg_loss = rb.avg_loss;
        }
        self.add(close);
    }

    /// Current RSI in [0, 100], or `None` until stable or when the
    /// calculation produces a non-finite result.
    ///
    /// Edge handling: both averages zero => 50 (no movement), zero loss
    /// => 100 (only gains).
    pub fn value(&self) -> Option<f64> {
        if !self.is_stable() {
            return None;
        }

        let rsi = if self.avg_loss == 0.0 && self.avg_gain == 0.0 {
            50.0
        } else if self.avg_loss == 0.0 {
            100.0
        } else {
            let rs = self.avg_gain / self.avg_loss;
            100.0 - 100.0 / (1.0 + rs)
        };

        rsi.is_finite().then_some(rsi)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn feed(rsi: &mut WilderRsi, closes: impl IntoIterator<Item = f64>) {
        for c in closes {
            rsi.add(c);
        }
    }

    // ---- stability boundary ----------------------------------------------

    #[test]
    fn stable_exactly_after_period_plus_one_closes() {
        let mut rsi = WilderRsi::new(14);
        for i in 1..=14 {
            rsi.add(i as f64);
            assert!(!rsi.is_stable(), "stable too early at close #{i}");
            assert!(rsi.value().is_none());
        }
        rsi.add(15.0);
        assert!(rsi.is_stable());
        assert!(rsi.value().is_some());
    }

    // ---- directional extremes --------------------------------------------

    #[test]
    fn all_gains_pins_at_100() {
        let mut rsi = WilderRsi::new(14);
        feed(&mut rsi, (1..=30).map(|x| x as f64));
        let v = rsi.value().unwrap();
        assert!((v - 100.0).abs() < 1e-10, "expected 100.0, got {v}");
    }

    #[test]
    fn all_losses_pins_at_0() {
        let mut rsi = WilderRsi::new(14);
        feed(&mut rsi, (1..=30).rev().map(|x| x as f64));
        let v = rsi.value().unwrap();
        assert!(v.abs() < 1e-10, "expected 0.0, got {v}");
    }

    #[test]
    fn flat_market_is_neutral_50() {
        let mut rsi = WilderRsi::new(14);
        feed(&mut rsi, std::iter::repeat(100.0).take(30));
        let v = rsi.value().unwrap();
        assert!((v - 50.0).abs() < 1e-10, "expected 50.0, got {v}");
    }

    #[test]
    fn range_check_on_mixed_data() {
        let closes = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let mut rsi = WilderRsi::new(14);
        for &c in &closes {
            rsi.add(c);
            if let Some(v) = rsi.value() {
                assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
            }
        }
        assert!(rsi.is_stable());
    }

    // ---- replace semantics -----------------------------------------------

    #[test]
    fn replace_equals_fresh_sequence() {
        // add(a) then replace(b) must equal a sequence that fed b directly.
        let base: Vec<f64> = (1..=20).map(|x| (x as f64).sin() * 10.0 + 100.0).collect();

        let mut with_replace = WilderRsi::new(14);
        feed(&mut with_replace, base.iter().copied());
        with_replace.add(103.0);
        with_replace.replace(97.5);

        let mut direct = WilderRsi::new(14);
        feed(&mut direct, base.iter().copied());
        direct.add(97.5);

        assert_eq!(with_replace.value(), direct.value());
        assert_eq!(with_replace.samples, direct.samples);
    }

    #[test]
    fn replace_is_idempotent() {
        let mut a = WilderRsi::new(5);
        feed(&mut a, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let mut b = a.clone();

        a.replace(6.5);
        b.replace(6.5);
        b.replace(6.5);

        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn replace_during_seed_does_not_bias() {
        let mut with_replace = WilderRsi::new(5);
        feed(&mut with_replace, [10.0, 11.0, 12.0]);
        with_replace.replace(9.0);
        feed(&mut with_replace, [10.0, 11.0, 12.0]);

        let mut direct = WilderRsi::new(5);
        feed(&mut direct, [10.0, 11.0, 9.0, 10.0, 11.0, 12.0]);

        assert_eq!(with_replace.value(), direct.value());
    }

    #[test]
    fn replace_without_history_acts_as_add() {
        let mut rsi = WilderRsi::new(3);
        rsi.replace(42.0);
        assert_eq!(rsi.samples, 1);
        assert!(!rsi.is_stable());
    }

    // ---- defensive input -------------------------------------------------

    #[test]
    fn non_finite_closes_are_ignored() {
        let mut rsi = WilderRsi::new(3);
        feed(&mut rsi, [1.0, 2.0, 3.0, 4.0]);
        let before = rsi.value();
        rsi.add(f64::NAN);
        rsi.add(f64::INFINITY);
        rsi.replace(f64::NAN);
        assert_eq!(rsi.value(), before);
    }

    #[test]
    fn period_zero_is_clamped() {
        let mut rsi = WilderRsi::new(0);
        assert_eq!(rsi.period(), 1);
        feed(&mut rsi, [1.0, 2.0]);
        assert!(rsi.is_stable());
    }
}
