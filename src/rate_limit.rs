// =============================================================================
// Rate-Limit Controller — cycle throttling on venue backoff signals
// =============================================================================
//
// The engine asks `before_cycle` on every tick. After a venue 429 is fed in
// through `register_rate_limit`, the controller opens an exponential pause
// window (base x2 per consecutive hit, capped), answers `Paused` until the
// window elapses, then `Skip` exactly once so the first cycle after a fresh
// backoff stays quiet, then `Run` again. Clean cycles reset the counter.
//
// All methods take `now` explicitly so tests can drive time deterministically.
// =============================================================================

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default initial pause after the first rate-limit hit.
const DEFAULT_BASE_PAUSE: Duration = Duration::from_secs(2);

/// What the engine should do with the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDecision {
    Run,
    /// Fresh backoff: sit out exactly one cycle after the pause elapses.
    Skip,
    /// Pause window still open.
    Paused,
}

/// Serialisable view of the controller for engine snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub backoff_count: u32,
    pub paused: bool,
    pub pause_remaining_ms: u64,
}

/// Throttles cycle execution on venue backoff signals.
#[derive(Debug)]
pub struct RateLimitController {
    base_pause: Duration,
    max_pause: Duration,
    backoff_count: u32,
    paused_until: Option<Instant>,
    fresh_backoff: bool,
}

impl RateLimitController {
    pub fn new(max_pause: Duration) -> Self {
        Self {
            base_pause: DEFAULT_BASE_PAUSE,
            max_pause,
            backoff_count: 0,
            paused_until: None,
            fresh_backoff: false,
        }
    }

    /// Record a venue rate-limit signal and open (or extend) the pause window.
    pub fn register_rate_limit(&mut self, now: Instant, source: &str) {
        self.backoff_count = self.backoff_count.saturating_add(1);
        let pause = self.current_pause();
        self.paused_until = Some(now + pause);
        self.fresh_backoff = true;

        warn!(
            source,
            backoff_count = self.backoff_count,
            pause_ms = pause.as_millis() as u64,
            "rate limit registered — pausing cycles"
        );
    }

    /// Decision for the tick starting at `now`.
    pub fn before_cycle(&mut self, now: Instant) -> CycleDecision {
        if let Some(until) = self.paused_until {
            if now < until {
                return CycleDecision::Paused;
            }
            self.paused_until = None;
        }

        if self.fresh_backoff {
            self.fresh_backoff = false;
            debug!("skipping first cycle after backoff");
            return CycleDecision::Skip;
        }

        CycleDecision::Run
    }

    /// Close out a cycle. Clean cycles reset the backoff; rate-limited ones
    /// leave the counter in place so the next hit doubles the pause.
    pub fn on_cycle_complete(&mut self, had_rate_limit: bool) {
        if !had_rate_limit && self.paused_until.is_none() {
            if self.backoff_count > 0 {
                debug!(backoff_count = self.backoff_count, "clean cycle — backoff reset");
            }
            self.backoff_count = 0;
            self.fresh_backoff = false;
        }
    }

    pub fn snapshot(&self, now: Instant) -> RateLimitSnapshot {
        let pause_remaining_ms = self
            .paused_until
            .and_then(|until| until.checked_duration_since(now))
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        RateLimitSnapshot {
            backoff_count: self.backoff_count,
            paused: pause_remaining_ms > 0,
            pause_remaining_ms,
        }
    }

    /// Pause length for the current consecutive-hit count: base x2 each hit,
    /// capped at the ceiling.
    fn current_pause(&self) -> Duration {
        let exponent = self.backoff_count.saturating_sub(1).min(16);
        let scaled = self.base_pause * 2u32.pow(exponent);
        scaled.min(self.max_pause)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RateLimitController {
        RateLimitController::new(Duration::from_secs(60))
    }

    #[test]
    fn runs_by_default() {
        let mut rl = controller();
        assert_eq!(rl.before_cycle(Instant::now()), CycleDecision::Run);
    }

    #[test]
    fn pauses_then_skips_once_then_runs() {
        let mut rl = controller();
        let t0 = Instant::now();

        rl.register_rate_limit(t0, "create_order");
        assert_eq!(rl.before_cycle(t0), CycleDecision::Paused);
        assert_eq!(
            rl.before_cycle(t0 + Duration::from_millis(1999)),
            CycleDecision::Paused
        );

        let after = t0 + Duration::from_secs(2);
        assert_eq!(rl.before_cycle(after), CycleDecision::Skip);
        assert_eq!(rl.before_cycle(after), CycleDecision::Run);
    }

    #[test]
    fn consecutive_hits_double_the_pause() {
        let mut rl = controller();
        let t0 = Instant::now();

        rl.register_rate_limit(t0, "a");
        rl.register_rate_limit(t0, "b");
        // Second hit: 4 s window.
        assert_eq!(
            rl.before_cycle(t0 + Duration::from_secs(3)),
            CycleDecision::Paused
        );
        assert_eq!(
            rl.before_cycle(t0 + Duration::from_secs(4)),
            CycleDecision::Skip
        );
    }

    #[test]
    fn pause_is_capped_at_ceiling() {
        let mut rl = RateLimitController::new(Duration::from_secs(10));
        let t0 = Instant::now();

        for _ in 0..10 {
            rl.register_rate_limit(t0, "burst");
        }
        assert_eq!(
            rl.before_cycle(t0 + Duration::from_secs(9)),
            CycleDecision::Paused
        );
        assert_eq!(
            rl.before_cycle(t0 + Duration::from_secs(10)),
            CycleDecision::Skip
        );
    }

    #[test]
    fn clean_cycle_resets_backoff() {
        let mut rl = controller();
        let t0 = Instant::now();

        rl.register_rate_limit(t0, "x");
        let after = t0 + Duration::from_secs(2);
        assert_eq!(rl.before_cycle(after), CycleDecision::Skip);
        assert_eq!(rl.before_cycle(after), CycleDecision::Run);
        rl.on_cycle_complete(false);

        // Next hit starts from the base window again.
        rl.register_rate_limit(after, "y");
        assert_eq!(rl.snapshot(after).backoff_count, 1);
        assert_eq!(
            rl.before_cycle(after + Duration::from_secs(2)),
            CycleDecision::Skip
        );
    }

    #[test]
    fn rate_limited_cycle_keeps_counter_for_compounding() {
        let mut rl = controller();
        let t0 = Instant::now();

        rl.register_rate_limit(t0, "x");
        rl.on_cycle_complete(true);
        assert_eq!(rl.snapshot(t0).backoff_count, 1);

        rl.register_rate_limit(t0, "x");
        assert_eq!(rl.snapshot(t0).backoff_count, 2);
    }

    #[test]
    fn snapshot_reports_remaining_pause() {
        let mut rl = controller();
        let t0 = Instant::now();
        rl.register_rate_limit(t0, "x");

        let snap = rl.snapshot(t0 + Duration::from_millis(500));
        assert!(snap.paused);
        assert_eq!(snap.backoff_count, 1);
        assert!(snap.pause_remaining_ms <= 1500);
        assert!(snap.pause_remaining_ms > 0);

        let snap = rl.snapshot(t0 + Duration::from_secs(3));
        assert!(!snap.paused);
        assert_eq!(snap.pause_remaining_ms, 0);
    }
}
