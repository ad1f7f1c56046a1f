// =============================================================================
// Swing Logic — pure arm/fire state machine over RSI threshold crossings
// =============================================================================
//
// One step maps (state, config, event) to (next state, actions). No I/O, no
// clocks: thresholds compare the previous RSI sample against the current one.
//
// Arm/fire shape: crossing out of the neutral band arms a side; crossing back
// fires it. Entries respect the configured direction; exits are evaluated for
// whatever position is actually open, so a runtime direction change can never
// trap a position.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::TradeDirection;

/// Position amounts at or below this are treated as flat by the machine.
pub const POSITION_EPS: f64 = 1e-8;

/// Arm flags plus the previous RSI sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwingState {
    pub prev_rsi: Option<f64>,
    pub armed_short_entry: bool,
    pub armed_short_exit: bool,
    pub armed_long_entry: bool,
    pub armed_long_exit: bool,
}

/// Threshold configuration for one step.
#[derive(Debug, Clone, Copy)]
pub struct StepConfig {
    pub direction: TradeDirection,
    pub rsi_high: f64,
    pub rsi_low: f64,
}

/// Observed inputs for one step.
#[derive(Debug, Clone, Copy)]
pub struct StepEvent {
    pub rsi: Option<f64>,
    /// Signed position: positive long, negative short.
    pub position_amt: f64,
    pub pnl: f64,
}

/// What the engine should do this step. Never more than one per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwingAction {
    OpenShort,
    OpenLong,
    ClosePosition,
}

fn cross_up(prev: f64, next: f64, threshold: f64) -> bool {
    prev <= threshold && next > threshold
}

fn cross_down(prev: f64, next: f64, threshold: f64) -> bool {
    prev >= threshold && next < threshold
}

/// Advance the machine by one observation.
pub fn step(state: &SwingState, config: &StepConfig, event: &StepEvent) -> (SwingState, Vec<SwingAction>) {
    // No usable sample: state passes through untouched, prev_rsi included.
    let Some(rsi) = event.rsi.filter(|r| r.is_finite()) else {
        return (state.clone(), Vec::new());
    };

    let mut next = state.clone();
    let prev = state.prev_rsi;
    let mut actions = Vec::new();

    if event.position_amt.abs() <= POSITION_EPS {
        // Flat: exit arms are meaningless.
        next.armed_short_exit = false;
        next.armed_long_exit = false;

        let mut fire_short = false;
        let mut fire_long = false;

        if config.direction.allows_short() {
            if let Some(prev) = prev {
                if cross_up(prev, rsi, config.rsi_high) {
                    next.armed_short_entry = true;
                }
                if next.armed_short_entry && cross_down(prev, rsi, config.rsi_high) {
                    fire_short = true;
                }
            }
        }

        if config.direction.allows_long() {
            if let Some(prev) = prev {
                if cross_down(prev, rsi, config.rsi_low) {
                    next.armed_long_entry = true;
                }
                if next.armed_long_entry && cross_up(prev, rsi, config.rsi_low) {
                    fire_long = true;
                }
            }
        }

        if fire_short && fire_long {
            // Impossible with disjoint thresholds, but never emit both.
            next.armed_short_entry = false;
            next.armed_long_entry = false;
        } else if fire_short {
            actions.push(SwingAction::OpenShort);
            next.armed_short_entry = false;
            next.armed_long_entry = false;
        } else if fire_long {
            actions.push(SwingAction::OpenLong);
            next.armed_short_entry = false;
            next.armed_long_entry = false;
        }
    } else if event.position_amt < 0.0 {
        // Short open: entry arms cleared, exit tracked on the low threshold.
        next.armed_short_entry = false;
        next.armed_long_entry = false;
        next.armed_long_exit = false;

        if let Some(prev) = prev {
            if cross_down(prev, rsi, config.rsi_low) {
                next.armed_short_exit = true;
            }
            if next.armed_short_exit && cross_up(prev, rsi, config.rsi_low) && event.pnl > 0.0 {
                actions.push(SwingAction::ClosePosition);
                next.armed_short_exit = false;
            }
        }
    } else {
        // Long open: symmetric on the high threshold.
        next.armed_short_entry = false;
        next.armed_long_entry = false;
        next.armed_short_exit = false;

        if let Some(prev) = prev {
            if cross_up(prev, rsi, config.rsi_high) {
                next.armed_long_exit = true;
            }
            if next.armed_long_exit && cross_down(prev, rsi, config.rsi_high) && event.pnl > 0.0 {
                actions.push(SwingAction::ClosePosition);
                next.armed_long_exit = false;
            }
        }
    }

    next.prev_rsi = Some(rsi);
    (next, actions)
}
