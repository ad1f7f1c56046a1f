// =============================================================================
// RSI Tracker — Wilder RSI over closed candles plus the forming bar
// =============================================================================
//
// Seeds from historical REST klines, then tracks the live candle through the
// kline WebSocket stream. The forming bar is replaced in place on every
// intra-bar update so the indicator is never biased by partial candles.
//
// On any disconnect the tracker reseeds from REST before reconnecting, so the
// series has no holes and `is_stable` never regresses once achieved.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::indicators::WilderRsi;

/// No message for this long forces a reconnect (and a reseed).
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(300);
/// Reconnect backoff bounds.
const RECONNECT_BASE: Duration = Duration::from_secs(3);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
/// Broadcast capacity for RSI snapshots.
const CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Config & published types
// ---------------------------------------------------------------------------

/// Settings for one `(symbol, interval)` RSI feed.
#[derive(Debug, Clone)]
pub struct RsiTrackerConfig {
    pub symbol: String,
    pub interval: String,
    pub period: usize,
    /// Historical klines fetched per (re)seed.
    pub kline_limit: u32,
    pub ws_base_url: String,
    pub rest_base_url: String,
}

/// Stream connectivity, for snapshots and the readiness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Immutable snapshot emitted on every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiSnapshot {
    pub symbol: String,
    pub interval: String,
    pub rsi: Option<f64>,
    pub is_stable: bool,
    pub last_close: Option<f64>,
    pub candle_open_time: Option<i64>,
    pub candle_closed: bool,
    pub connection_state: ConnectionState,
    /// Epoch millis.
    pub updated_at: i64,
}

// ---------------------------------------------------------------------------
// Candle-series state (pure, unit-testable)
// ---------------------------------------------------------------------------

/// RSI plus the identity of the most recent bar.
#[derive(Debug, Clone)]
struct SeriesState {
    rsi: WilderRsi,
    open_time: Option<i64>,
    last_close: Option<f64>,
    candle_closed: bool,
}

impl SeriesState {
    fn new(period: usize) -> Self {
        Self {
            rsi: WilderRsi::new(period),
            open_time: None,
            last_close: None,
            candle_closed: false,
        }
    }
}

/// Apply one live kline to the series. Returns whether anything changed.
///
/// Ordering contract: older bars are ignored, the current bar is replaced in
/// place, a newer bar is appended and becomes current.
fn apply_kline(state: &mut SeriesState, open_time: i64, close: f64, is_closed: bool) -> bool {
    if !close.is_finite() {
        return false;
    }

    match state.open_time {
        None => {
            state.rsi.add(close);
            state.open_time = Some(open_time);
        }
        Some(current) if open_time < current => return false,
        Some(current) if open_time == current => {
            state.rsi.replace(close);
        }
        Some(_) => {
            state.rsi.add(close);
            state.open_time = Some(open_time);
        }
    }

    state.last_close = Some(close);
    state.candle_closed = is_closed;
    true
}

/// Build a fresh series from historical `(open_time, close)` rows.
///
/// Rows are sorted ascending; the final bar is marked forming so the live
/// stream replaces it instead of appending a duplicate.
fn seed_series(period: usize, mut rows: Vec<(i64, f64)>) -> SeriesState {
    rows.sort_by_key(|(t, _)| *t);

    let mut state = SeriesState::new(period);
    for (open_time, close) in rows {
        if !close.is_finite() {
            continue;
        }
        state.rsi.add(close);
        state.open_time = Some(open_time);
        state.last_close = Some(close);
    }
    state.candle_closed = false;
    state
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

struct Inner {
    config: RsiTrackerConfig,
    http: reqwest::Client,
    series: RwLock<SeriesState>,
    connection_state: RwLock<ConnectionState>,
    started: AtomicBool,
    stopped: AtomicBool,
    latest: RwLock<Option<RsiSnapshot>>,
    tx: broadcast::Sender<RsiSnapshot>,
}

/// Live RSI feed for one `(symbol, interval)` pair.
pub struct RsiTracker {
    inner: Arc<Inner>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RsiTracker {
    pub fn new(config: RsiTrackerConfig) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        let period = config.period;

        Self {
            inner: Arc::new(Inner {
                config,
                http,
                series: RwLock::new(SeriesState::new(period)),
                connection_state: RwLock::new(ConnectionState::Connecting),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                latest: RwLock::new(None),
                tx,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the seed/stream supervisor. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run_supervisor(inner).await;
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        *self.inner.connection_state.write() = ConnectionState::Disconnected;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RsiSnapshot> {
        self.inner.tx.subscribe()
    }

    pub fn latest(&self) -> Option<RsiSnapshot> {
        self.inner.latest.read().clone()
    }

    pub fn is_stable(&self) -> bool {
        self.inner.series.read().rsi.is_stable()
    }

    pub fn value(&self) -> Option<f64> {
        self.inner.series.read().rsi.value()
    }
}

impl Drop for RsiTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Supervisor: reseed, stream, reconnect
// ---------------------------------------------------------------------------

async fn run_supervisor(inner: Arc<Inner>) {
    let mut backoff = RECONNECT_BASE;

    while !inner.stopped.load(Ordering::SeqCst) {
        *inner.connection_state.write() = ConnectionState::Connecting;
        publish(&inner);

        // Reseed before every connection so reconnects leave no holes.
        if let Err(e) = reseed(&inner).await {
            warn!(
                symbol = %inner.config.symbol,
                interval = %inner.config.interval,
                error = %e,
                "kline seed failed"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX);
            continue;
        }
        publish(&inner);

        match run_stream(&inner, &mut backoff).await {
            Ok(()) => info!(symbol = %inner.config.symbol, "kline stream ended"),
            Err(e) => {
                warn!(symbol = %inner.config.symbol, error = %e, "kline stream error");
            }
        }

        *inner.connection_state.write() = ConnectionState::Disconnected;
        publish(&inner);

        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

/// Fetch historical klines and rebuild the series from scratch.
async fn reseed(inner: &Arc<Inner>) -> Result<()> {
    let rows = fetch_klines(inner).await?;
    let count = rows.len();

    let state = seed_series(inner.config.period, rows);
    let stable = state.rsi.is_stable();
    *inner.series.write() = state;

    info!(
        symbol = %inner.config.symbol,
        interval = %inner.config.interval,
        candles = count,
        stable,
        "RSI series seeded"
    );
    Ok(())
}

/// One WebSocket connection feeding live klines into the series.
async fn run_stream(inner: &Arc<Inner>, backoff: &mut Duration) -> Result<()> {
    let url = format!(
        "{}/{}@kline_{}",
        inner.config.ws_base_url,
        inner.config.symbol.to_lowercase(),
        inner.config.interval
    );
    info!(url = %url, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(symbol = %inner.config.symbol, interval = %inner.config.interval, "kline WebSocket connected");
    *inner.connection_state.write() = ConnectionState::Connected;
    *backoff = RECONNECT_BASE;
    publish(inner);

    let (mut write, mut read) = ws_stream.split();

    loop {
        let next = tokio::time::timeout(HEARTBEAT_TIMEOUT, read.next()).await;
        let msg = match next {
            Err(_) => anyhow::bail!("heartbeat timeout: no kline within 5 minutes"),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(e).context("kline WebSocket read error"),
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                if let Some((open_time, close, is_closed)) = parse_kline_event(&text) {
                    let changed = {
                        let mut series = inner.series.write();
                        apply_kline(&mut series, open_time, close, is_closed)
                    };
                    if changed {
                        publish(inner);
                    } else {
                        debug!(open_time, "out-of-order kline ignored");
                    }
                }
            }
            Message::Ping(payload) => {
                write
                    .send(Message::Pong(payload))
                    .await
                    .context("failed to send pong")?;
            }
            Message::Close(_) => {
                warn!(symbol = %inner.config.symbol, "kline WebSocket closed by server");
                return Ok(());
            }
            _ => {}
        }
    }
}

/// Build and fan out a snapshot of the current series.
fn publish(inner: &Arc<Inner>) {
    let series = inner.series.read();
    let snapshot = RsiSnapshot {
        symbol: inner.config.symbol.clone(),
        interval: inner.config.interval.clone(),
        rsi: series.rsi.value(),
        is_stable: series.rsi.is_stable(),
        last_close: series.last_close,
        candle_open_time: series.open_time,
        candle_closed: series.candle_closed,
        connection_state: *inner.connection_state.read(),
        updated_at: chrono::Utc::now().timestamp_millis(),
    };
    drop(series);

    *inner.latest.write() = Some(snapshot.clone());
    let _ = inner.tx.send(snapshot);
}

// ---------------------------------------------------------------------------
// Wire parsing
// ---------------------------------------------------------------------------

/// GET /api/v3/klines rows as `(open_time, close)` pairs.
///
/// Row shape: `[openTime, open, high, low, close, volume, closeTime, ...]`
/// with numeric fields as strings. Malformed rows are dropped silently.
async fn fetch_klines(inner: &Arc<Inner>) -> Result<Vec<(i64, f64)>> {
    let url = format!(
        "{}/api/v3/klines?symbol={}&interval={}&limit={}",
        inner.config.rest_base_url,
        inner.config.symbol,
        inner.config.interval,
        inner.config.kline_limit
    );

    let resp = inner
        .http
        .get(&url)
        .send()
        .await
        .context("klines request failed")?;

    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .context("failed to parse klines response")?;

    if !status.is_success() {
        anyhow::bail!("klines returned {status}: {body}");
    }

    let raw = body.as_array().context("klines response is not an array")?;

    let rows = raw
        .iter()
        .filter_map(|row| {
            let arr = row.as_array()?;
            let open_time = arr.first()?.as_i64()?;
            let close: f64 = arr.get(4)?.as_str()?.parse().ok()?;
            close.is_finite().then_some((open_time, close))
        })
        .collect();

    Ok(rows)
}

/// Parse one kline-stream message into `(open_time, close, is_closed)`.
///
/// Combined-stream envelopes are unwrapped; non-kline or malformed payloads
/// yield `None`.
fn parse_kline_event(text: &str) -> Option<(i64, f64, bool)> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    if data["e"].as_str() != Some("kline") {
        return None;
    }

    let k = &data["k"];
    let open_time = k["t"].as_i64()?;
    let close: f64 = k["c"].as_str()?.parse().ok()?;
    let is_closed = k["x"].as_bool()?;

    close.is_finite().then_some((open_time, close, is_closed))
}
