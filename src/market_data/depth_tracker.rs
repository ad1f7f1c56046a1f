// =============================================================================
// Depth Tracker — incremental order book over the diff stream
// =============================================================================
//
// Maintains a local book for one symbol from the `@depth@<speed>ms` diff
// stream, reconciled against REST snapshots:
//
//   1. Connect the WebSocket and buffer diff events.
//   2. Fetch a REST snapshot (limit 5000).
//   3. Discard buffered events entirely covered by the snapshot, verify the
//      first survivor bridges `last_update_id + 1`, replay the rest in order.
//   4. Go ready and apply live events under the sequencing contract; any gap
//      re-buffers the offending event and restarts the bootstrap.
//
// A reader task owns the socket (pong replies, heartbeat timeout, connection
// recycling) and feeds parsed events through a bounded channel, so the
// session task can await REST calls without dropping stream data.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::DepthTrackerConfig;
use crate::market_data::book::{
    ApplyOutcome, BookSnapshot, DepthDiffEvent, ImbalanceSummary, OrderBook,
};

/// No message for this long marks the feed stale (health only).
const STALE_THRESHOLD: Duration = Duration::from_secs(5);
/// No message for this long forces a reconnect.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(300);
/// Connections are recycled proactively before the venue's 24 h cutoff.
const MAX_CONNECTION_AGE: Duration = Duration::from_secs(23 * 3600);
/// Reconnect backoff bounds.
const RECONNECT_BASE: Duration = Duration::from_secs(3);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
/// Diff events buffered while the book is not ready; oldest are dropped.
const EVENT_BUFFER_CAP: usize = 5000;
/// Snapshot fetch attempts per bootstrap before escalating to error logs.
const SNAPSHOT_RETRY_LIMIT: u32 = 5;
/// REST snapshot depth.
const SNAPSHOT_LIMIT: u32 = 5000;
/// Book levels republished per side.
const PUBLISH_LEVELS: usize = 20;
/// Broadcast capacity for imbalance snapshots.
const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Published snapshot & health
// ---------------------------------------------------------------------------

/// Immutable snapshot emitted after every applied diff event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthFeedSnapshot {
    pub symbol: String,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub mid_price: Option<f64>,
    /// Top levels, best first, canonical price strings.
    pub bids: Vec<(String, f64)>,
    pub asks: Vec<(String, f64)>,
    pub last_update_id: u64,
    pub summary: ImbalanceSummary,
    /// Epoch millis.
    pub updated_at: i64,
}

/// Liveness summary for operators and the engine's readiness gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthHealth {
    pub started: bool,
    pub connected: bool,
    pub order_book_ready: bool,
    pub rest_healthy: bool,
    pub healthy: bool,
    /// First failing condition, in priority order: WS, ready, staleness, REST.
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

struct Inner {
    symbol: String,
    config: DepthTrackerConfig,
    http: reqwest::Client,
    book: RwLock<OrderBook>,
    started: AtomicBool,
    stopped: AtomicBool,
    connected: AtomicBool,
    ready: AtomicBool,
    rest_healthy: AtomicBool,
    last_message: RwLock<Option<Instant>>,
    latest: RwLock<Option<DepthFeedSnapshot>>,
    tx: broadcast::Sender<DepthFeedSnapshot>,
}

/// Incremental depth tracker for a single symbol.
pub struct DepthTracker {
    inner: Arc<Inner>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DepthTracker {
    pub fn new(symbol: impl Into<String>, config: DepthTrackerConfig) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            inner: Arc::new(Inner {
                symbol: symbol.into().to_uppercase(),
                config,
                http,
                book: RwLock::new(OrderBook::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                rest_healthy: AtomicBool::new(true),
                last_message: RwLock::new(None),
                latest: RwLock::new(None),
                tx,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the connection supervisor. Idempotent.
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

    /// Stop the tracker; in-flight work is abandoned.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.ready.store(false, Ordering::SeqCst);
    }

    /// Subscribe to imbalance snapshots. Slow receivers miss updates but
    /// never disturb the tracker.
    pub fn subscribe(&self) -> broadcast::Receiver<DepthFeedSnapshot> {
        self.inner.tx.subscribe()
    }

    /// Most recent published snapshot, if any.
    pub fn latest(&self) -> Option<DepthFeedSnapshot> {
        self.inner.latest.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> DepthHealth {
        let started = self.inner.started.load(Ordering::SeqCst);
        let connected = self.inner.connected.load(Ordering::SeqCst);
        let ready = self.inner.ready.load(Ordering::SeqCst);
        let rest_healthy = self.inner.rest_healthy.load(Ordering::SeqCst);

        let stale = self
            .inner
            .last_message
            .read()
            .map_or(true, |t| t.elapsed() > STALE_THRESHOLD);

        let reason = if !started {
            Some("tracker not started".to_string())
        } else if !connected {
            Some("websocket disconnected".to_string())
        } else if !ready {
            Some("order book not ready".to_string())
        } else if stale {
            Some("no stream data within stale threshold".to_string())
        } else if !rest_healthy {
            Some("snapshot endpoint failing".to_string())
        } else {
            None
        };

        DepthHealth {
            started,
            connected,
            order_book_ready: ready,
            rest_healthy,
            healthy: reason.is_none(),
            reason,
        }
    }
}

impl Drop for DepthTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Supervisor: reconnect loop with exponential backoff
// ---------------------------------------------------------------------------

async fn run_supervisor(inner: Arc<Inner>) {
    let mut backoff = RECONNECT_BASE;

    while !inner.stopped.load(Ordering::SeqCst) {
        match run_connection(&inner, &mut backoff).await {
            Ok(()) => {
                info!(symbol = %inner.symbol, "depth connection recycled");
            }
            Err(e) => {
                warn!(symbol = %inner.symbol, error = %e, "depth connection error");
            }
        }

        inner.connected.store(false, Ordering::SeqCst);
        inner.ready.store(false, Ordering::SeqCst);

        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }

        debug!(symbol = %inner.symbol, backoff_s = backoff.as_secs(), "reconnecting after backoff");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

/// One full WebSocket connection: reader task + book session.
async fn run_connection(inner: &Arc<Inner>, backoff: &mut Duration) -> Result<()> {
    let url = format!(
        "{}/{}@depth@{}ms",
        inner.config.ws_base_url,
        inner.symbol.to_lowercase(),
        inner.config.speed_ms
    );
    info!(url = %url, symbol = %inner.symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(symbol = %inner.symbol, "depth WebSocket connected");
    inner.connected.store(true, Ordering::SeqCst);
    *inner.last_message.write() = Some(Instant::now());
    *backoff = RECONNECT_BASE;

    let (tx_ev, rx_ev) = mpsc::channel::<DepthDiffEvent>(EVENT_BUFFER_CAP);

    let reader_inner = inner.clone();
    let reader = tokio::spawn(async move { run_reader(reader_inner, ws_stream, tx_ev).await });

    let session_result = run_session(inner, rx_ev).await;

    let reader_result = match reader.await {
        Ok(r) => r,
        Err(e) => Err(anyhow::anyhow!("reader task panicked: {e}")),
    };

    session_result.and(reader_result)
}

/// Owns the socket: pong replies, heartbeat timeout, 23 h recycling.
async fn run_reader(
    inner: Arc<Inner>,
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    tx: mpsc::Sender<DepthDiffEvent>,
) -> Result<()> {
    let (mut write, mut read) = ws_stream.split();
    let recycle_at = tokio::time::Instant::now() + MAX_CONNECTION_AGE;
    let recycle = tokio::time::sleep_until(recycle_at);
    tokio::pin!(recycle);

    loop {
        tokio::select! {
            _ = &mut recycle => {
                info!(symbol = %inner.symbol, "depth connection reached max age");
                return Ok(());
            }
            next = tokio::time::timeout(HEARTBEAT_TIMEOUT, read.next()) => {
                let msg = match next {
                    Err(_) => anyhow::bail!("heartbeat timeout: no message within 5 minutes"),
                    Ok(None) => {
                        warn!(symbol = %inner.symbol, "depth WebSocket stream ended");
                        return Ok(());
                    }
                    Ok(Some(Err(e))) => return Err(e).context("depth WebSocket read error"),
                    Ok(Some(Ok(msg))) => msg,
                };

                *inner.last_message.write() = Some(Instant::now());

                match msg {
                    Message::Text(text) => {
                        if let Some(event) = parse_depth_event(&text) {
                            // Channel-full means the session is mid-bootstrap
                            // and far behind; block until it drains.
                            if tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        // Pong must echo the server's payload.
                        write
                            .send(Message::Pong(payload))
                            .await
                            .context("failed to send pong")?;
                    }
                    Message::Close(_) => {
                        warn!(symbol = %inner.symbol, "depth WebSocket closed by server");
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session: bootstrap, live apply, periodic resync
// ---------------------------------------------------------------------------

async fn run_session(inner: &Arc<Inner>, mut rx: mpsc::Receiver<DepthDiffEvent>) -> Result<()> {
    let mut buffer: VecDeque<DepthDiffEvent> = VecDeque::new();
    let mut resync = tokio::time::interval(Duration::from_millis(inner.config.refresh_sync_ms));
    resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    resync.reset(); // skip the immediate first tick

    loop {
        if !inner.ready.load(Ordering::SeqCst) {
            // Need at least one buffered event before aligning a snapshot.
            if buffer.is_empty() {
                match rx.recv().await {
                    Some(ev) => push_buffered(&mut buffer, ev),
                    None => return Ok(()),
                }
            }
            while let Ok(ev) = rx.try_recv() {
                push_buffered(&mut buffer, ev);
            }

            if try_bootstrap(inner, &mut buffer, &mut rx).await? {
                inner.ready.store(true, Ordering::SeqCst);
                info!(
                    symbol = %inner.symbol,
                    last_update_id = inner.book.read().last_update_id(),
                    "order book ready"
                );
                publish(inner);
            } else {
                // Keep the REST endpoint breathing room before the next round.
                tokio::time::sleep(RECONNECT_BASE).await;
            }
            continue;
        }

        tokio::select! {
            ev = rx.recv() => {
                let Some(ev) = ev else { return Ok(()) };
                let outcome = inner.book.write().apply(&ev);
                match outcome {
                    ApplyOutcome::Applied => publish(inner),
                    ApplyOutcome::Stale => {}
                    ApplyOutcome::Gap => {
                        warn!(
                            symbol = %inner.symbol,
                            first_update_id = ev.first_update_id,
                            local = inner.book.read().last_update_id(),
                            "depth sequence gap — restarting bootstrap"
                        );
                        inner.ready.store(false, Ordering::SeqCst);
                        buffer.clear();
                        push_buffered(&mut buffer, ev);
                    }
                }
            }
            _ = resync.tick() => {
                resync_book(inner).await;
            }
        }
    }
}

/// Buffer a not-ready event, dropping the oldest beyond the cap.
fn push_buffered(buffer: &mut VecDeque<DepthDiffEvent>, event: DepthDiffEvent) {
    if buffer.len() >= EVENT_BUFFER_CAP {
        buffer.pop_front();
    }
    buffer.push_back(event);
}

/// Fetch-and-align loop; `Ok(true)` when the book went consistent.
async fn try_bootstrap(
    inner: &Arc<Inner>,
    buffer: &mut VecDeque<DepthDiffEvent>,
    rx: &mut mpsc::Receiver<DepthDiffEvent>,
) -> Result<bool> {
    for attempt in 1..=SNAPSHOT_RETRY_LIMIT {
        if inner.stopped.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let snapshot = match fetch_snapshot(inner).await {
            Ok(s) => {
                inner.rest_healthy.store(true, Ordering::SeqCst);
                s
            }
            Err(e) => {
                inner.rest_healthy.store(false, Ordering::SeqCst);
                warn!(symbol = %inner.symbol, attempt, error = %e, "depth snapshot fetch failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        // Events that arrived while fetching belong in the buffer too.
        while let Ok(ev) = rx.try_recv() {
            push_buffered(buffer, ev);
        }

        let mut book = inner.book.write();
        match bootstrap_from_snapshot(&mut book, &snapshot, buffer) {
            BootstrapOutcome::Done => return Ok(true),
            BootstrapOutcome::SnapshotStale => {
                debug!(
                    symbol = %inner.symbol,
                    attempt,
                    snapshot_id = snapshot.last_update_id,
                    "snapshot predates buffered events — refetching"
                );
            }
            BootstrapOutcome::SequenceBroken => {
                warn!(symbol = %inner.symbol, attempt, "buffered events do not chain — refetching");
            }
        }
    }

    // Recovery continues forever; only the log level escalates.
    error!(
        symbol = %inner.symbol,
        retries = SNAPSHOT_RETRY_LIMIT,
        "depth bootstrap failed repeatedly — will keep retrying"
    );
    Ok(false)
}

/// Alignment result of one snapshot against the event buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootstrapOutcome {
    Done,
    /// Snapshot predates the buffer; fetch a newer one.
    SnapshotStale,
    /// Buffered events do not bridge the snapshot.
    SequenceBroken,
}

/// Reset `book` to `snapshot` and replay `buffer` in order.
///
/// The buffer is consumed on success and on sequence failure (stale events
/// are useless either way); on `SnapshotStale` it is left intact for the
/// next attempt.
fn bootstrap_from_snapshot(
    book: &mut OrderBook,
    snapshot: &BookSnapshot,
    buffer: &mut VecDeque<DepthDiffEvent>,
) -> BootstrapOutcome {
    if let Some(front) = buffer.front() {
        if snapshot.last_update_id < front.first_update_id {
            return BootstrapOutcome::SnapshotStale;
        }
    }

    // Drop events the snapshot already covers.
    while buffer
        .front()
        .map_or(false, |ev| ev.final_update_id <= snapshot.last_update_id)
    {
        buffer.pop_front();
    }

    book.reset(snapshot);

    while let Some(ev) = buffer.pop_front() {
        match book.apply(&ev) {
            ApplyOutcome::Applied | ApplyOutcome::Stale => {}
            ApplyOutcome::Gap => {
                buffer.clear();
                return BootstrapOutcome::SequenceBroken;
            }
        }
    }

    BootstrapOutcome::Done
}

/// Periodic resync: replace the book only when the snapshot is newer.
async fn resync_book(inner: &Arc<Inner>) {
    let snapshot = match fetch_snapshot(inner).await {
        Ok(s) => {
            inner.rest_healthy.store(true, Ordering::SeqCst);
            s
        }
        Err(e) => {
            inner.rest_healthy.store(false, Ordering::SeqCst);
            warn!(symbol = %inner.symbol, error = %e, "periodic depth resync failed");
            return;
        }
    };

    let mut book = inner.book.write();
    if snapshot.last_update_id >= book.last_update_id() {
        book.reset(&snapshot);
        drop(book);
        debug!(
            symbol = %inner.symbol,
            last_update_id = snapshot.last_update_id,
            "book replaced from periodic snapshot"
        );
        publish(inner);
    }
}

/// Build and fan out a snapshot from the current book.
fn publish(inner: &Arc<Inner>) {
    let book = inner.book.read();
    let (bids, asks) = book.top_levels_raw(PUBLISH_LEVELS);
    let summary = book.imbalance(inner.config.depth_window_bps, inner.config.imbalance_ratio);

    let snapshot = DepthFeedSnapshot {
        symbol: inner.symbol.clone(),
        best_bid: book.best_bid().map(|(p, _)| p),
        best_ask: book.best_ask().map(|(p, _)| p),
        mid_price: book.mid_price(),
        bids,
        asks,
        last_update_id: book.last_update_id(),
        summary,
        updated_at: chrono::Utc::now().timestamp_millis(),
    };
    drop(book);

    *inner.latest.write() = Some(snapshot.clone());
    // No receivers is fine.
    let _ = inner.tx.send(snapshot);
}

// ---------------------------------------------------------------------------
// Wire parsing
// ---------------------------------------------------------------------------

/// Fetch the REST depth snapshot.
async fn fetch_snapshot(inner: &Arc<Inner>) -> Result<BookSnapshot> {
    let url = format!(
        "{}/api/v3/depth?symbol={}&limit={}",
        inner.config.rest_base_url, inner.symbol, SNAPSHOT_LIMIT
    );

    let resp = inner
        .http
        .get(&url)
        .send()
        .await
        .context("depth snapshot request failed")?;

    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .context("failed to parse depth snapshot response")?;

    if !status.is_success() {
        anyhow::bail!("depth snapshot returned {status}: {body}");
    }

    let last_update_id = body["lastUpdateId"]
        .as_u64()
        .context("snapshot missing lastUpdateId")?;

    Ok(BookSnapshot {
        last_update_id,
        bids: parse_levels(&body["bids"]),
        asks: parse_levels(&body["asks"]),
    })
}

/// Parse one diff-stream message; unknown or malformed payloads yield `None`.
///
/// Combined-stream envelopes (`{stream, data}`) are unwrapped.
fn parse_depth_event(text: &str) -> Option<DepthDiffEvent> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    if data["e"].as_str() != Some("depthUpdate") {
        return None;
    }

    let first_update_id = data["U"].as_u64()?;
    let final_update_id = data["u"].as_u64()?;

    Some(DepthDiffEvent {
        first_update_id,
        final_update_id,
        bids: parse_levels(&data["b"]),
        asks: parse_levels(&data["a"]),
    })
}

/// Parse `[["price","qty"], ...]` defensively: malformed or non-finite
/// entries are dropped silently.
fn parse_levels(value: &serde_json::Value) -> Vec<(String, f64)> {
    let Some(rows) = value.as_array() else {
        return Vec::new();
    };

    rows.iter()
        .filter_map(|row| {
            let price = row.get(0)?.as_str()?;
            let qty: f64 = row.get(1)?.as_str()?.parse().ok()?;
            if !qty.is_finite() || qty < 0.0 {
                return None;
            }
            Some((price.to_string(), qty))
        })
        .collect()
}
