// =============================================================================
// Price Stream — single-symbol mark-price ticker subscription, latest-price
// cache, and the watch primitive the strategy layer arms to be notified of
// threshold crossings. Connection/read-loop shape is grounded directly on
// the teacher's market_data/trade_stream.rs (tokio_tungstenite::connect_async
// + futures_util::StreamExt read loop); the reconnect-backoff wrapper and
// heartbeat are grounded on the same file's caller-owned reconnection idiom
// in main.rs, generalized into an internal loop with exponential backoff.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::types::{Barrier, BarrierSide, Direction};

const RECONNECT_INITIAL: Duration = Duration::from_secs(3);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_DEADLINE: Duration = Duration::from_secs(20);
const HEALTH_WINDOW: Duration = Duration::from_secs(60);
const LONG_DISCONNECT_WARNING: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct WatchKey {
    target_millis: i64,
    direction: Direction,
    barrier_price_millis: Option<i64>,
    barrier_side: Option<BarrierSide>,
}

fn key_of(target: Decimal, direction: Direction, barrier: Option<Barrier>) -> WatchKey {
    WatchKey {
        target_millis: decimal_key(target),
        direction,
        barrier_price_millis: barrier.map(|b| decimal_key(b.price)),
        barrier_side: barrier.map(|b| b.side),
    }
}

/// Decimal has no total float rounding surprises, but HashMap keys need a
/// stable hashable projection; scale to an integer at a fixed precision
/// that comfortably exceeds any venue's tick size.
fn decimal_key(value: Decimal) -> i64 {
    (value * Decimal::from(1_000_000)).round().to_string().parse().unwrap_or(0)
}

struct WatchEntry {
    target: Decimal,
    direction: Direction,
    barrier: Option<Barrier>,
    barrier_crossed: bool,
    sender: Option<oneshot::Sender<Decimal>>,
}

struct Inner {
    symbol: String,
    latest_price: RwLock<Option<Decimal>>,
    last_frame_at: RwLock<Option<Instant>>,
    disconnected_since: RwLock<Option<Instant>>,
    connection_count: AtomicU64,
    warned_long_disconnect: AtomicBool,
    /// Insertion-ordered so a single frame that satisfies more than one
    /// watch fires them in registration order, per spec.md §5.
    watches: Mutex<IndexMap<WatchKey, WatchEntry>>,
}

/// Handle shared across the strategy task, the health supervisor, and the
/// background connection loop.
#[derive(Clone)]
pub struct PriceStream {
    inner: Arc<Inner>,
}

impl PriceStream {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                symbol: symbol.into(),
                latest_price: RwLock::new(None),
                last_frame_at: RwLock::new(None),
                disconnected_since: RwLock::new(None),
                connection_count: AtomicU64::new(0),
                warned_long_disconnect: AtomicBool::new(false),
                watches: Mutex::new(IndexMap::new()),
            }),
        }
    }

    pub fn latest_price(&self) -> Option<Decimal> {
        *self.inner.latest_price.read()
    }

    /// Healthy iff a ticker frame was observed within the last 60 seconds.
    pub fn is_healthy(&self) -> bool {
        match *self.inner.last_frame_at.read() {
            Some(at) => at.elapsed() < HEALTH_WINDOW,
            None => false,
        }
    }

    pub fn connection_count(&self) -> u64 {
        self.inner.connection_count.load(Ordering::Relaxed)
    }

    /// Registers a single-shot watch. If `barrier` is set, the watch is
    /// armed only after price has been observed strictly on the barrier's
    /// side; until then it cannot fire even if the target condition holds.
    pub fn watch(&self, target: Decimal, direction: Direction, barrier: Option<Barrier>) -> oneshot::Receiver<Decimal> {
        let (tx, rx) = oneshot::channel();
        let key = key_of(target, direction, barrier);
        let entry = WatchEntry {
            target,
            direction,
            barrier,
            barrier_crossed: false,
            sender: Some(tx),
        };
        self.inner.watches.lock().insert(key, entry);
        debug!(target = %target, ?direction, has_barrier = barrier.is_some(), "watch registered");
        rx
    }

    /// Cancels a specific watch by the same parameters it was registered
    /// with. A no-op if it already fired or was never registered.
    pub fn cancel_watch(&self, target: Decimal, direction: Direction, barrier: Option<Barrier>) {
        let key = key_of(target, direction, barrier);
        self.inner.watches.lock().shift_remove(&key);
    }

    /// Cancels every outstanding watch. Dropping the sender makes the
    /// receiving end observe a closed channel rather than a fired value —
    /// indistinguishable from "never going to fire" to the caller.
    pub fn cancel_all_watches(&self) {
        self.inner.watches.lock().clear();
    }

    fn record_frame(&self, price: Decimal) {
        *self.inner.latest_price.write() = Some(price);
        *self.inner.last_frame_at.write() = Some(Instant::now());
        if self.inner.disconnected_since.read().is_some() {
            *self.inner.disconnected_since.write() = None;
            self.inner.warned_long_disconnect.store(false, Ordering::Relaxed);
        }
    }

    fn mark_disconnected(&self) {
        let mut since = self.inner.disconnected_since.write();
        if since.is_none() {
            *since = Some(Instant::now());
        }
    }

    fn maybe_warn_long_disconnect(&self) {
        if let Some(since) = *self.inner.disconnected_since.read() {
            if since.elapsed() > LONG_DISCONNECT_WARNING
                && !self.inner.warned_long_disconnect.swap(true, Ordering::Relaxed)
            {
                warn!(symbol = %self.inner.symbol, seconds = since.elapsed().as_secs(), "price stream has been disconnected for an extended period");
            }
        }
    }

    /// Evaluates every outstanding watch against `price`, firing (and
    /// removing) each one whose condition is now satisfied, in registration
    /// order. Barrier-gated watches are armed, not fired, the first time
    /// price is observed on the barrier's far side.
    fn evaluate_watches(&self, price: Decimal) {
        let mut fired = Vec::new();
        {
            let mut watches = self.inner.watches.lock();
            let mut to_remove = Vec::new();

            for (key, entry) in watches.iter_mut() {
                if let Some(barrier) = entry.barrier {
                    if !entry.barrier_crossed {
                        let crossed = match barrier.side {
                            BarrierSide::Above => price > barrier.price,
                            BarrierSide::Below => price < barrier.price,
                        };
                        if crossed {
                            entry.barrier_crossed = true;
                        } else {
                            continue;
                        }
                    }
                }

                let should_fire = match entry.direction {
                    Direction::Long => price >= entry.target,
                    Direction::Short => price <= entry.target,
                };

                if should_fire {
                    if let Some(sender) = entry.sender.take() {
                        fired.push((sender, price));
                    }
                    to_remove.push(*key);
                }
            }

            for key in to_remove {
                watches.shift_remove(&key);
            }
        }

        for (sender, price) in fired {
            let _ = sender.send(price);
        }
    }

    /// Runs the reconnect-with-backoff supervisor loop until `shutdown`
    /// resolves. Grounded on the teacher's main.rs pattern of wrapping a
    /// single-connection async fn in a `loop { ...; sleep(..).await }`,
    /// generalized here to exponential backoff instead of a fixed delay.
    pub async fn run(self, ws_url: String, tick_tx: mpsc::Sender<Decimal>, mut shutdown: oneshot::Receiver<()>) {
        let mut backoff = RECONNECT_INITIAL;
        loop {
            if shutdown.try_recv().is_ok() {
                info!(symbol = %self.inner.symbol, "price stream shutting down");
                return;
            }

            self.inner.connection_count.fetch_add(1, Ordering::Relaxed);
            match self.connect_and_read(&ws_url, &tick_tx, &mut shutdown).await {
                Ok(()) => {
                    info!(symbol = %self.inner.symbol, "price stream closed voluntarily");
                    return;
                }
                Err(err) => {
                    warn!(symbol = %self.inner.symbol, error = %err, "price stream disconnected, reconnecting");
                    self.mark_disconnected();
                }
            }

            self.maybe_warn_long_disconnect();
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = &mut shutdown => {
                    info!(symbol = %self.inner.symbol, "price stream shutting down during backoff");
                    return;
                }
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    #[instrument(skip(self, tick_tx, shutdown), name = "price_stream::connect_and_read")]
    async fn connect_and_read(
        &self,
        ws_url: &str,
        tick_tx: &mpsc::Sender<Decimal>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Result<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .context("websocket connect failed")?;
        let (mut write, mut read) = ws_stream.split();

        let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                _ = &mut *shutdown => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping_ticker.tick() => {
                    if last_pong.elapsed() > PONG_DEADLINE {
                        anyhow::bail!("no pong received within deadline");
                    }
                    write.send(Message::Ping(Vec::new())).await.context("failed to send ping")?;
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(price) = parse_mark_price(&text) {
                                self.record_frame(price);
                                let _ = tick_tx.send(price).await;
                                self.evaluate_watches(price);
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_pong = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) => {
                            anyhow::bail!("venue closed the connection");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            anyhow::bail!("websocket read error: {err}");
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

/// Parses a `markPriceUpdate` frame: `{"e":"markPriceUpdate","s":"ETHUSDT","p":"4000.10",...}`.
fn parse_mark_price(text: &str) -> Option<Decimal> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let raw = value.get("p")?.as_str()?;
    Decimal::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn watch_fires_on_long_direction_crossing_target() {
        let stream = PriceStream::new("ETHUSDT");
        let rx = stream.watch(dec!(4000), Direction::Long, None);
        stream.evaluate_watches(dec!(3999));
        assert!(rx.try_recv().is_err());
        stream.evaluate_watches(dec!(4000));
        assert_eq!(rx.try_recv().unwrap(), dec!(4000));
    }

    #[test]
    fn watch_fires_on_short_direction_crossing_target() {
        let stream = PriceStream::new("ETHUSDT");
        let rx = stream.watch(dec!(3900), Direction::Short, None);
        stream.evaluate_watches(dec!(3901));
        assert!(rx.try_recv().is_err());
        stream.evaluate_watches(dec!(3900));
        assert_eq!(rx.try_recv().unwrap(), dec!(3900));
    }

    #[test]
    fn barrier_gated_watch_does_not_fire_before_barrier_crossed() {
        let stream = PriceStream::new("ETHUSDT");
        let barrier = Barrier { price: dec!(3930), side: BarrierSide::Below };
        let rx = stream.watch(dec!(3950), Direction::Short, Some(barrier));
        // Price satisfies the target condition but never crossed the barrier.
        stream.evaluate_watches(dec!(3920));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn barrier_gated_watch_fires_once_armed() {
        let stream = PriceStream::new("ETHUSDT");
        let barrier = Barrier { price: dec!(3930), side: BarrierSide::Below };
        let rx = stream.watch(dec!(3950), Direction::Short, Some(barrier));
        stream.evaluate_watches(dec!(3925)); // crosses barrier, arms it
        stream.evaluate_watches(dec!(3952)); // above target for short direction, no fire
        assert!(rx.try_recv().is_err());
        stream.evaluate_watches(dec!(3949)); // <= 3950, fires
        assert_eq!(rx.try_recv().unwrap(), dec!(3949));
    }

    #[test]
    fn watch_is_single_shot() {
        let stream = PriceStream::new("ETHUSDT");
        let rx = stream.watch(dec!(4000), Direction::Long, None);
        stream.evaluate_watches(dec!(4001));
        assert_eq!(rx.try_recv().unwrap(), dec!(4001));
        // firing again should be a no-op: entry removed.
        stream.evaluate_watches(dec!(4002));
        assert_eq!(stream.inner.watches.lock().len(), 0);
    }

    #[test]
    fn cancel_watch_removes_entry() {
        let stream = PriceStream::new("ETHUSDT");
        let rx = stream.watch(dec!(4000), Direction::Long, None);
        stream.cancel_watch(dec!(4000), Direction::Long, None);
        stream.evaluate_watches(dec!(5000));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn parses_mark_price_frame() {
        let frame = r#"{"e":"markPriceUpdate","s":"ETHUSDT","p":"4000.25","r":"0.0001"}"#;
        assert_eq!(parse_mark_price(frame), Some(dec!(4000.25)));
    }
}
