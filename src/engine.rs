//! Single-threaded, per-symbol core loop (§5).
//!
//! Owns the authoritative [`OrderBookState`], the [`OrderFlowPreprocessor`],
//! every detector, and the [`SignalManager`]. Everything upstream of this
//! module (the edge client) only ever hands it decoded depth/trade events
//! over a bounded channel; everything here runs on one thread so that book
//! mutation, enrichment, and detection stay in strict arrival order with no
//! locking on the hot path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use quanta::Clock;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::detectors::{
    AbsorptionDetector, AnomalyDetector, DetectorBase, ExhaustionDetector, IcebergDetector,
    SpoofingDetector,
};
use crate::edge::client::DecodedDepth;
use crate::edge::wire::{SymbolId, WireTrade};
use crate::error::EngineResult;
use crate::model::{AggTrade, BookState, DepthRow, DepthSnapshot, DepthUpdate, InboundEvent, OrderBookSnapshot};
use crate::orderbook::{ApplyOutcome, OrderBookState};
use crate::preprocessor::OrderFlowPreprocessor;
use crate::metrics;
use crate::signal_manager::SignalManager;

/// Depth queue depth before the oldest buffered update is dropped in favor
/// of the newest. Depth updates are cheap to miss one of (the next update
/// carries the book forward anyway via its own `sequence_first`), unlike
/// trades, which each represent a fill a detector needs to see.
const DEPTH_QUEUE_CAPACITY: usize = 256;

/// Trade queue depth. On overflow the loop degrades rather than drops: it
/// logs and counts the overflow but still processes every trade, since
/// iceberg/absorption state depends on not missing fills. A sustained
/// overflow here means the core loop can't keep up and should be sized up,
/// not silently starved of data.
const TRADE_QUEUE_CAPACITY: usize = 4_096;

fn wire_row_to_depth_row(row: &crate::edge::wire::WireDepthRow) -> DepthRow {
    DepthRow {
        price: { row.price },
        qty: { row.qty },
    }
}

fn decoded_depth_to_event(symbol: &str, d: DecodedDepth) -> InboundEvent {
    let bids: Vec<DepthRow> = d.bids.iter().map(wire_row_to_depth_row).collect();
    let asks: Vec<DepthRow> = d.asks.iter().map(wire_row_to_depth_row).collect();

    if d.is_snapshot {
        InboundEvent::Snapshot(DepthSnapshot {
            last_update_id: d.sequence_last,
            bids,
            asks,
        })
    } else {
        InboundEvent::Depth(DepthUpdate {
            sequence_first: d.sequence_first,
            sequence_last: d.sequence_last,
            bids,
            asks,
            event_time_ms: d.event_time_ms,
            symbol: symbol.to_string(),
        })
    }
}

fn wire_trade_to_agg_trade(t: &WireTrade) -> AggTrade {
    AggTrade {
        trade_id: { t.trade_id },
        price: { t.price },
        qty: { t.qty },
        ts_ms: { t.ts_ms },
        buyer_is_maker: t.is_buyer_maker(),
    }
}

/// Sending half of the channel pair the edge client's callbacks push onto.
/// Kept separate from [`CoreLoop`] so it can be cloned into the
/// `set_depth_callback`/`set_trade_callback` closures.
#[derive(Clone)]
pub struct EngineChannels {
    depth_tx: Sender<InboundEvent>,
    depth_rx_for_evict: Receiver<InboundEvent>,
    trade_tx: Sender<AggTrade>,
    symbol: String,
}

impl EngineChannels {
    /// Pushes a depth/snapshot event, dropping the oldest queued event if
    /// the channel is full.
    pub fn push_depth(&self, event: InboundEvent) {
        match self.depth_tx.try_send(event) {
            Ok(()) => metrics::record_event_received(&self.symbol, "depth"),
            Err(TrySendError::Full(event)) => {
                let _ = self.depth_rx_for_evict.try_recv();
                metrics::record_event_dropped(&self.symbol, "depth");
                // The slot just freed may have been taken by a racing
                // consumer recv; a second Full here just drops this event.
                let _ = self.depth_tx.try_send(event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn push_trade(&self, trade: AggTrade) {
        match self.trade_tx.try_send(trade) {
            Ok(()) => metrics::record_event_received(&self.symbol, "trade"),
            Err(TrySendError::Full(_)) => {
                metrics::record_event_dropped(&self.symbol, "trade");
                warn!(symbol = %self.symbol, "trade queue saturated, dropping trade");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Handle returned to the owner of a spawned [`CoreLoop`] thread.
pub struct CoreLoopHandle {
    pub channels: EngineChannels,
    /// Lock-free, always-current book snapshot. External readers (the
    /// dashboard collaborator) `load()` this directly instead of going
    /// through the core loop's channels, which only carry inbound events.
    pub book_snapshot: Arc<ArcSwap<OrderBookSnapshot>>,
    shutdown: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl CoreLoopHandle {
    /// Signals the loop to drain its queues and exit, then blocks until it
    /// has.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CoreLoopHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.shutdown();
        }
    }
}

/// One symbol's full pipeline: book, preprocessor, detectors, signal
/// manager. Constructed once per tracked symbol and run on its own thread.
pub struct CoreLoop {
    symbol: String,
    book: OrderBookState,
    preprocessor: OrderFlowPreprocessor,
    absorption: AbsorptionDetector,
    exhaustion: ExhaustionDetector,
    iceberg: IcebergDetector,
    spoofing: SpoofingDetector,
    anomaly: AnomalyDetector,
    signal_manager: SignalManager,
    clock: Clock,
    last_cleanup_ms: i64,
    book_snapshot: Arc<ArcSwap<OrderBookSnapshot>>,
}

const CLEANUP_INTERVAL_MS: i64 = 30_000;

impl CoreLoop {
    pub fn new(symbol: impl Into<String>, config: &EngineConfig) -> Self {
        let symbol = symbol.into();
        let book = OrderBookState::new(symbol.clone(), config.book.clone());
        let book_snapshot = Arc::new(ArcSwap::from_pointee(book.snapshot()));
        Self {
            book,
            preprocessor: OrderFlowPreprocessor::new(
                config.tick_size,
                config.preprocessor.clone(),
                config.zone.clone(),
            ),
            absorption: AbsorptionDetector::new(config.absorption.clone(), config.tick_size),
            exhaustion: ExhaustionDetector::new(config.exhaustion.clone(), config.tick_size),
            iceberg: IcebergDetector::new(config.iceberg.clone()),
            spoofing: SpoofingDetector::new(config.spoofing.clone(), config.tick_size),
            anomaly: AnomalyDetector::new(config.anomaly.clone()),
            signal_manager: SignalManager::new(config.signal_manager.clone()),
            clock: Clock::new(),
            last_cleanup_ms: 0,
            book_snapshot,
            symbol,
        }
    }

    /// Clone of the handle external readers (the dashboard collaborator)
    /// poll for the current book state without locking.
    pub fn book_snapshot_handle(&self) -> Arc<ArcSwap<OrderBookSnapshot>> {
        self.book_snapshot.clone()
    }

    /// Spawns the loop on a dedicated OS thread, optionally pinned to a
    /// core. Returns a handle whose `channels` feed it from the edge
    /// client's callbacks.
    pub fn spawn(mut self, pin_to_core: Option<usize>) -> CoreLoopHandle {
        let (depth_tx, depth_rx) = bounded::<InboundEvent>(DEPTH_QUEUE_CAPACITY);
        let (trade_tx, trade_rx) = bounded::<AggTrade>(TRADE_QUEUE_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = shutdown.clone();
        let symbol = self.symbol.clone();
        let book_snapshot = self.book_snapshot_handle();

        let channels = EngineChannels {
            depth_tx,
            depth_rx_for_evict: depth_rx.clone(),
            trade_tx,
            symbol: symbol.clone(),
        };

        let join = std::thread::Builder::new()
            .name(format!("flowedge-core-{symbol}"))
            .spawn(move || {
                if let Some(core_id) = pin_to_core {
                    if let Some(core_ids) = core_affinity::get_core_ids() {
                        if let Some(id) = core_ids.into_iter().find(|c| c.id == core_id) {
                            core_affinity::set_for_current(id);
                        } else {
                            warn!(core_id, "requested core id not present, running unpinned");
                        }
                    }
                }
                self.run(depth_rx, trade_rx, shutdown_for_thread);
            })
            .expect("failed to spawn core loop thread");

        CoreLoopHandle {
            channels,
            book_snapshot,
            shutdown,
            join: Some(join),
        }
    }

    /// Drains both queues until shutdown is requested and both are empty,
    /// processing depth before trades whenever both are ready so the book is
    /// never stale relative to a trade drawn from the same instant.
    fn run(
        &mut self,
        depth_rx: Receiver<InboundEvent>,
        trade_rx: Receiver<AggTrade>,
        shutdown: Arc<AtomicBool>,
    ) {
        info!(symbol = %self.symbol, "core loop started");
        loop {
            let mut did_work = false;

            while let Ok(event) = depth_rx.try_recv() {
                self.handle_depth_event(event);
                did_work = true;
            }

            if let Ok(trade) = trade_rx.try_recv() {
                self.handle_trade(trade);
                did_work = true;
            }

            if !did_work {
                if shutdown.load(Ordering::SeqCst) && depth_rx.is_empty() && trade_rx.is_empty() {
                    break;
                }
                match trade_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(trade) => self.handle_trade(trade),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        if depth_rx.is_empty() {
                            break;
                        }
                    }
                }
            }
        }
        info!(symbol = %self.symbol, "core loop stopped");
    }

    fn handle_depth_event(&mut self, event: InboundEvent) {
        let now_ms = self.now_ms();
        match event {
            InboundEvent::Snapshot(snapshot) => {
                self.book.recover(snapshot, Vec::new(), now_ms);
                metrics::record_book_state(&self.symbol, book_state_code(self.book.state()));
                self.book_snapshot.store(Arc::new(self.book.snapshot()));
            }
            InboundEvent::Depth(update) => {
                let outcome = self.book.apply_depth(&update, now_ms);
                if outcome == ApplyOutcome::GapDetected {
                    metrics::record_sequence_gap(&self.symbol);
                    warn!(symbol = %self.symbol, "book degraded pending re-snapshot");
                }
                metrics::record_book_state(&self.symbol, book_state_code(self.book.state()));
                self.book_snapshot.store(Arc::new(self.book.snapshot()));
                self.maybe_cleanup(now_ms);
            }
            InboundEvent::Trade(trade) => self.handle_trade(trade),
        }
    }

    fn handle_trade(&mut self, trade: AggTrade) {
        let start = self.clock.now();
        let now_ms = trade.ts_ms;

        self.book.purge_crossed_levels();
        self.book.prune_stale(now_ms);

        let enriched = self.preprocessor.process(trade, &self.book);

        let anomalies = self.anomaly.on_enriched_trade(&enriched);
        for a in &anomalies {
            debug!(symbol = %self.symbol, kind = ?a.kind, "anomaly detected");
        }
        let health = self.anomaly.market_health(now_ms);

        let candidates = [
            self.absorption.on_enriched_trade(&enriched, &self.spoofing),
            self.exhaustion.on_enriched_trade(&enriched),
            self.iceberg.on_enriched_trade(&enriched),
        ];

        if let Some(candidate) = self.spoofing.on_book_update(&self.book, now_ms) {
            metrics::record_signal_candidate(&self.symbol, signal_kind_label(candidate.kind));
            self.emit(candidate, &health);
        }

        for candidate in candidates.into_iter().flatten() {
            metrics::record_signal_candidate(&self.symbol, signal_kind_label(candidate.kind));
            self.emit(candidate, &health);
        }

        for detector_name in ["absorption", "exhaustion", "iceberg", "spoofing", "anomaly"] {
            let errors = match detector_name {
                "absorption" => self.absorption.error_count(),
                "exhaustion" => self.exhaustion.error_count(),
                "iceberg" => self.iceberg.error_count(),
                "spoofing" => self.spoofing.error_count(),
                "anomaly" => self.anomaly.error_count(),
                _ => 0,
            };
            if errors > 0 {
                metrics::record_detector_error(&self.symbol, static_detector_name(detector_name));
            }
        }

        self.maybe_cleanup(now_ms);
        let elapsed_us = self.clock.now().duration_since(start).as_micros() as f64;
        metrics::record_pipeline_latency_us(&self.symbol, elapsed_us);
    }

    fn emit(&mut self, candidate: crate::model::SignalCandidate, health: &crate::model::MarketHealth) {
        let kind_label = signal_kind_label(candidate.kind);
        match self.signal_manager.process(candidate, health) {
            Ok(confirmed) => {
                metrics::record_signal_confirmed(&self.symbol, kind_label);
                info!(
                    symbol = %self.symbol,
                    kind = kind_label,
                    confidence = confirmed.final_confidence,
                    price = confirmed.final_price,
                    side = ?confirmed.side,
                    "signal confirmed"
                );
            }
            Err(reason) => {
                metrics::record_signal_dropped(&self.symbol, drop_reason_label(reason));
            }
        }
    }

    fn maybe_cleanup(&mut self, now_ms: i64) {
        if now_ms - self.last_cleanup_ms < CLEANUP_INTERVAL_MS {
            return;
        }
        self.last_cleanup_ms = now_ms;
        self.absorption.cleanup(now_ms);
        self.exhaustion.cleanup(now_ms);
        self.iceberg.cleanup(now_ms);
        self.spoofing.cleanup(now_ms);
        self.anomaly.cleanup(now_ms);
    }

    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

fn signal_kind_label(kind: crate::model::SignalKind) -> &'static str {
    use crate::model::SignalKind;
    match kind {
        SignalKind::Absorption => "absorption",
        SignalKind::Exhaustion => "exhaustion",
        SignalKind::Accumulation => "accumulation",
        SignalKind::Distribution => "distribution",
        SignalKind::Iceberg => "iceberg",
        SignalKind::Spoofing => "spoofing",
    }
}

fn book_state_code(state: BookState) -> u8 {
    match state {
        BookState::Uninit => 0,
        BookState::Recovering => 1,
        BookState::Ready => 2,
        BookState::Degraded => 3,
    }
}

fn drop_reason_label(reason: crate::signal_manager::DropReason) -> &'static str {
    match reason {
        crate::signal_manager::DropReason::BlockedByHealth => "blocked_by_health",
        crate::signal_manager::DropReason::BelowConfidenceThreshold => "below_confidence",
        crate::signal_manager::DropReason::Deduped => "deduped",
    }
}

fn static_detector_name(name: &str) -> &'static str {
    match name {
        "absorption" => "absorption",
        "exhaustion" => "exhaustion",
        "iceberg" => "iceberg",
        "spoofing" => "spoofing",
        "anomaly" => "anomaly",
        _ => "unknown",
    }
}

/// Wires an [`EdgeReceiverClient`](crate::edge::EdgeReceiverClient)'s
/// callbacks to the given symbols' [`EngineChannels`], and starts it.
/// Returns the client so the caller can own its lifetime (and drive
/// [`crate::edge::EdgeFallbackController`] from it).
pub fn connect_client(
    client: Arc<crate::edge::EdgeReceiverClient>,
    channels_by_symbol: std::collections::HashMap<SymbolId, EngineChannels>,
) -> EngineResult<()> {
    let depth_channels = channels_by_symbol.clone();
    client.set_depth_callback(move |decoded| {
        if let Some(channels) = depth_channels.get(&decoded.symbol) {
            let symbol_str = decoded.symbol.as_str();
            channels.push_depth(decoded_depth_to_event(symbol_str, decoded));
        }
    });

    let trade_channels = channels_by_symbol;
    client.set_trade_callback(move |trade| {
        if let Some(channels) = trade_channels.get(&trade.symbol()) {
            channels.push_trade(wire_trade_to_agg_trade(&trade));
        }
    });

    client.start().map_err(|e| {
        crate::error::EngineError::Startup(std::io::Error::new(std::io::ErrorKind::Other, e))
    })
}

/// Convenience used by `main.rs`: spins up one `CoreLoop` per configured
/// symbol and returns their handles plus the shared `EngineChannels` map
/// the edge client callbacks should be wired to.
pub fn spawn_core_loops(
    symbols: &[String],
    config: &EngineConfig,
    pin_base_core: Option<usize>,
) -> (Vec<CoreLoopHandle>, std::collections::HashMap<SymbolId, EngineChannels>) {
    let mut handles = Vec::with_capacity(symbols.len());
    let mut by_symbol = std::collections::HashMap::with_capacity(symbols.len());

    for (i, symbol) in symbols.iter().enumerate() {
        let core_loop = CoreLoop::new(symbol.clone(), config);
        let pin = pin_base_core.map(|base| base + i);
        let handle = core_loop.spawn(pin);
        by_symbol.insert(SymbolId::from_str(symbol), handle.channels.clone());
        handles.push(handle);
    }

    (handles, by_symbol)
}

/// Binds the Prometheus scrape endpoint, if configured.
pub fn maybe_install_metrics(addr: Option<SocketAddr>) -> EngineResult<()> {
    match addr {
        Some(addr) => metrics::install_exporter(addr),
        None => Ok(()),
    }
}
