//! Edge Receiver Client - runs alongside the engine.
//!
//! Receives binary packets from the edge receiver via UDP, handles
//! loss/reorder on the depth stream, and hands decoded depth/trade events to
//! the core loop.

use std::{
    collections::HashMap,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::wire::{
    SymbolId, WireDepthHeader, WireDepthRow, WireTrade, RECORD_KIND_DEPTH, RECORD_KIND_TRADE,
};

/// Maximum UDP datagram this client expects to receive.
const RECV_BUF_SIZE: usize = 8192;

/// A decoded depth update, ready for `OrderBookState::apply_depth`.
#[derive(Debug, Clone)]
pub struct DecodedDepth {
    pub symbol: SymbolId,
    pub sequence_first: u64,
    pub sequence_last: u64,
    pub event_time_ms: i64,
    pub is_snapshot: bool,
    pub bids: Vec<WireDepthRow>,
    pub asks: Vec<WireDepthRow>,
}

/// Configuration for the edge receiver client.
#[derive(Debug, Clone)]
pub struct EdgeReceiverClientConfig {
    pub bind_addr: SocketAddr,
    pub reorder_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub reorder_buffer_size: usize,
    pub quic_fallback_threshold: f64,
}

impl Default for EdgeReceiverClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:19876".parse().unwrap(),
            reorder_timeout: Duration::from_millis(5),
            heartbeat_timeout: Duration::from_millis(500),
            reorder_buffer_size: 16,
            quic_fallback_threshold: 0.01,
        }
    }
}

/// Sequence tracking result, evaluated against a depth packet's
/// `sequence_first`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Ok,
    Duplicate,
    Gap { missing: u64 },
}

/// Tracks `sequence_last` per symbol to detect gaps and duplicates between
/// successive depth packets.
pub struct SequenceTracker {
    last_seq: u64,
    initialized: bool,
    gaps: Vec<(u64, u64)>,
    dup_count: u64,
    gap_count: u64,
    total_missing: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self {
            last_seq: 0,
            initialized: false,
            gaps: Vec::new(),
            dup_count: 0,
            gap_count: 0,
            total_missing: 0,
        }
    }

    pub fn check(&mut self, sequence_first: u64, sequence_last: u64) -> SequenceStatus {
        if !self.initialized {
            self.initialized = true;
            self.last_seq = sequence_last;
            return SequenceStatus::Ok;
        }

        if sequence_first == self.last_seq + 1 {
            self.last_seq = sequence_last;
            SequenceStatus::Ok
        } else if sequence_last <= self.last_seq {
            self.dup_count += 1;
            SequenceStatus::Duplicate
        } else {
            let missing = sequence_first - self.last_seq - 1;
            self.gaps.push((self.last_seq + 1, sequence_first));
            self.gap_count += 1;
            self.total_missing += missing;
            self.last_seq = sequence_last;
            SequenceStatus::Gap { missing }
        }
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (self.gap_count, self.dup_count, self.total_missing)
    }
}

struct BufferedDepth {
    depth: DecodedDepth,
    recv_time: Instant,
}

/// Reorder buffer with timeout-based delivery, keyed by `sequence_first`.
struct ReorderBuffer {
    items: Vec<BufferedDepth>,
    max_size: usize,
    timeout: Duration,
}

impl ReorderBuffer {
    fn new(max_size: usize, timeout: Duration) -> Self {
        Self {
            items: Vec::with_capacity(max_size),
            max_size,
            timeout,
        }
    }

    fn insert(&mut self, depth: DecodedDepth) {
        if self.items.len() >= self.max_size {
            self.items.remove(0);
        }
        self.items.push(BufferedDepth { depth, recv_time: Instant::now() });
        self.items.sort_by_key(|b| b.depth.sequence_first);
    }

    fn drain_ready(&mut self, expected_seq: u64) -> Vec<DecodedDepth> {
        let now = Instant::now();
        let mut ready = Vec::new();
        let mut expected = expected_seq;

        while !self.items.is_empty() && self.items[0].depth.sequence_first == expected {
            let item = self.items.remove(0);
            expected = item.depth.sequence_last + 1;
            ready.push(item.depth);
        }

        while !self.items.is_empty() {
            let age = now.duration_since(self.items[0].recv_time);
            if age >= self.timeout {
                ready.push(self.items.remove(0).depth);
            } else {
                break;
            }
        }

        ready
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug, Default)]
pub struct EdgeClientStats {
    pub depth_received: AtomicU64,
    pub trades_received: AtomicU64,
    pub depth_delivered: AtomicU64,
    pub trades_delivered: AtomicU64,
    pub heartbeats_received: AtomicU64,
    pub gaps_detected: AtomicU64,
    pub duplicates: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub reorder_events: AtomicU64,
    pub timeout_deliveries: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl EdgeClientStats {
    pub fn snapshot(&self) -> EdgeClientStatsSnapshot {
        EdgeClientStatsSnapshot {
            depth_received: self.depth_received.load(Ordering::Relaxed),
            trades_received: self.trades_received.load(Ordering::Relaxed),
            depth_delivered: self.depth_delivered.load(Ordering::Relaxed),
            trades_delivered: self.trades_delivered.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            reorder_events: self.reorder_events.load(Ordering::Relaxed),
            timeout_deliveries: self.timeout_deliveries.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EdgeClientStatsSnapshot {
    pub depth_received: u64,
    pub trades_received: u64,
    pub depth_delivered: u64,
    pub trades_delivered: u64,
    pub heartbeats_received: u64,
    pub gaps_detected: u64,
    pub duplicates: u64,
    pub checksum_errors: u64,
    pub malformed_packets: u64,
    pub reorder_events: u64,
    pub timeout_deliveries: u64,
    pub bytes_received: u64,
}

/// The edge receiver client: decodes UDP packets and dispatches depth/trade
/// callbacks on a dedicated thread.
pub struct EdgeReceiverClient {
    config: EdgeReceiverClientConfig,
    running: Arc<AtomicBool>,
    stats: Arc<EdgeClientStats>,
    last_heartbeat: Arc<RwLock<Instant>>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
    depth_callback: Arc<RwLock<Option<Box<dyn Fn(DecodedDepth) + Send + Sync>>>>,
    trade_callback: Arc<RwLock<Option<Box<dyn Fn(WireTrade) + Send + Sync>>>>,
    start_instant: Instant,
}

impl EdgeReceiverClient {
    pub fn new(config: EdgeReceiverClientConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(EdgeClientStats::default()),
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            recv_thread: Mutex::new(None),
            depth_callback: Arc::new(RwLock::new(None)),
            trade_callback: Arc::new(RwLock::new(None)),
            start_instant: Instant::now(),
        })
    }

    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.start_instant.elapsed().as_nanos() as u64
    }

    pub fn set_depth_callback<F>(&self, callback: F)
    where
        F: Fn(DecodedDepth) + Send + Sync + 'static,
    {
        *self.depth_callback.write() = Some(Box::new(callback));
    }

    pub fn set_trade_callback<F>(&self, callback: F)
    where
        F: Fn(WireTrade) + Send + Sync + 'static,
    {
        *self.trade_callback.write() = Some(Box::new(callback));
    }

    pub fn is_stale(&self) -> bool {
        self.last_heartbeat.read().elapsed() > self.config.heartbeat_timeout
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.read().elapsed()
    }

    pub fn stats(&self) -> &EdgeClientStats {
        &self.stats
    }

    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut handle = self.recv_thread.lock();
        if handle.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);

        let client = self.clone();
        let socket = UdpSocket::bind(client.config.bind_addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(50)))?;

        info!("Edge client listening on {}", client.config.bind_addr);

        let thread = thread::Builder::new()
            .name("edge-receiver-client".to_string())
            .spawn(move || {
                client.recv_loop(socket);
            })?;

        *handle = Some(thread);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.recv_thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn recv_loop(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = [0u8; RECV_BUF_SIZE];
        let mut trackers: HashMap<SymbolId, SequenceTracker> = HashMap::new();
        let mut buffers: HashMap<SymbolId, ReorderBuffer> = HashMap::new();

        while self.running.load(Ordering::Relaxed) {
            match socket.recv(&mut buf) {
                Ok(n) => {
                    self.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    if n < 1 {
                        self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let kind = buf[0];
                    let payload = &buf[1..n];

                    match kind {
                        RECORD_KIND_DEPTH => self.handle_depth_packet(payload, &mut trackers, &mut buffers),
                        RECORD_KIND_TRADE => self.handle_trade_packet(payload),
                        _ => {
                            self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.drain_all_buffers(&mut trackers, &mut buffers);
                }
                Err(e) => {
                    debug!("Recv error: {}", e);
                }
            }
        }

        info!("Edge receiver client stopped");
    }

    fn handle_depth_packet(
        &self,
        payload: &[u8],
        trackers: &mut HashMap<SymbolId, SequenceTracker>,
        buffers: &mut HashMap<SymbolId, ReorderBuffer>,
    ) {
        match WireDepthHeader::decode(payload) {
            Ok((header, bids, asks)) => {
                *self.last_heartbeat.write() = Instant::now();

                if header.is_heartbeat() {
                    self.stats.heartbeats_received.fetch_add(1, Ordering::Relaxed);
                    return;
                }

                self.stats.depth_received.fetch_add(1, Ordering::Relaxed);
                let symbol = header.symbol();
                let depth = DecodedDepth {
                    symbol,
                    sequence_first: header.sequence_first,
                    sequence_last: header.sequence_last,
                    event_time_ms: header.event_time_ms,
                    is_snapshot: header.is_snapshot(),
                    bids,
                    asks,
                };

                if depth.is_snapshot {
                    trackers.entry(symbol).or_insert_with(SequenceTracker::new).last_seq = depth.sequence_last;
                    trackers.get_mut(&symbol).unwrap().initialized = true;
                    self.deliver_depth(depth);
                    return;
                }

                let tracker = trackers.entry(symbol).or_insert_with(SequenceTracker::new);
                let buffer = buffers
                    .entry(symbol)
                    .or_insert_with(|| ReorderBuffer::new(self.config.reorder_buffer_size, self.config.reorder_timeout));

                match tracker.check(depth.sequence_first, depth.sequence_last) {
                    SequenceStatus::Ok => self.deliver_depth(depth),
                    SequenceStatus::Duplicate => {
                        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    }
                    SequenceStatus::Gap { missing } => {
                        self.stats.gaps_detected.fetch_add(1, Ordering::Relaxed);
                        self.stats.reorder_events.fetch_add(1, Ordering::Relaxed);
                        buffer.insert(depth);
                        debug!("Depth gap: {} missing updates, buffer size {}", missing, buffer.len());
                    }
                }

                let expected = tracker.last_seq + 1;
                for ready in buffer.drain_ready(expected) {
                    tracker.last_seq = tracker.last_seq.max(ready.sequence_last);
                    self.deliver_depth(ready);
                    self.stats.timeout_deliveries.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(super::wire::WireError::ChecksumMismatch) => {
                self.stats.checksum_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn handle_trade_packet(&self, payload: &[u8]) {
        match WireTrade::try_from_slice(payload) {
            Ok(trade) => {
                *self.last_heartbeat.write() = Instant::now();
                self.stats.trades_received.fetch_add(1, Ordering::Relaxed);
                self.stats.trades_delivered.fetch_add(1, Ordering::Relaxed);
                if let Some(callback) = self.trade_callback.read().as_ref() {
                    callback(trade);
                }
            }
            Err(super::wire::WireError::ChecksumMismatch) => {
                self.stats.checksum_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn drain_all_buffers(
        &self,
        trackers: &mut HashMap<SymbolId, SequenceTracker>,
        buffers: &mut HashMap<SymbolId, ReorderBuffer>,
    ) {
        for (symbol, buffer) in buffers.iter_mut() {
            let Some(tracker) = trackers.get_mut(symbol) else { continue };
            let expected = tracker.last_seq + 1;
            for ready in buffer.drain_ready(expected) {
                tracker.last_seq = tracker.last_seq.max(ready.sequence_last);
                self.stats.timeout_deliveries.fetch_add(1, Ordering::Relaxed);
                if let Some(callback) = self.depth_callback.read().as_ref() {
                    callback(ready);
                }
                self.stats.depth_delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn deliver_depth(&self, depth: DecodedDepth) {
        self.stats.depth_delivered.fetch_add(1, Ordering::Relaxed);
        if let Some(callback) = self.depth_callback.read().as_ref() {
            callback(depth);
        }
    }
}

impl Drop for EdgeReceiverClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fallback controller for switching between the edge feed and a direct
/// exchange connection.
pub struct EdgeFallbackController {
    client: Arc<EdgeReceiverClient>,
    fallback_active: AtomicBool,
    last_check: RwLock<Instant>,
    check_interval: Duration,
}

impl EdgeFallbackController {
    pub fn new(client: Arc<EdgeReceiverClient>) -> Self {
        Self {
            client,
            fallback_active: AtomicBool::new(false),
            last_check: RwLock::new(Instant::now()),
            check_interval: Duration::from_secs(1),
        }
    }

    pub fn should_fallback(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_check.write();

        if now.duration_since(*last) < self.check_interval {
            return self.fallback_active.load(Ordering::Relaxed);
        }

        *last = now;

        let should_fallback = self.client.is_stale();

        if should_fallback && !self.fallback_active.load(Ordering::Relaxed) {
            warn!("Edge heartbeat timeout ({:?}), activating fallback", self.client.heartbeat_age());
            self.fallback_active.store(true, Ordering::Relaxed);
        } else if !should_fallback && self.fallback_active.load(Ordering::Relaxed) {
            info!("Edge recovered, deactivating fallback");
            self.fallback_active.store(false, Ordering::Relaxed);
        }

        should_fallback
    }

    pub fn is_fallback_active(&self) -> bool {
        self.fallback_active.load(Ordering::Relaxed)
    }
}
