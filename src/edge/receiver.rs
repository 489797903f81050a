//! Edge Receiver - runs close to the exchange.
//!
//! Connects to Binance depth-diff and aggTrade streams, parses JSON, and
//! forwards normalized binary packets to the engine via UDP.

use std::{
    collections::HashMap,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::wire::{
    EdgeFlags, SymbolId, WireDepthHeader, WireDepthRow, WireTrade, RECORD_KIND_DEPTH,
    RECORD_KIND_TRADE,
};

/// Configuration for the edge receiver.
#[derive(Debug, Clone)]
pub struct EdgeReceiverConfig {
    /// Symbols to subscribe to.
    pub symbols: Vec<String>,
    /// Binance WebSocket URL.
    pub binance_ws_url: String,
    /// Destination address for forwarding (engine).
    pub forward_addr: SocketAddr,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Stale threshold (mark data as stale if older than this).
    pub stale_threshold: Duration,
    /// CPU core to pin to (None = no pinning).
    pub pin_to_core: Option<usize>,
    /// Max depth levels forwarded per side of a diff update.
    pub depth_levels: usize,
}

impl Default for EdgeReceiverConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "LTCUSDT".to_string()],
            binance_ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            forward_addr: "127.0.0.1:19876".parse().unwrap(),
            heartbeat_interval: Duration::from_millis(100),
            stale_threshold: Duration::from_millis(100),
            pin_to_core: None,
            depth_levels: 20,
        }
    }
}

/// Per-symbol state for sequence gap detection.
struct SymbolState {
    last_update_id: u64,
    last_exchange_ts_ms: i64,
    gap_count: u64,
}

/// Statistics for the edge receiver.
#[derive(Debug, Default)]
pub struct EdgeReceiverStats {
    pub depth_received: AtomicU64,
    pub trades_received: AtomicU64,
    pub depth_forwarded: AtomicU64,
    pub trades_forwarded: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub gaps_detected: AtomicU64,
    pub parse_errors: AtomicU64,
    pub send_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl EdgeReceiverStats {
    pub fn snapshot(&self) -> EdgeReceiverStatsSnapshot {
        EdgeReceiverStatsSnapshot {
            depth_received: self.depth_received.load(Ordering::Relaxed),
            trades_received: self.trades_received.load(Ordering::Relaxed),
            depth_forwarded: self.depth_forwarded.load(Ordering::Relaxed),
            trades_forwarded: self.trades_forwarded.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EdgeReceiverStatsSnapshot {
    pub depth_received: u64,
    pub trades_received: u64,
    pub depth_forwarded: u64,
    pub trades_forwarded: u64,
    pub heartbeats_sent: u64,
    pub gaps_detected: u64,
    pub parse_errors: u64,
    pub send_errors: u64,
    pub reconnects: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// The edge receiver that forwards Binance depth/trade data.
pub struct EdgeReceiver {
    config: EdgeReceiverConfig,
    running: Arc<AtomicBool>,
    seq: AtomicU64,
    stats: Arc<EdgeReceiverStats>,
    symbol_states: RwLock<HashMap<String, SymbolState>>,
    start_instant: Instant,
}

impl EdgeReceiver {
    pub fn new(config: EdgeReceiverConfig) -> Arc<Self> {
        let symbol_states: HashMap<String, SymbolState> = config
            .symbols
            .iter()
            .map(|s| {
                (
                    s.to_uppercase(),
                    SymbolState {
                        last_update_id: 0,
                        last_exchange_ts_ms: 0,
                        gap_count: 0,
                    },
                )
            })
            .collect();

        Arc::new(Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            seq: AtomicU64::new(1),
            stats: Arc::new(EdgeReceiverStats::default()),
            symbol_states: RwLock::new(symbol_states),
            start_instant: Instant::now(),
        })
    }

    #[inline]
    fn now_ms(&self) -> i64 {
        self.start_instant.elapsed().as_millis() as i64
    }

    #[inline]
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn stats(&self) -> &EdgeReceiverStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Start the receiver (blocking).
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::{connect_async, tungstenite::Message};

        self.running.store(true, Ordering::SeqCst);

        #[cfg(target_os = "linux")]
        if let Some(core) = self.config.pin_to_core {
            if let Some(core_ids) = core_affinity::get_core_ids() {
                if core < core_ids.len() {
                    core_affinity::set_for_current(core_ids[core]);
                    info!("Pinned to core {}", core);
                }
            }
        }

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(false)?;
        socket.connect(self.config.forward_addr)?;
        info!("Forwarding to {}", self.config.forward_addr);

        let streams: Vec<String> = self
            .config
            .symbols
            .iter()
            .flat_map(|s| {
                let lower = s.to_lowercase();
                vec![format!("{lower}@depth@100ms"), format!("{lower}@aggTrade")]
            })
            .collect();
        let url = format!(
            "{}/stream?streams={}",
            self.config.binance_ws_url,
            streams.join("/")
        );

        let mut reconnect_delay = Duration::from_millis(100);

        while self.running.load(Ordering::Relaxed) {
            info!("Connecting to {}", url);

            match connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    reconnect_delay = Duration::from_millis(100);
                    let (mut write, mut read) = ws_stream.split();

                    let heartbeat_self = self.clone();
                    let socket_clone = socket.try_clone()?;

                    let heartbeat_handle = tokio::spawn(async move {
                        let mut interval = tokio::time::interval(heartbeat_self.config.heartbeat_interval);
                        while heartbeat_self.running.load(Ordering::Relaxed) {
                            interval.tick().await;
                            for symbol_str in &heartbeat_self.config.symbols {
                                let symbol = SymbolId::from_str(symbol_str);
                                let seq = heartbeat_self.next_seq();
                                let packet = WireDepthHeader::heartbeat(symbol, seq, heartbeat_self.now_ms());
                                if let Err(e) = heartbeat_self.send_tagged(&socket_clone, RECORD_KIND_DEPTH, &packet) {
                                    warn!("Heartbeat send error: {}", e);
                                } else {
                                    heartbeat_self.stats.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    });

                    while self.running.load(Ordering::Relaxed) {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        self.stats.bytes_received.fetch_add(text.len() as u64, Ordering::Relaxed);
                                        self.handle_message(&socket, &text);
                                    }
                                    Some(Ok(Message::Ping(payload))) => {
                                        let _ = write.send(Message::Pong(payload)).await;
                                    }
                                    Some(Ok(Message::Close(_))) => {
                                        info!("WebSocket closed by server");
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        warn!("WebSocket error: {}", e);
                                        break;
                                    }
                                    None => {
                                        info!("WebSocket stream ended");
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }

                    heartbeat_handle.abort();
                }
                Err(e) => {
                    error!("Connection failed: {}", e);
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                }
            }

            if self.running.load(Ordering::Relaxed) {
                info!("Reconnecting in {:?}...", reconnect_delay);
                tokio::time::sleep(reconnect_delay).await;
                reconnect_delay = (reconnect_delay * 2).min(Duration::from_secs(30));
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    fn handle_message(&self, socket: &UdpSocket, msg: &str) {
        let Some(stream_start) = msg.find("\"stream\":\"") else {
            self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let stream_value_start = stream_start + 10;
        let Some(stream_end) = msg[stream_value_start..].find('"') else {
            self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let stream_name = msg[stream_value_start..stream_value_start + stream_end].to_lowercase();

        if stream_name.contains("@aggtrade") {
            if let Some(packet) = self.parse_trade(msg) {
                self.stats.trades_received.fetch_add(1, Ordering::Relaxed);
                if self.send_tagged(socket, RECORD_KIND_TRADE, &packet).is_ok() {
                    self.stats.trades_forwarded.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            }
        } else if stream_name.contains("@depth") {
            if let Some(packet) = self.parse_depth(msg) {
                self.stats.depth_received.fetch_add(1, Ordering::Relaxed);
                if self.send_tagged(socket, RECORD_KIND_DEPTH, &packet).is_ok() {
                    self.stats.depth_forwarded.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn send_tagged(&self, socket: &UdpSocket, kind: u8, payload: &[u8]) -> std::io::Result<()> {
        let mut framed = Vec::with_capacity(payload.len() + 1);
        framed.push(kind);
        framed.extend_from_slice(payload);
        socket.send(&framed)?;
        self.stats.bytes_sent.fetch_add(framed.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Parse a combined-stream depth-diff event into a `WireDepthHeader` packet.
    fn parse_depth(&self, msg: &str) -> Option<Vec<u8>> {
        let data_start = msg.find("\"data\":")?;
        let data = &msg[data_start + 7..];

        let symbol_str = self.extract_quoted_str(data, "\"s\":\"")?;
        let symbol = SymbolId::from_str(symbol_str);
        if symbol == SymbolId::Unknown {
            return None;
        }

        let first_update_id = self.extract_u64(data, "\"U\":")?;
        let final_update_id = self.extract_u64(data, "\"u\":")?;
        let event_time_ms = self.extract_i64(data, "\"E\":").unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let bids = self.extract_pair_array(data, "\"b\":", self.config.depth_levels);
        let asks = self.extract_pair_array(data, "\"a\":", self.config.depth_levels);

        let mut flags = 0u8;
        {
            let mut states = self.symbol_states.write();
            if let Some(state) = states.get_mut(symbol_str) {
                if state.last_update_id > 0 && first_update_id > state.last_update_id + 1 {
                    flags |= EdgeFlags::GAP_DETECTED;
                    state.gap_count += 1;
                    self.stats.gaps_detected.fetch_add(1, Ordering::Relaxed);
                    debug!("Gap detected for {}: {} -> {}", symbol_str, state.last_update_id, first_update_id);
                }
                state.last_update_id = final_update_id;
                state.last_exchange_ts_ms = event_time_ms;
            }
        }

        let age_ms = self.now_ms() - event_time_ms;
        if age_ms > self.config.stale_threshold.as_millis() as i64 {
            flags |= EdgeFlags::STALE;
        }

        WireDepthHeader::encode_update(
            symbol,
            first_update_id,
            final_update_id,
            event_time_ms,
            &bids,
            &asks,
            flags,
        )
        .ok()
    }

    /// Parse a combined-stream aggTrade event into a `WireTrade` packet.
    fn parse_trade(&self, msg: &str) -> Option<Vec<u8>> {
        let data_start = msg.find("\"data\":")?;
        let data = &msg[data_start + 7..];

        let symbol_str = self.extract_quoted_str(data, "\"s\":\"")?;
        let symbol = SymbolId::from_str(symbol_str);
        if symbol == SymbolId::Unknown {
            return None;
        }

        let trade_id = self.extract_u64(data, "\"a\":")?;
        let price = self.extract_quoted_f64(data, "\"p\":\"")?;
        let qty = self.extract_quoted_f64(data, "\"q\":\"")?;
        let ts_ms = self.extract_i64(data, "\"T\":")?;
        let buyer_is_maker = data.find("\"m\":true").is_some();

        let price_fixed = (price * super::wire::FIXED_POINT_SCALE) as i64;
        let qty_fixed = (qty * super::wire::FIXED_POINT_SCALE) as i64;

        let trade = WireTrade::new(symbol, trade_id, price_fixed, qty_fixed, ts_ms, buyer_is_maker);
        Some(trade.to_bytes().to_vec())
    }

    #[inline]
    fn extract_quoted_str<'a>(&self, data: &'a str, prefix: &str) -> Option<&'a str> {
        let start = data.find(prefix)?;
        let value_start = start + prefix.len();
        let end = data[value_start..].find('"')?;
        Some(&data[value_start..value_start + end])
    }

    #[inline]
    fn extract_quoted_f64(&self, data: &str, prefix: &str) -> Option<f64> {
        let start = data.find(prefix)?;
        let value_start = start + prefix.len();
        let end = data[value_start..].find('"')?;
        data[value_start..value_start + end].parse().ok()
    }

    #[inline]
    fn extract_u64(&self, data: &str, prefix: &str) -> Option<u64> {
        let start = data.find(prefix)?;
        let value_start = start + prefix.len();
        let end = data[value_start..]
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(data.len() - value_start);
        data[value_start..value_start + end].parse().ok()
    }

    #[inline]
    fn extract_i64(&self, data: &str, prefix: &str) -> Option<i64> {
        let start = data.find(prefix)?;
        let value_start = start + prefix.len();
        let end = data[value_start..]
            .find(|c: char| !c.is_ascii_digit() && c != '-')
            .unwrap_or(data.len() - value_start);
        data[value_start..value_start + end].parse().ok()
    }

    /// Extract up to `limit` `["price","qty"]` pairs from a `"key":[[...],...]`
    /// array, converting each to fixed-point `WireDepthRow`s.
    fn extract_pair_array(&self, data: &str, key: &str, limit: usize) -> Vec<WireDepthRow> {
        let mut rows = Vec::new();
        let Some(key_start) = data.find(key) else { return rows };
        let Some(arr_start) = data[key_start..].find('[') else { return rows };
        let mut cursor = key_start + arr_start + 1;

        while rows.len() < limit {
            let Some(rel_open) = data[cursor..].find('[') else { break };
            let pair_open = cursor + rel_open;
            // Stop if we've exited the outer array (a ']' appears before the
            // next '[').
            if let Some(rel_close_outer) = data[cursor..].find(']') {
                if cursor + rel_close_outer < pair_open {
                    break;
                }
            }
            let Some(rel_close) = data[pair_open..].find(']') else { break };
            let pair_close = pair_open + rel_close;
            let pair = &data[pair_open + 1..pair_close];

            let mut parts = pair.splitn(2, ',');
            let (Some(price_raw), Some(qty_raw)) = (parts.next(), parts.next()) else { break };
            let price = price_raw.trim().trim_matches('"').parse::<f64>().ok();
            let qty = qty_raw.trim().trim_matches('"').parse::<f64>().ok();
            if let (Some(price), Some(qty)) = (price, qty) {
                rows.push(WireDepthRow {
                    price: (price * super::wire::FIXED_POINT_SCALE) as i64,
                    qty: (qty * super::wire::FIXED_POINT_SCALE) as i64,
                });
            }
            cursor = pair_close + 1;
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_depth_diff_message() {
        let config = EdgeReceiverConfig::default();
        let receiver = EdgeReceiver::new(config);

        let msg = r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","E":1700000000123,"s":"BTCUSDT","U":157,"u":160,"b":[["50000.10","1.5"],["49999.90","2.0"]],"a":[["50001.20","0.8"]]}}"#;

        let packet = receiver.parse_depth(msg).unwrap();
        let (header, bids, asks) = WireDepthHeader::decode(&packet).unwrap();
        assert_eq!(header.symbol(), SymbolId::BtcUsdt);
        assert_eq!(bids.len(), 2);
        assert_eq!(asks.len(), 1);
        assert_eq!({ bids[0].price }, 5_000_010_000_000);
    }

    #[test]
    fn parses_agg_trade_message() {
        let config = EdgeReceiverConfig::default();
        let receiver = EdgeReceiver::new(config);

        let msg = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","a":998877,"s":"BTCUSDT","p":"50000.12","q":"0.5","T":1700000000456,"m":true}}"#;

        let bytes = receiver.parse_trade(msg).unwrap();
        let trade = WireTrade::try_from_slice(&bytes).unwrap();
        assert_eq!({ trade.trade_id }, 998877);
        assert_eq!(trade.symbol(), SymbolId::BtcUsdt);
        assert!(trade.is_buyer_maker());
    }

    #[test]
    fn detects_sequence_gap() {
        let config = EdgeReceiverConfig::default();
        let receiver = EdgeReceiver::new(config);

        let first = r#"{"stream":"btcusdt@depth@100ms","data":{"E":1,"s":"BTCUSDT","U":1,"u":5,"b":[["1.0","1.0"]],"a":[]}}"#;
        let second = r#"{"stream":"btcusdt@depth@100ms","data":{"E":2,"s":"BTCUSDT","U":10,"u":12,"b":[["1.0","1.0"]],"a":[]}}"#;

        let p1 = receiver.parse_depth(first).unwrap();
        let (h1, _, _) = WireDepthHeader::decode(&p1).unwrap();
        assert!(!h1.has_gap());

        let p2 = receiver.parse_depth(second).unwrap();
        let (h2, _, _) = WireDepthHeader::decode(&p2).unwrap();
        assert!(h2.has_gap());
    }
}
