//! Wire protocol between the edge receiver and the engine's edge client.
//!
//! Three fixed-layout, checksummed record kinds, widened from the
//! single-quote "book ticker" tick this module used to carry into the
//! multi-level depth/trade/snapshot contract the engine actually needs.
//! Depth and snapshot packets share one header type followed by a run of
//! `WireDepthRow` entries; trades are a standalone fixed-size record.

use std::io::{self, Write};

/// Magic bytes: 0xF10E ("flowedge")
pub const WIRE_MAGIC: u16 = 0xF10E;

/// Current protocol version
pub const WIRE_VERSION: u8 = 1;

/// Size of one `WireDepthRow` in bytes
pub const WIRE_DEPTH_ROW_SIZE: usize = 16;

/// Size of `WireDepthHeader` in bytes (rows follow, not included)
pub const WIRE_DEPTH_HEADER_SIZE: usize = 40;

/// Size of `WireTrade` in bytes
pub const WIRE_TRADE_SIZE: usize = 48;

/// Upper bound on levels per side in one depth/snapshot packet. Chosen well
/// above any realistic book depth so legitimate packets never hit it; it
/// exists to cap allocation when decoding an untrusted `bid_count`/`ask_count`.
pub const MAX_DEPTH_LEVELS_PER_SIDE: usize = 512;

/// Price/quantity multiplier for fixed-point (8 decimal places), matching
/// `fixed_math::PRICE_SCALE` / `QUANTITY_SCALE`.
pub const FIXED_POINT_SCALE: f64 = 100_000_000.0;

/// One-byte record-kind tag prepended to every UDP datagram, ahead of the
/// checksummed record itself. Depth headers are variable-length (header +
/// rows) and a `WireTrade` is a fixed 48 bytes, so a coincidental
/// size match (e.g. one depth row total) can't be told apart from a trade
/// by length alone — the tag removes the ambiguity.
pub const RECORD_KIND_DEPTH: u8 = 0;
pub const RECORD_KIND_TRADE: u8 = 1;

/// Symbol identifiers (fits in u8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SymbolId {
    BtcUsdt = 0,
    LtcUsdt = 1,
    Unknown = 255,
}

impl SymbolId {
    pub fn from_str(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "BTCUSDT" => Self::BtcUsdt,
            "LTCUSDT" => Self::LtcUsdt,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BtcUsdt => "BTCUSDT",
            Self::LtcUsdt => "LTCUSDT",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::BtcUsdt,
            1 => Self::LtcUsdt,
            _ => Self::Unknown,
        }
    }
}

/// Flags byte constants shared by depth and trade packets.
#[allow(non_snake_case)]
pub mod EdgeFlags {
    /// Exchange-reported sequence gap detected at the edge.
    pub const GAP_DETECTED: u8 = 0x01;
    /// Heartbeat packet (depth header with zero rows, no price data).
    pub const HEARTBEAT: u8 = 0x02;
    /// Data is stale at the edge.
    pub const STALE: u8 = 0x04;
    /// WebSocket reconnect in progress.
    pub const RECONNECTING: u8 = 0x08;
    /// This is a full snapshot, not an incremental update.
    pub const SNAPSHOT: u8 = 0x10;
}

/// One resting price level (16 bytes, fixed-point).
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct WireDepthRow {
    pub price: i64,
    pub qty: i64,
}

const _: () = assert!(std::mem::size_of::<WireDepthRow>() == WIRE_DEPTH_ROW_SIZE);

impl WireDepthRow {
    pub fn to_bytes(&self) -> [u8; WIRE_DEPTH_ROW_SIZE] {
        let mut buf = [0u8; WIRE_DEPTH_ROW_SIZE];
        let ptr = self as *const Self as *const u8;
        unsafe { std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), WIRE_DEPTH_ROW_SIZE) };
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut arr = [0u8; WIRE_DEPTH_ROW_SIZE];
        arr.copy_from_slice(buf);
        unsafe { std::ptr::read(arr.as_ptr() as *const Self) }
    }
}

/// Header for a depth update or a full snapshot (`bid_count + ask_count`
/// `WireDepthRow` entries follow immediately after this header on the wire).
///
/// Layout (all fields little-endian):
/// ```text
/// Offset  Size  Field
/// 0       2     magic (0xF10E)
/// 2       1     version
/// 3       1     flags
/// 4       1     symbol_id
/// 5       3     padding
/// 8       8     sequence_first
/// 16      8     sequence_last
/// 24      8     event_time_ms
/// 32      2     bid_count
/// 34      2     ask_count
/// 36      4     checksum (CRC32 over header[..36] ++ rows)
/// Total: 40 bytes header, rows follow
/// ```
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct WireDepthHeader {
    pub magic: u16,
    pub version: u8,
    pub flags: u8,
    pub symbol_id: u8,
    pub _pad: [u8; 3],
    pub sequence_first: u64,
    pub sequence_last: u64,
    pub event_time_ms: i64,
    pub bid_count: u16,
    pub ask_count: u16,
    pub checksum: u32,
}

const _: () = assert!(std::mem::size_of::<WireDepthHeader>() == WIRE_DEPTH_HEADER_SIZE);

/// `WireSnapshot` is shape-identical to a depth packet (header + rows) with
/// `sequence_first == sequence_last == last_update_id` and `SNAPSHOT` set.
pub type WireSnapshot = WireDepthHeader;

impl WireDepthHeader {
    fn new(
        symbol: SymbolId,
        sequence_first: u64,
        sequence_last: u64,
        event_time_ms: i64,
        bid_count: u16,
        ask_count: u16,
        flags: u8,
    ) -> Self {
        Self {
            magic: WIRE_MAGIC,
            version: WIRE_VERSION,
            flags,
            symbol_id: symbol as u8,
            _pad: [0; 3],
            sequence_first,
            sequence_last,
            event_time_ms,
            bid_count,
            ask_count,
            checksum: 0,
        }
    }

    /// Build and checksum a depth-update packet.
    pub fn encode_update(
        symbol: SymbolId,
        sequence_first: u64,
        sequence_last: u64,
        event_time_ms: i64,
        bids: &[WireDepthRow],
        asks: &[WireDepthRow],
        extra_flags: u8,
    ) -> Result<Vec<u8>, WireError> {
        Self::encode(
            symbol,
            sequence_first,
            sequence_last,
            event_time_ms,
            bids,
            asks,
            extra_flags,
        )
    }

    /// Zero-row heartbeat packet: keeps a connection's liveness visible to
    /// the client without carrying book data.
    pub fn heartbeat(symbol: SymbolId, seq: u64, event_time_ms: i64) -> Vec<u8> {
        Self::encode(symbol, seq, seq, event_time_ms, &[], &[], EdgeFlags::HEARTBEAT)
            .expect("heartbeat packet never exceeds level cap")
    }

    /// Build and checksum a full-snapshot packet.
    pub fn encode_snapshot(
        symbol: SymbolId,
        last_update_id: u64,
        event_time_ms: i64,
        bids: &[WireDepthRow],
        asks: &[WireDepthRow],
    ) -> Result<Vec<u8>, WireError> {
        Self::encode(
            symbol,
            last_update_id,
            last_update_id,
            event_time_ms,
            bids,
            asks,
            EdgeFlags::SNAPSHOT,
        )
    }

    fn encode(
        symbol: SymbolId,
        sequence_first: u64,
        sequence_last: u64,
        event_time_ms: i64,
        bids: &[WireDepthRow],
        asks: &[WireDepthRow],
        extra_flags: u8,
    ) -> Result<Vec<u8>, WireError> {
        if bids.len() > MAX_DEPTH_LEVELS_PER_SIDE || asks.len() > MAX_DEPTH_LEVELS_PER_SIDE {
            return Err(WireError::TooManyLevels(bids.len().max(asks.len())));
        }

        let mut header = Self::new(
            symbol,
            sequence_first,
            sequence_last,
            event_time_ms,
            bids.len() as u16,
            asks.len() as u16,
            extra_flags,
        );

        let mut body = Vec::with_capacity((bids.len() + asks.len()) * WIRE_DEPTH_ROW_SIZE);
        for row in bids.iter().chain(asks.iter()) {
            body.extend_from_slice(&row.to_bytes());
        }

        header.checksum = header.compute_checksum(&body);

        let mut out = Vec::with_capacity(WIRE_DEPTH_HEADER_SIZE + body.len());
        out.extend_from_slice(&header.header_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a depth/snapshot packet, validating magic, version, level
    /// counts and checksum. Returns the header plus the bid and ask rows.
    pub fn decode(buf: &[u8]) -> Result<(Self, Vec<WireDepthRow>, Vec<WireDepthRow>), WireError> {
        if buf.len() < WIRE_DEPTH_HEADER_SIZE {
            return Err(WireError::InvalidSize(buf.len()));
        }
        let header = Self::header_from_bytes(&buf[..WIRE_DEPTH_HEADER_SIZE]);

        if header.magic != WIRE_MAGIC {
            return Err(WireError::InvalidMagic(header.magic));
        }
        if header.version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(header.version));
        }

        let bid_count = header.bid_count as usize;
        let ask_count = header.ask_count as usize;
        if bid_count > MAX_DEPTH_LEVELS_PER_SIDE || ask_count > MAX_DEPTH_LEVELS_PER_SIDE {
            return Err(WireError::TooManyLevels(bid_count.max(ask_count)));
        }

        let body = &buf[WIRE_DEPTH_HEADER_SIZE..];
        let expected_body_len = (bid_count + ask_count) * WIRE_DEPTH_ROW_SIZE;
        if body.len() != expected_body_len {
            return Err(WireError::InvalidSize(buf.len()));
        }

        if header.checksum != header.compute_checksum(body) {
            return Err(WireError::ChecksumMismatch);
        }

        let mut bids = Vec::with_capacity(bid_count);
        let mut asks = Vec::with_capacity(ask_count);
        for i in 0..bid_count {
            let start = i * WIRE_DEPTH_ROW_SIZE;
            bids.push(WireDepthRow::from_bytes(&body[start..start + WIRE_DEPTH_ROW_SIZE]));
        }
        for i in 0..ask_count {
            let start = (bid_count + i) * WIRE_DEPTH_ROW_SIZE;
            asks.push(WireDepthRow::from_bytes(&body[start..start + WIRE_DEPTH_ROW_SIZE]));
        }

        Ok((header, bids, asks))
    }

    #[inline]
    pub fn symbol(&self) -> SymbolId {
        SymbolId::from_u8(self.symbol_id)
    }

    #[inline]
    pub fn is_snapshot(&self) -> bool {
        self.flags & EdgeFlags::SNAPSHOT != 0
    }

    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.flags & EdgeFlags::HEARTBEAT != 0
    }

    #[inline]
    pub fn has_gap(&self) -> bool {
        self.flags & EdgeFlags::GAP_DETECTED != 0
    }

    fn compute_checksum(&self, body: &[u8]) -> u32 {
        let mut data = Vec::with_capacity(WIRE_DEPTH_HEADER_SIZE - 4 + body.len());
        data.extend_from_slice(&self.header_bytes()[..WIRE_DEPTH_HEADER_SIZE - 4]);
        data.extend_from_slice(body);
        crc32_fast(&data)
    }

    fn header_bytes(&self) -> [u8; WIRE_DEPTH_HEADER_SIZE] {
        let mut buf = [0u8; WIRE_DEPTH_HEADER_SIZE];
        let ptr = self as *const Self as *const u8;
        unsafe { std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), WIRE_DEPTH_HEADER_SIZE) };
        buf
    }

    fn header_from_bytes(buf: &[u8]) -> Self {
        let mut arr = [0u8; WIRE_DEPTH_HEADER_SIZE];
        arr.copy_from_slice(buf);
        unsafe { std::ptr::read(arr.as_ptr() as *const Self) }
    }
}

/// A single trade print (48 bytes), directly analogous in spirit to the
/// reference backend's compact tick record.
///
/// Layout (all fields little-endian):
/// ```text
/// Offset  Size  Field
/// 0       2     magic (0xF10E)
/// 2       1     version
/// 3       1     flags
/// 4       1     symbol_id
/// 5       3     padding
/// 8       8     trade_id
/// 16      8     price (fixed-point)
/// 24      8     qty (fixed-point)
/// 32      8     ts_ms
/// 40      1     buyer_is_maker (0/1)
/// 41      3     padding
/// 44      4     checksum (CRC32)
/// Total: 48 bytes
/// ```
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct WireTrade {
    pub magic: u16,
    pub version: u8,
    pub flags: u8,
    pub symbol_id: u8,
    pub _pad: [u8; 3],
    pub trade_id: u64,
    pub price: i64,
    pub qty: i64,
    pub ts_ms: i64,
    pub buyer_is_maker: u8,
    pub _pad2: [u8; 3],
    pub checksum: u32,
}

const _: () = assert!(std::mem::size_of::<WireTrade>() == WIRE_TRADE_SIZE);

impl WireTrade {
    pub fn new(
        symbol: SymbolId,
        trade_id: u64,
        price: i64,
        qty: i64,
        ts_ms: i64,
        buyer_is_maker: bool,
    ) -> Self {
        let mut trade = Self {
            magic: WIRE_MAGIC,
            version: WIRE_VERSION,
            flags: 0,
            symbol_id: symbol as u8,
            _pad: [0; 3],
            trade_id,
            price,
            qty,
            ts_ms,
            buyer_is_maker: buyer_is_maker as u8,
            _pad2: [0; 3],
            checksum: 0,
        };
        trade.checksum = trade.compute_checksum();
        trade
    }

    pub fn with_flag(mut self, flag: u8) -> Self {
        self.flags |= flag;
        self.checksum = self.compute_checksum();
        self
    }

    #[inline]
    pub fn symbol(&self) -> SymbolId {
        SymbolId::from_u8(self.symbol_id)
    }

    #[inline]
    pub fn is_buyer_maker(&self) -> bool {
        self.buyer_is_maker != 0
    }

    #[inline]
    pub fn price_f64(&self) -> f64 {
        self.price as f64 / FIXED_POINT_SCALE
    }

    #[inline]
    pub fn qty_f64(&self) -> f64 {
        self.qty as f64 / FIXED_POINT_SCALE
    }

    pub fn compute_checksum(&self) -> u32 {
        crc32_fast(self.as_bytes_without_checksum())
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    fn as_bytes_without_checksum(&self) -> &[u8] {
        let ptr = self as *const Self as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, WIRE_TRADE_SIZE - 4) }
    }

    pub fn to_bytes(&self) -> [u8; WIRE_TRADE_SIZE] {
        let mut buf = [0u8; WIRE_TRADE_SIZE];
        let ptr = self as *const Self as *const u8;
        unsafe { std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), WIRE_TRADE_SIZE) };
        buf
    }

    pub fn from_bytes(buf: &[u8; WIRE_TRADE_SIZE]) -> Self {
        unsafe { std::ptr::read(buf.as_ptr() as *const Self) }
    }

    pub fn try_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != WIRE_TRADE_SIZE {
            return Err(WireError::InvalidSize(buf.len()));
        }
        let trade = Self::from_bytes(buf.try_into().unwrap());

        if trade.magic != WIRE_MAGIC {
            return Err(WireError::InvalidMagic(trade.magic));
        }
        if trade.version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(trade.version));
        }
        if !trade.verify_checksum() {
            return Err(WireError::ChecksumMismatch);
        }
        Ok(trade)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.to_bytes())
    }
}

/// Errors during wire protocol parsing.
#[derive(Debug, Clone)]
pub enum WireError {
    InvalidSize(usize),
    InvalidMagic(u16),
    UnsupportedVersion(u8),
    TooManyLevels(usize),
    ChecksumMismatch,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize(s) => write!(f, "invalid packet size: {}", s),
            Self::InvalidMagic(m) => write!(f, "invalid magic: 0x{:04X} (expected 0x{:04X})", m, WIRE_MAGIC),
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported version: {} (expected {})", v, WIRE_VERSION)
            }
            Self::TooManyLevels(n) => write!(f, "depth packet exceeds {} levels per side: {}", MAX_DEPTH_LEVELS_PER_SIDE, n),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
        }
    }
}

impl std::error::Error for WireError {}

/// Fast CRC32 implementation (IEEE polynomial)
fn crc32_fast(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = generate_crc32_table();

    let mut crc = 0xFFFFFFFF_u32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = CRC32_TABLE[idx] ^ (crc >> 8);
    }
    !crc
}

/// Generate CRC32 lookup table at compile time
const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = 0xEDB88320 ^ (crc >> 1);
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(price: i64, qty: i64) -> WireDepthRow {
        WireDepthRow { price, qty }
    }

    #[test]
    fn depth_update_roundtrip() {
        let bids = vec![row(1_000_000_000, 5_000_000), row(999_000_000, 3_000_000)];
        let asks = vec![row(1_001_000_000, 4_000_000)];
        let packet =
            WireDepthHeader::encode_update(SymbolId::BtcUsdt, 10, 12, 1_700_000_000_000, &bids, &asks, 0)
                .unwrap();

        let (header, decoded_bids, decoded_asks) = WireDepthHeader::decode(&packet).unwrap();
        assert_eq!(header.symbol(), SymbolId::BtcUsdt);
        assert_eq!({ header.sequence_first }, 10);
        assert_eq!({ header.sequence_last }, 12);
        assert_eq!(decoded_bids.len(), 2);
        assert_eq!(decoded_asks.len(), 1);
        assert_eq!({ decoded_bids[0].price }, 1_000_000_000);
        assert_eq!({ decoded_asks[0].qty }, 4_000_000);
    }

    #[test]
    fn snapshot_flag_and_equal_sequence() {
        let bids = vec![row(500_000_000, 1_000_000)];
        let asks = vec![row(501_000_000, 1_000_000)];
        let packet = WireDepthHeader::encode_snapshot(SymbolId::LtcUsdt, 42, 0, &bids, &asks).unwrap();
        let (header, _, _) = WireDepthHeader::decode(&packet).unwrap();
        assert!(header.is_snapshot());
        assert_eq!({ header.sequence_first }, { header.sequence_last });
        assert_eq!({ header.sequence_first }, 42);
    }

    #[test]
    fn depth_checksum_detects_corruption() {
        let bids = vec![row(1_000_000_000, 5_000_000)];
        let mut packet = WireDepthHeader::encode_update(SymbolId::BtcUsdt, 1, 1, 0, &bids, &[], 0).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert!(WireDepthHeader::decode(&packet).is_err());
    }

    #[test]
    fn trade_roundtrip() {
        let trade = WireTrade::new(SymbolId::BtcUsdt, 777, 1_000_000_000, 250_000, 1_700_000_000_123, true);
        let bytes = trade.to_bytes();
        let restored = WireTrade::try_from_slice(&bytes).unwrap();
        assert_eq!({ restored.trade_id }, 777);
        assert_eq!(restored.symbol(), SymbolId::BtcUsdt);
        assert!(restored.is_buyer_maker());
    }

    #[test]
    fn trade_checksum_detects_corruption() {
        let trade = WireTrade::new(SymbolId::LtcUsdt, 1, 100_000_000, 1_000_000, 0, false);
        let mut bytes = trade.to_bytes();
        bytes[10] ^= 0xFF;
        assert!(WireTrade::try_from_slice(&bytes).is_err());
    }

    #[test]
    fn symbol_conversion() {
        assert_eq!(SymbolId::from_str("btcusdt"), SymbolId::BtcUsdt);
        assert_eq!(SymbolId::from_str("LTCUSDT"), SymbolId::LtcUsdt);
        assert_eq!(SymbolId::BtcUsdt.as_str(), "BTCUSDT");
    }

    #[test]
    fn oversized_level_count_rejected() {
        let too_many: Vec<WireDepthRow> = (0..MAX_DEPTH_LEVELS_PER_SIDE + 1)
            .map(|i| row(i as i64, 1))
            .collect();
        assert!(WireDepthHeader::encode_update(SymbolId::BtcUsdt, 1, 1, 0, &too_many, &[], 0).is_err());
    }
}
