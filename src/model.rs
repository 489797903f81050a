//! Core data model shared by every subsystem: book state, trades, zones,
//! signals. All monetary fields are fixed-point `i64` (see [`crate::fixed_math`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rolling_window::Timestamped;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// A single price level in the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: i64,
    pub bid_qty: i64,
    pub ask_qty: i64,
    pub last_update_ms: i64,
    pub update_count: u64,
}

impl PriceLevel {
    pub fn new(price: i64, ts_ms: i64) -> Self {
        Self {
            price,
            bid_qty: 0,
            ask_qty: 0,
            last_update_ms: ts_ms,
            update_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bid_qty == 0 && self.ask_qty == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    Uninit,
    Recovering,
    Ready,
    Degraded,
}

#[derive(Debug, Clone, Copy)]
pub struct BookHealth {
    pub state: BookState,
    pub error_count: u64,
    pub book_size: usize,
    pub best_bid: Option<i64>,
    pub best_ask: Option<i64>,
    pub last_update_ms: i64,
    pub staleness_ms: i64,
}

/// One row of a depth update/snapshot: a price with the new resting quantity
/// on one side. `qty == 0` means "remove this side at this price".
#[derive(Debug, Clone, Copy)]
pub struct DepthRow {
    pub price: i64,
    pub qty: i64,
}

#[derive(Debug, Clone)]
pub struct DepthUpdate {
    pub sequence_first: u64,
    pub sequence_last: u64,
    pub bids: Vec<DepthRow>,
    pub asks: Vec<DepthRow>,
    pub event_time_ms: i64,
    pub symbol: String,
}

#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<DepthRow>,
    pub asks: Vec<DepthRow>,
}

/// A single filled trade, already decoded to fixed-point.
#[derive(Debug, Clone, Copy)]
pub struct AggTrade {
    pub trade_id: u64,
    pub price: i64,
    pub qty: i64,
    pub ts_ms: i64,
    pub buyer_is_maker: bool,
}

impl AggTrade {
    /// The side of the book that was removed by this fill.
    pub fn aggressive_side(&self) -> Side {
        if self.buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

impl Timestamped for AggTrade {
    fn ts_ms(&self) -> i64 {
        self.ts_ms
    }
}

/// Tagged envelope for everything the exchange connector produces; detectors
/// never see this directly, only the `EnrichedTrade` the preprocessor derives
/// from `Trade` variants.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Depth(DepthUpdate),
    Trade(AggTrade),
    Snapshot(DepthSnapshot),
}

/// Per-bucket aggregate for one (horizon, price-bucket) pair.
#[derive(Debug, Clone, Copy)]
pub struct ZoneSnapshot {
    pub price_level: i64,
    pub tick_size: i64,
    pub aggressive_vol: i64,
    pub passive_vol: i64,
    pub aggr_buy_vol: i64,
    pub aggr_sell_vol: i64,
    pub passive_bid_vol: i64,
    pub passive_ask_vol: i64,
    pub trade_count: u64,
    pub timespan_ms: i64,
    pub boundary_min: i64,
    pub boundary_max: i64,
    pub last_update_ms: i64,
    /// Volume-weighted price, same scale as `price_level`.
    pub volume_weighted_price: i64,
}

/// The three standard horizons attached to every enriched trade.
#[derive(Debug, Clone)]
pub struct StandardZoneData {
    pub zones_5t: Vec<ZoneSnapshot>,
    pub zones_10t: Vec<ZoneSnapshot>,
    pub zones_20t: Vec<ZoneSnapshot>,
    pub base_ticks: [i64; 3],
    pub tick_value: i64,
    pub time_window_ms: i64,
}

#[derive(Debug, Clone)]
pub struct EnrichedTrade {
    pub trade: AggTrade,
    pub best_bid: Option<i64>,
    pub best_ask: Option<i64>,
    pub passive_bid_vol_at_price: i64,
    pub passive_ask_vol_at_price: i64,
    pub zone_passive_bid_vol: i64,
    pub zone_passive_ask_vol: i64,
    pub zone_data: StandardZoneData,
}

impl Timestamped for EnrichedTrade {
    fn ts_ms(&self) -> i64 {
        self.trade.ts_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Absorption,
    Exhaustion,
    Accumulation,
    Distribution,
    Iceberg,
    Spoofing,
}

impl SignalKind {
    /// Confirmed-signal direction map (§4.10): absorption→buy,
    /// exhaustion→sell, accumulation→buy, distribution→sell. Iceberg and
    /// spoofing inherit whichever side the detector observed directly and
    /// are not listed here.
    pub fn default_direction(self) -> Option<Side> {
        match self {
            SignalKind::Absorption | SignalKind::Accumulation => Some(Side::Buy),
            SignalKind::Exhaustion | SignalKind::Distribution => Some(Side::Sell),
            SignalKind::Iceberg | SignalKind::Spoofing => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalCandidateData {
    pub price: i64,
    pub aggressive: i64,
    pub passive: i64,
    pub refilled: bool,
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SignalCandidate {
    pub id: Uuid,
    pub detector_id: String,
    pub kind: SignalKind,
    pub side: Side,
    pub confidence: f64,
    pub ts_ms: i64,
    pub data: SignalCandidateData,
}

impl Timestamped for SignalCandidate {
    fn ts_ms(&self) -> i64 {
        self.ts_ms
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CorrelationInfo {
    pub count: usize,
    pub strength: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthRecommendation {
    Continue,
    ReduceSize,
    Pause,
    ClosePositions,
    InsufficientData,
}

impl HealthRecommendation {
    pub fn blocks_signals(self) -> bool {
        matches!(
            self,
            HealthRecommendation::Pause
                | HealthRecommendation::ClosePositions
                | HealthRecommendation::InsufficientData
        )
    }
}

#[derive(Debug, Clone)]
pub struct MarketHealthMetrics {
    pub spread_bps: f64,
    pub flow_imbalance: f64,
    pub volatility: f64,
    pub last_update_age_ms: i64,
}

#[derive(Debug, Clone)]
pub struct MarketHealth {
    pub is_healthy: bool,
    pub recommendation: HealthRecommendation,
    pub critical_issues: Vec<String>,
    pub recent_anomaly_types: Vec<AnomalyType>,
    pub metrics: MarketHealthMetrics,
}

#[derive(Debug, Clone)]
pub struct ConfirmedSignal {
    pub origin_ids: Vec<Uuid>,
    pub kind: SignalKind,
    pub side: Side,
    pub final_confidence: f64,
    pub final_price: i64,
    pub tp_price: i64,
    pub sl_price: i64,
    pub confirmed_at_ms: i64,
    pub correlation: CorrelationInfo,
    pub health_context: MarketHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    FlashCrash,
    LiquidityVoid,
    ApiGap,
    ExtremeVolatility,
    WhaleActivity,
    OrderbookImbalance,
    FlowImbalance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Info,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct AnomalyEvent {
    pub kind: AnomalyType,
    pub severity: AnomalySeverity,
    pub detected_at_ms: i64,
    pub affected_price_min: i64,
    pub affected_price_max: i64,
    pub recommended_action: String,
    pub details: BTreeMap<String, String>,
}

/// Outbound, read-only view of the book for the dashboard/UI collaborator.
#[derive(Debug, Clone)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub ts_ms: i64,
    pub levels: Vec<PriceLevel>,
    pub best_bid: Option<i64>,
    pub best_ask: Option<i64>,
}
