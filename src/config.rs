//! Validated, immutable configuration value types.
//!
//! One struct per component, matching the §6 config-key table, composed into
//! [`EngineConfig`]. Loading follows the reference backend's
//! `Config::from_env()` idiom (`dotenv::dotenv().ok()` once, then
//! `env::var(KEY).ok().and_then(|v| v.parse().ok()).unwrap_or(default)` per
//! field) but, unlike the reference backend, every field is range-checked at
//! construction — an out-of-range or nonsensical value is rejected with
//! `EngineError::InvalidConfig` rather than silently clamped later on the hot
//! path.

use std::env;

use crate::error::{EngineError, EngineResult};

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct BookConfig {
    pub tick_size: i64,
    pub max_price_distance_ticks: i64,
    pub stale_threshold_ms: i64,
    pub error_threshold: u64,
    pub sequence_validation_enabled: bool,
}

impl BookConfig {
    fn validate(&self) -> EngineResult<()> {
        if self.tick_size <= 0 {
            return Err(EngineError::InvalidConfig("tick_size must be > 0".into()));
        }
        if self.max_price_distance_ticks <= 0 {
            return Err(EngineError::InvalidConfig(
                "max_price_distance_ticks must be > 0".into(),
            ));
        }
        if self.stale_threshold_ms <= 0 {
            return Err(EngineError::InvalidConfig(
                "stale_threshold_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PreprocessorConfig {
    pub band_ticks: i64,
}

#[derive(Debug, Clone)]
pub struct ZoneConfig {
    pub base_ticks: [i64; 3],
    pub time_window_ms: i64,
}

impl ZoneConfig {
    fn validate(&self) -> EngineResult<()> {
        if self.base_ticks.iter().any(|&t| t <= 0) {
            return Err(EngineError::InvalidConfig(
                "zone base_ticks must all be > 0".into(),
            ));
        }
        if self.time_window_ms <= 0 {
            return Err(EngineError::InvalidConfig(
                "zone time_window_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AbsorptionConfig {
    pub min_agg_volume: i64,
    pub min_volume_for_ratio: i64,
    pub min_passive_multiplier: f64,
    pub max_absorption_ratio: f64,
    pub price_efficiency_threshold: f64,
    pub spread_impact_threshold: f64,
    pub event_cooldown_ms: i64,
    pub min_initial_move_ticks: i64,
    pub institutional_volume_threshold: i64,
    pub institutional_volume_boost: f64,
    pub horizon_weights: [f64; 3],
}

#[derive(Debug, Clone)]
pub struct ExhaustionConfig {
    pub min_agg_volume: i64,
    pub exhaustion_threshold: f64,
    pub event_cooldown_ms: i64,
    pub min_initial_move_ticks: i64,
}

#[derive(Debug, Clone)]
pub struct IcebergConfig {
    pub min_order_count: usize,
    pub min_total_size: i64,
    pub max_order_gap_ms: i64,
    pub time_window_ms: i64,
    pub max_active_patterns: usize,
}

#[derive(Debug, Clone)]
pub struct SpoofingConfig {
    pub wall_ticks: i64,
    pub min_wall_size: i64,
    pub max_cancellation_ratio: f64,
    pub rapid_cancellation_ms: i64,
    pub event_cooldown_ms: i64,
}

#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub normal_spread_bps: f64,
    pub volume_imbalance_threshold: f64,
    pub anomaly_cooldown_ms: i64,
    pub flash_crash_z_threshold: f64,
    pub volatility_ratio_threshold: f64,
    pub whale_percentile: f64,
    pub window_count: usize,
    pub window_ms: i64,
    pub gap_threshold_ms: i64,
}

#[derive(Debug, Clone)]
pub struct SignalManagerConfig {
    pub confidence_threshold: f64,
    pub dedup_tolerance: f64,
    pub correlation_window_ms: i64,
    pub target_pct: f64,
    pub stop_pct: f64,
}

impl SignalManagerConfig {
    fn validate(&self) -> EngineResult<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(EngineError::InvalidConfig(
                "confidence_threshold must be in [0,1]".into(),
            ));
        }
        if self.target_pct <= 0.0 || self.stop_pct <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "target_pct/stop_pct must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbol: String,
    pub tick_size: i64,
    pub price_precision: u32,
    pub quantity_precision: u32,
    pub book: BookConfig,
    pub preprocessor: PreprocessorConfig,
    pub zone: ZoneConfig,
    pub absorption: AbsorptionConfig,
    pub exhaustion: ExhaustionConfig,
    pub iceberg: IcebergConfig,
    pub spoofing: SpoofingConfig,
    pub anomaly: AnomalyConfig,
    pub signal_manager: SignalManagerConfig,
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        dotenv::dotenv().ok();

        let tick_size = env_parse("FLOWEDGE_TICK_SIZE_TICKS", 1_000_000i64); // 0.01 at 1e8 scale

        let cfg = EngineConfig {
            symbol: env::var("FLOWEDGE_SYMBOL").unwrap_or_else(|_| "LTCUSDT".to_string()),
            tick_size,
            price_precision: env_parse("FLOWEDGE_PRICE_PRECISION", 2u32),
            quantity_precision: env_parse("FLOWEDGE_QUANTITY_PRECISION", 3u32),
            book: BookConfig {
                tick_size,
                max_price_distance_ticks: env_parse("FLOWEDGE_MAX_PRICE_DISTANCE_TICKS", 2_000i64),
                stale_threshold_ms: env_parse("FLOWEDGE_STALE_THRESHOLD_MS", 10_000i64),
                error_threshold: env_parse("FLOWEDGE_BOOK_ERROR_THRESHOLD", 50u64),
                sequence_validation_enabled: env_parse(
                    "FLOWEDGE_SEQUENCE_VALIDATION_ENABLED",
                    true,
                ),
            },
            preprocessor: PreprocessorConfig {
                band_ticks: env_parse("FLOWEDGE_BAND_TICKS", 5i64),
            },
            zone: ZoneConfig {
                base_ticks: [5, 10, 20],
                time_window_ms: env_parse("FLOWEDGE_ZONE_TIME_WINDOW_MS", 60_000i64),
            },
            absorption: AbsorptionConfig {
                min_agg_volume: env_parse("FLOWEDGE_ABSORPTION_MIN_AGG_VOLUME", 1_500 * crate::fixed_math::QUANTITY_SCALE),
                min_volume_for_ratio: env_parse("FLOWEDGE_ABSORPTION_MIN_VOLUME_FOR_RATIO", 1 * crate::fixed_math::QUANTITY_SCALE),
                min_passive_multiplier: env_parse("FLOWEDGE_ABSORPTION_MIN_PASSIVE_MULTIPLIER", 1.5),
                max_absorption_ratio: env_parse("FLOWEDGE_ABSORPTION_MAX_RATIO", 0.4),
                price_efficiency_threshold: env_parse("FLOWEDGE_ABSORPTION_PRICE_EFFICIENCY", 0.05),
                spread_impact_threshold: env_parse("FLOWEDGE_ABSORPTION_SPREAD_IMPACT", 0.3),
                event_cooldown_ms: env_parse("FLOWEDGE_ABSORPTION_COOLDOWN_MS", 5_000i64),
                min_initial_move_ticks: env_parse("FLOWEDGE_ABSORPTION_MIN_MOVE_TICKS", 3i64),
                institutional_volume_threshold: env_parse(
                    "FLOWEDGE_ABSORPTION_INSTITUTIONAL_THRESHOLD",
                    10_000 * crate::fixed_math::QUANTITY_SCALE,
                ),
                institutional_volume_boost: env_parse("FLOWEDGE_ABSORPTION_INSTITUTIONAL_BOOST", 0.1),
                horizon_weights: [0.40, 0.35, 0.25],
            },
            exhaustion: ExhaustionConfig {
                min_agg_volume: env_parse("FLOWEDGE_EXHAUSTION_MIN_AGG_VOLUME", 2_000 * crate::fixed_math::QUANTITY_SCALE),
                exhaustion_threshold: env_parse("FLOWEDGE_EXHAUSTION_THRESHOLD", 0.7),
                event_cooldown_ms: env_parse("FLOWEDGE_EXHAUSTION_COOLDOWN_MS", 5_000i64),
                min_initial_move_ticks: env_parse("FLOWEDGE_EXHAUSTION_MIN_MOVE_TICKS", 3i64),
            },
            iceberg: IcebergConfig {
                min_order_count: env_parse("FLOWEDGE_ICEBERG_MIN_ORDER_COUNT", 4usize),
                min_total_size: env_parse("FLOWEDGE_ICEBERG_MIN_TOTAL_SIZE", 100 * crate::fixed_math::QUANTITY_SCALE),
                max_order_gap_ms: env_parse("FLOWEDGE_ICEBERG_MAX_ORDER_GAP_MS", 2_000i64),
                time_window_ms: env_parse("FLOWEDGE_ICEBERG_TIME_WINDOW_MS", 120_000i64),
                max_active_patterns: env_parse("FLOWEDGE_ICEBERG_MAX_ACTIVE_PATTERNS", 256usize),
            },
            spoofing: SpoofingConfig {
                wall_ticks: env_parse("FLOWEDGE_SPOOFING_WALL_TICKS", 5i64),
                min_wall_size: env_parse("FLOWEDGE_SPOOFING_MIN_WALL_SIZE", 5_000 * crate::fixed_math::QUANTITY_SCALE),
                max_cancellation_ratio: env_parse("FLOWEDGE_SPOOFING_MAX_CANCELLATION_RATIO", 0.8),
                rapid_cancellation_ms: env_parse("FLOWEDGE_SPOOFING_RAPID_CANCELLATION_MS", 2_000i64),
                event_cooldown_ms: env_parse("FLOWEDGE_SPOOFING_COOLDOWN_MS", 10_000i64),
            },
            anomaly: AnomalyConfig {
                normal_spread_bps: env_parse("FLOWEDGE_ANOMALY_NORMAL_SPREAD_BPS", 10.0),
                volume_imbalance_threshold: env_parse("FLOWEDGE_ANOMALY_IMBALANCE_THRESHOLD", 0.7),
                anomaly_cooldown_ms: env_parse("FLOWEDGE_ANOMALY_COOLDOWN_MS", 30_000i64),
                flash_crash_z_threshold: env_parse("FLOWEDGE_ANOMALY_FLASH_CRASH_Z", 3.0),
                volatility_ratio_threshold: env_parse("FLOWEDGE_ANOMALY_VOLATILITY_RATIO", 2.5),
                whale_percentile: env_parse("FLOWEDGE_ANOMALY_WHALE_PERCENTILE", 0.99),
                window_count: env_parse("FLOWEDGE_ANOMALY_WINDOW_COUNT", 500usize),
                window_ms: env_parse("FLOWEDGE_ANOMALY_WINDOW_MS", 300_000i64),
                gap_threshold_ms: env_parse("FLOWEDGE_ANOMALY_GAP_THRESHOLD_MS", 5_000i64),
            },
            signal_manager: SignalManagerConfig {
                confidence_threshold: env_parse("FLOWEDGE_SIGNAL_CONFIDENCE_THRESHOLD", 0.6),
                dedup_tolerance: env_parse("FLOWEDGE_SIGNAL_DEDUP_TOLERANCE", 0.001),
                correlation_window_ms: env_parse("FLOWEDGE_SIGNAL_CORRELATION_WINDOW_MS", 60_000i64),
                target_pct: env_parse("FLOWEDGE_SIGNAL_TARGET_PCT", 0.01),
                stop_pct: env_parse("FLOWEDGE_SIGNAL_STOP_PCT", 0.005),
            },
        };

        cfg.book.validate()?;
        cfg.zone.validate()?;
        cfg.signal_manager.validate()?;
        Ok(cfg)
    }
}
