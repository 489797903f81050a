//! flowedge - real-time crypto order-flow analytics engine.
//!
//! Exposes every module for use by the `flowedge` and `edge_receiver`
//! binaries and by the integration tests. The edge receiver and the core
//! engine are split into separate binaries (§5a) but share every type
//! below: the wire codec, the book/preprocessor/detector stack, and the
//! config/error plumbing.

pub mod config;
pub mod detectors;
pub mod edge;
pub mod engine;
pub mod error;
pub mod fixed_math;
pub mod metrics;
pub mod model;
pub mod orderbook;
pub mod preprocessor;
pub mod rolling_window;
pub mod signal_manager;
pub mod zone;

pub use config::EngineConfig;
pub use engine::{CoreLoop, CoreLoopHandle};
pub use error::{EngineError, EngineResult};
pub use fixed_math::{MathResult, PRICE_SCALE, QUANTITY_SCALE};

pub use edge::{
    EdgeFallbackController, EdgeFlags, EdgeReceiver, EdgeReceiverClient,
    EdgeReceiverClientConfig, EdgeReceiverConfig, SymbolId, WireDepthHeader, WireDepthRow,
    WireError, WireSnapshot, WireTrade,
};

pub use model::{
    AggTrade, ConfirmedSignal, DepthRow, DepthSnapshot, DepthUpdate, InboundEvent, MarketHealth,
    SignalCandidate, SignalKind, Side,
};
