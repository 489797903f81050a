//! Pattern detectors (§4.4-§4.9): each owns fully-validated config, exposes
//! one hot-path entry point, and never panics on malformed input.

pub mod absorption;
pub mod anomaly;
pub mod base;
pub mod exhaustion;
pub mod iceberg;
pub mod spoofing;
mod zones;

pub use absorption::AbsorptionDetector;
pub use anomaly::AnomalyDetector;
pub use base::DetectorBase;
pub use exhaustion::ExhaustionDetector;
pub use iceberg::IcebergDetector;
pub use spoofing::SpoofingDetector;
