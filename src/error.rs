//! Crate-boundary error types.
//!
//! Hot-path computation (book apply, preprocessing, detector evaluation) never
//! returns `Result` for "no signal" conditions; see `fixed_math::MathResult`.
//! `EngineError` is reserved for conditions a caller at a crate boundary must
//! branch on: startup, config validation, wire decode.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("wire decode failed: {0}")]
    WireDecode(#[from] crate::edge::wire::WireError),

    #[error("startup I/O error: {0}")]
    Startup(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
