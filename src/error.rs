//! Error types shared by the probing and route-reasoning engine.

use std::net::IpAddr;
use thiserror::Error;

/// Errors surfaced by a [`crate::prober::Prober`] implementation.
///
/// Per the failure model, only [`ProberError::Fatal`] crosses a subsystem boundary (it triggers
/// the engine's emergency stop); a timeout is not an error at all, it is a normal (if empty)
/// [`crate::prober::ProbeRecord`].
#[derive(Debug, Error)]
pub enum ProberError {
    /// Socket-resource exhaustion or another unrecoverable I/O failure.
    #[error("prober I/O failure: {0}")]
    Fatal(String),
    /// The requested source address could not be bound or validated.
    #[error("invalid source address: {0}")]
    InvalidSourceAddr(IpAddr),
}

/// Top-level error type for the core engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A fatal prober failure, already converted into the engine's emergency-stop flag.
    #[error(transparent)]
    Prober(#[from] ProberError),
    /// A configuration value was outside its documented range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The engine was asked to continue after an emergency stop was raised.
    #[error("emergency stop has been raised, engine is draining")]
    EmergencyStop,
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;
