//! Error handling - one taxonomy for every recoverable and fatal condition

use thiserror::Error;

use crate::core::types::{Instrument, Side};

pub type Result<T> = std::result::Result<T, Error>;

/// Why a book was refused before reaching the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidBook {
    #[error("{0}: crossed book (bid {1} > ask {2})")]
    Crossed(Instrument, rust_decimal::Decimal, rust_decimal::Decimal),

    #[error("{0}: locked book (bid == ask == {1})")]
    Locked(Instrument, rust_decimal::Decimal),

    #[error("{0}: stale snapshot seq {1} (last accepted {2})")]
    Stale(Instrument, u64, u64),

    #[error("{0}: no book")]
    Missing(Instrument),
}

/// basket-tx error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Crossed, locked, stale or absent book
    #[error("Invalid book: {0}")]
    InvalidBook(#[from] InvalidBook),

    /// Risk ledger refused a reservation
    #[error("Capacity exceeded: {side} {requested} {instrument} (available {available})")]
    CapacityExceeded {
        instrument: Instrument,
        side: Side,
        requested: u64,
        available: u64,
    },

    /// Venue refused the order
    #[error("Submission rejected for {instrument}: {reason}")]
    SubmissionRejected { instrument: Instrument, reason: String },

    /// A gateway call did not complete in time
    #[error("Gateway timeout: {operation}")]
    GatewayTimeout { operation: String },

    /// Connectivity lost, nothing left to do in-process
    #[error("Gateway disconnected: {0}")]
    GatewayDisconnected(String),

    /// Transient venue-side failure
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bookkeeping anomaly (unknown order, over-fill, ...)
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Only a lost connection ends the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::GatewayDisconnected(_))
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Error::GatewayTimeout { operation: operation.into() }
    }
}
