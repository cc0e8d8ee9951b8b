//! Core types - Strong typing for safety

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tradeable instrument (e.g., "SEMIS_ETF_US"). Opaque: compared verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Instrument {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells.
    pub fn sign(self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    /// Limit order left in the book until filled or cancelled
    Resting,
    /// Fills what it can on arrival, remainder cancelled
    ImmediateOrCancel,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeInForce::Resting => write!(f, "LIMIT"),
            TimeInForce::ImmediateOrCancel => write!(f, "IOC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub volume: u64,
}

impl PriceLevel {
    pub fn new(price: Decimal, volume: u64) -> Self {
        Self { price, volume }
    }
}

/// Book exactly as the venue reported it; ordering not guaranteed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBook {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: u64,
}

/// What the evaluator wants done. Lives for one decision cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderIntent {
    pub instrument: Instrument,
    pub side: Side,
    pub price: Decimal,
    pub volume: u64,
    pub time_in_force: TimeInForce,
}

impl std::fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} @ {} {}",
            self.side, self.volume, self.instrument, self.price, self.time_in_force
        )
    }
}

/// Locally generated correlation token, known before the venue answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(Uuid);

impl ClientOrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Venue-assigned order id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order request sent to the gateway
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_id: ClientOrderId,
    pub instrument: Instrument,
    pub side: Side,
    pub price: Decimal,
    pub volume: u64,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    pub fn from_intent(client_id: ClientOrderId, intent: &OrderIntent) -> Self {
        Self {
            client_id,
            instrument: intent.instrument.clone(),
            side: intent.side,
            price: intent.price,
            volume: intent.volume,
            time_in_force: intent.time_in_force,
        }
    }
}

/// Synchronous answer to a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResponse {
    Accepted { order_id: OrderId },
    Rejected { reason: String },
    /// Asynchronous gateway: the verdict arrives later as an [`ExecutionEvent`].
    Pending,
}

/// Own trade reported by the venue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub trade_id: String,
    pub order_id: OrderId,
    pub client_id: Option<ClientOrderId>,
    pub instrument: Instrument,
    pub side: Side,
    pub price: Decimal,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

/// Public trade printed on the venue, ours or anyone's
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeTick {
    pub instrument: Instrument,
    pub price: Decimal,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

/// Asynchronous venue notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Acknowledged { client_id: ClientOrderId, order_id: OrderId },
    Rejected { client_id: ClientOrderId, reason: String },
    Filled(Fill),
    Cancelled { order_id: OrderId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_is_opaque() {
        assert_ne!(Instrument::new("semis_etf_us"), Instrument::new("SEMIS_ETF_US"));
        assert_eq!(Instrument::from("C2_WIND_LTD").as_str(), "C2_WIND_LTD");
    }

    #[test]
    fn test_side_sign() {
        assert_eq!(Side::Buy.sign(), 1);
        assert_eq!(Side::Sell.sign(), -1);
    }
}
