//! Core traits - the seam between the decision core and a venue

use async_trait::async_trait;

use crate::core::{Result, types::*};

/// Exchange gateway - request/response contract for one venue connection.
///
/// Implementations map transport failures onto the error taxonomy:
/// a dropped session is [`crate::Error::GatewayDisconnected`], anything the
/// next cycle can retry is [`crate::Error::Gateway`].
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Current book; `None` when the venue has no book for the instrument
    async fn get_book(&self, instrument: &Instrument) -> Result<Option<RawBook>>;

    /// Insert an order
    async fn submit_order(&self, request: &OrderRequest) -> Result<SubmitResponse>;

    /// Cancel every resting order on the instrument. Best effort.
    async fn cancel_orders(&self, instrument: &Instrument) -> Result<()>;

    /// Own fills since the last poll
    async fn poll_fills(&self, instrument: &Instrument) -> Result<Vec<Fill>>;

    /// Venue's view of the position, used for reconciliation
    async fn get_position(&self, instrument: &Instrument) -> Result<i64>;

    /// Market trades since the last poll; empty when the venue has no tape
    async fn poll_trade_ticks(&self, _instrument: &Instrument) -> Result<Vec<TradeTick>> {
        Ok(Vec::new())
    }

    /// Push feed of acks, rejects, fills and cancel confirmations
    fn events(&self) -> Option<flume::Receiver<ExecutionEvent>> {
        None
    }

    /// Instruments whose book changed; lets the driver react between ticks
    fn book_updates(&self) -> Option<flume::Receiver<Instrument>> {
        None
    }

    /// Gateway name
    fn name(&self) -> &str;
}
