//! Execution layer - order lifecycle against the gateway
//!
//! The manager owns no state of its own: ledger and resident orders live in
//! [`TradingState`] behind a shared mutex, so the event feed task can apply
//! acks, fills and cancels concurrently with the decision cycle.

pub mod state;

use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::{
    ClientOrderId, Error, ExchangeGateway, ExecutionEvent, Instrument, OrderIntent, OrderRequest,
    Result, SubmitResponse, TimeInForce,
};
use crate::risk::Reservation;
use crate::strategy::Proposal;

pub use state::{FillOutcome, OrderStatus, ResidentOrder, TradingState};

/// What one `execute` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub cancel_requests: usize,
    pub submitted: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Intents refused by the risk ledger
    pub dropped: usize,
    pub errors: usize,
}

/// Order manager - handles order lifecycle
pub struct OrderManager {
    gateway: Arc<dyn ExchangeGateway>,
    state: Arc<Mutex<TradingState>>,
    request_timeout: Duration,
    /// Venue pushes `ExecutionEvent::Cancelled`; otherwise cancels settle locally.
    cancel_events: bool,
}

impl OrderManager {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        state: Arc<Mutex<TradingState>>,
        request_timeout: Duration,
    ) -> Self {
        let cancel_events = gateway.events().is_some();
        Self { gateway, state, request_timeout, cancel_events }
    }

    pub fn state(&self) -> &Arc<Mutex<TradingState>> {
        &self.state
    }

    async fn bounded<T>(
        &self,
        operation: String,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(r) => r,
            Err(_) => Err(Error::timeout(operation)),
        }
    }

    /// Act on one proposal: clear old quotes, reserve, submit.
    ///
    /// Only a fatal gateway error is returned; everything else is logged and
    /// counted in the report.
    pub async fn execute(&self, proposal: &Proposal) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();
        info!("📋 {}", proposal.reason);

        for instrument in proposal.instruments() {
            match self.cancel_stale(&instrument).await {
                Ok(n) => report.cancel_requests += n,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("⚠️ cancel on {} failed: {}", instrument, e);
                    report.errors += 1;
                }
            }
        }

        let orders = self.reserve(proposal, &mut report);
        if orders.is_empty() {
            return Ok(report);
        }

        let requests: Vec<OrderRequest> = orders
            .iter()
            .map(|(client_id, intent)| OrderRequest::from_intent(*client_id, intent))
            .collect();
        report.submitted = requests.len();

        // linked legs go out together
        let responses = join_all(requests.iter().map(|req| {
            let operation = format!("submit_order {}", req.instrument);
            self.bounded(operation, self.gateway.submit_order(req))
        }))
        .await;

        let mut fatal = None;
        let mut ioc_instruments: Vec<Instrument> = Vec::new();
        for (req, response) in requests.iter().zip(responses) {
            match response {
                Ok(SubmitResponse::Accepted { order_id }) => {
                    info!(
                        "✅ {} {} {} @ {} accepted as {}",
                        req.side, req.volume, req.instrument, req.price, order_id
                    );
                    if let Err(e) = self.state.lock().acknowledge(&req.client_id, order_id) {
                        error!("❌ {}", e);
                        report.errors += 1;
                    }
                    report.accepted += 1;
                    if req.time_in_force == TimeInForce::ImmediateOrCancel
                        && !ioc_instruments.contains(&req.instrument)
                    {
                        ioc_instruments.push(req.instrument.clone());
                    }
                }
                Ok(SubmitResponse::Rejected { reason }) => {
                    self.state.lock().reject(&req.client_id);
                    let instrument = req.instrument.clone();
                    let e = Error::SubmissionRejected { instrument, reason };
                    warn!("⚠️ {}", e);
                    report.rejected += 1;
                }
                Ok(SubmitResponse::Pending) => {
                    info!("⏳ {} {} {} awaiting venue ack", req.side, req.volume, req.instrument);
                }
                Err(e @ Error::GatewayTimeout { .. }) => {
                    // the venue may still ack; ack timeout cleans up otherwise
                    warn!("⚠️ {} (order {} left pending)", e, req.client_id);
                    report.errors += 1;
                }
                Err(e) => {
                    self.state.lock().reject(&req.client_id);
                    report.errors += 1;
                    if e.is_fatal() {
                        fatal = Some(e);
                    } else {
                        warn!("⚠️ submit {} failed: {}", req.instrument, e);
                    }
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        if proposal.linked && report.accepted > 0 && report.accepted < requests.len() {
            error!(
                "🚨 linked proposal only partly accepted ({}/{}): {}",
                report.accepted,
                requests.len(),
                proposal.reason
            );
        }

        for instrument in ioc_instruments {
            match self.poll_fills(&instrument).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("⚠️ IOC fill poll on {} failed: {}", instrument, e);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Reserve capacity and record each intent as Pending.
    fn reserve(
        &self,
        proposal: &Proposal,
        report: &mut ExecutionReport,
    ) -> Vec<(ClientOrderId, OrderIntent)> {
        let mut state = self.state.lock();

        let reserved: Vec<(OrderIntent, Reservation)> = if proposal.linked {
            match state.ledger.reserve_all(&proposal.intents) {
                Ok(rs) => proposal.intents.iter().cloned().zip(rs).collect(),
                Err(e) => {
                    warn!("⚠️ linked proposal dropped: {}", e);
                    report.dropped += proposal.intents.len();
                    return Vec::new();
                }
            }
        } else {
            let mut out = Vec::with_capacity(proposal.intents.len());
            for intent in &proposal.intents {
                match state.ledger.reserve(intent) {
                    Ok(r) => out.push((intent.clone(), r)),
                    Err(e) => {
                        warn!("⚠️ {} dropped: {}", intent, e);
                        report.dropped += 1;
                    }
                }
            }
            out
        };

        reserved
            .into_iter()
            .map(|(intent, reservation)| {
                let client_id = state.record_pending(&intent, &reservation);
                info!("📤 {} [{} {}]", intent, reservation.id, client_id);
                (client_id, intent)
            })
            .collect()
    }

    /// Request cancellation of every live order on `instrument`.
    ///
    /// Returns the number of orders flagged. Once the venue takes the cancel,
    /// fills up to that point are polled and applied. Unanswered submissions
    /// are then closed; live orders are closed too when the venue has no
    /// event stream, otherwise they wait for [`ExecutionEvent::Cancelled`].
    pub async fn cancel_stale(&self, instrument: &Instrument) -> Result<usize> {
        let n = self.state.lock().request_cancel(instrument);
        if n == 0 {
            return Ok(0);
        }
        info!("🧹 cancelling {} order(s) on {}", n, instrument);
        let operation = format!("cancel_orders {}", instrument);
        self.bounded(operation, self.gateway.cancel_orders(instrument)).await?;

        self.poll_fills(instrument).await?;
        let settled = self.state.lock().settle_cancels(instrument, !self.cancel_events);
        for order in settled {
            info!(
                "🚫 cancelled {} {} {} (unfilled {})",
                order.side, order.volume, order.instrument, order.remaining
            );
        }
        Ok(n)
    }

    /// Pull own trades for `instrument`, apply them, then close out any IOC
    /// order on it. Returns the number of fills applied.
    pub async fn poll_fills(&self, instrument: &Instrument) -> Result<usize> {
        let fills = self
            .bounded(format!("poll_fills {}", instrument), self.gateway.poll_fills(instrument))
            .await?;

        let mut state = self.state.lock();
        let mut applied = 0;
        for fill in &fills {
            match state.apply_fill(fill) {
                Ok(FillOutcome::Duplicate) => {}
                Ok(_) => applied += 1,
                Err(e) => error!("❌ {}", e),
            }
        }
        for order in state.resolve_ioc(instrument) {
            if order.remaining > 0 {
                info!(
                    "✂️ IOC {} {} {} unfilled {} cancelled",
                    order.side, order.volume, order.instrument, order.remaining
                );
            }
        }
        Ok(applied)
    }

    /// Apply one asynchronous venue notification.
    pub fn on_event(&self, event: ExecutionEvent) {
        let mut state = self.state.lock();
        match event {
            ExecutionEvent::Acknowledged { client_id, order_id } => {
                if let Err(e) = state.acknowledge(&client_id, order_id) {
                    error!("❌ {}", e);
                }
            }
            ExecutionEvent::Rejected { client_id, reason } => match state.reject(&client_id) {
                Some(order) => warn!(
                    "⚠️ {}",
                    Error::SubmissionRejected { instrument: order.instrument, reason }
                ),
                None => error!("❌ reject for unknown or settled order {}: {}", client_id, reason),
            },
            ExecutionEvent::Filled(fill) => {
                if let Err(e) = state.apply_fill(&fill) {
                    error!("❌ {}", e);
                }
            }
            ExecutionEvent::Cancelled { order_id } => {
                if let Some(order) = state.confirm_cancel(&order_id) {
                    info!(
                        "🚫 cancelled {} {} {} (unfilled {})",
                        order.side, order.volume, order.instrument, order.remaining
                    );
                }
            }
        }
    }

    /// Chase submissions the venue never answered. Their reservations stay
    /// held until a cancel on the venue goes through; a failed cancel is
    /// retried on the next call. Returns how many orders newly timed out.
    pub async fn expire_pending(&self, ack_timeout: Duration) -> Result<usize> {
        let (expired, unanswered) = {
            let mut state = self.state.lock();
            let expired = state.expire_pending(ack_timeout);
            (expired, state.unanswered_instruments())
        };
        for order in &expired {
            error!(
                "🚨 no ack for {} {} {} after {:?}; cancelling before release",
                order.side, order.volume, order.instrument, ack_timeout
            );
        }
        for instrument in unanswered {
            match self.cancel_stale(&instrument).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("⚠️ cancel of unanswered orders on {} failed: {}", instrument, e),
            }
        }
        Ok(expired.len())
    }

    pub fn has_pending(&self, instruments: &[Instrument]) -> bool {
        self.state.lock().has_pending(instruments)
    }
}
