//! Resident order set and ledger, guarded together by one mutex.
//!
//! Every transition here is synchronous. Callers take the lock, apply one
//! transition and drop the guard before touching the gateway again.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

use crate::core::{
    ClientOrderId, Error, Fill, Instrument, OrderId, OrderIntent, Result, Side, TimeInForce,
};
use crate::risk::{Reservation, ReservationId, RiskLedger};

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    /// Submitted, venue has not answered
    Pending,
    Live,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected)
    }
}

/// An order the venue knows about (or is about to).
#[derive(Debug, Clone)]
pub struct ResidentOrder {
    pub client_id: ClientOrderId,
    pub order_id: Option<OrderId>,
    pub instrument: Instrument,
    pub side: Side,
    pub price: Decimal,
    pub volume: u64,
    pub remaining: u64,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    /// Cancel sent, confirmation outstanding; volume still counts as at risk.
    /// Also set on a Pending order whose ack never came.
    pub cancel_requested: bool,
    pub reservation: ReservationId,
    pub submitted_at: DateTime<Utc>,
    seen_trades: HashSet<String>,
}

/// What a fill did to its order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    Partial { remaining: u64, position: i64 },
    Completed { position: i64 },
    /// Same trade id seen before
    Duplicate,
}

/// Ledger plus resident orders. Only the lifecycle manager and the event
/// feed mutate this, always under the shared lock.
#[derive(Debug)]
pub struct TradingState {
    pub ledger: RiskLedger,
    orders: HashMap<ClientOrderId, ResidentOrder>,
    by_order_id: HashMap<OrderId, ClientOrderId>,
}

impl TradingState {
    pub fn new(ledger: RiskLedger) -> Self {
        Self { ledger, orders: HashMap::new(), by_order_id: HashMap::new() }
    }

    pub fn get(&self, client_id: &ClientOrderId) -> Option<&ResidentOrder> {
        self.orders.get(client_id)
    }

    pub fn find_by_order_id(&self, order_id: &OrderId) -> Option<&ResidentOrder> {
        self.by_order_id.get(order_id).and_then(|c| self.orders.get(c))
    }

    pub fn resident_orders(&self) -> impl Iterator<Item = &ResidentOrder> {
        self.orders.values()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn live_orders(&self, instrument: &Instrument) -> Vec<&ResidentOrder> {
        self.orders
            .values()
            .filter(|o| &o.instrument == instrument && o.status == OrderStatus::Live)
            .collect()
    }

    /// True when any of `instruments` has a submission awaiting its verdict.
    pub fn has_pending(&self, instruments: &[Instrument]) -> bool {
        self.orders
            .values()
            .any(|o| o.status == OrderStatus::Pending && instruments.contains(&o.instrument))
    }

    /// Track a freshly reserved intent before it goes on the wire.
    pub fn record_pending(
        &mut self,
        intent: &OrderIntent,
        reservation: &Reservation,
    ) -> ClientOrderId {
        let client_id = ClientOrderId::new();
        self.orders.insert(
            client_id,
            ResidentOrder {
                client_id,
                order_id: None,
                instrument: intent.instrument.clone(),
                side: intent.side,
                price: intent.price,
                volume: intent.volume,
                remaining: intent.volume,
                time_in_force: intent.time_in_force,
                status: OrderStatus::Pending,
                cancel_requested: false,
                reservation: reservation.id,
                submitted_at: Utc::now(),
                seen_trades: HashSet::new(),
            },
        );
        client_id
    }

    /// Pending → Live
    pub fn acknowledge(&mut self, client_id: &ClientOrderId, order_id: OrderId) -> Result<()> {
        let order = self.orders.get_mut(client_id).ok_or_else(|| {
            Error::InvalidState(format!("ack {} for unknown order {}", order_id, client_id))
        })?;
        match order.status {
            OrderStatus::Pending => {
                order.status = OrderStatus::Live;
                order.order_id = Some(order_id.clone());
                self.by_order_id.insert(order_id, *client_id);
                Ok(())
            }
            // a fill can beat the ack; the id is already bound
            OrderStatus::Live if order.order_id.as_ref() == Some(&order_id) => Ok(()),
            other => Err(Error::InvalidState(format!(
                "ack {} for order {} in state {:?}",
                order_id, client_id, other
            ))),
        }
    }

    /// Pending → Rejected, capacity returned.
    pub fn reject(&mut self, client_id: &ClientOrderId) -> Option<ResidentOrder> {
        match self.orders.get(client_id) {
            Some(o) if o.status == OrderStatus::Pending => {
                self.evict(client_id, OrderStatus::Rejected)
            }
            _ => None,
        }
    }

    /// Apply one own-trade. Partial fills keep the order live.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<FillOutcome> {
        let client_id = self
            .by_order_id
            .get(&fill.order_id)
            .copied()
            .or_else(|| fill.client_id.filter(|c| self.orders.contains_key(c)))
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "fill {} for unknown order {} on {}",
                    fill.trade_id, fill.order_id, fill.instrument
                ))
            })?;

        let order = self
            .orders
            .get_mut(&client_id)
            .ok_or_else(|| Error::InvalidState(format!("order {} vanished", client_id)))?;
        if !order.seen_trades.insert(fill.trade_id.clone()) {
            return Ok(FillOutcome::Duplicate);
        }
        if order.status == OrderStatus::Pending {
            order.status = OrderStatus::Live;
            order.order_id = Some(fill.order_id.clone());
            self.by_order_id.insert(fill.order_id.clone(), client_id);
        }

        let applied = fill.volume.min(order.remaining);
        order.remaining -= applied;
        let remaining = order.remaining;
        let reservation = order.reservation;

        let commit = self.ledger.commit(reservation, fill.volume, fill.price)?;
        info!(
            "💥 FILL {} {} {} @ {} (remaining {}) position {}",
            fill.side, fill.volume, fill.instrument, fill.price, remaining, commit.position
        );
        if remaining == 0 {
            self.evict(&client_id, OrderStatus::Filled);
        }
        if commit.overfill > 0 {
            return Err(Error::InvalidState(format!(
                "fill {} on {} exceeds reserved volume by {}",
                fill.trade_id, fill.instrument, commit.overfill
            )));
        }

        if remaining == 0 {
            Ok(FillOutcome::Completed { position: commit.position })
        } else {
            Ok(FillOutcome::Partial { remaining, position: commit.position })
        }
    }

    /// Flag live orders on `instrument` for cancellation. Returns how many
    /// orders on it now await a cancel, unanswered submissions included.
    pub fn request_cancel(&mut self, instrument: &Instrument) -> usize {
        let mut n = 0;
        for order in self.orders.values_mut() {
            if &order.instrument != instrument {
                continue;
            }
            if order.status == OrderStatus::Live {
                order.cancel_requested = true;
            }
            if order.cancel_requested {
                n += 1;
            }
        }
        n
    }

    /// Live → Cancelled. Unknown or already-terminal orders are a no-op.
    pub fn confirm_cancel(&mut self, order_id: &OrderId) -> Option<ResidentOrder> {
        let client_id = *self.by_order_id.get(order_id)?;
        self.evict(&client_id, OrderStatus::Cancelled)
    }

    /// Whatever an IOC order did not fill is gone; close it out.
    pub fn resolve_ioc(&mut self, instrument: &Instrument) -> Vec<ResidentOrder> {
        let done: Vec<ClientOrderId> = self
            .orders
            .values()
            .filter(|o| {
                &o.instrument == instrument
                    && o.time_in_force == TimeInForce::ImmediateOrCancel
                    && o.status == OrderStatus::Live
            })
            .map(|o| o.client_id)
            .collect();
        done.iter().filter_map(|c| self.evict(c, OrderStatus::Cancelled)).collect()
    }

    /// Flag submissions the venue never answered. The order stays resident
    /// with its reservation held: it may be live at the venue, and a late
    /// fill must still commit. Returns the newly flagged orders.
    pub fn expire_pending(&mut self, ack_timeout: Duration) -> Vec<ResidentOrder> {
        let now = Utc::now();
        let mut flagged = Vec::new();
        for order in self.orders.values_mut() {
            if order.status == OrderStatus::Pending
                && !order.cancel_requested
                && (now - order.submitted_at).to_std().unwrap_or_default() >= ack_timeout
            {
                order.cancel_requested = true;
                flagged.push(order.clone());
            }
        }
        flagged
    }

    /// Instruments holding a flagged submission that still has no verdict.
    pub fn unanswered_instruments(&self) -> Vec<Instrument> {
        let mut out: Vec<Instrument> = Vec::new();
        for order in self.orders.values() {
            if order.status == OrderStatus::Pending
                && order.cancel_requested
                && !out.contains(&order.instrument)
            {
                out.push(order.instrument.clone());
            }
        }
        out
    }

    /// Close out cancel-flagged orders on `instrument` once the venue has
    /// taken the cancel and the fills before it are applied. Unanswered
    /// submissions always close here; live orders only with `include_live`,
    /// for venues that never confirm a cancel on their own.
    pub fn settle_cancels(
        &mut self,
        instrument: &Instrument,
        include_live: bool,
    ) -> Vec<ResidentOrder> {
        let done: Vec<ClientOrderId> = self
            .orders
            .values()
            .filter(|o| {
                &o.instrument == instrument
                    && o.cancel_requested
                    && (o.status == OrderStatus::Pending
                        || (include_live && o.status == OrderStatus::Live))
            })
            .map(|o| o.client_id)
            .collect();
        done.iter().filter_map(|c| self.evict(c, OrderStatus::Cancelled)).collect()
    }

    fn evict(&mut self, client_id: &ClientOrderId, status: OrderStatus) -> Option<ResidentOrder> {
        let mut order = self.orders.remove(client_id)?;
        if let Some(order_id) = &order.order_id {
            self.by_order_id.remove(order_id);
        }
        let released = self.ledger.release(order.reservation);
        order.status = status;
        debug!(
            "🗑️ {} {} {} {} -> {:?} (released {})",
            order.client_id, order.side, order.volume, order.instrument, status, released
        );
        Some(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::CapacityView;

    fn x() -> Instrument {
        Instrument::new("X")
    }

    fn intent(side: Side, volume: u64, tif: TimeInForce) -> OrderIntent {
        OrderIntent { instrument: x(), side, price: Decimal::from(90), volume, time_in_force: tif }
    }

    fn fill(trade: &str, order: &str, side: Side, volume: u64) -> Fill {
        Fill {
            trade_id: trade.into(),
            order_id: OrderId(order.into()),
            client_id: None,
            instrument: x(),
            side,
            price: Decimal::from(90),
            volume,
            timestamp: Utc::now(),
        }
    }

    fn submit(
        state: &mut TradingState,
        side: Side,
        volume: u64,
        tif: TimeInForce,
    ) -> ClientOrderId {
        let i = intent(side, volume, tif);
        let r = state.ledger.reserve(&i).unwrap();
        state.record_pending(&i, &r)
    }

    #[test]
    fn test_buy_three_of_five_end_to_end() {
        let mut state = TradingState::new(RiskLedger::new(750).with_limit(x(), 5));
        let c = submit(&mut state, Side::Buy, 3, TimeInForce::Resting);
        assert_eq!(state.ledger.available_capacity(&x(), Side::Buy), 2);
        assert_eq!(state.get(&c).unwrap().status, OrderStatus::Pending);

        state.acknowledge(&c, OrderId("1".into())).unwrap();
        assert_eq!(state.get(&c).unwrap().status, OrderStatus::Live);

        let out = state.apply_fill(&fill("t1", "1", Side::Buy, 3)).unwrap();
        assert_eq!(out, FillOutcome::Completed { position: 3 });
        assert!(state.get(&c).is_none());
        assert_eq!(state.ledger.outstanding_reservations(), 0);
        assert_eq!(state.ledger.position(&x()), 3);
        assert_eq!(state.ledger.available_capacity(&x(), Side::Buy), 2);
    }

    #[test]
    fn test_partial_fill_stays_live() {
        let mut state = TradingState::new(RiskLedger::new(10));
        let c = submit(&mut state, Side::Sell, 4, TimeInForce::Resting);
        state.acknowledge(&c, OrderId("7".into())).unwrap();

        let out = state.apply_fill(&fill("t1", "7", Side::Sell, 1)).unwrap();
        assert_eq!(out, FillOutcome::Partial { remaining: 3, position: -1 });
        assert_eq!(state.get(&c).unwrap().status, OrderStatus::Live);

        // at-least-once delivery
        let again = state.apply_fill(&fill("t1", "7", Side::Sell, 1)).unwrap();
        assert_eq!(again, FillOutcome::Duplicate);
        assert_eq!(state.ledger.position(&x()), -1);
    }

    #[test]
    fn test_reject_releases_capacity() {
        let mut state = TradingState::new(RiskLedger::new(5));
        let c = submit(&mut state, Side::Buy, 5, TimeInForce::Resting);
        assert_eq!(state.ledger.available_capacity(&x(), Side::Buy), 0);

        let rejected = state.reject(&c).unwrap();
        assert_eq!(rejected.status, OrderStatus::Rejected);
        assert_eq!(state.ledger.available_capacity(&x(), Side::Buy), 5);
        assert!(state.reject(&c).is_none());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut state = TradingState::new(RiskLedger::new(5));
        let c = submit(&mut state, Side::Buy, 2, TimeInForce::Resting);
        state.acknowledge(&c, OrderId("9".into())).unwrap();

        assert_eq!(state.request_cancel(&x()), 1);
        assert!(state.get(&c).unwrap().cancel_requested);
        // still at risk until confirmed
        assert_eq!(state.ledger.available_capacity(&x(), Side::Buy), 3);

        let cancelled = state.confirm_cancel(&OrderId("9".into())).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(state.ledger.available_capacity(&x(), Side::Buy), 5);
        assert!(state.confirm_cancel(&OrderId("9".into())).is_none());
    }

    #[test]
    fn test_cancel_after_fill_is_noop() {
        let mut state = TradingState::new(RiskLedger::new(5));
        let c = submit(&mut state, Side::Buy, 1, TimeInForce::Resting);
        state.acknowledge(&c, OrderId("3".into())).unwrap();
        state.apply_fill(&fill("t9", "3", Side::Buy, 1)).unwrap();

        assert!(state.confirm_cancel(&OrderId("3".into())).is_none());
        assert_eq!(state.ledger.position(&x()), 1);
    }

    #[test]
    fn test_fill_before_ack_binds_order_id() {
        let mut state = TradingState::new(RiskLedger::new(5));
        let c = submit(&mut state, Side::Buy, 2, TimeInForce::Resting);
        let mut f = fill("t1", "42", Side::Buy, 1);
        f.client_id = Some(c);

        state.apply_fill(&f).unwrap();
        assert_eq!(state.get(&c).unwrap().status, OrderStatus::Live);
        assert!(state.acknowledge(&c, OrderId("42".into())).is_ok());
        assert!(state.find_by_order_id(&OrderId("42".into())).is_some());
    }

    #[test]
    fn test_ioc_remainder_cancelled() {
        let mut state = TradingState::new(RiskLedger::new(5));
        let c = submit(&mut state, Side::Buy, 3, TimeInForce::ImmediateOrCancel);
        state.acknowledge(&c, OrderId("5".into())).unwrap();
        state.apply_fill(&fill("t1", "5", Side::Buy, 1)).unwrap();

        let closed = state.resolve_ioc(&x());
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, OrderStatus::Cancelled);
        assert!(state.is_empty());
        assert_eq!(state.ledger.position(&x()), 1);
        assert_eq!(state.ledger.available_capacity(&x(), Side::Buy), 4);
    }

    #[test]
    fn test_pending_expiry() {
        let mut state = TradingState::new(RiskLedger::new(5));
        submit(&mut state, Side::Buy, 2, TimeInForce::Resting);
        assert!(state.has_pending(&[x()]));
        assert!(state.expire_pending(Duration::from_secs(60)).is_empty());
        assert!(state.unanswered_instruments().is_empty());

        let expired = state.expire_pending(Duration::ZERO);
        assert_eq!(expired.len(), 1);
        // flagged once, still held
        assert!(state.expire_pending(Duration::ZERO).is_empty());
        assert_eq!(state.unanswered_instruments(), vec![x()]);
        assert!(state.has_pending(&[x()]));
        assert_eq!(state.ledger.reserved(&x(), Side::Buy), 2);

        let settled = state.settle_cancels(&x(), false);
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].status, OrderStatus::Cancelled);
        assert!(!state.has_pending(&[x()]));
        assert_eq!(state.ledger.outstanding_reservations(), 0);
    }

    #[test]
    fn test_expired_order_keeps_capacity_for_late_fill() {
        let mut state = TradingState::new(RiskLedger::new(750).with_limit(x(), 5));
        let c = submit(&mut state, Side::Buy, 5, TimeInForce::Resting);
        state.expire_pending(Duration::ZERO);

        // the venue may have the order; nothing new fits
        assert_eq!(state.ledger.available_capacity(&x(), Side::Buy), 0);
        assert!(state.ledger.reserve(&intent(Side::Buy, 5, TimeInForce::Resting)).is_err());

        let mut late = fill("t1", "88", Side::Buy, 5);
        late.client_id = Some(c);
        assert_eq!(state.apply_fill(&late).unwrap(), FillOutcome::Completed { position: 5 });
        assert_eq!(state.ledger.position(&x()), 5);
        assert_eq!(state.ledger.outstanding_reservations(), 0);
        assert!(state.is_empty());
    }

    #[test]
    fn test_settle_cancels_live_only_on_request() {
        let mut state = TradingState::new(RiskLedger::new(5));
        let c = submit(&mut state, Side::Buy, 2, TimeInForce::Resting);
        state.acknowledge(&c, OrderId("4".into())).unwrap();
        let s = submit(&mut state, Side::Sell, 1, TimeInForce::Resting);
        state.acknowledge(&s, OrderId("5".into())).unwrap();

        // nothing flagged yet
        assert!(state.settle_cancels(&x(), true).is_empty());
        assert_eq!(state.request_cancel(&x()), 2);
        assert!(state.settle_cancels(&x(), false).is_empty());
        assert_eq!(state.settle_cancels(&x(), true).len(), 2);
        assert!(state.is_empty());
        assert_eq!(state.ledger.outstanding_reservations(), 0);
    }

    #[test]
    fn test_unknown_fill_is_reported() {
        let mut state = TradingState::new(RiskLedger::new(5));
        assert!(matches!(
            state.apply_fill(&fill("t1", "nope", Side::Buy, 1)),
            Err(Error::InvalidState(_))
        ));
    }
}
