//! Risk ledger — positions, reservations and the hard per-instrument limit.
//!
//! Capacity is worst-case: every outstanding reservation on a side is assumed
//! to fill. For a limit `L`, position `p`, reserved buys `b` and sells `s`:
//!
//! ```text
//! buy capacity  = L - (p + b)
//! sell capacity = L - (s - p)
//! ```
//!
//! so no subset of fills can push `|p|` past `L`.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::core::{Error, Instrument, OrderIntent, Result, Side};

/// Read-only capacity queries; what the evaluator is allowed to see.
pub trait CapacityView {
    fn available_capacity(&self, instrument: &Instrument, side: Side) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(u64);

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Capacity held for one order until it fills, is cancelled or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: ReservationId,
    pub instrument: Instrument,
    pub side: Side,
    pub volume: u64,
}

#[derive(Debug, Clone)]
struct Hold {
    instrument: Instrument,
    side: Side,
    remaining: u64,
}

/// Emitted on every realized position change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionEvent {
    pub instrument: Instrument,
    pub side: Side,
    pub volume: u64,
    pub price: Decimal,
    pub previous: i64,
    pub position: i64,
}

/// Result of converting part of a reservation into position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    pub position: i64,
    /// Reported fill volume beyond what was reserved; not applied.
    pub overfill: u64,
}

/// Position & risk ledger. Positions move only through [`RiskLedger::commit`].
#[derive(Debug)]
pub struct RiskLedger {
    limits: HashMap<Instrument, u64>,
    default_limit: u64,
    positions: HashMap<Instrument, i64>,
    holds: HashMap<ReservationId, Hold>,
    next_id: u64,
    events: Option<flume::Sender<PositionEvent>>,
}

impl RiskLedger {
    pub fn new(default_limit: u64) -> Self {
        Self {
            limits: HashMap::new(),
            default_limit,
            positions: HashMap::new(),
            holds: HashMap::new(),
            next_id: 1,
            events: None,
        }
    }

    pub fn with_limit(mut self, instrument: Instrument, limit: u64) -> Self {
        self.limits.insert(instrument, limit);
        self
    }

    pub fn with_limits(mut self, limits: impl IntoIterator<Item = (Instrument, u64)>) -> Self {
        self.limits.extend(limits);
        self
    }

    /// Opening position carried over from the venue (e.g. a previous run).
    pub fn with_opening_position(mut self, instrument: Instrument, position: i64) -> Self {
        if position != 0 {
            self.positions.insert(instrument, position);
        }
        self
    }

    /// Subscribe reporting to position changes.
    pub fn with_events(mut self, tx: flume::Sender<PositionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn limit(&self, instrument: &Instrument) -> u64 {
        self.limits.get(instrument).copied().unwrap_or(self.default_limit)
    }

    pub fn position(&self, instrument: &Instrument) -> i64 {
        self.positions.get(instrument).copied().unwrap_or(0)
    }

    /// All non-flat positions, sorted by instrument.
    pub fn positions(&self) -> BTreeMap<Instrument, i64> {
        self.positions.iter().map(|(i, p)| (i.clone(), *p)).collect()
    }

    /// Volume held by unresolved reservations on one side.
    pub fn reserved(&self, instrument: &Instrument, side: Side) -> u64 {
        self.holds
            .values()
            .filter(|h| &h.instrument == instrument && h.side == side)
            .map(|h| h.remaining)
            .sum()
    }

    pub fn outstanding_reservations(&self) -> usize {
        self.holds.len()
    }

    pub fn remaining(&self, id: ReservationId) -> Option<u64> {
        self.holds.get(&id).map(|h| h.remaining)
    }

    /// Hold capacity for a prospective order, or refuse it outright.
    pub fn reserve(&mut self, intent: &OrderIntent) -> Result<Reservation> {
        let available = self.available_capacity(&intent.instrument, intent.side);
        if intent.volume == 0 || intent.volume > available {
            return Err(Error::CapacityExceeded {
                instrument: intent.instrument.clone(),
                side: intent.side,
                requested: intent.volume,
                available,
            });
        }

        let id = ReservationId(self.next_id);
        self.next_id += 1;
        let hold = Hold {
            instrument: intent.instrument.clone(),
            side: intent.side,
            remaining: intent.volume,
        };
        self.holds.insert(id, hold);
        debug!(
            "🔒 {} {} {} {} (capacity {} -> {})",
            id,
            intent.side,
            intent.volume,
            intent.instrument,
            available,
            available - intent.volume
        );

        Ok(Reservation {
            id,
            instrument: intent.instrument.clone(),
            side: intent.side,
            volume: intent.volume,
        })
    }

    /// All-or-none reservation for linked intents.
    pub fn reserve_all(&mut self, intents: &[OrderIntent]) -> Result<Vec<Reservation>> {
        let mut held = Vec::with_capacity(intents.len());
        for intent in intents {
            match self.reserve(intent) {
                Ok(r) => held.push(r),
                Err(e) => {
                    for r in &held {
                        self.release(r.id);
                    }
                    return Err(e);
                }
            }
        }
        Ok(held)
    }

    /// Turn `fill_volume` of a reservation into position.
    pub fn commit(
        &mut self,
        id: ReservationId,
        fill_volume: u64,
        price: Decimal,
    ) -> Result<Commit> {
        let hold = self
            .holds
            .get_mut(&id)
            .ok_or_else(|| Error::InvalidState(format!("commit on unknown reservation {}", id)))?;

        let applied = fill_volume.min(hold.remaining);
        let overfill = fill_volume - applied;
        hold.remaining -= applied;

        let instrument = hold.instrument.clone();
        let side = hold.side;
        if hold.remaining == 0 {
            self.holds.remove(&id);
        }

        let previous = self.position(&instrument);
        let position = previous + side.sign() * applied as i64;
        if position == 0 {
            self.positions.remove(&instrument);
        } else {
            self.positions.insert(instrument.clone(), position);
        }

        if applied > 0 {
            let volume = applied;
            self.emit(PositionEvent { instrument, side, volume, price, previous, position });
        }

        Ok(Commit { position, overfill })
    }

    /// Return whatever the reservation still holds. Idempotent.
    pub fn release(&mut self, id: ReservationId) -> u64 {
        match self.holds.remove(&id) {
            Some(hold) => {
                debug!("🔓 {} released {} {}", id, hold.remaining, hold.instrument);
                hold.remaining
            }
            None => 0,
        }
    }

    fn emit(&mut self, event: PositionEvent) {
        if let Some(tx) = &self.events
            && tx.send(event).is_err()
        {
            debug!("position event receiver gone, no longer publishing");
            self.events = None;
        }
    }
}

impl CapacityView for RiskLedger {
    fn available_capacity(&self, instrument: &Instrument, side: Side) -> u64 {
        let limit = self.limit(instrument) as i64;
        let position = self.position(instrument);
        let reserved = self.reserved(instrument, side) as i64;
        let exposure = match side {
            Side::Buy => position + reserved,
            Side::Sell => reserved - position,
        };
        (limit - exposure).max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TimeInForce;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn x() -> Instrument {
        Instrument::new("X")
    }

    fn intent(side: Side, volume: u64) -> OrderIntent {
        OrderIntent {
            instrument: x(),
            side,
            price: Decimal::from(90),
            volume,
            time_in_force: TimeInForce::Resting,
        }
    }

    #[test]
    fn test_reserve_commit_release_scenario() {
        let mut ledger = RiskLedger::new(750).with_limit(x(), 5);
        assert_eq!(ledger.available_capacity(&x(), Side::Buy), 5);

        let r = ledger.reserve(&intent(Side::Buy, 3)).unwrap();
        assert_eq!(ledger.available_capacity(&x(), Side::Buy), 2);
        assert_eq!(ledger.position(&x()), 0);

        let commit = ledger.commit(r.id, 3, Decimal::from(90)).unwrap();
        assert_eq!(commit.position, 3);
        assert_eq!(commit.overfill, 0);
        assert_eq!(ledger.outstanding_reservations(), 0);
        assert_eq!(ledger.available_capacity(&x(), Side::Buy), 2);
        assert_eq!(ledger.available_capacity(&x(), Side::Sell), 8);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut ledger = RiskLedger::new(5);
        ledger.reserve(&intent(Side::Buy, 4)).unwrap();
        let err = ledger.reserve(&intent(Side::Buy, 2)).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { requested: 2, available: 1, .. }));
        // sell side is independent of pending buys
        assert_eq!(ledger.available_capacity(&x(), Side::Sell), 5);
    }

    #[test]
    fn test_zero_volume_never_reserved() {
        let mut ledger = RiskLedger::new(5);
        assert!(ledger.reserve(&intent(Side::Buy, 0)).is_err());
    }

    #[test]
    fn test_partial_fill_then_release() {
        let mut ledger = RiskLedger::new(5);
        let r = ledger.reserve(&intent(Side::Sell, 4)).unwrap();
        ledger.commit(r.id, 1, Decimal::from(91)).unwrap();
        assert_eq!(ledger.remaining(r.id), Some(3));
        assert_eq!(ledger.position(&x()), -1);

        assert_eq!(ledger.release(r.id), 3);
        assert_eq!(ledger.release(r.id), 0);
        assert_eq!(ledger.available_capacity(&x(), Side::Sell), 4);
        assert_eq!(ledger.available_capacity(&x(), Side::Buy), 6);
    }

    #[test]
    fn test_overfill_is_clamped() {
        let mut ledger = RiskLedger::new(5);
        let r = ledger.reserve(&intent(Side::Buy, 2)).unwrap();
        let commit = ledger.commit(r.id, 3, Decimal::from(90)).unwrap();
        assert_eq!(commit.position, 2);
        assert_eq!(commit.overfill, 1);
        assert!(ledger.commit(r.id, 1, Decimal::from(90)).is_err());
    }

    #[test]
    fn test_reserve_all_is_all_or_none() {
        let mut ledger = RiskLedger::new(5).with_limit(Instrument::new("Y"), 1);
        let legs = vec![
            intent(Side::Buy, 2),
            OrderIntent { instrument: Instrument::new("Y"), ..intent(Side::Sell, 2) },
        ];
        assert!(ledger.reserve_all(&legs).is_err());
        assert_eq!(ledger.outstanding_reservations(), 0);
        assert_eq!(ledger.available_capacity(&x(), Side::Buy), 5);
    }

    #[test]
    fn test_position_events_published() {
        let (tx, rx) = flume::unbounded();
        let mut ledger = RiskLedger::new(5).with_events(tx);
        let r = ledger.reserve(&intent(Side::Buy, 2)).unwrap();
        ledger.commit(r.id, 2, Decimal::from(90)).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.previous, 0);
        assert_eq!(event.position, 2);
        assert_eq!(event.volume, 2);
    }

    #[test]
    fn test_opening_position_counts_against_limit() {
        let ledger = RiskLedger::new(5).with_opening_position(x(), -5);
        assert_eq!(ledger.available_capacity(&x(), Side::Sell), 0);
        assert_eq!(ledger.available_capacity(&x(), Side::Buy), 10);
    }

    #[test]
    fn test_concurrent_fill_delivery_respects_limit() {
        let ledger = Arc::new(Mutex::new(RiskLedger::new(50)));
        let ids: Vec<_> = (0..10)
            .map(|_| ledger.lock().reserve(&intent(Side::Buy, 5)).unwrap().id)
            .collect();
        assert!(ledger.lock().reserve(&intent(Side::Buy, 1)).is_err());

        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        let mut guard = ledger.lock();
                        guard.commit(id, 1, Decimal::from(90)).unwrap();
                        assert!(guard.position(&x()).abs() <= 50);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let guard = ledger.lock();
        assert_eq!(guard.position(&x()), 50);
        assert_eq!(guard.outstanding_reservations(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(Side, u64),
        Commit(usize, u64),
        Release(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (prop_oneof![Just(Side::Buy), Just(Side::Sell)], 1u64..8)
                .prop_map(|(s, v)| Op::Reserve(s, v)),
            (0usize..16, 0u64..8).prop_map(|(i, v)| Op::Commit(i, v)),
            (0usize..16).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_position_never_exceeds_limit(ops in prop::collection::vec(arb_op(), 1..60)) {
            let limit = 10u64;
            let mut ledger = RiskLedger::new(limit);
            let mut ids = Vec::new();

            for op in ops {
                match op {
                    Op::Reserve(side, v) => {
                        if let Ok(r) = ledger.reserve(&intent(side, v)) {
                            ids.push(r.id);
                        }
                    }
                    Op::Commit(i, v) => {
                        if let Some(id) = ids.get(i) {
                            let _ = ledger.commit(*id, v, Decimal::from(90));
                        }
                    }
                    Op::Release(i) => {
                        if let Some(id) = ids.get(i) {
                            ledger.release(*id);
                        }
                    }
                }
                prop_assert!(ledger.position(&x()).unsigned_abs() <= limit);
                let worst_long = ledger.position(&x()) + ledger.reserved(&x(), Side::Buy) as i64;
                let worst_short = ledger.position(&x()) - ledger.reserved(&x(), Side::Sell) as i64;
                prop_assert!(worst_long <= limit as i64);
                prop_assert!(worst_short >= -(limit as i64));
            }
        }
    }
}
