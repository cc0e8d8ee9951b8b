//! Single-instrument quoting: step one tick inside the touch on both sides.

use rust_decimal::Decimal;
use tracing::info;

use super::{Proposal, SignalEvaluator};
use crate::core::{Instrument, OrderIntent, Side, TimeInForce};
use crate::orderbook::BookSet;
use crate::risk::CapacityView;

/// Rests a bid at `best_bid + tick` and an ask at `best_ask - tick`
/// as long as the improved quotes stay more than `min_spread` apart.
pub struct PriceImprovement {
    instrument: Instrument,
    tick: Decimal,
    min_spread: Decimal,
    quote_volume: u64,
}

impl PriceImprovement {
    pub fn new(
        instrument: Instrument,
        tick: Decimal,
        min_spread: Decimal,
        quote_volume: u64,
    ) -> Self {
        Self { instrument, tick, min_spread, quote_volume }
    }
}

impl SignalEvaluator for PriceImprovement {
    fn name(&self) -> &str {
        "Price Improvement"
    }

    fn instruments(&self) -> Vec<Instrument> {
        vec![self.instrument.clone()]
    }

    fn evaluate(&self, books: &BookSet, capacity: &dyn CapacityView) -> Option<Proposal> {
        let book = books.get(&self.instrument)?;
        let (best_bid, best_ask) = (book.best_bid()?, book.best_ask()?);

        let bid_price = best_bid.price + self.tick;
        let ask_price = best_ask.price - self.tick;
        if ask_price - bid_price <= self.min_spread {
            info!(
                "📐 {} too tight to improve: bid={} ask={} (min spread {})",
                self.instrument, best_bid.price, best_ask.price, self.min_spread
            );
            return None;
        }

        let mut intents = Vec::with_capacity(2);
        for (side, price) in [(Side::Buy, bid_price), (Side::Sell, ask_price)] {
            let volume = self.quote_volume.min(capacity.available_capacity(&self.instrument, side));
            if volume == 0 {
                info!("🧱 {} {} side at risk limit, not quoting", self.instrument, side);
                continue;
            }
            intents.push(OrderIntent {
                instrument: self.instrument.clone(),
                side,
                price,
                volume,
                time_in_force: TimeInForce::Resting,
            });
        }

        if intents.is_empty() {
            return None;
        }

        Some(Proposal {
            intents,
            linked: false,
            reason: format!(
                "improve {} touch {}/{} -> {}/{}",
                self.instrument, best_bid.price, best_ask.price, bid_price, ask_price
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PriceLevel;
    use crate::orderbook::BookSnapshot;
    use crate::risk::RiskLedger;
    use proptest::prelude::*;

    fn px(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn us() -> Instrument {
        Instrument::new("SEMIS_ETF_US")
    }

    fn books(bid: &str, ask: &str) -> BookSet {
        let mut set = BookSet::new();
        set.insert(
            BookSnapshot::from_levels(
                us(),
                vec![PriceLevel::new(px(bid), 10)],
                vec![PriceLevel::new(px(ask), 10)],
                1,
            )
            .unwrap(),
        );
        set
    }

    fn evaluator() -> PriceImprovement {
        PriceImprovement::new(us(), px("0.1"), px("0.01"), 1)
    }

    #[test]
    fn test_quotes_inside_the_spread() {
        let ledger = RiskLedger::new(750);
        let proposal = evaluator().evaluate(&books("90", "91"), &ledger).unwrap();

        assert!(!proposal.linked);
        assert_eq!(proposal.intents.len(), 2);
        let bid = &proposal.intents[0];
        let ask = &proposal.intents[1];
        assert_eq!((bid.side, bid.price, bid.volume), (Side::Buy, px("90.1"), 1));
        assert_eq!((ask.side, ask.price, ask.volume), (Side::Sell, px("90.9"), 1));
        assert_eq!(bid.time_in_force, TimeInForce::Resting);
    }

    #[test]
    fn test_too_tight_proposes_nothing() {
        let ledger = RiskLedger::new(750);
        // improved quotes would be 90.1 / 90.1
        assert!(evaluator().evaluate(&books("90", "90.2"), &ledger).is_none());
        // exactly min_spread apart is still not enough
        assert!(evaluator().evaluate(&books("90", "90.21"), &ledger).is_none());
        assert!(evaluator().evaluate(&books("90", "90.22"), &ledger).is_some());
    }

    #[test]
    fn test_missing_or_one_sided_book() {
        let ledger = RiskLedger::new(750);
        assert!(evaluator().evaluate(&BookSet::new(), &ledger).is_none());

        let mut set = BookSet::new();
        let one_sided =
            BookSnapshot::from_levels(us(), vec![PriceLevel::new(px("90"), 1)], vec![], 1);
        set.insert(one_sided.unwrap());
        assert!(evaluator().evaluate(&set, &ledger).is_none());
    }

    #[test]
    fn test_side_at_limit_is_skipped() {
        let ledger = RiskLedger::new(5).with_opening_position(us(), 5);
        let proposal = evaluator().evaluate(&books("90", "91"), &ledger).unwrap();
        assert_eq!(proposal.intents.len(), 1);
        assert_eq!(proposal.intents[0].side, Side::Sell);
    }

    proptest! {
        #[test]
        fn prop_never_self_crossing(
            bid in 8_000i64..9_500i64,
            width in 1i64..300i64,
            tick in 1i64..50i64,
            min_spread in 0i64..50i64,
        ) {
            let bid_px = Decimal::new(bid, 2);
            let ask_px = Decimal::new(bid + width, 2);
            let (tick_px, min_px) = (Decimal::new(tick, 2), Decimal::new(min_spread, 2));
            let eval = PriceImprovement::new(us(), tick_px, min_px, 1);
            let mut set = BookSet::new();
            set.insert(BookSnapshot::from_levels(
                us(),
                vec![PriceLevel::new(bid_px, 1)],
                vec![PriceLevel::new(ask_px, 1)],
                1,
            ).unwrap());

            let ledger = RiskLedger::new(750);
            match eval.evaluate(&set, &ledger) {
                Some(p) => {
                    let b = p.intents.iter().find(|i| i.side == Side::Buy).unwrap();
                    let a = p.intents.iter().find(|i| i.side == Side::Sell).unwrap();
                    prop_assert!(b.price < a.price);
                    prop_assert!(a.price - b.price > Decimal::new(min_spread, 2));
                }
                None => {
                    let improved =
                        (ask_px - Decimal::new(tick, 2)) - (bid_px + Decimal::new(tick, 2));
                    prop_assert!(improved <= Decimal::new(min_spread, 2));
                }
            }
        }
    }
}
