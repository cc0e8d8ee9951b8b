//! Cross-venue arbitrage between two economically equivalent instruments.
//!
//! Arb exists when:
//!   - primary bid > secondary ask   → buy secondary, sell primary
//!   - secondary bid > primary ask   → buy primary, sell secondary
//!
//! Directions are checked in that order and the first match wins, so stale
//! data showing both crosses still yields a single proposal.

use rust_decimal::Decimal;
use tracing::{debug, info};

use super::{Proposal, SignalEvaluator};
use crate::core::{Instrument, OrderIntent, PriceLevel, Side, TimeInForce};
use crate::orderbook::BookSet;
use crate::risk::CapacityView;

pub struct CrossVenueArbitrage {
    primary: Instrument,
    secondary: Instrument,
    max_volume: Option<u64>,
}

impl CrossVenueArbitrage {
    pub fn new(primary: Instrument, secondary: Instrument) -> Self {
        Self { primary, secondary, max_volume: None }
    }

    pub fn with_max_volume(mut self, max_volume: Option<u64>) -> Self {
        self.max_volume = max_volume;
        self
    }

    /// Size and build the pair for selling `rich` at its bid and buying `cheap` at its ask.
    fn pair(
        &self,
        rich: &Instrument,
        rich_bid: PriceLevel,
        cheap: &Instrument,
        cheap_ask: PriceLevel,
        capacity: &dyn CapacityView,
    ) -> Option<Proposal> {
        let mut volume = rich_bid
            .volume
            .min(cheap_ask.volume)
            .min(capacity.available_capacity(rich, Side::Sell))
            .min(capacity.available_capacity(cheap, Side::Buy));
        if let Some(cap) = self.max_volume {
            volume = volume.min(cap);
        }
        if volume == 0 {
            info!(
                "🧱 ARB {}@{} > {}@{} but no volume after risk capacity",
                rich, rich_bid.price, cheap, cheap_ask.price
            );
            return None;
        }

        let edge: Decimal = rich_bid.price - cheap_ask.price;
        Some(Proposal {
            intents: vec![
                OrderIntent {
                    instrument: cheap.clone(),
                    side: Side::Buy,
                    price: cheap_ask.price,
                    volume,
                    time_in_force: TimeInForce::ImmediateOrCancel,
                },
                OrderIntent {
                    instrument: rich.clone(),
                    side: Side::Sell,
                    price: rich_bid.price,
                    volume,
                    time_in_force: TimeInForce::ImmediateOrCancel,
                },
            ],
            linked: true,
            reason: format!(
                "ARB buy {} @ {} sell {} @ {} | vol {} edge {}",
                cheap, cheap_ask.price, rich, rich_bid.price, volume, edge
            ),
        })
    }
}

impl SignalEvaluator for CrossVenueArbitrage {
    fn name(&self) -> &str {
        "Cross-Venue Arbitrage"
    }

    fn instruments(&self) -> Vec<Instrument> {
        vec![self.primary.clone(), self.secondary.clone()]
    }

    fn evaluate(&self, books: &BookSet, capacity: &dyn CapacityView) -> Option<Proposal> {
        let (Some(a), Some(b)) = (books.get(&self.primary), books.get(&self.secondary)) else {
            debug!("some market is closed ({} / {})", self.primary, self.secondary);
            return None;
        };
        let (Some(a_bid), Some(a_ask), Some(b_bid), Some(b_ask)) =
            (a.best_bid(), a.best_ask(), b.best_bid(), b.best_ask())
        else {
            debug!("one-sided book on {} or {}", self.primary, self.secondary);
            return None;
        };

        if a_bid.price > b_ask.price {
            return self.pair(&self.primary, a_bid, &self.secondary, b_ask, capacity);
        }
        if b_bid.price > a_ask.price {
            return self.pair(&self.secondary, b_bid, &self.primary, a_ask, capacity);
        }

        debug!(
            "no cross: {} {}/{} vs {} {}/{}",
            self.primary, a_bid.price, a_ask.price, self.secondary, b_bid.price, b_ask.price
        );
        None
    }
}
