pub mod arbitrage;
pub mod price_improvement;

use crate::core::config::StrategyConfig;
use crate::core::{Instrument, OrderIntent};
use crate::orderbook::BookSet;
use crate::risk::CapacityView;

pub use arbitrage::CrossVenueArbitrage;
pub use price_improvement::PriceImprovement;

/// What one evaluation wants traded this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub intents: Vec<OrderIntent>,
    /// Linked intents are reserved and submitted as a unit (arbitrage legs).
    pub linked: bool,
    pub reason: String,
}

impl Proposal {
    pub fn instruments(&self) -> Vec<Instrument> {
        let mut out: Vec<Instrument> = Vec::new();
        for intent in &self.intents {
            if !out.contains(&intent.instrument) {
                out.push(intent.instrument.clone());
            }
        }
        out
    }
}

/// SignalEvaluator maps the current books to at most one proposal.
/// Implementations are pure: the only outside state they read is capacity.
pub trait SignalEvaluator: Send + Sync {
    /// Returns the name of the strategy for logging purposes
    fn name(&self) -> &str;

    /// Books this evaluator needs every cycle
    fn instruments(&self) -> Vec<Instrument>;

    fn evaluate(&self, books: &BookSet, capacity: &dyn CapacityView) -> Option<Proposal>;
}

/// Build the evaluator named in the config.
pub fn from_config(cfg: &StrategyConfig) -> Box<dyn SignalEvaluator> {
    match cfg {
        StrategyConfig::PriceImprovement { instrument, tick, min_spread, quote_volume } => Box::new(
            PriceImprovement::new(instrument.clone(), *tick, *min_spread, *quote_volume),
        ),
        StrategyConfig::Arbitrage { primary, secondary, max_volume } => Box::new(
            CrossVenueArbitrage::new(primary.clone(), secondary.clone())
                .with_max_volume(*max_volume),
        ),
    }
}
