//! Periodic PnL / position / fill report.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::{ExchangeGateway, Instrument, Result};
use crate::risk::PositionEvent;

/// Cash and marks built from realized fills.
#[derive(Debug, Default)]
pub struct PnlTracker {
    cash: Decimal,
    positions: BTreeMap<Instrument, i64>,
    last_price: HashMap<Instrument, Decimal>,
}

impl PnlTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Carry inventory held before the run, valued at `mark`, so PnL counts
    /// only what the mark does to it from here on.
    pub fn seed(&mut self, instrument: Instrument, position: i64, mark: Decimal) {
        self.cash -= Decimal::from(position) * mark;
        self.positions.insert(instrument.clone(), position);
        self.last_price.insert(instrument, mark);
    }

    pub fn on_fill(&mut self, event: &PositionEvent) {
        let notional = event.price * Decimal::from(event.volume);
        self.cash -= Decimal::from(event.side.sign()) * notional;
        self.positions.insert(event.instrument.clone(), event.position);
        self.last_price.insert(event.instrument.clone(), event.price);
    }

    pub fn position(&self, instrument: &Instrument) -> i64 {
        self.positions.get(instrument).copied().unwrap_or(0)
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    /// Cash plus open positions marked at `marks`, falling back to the last
    /// fill price for instruments without a usable book.
    pub fn pnl(&self, marks: &HashMap<Instrument, Decimal>) -> Decimal {
        let open: Decimal = self
            .positions
            .iter()
            .filter(|(_, p)| **p != 0)
            .map(|(i, p)| {
                let mark = marks
                    .get(i)
                    .or_else(|| self.last_price.get(i))
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                Decimal::from(*p) * mark
            })
            .sum();
        self.cash + open
    }
}

/// Position mismatch between the ledger and the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub instrument: Instrument,
    pub ledger: i64,
    pub venue: i64,
}

/// One report, also returned to callers for tests.
#[derive(Debug, Clone)]
pub struct ReportSummary {
    pub pnl: Decimal,
    pub positions: BTreeMap<Instrument, i64>,
    pub fills: Vec<PositionEvent>,
    /// Market prints per instrument since the previous report
    pub market_trades: BTreeMap<Instrument, usize>,
    pub divergences: Vec<Divergence>,
}

pub struct Reporter {
    gateway: Arc<dyn ExchangeGateway>,
    fills_rx: flume::Receiver<PositionEvent>,
    tracker: PnlTracker,
    instruments: Vec<Instrument>,
}

impl Reporter {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        fills_rx: flume::Receiver<PositionEvent>,
        instruments: Vec<Instrument>,
    ) -> Self {
        Self { gateway, fills_rx, tracker: PnlTracker::new(), instruments }
    }

    pub fn with_opening_position(
        mut self,
        instrument: Instrument,
        position: i64,
        mark: Decimal,
    ) -> Self {
        self.tracker.seed(instrument, position, mark);
        self
    }

    pub fn tracker(&self) -> &PnlTracker {
        &self.tracker
    }

    /// Drain fills since the last call, log PnL, positions, fills and market
    /// activity, and cross-check positions against the venue.
    pub async fn report(
        &mut self,
        marks: &HashMap<Instrument, Decimal>,
        positions: BTreeMap<Instrument, i64>,
    ) -> Result<ReportSummary> {
        let fills: Vec<PositionEvent> = self.fills_rx.try_iter().collect();
        for fill in &fills {
            self.tracker.on_fill(fill);
        }
        let pnl = self.tracker.pnl(marks);

        info!("📊 PnL: {:.2}", pnl);
        let json = serde_json::to_string(&positions).unwrap_or_else(|e| format!("<{}>", e));
        info!("📦 Positions: {}", json);
        if fills.is_empty() {
            info!("🧾 No fills since last report");
        } else {
            info!("🧾 {} fill(s) since last report:", fills.len());
            for f in &fills {
                info!(
                    "   {} {} {} @ {} -> {}",
                    f.side, f.volume, f.instrument, f.price, f.position
                );
            }
        }

        let mut market_trades = BTreeMap::new();
        for instrument in &self.instruments {
            match self.gateway.poll_trade_ticks(instrument).await {
                Ok(ticks) => {
                    let volume: u64 = ticks.iter().map(|t| t.volume).sum();
                    info!(
                        "📈 {} market trade(s) on {} since last report ({} lots)",
                        ticks.len(),
                        instrument,
                        volume
                    );
                    market_trades.insert(instrument.clone(), ticks.len());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("⚠️ poll_trade_ticks {} failed: {}", instrument, e),
            }
        }

        let mut divergences = Vec::new();
        for instrument in &self.instruments {
            let ledger = positions.get(instrument).copied().unwrap_or(0);
            match self.gateway.get_position(instrument).await {
                Ok(venue) if venue != ledger => {
                    warn!(
                        "⚠️ position mismatch on {}: ledger {} venue {}",
                        instrument, ledger, venue
                    );
                    divergences.push(Divergence { instrument: instrument.clone(), ledger, venue });
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("⚠️ get_position {} failed: {}", instrument, e),
            }
        }

        Ok(ReportSummary { pnl, positions, fills, market_trades, divergences })
    }
}
