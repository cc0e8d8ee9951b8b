//! Trading loop driver.
//!
//! One cycle: expire unanswered submissions → poll fills → fetch books →
//! evaluate → execute → (every N cycles) report. Cycles never overlap; the
//! next tick waits for the current cycle to finish.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::config::EngineConfig;
use crate::core::{ExchangeGateway, Instrument, InvalidBook, Result};
use crate::execution::{ExecutionReport, OrderManager, TradingState};
use crate::orderbook::{BookFeed, BookSet};
use crate::report::Reporter;
use crate::strategy::SignalEvaluator;

/// What one decision cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub books: usize,
    pub fills: usize,
    pub expired: usize,
    /// Evaluation skipped: a submission on a traded instrument is unresolved
    pub held: bool,
    pub proposed: bool,
    pub execution: ExecutionReport,
    pub errors: usize,
}

pub struct TradingEngine {
    config: EngineConfig,
    gateway: Arc<dyn ExchangeGateway>,
    evaluator: Box<dyn SignalEvaluator>,
    orders: Arc<OrderManager>,
    feed: BookFeed,
    books: BookSet,
    reporter: Option<Reporter>,
    cycle: u64,
}

impl TradingEngine {
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn ExchangeGateway>,
        evaluator: Box<dyn SignalEvaluator>,
        state: Arc<Mutex<TradingState>>,
    ) -> Self {
        let orders = Arc::new(OrderManager::new(gateway.clone(), state, config.request_timeout()));
        Self {
            config,
            gateway,
            evaluator,
            orders,
            feed: BookFeed::new(),
            books: BookSet::new(),
            reporter: None,
            cycle: 0,
        }
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn orders(&self) -> &Arc<OrderManager> {
        &self.orders
    }

    /// Books accepted in the most recent cycle
    pub fn books(&self) -> &BookSet {
        &self.books
    }

    /// Run one decision cycle. Only a fatal gateway error is returned.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.cycle += 1;
        let mut outcome = CycleOutcome { cycle: self.cycle, ..Default::default() };
        let instruments = self.evaluator.instruments();

        match self.orders.expire_pending(self.config.ack_timeout()).await {
            Ok(n) => outcome.expired = n,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("⚠️ expiring unanswered orders failed: {}", e);
                outcome.errors += 1;
            }
        }

        for instrument in &instruments {
            match self.orders.poll_fills(instrument).await {
                Ok(n) => outcome.fills += n,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("⚠️ poll_fills {} failed: {}", instrument, e);
                    outcome.errors += 1;
                }
            }
        }

        self.books = BookSet::new();
        let fetched = self
            .feed
            .fetch_all(self.gateway.as_ref(), &instruments, self.config.request_timeout())
            .await;
        for (instrument, result) in fetched {
            match result {
                Ok(Some(book)) => self.books.insert(book),
                Ok(None) => debug!("{}", InvalidBook::Missing(instrument)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("⚠️ skipping {}: {}", instrument, e);
                    outcome.errors += 1;
                }
            }
        }
        outcome.books = self.books.len();

        if self.orders.has_pending(&instruments) {
            info!("⏳ unresolved submission on {:?}, holding this cycle", instruments);
            outcome.held = true;
        } else {
            let proposal = {
                let state = self.orders.state().lock();
                self.evaluator.evaluate(&self.books, &state.ledger)
            };
            if let Some(proposal) = proposal {
                outcome.proposed = true;
                outcome.execution = self.orders.execute(&proposal).await?;
                outcome.errors += outcome.execution.errors;
            }
        }

        let every = self.config.report_every_cycles;
        if every > 0 && self.cycle % every == 0 {
            self.report().await?;
        }

        Ok(outcome)
    }

    async fn report(&mut self) -> Result<()> {
        let Some(reporter) = self.reporter.as_mut() else {
            return Ok(());
        };
        let positions = self.orders.state().lock().ledger.positions();
        match reporter.report(&self.books.mids(), positions).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("⚠️ report failed: {}", e);
                Ok(())
            }
        }
    }

    /// Apply the gateway's execution events as they arrive.
    pub fn spawn_event_feed(&self) -> Option<JoinHandle<()>> {
        let events = self.gateway.events()?;
        let orders = Arc::clone(&self.orders);
        Some(tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                orders.on_event(event);
            }
            warn!("⚠️ execution event stream closed");
        }))
    }

    /// Drive cycles until `shutdown` resolves or the gateway disconnects.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            "🦀 {} on {} every {:?} for {:?}",
            self.evaluator.name(),
            self.gateway.name(),
            self.config.cycle_interval(),
            self.evaluator.instruments()
        );

        let feed = self.spawn_event_feed();
        let instruments = self.evaluator.instruments();
        let updates =
            if self.config.react_to_book_updates { self.gateway.book_updates() } else { None };

        let mut ticker = tokio::time::interval(self.config.cycle_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("🛑 shutdown requested");
                    break Ok(());
                }
                _ = ticker.tick() => {}
                Some(instrument) = next_update(updates.as_ref()) => {
                    if !instruments.contains(&instrument) {
                        continue;
                    }
                    debug!("📖 book update on {}", instrument);
                }
            }

            match self.run_cycle().await {
                Ok(outcome) => debug!("🔁 {:?}", outcome),
                Err(e) => {
                    error!("🚨 {}", e);
                    break Err(e);
                }
            }
            // a cycle just read every book; coalesce what queued meanwhile
            if let Some(rx) = &updates {
                while rx.try_recv().is_ok() {}
            }
        };

        if result.is_ok() {
            self.withdraw_quotes(&instruments).await;
        }
        if let Some(handle) = feed {
            handle.abort();
        }
        result
    }

    /// Best-effort cancel of everything still resting on the way out.
    async fn withdraw_quotes(&self, instruments: &[Instrument]) {
        for instrument in instruments {
            match self.orders.cancel_stale(instrument).await {
                Ok(0) => {}
                Ok(n) => info!("🧹 withdrew {} order(s) on {}", n, instrument),
                Err(e) => warn!("⚠️ could not withdraw orders on {}: {}", instrument, e),
            }
        }
    }
}

async fn next_update(updates: Option<&flume::Receiver<Instrument>>) -> Option<Instrument> {
    match updates {
        Some(rx) => rx.recv_async().await.ok(),
        None => std::future::pending().await,
    }
}
