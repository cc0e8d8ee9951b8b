use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use basket_tx::Config;
use basket_tx::core::ExchangeGateway;
use basket_tx::engine::TradingEngine;
use basket_tx::exchanges::PaperExchange;
use basket_tx::execution::TradingState;
use basket_tx::orderbook::BookSnapshot;
use basket_tx::report::Reporter;
use basket_tx::risk::RiskLedger;
use basket_tx::strategy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // 1. Logger
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,basket_tx=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!("🦀 basket-tx starting...");

    // 2. Config: explicit path argument wins over the default lookup
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Config::load(&path)?,
        None => Config::load_default()?,
    };
    let instruments = config.strategy.instruments();

    // 3. Venue
    let paper = Arc::new(PaperExchange::new(&config.paper));
    let market = PaperExchange::spawn_market(paper.clone(), config.paper.update_interval());
    let gateway: Arc<dyn ExchangeGateway> = paper;

    // 4. Ledger and PnL seeded from the venue's positions
    let (fills_tx, fills_rx) = flume::unbounded();
    let mut ledger = RiskLedger::new(config.risk.default_limit)
        .with_limits(config.risk.limits.clone())
        .with_events(fills_tx);
    let mut reporter = Reporter::new(gateway.clone(), fills_rx, instruments.clone());
    for instrument in &instruments {
        let position = gateway.get_position(instrument).await?;
        if position == 0 {
            continue;
        }
        ledger = ledger.with_opening_position(instrument.clone(), position);
        let mark = gateway
            .get_book(instrument)
            .await?
            .and_then(|raw| BookSnapshot::from_raw(instrument.clone(), raw).ok())
            .and_then(|book| book.mid());
        match mark {
            Some(mark) => {
                tracing::info!("📦 opening position {} {} @ {}", instrument, position, mark);
                reporter = reporter.with_opening_position(instrument.clone(), position, mark);
            }
            None => tracing::warn!(
                "⚠️ opening position {} {} has no mark; left out of PnL",
                instrument,
                position
            ),
        }
    }
    let state = Arc::new(Mutex::new(TradingState::new(ledger)));

    // 5. Driver
    let evaluator = strategy::from_config(&config.strategy);
    tracing::info!("⏳ {} on {:?}, limits {:?}", evaluator.name(), instruments, config.risk);
    let engine = TradingEngine::new(config.engine.clone(), gateway, evaluator, state)
        .with_reporter(reporter);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let result = engine.run(shutdown).await;
    market.abort();

    result?;
    tracing::info!("👋 basket-tx stopped");
    Ok(())
}
