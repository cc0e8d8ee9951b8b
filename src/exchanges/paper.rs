//! Paper exchange - in-process venue with random-walk books
//!
//! Each market shows two levels per side around a mid that drifts on every
//! [`PaperExchange::step`]. Marketable orders fill against the displayed
//! levels at submission; resting orders fill in full at their own price once
//! the book trades through them. Own orders are never shown in the book.
//!
//! Fills are queued for [`ExchangeGateway::poll_fills`]; cancel confirmations
//! go out on the event channel. Every print, own fills included, lands on the
//! tape read by [`ExchangeGateway::poll_trade_ticks`].

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::config::{PaperConfig, PaperMarket};
use crate::core::{
    ClientOrderId, Error, ExchangeGateway, ExecutionEvent, Fill, Instrument, OrderId, OrderRequest,
    PriceLevel, RawBook, Result, Side, SubmitResponse, TimeInForce, TradeTick,
};

const LEVEL_GAP: Decimal = Decimal::from_parts(10, 0, 0, false, 2);

#[derive(Debug, Clone)]
struct Market {
    mid: Decimal,
    half_spread: Decimal,
    volume: u64,
    sequence: u64,
    open: bool,
}

impl Market {
    fn best_bid(&self) -> Decimal {
        self.mid - self.half_spread
    }

    fn best_ask(&self) -> Decimal {
        self.mid + self.half_spread
    }

    fn book(&self) -> RawBook {
        RawBook {
            bids: vec![
                PriceLevel::new(self.best_bid(), self.volume),
                PriceLevel::new(self.best_bid() - LEVEL_GAP, self.volume * 2),
            ],
            asks: vec![
                PriceLevel::new(self.best_ask(), self.volume),
                PriceLevel::new(self.best_ask() + LEVEL_GAP, self.volume * 2),
            ],
            sequence: self.sequence,
        }
    }

    /// Levels a marketable order on `side` at `limit` can take, best first.
    fn takeable(&self, side: Side, limit: Decimal) -> Vec<PriceLevel> {
        let book = self.book();
        match side {
            Side::Buy => book.asks.into_iter().filter(|l| l.price <= limit).collect(),
            Side::Sell => book.bids.into_iter().filter(|l| l.price >= limit).collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct RestingOrder {
    order_id: OrderId,
    client_id: ClientOrderId,
    instrument: Instrument,
    side: Side,
    price: Decimal,
    volume: u64,
}

#[derive(Debug, Default)]
struct Venue {
    markets: BTreeMap<Instrument, Market>,
    resting: Vec<RestingOrder>,
    fills: HashMap<Instrument, Vec<Fill>>,
    tape: HashMap<Instrument, Vec<TradeTick>>,
    positions: HashMap<Instrument, i64>,
    next_order: u64,
    next_trade: u64,
}

impl Venue {
    fn record_fill(
        &mut self,
        order_id: &OrderId,
        client_id: ClientOrderId,
        instrument: &Instrument,
        side: Side,
        price: Decimal,
        volume: u64,
    ) {
        self.next_trade += 1;
        *self.positions.entry(instrument.clone()).or_default() += side.sign() * volume as i64;
        self.print(instrument, price, volume);
        self.fills.entry(instrument.clone()).or_default().push(Fill {
            trade_id: format!("T{}", self.next_trade),
            order_id: order_id.clone(),
            client_id: Some(client_id),
            instrument: instrument.clone(),
            side,
            price,
            volume,
            timestamp: Utc::now(),
        });
    }

    fn print(&mut self, instrument: &Instrument, price: Decimal, volume: u64) {
        self.tape.entry(instrument.clone()).or_default().push(TradeTick {
            instrument: instrument.clone(),
            price,
            volume,
            timestamp: Utc::now(),
        });
    }

    /// Fill resting orders the current book has traded through.
    fn cross_resting(&mut self) -> usize {
        let (crossed, kept): (Vec<RestingOrder>, Vec<RestingOrder>) =
            std::mem::take(&mut self.resting).into_iter().partition(|o| {
                self.markets.get(&o.instrument).is_some_and(|m| {
                    m.open
                        && match o.side {
                            Side::Buy => m.best_ask() <= o.price,
                            Side::Sell => m.best_bid() >= o.price,
                        }
                })
            });
        self.resting = kept;
        for o in &crossed {
            self.record_fill(&o.order_id, o.client_id, &o.instrument, o.side, o.price, o.volume);
        }
        crossed.len()
    }
}

/// In-process venue
pub struct PaperExchange {
    venue: Mutex<Venue>,
    max_step: Decimal,
    connected: AtomicBool,
    events_tx: flume::Sender<ExecutionEvent>,
    events_rx: flume::Receiver<ExecutionEvent>,
    updates_tx: flume::Sender<Instrument>,
    updates_rx: flume::Receiver<Instrument>,
}

impl PaperExchange {
    pub fn new(cfg: &PaperConfig) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let (updates_tx, updates_rx) = flume::unbounded();
        let exchange = Self {
            venue: Mutex::new(Venue::default()),
            max_step: cfg.max_step,
            connected: AtomicBool::new(true),
            events_tx,
            events_rx,
            updates_tx,
            updates_rx,
        };
        for m in &cfg.markets {
            exchange.add_market(m);
        }
        exchange
    }

    pub fn add_market(&self, m: &PaperMarket) {
        let market = Market {
            mid: m.mid,
            half_spread: m.half_spread,
            volume: m.volume,
            sequence: 1,
            open: true,
        };
        self.venue.lock().markets.insert(m.instrument.clone(), market);
    }

    /// Pin a market's touch; bumps the sequence.
    pub fn set_touch(&self, instrument: &Instrument, bid: Decimal, ask: Decimal) {
        let mut venue = self.venue.lock();
        if let Some(m) = venue.markets.get_mut(instrument) {
            m.mid = (bid + ask) / Decimal::TWO;
            m.half_spread = (ask - bid) / Decimal::TWO;
            m.sequence += 1;
        }
        venue.cross_resting();
        drop(venue);
        let _ = self.updates_tx.send(instrument.clone());
    }

    pub fn set_open(&self, instrument: &Instrument, open: bool) {
        if let Some(m) = self.venue.lock().markets.get_mut(instrument) {
            m.open = open;
        }
    }

    /// Drop the session; every later call fails with `GatewayDisconnected`.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn resting_count(&self, instrument: &Instrument) -> usize {
        self.venue.lock().resting.iter().filter(|o| &o.instrument == instrument).count()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::GatewayDisconnected("paper session closed".into()))
        }
    }

    /// Move every open market one random step and fill what crossed.
    ///
    /// A move up prints a trade at the old ask, a move down at the old bid.
    pub fn step(&self) {
        let cents = (self.max_step * Decimal::ONE_HUNDRED).to_i64().unwrap_or(0).max(0);
        let mut venue = self.venue.lock();
        let mut moved = Vec::new();
        let mut prints = Vec::new();
        for (instrument, m) in venue.markets.iter_mut().filter(|(_, m)| m.open) {
            let span = (2 * cents + 1) as u64;
            let delta = (rand::random::<u64>() % span) as i64 - cents;
            let mid = m.mid + Decimal::new(delta, 2);
            if mid - m.half_spread - LEVEL_GAP <= Decimal::ZERO {
                continue;
            }
            if delta != 0 {
                let price = if delta > 0 { m.best_ask() } else { m.best_bid() };
                let volume = 1 + rand::random::<u64>() % m.volume.max(1);
                prints.push((instrument.clone(), price, volume));
            }
            m.mid = mid;
            m.sequence += 1;
            moved.push(instrument.clone());
        }
        for (instrument, price, volume) in prints {
            venue.print(&instrument, price, volume);
        }
        let filled = venue.cross_resting();
        drop(venue);

        if filled > 0 {
            debug!("📄 paper step filled {} resting order(s)", filled);
        }
        for instrument in moved {
            let _ = self.updates_tx.send(instrument);
        }
    }

    /// Drive [`PaperExchange::step`] on a timer until the session drops.
    pub fn spawn_market(exchange: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if exchange.ensure_connected().is_err() {
                    break;
                }
                exchange.step();
            }
        })
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn get_book(&self, instrument: &Instrument) -> Result<Option<RawBook>> {
        self.ensure_connected()?;
        let venue = self.venue.lock();
        Ok(venue.markets.get(instrument).filter(|m| m.open).map(Market::book))
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<SubmitResponse> {
        self.ensure_connected()?;
        let mut venue = self.venue.lock();
        let Some(market) = venue.markets.get(&request.instrument).cloned() else {
            let reason = format!("unknown instrument {}", request.instrument);
            return Ok(SubmitResponse::Rejected { reason });
        };
        if !market.open {
            return Ok(SubmitResponse::Rejected { reason: "market closed".into() });
        }
        if request.volume == 0 {
            return Ok(SubmitResponse::Rejected { reason: "zero volume".into() });
        }

        venue.next_order += 1;
        let order_id = OrderId(venue.next_order.to_string());

        let mut remaining = request.volume;
        for level in market.takeable(request.side, request.price) {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(level.volume);
            venue.record_fill(
                &order_id,
                request.client_id,
                &request.instrument,
                request.side,
                level.price,
                take,
            );
            remaining -= take;
        }

        if remaining > 0 && request.time_in_force == TimeInForce::Resting {
            venue.resting.push(RestingOrder {
                order_id: order_id.clone(),
                client_id: request.client_id,
                instrument: request.instrument.clone(),
                side: request.side,
                price: request.price,
                volume: remaining,
            });
        }

        info!(
            "📄 paper {} {} {} @ {} {} -> #{} (filled {})",
            request.side,
            request.volume,
            request.instrument,
            request.price,
            request.time_in_force,
            order_id,
            request.volume - remaining
        );
        Ok(SubmitResponse::Accepted { order_id })
    }

    async fn cancel_orders(&self, instrument: &Instrument) -> Result<()> {
        self.ensure_connected()?;
        let cancelled: Vec<RestingOrder> = {
            let mut venue = self.venue.lock();
            let (gone, kept) = std::mem::take(&mut venue.resting)
                .into_iter()
                .partition(|o| &o.instrument == instrument);
            venue.resting = kept;
            gone
        };
        for o in cancelled {
            let _ = self.events_tx.send(ExecutionEvent::Cancelled { order_id: o.order_id });
        }
        Ok(())
    }

    async fn poll_fills(&self, instrument: &Instrument) -> Result<Vec<Fill>> {
        self.ensure_connected()?;
        Ok(self.venue.lock().fills.remove(instrument).unwrap_or_default())
    }

    async fn get_position(&self, instrument: &Instrument) -> Result<i64> {
        self.ensure_connected()?;
        Ok(self.venue.lock().positions.get(instrument).copied().unwrap_or(0))
    }

    async fn poll_trade_ticks(&self, instrument: &Instrument) -> Result<Vec<TradeTick>> {
        self.ensure_connected()?;
        Ok(self.venue.lock().tape.remove(instrument).unwrap_or_default())
    }

    fn events(&self) -> Option<flume::Receiver<ExecutionEvent>> {
        Some(self.events_rx.clone())
    }

    fn book_updates(&self) -> Option<flume::Receiver<Instrument>> {
        Some(self.updates_rx.clone())
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn px(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn us() -> Instrument {
        Instrument::new("SEMIS_ETF_US")
    }

    fn request(side: Side, price: &str, volume: u64, tif: TimeInForce) -> OrderRequest {
        OrderRequest {
            client_id: ClientOrderId::new(),
            instrument: us(),
            side,
            price: px(price),
            volume,
            time_in_force: tif,
        }
    }

    fn exchange() -> PaperExchange {
        // US 90.00 / 91.00, 20 lots per top level
        PaperExchange::new(&PaperConfig::default())
    }

    #[tokio::test]
    async fn test_book_is_two_sided() {
        let ex = exchange();
        let book = ex.get_book(&us()).await.unwrap().unwrap();
        assert_eq!(book.bids[0].price, px("90.00"));
        assert_eq!(book.asks[0].price, px("91.00"));
        assert!(ex.get_book(&Instrument::new("NOPE")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ioc_takes_liquidity_and_never_rests() {
        let ex = exchange();
        let ioc = request(Side::Buy, "91.00", 25, TimeInForce::ImmediateOrCancel);
        let r = ex.submit_order(&ioc).await.unwrap();
        assert!(matches!(r, SubmitResponse::Accepted { .. }));

        let fills = ex.poll_fills(&us()).await.unwrap();
        assert_eq!(fills.iter().map(|f| f.volume).sum::<u64>(), 20);
        assert_eq!(ex.resting_count(&us()), 0);
        assert_eq!(ex.get_position(&us()).await.unwrap(), 20);
        assert!(ex.poll_fills(&us()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resting_order_fills_when_crossed() {
        let ex = exchange();
        ex.submit_order(&request(Side::Buy, "90.10", 1, TimeInForce::Resting)).await.unwrap();
        assert_eq!(ex.resting_count(&us()), 1);
        assert!(ex.poll_fills(&us()).await.unwrap().is_empty());

        ex.set_touch(&us(), px("89.50"), px("90.10"));
        let fills = ex.poll_fills(&us()).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, px("90.10"));
        assert_eq!(ex.resting_count(&us()), 0);
    }

    #[tokio::test]
    async fn test_cancel_confirms_on_event_channel() {
        let ex = exchange();
        ex.submit_order(&request(Side::Sell, "90.90", 1, TimeInForce::Resting)).await.unwrap();
        ex.cancel_orders(&us()).await.unwrap();

        let events = ex.events().unwrap();
        assert!(matches!(events.try_recv(), Ok(ExecutionEvent::Cancelled { .. })));
        assert_eq!(ex.resting_count(&us()), 0);
        // nothing left to cancel
        ex.cancel_orders(&us()).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_market_rejects() {
        let ex = exchange();
        ex.set_open(&us(), false);
        assert!(ex.get_book(&us()).await.unwrap().is_none());
        let ioc = request(Side::Buy, "91", 1, TimeInForce::ImmediateOrCancel);
        let r = ex.submit_order(&ioc).await.unwrap();
        assert!(matches!(r, SubmitResponse::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_is_fatal() {
        let ex = exchange();
        ex.disconnect();
        let err = ex.get_book(&us()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_step_moves_within_bounds() {
        let ex = exchange();
        for _ in 0..50 {
            ex.step();
        }
        let venue = ex.venue.lock();
        let m = &venue.markets[&us()];
        assert!(m.sequence > 1);
        assert!((m.mid - px("90.50")).abs() <= px("0.30") * Decimal::from(50));
    }

    #[tokio::test]
    async fn test_tape_records_steps_and_own_fills() {
        let ex = exchange();
        assert!(ex.poll_trade_ticks(&us()).await.unwrap().is_empty());

        ex.submit_order(&request(Side::Buy, "91.00", 5, TimeInForce::ImmediateOrCancel))
            .await
            .unwrap();
        let ticks = ex.poll_trade_ticks(&us()).await.unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!((ticks[0].price, ticks[0].volume), (px("91.00"), 5));

        let mut printed = 0;
        for _ in 0..50 {
            let before = ex.venue.lock().markets[&us()].mid;
            ex.step();
            let after = ex.venue.lock().markets[&us()].mid;
            let ticks = ex.poll_trade_ticks(&us()).await.unwrap();
            assert_eq!(ticks.len(), usize::from(before != after));
            printed += ticks.len();
        }
        assert!(ex.poll_trade_ticks(&us()).await.unwrap().is_empty());
        assert!(printed <= 50);
    }
}
