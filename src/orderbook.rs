//! Book snapshots - validated, ordered best-of-book views per instrument.

use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::core::{Error, ExchangeGateway, Instrument, InvalidBook, PriceLevel, RawBook, Result};

/// Immutable view of one venue's book.
/// Bids: descending (highest first). Asks: ascending (lowest first).
/// Equal prices keep the order the venue sent them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookSnapshot {
    instrument: Instrument,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    sequence: u64,
}

impl BookSnapshot {
    /// Order the levels and refuse crossed or locked books.
    pub fn from_levels(
        instrument: Instrument,
        mut bids: Vec<PriceLevel>,
        mut asks: Vec<PriceLevel>,
        sequence: u64,
    ) -> std::result::Result<Self, InvalidBook> {
        bids.retain(|l| l.volume > 0);
        asks.retain(|l| l.volume > 0);
        // sort_by is stable: first-seen wins on ties
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        if let (Some(bid), Some(ask)) = (bids.first(), asks.first()) {
            if bid.price > ask.price {
                return Err(InvalidBook::Crossed(instrument, bid.price, ask.price));
            }
            if bid.price == ask.price {
                return Err(InvalidBook::Locked(instrument, bid.price));
            }
        }

        Ok(Self { instrument, bids, asks, sequence })
    }

    pub fn from_raw(
        instrument: Instrument,
        raw: RawBook,
    ) -> std::result::Result<Self, InvalidBook> {
        Self::from_levels(instrument, raw.bids, raw.asks, raw.sequence)
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn bids(&self) -> &[PriceLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[PriceLevel] {
        &self.asks
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    pub fn is_two_sided(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    pub fn mid(&self) -> Option<Decimal> {
        Some((self.best_ask()?.price + self.best_bid()?.price) / Decimal::TWO)
    }
}

/// Valid snapshots for one decision cycle. Absent = empty, invalid or failed.
#[derive(Debug, Clone, Default)]
pub struct BookSet {
    books: HashMap<Instrument, BookSnapshot>,
}

impl BookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, book: BookSnapshot) {
        self.books.insert(book.instrument().clone(), book);
    }

    pub fn get(&self, instrument: &Instrument) -> Option<&BookSnapshot> {
        self.books.get(instrument)
    }

    pub fn mids(&self) -> HashMap<Instrument, Decimal> {
        self.books
            .iter()
            .filter_map(|(i, b)| b.mid().map(|m| (i.clone(), m)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

/// Pulls books from the gateway and guards against out-of-order delivery.
#[derive(Debug, Default)]
pub struct BookFeed {
    last_sequence: HashMap<Instrument, u64>,
}

impl BookFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify what the gateway returned. `Ok(None)` means the venue has no book.
    pub fn accept(
        &mut self,
        instrument: &Instrument,
        raw: Option<RawBook>,
    ) -> Result<Option<BookSnapshot>> {
        let Some(raw) = raw else {
            return Ok(None);
        };

        if let Some(&last) = self.last_sequence.get(instrument)
            && raw.sequence < last
        {
            return Err(InvalidBook::Stale(instrument.clone(), raw.sequence, last).into());
        }

        let book = BookSnapshot::from_raw(instrument.clone(), raw)?;
        self.last_sequence.insert(instrument.clone(), book.sequence());
        Ok(Some(book))
    }

    /// Fetch one instrument, bounded by `timeout`.
    pub async fn fetch(
        &mut self,
        gateway: &dyn ExchangeGateway,
        instrument: &Instrument,
        timeout: Duration,
    ) -> Result<Option<BookSnapshot>> {
        let raw = request_book(gateway, instrument, timeout).await?;
        self.accept(instrument, raw)
    }

    /// Fetch several instruments concurrently; one result per instrument, in order.
    pub async fn fetch_all(
        &mut self,
        gateway: &dyn ExchangeGateway,
        instruments: &[Instrument],
        timeout: Duration,
    ) -> Vec<(Instrument, Result<Option<BookSnapshot>>)> {
        let requests = instruments.iter().map(|i| request_book(gateway, i, timeout));
        let raws = join_all(requests).await;

        instruments
            .iter()
            .zip(raws)
            .map(|(instrument, raw)| {
                let result = raw.and_then(|raw| self.accept(instrument, raw));
                if let Ok(Some(book)) = &result {
                    debug!(
                        "📖 {} seq={} bid={:?} ask={:?}",
                        instrument,
                        book.sequence(),
                        book.best_bid().map(|l| l.price),
                        book.best_ask().map(|l| l.price)
                    );
                }
                (instrument.clone(), result)
            })
            .collect()
    }
}

async fn request_book(
    gateway: &dyn ExchangeGateway,
    instrument: &Instrument,
    timeout: Duration,
) -> Result<Option<RawBook>> {
    tokio::time::timeout(timeout, gateway.get_book(instrument))
        .await
        .map_err(|_| Error::timeout(format!("get_book({})", instrument)))?
}
