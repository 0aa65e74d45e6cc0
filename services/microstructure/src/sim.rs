//! Synthetic feed
//!
//! Deterministic generator of valid level-by-level event streams for one
//! symbol. It keeps an independent reference book, can withhold events
//! to create sequence gaps, and answers snapshot requests from that
//! reference, standing in for the feed collaborator in the CLI
//! simulation and in tests.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use services_common::{Px, Qty, Symbol, Ts};
use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::events::{Action, BookSnapshot, LevelSnapshot, OrderBookEvent, Side, SnapshotRequest};

/// Synthetic feed parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Symbol to generate
    pub symbol: Symbol,
    /// RNG seed; same seed, same stream
    pub seed: u64,
    /// Mid price in ticks
    pub mid_ticks: i64,
    /// Ticks between adjacent levels
    pub level_step: i64,
    /// Levels per side
    pub levels: usize,
    /// Largest random level size
    pub max_size: u64,
    /// Exchange-time spacing between events
    pub interval_ns: u64,
    /// Probability that an event is withheld, opening a gap
    pub gap_probability: f64,
    /// Iceberg behind the best bid, if any
    pub iceberg: Option<IcebergConfig>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbol: Symbol::new(1),
            seed: 42,
            mid_ticks: 1_000_000,
            level_step: 100,
            levels: 10,
            max_size: 1_000,
            // 100,000 events per second of exchange time
            interval_ns: 10_000,
            gap_probability: 0.0,
            iceberg: None,
        }
    }
}

/// Replenishing order pinned one step below mid on the bid side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcebergConfig {
    /// Displayed size after each refill
    pub display_size: u64,
    /// Probability per event that the displayed size gets consumed
    pub hit_probability: f64,
}

/// Independent book used to check the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceBook {
    bids: BTreeMap<i64, (u64, u32)>,
    asks: BTreeMap<i64, (u64, u32)>,
    sequence: u64,
    timestamp: Ts,
}

impl ReferenceBook {
    /// Empty book
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one in-sequence event; contradicting events only consume the sequence
    pub fn apply(&mut self, event: &OrderBookEvent) {
        self.sequence = event.sequence();
        self.timestamp = event.exchange_time();
        let side = match event.side() {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        let price = event.price().as_i64();
        let size = event.size().as_u64();
        match event.action() {
            Action::Add if size > 0 => {
                let level = side.entry(price).or_insert((0, 0));
                level.0 = level.0.saturating_add(size);
                level.1 = level.1.saturating_add(1);
            }
            Action::Add => {}
            Action::Modify if size == 0 => {
                side.remove(&price);
            }
            Action::Modify => {
                if let Some(level) = side.get_mut(&price) {
                    level.0 = size;
                }
            }
            Action::Delete => {
                side.remove(&price);
            }
        }
    }

    /// Last applied sequence
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Size resting at a level
    #[must_use]
    pub fn size_at(&self, side: Side, price: Px) -> Option<u64> {
        let levels = match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        };
        levels.get(&price.as_i64()).map(|(size, _)| *size)
    }

    /// `(price, size, order_count)` per level, best first
    #[must_use]
    pub fn levels(&self, side: Side) -> Vec<(Px, u64, u32)> {
        let level = |(price, (size, count)): (&i64, &(u64, u32))| (Px::from_i64(*price), *size, *count);
        match side {
            Side::Bid => self.bids.iter().rev().map(level).collect(),
            Side::Ask => self.asks.iter().map(level).collect(),
        }
    }

    /// Snapshot image for `symbol`
    #[must_use]
    pub fn snapshot(&self, symbol: Symbol) -> BookSnapshot {
        let image = |levels: Vec<(Px, u64, u32)>| {
            levels
                .into_iter()
                .map(|(price, size, count)| {
                    let mut level = LevelSnapshot::new(price, Qty::from_u64(size), count);
                    level.first_seen_at = self.timestamp;
                    level.last_touched_at = self.timestamp;
                    level
                })
                .collect()
        };
        BookSnapshot {
            symbol,
            sequence: self.sequence,
            timestamp: self.timestamp,
            bids: image(self.levels(Side::Bid)),
            asks: image(self.levels(Side::Ask)),
        }
    }
}

/// Seeded event generator for one symbol
#[derive(Debug, Clone)]
pub struct SyntheticFeed {
    config: FeedConfig,
    rng: StdRng,
    reference: ReferenceBook,
    sequence: u64,
    now: Ts,
    iceberg_depleted: bool,
    withheld: u64,
}

impl SyntheticFeed {
    /// Feed starting from an empty book at `start`
    #[must_use]
    pub fn new(config: FeedConfig, start: Ts) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            reference: ReferenceBook::new(),
            sequence: 0,
            now: start,
            iceberg_depleted: false,
            withheld: 0,
        }
    }

    /// Symbol
    #[must_use]
    pub fn symbol(&self) -> Symbol {
        self.config.symbol
    }

    /// Reference book after every generated event, withheld ones included
    #[must_use]
    pub fn reference(&self) -> &ReferenceBook {
        &self.reference
    }

    /// Events withheld so far
    #[must_use]
    pub fn withheld(&self) -> u64 {
        self.withheld
    }

    /// Answer a snapshot request with the current reference book
    #[must_use]
    pub fn snapshot(&self) -> BookSnapshot {
        self.reference.snapshot(self.config.symbol)
    }

    /// Price of the iceberg level
    #[must_use]
    pub fn iceberg_price(&self) -> Px {
        Px::from_i64(self.config.mid_ticks - self.config.level_step)
    }

    /// Generate the next event, delivered or not
    pub fn generate(&mut self) -> OrderBookEvent {
        self.sequence += 1;
        self.now = self.now.plus_nanos(self.config.interval_ns);

        let event = match self.config.iceberg.clone() {
            Some(iceberg) => self.iceberg_event(&iceberg).unwrap_or_else(|| self.random_event(2)),
            None => self.random_event(1),
        };
        self.reference.apply(&event);
        event
    }

    fn iceberg_event(&mut self, iceberg: &IcebergConfig) -> Option<OrderBookEvent> {
        let price = self.iceberg_price();
        let symbol = self.config.symbol;
        let display = iceberg.display_size.max(1);

        if self.reference.size_at(Side::Bid, price).is_none() {
            return Some(OrderBookEvent::add(symbol, Side::Bid, price, display, self.sequence, self.now));
        }
        if self.iceberg_depleted {
            self.iceberg_depleted = false;
            return Some(OrderBookEvent::modify(symbol, Side::Bid, price, display, self.sequence, self.now));
        }
        if self.rng.gen_bool(iceberg.hit_probability.clamp(0.0, 1.0)) {
            self.iceberg_depleted = true;
            let remaining = (display / 10).max(1);
            return Some(OrderBookEvent::modify(symbol, Side::Bid, price, remaining, self.sequence, self.now));
        }
        None
    }

    fn random_event(&mut self, first_level: usize) -> OrderBookEvent {
        let cfg = &self.config;
        let levels = cfg.levels.max(first_level);
        let offset = self.rng.gen_range(first_level..=levels) as i64;
        let side = if self.rng.gen_bool(0.5) { Side::Bid } else { Side::Ask };
        let price = match side {
            Side::Bid => Px::from_i64(cfg.mid_ticks - offset * cfg.level_step),
            Side::Ask => Px::from_i64(cfg.mid_ticks + offset * cfg.level_step),
        };
        let size = self.rng.gen_range(1..=cfg.max_size.max(1));
        let symbol = cfg.symbol;

        if self.reference.size_at(side, price).is_none() {
            return OrderBookEvent::add(symbol, side, price, size, self.sequence, self.now);
        }
        match self.rng.gen_range(0..10) {
            0..=3 => OrderBookEvent::add(symbol, side, price, size, self.sequence, self.now),
            4..=7 => OrderBookEvent::modify(symbol, side, price, size, self.sequence, self.now),
            _ => OrderBookEvent::delete(symbol, side, price, self.sequence, self.now),
        }
    }

    /// Next event to deliver; withheld events are skipped, leaving a gap
    pub fn next_event(&mut self) -> OrderBookEvent {
        loop {
            let event = self.generate();
            let gap = self.config.gap_probability.clamp(0.0, 1.0);
            // Never withhold the very first event: the book initializes from it
            if event.sequence() > 1 && gap > 0.0 && self.rng.gen_bool(gap) {
                self.withheld += 1;
                debug!(symbol = %self.config.symbol, sequence = event.sequence(), "Withholding event");
                continue;
            }
            return event;
        }
    }
}

impl Iterator for SyntheticFeed {
    type Item = OrderBookEvent;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_event())
    }
}

/// Outcome of [`simulate`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    /// Events handed to the engine
    pub events_submitted: u64,
    /// Events withheld to create gaps
    pub events_withheld: u64,
    /// Snapshot requests answered
    pub snapshots_served: u64,
    /// Wall-clock time spent submitting
    pub elapsed: Duration,
}

impl SimulationReport {
    /// Submission rate achieved
    #[must_use]
    pub fn events_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.events_submitted as f64 / secs } else { 0.0 }
    }
}

/// Drive `engine` with `events` events spread round-robin over `feeds`,
/// answering snapshot requests as they arrive.
///
/// `rate` paces submission in events per second; `None` runs flat out.
/// Returns once everything submitted has been processed.
///
/// # Errors
/// Returns `Shutdown` if the engine stops underneath the simulation
pub fn simulate(
    engine: &Engine,
    feeds: &mut [SyntheticFeed],
    snapshot_requests: &Receiver<SnapshotRequest>,
    events: u64,
    rate: Option<u64>,
) -> Result<SimulationReport, EngineError> {
    let mut report = SimulationReport::default();
    if feeds.is_empty() {
        return Ok(report);
    }

    let started = Instant::now();
    let pace = rate.filter(|r| *r > 0).map(|r| Duration::from_secs_f64(1.0 / r as f64));

    for n in 0..events {
        let index = (n % feeds.len() as u64) as usize;
        if let Some(feed) = feeds.get_mut(index) {
            engine.submit(feed.next_event())?;
            report.events_submitted += 1;
        }

        if n % 256 == 0 {
            report.snapshots_served += serve_snapshots(engine, feeds, snapshot_requests)?;
            if let Some(pace) = pace {
                let due = pace.mul_f64(n as f64);
                let elapsed = started.elapsed();
                if due > elapsed {
                    std::thread::sleep(due - elapsed);
                }
            }
        }
    }

    // Let outstanding gaps resolve before reporting
    engine.sync()?;
    report.snapshots_served += serve_snapshots(engine, feeds, snapshot_requests)?;
    engine.sync()?;

    report.elapsed = started.elapsed();
    report.events_withheld = feeds.iter().map(SyntheticFeed::withheld).sum();
    info!(
        events = report.events_submitted,
        withheld = report.events_withheld,
        snapshots = report.snapshots_served,
        rate = report.events_per_second() as u64,
        "Simulation finished"
    );
    Ok(report)
}

fn serve_snapshots(
    engine: &Engine,
    feeds: &[SyntheticFeed],
    requests: &Receiver<SnapshotRequest>,
) -> Result<u64, EngineError> {
    let mut served = 0;
    for request in requests.try_iter() {
        if let Some(feed) = feeds.iter().find(|f| f.symbol() == request.symbol) {
            debug!(symbol = %request.symbol, from = request.from_sequence, to = request.to_sequence, "Serving snapshot");
            engine.submit_snapshot(feed.snapshot())?;
            served += 1;
        }
    }
    Ok(served)
}
