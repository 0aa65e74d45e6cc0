//! Book State Store
//!
//! Per-symbol L2 book built from incremental level events. Bids and asks
//! live in `BTreeMap`s keyed by fixed-point price so iteration is sorted
//! and deterministic: bids are walked in reverse (best = highest), asks
//! forward (best = lowest).
//!
//! The store enforces strict per-symbol sequencing. A gap moves it into
//! `Resyncing`: later events are parked in a bounded buffer until either
//! the missing events arrive or the feed collaborator supplies a
//! snapshot. Nothing here panics on bad input; every problem becomes a
//! [`BookError`] scoped to this symbol.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use services_common::{Px, Qty, Symbol, Ts};
use tracing::{debug, info, warn};

use crate::error::BookError;
use crate::events::{Action, BookSnapshot, LevelSnapshot, MicrostructureAlert, OrderBookEvent, Side};

/// Aggregate resting size at one price on one side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price of this level
    pub price: Px,
    /// Total size resting at this price
    pub total_size: Qty,
    /// Number of adds that contributed to the level
    pub order_count: u32,
    /// When the level was created
    pub first_seen_at: Ts,
    /// When the level last changed
    pub last_touched_at: Ts,
}

impl PriceLevel {
    fn new(price: Px, size: Qty, ts: Ts) -> Self {
        Self {
            price,
            total_size: size,
            order_count: 1,
            first_seen_at: ts,
            last_touched_at: ts,
        }
    }

    fn from_snapshot(level: &LevelSnapshot, fallback: Ts) -> Self {
        let first_seen_at = if level.first_seen_at == Ts::default() { fallback } else { level.first_seen_at };
        let last_touched_at = if level.last_touched_at == Ts::default() { fallback } else { level.last_touched_at };
        Self {
            price: level.price,
            total_size: level.size,
            order_count: level.order_count,
            first_seen_at,
            last_touched_at,
        }
    }

    fn to_snapshot(&self) -> LevelSnapshot {
        LevelSnapshot {
            price: self.price,
            size: self.total_size,
            order_count: self.order_count,
            first_seen_at: self.first_seen_at,
            last_touched_at: self.last_touched_at,
        }
    }
}

/// What an applied event did to its level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    /// A new level appeared
    LevelAdded,
    /// An existing level changed size
    LevelUpdated,
    /// A level disappeared
    LevelRemoved,
    /// Nothing changed (e.g. duplicate delete)
    NoOp,
}

/// Change produced by one successfully applied event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDelta {
    /// Symbol
    pub symbol: Symbol,
    /// Side that changed
    pub side: Side,
    /// Level that changed
    pub price: Px,
    /// Action of the causing event
    pub action: Action,
    /// Size before the event
    pub previous_size: Qty,
    /// Size after the event (zero if removed)
    pub new_size: Qty,
    /// Classification of the change
    pub kind: DeltaKind,
    /// Sequence of the causing event
    pub sequence: u64,
    /// Exchange time of the causing event
    pub exchange_time: Ts,
    /// Whether the book is crossed after the event
    pub crossed: bool,
    /// Alert raised by this event, if any
    pub alert: Option<MicrostructureAlert>,
}

impl BookDelta {
    /// Whether the book actually changed
    #[must_use]
    pub fn is_state_change(&self) -> bool {
        self.kind != DeltaKind::NoOp
    }

    /// Signed size change at the level
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn size_change(&self) -> i64 {
        self.new_size.as_u64() as i64 - self.previous_size.as_u64() as i64
    }
}

/// Current depth of one symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookState {
    symbol: Symbol,
    bids: BTreeMap<Px, PriceLevel>,
    asks: BTreeMap<Px, PriceLevel>,
    last_sequence: u64,
    last_update_time: Ts,
    crossed: bool,
}

impl BookState {
    /// Empty book
    #[must_use]
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_sequence: 0,
            last_update_time: Ts::default(),
            crossed: false,
        }
    }

    /// Rebuild a book from a snapshot image
    #[must_use]
    pub fn from_snapshot(snapshot: &BookSnapshot) -> Self {
        let ts = snapshot.timestamp;
        let bids = snapshot
            .bids
            .iter()
            .filter(|l| !l.size.is_zero())
            .map(|l| (l.price, PriceLevel::from_snapshot(l, ts)))
            .collect();
        let asks = snapshot
            .asks
            .iter()
            .filter(|l| !l.size.is_zero())
            .map(|l| (l.price, PriceLevel::from_snapshot(l, ts)))
            .collect();
        let mut state = Self {
            symbol: snapshot.symbol,
            bids,
            asks,
            last_sequence: snapshot.sequence,
            last_update_time: ts,
            crossed: false,
        };
        state.crossed = state.compute_crossed();
        state
    }

    /// Serializable image of the book
    #[must_use]
    pub fn to_snapshot(&self) -> BookSnapshot {
        BookSnapshot {
            symbol: self.symbol,
            sequence: self.last_sequence,
            timestamp: self.last_update_time,
            bids: self.bids().map(PriceLevel::to_snapshot).collect(),
            asks: self.asks().map(PriceLevel::to_snapshot).collect(),
        }
    }

    /// Symbol
    #[must_use]
    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    /// Last applied sequence number
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Exchange time of the last applied event
    #[must_use]
    pub fn last_update_time(&self) -> Ts {
        self.last_update_time
    }

    /// Whether best bid >= best ask
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        self.crossed
    }

    /// Bid levels, best first
    pub fn bids(&self) -> impl Iterator<Item = &PriceLevel> + '_ {
        self.bids.values().rev()
    }

    /// Ask levels, best first
    pub fn asks(&self) -> impl Iterator<Item = &PriceLevel> + '_ {
        self.asks.values()
    }

    /// Level at an exact price
    #[must_use]
    pub fn level(&self, side: Side, price: Px) -> Option<&PriceLevel> {
        match side {
            Side::Bid => self.bids.get(&price),
            Side::Ask => self.asks.get(&price),
        }
    }

    /// Best bid level
    #[must_use]
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.values().next_back()
    }

    /// Best ask level
    #[must_use]
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.values().next()
    }

    /// Best ask minus best bid in ticks; negative or zero when crossed
    #[must_use]
    pub fn spread_ticks(&self) -> Option<i64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price.ticks_from(bid.price)),
            _ => None,
        }
    }

    /// Mid price in ticks (fractional)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mid_ticks(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price.as_i64() as f64 + ask.price.as_i64() as f64) / 2.0),
            _ => None,
        }
    }

    /// Number of bid levels
    #[must_use]
    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    /// Number of ask levels
    #[must_use]
    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    /// Total size and level count over the best `depth` levels of a side
    #[must_use]
    pub fn side_liquidity(&self, side: Side, depth: usize) -> (u64, usize) {
        let fold = |(total, count): (u64, usize), level: &PriceLevel| {
            (total.saturating_add(level.total_size.as_u64()), count + 1)
        };
        match side {
            Side::Bid => self.bids().take(depth).fold((0, 0), fold),
            Side::Ask => self.asks().take(depth).fold((0, 0), fold),
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Px, PriceLevel> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn compute_crossed(&self) -> bool {
        matches!((self.best_bid(), self.best_ask()), (Some(bid), Some(ask)) if bid.price >= ask.price)
    }
}

/// Sequencing status of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// In sequence, applying events as they arrive
    Live,
    /// Gap outstanding; events are buffered while the hole can still be
    /// filled by late arrivals or a snapshot
    Resyncing,
    /// Buffer overflowed; only a snapshot can recover the book
    AwaitingSnapshot,
}

/// Outcome of restoring a store from a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Sequence of the applied snapshot
    pub sequence: u64,
    /// Buffered events discarded because the snapshot covers them
    pub discarded: usize,
    /// Buffered events still waiting to be replayed
    pub pending: usize,
}

/// Sequenced, self-resynchronizing book for one symbol
#[derive(Debug, Clone)]
pub struct BookStore {
    state: BookState,
    status: SyncStatus,
    initialized: bool,
    buffer: BTreeMap<u64, OrderBookEvent>,
    buffer_capacity: usize,
}

impl BookStore {
    /// Empty store; `buffer_capacity` bounds the resync buffer
    #[must_use]
    pub fn new(symbol: Symbol, buffer_capacity: usize) -> Self {
        Self {
            state: BookState::new(symbol),
            status: SyncStatus::Live,
            initialized: false,
            buffer: BTreeMap::new(),
            buffer_capacity: buffer_capacity.max(1),
        }
    }

    /// Store seeded from a snapshot
    #[must_use]
    pub fn from_snapshot(snapshot: &BookSnapshot, buffer_capacity: usize) -> Self {
        Self {
            state: BookState::from_snapshot(snapshot),
            status: SyncStatus::Live,
            initialized: true,
            buffer: BTreeMap::new(),
            buffer_capacity: buffer_capacity.max(1),
        }
    }

    /// Current book
    #[must_use]
    pub fn state(&self) -> &BookState {
        &self.state
    }

    /// Sequencing status
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Whether a gap is outstanding
    #[must_use]
    pub fn is_resyncing(&self) -> bool {
        self.status != SyncStatus::Live
    }

    /// Number of events parked in the resync buffer
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Lowest buffered sequence, if any
    #[must_use]
    pub fn first_buffered_sequence(&self) -> Option<u64> {
        self.buffer.keys().next().copied()
    }

    /// Next sequence the store will apply
    #[must_use]
    pub fn expected_sequence(&self) -> u64 {
        self.state.last_sequence.saturating_add(1)
    }

    /// Serializable image of the current book
    #[must_use]
    pub fn snapshot(&self) -> BookSnapshot {
        self.state.to_snapshot()
    }

    /// Apply one event.
    ///
    /// # Errors
    /// - `SequenceGap` when the event is ahead of the expected sequence;
    ///   the event is buffered and the store enters `Resyncing`
    /// - `SequenceGapUnrecoverable` when buffering overflowed
    /// - `StaleSequence` for duplicates; nothing changes
    /// - `InvariantViolation` when the event contradicts the book; the
    ///   event is dropped but its sequence is consumed
    pub fn apply(&mut self, event: OrderBookEvent) -> Result<BookDelta, BookError> {
        let symbol = self.state.symbol;
        if event.symbol() != symbol {
            return Err(BookError::SymbolMismatch { expected: symbol, received: event.symbol() });
        }

        let sequence = event.sequence();
        if !self.initialized {
            return self.apply_in_order(&event);
        }

        let last = self.state.last_sequence;
        if sequence <= last {
            debug!(symbol = %symbol, sequence, last, "Dropping stale event");
            return Err(BookError::StaleSequence { symbol, last, received: sequence });
        }

        let expected = last + 1;
        match self.status {
            SyncStatus::Live if sequence == expected => self.apply_in_order(&event),
            SyncStatus::Live => {
                warn!(symbol = %symbol, expected, received = sequence, "Sequence gap detected, resyncing");
                self.status = SyncStatus::Resyncing;
                self.park(event)?;
                Err(BookError::SequenceGap { symbol, expected, received: sequence })
            }
            SyncStatus::Resyncing if sequence == expected => {
                let delta = self.apply_in_order(&event);
                self.settle();
                delta
            }
            SyncStatus::Resyncing | SyncStatus::AwaitingSnapshot => {
                self.park(event)?;
                Err(BookError::SequenceGap { symbol, expected, received: sequence })
            }
        }
    }

    /// Next buffered event that can now be applied in sequence.
    ///
    /// Callers drain this after every successful `apply` or `restore` to
    /// replay events that were parked behind a gap.
    pub fn pop_ready(&mut self) -> Option<OrderBookEvent> {
        if self.status == SyncStatus::AwaitingSnapshot {
            return None;
        }
        let last = self.state.last_sequence;
        while let Some(entry) = self.buffer.first_entry() {
            let sequence = *entry.key();
            if sequence <= last {
                entry.remove();
                continue;
            }
            if sequence == last + 1 {
                return Some(entry.remove());
            }
            break;
        }
        self.settle();
        None
    }

    /// Replace the book with a snapshot from the feed collaborator.
    ///
    /// # Errors
    /// - `SymbolMismatch` if the snapshot belongs to another symbol
    /// - `StaleSequence` if the snapshot is older than the applied book
    pub fn restore(&mut self, snapshot: &BookSnapshot) -> Result<RestoreOutcome, BookError> {
        if snapshot.symbol != self.state.symbol {
            return Err(BookError::SymbolMismatch { expected: self.state.symbol, received: snapshot.symbol });
        }
        if self.initialized && snapshot.sequence < self.state.last_sequence {
            debug!(symbol = %snapshot.symbol, sequence = snapshot.sequence, last = self.state.last_sequence, "Ignoring stale snapshot");
            return Err(BookError::StaleSequence {
                symbol: snapshot.symbol,
                last: self.state.last_sequence,
                received: snapshot.sequence,
            });
        }

        self.state = BookState::from_snapshot(snapshot);
        self.initialized = true;

        let pending = self.buffer.split_off(&snapshot.sequence.saturating_add(1));
        let discarded = self.buffer.len();
        self.buffer = pending;

        self.status = if self.buffer.is_empty() { SyncStatus::Live } else { SyncStatus::Resyncing };

        info!(
            symbol = %snapshot.symbol,
            sequence = snapshot.sequence,
            discarded,
            pending = self.buffer.len(),
            "Book restored from snapshot"
        );

        Ok(RestoreOutcome { sequence: snapshot.sequence, discarded, pending: self.buffer.len() })
    }

    fn settle(&mut self) {
        if self.status == SyncStatus::Resyncing && self.buffer.is_empty() {
            info!(symbol = %self.state.symbol, sequence = self.state.last_sequence, "Book back in sequence");
            self.status = SyncStatus::Live;
        }
    }

    fn park(&mut self, event: OrderBookEvent) -> Result<(), BookError> {
        let sequence = event.sequence();
        if self.buffer.contains_key(&sequence) {
            return Ok(());
        }
        self.buffer.insert(sequence, event);
        if self.buffer.len() <= self.buffer_capacity {
            return Ok(());
        }

        let discarded = self.buffer.pop_first().map_or(sequence, |(seq, _)| seq);
        self.status = SyncStatus::AwaitingSnapshot;
        warn!(
            symbol = %self.state.symbol,
            discarded,
            capacity = self.buffer_capacity,
            "Resync buffer overflow, waiting for snapshot"
        );
        Err(BookError::SequenceGapUnrecoverable {
            symbol: self.state.symbol,
            discarded,
            capacity: self.buffer_capacity,
        })
    }

    fn apply_in_order(&mut self, event: &OrderBookEvent) -> Result<BookDelta, BookError> {
        let symbol = self.state.symbol;
        let sequence = event.sequence();
        let ts = event.exchange_time();
        let side = event.side();
        let price = event.price();
        let size = event.size();

        // The sequence is consumed even when the event is rejected below.
        self.initialized = true;
        self.state.last_sequence = sequence;
        self.state.last_update_time = ts;

        let violation = |reason: &str| {
            warn!(symbol = %symbol, sequence, %price, ?side, reason, "Invariant violation, event dropped");
            BookError::InvariantViolation { symbol, sequence, reason: reason.to_string() }
        };

        let levels = self.state.side_mut(side);
        let (previous_size, new_size, kind) = match event.action() {
            Action::Add => {
                if size.is_zero() {
                    return Err(violation("zero-size add"));
                }
                match levels.entry(price) {
                    Entry::Occupied(mut entry) => {
                        let level = entry.get_mut();
                        let previous = level.total_size;
                        level.total_size = previous.saturating_add(size);
                        level.order_count = level.order_count.saturating_add(1);
                        level.last_touched_at = ts;
                        (previous, level.total_size, DeltaKind::LevelUpdated)
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(PriceLevel::new(price, size, ts));
                        (Qty::ZERO, size, DeltaKind::LevelAdded)
                    }
                }
            }
            Action::Modify if size.is_zero() => match levels.remove(&price) {
                Some(level) => (level.total_size, Qty::ZERO, DeltaKind::LevelRemoved),
                None => return Err(violation("modify on missing level")),
            },
            Action::Modify => match levels.get_mut(&price) {
                Some(level) => {
                    let previous = level.total_size;
                    level.total_size = size;
                    level.last_touched_at = ts;
                    (previous, size, DeltaKind::LevelUpdated)
                }
                None => return Err(violation("modify on missing level")),
            },
            Action::Delete => match levels.remove(&price) {
                Some(level) => (level.total_size, Qty::ZERO, DeltaKind::LevelRemoved),
                None => (Qty::ZERO, Qty::ZERO, DeltaKind::NoOp),
            },
        };

        let alert = self.refresh_crossed(sequence, kind != DeltaKind::NoOp);

        Ok(BookDelta {
            symbol,
            side,
            price,
            action: event.action(),
            previous_size,
            new_size,
            kind,
            sequence,
            exchange_time: ts,
            crossed: self.state.crossed,
            alert,
        })
    }

    /// Every state change that leaves the book crossed carries an alert
    fn refresh_crossed(&mut self, sequence: u64, changed: bool) -> Option<MicrostructureAlert> {
        let was_crossed = self.state.crossed;
        self.state.crossed = self.state.compute_crossed();

        if self.state.crossed && changed {
            let best_bid = self.state.best_bid().map_or(Px::ZERO, |l| l.price);
            let best_ask = self.state.best_ask().map_or(Px::ZERO, |l| l.price);
            warn!(symbol = %self.state.symbol, %best_bid, %best_ask, sequence, "Crossed book");
            return Some(MicrostructureAlert::CrossedBook { best_bid, best_ask, sequence });
        }
        if was_crossed && !self.state.crossed {
            debug!(symbol = %self.state.symbol, sequence, "Book uncrossed");
        }
        None
    }
}
