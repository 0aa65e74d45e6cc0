//! Event types flowing through the engine
//!
//! `OrderBookEvent` is the contract with the feed normalizer: one
//! incremental change to one price level of one symbol, stamped with a
//! per-symbol sequence number. Events are immutable once built.
//!
//! `BookSnapshot` and `SnapshotRequest` form the resynchronization
//! contract with the same collaborator, and `MicrostructureAlert` is
//! what the engine raises when the book does something unusual.

use serde::{Deserialize, Serialize};
use services_common::{Px, Qty, Symbol, Ts};

/// Side of the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Side {
    /// Resting buy interest
    Bid = 0,
    /// Resting sell interest
    Ask = 1,
}

impl Side {
    /// Check if this is the bid side
    #[inline]
    #[must_use]
    pub fn is_bid(&self) -> bool {
        matches!(self, Side::Bid)
    }

    /// Get the opposite side
    #[inline]
    #[must_use]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

/// Kind of level update carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    /// Add size at a level, creating it if absent
    Add = 0,
    /// Replace the size at an existing level
    Modify = 1,
    /// Remove a level
    Delete = 2,
}

/// Canonical incremental order book event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookEvent {
    symbol: Symbol,
    side: Side,
    price: Px,
    size: Qty,
    action: Action,
    sequence: u64,
    exchange_time: Ts,
    ingest_time: Ts,
}

impl OrderBookEvent {
    /// Build an event. The ingest timestamp defaults to the exchange
    /// timestamp; use [`OrderBookEvent::with_ingest_time`] to stamp it.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        symbol: Symbol,
        side: Side,
        price: Px,
        size: Qty,
        action: Action,
        sequence: u64,
        exchange_time: Ts,
    ) -> Self {
        Self {
            symbol,
            side,
            price,
            size,
            action,
            sequence,
            exchange_time,
            ingest_time: exchange_time,
        }
    }

    /// Add event shorthand
    #[must_use]
    pub fn add(symbol: Symbol, side: Side, price: Px, size: u64, sequence: u64, ts: Ts) -> Self {
        Self::new(symbol, side, price, Qty::from_u64(size), Action::Add, sequence, ts)
    }

    /// Modify event shorthand
    #[must_use]
    pub fn modify(symbol: Symbol, side: Side, price: Px, size: u64, sequence: u64, ts: Ts) -> Self {
        Self::new(symbol, side, price, Qty::from_u64(size), Action::Modify, sequence, ts)
    }

    /// Delete event shorthand
    #[must_use]
    pub fn delete(symbol: Symbol, side: Side, price: Px, sequence: u64, ts: Ts) -> Self {
        Self::new(symbol, side, price, Qty::ZERO, Action::Delete, sequence, ts)
    }

    /// Same event with a local receipt timestamp
    #[must_use]
    pub fn with_ingest_time(mut self, ingest_time: Ts) -> Self {
        self.ingest_time = ingest_time;
        self
    }

    /// Symbol
    #[inline]
    #[must_use]
    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    /// Side
    #[inline]
    #[must_use]
    pub fn side(&self) -> Side {
        self.side
    }

    /// Price level
    #[inline]
    #[must_use]
    pub fn price(&self) -> Px {
        self.price
    }

    /// Size (meaning depends on the action)
    #[inline]
    #[must_use]
    pub fn size(&self) -> Qty {
        self.size
    }

    /// Action
    #[inline]
    #[must_use]
    pub fn action(&self) -> Action {
        self.action
    }

    /// Per-symbol sequence number
    #[inline]
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Exchange timestamp
    #[inline]
    #[must_use]
    pub fn exchange_time(&self) -> Ts {
        self.exchange_time
    }

    /// Local receipt timestamp
    #[inline]
    #[must_use]
    pub fn ingest_time(&self) -> Ts {
        self.ingest_time
    }

    /// Feed latency between exchange and local receipt
    #[must_use]
    pub fn feed_latency_ns(&self) -> u64 {
        self.ingest_time.nanos_since(self.exchange_time)
    }
}

/// One level in a [`BookSnapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSnapshot {
    /// Price of the level
    pub price: Px,
    /// Total resting size
    pub size: Qty,
    /// Number of orders contributing to the level
    pub order_count: u32,
    /// When the level first appeared (zero if unknown)
    #[serde(default)]
    pub first_seen_at: Ts,
    /// When the level last changed (zero if unknown)
    #[serde(default)]
    pub last_touched_at: Ts,
}

impl LevelSnapshot {
    /// Level without timing information, as most feeds publish them
    #[must_use]
    pub fn new(price: Px, size: Qty, order_count: u32) -> Self {
        Self { price, size, order_count, first_seen_at: Ts::default(), last_touched_at: Ts::default() }
    }
}

/// Full image of one symbol's book at a sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Symbol
    pub symbol: Symbol,
    /// Last sequence number reflected in the image
    pub sequence: u64,
    /// Exchange time of the image
    pub timestamp: Ts,
    /// Bids, best first
    pub bids: Vec<LevelSnapshot>,
    /// Asks, best first
    pub asks: Vec<LevelSnapshot>,
}

impl BookSnapshot {
    /// Encode with bincode for compact transport or storage
    ///
    /// # Errors
    /// Returns an error if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode a bincode-encoded snapshot
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid snapshot
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Request sent to the feed collaborator when a symbol needs a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// Symbol to resynchronize
    pub symbol: Symbol,
    /// First missing sequence
    pub from_sequence: u64,
    /// Last missing sequence (inclusive)
    pub to_sequence: u64,
    /// When the gap was detected
    pub detected_at: Ts,
}

impl SnapshotRequest {
    /// Number of missing events
    #[must_use]
    pub fn gap_size(&self) -> u64 {
        self.to_sequence.saturating_sub(self.from_sequence) + 1
    }
}

/// Notable book conditions surfaced to downstream consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "alert")]
pub enum MicrostructureAlert {
    /// Best bid reached or passed best ask
    CrossedBook {
        /// Best bid at detection
        best_bid: Px,
        /// Best ask at detection
        best_ask: Px,
        /// Sequence of the event that crossed the book
        sequence: u64,
    },
    /// Sequence gap detected; the symbol is resynchronizing
    SequenceGap {
        /// Sequence the book expected
        expected: u64,
        /// Sequence that arrived
        received: u64,
    },
    /// The book caught up after a gap
    Resynchronized {
        /// Sequence the book is now at
        sequence: u64,
    },
    /// Analytics for the symbol are being shed under load
    SymbolShed,
}

impl MicrostructureAlert {
    /// Short label for logs and counters
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            MicrostructureAlert::CrossedBook { .. } => "crossed_book",
            MicrostructureAlert::SequenceGap { .. } => "sequence_gap",
            MicrostructureAlert::Resynchronized { .. } => "resynchronized",
            MicrostructureAlert::SymbolShed => "symbol_shed",
        }
    }
}
