//! Output Publisher
//!
//! Fan-out of per-update results to downstream consumers. Each consumer
//! owns a bounded lock-free queue; publishing never blocks. When a
//! consumer falls behind, its oldest pending publication is displaced and
//! counted, so a slow reader only ever loses its own history.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use services_common::{Symbol, Ts};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::classifier::ClassificationResult;
use crate::events::MicrostructureAlert;
use crate::governor::GovernorState;
use crate::liquidity::LiquidityMetrics;

/// Alerts attached to one publication
pub type Alerts = SmallVec<[MicrostructureAlert; 2]>;

/// One symbol's results for one applied update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    /// Symbol
    pub symbol: Symbol,
    /// Book sequence
    pub sequence: u64,
    /// Exchange time of the update
    pub timestamp: Ts,
    /// Liquidity metrics (absent when analytics were shed)
    pub metrics: Option<LiquidityMetrics>,
    /// Classification (absent when analytics were shed)
    pub classification: Option<ClassificationResult>,
    /// Alerts raised by this update
    pub alerts: Alerts,
    /// Governor state of the owning worker
    pub governor_state: GovernorState,
}

impl Publication {
    /// Encode as a JSON line
    ///
    /// # Errors
    /// Returns an error if serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug)]
struct ConsumerQueue {
    name: String,
    queue: ArrayQueue<Publication>,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

/// Read side of one consumer's queue
#[derive(Debug, Clone)]
pub struct Subscription {
    inner: Arc<ConsumerQueue>,
}

impl Subscription {
    /// Consumer name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Next pending publication, oldest first
    #[must_use]
    pub fn try_recv(&self) -> Option<Publication> {
        self.inner.queue.pop()
    }

    /// Drain everything currently pending
    #[must_use]
    pub fn drain(&self) -> Vec<Publication> {
        std::iter::from_fn(|| self.inner.queue.pop()).collect()
    }

    /// Pending publications
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Queue capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    /// Publications displaced because this consumer fell behind
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Acquire)
    }

    /// Publications ever enqueued for this consumer
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Acquire)
    }
}

/// Consumer-side statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStats {
    /// Consumer name
    pub name: String,
    /// Pending publications
    pub pending: usize,
    /// Publications enqueued
    pub delivered: u64,
    /// Publications displaced
    pub dropped: u64,
}

/// Builder collecting consumers before the engine starts
#[derive(Debug, Default)]
pub struct PublisherBuilder {
    consumers: Vec<Arc<ConsumerQueue>>,
}

impl PublisherBuilder {
    /// Empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer with its own bounded queue
    pub fn subscribe(&mut self, name: impl Into<String>, capacity: usize) -> Subscription {
        let inner = Arc::new(ConsumerQueue {
            name: name.into(),
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        });
        info!(consumer = %inner.name, capacity = inner.queue.capacity(), "Consumer subscribed");
        self.consumers.push(Arc::clone(&inner));
        Subscription { inner }
    }

    /// Freeze the consumer list
    #[must_use]
    pub fn build(self) -> Publisher {
        Publisher { consumers: Arc::from(self.consumers) }
    }
}

/// Non-blocking, drop-oldest fan-out; cheap to clone into workers
#[derive(Debug, Clone)]
pub struct Publisher {
    consumers: Arc<[Arc<ConsumerQueue>]>,
}

impl Publisher {
    /// Start registering consumers
    #[must_use]
    pub fn builder() -> PublisherBuilder {
        PublisherBuilder::new()
    }

    /// Publisher with no consumers
    #[must_use]
    pub fn empty() -> Self {
        PublisherBuilder::new().build()
    }

    /// Number of consumers
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Deliver to every consumer; returns how many older publications were displaced
    pub fn publish(&self, publication: &Publication) -> usize {
        let mut displaced = 0;
        for consumer in self.consumers.iter() {
            consumer.delivered.fetch_add(1, Ordering::Relaxed);
            if consumer.queue.force_push(publication.clone()).is_some() {
                consumer.dropped.fetch_add(1, Ordering::Relaxed);
                displaced += 1;
                debug!(consumer = %consumer.name, symbol = %publication.symbol, "Consumer lagging, oldest publication dropped");
            }
        }
        displaced
    }

    /// Per-consumer statistics
    #[must_use]
    pub fn consumer_stats(&self) -> Vec<ConsumerStats> {
        self.consumers
            .iter()
            .map(|c| ConsumerStats {
                name: c.name.clone(),
                pending: c.queue.len(),
                delivered: c.delivered.load(Ordering::Acquire),
                dropped: c.dropped.load(Ordering::Acquire),
            })
            .collect()
    }
}
