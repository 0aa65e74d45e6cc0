//! End-to-end engine tests
//!
//! Tests cover:
//! - Iceberg-style replenishment lifting the hidden estimate
//! - Gap detection, snapshot requests and recovery (by late events or snapshot)
//! - Crossed books published with an alert
//! - Queue saturation, symbol removal, model swaps and config reloads
//! - Sustained load against the latency target
//! - Resynchronization under random gaps matching an independent book

use std::sync::Arc;
use std::time::Duration;

use microstructure::classifier::ClassificationStatus;
use microstructure::config::{ConfigHandle, EngineConfig, GovernorConfig};
use microstructure::engine::Engine;
use microstructure::error::EngineError;
use microstructure::events::{BookSnapshot, LevelSnapshot, MicrostructureAlert, OrderBookEvent, Side};
use microstructure::model::{LiquidityLevel, ModelMetadata, ModelOutput, PatternLabel, PatternModel};
use microstructure::publisher::{Publication, Subscription};
use microstructure::sim::{FeedConfig, SyntheticFeed, simulate};
use microstructure::stats::Stage;
use ndarray::ArrayView2;
use services_common::{Qty, Symbol};

use crate::utils::{SYM, add, delete, engine_config, modify, px, start_engine, ts};

struct StubModel {
    metadata: ModelMetadata,
    delay: Duration,
}

impl StubModel {
    fn new(version: &str, window_len: usize, delay: Duration) -> Self {
        Self {
            metadata: ModelMetadata {
                name: "stub".to_string(),
                version: version.to_string(),
                window_len,
                max_latency_us: 0,
            },
            delay,
        }
    }
}

impl StubModel {
    fn declaring(mut self, max_latency_us: u64) -> Self {
        self.metadata.max_latency_us = max_latency_us;
        self
    }
}

impl PatternModel for StubModel {
    fn infer(&self, _window: ArrayView2<'_, f64>) -> anyhow::Result<ModelOutput> {
        std::thread::sleep(self.delay);
        Ok(ModelOutput {
            liquidity_level: LiquidityLevel::Low,
            pattern_label: PatternLabel::HiddenLiquidity,
            confidence: 0.7,
            predicted_volatility: 2.0,
        })
    }

    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

fn alerts(publications: &[Publication]) -> Vec<MicrostructureAlert> {
    publications.iter().flat_map(|p| p.alerts.iter().cloned()).collect()
}

/// In-sequence adds on alternating sides, never crossing
fn submit_seeded(engine: &Engine, last: u64) {
    for seq in 1..=last {
        let offset = i64::try_from(seq).unwrap();
        let event = if seq % 2 == 1 {
            add(Side::Bid, 10_000 - offset, 10, seq)
        } else {
            add(Side::Ask, 10_100 + offset, 10, seq)
        };
        engine.submit(event).unwrap();
    }
}

fn drained(engine: &Engine, subscription: &Subscription) -> Vec<Publication> {
    engine.sync().unwrap();
    subscription.drain()
}

#[test]
fn test_replenishing_level_lifts_hidden_estimate() {
    let (engine, subscription, _requests) = start_engine(engine_config());

    engine.submit(add(Side::Bid, 10_000, 50, 1)).unwrap();
    let first = engine.sync().and_then(|()| engine.latest_metrics(SYM)).unwrap().unwrap();
    assert_eq!(first.hidden_liquidity_estimate, 0.0);

    let mut seq = 1;
    for _ in 0..5 {
        for size in [10, 50, 10, 48] {
            seq += 1;
            engine.submit(modify(Side::Bid, 10_000, size, seq)).unwrap();
        }
    }
    let publications = drained(&engine, &subscription);
    let metrics = engine.latest_metrics(SYM).unwrap().unwrap();

    assert_eq!(metrics.sequence, 21);
    assert!(metrics.hidden_liquidity_estimate > first.hidden_liquidity_estimate);
    assert!(!metrics.quality.hidden_skipped);
    assert_eq!(publications.len(), 21);
    assert!(publications.iter().all(|p| p.metrics.is_some() && p.classification.is_some()));
    engine.shutdown().unwrap();
}

#[test]
fn test_gap_requests_snapshot_and_late_events_resync() {
    let (engine, subscription, requests) = start_engine(engine_config());
    submit_seeded(&engine, 10);
    engine.submit(add(Side::Bid, 9_000, 5, 15)).unwrap();
    engine.submit(add(Side::Bid, 9_001, 5, 16)).unwrap();
    let publications = drained(&engine, &subscription);

    // One publication for the gap, none for the buffered events
    assert_eq!(publications.len(), 11);
    let gap = publications.last().unwrap();
    assert_eq!(gap.alerts.as_slice(), &[MicrostructureAlert::SequenceGap { expected: 11, received: 15 }]);
    assert_eq!(gap.sequence, 10);
    let carried = gap.metrics.as_ref().unwrap();
    assert!(carried.quality.stale && carried.quality.resyncing);
    assert!(gap.classification.is_none());

    let request = requests.try_recv().unwrap();
    assert_eq!((request.symbol, request.from_sequence, request.to_sequence), (SYM, 11, 14));
    assert_eq!(request.gap_size(), 4);
    assert!(requests.try_recv().is_err());

    for seq in 11..=14 {
        engine.submit(add(Side::Ask, 11_000, 1, seq)).unwrap();
    }
    let publications = drained(&engine, &subscription);
    assert_eq!(publications.iter().map(|p| p.sequence).collect::<Vec<_>>(), (11..=16).collect::<Vec<_>>());
    assert_eq!(alerts(&publications), vec![MicrostructureAlert::Resynchronized { sequence: 16 }]);
    assert!(publications[..5].iter().all(|p| p.metrics.as_ref().is_some_and(|m| m.quality.resyncing)));
    assert!(!publications[5].metrics.as_ref().unwrap().quality.resyncing);

    let book = engine.book_snapshot(SYM).unwrap().unwrap();
    assert_eq!(book.sequence, 16);
    assert_eq!(book.asks.iter().find(|l| l.price == px(11_000)).map(|l| l.size), Some(Qty::from_u64(4)));

    let stats = engine.stats();
    assert_eq!(stats.sequence_gaps, 2);
    assert_eq!(stats.snapshot_requests, 1);
    assert_eq!(stats.events_applied, 16);
    engine.shutdown().unwrap();
}

#[test]
fn test_snapshot_resolves_gap() {
    let (engine, subscription, requests) = start_engine(engine_config());
    submit_seeded(&engine, 10);
    engine.submit(add(Side::Bid, 9_000, 5, 15)).unwrap();
    let _ = drained(&engine, &subscription);
    assert!(requests.try_recv().is_ok());

    let snapshot = BookSnapshot {
        symbol: SYM,
        sequence: 16,
        timestamp: ts(16),
        bids: vec![LevelSnapshot::new(px(9_950), Qty::from_u64(70), 3)],
        asks: vec![LevelSnapshot::new(px(10_050), Qty::from_u64(30), 1)],
    };
    engine.submit_snapshot(snapshot).unwrap();
    let publications = drained(&engine, &subscription);

    assert_eq!(alerts(&publications), vec![MicrostructureAlert::Resynchronized { sequence: 16 }]);
    let metrics = publications[0].metrics.as_ref().unwrap();
    assert_eq!(metrics.visible_liquidity, 100);
    assert_eq!(metrics.sequence, 16);

    // The book continues from the snapshot
    engine.submit(delete(Side::Ask, 10_050, 17)).unwrap();
    let _ = drained(&engine, &subscription);
    let book = engine.book_snapshot(SYM).unwrap().unwrap();
    assert_eq!(book.sequence, 17);
    assert!(book.asks.is_empty());
    assert_eq!(book.bids[0].order_count, 3);
    assert_eq!(engine.stats().snapshots_applied, 1);
    engine.shutdown().unwrap();
}

#[test]
fn test_partial_snapshot_requests_remaining_hole() {
    let (engine, subscription, requests) = start_engine(engine_config());
    submit_seeded(&engine, 10);
    engine.submit(add(Side::Bid, 9_000, 5, 15)).unwrap();
    let _ = drained(&engine, &subscription);
    let first = requests.try_recv().unwrap();
    assert_eq!((first.from_sequence, first.to_sequence), (11, 14));

    // Covers 11..=12 only; 13 and 14 are still missing
    let partial = BookSnapshot {
        symbol: SYM,
        sequence: 12,
        timestamp: ts(12),
        bids: vec![LevelSnapshot::new(px(9_950), Qty::from_u64(70), 3)],
        asks: vec![LevelSnapshot::new(px(10_050), Qty::from_u64(30), 1)],
    };
    engine.submit_snapshot(partial).unwrap();
    for seq in 16..=40 {
        engine.submit(add(Side::Bid, 9_000, 1, seq)).unwrap();
    }
    let _ = drained(&engine, &subscription);

    let follow_up = requests.try_recv().unwrap();
    assert_eq!((follow_up.symbol, follow_up.from_sequence, follow_up.to_sequence), (SYM, 13, 14));
    assert!(requests.try_recv().is_err());
    assert_eq!(engine.book_snapshot(SYM).unwrap().unwrap().sequence, 12);

    let full = BookSnapshot {
        symbol: SYM,
        sequence: 14,
        timestamp: ts(14),
        bids: vec![LevelSnapshot::new(px(9_950), Qty::from_u64(70), 3)],
        asks: vec![LevelSnapshot::new(px(10_050), Qty::from_u64(30), 1)],
    };
    engine.submit_snapshot(full).unwrap();
    let publications = drained(&engine, &subscription);

    assert_eq!(publications.last().map(|p| p.sequence), Some(40));
    assert!(alerts(&publications).contains(&MicrostructureAlert::Resynchronized { sequence: 40 }));
    let book = engine.book_snapshot(SYM).unwrap().unwrap();
    assert_eq!(book.sequence, 40);
    assert_eq!(book.bids.iter().find(|l| l.price == px(9_000)).map(|l| l.size), Some(Qty::from_u64(30)));

    let stats = engine.stats();
    assert_eq!(stats.snapshot_requests, 2);
    assert_eq!(stats.snapshots_applied, 2);
    engine.shutdown().unwrap();
}

#[test]
fn test_crossed_book_published_with_alert() {
    let (engine, subscription, _requests) = start_engine(engine_config());
    engine.submit(add(Side::Ask, 10_050, 10, 1)).unwrap();
    engine.submit(add(Side::Bid, 10_100, 10, 2)).unwrap();
    engine.submit(add(Side::Bid, 10_200, 10, 3)).unwrap();
    let publications = drained(&engine, &subscription);

    let crossed = publications.last().unwrap();
    assert_eq!(crossed.sequence, 3);
    assert_eq!(
        crossed.alerts.as_slice(),
        &[MicrostructureAlert::CrossedBook { best_bid: px(10_200), best_ask: px(10_050), sequence: 3 }]
    );
    let metrics = crossed.metrics.as_ref().unwrap();
    assert!(metrics.quality.crossed);

    let book = engine.book_snapshot(SYM).unwrap().unwrap();
    assert_eq!(book.bids[0].price, px(10_200));
    assert_eq!(book.bids.len(), 2);
    assert_eq!(engine.stats().crossed_books, 2);
    engine.shutdown().unwrap();
}

#[test]
fn test_try_submit_reports_saturation() {
    let config = EngineConfig { input_queue_capacity: 4, ..engine_config() };
    let handle = Arc::new(ConfigHandle::new(config).unwrap());
    let (engine, _requests) = Engine::builder(handle)
        .model(Arc::new(StubModel::new("sleepy", 1, Duration::from_millis(20))))
        .start()
        .unwrap();

    let mut saturated = 0;
    for seq in 1..=64 {
        match engine.try_submit(add(Side::Bid, 10_000, 1, seq)) {
            Ok(()) => {}
            Err(EngineError::QueueSaturated { worker }) => {
                assert_eq!(worker, 0);
                saturated += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(saturated > 0);
    let stats = engine.stats();
    assert_eq!(stats.events_dropped_full, saturated);
    assert_eq!(stats.events_received, 64);
    engine.shutdown().unwrap();
}

#[test]
fn test_model_declared_latency_bounds_inference() {
    // Engine budget is 50ms; the model promises 1ms but takes 20ms
    let handle = Arc::new(ConfigHandle::new(engine_config()).unwrap());
    let (engine, _requests) = Engine::builder(handle)
        .model(Arc::new(StubModel::new("slow", 1, Duration::from_millis(20)).declaring(1_000)))
        .start()
        .unwrap();

    for seq in 1..=6 {
        engine.submit(add(Side::Bid, 10_000, 1, seq)).unwrap();
    }
    engine.sync().unwrap();

    assert!(engine.stats().inference_timeouts >= 1);
    engine.shutdown().unwrap();
}

#[test]
fn test_drop_symbol_leaves_others() {
    let (engine, _subscription, _requests) = start_engine(engine_config());
    let other = Symbol::new(8);
    engine.submit(add(Side::Bid, 10_000, 5, 1)).unwrap();
    engine.submit(OrderBookEvent::add(other, Side::Ask, px(10_010), 5, 1, ts(1))).unwrap();
    engine.sync().unwrap();

    engine.drop_symbol(SYM).unwrap();
    assert!(engine.book_snapshot(SYM).unwrap().is_none());
    assert!(engine.latest_metrics(SYM).unwrap().is_none());
    assert_eq!(engine.book_snapshot(other).unwrap().map(|b| b.sequence), Some(1));

    // A dropped symbol starts over on its next event
    engine.submit(add(Side::Bid, 10_000, 5, 40)).unwrap();
    assert_eq!(engine.book_snapshot(SYM).unwrap().map(|b| b.sequence), Some(40));
    engine.shutdown().unwrap();
}

#[test]
fn test_model_swap_takes_effect() {
    let (engine, subscription, _requests) = start_engine(engine_config());
    submit_seeded(&engine, 6);
    let before = drained(&engine, &subscription);
    let baseline = before.last().and_then(|p| p.classification.clone()).unwrap();
    assert_eq!(baseline.model_version, "1.0.0");

    let generation = engine.swap_model(Arc::new(StubModel::new("9.9.9", 0, Duration::ZERO)));
    assert_eq!(generation, 1);
    assert_eq!(engine.models().load().metadata().version, "9.9.9");

    for seq in 7..=8 {
        engine.submit(add(Side::Ask, 10_200, 1, seq)).unwrap();
    }
    let after = drained(&engine, &subscription);
    let result = after.last().and_then(|p| p.classification.clone()).unwrap();
    assert_eq!(result.model_version, "9.9.9");
    // Length-agnostic model on the configured window of 4, already full
    assert_eq!(result.status, ClassificationStatus::Confident);
    assert_eq!(result.pattern_label, PatternLabel::HiddenLiquidity);
    engine.shutdown().unwrap();
}

#[test]
fn test_config_reload_reaches_workers() {
    let (engine, _subscription, _requests) = start_engine(engine_config());
    for (seq, cents) in [(1, 10_000), (2, 9_990), (3, 9_980)] {
        engine.submit(add(Side::Bid, cents, 10, seq)).unwrap();
    }
    engine.sync().unwrap();
    assert_eq!(engine.latest_metrics(SYM).unwrap().unwrap().bid_liquidity, 30);

    let generation = engine.config().update(EngineConfig { depth_window: 1, ..engine_config() }).unwrap();
    assert_eq!(generation, 1);
    assert_eq!(engine.current_config().depth_window, 1);
    // Workers pick the new snapshot up between messages
    engine.sync().unwrap();

    engine.submit(add(Side::Bid, 9_970, 10, 4)).unwrap();
    engine.sync().unwrap();
    let metrics = engine.latest_metrics(SYM).unwrap().unwrap();
    assert_eq!(metrics.bid_liquidity, 10);
    assert_eq!(metrics.depth, 1);
    engine.shutdown().unwrap();
}

#[test]
fn test_sustained_rate_meets_target_or_degrades() {
    let config = EngineConfig {
        workers: 1,
        governor: GovernorConfig { evaluation_interval_ms: 50, ..GovernorConfig::default() },
        ..EngineConfig::default()
    };
    let target_ns = config.latency_target_p99_us * 1_000;
    let (engine, subscription, requests) = start_engine(config);
    let mut feeds = vec![SyntheticFeed::new(FeedConfig { symbol: SYM, ..FeedConfig::default() }, ts(0))];

    let report = simulate(&engine, &mut feeds, &requests, 100_000, Some(100_000)).unwrap();
    assert_eq!(report.events_submitted, 100_000);
    assert_eq!(report.events_withheld, 0);

    // Idle workers fold their last interval in on the next poll
    std::thread::sleep(Duration::from_millis(200));
    let stats = engine.stats();
    assert_eq!(stats.events_applied, 100_000);
    assert_eq!(stats.invariant_violations, 0);
    let total = stats.stage(Stage::Total).unwrap();
    assert!(total.count > 0);
    assert!(
        total.p99 <= target_ns || stats.governor_degradations > 0,
        "p99 {}ns over target {}ns and the governor never degraded",
        total.p99,
        target_ns
    );

    let consumer = &engine.publisher().consumer_stats()[0];
    assert_eq!(consumer.delivered, stats.publications);
    assert!(subscription.len() <= subscription.capacity());
    engine.shutdown().unwrap();
}

#[test]
fn test_random_gaps_resync_to_reference_book() {
    let (engine, _subscription, requests) = start_engine(engine_config());
    let config = FeedConfig { symbol: SYM, seed: 7, gap_probability: 0.002, ..FeedConfig::default() };
    let mut feeds = vec![SyntheticFeed::new(config, ts(0))];

    let report = simulate(&engine, &mut feeds, &requests, 20_000, None).unwrap();
    assert!(report.events_withheld > 0);
    assert!(report.snapshots_served > 0);

    let book = engine.book_snapshot(SYM).unwrap().unwrap();
    let reference = feeds[0].reference();
    assert_eq!(book.sequence, reference.sequence());

    let image = |levels: &[LevelSnapshot]| -> Vec<_> {
        levels.iter().map(|l| (l.price, l.size.as_u64(), l.order_count)).collect()
    };
    assert_eq!(image(&book.bids), reference.levels(Side::Bid));
    assert_eq!(image(&book.asks), reference.levels(Side::Ask));

    let stats = engine.stats();
    assert!(stats.sequence_gaps > 0);
    assert!(stats.snapshots_applied > 0);
    assert_eq!(stats.snapshot_requests_dropped, 0);
    assert_eq!(engine.governor_states().len(), 1);
    engine.shutdown().unwrap();
}
