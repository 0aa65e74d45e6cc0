//! Output Publisher tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use microstructure::events::MicrostructureAlert;
use microstructure::governor::GovernorState;
use microstructure::publisher::{Alerts, Publication, Publisher};

use crate::utils::{SYM, ts};

fn publication(sequence: u64) -> Publication {
    Publication {
        symbol: SYM,
        sequence,
        timestamp: ts(sequence),
        metrics: None,
        classification: None,
        alerts: Alerts::new(),
        governor_state: GovernorState::Nominal,
    }
}

#[test]
fn test_lagging_consumer_keeps_newest() {
    let mut builder = Publisher::builder();
    let sub = builder.subscribe("lagging", 3);
    let publisher = builder.build();

    let displaced: usize = (1..=10).map(|seq| publisher.publish(&publication(seq))).sum();
    assert_eq!(displaced, 7);
    assert_eq!(sub.dropped(), 7);
    assert_eq!(sub.delivered(), 10);
    assert_eq!(sub.len(), 3);

    let sequences: Vec<u64> = sub.drain().iter().map(|p| p.sequence).collect();
    assert_eq!(sequences, vec![8, 9, 10]);
    assert!(sub.is_empty());
}

#[test]
fn test_no_consumers_is_fine() {
    let publisher = Publisher::empty();
    assert_eq!(publisher.consumer_count(), 0);
    assert_eq!(publisher.publish(&publication(1)), 0);
    assert!(publisher.consumer_stats().is_empty());
}

#[test]
fn test_stalled_consumer_does_not_block_others() {
    let mut builder = Publisher::builder();
    let stalled = builder.subscribe("stalled", 4);
    let live = builder.subscribe("live", 1_024);
    let publisher = builder.build();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let live = live.clone();
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                match live.try_recv() {
                    Some(p) => seen.push(p.sequence),
                    None if done.load(Ordering::Acquire) && live.is_empty() => break,
                    None => std::thread::yield_now(),
                }
            }
            seen
        })
    };

    for seq in 1..=500 {
        publisher.publish(&publication(seq));
    }
    done.store(true, Ordering::Release);
    let seen = reader.join().unwrap();

    // The live reader sees an in-order stream, the stalled one only its tail
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.last(), Some(&500));
    assert_eq!(stalled.len(), 4);
    assert_eq!(stalled.dropped(), 496);
    assert_eq!(stalled.try_recv().map(|p| p.sequence), Some(497));

    let stats = publisher.consumer_stats();
    let names: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["stalled", "live"]);
    assert_eq!(stats[0].pending, 3);
}

#[test]
fn test_json_line_carries_alerts() {
    let mut p = publication(15);
    p.alerts.push(MicrostructureAlert::SequenceGap { expected: 11, received: 15 });
    p.governor_state = GovernorState::Degraded;
    let line = p.to_json().unwrap();

    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["sequence"], 15);
    assert_eq!(value["alerts"][0]["alert"], "SequenceGap");
    assert_eq!(value["alerts"][0]["expected"], 11);
    assert_eq!(value["governor_state"], "Degraded");
    assert!(value["metrics"].is_null());
}
