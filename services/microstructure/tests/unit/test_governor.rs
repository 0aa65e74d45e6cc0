//! Latency Governor tests

use std::sync::Arc;
use std::time::{Duration, Instant};

use microstructure::config::{EngineConfig, GovernorConfig};
use microstructure::governor::{GovernorState, LatencyGovernor};
use microstructure::stats::{EngineStats, Stage};
use rstest::rstest;

fn config(min_samples: u64) -> EngineConfig {
    EngineConfig {
        latency_target_p99_us: 100,
        latency_ceiling_us: 400,
        classification_stride: 4,
        governor: GovernorConfig {
            evaluation_interval_ms: 10,
            sustain_intervals: 3,
            cooldown_intervals: 2,
            degraded_stride_factor: 2,
            degraded_window_scale: 0.25,
            min_samples,
        },
        ..EngineConfig::default()
    }
}

fn governor(config: &EngineConfig) -> (LatencyGovernor, Arc<EngineStats>, Instant) {
    let stats = Arc::new(EngineStats::new().unwrap());
    let now = Instant::now();
    (LatencyGovernor::new(config, Arc::clone(&stats), now).unwrap(), stats, now)
}

/// One evaluation interval of `n` end-to-end samples at `micros`
fn interval(gov: &mut LatencyGovernor, now: Instant, micros: u64, n: usize) -> GovernorState {
    for _ in 0..n {
        gov.record(Stage::Book, Duration::from_micros(micros / 4));
        gov.record(Stage::Total, Duration::from_micros(micros));
    }
    gov.evaluate(now).state
}

#[test]
fn test_degrades_only_when_sustained() {
    let (mut gov, stats, now) = governor(&config(1));

    assert_eq!(interval(&mut gov, now, 150, 100), GovernorState::Nominal);
    assert_eq!(interval(&mut gov, now, 150, 100), GovernorState::Nominal);
    // A good interval resets the streak
    assert_eq!(interval(&mut gov, now, 20, 100), GovernorState::Nominal);
    assert_eq!(interval(&mut gov, now, 150, 100), GovernorState::Nominal);
    assert_eq!(interval(&mut gov, now, 150, 100), GovernorState::Nominal);
    assert_eq!(interval(&mut gov, now, 150, 100), GovernorState::Degraded);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.governor_transitions, 1);
    assert_eq!(snapshot.governor_degradations, 1);
    let total = snapshot.stage(Stage::Total).unwrap();
    assert_eq!(total.count, 600);
    assert!(snapshot.stage(Stage::Book).is_some());
}

#[test]
fn test_ceiling_escalates_and_cooldown_recovers() {
    let (mut gov, stats, now) = governor(&config(1));
    let handle = gov.handle();
    for _ in 0..3 {
        interval(&mut gov, now, 150, 50);
    }
    assert_eq!(handle.state(), GovernorState::Degraded);

    let evaluation = {
        for _ in 0..50 {
            gov.record(Stage::Total, Duration::from_micros(900));
        }
        gov.evaluate(now)
    };
    assert!(evaluation.changed());
    assert_eq!(evaluation.previous, GovernorState::Degraded);
    assert_eq!(evaluation.state, GovernorState::Critical);
    assert!(evaluation.p99_ns > 400_000);

    assert_eq!(interval(&mut gov, now, 10, 50), GovernorState::Critical);
    assert_eq!(interval(&mut gov, now, 10, 50), GovernorState::Nominal);
    assert_eq!(handle.state(), GovernorState::Nominal);

    // Escalation and recovery are transitions, not degradations
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.governor_transitions, 3);
    assert_eq!(snapshot.governor_degradations, 1);
}

#[test]
fn test_sparse_intervals_are_not_judged() {
    let (mut gov, _, now) = governor(&config(16));
    for _ in 0..10 {
        assert_eq!(interval(&mut gov, now, 5_000, 4), GovernorState::Nominal);
    }
}

#[test]
fn test_empty_interval_counts_toward_recovery() {
    let (mut gov, _, now) = governor(&config(1));
    for _ in 0..3 {
        interval(&mut gov, now, 150, 10);
    }
    assert_eq!(gov.state(), GovernorState::Degraded);
    let evaluation = gov.evaluate(now);
    assert_eq!(evaluation.samples, 0);
    assert_eq!(gov.evaluate(now).state, GovernorState::Nominal);
}

#[rstest]
#[case::nominal(0, false, 4, 1.0, false, false)]
#[case::nominal_priority(0, true, 4, 1.0, false, false)]
#[case::degraded(3, false, 8, 0.25, true, false)]
#[case::degraded_priority(3, true, 8, 0.25, false, false)]
#[case::critical(4, false, 8, 0.25, true, true)]
#[case::critical_priority(4, true, 8, 0.25, false, false)]
fn test_directives(
    #[case] slow_intervals: usize,
    #[case] priority: bool,
    #[case] stride: u32,
    #[case] window_scale: f64,
    #[case] skip_hidden: bool,
    #[case] shed: bool,
) {
    let (mut gov, _, now) = governor(&config(1));
    for i in 0..slow_intervals {
        // The fourth slow interval breaches the ceiling
        let micros = if i == 3 { 1_000 } else { 150 };
        interval(&mut gov, now, micros, 10);
    }

    let directives = gov.directives(priority);
    assert_eq!(directives.classification_stride, stride);
    assert!((directives.window_scale - window_scale).abs() < f64::EPSILON);
    assert_eq!(directives.skip_hidden, skip_hidden);
    assert_eq!(directives.shed, shed);
}

#[test]
fn test_reconfigured_target_applies_next_interval() {
    let (mut gov, _, now) = governor(&config(1));
    for _ in 0..2 {
        interval(&mut gov, now, 150, 10);
    }
    gov.apply_config(&EngineConfig { latency_target_p99_us: 200, latency_ceiling_us: 800, ..config(1) });
    for _ in 0..5 {
        assert_eq!(interval(&mut gov, now, 150, 10), GovernorState::Nominal);
    }
}

#[test]
fn test_interval_gate() {
    let (mut gov, _, start) = governor(&config(1));
    assert!(gov.maybe_evaluate(start + Duration::from_millis(3)).is_none());
    let evaluation = gov.maybe_evaluate(start + Duration::from_millis(12)).unwrap();
    assert!(!evaluation.changed());
    assert!(gov.maybe_evaluate(start + Duration::from_millis(15)).is_none());
}
