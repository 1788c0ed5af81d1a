use crate::models::EndpointEntry;
use crate::rotator::{EndpointRotator, RotationPolicy};
use std::time::Duration;

#[test]
fn empty_rotator_errors_on_next() {
    let mut rotator = EndpointRotator::new(Vec::new(), RotationPolicy::default(), false);
    assert!(rotator.next().is_err());
}

#[test]
fn sequential_policy_advances_every_n_calls() {
    let entries = vec![EndpointEntry::new("/a", 1.0), EndpointEntry::new("/b", 1.0)];
    let mut rotator = EndpointRotator::new(entries, RotationPolicy::Sequential { n: 2 }, false);

    let picks: Vec<String> = (0..4).map(|_| rotator.next().unwrap()).collect();
    assert_eq!(picks, vec!["/a", "/a", "/b", "/b"]);
}

#[test]
fn random_avoid_stutter_never_repeats_with_two_endpoints() {
    let entries = vec![EndpointEntry::new("/a", 1.0), EndpointEntry::new("/b", 1.0)];
    let mut rotator = EndpointRotator::new(entries, RotationPolicy::Random { avoid_stutter: true }, false);

    let mut last = rotator.next().unwrap();
    for _ in 0..50 {
        let next = rotator.next().unwrap();
        assert_ne!(next, last);
        last = next;
    }
}

#[test]
fn unhealthy_endpoints_are_skipped_until_all_are_unhealthy() {
    let entries = vec![EndpointEntry::new("/a", 1.0), EndpointEntry::new("/b", 1.0)];
    let mut rotator = EndpointRotator::new(entries, RotationPolicy::Random { avoid_stutter: false }, false);

    rotator.record_outcome("/a", Some(500), Duration::from_millis(10), false, None);
    for _ in 0..20 {
        assert_eq!(rotator.next().unwrap(), "/b");
    }
}

#[test]
fn all_unhealthy_falls_back_to_offering_all() {
    let entries = vec![EndpointEntry::new("/a", 1.0), EndpointEntry::new("/b", 1.0)];
    let mut rotator = EndpointRotator::new(entries, RotationPolicy::Random { avoid_stutter: false }, false);

    rotator.record_outcome("/a", Some(500), Duration::from_millis(10), false, None);
    rotator.record_outcome("/b", Some(500), Duration::from_millis(10), false, None);

    let mut seen = std::collections::HashSet::new();
    for _ in 0..50 {
        seen.insert(rotator.next().unwrap());
    }
    assert!(seen.contains("/a") || seen.contains("/b"));
}

#[test]
fn success_resets_health() {
    let entries = vec![EndpointEntry::new("/a", 1.0)];
    let mut rotator = EndpointRotator::new(entries, RotationPolicy::Random { avoid_stutter: false }, false);

    rotator.record_outcome("/a", Some(500), Duration::from_millis(10), false, None);
    assert!(!rotator.endpoints()[0].healthy);
    rotator.record_outcome("/a", Some(200), Duration::from_millis(10), false, None);
    assert!(rotator.endpoints()[0].healthy);
}

#[test]
fn pattern_avoiding_never_exceeds_max_consecutive_same() {
    let entries = vec![EndpointEntry::new("/a", 1.0), EndpointEntry::new("/b", 1.0), EndpointEntry::new("/c", 1.0)];
    let mut rotator = EndpointRotator::new(
        entries,
        RotationPolicy::PatternAvoiding {
            max_consecutive_same: 2,
            gram_window: 10,
            randomization_factor: 0.0,
        },
        false,
    );

    let picks: Vec<String> = (0..60).map(|_| rotator.next().unwrap()).collect();
    let mut run = 1;
    for window in picks.windows(2) {
        if window[0] == window[1] {
            run += 1;
        } else {
            run = 1;
        }
        assert!(run <= 2, "endpoint repeated more than max_consecutive_same times");
    }
}

#[test]
fn weighted_fairness_converges_within_tolerance() {
    let entries = vec![
        EndpointEntry::new("/a", 0.5),
        EndpointEntry::new("/b", 0.3),
        EndpointEntry::new("/c", 0.2),
    ];
    let mut rotator = EndpointRotator::new(
        entries,
        RotationPolicy::Weighted {
            performance_adaptive: false,
            alpha: 0.0,
            latency_window_size: 32,
        },
        false,
    );

    let mut counts = [0u32; 3];
    for _ in 0..10_000 {
        match rotator.next().unwrap().as_str() {
            "/a" => counts[0] += 1,
            "/b" => counts[1] += 1,
            "/c" => counts[2] += 1,
            _ => unreachable!(),
        }
    }

    let shares = counts.map(|c| c as f64 / 10_000.0);
    assert!((shares[0] - 0.5).abs() < 0.03, "share was {}", shares[0]);
    assert!((shares[1] - 0.3).abs() < 0.03, "share was {}", shares[1]);
    assert!((shares[2] - 0.2).abs() < 0.03, "share was {}", shares[2]);
}

#[test]
fn remove_endpoint_reindexes_history_and_counts() {
    let entries = vec![EndpointEntry::new("/a", 1.0), EndpointEntry::new("/b", 1.0), EndpointEntry::new("/c", 1.0)];
    let mut rotator = EndpointRotator::new(entries, RotationPolicy::Sequential { n: 1 }, false);
    rotator.next().unwrap();
    rotator.remove_endpoint("/a");
    assert_eq!(rotator.endpoints().len(), 2);
    assert!(rotator.next().is_ok());
}

#[test]
fn weighted_policy_bounds_the_latency_window_to_its_configured_size() {
    let entries = vec![EndpointEntry::new("/a", 1.0)];
    let mut rotator = EndpointRotator::new(
        entries,
        RotationPolicy::Weighted {
            performance_adaptive: false,
            alpha: 0.0,
            latency_window_size: 3,
        },
        false,
    );

    for millis in 1..=10u64 {
        rotator.record_outcome("/a", Some(200), Duration::from_millis(millis), false, None);
    }

    assert_eq!(rotator.endpoints()[0].latency_window.len(), 3);
}
