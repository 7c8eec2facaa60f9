//! Property-based tests for the risk aggregator and the input size gate

use hostile_js_core::model::{Behavior, BehaviorKind, BehaviorSource, Severity};
use hostile_js_core::{score, score_with, validate, ScoringConfig, ValidationLimits};
use proptest::prelude::*;

const KINDS: [BehaviorKind; 11] = [
    BehaviorKind::NetworkRequest,
    BehaviorKind::DataExfiltration,
    BehaviorKind::DynamicEvaluation,
    BehaviorKind::Obfuscation,
    BehaviorKind::CryptoMining,
    BehaviorKind::DomManipulation,
    BehaviorKind::CookieAccess,
    BehaviorKind::LocalStorage,
    BehaviorKind::TimingAttack,
    BehaviorKind::Fingerprinting,
    BehaviorKind::ExecutionError,
];

const SEVERITIES: [Severity; 5] =
    [Severity::Info, Severity::Low, Severity::Medium, Severity::High, Severity::Critical];

fn behavior_strategy() -> impl Strategy<Value = Behavior> {
    (0..KINDS.len(), 0..SEVERITIES.len()).prop_map(|(k, s)| {
        Behavior::new(KINDS[k], SEVERITIES[s], BehaviorSource::Dynamic, "generated")
    })
}

proptest! {
    #[test]
    fn test_score_is_bounded(list in prop::collection::vec(behavior_strategy(), 0..200)) {
        let value = score(&list);
        prop_assert!(value <= 100);
        if list.is_empty() {
            prop_assert_eq!(value, 0);
        }
    }

    #[test]
    fn test_score_bounded_for_any_pivot(
        list in prop::collection::vec(behavior_strategy(), 1..60),
        pivot in 0.5f64..50.0,
    ) {
        let value = score_with(&list, &ScoringConfig { diminishing_pivot: pivot });
        prop_assert!(value <= 100);
    }

    #[test]
    fn test_nonempty_list_scores_positive_below_pivot(
        list in prop::collection::vec(behavior_strategy(), 1..5),
    ) {
        // Smallest contribution is info (1) x fingerprinting (1.0) out of 50.
        prop_assert!(score(&list) >= 2);
    }

    #[test]
    fn test_size_gate_matches_limit(len in 1usize..400) {
        let limits = ValidationLimits { max_length: 200, ..ValidationLimits::default() };
        let code = "x".repeat(len);
        let report = validate(Some(&code), &limits);
        let too_large = report.errors.iter().any(|e| e.starts_with("Code is too large"));
        prop_assert_eq!(too_large, len > 200);
        prop_assert_eq!(report.valid, len <= 200);
    }
}
