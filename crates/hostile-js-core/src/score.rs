use serde::{Deserialize, Serialize};

use crate::model::{Behavior, BehaviorKind, Severity};

pub const CRITICAL_WEIGHT: f64 = 25.0;
pub const MAX_TYPE_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Behavior count above which each additional finding counts for less.
    pub diminishing_pivot: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self { diminishing_pivot: 5.0 }
    }
}

pub fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 25.0,
        Severity::High => 15.0,
        Severity::Medium => 8.0,
        Severity::Low => 3.0,
        Severity::Info => 1.0,
    }
}

pub fn type_multiplier(kind: BehaviorKind) -> f64 {
    match kind {
        BehaviorKind::NetworkRequest => 1.5,
        BehaviorKind::DataExfiltration => 2.0,
        BehaviorKind::DynamicEvaluation => 1.3,
        BehaviorKind::Obfuscation => 1.2,
        BehaviorKind::CryptoMining => 1.8,
        BehaviorKind::DomManipulation => 1.1,
        BehaviorKind::CookieAccess => 1.2,
        BehaviorKind::LocalStorage => 1.1,
        BehaviorKind::TimingAttack => 1.4,
        BehaviorKind::Fingerprinting => 1.0,
        BehaviorKind::ExecutionError => 1.0,
    }
}

pub fn score(behaviors: &[Behavior]) -> u32 {
    score_with(behaviors, &ScoringConfig::default())
}

/// Weighted, normalized and damped risk score in `0..=100`.
pub fn score_with(behaviors: &[Behavior], config: &ScoringConfig) -> u32 {
    if behaviors.is_empty() {
        return 0;
    }
    let count = behaviors.len() as f64;
    let total: f64 = behaviors
        .iter()
        .map(|b| severity_weight(b.severity) * type_multiplier(b.kind))
        .sum();
    let max_possible = count * CRITICAL_WEIGHT * MAX_TYPE_MULTIPLIER;
    let normalized = (100.0 * total / max_possible.max(1.0)).min(100.0);

    let pivot = if config.diminishing_pivot > 0.0 { config.diminishing_pivot } else { 5.0 };
    let factor = (1.0 / (count / pivot).sqrt()).min(1.0);
    (normalized * factor).round().clamp(0.0, 100.0) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=19 => RiskLevel::Minimal,
            20..=39 => RiskLevel::Low,
            40..=59 => RiskLevel::Medium,
            60..=79 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Minimal => "minimal",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BehaviorSource;

    fn behavior(kind: BehaviorKind, severity: Severity) -> Behavior {
        Behavior::new(kind, severity, BehaviorSource::Dynamic, "test")
    }

    #[test]
    fn empty_list_scores_zero() {
        assert_eq!(score(&[]), 0);
    }

    #[test]
    fn single_high_network_call() {
        let list = [behavior(BehaviorKind::NetworkRequest, Severity::High)];
        // 15 * 1.5 / 50 * 100
        assert_eq!(score(&list), 45);
    }

    #[test]
    fn static_plus_dynamic_network_pair() {
        let list = [
            behavior(BehaviorKind::NetworkRequest, Severity::Medium),
            behavior(BehaviorKind::NetworkRequest, Severity::High),
        ];
        assert_eq!(score(&list), 35);
    }

    #[test]
    fn many_behaviors_are_damped() {
        let list: Vec<_> =
            (0..20).map(|_| behavior(BehaviorKind::DataExfiltration, Severity::Critical)).collect();
        // normalized 100, factor 1/sqrt(4)
        assert_eq!(score(&list), 50);
        let relaxed = ScoringConfig { diminishing_pivot: 20.0 };
        assert_eq!(score_with(&list, &relaxed), 100);
    }

    #[test]
    fn risk_bands() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Minimal);
        assert_eq!(RiskLevel::from_score(20), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(59), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(60), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(100), RiskLevel::Critical);
    }
}
