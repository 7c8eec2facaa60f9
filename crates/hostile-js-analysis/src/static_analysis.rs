use std::collections::HashMap;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::signatures::SignatureTable;
use crate::types::{Behavior, BehaviorKind, BehaviorSource, Details, LogEntry, LogLevel, Severity};

const MAX_EXAMPLES: usize = 3;

static FUNCTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)function").unwrap());
static LOOP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)for\s*\(|while\s*\(|do\s*\{").unwrap());
static CONDITIONAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)if\s*\(|switch\s*\(").unwrap());
static OPERATOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[+\-*/%=<>!&|^~]").unwrap());

struct Indicator {
    name: &'static str,
    weight: u32,
    matcher: Regex,
}

static INDICATORS: Lazy<Vec<Indicator>> = Lazy::new(|| {
    [
        ("Very long identifiers", 10, r"[a-zA-Z_$][a-zA-Z0-9_$]{20,}"),
        ("Hex escape sequences", 15, r"\\x[0-9a-fA-F]{2}"),
        ("Unicode escape sequences", 15, r"\\u[0-9a-fA-F]{4}"),
        ("String concatenation", 8, r#"['"]\s*\+\s*['"]"#),
        ("Bracket notation property access", 5, r#"\[['"]\w+['"]\]"#),
        ("Dynamic evaluation", 20, r"(?i)\beval\s*\("),
        ("Function constructor", 20, r#"(?i)\bnew\s+Function\s*\(|\bFunction\s*\(\s*["'`]"#),
        ("Array index access", 3, r"[a-zA-Z_$]\w*\[\d+\]"),
    ]
    .into_iter()
    .map(|(name, weight, pattern)| Indicator { name, weight, matcher: Regex::new(pattern).unwrap() })
    .collect()
});

/// Tunable thresholds for the static scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    /// Per-indicator ceiling as a multiple of the indicator's unit weight.
    pub indicator_cap: u32,
    pub entropy_threshold: f64,
    pub entropy_points: u32,
    pub complexity_alert: u32,
    pub obfuscation_alert: u32,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            indicator_cap: 5,
            entropy_threshold: 4.5,
            entropy_points: 15,
            complexity_alert: 80,
            obfuscation_alert: 70,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternMatch {
    pub signature: String,
    pub pattern: String,
    #[serde(rename = "type")]
    pub category: BehaviorKind,
    pub matches: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityReport {
    pub score: u32,
    pub lines: usize,
    pub characters: usize,
    pub function_count: usize,
    pub loop_count: usize,
    pub conditional_count: usize,
    pub operator_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObfuscationIndicator {
    pub name: String,
    pub match_count: usize,
    pub points: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObfuscationReport {
    pub score: u32,
    pub indicators: Vec<ObfuscationIndicator>,
    pub entropy: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaticReport {
    pub behaviors: Vec<Behavior>,
    pub patterns: Vec<PatternMatch>,
    pub complexity: ComplexityReport,
    pub obfuscation: ObfuscationReport,
    pub logs: Vec<LogEntry>,
    pub analysis_time_ms: u64,
}

pub fn scan(source: &str) -> StaticReport {
    scan_with(source, SignatureTable::builtin(), &ScanOptions::default())
}

pub fn scan_with(source: &str, table: &SignatureTable, options: &ScanOptions) -> StaticReport {
    let started = Instant::now();
    let mut report = StaticReport::default();
    report.logs.push(LogEntry::info("Starting static code analysis"));

    for signature in table.iter() {
        let found = signature.find_all(source);
        if found.is_empty() {
            continue;
        }
        let examples: Vec<String> =
            found.iter().take(MAX_EXAMPLES).map(|m| (*m).to_string()).collect();
        report.patterns.push(PatternMatch {
            signature: signature.id.clone(),
            pattern: signature.pattern.clone(),
            category: signature.category,
            matches: found.len(),
        });
        report.behaviors.push(
            Behavior::new(
                signature.category,
                signature.severity,
                BehaviorSource::Static,
                signature.description.clone(),
            )
            .with_detail("signature", signature.id.clone())
            .with_detail("pattern", signature.pattern.clone())
            .with_detail("matches", found.len())
            .with_detail("examples", examples),
        );
        let level = if signature.severity >= Severity::High {
            LogLevel::Warning
        } else {
            LogLevel::Info
        };
        report.logs.push(LogEntry::new(level, format!("Detected: {}", signature.description)));
        debug!(signature = %signature.id, matches = found.len(), "static signature matched");
    }

    report.complexity = analyze_complexity(source);
    report.obfuscation = analyze_obfuscation(source, options);

    if report.complexity.score > options.complexity_alert {
        report.behaviors.push(
            Behavior::new(
                BehaviorKind::Obfuscation,
                Severity::Medium,
                BehaviorSource::Static,
                "Code has high complexity (potential obfuscation)",
            )
            .with_details(details_of(&report.complexity)),
        );
    }
    if report.obfuscation.score > options.obfuscation_alert {
        report.behaviors.push(
            Behavior::new(
                BehaviorKind::Obfuscation,
                Severity::High,
                BehaviorSource::Static,
                "Code appears to be obfuscated",
            )
            .with_details(details_of(&report.obfuscation)),
        );
    }

    report.analysis_time_ms = started.elapsed().as_millis() as u64;
    report.logs.push(LogEntry::info(format!(
        "Static analysis completed in {}ms",
        report.analysis_time_ms
    )));
    report
}

pub fn analyze_complexity(source: &str) -> ComplexityReport {
    let lines = source.split('\n').count();
    let characters = source.chars().count();
    let function_count = FUNCTION_RE.find_iter(source).count();
    let loop_count = LOOP_RE.find_iter(source).count();
    let conditional_count = CONDITIONAL_RE.find_iter(source).count();
    let operator_count = OPERATOR_RE.find_iter(source).count();

    let raw = lines as f64 * 0.5
        + characters as f64 * 0.01
        + function_count as f64 * 5.0
        + loop_count as f64 * 8.0
        + conditional_count as f64 * 6.0
        + operator_count as f64 * 0.2;

    ComplexityReport {
        score: raw.min(100.0).round() as u32,
        lines,
        characters,
        function_count,
        loop_count,
        conditional_count,
        operator_count,
    }
}

pub fn analyze_obfuscation(source: &str, options: &ScanOptions) -> ObfuscationReport {
    let mut score = 0u32;
    let mut indicators = Vec::new();
    for indicator in INDICATORS.iter() {
        let count = indicator.matcher.find_iter(source).count();
        if count == 0 {
            continue;
        }
        let cap = indicator.weight.saturating_mul(options.indicator_cap);
        let points = indicator.weight.saturating_mul(count as u32).min(cap);
        score = score.saturating_add(points);
        indicators.push(ObfuscationIndicator {
            name: indicator.name.to_string(),
            match_count: count,
            points,
        });
    }

    let entropy = shannon_entropy(source);
    if entropy > options.entropy_threshold {
        score = score.saturating_add(options.entropy_points);
        indicators.push(ObfuscationIndicator {
            name: "High character entropy".to_string(),
            match_count: 0,
            points: options.entropy_points,
        });
    }

    ObfuscationReport { score: score.min(100), indicators, entropy }
}

/// Shannon entropy of the character distribution, in bits per character.
pub fn shannon_entropy(source: &str) -> f64 {
    let mut freq: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for ch in source.chars() {
        *freq.entry(ch).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    let len = total as f64;
    // Sorted so the floating-point sum is identical for identical input.
    let mut counts: Vec<usize> = freq.into_values().collect();
    counts.sort_unstable();
    let mut out = 0.0;
    for c in counts {
        let p = c as f64 / len;
        out -= p * p.log2();
    }
    out
}

fn details_of<T: Serialize>(value: &T) -> Details {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => Details::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_of_uniform_text_is_zero() {
        assert_eq!(shannon_entropy(""), 0.0);
        assert_eq!(shannon_entropy("aaaa"), 0.0);
        assert!((shannon_entropy("ab") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn complexity_counts_shapes() {
        let src = "function a() {\n  for (var i = 0; i < 3; i++) { if (i) { a(); } }\n}";
        let report = analyze_complexity(src);
        assert_eq!(report.lines, 3);
        assert_eq!(report.function_count, 1);
        assert_eq!(report.loop_count, 1);
        assert_eq!(report.conditional_count, 1);
        assert!(report.operator_count >= 4);
        assert!(report.score > 0 && report.score <= 100);
    }

    #[test]
    fn complexity_score_clamps_at_100() {
        let src = "for (;;) {}\n".repeat(200);
        assert_eq!(analyze_complexity(&src).score, 100);
    }

    #[test]
    fn indicator_points_are_capped() {
        let src = r"\x41".repeat(40);
        let report = analyze_obfuscation(&src, &ScanOptions::default());
        let hex = report
            .indicators
            .iter()
            .find(|ind| ind.name == "Hex escape sequences")
            .unwrap();
        assert_eq!(hex.match_count, 40);
        assert_eq!(hex.points, 75);
    }

    #[test]
    fn cap_multiplier_is_tunable() {
        let src = r"\x41".repeat(40);
        let options = ScanOptions { indicator_cap: 2, ..ScanOptions::default() };
        let report = analyze_obfuscation(&src, &options);
        assert_eq!(report.indicators[0].points, 30);
    }

    #[test]
    fn high_entropy_adds_bonus() {
        let src: String = (33u8..127).map(char::from).collect();
        let report = analyze_obfuscation(&src, &ScanOptions::default());
        assert!(report.entropy > 4.5);
        assert!(report.indicators.iter().any(|ind| ind.name == "High character entropy"));
    }

    #[test]
    fn heavy_obfuscation_raises_high_behavior() {
        let src = format!(
            "var {}='\\x61\\x62\\x63\\x64\\x65';eval(\"a\"+\"b\");eval(x);eval(y);",
            "a".repeat(30)
        );
        let report = scan(&src);
        assert!(report.obfuscation.score > 70, "score {}", report.obfuscation.score);
        assert!(report
            .behaviors
            .iter()
            .any(|b| b.description == "Code appears to be obfuscated" && b.severity == Severity::High));
    }
}
