//! Input gate. Nothing is scanned or executed unless this passes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::model::Severity;
use crate::security_log::{SecurityDomain, SecurityEvent};

pub const MSG_REQUIRED: &str = "Code is required";
pub const MSG_NOT_TEXT: &str = "Code must be a string";
pub const MSG_EMPTY: &str = "Code cannot be empty";
pub const MSG_INFINITE_LOOP: &str = "Code contains potential infinite loop patterns";

static FORBIDDEN: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)\brequire\s*\(", "Node.js require() is not allowed"),
        (r"(?i)\bimport\s+.*\s+from\b", "ES6 imports are not allowed"),
        (r"(?i)\bimport\s*\(", "Dynamic import() is not allowed"),
        (r"(?i)\bprocess\.", "Process object access is not allowed"),
        (r"__dirname|__filename", "Node.js globals are not allowed"),
        (r"(?i)\b(?:fs|path|os)\.", "Node.js modules are not allowed"),
        (r"(?i)\bchild_process\b", "child_process access is not allowed"),
        (r"\bglobalThis\b|\bglobal\.", "Host global object access is not allowed"),
    ]
    .into_iter()
    .map(|(pattern, message)| (Regex::new(pattern).unwrap(), message))
    .collect()
});

static ALWAYS_TRUE_LOOPS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)while\s*\(\s*true\s*\)",
        r"(?i)for\s*\(\s*;\s*;\s*\)",
        r"(?i)while\s*\(\s*1\s*\)",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

static FUNCTION_DEF: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)function\s+\w+").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_length: usize,
    pub max_nesting: usize,
    pub max_functions: usize,
    pub max_line_length: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self { max_length: 100_000, max_nesting: 20, max_functions: 50, max_line_length: 1_000 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStats {
    pub length: usize,
    pub lines: usize,
    pub functions: usize,
    pub nesting_level: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub stats: ValidationStats,
}

impl ValidationReport {
    fn rejected(error: &str) -> Self {
        Self { valid: false, errors: vec![error.to_string()], stats: ValidationStats::default() }
    }
}

/// Validates raw bytes; anything that is not UTF-8 is not text.
pub fn validate_bytes(input: Option<&[u8]>, limits: &ValidationLimits) -> ValidationReport {
    match input {
        None => finish(ValidationReport::rejected(MSG_REQUIRED)),
        Some(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => validate(Some(text), limits),
            Err(_) => finish(ValidationReport::rejected(MSG_NOT_TEXT)),
        },
    }
}

pub fn validate(input: Option<&str>, limits: &ValidationLimits) -> ValidationReport {
    let Some(code) = input else {
        return finish(ValidationReport::rejected(MSG_REQUIRED));
    };
    if code.trim().is_empty() {
        return finish(ValidationReport::rejected(MSG_EMPTY));
    }

    let mut errors = Vec::new();
    let length = code.chars().count();
    if length > limits.max_length {
        errors.push(format!("Code is too large (maximum {}KB)", limits.max_length / 1_000));
    }

    for (pattern, message) in FORBIDDEN.iter() {
        if pattern.is_match(code) {
            errors.push((*message).to_string());
        }
    }

    let nesting_level = nesting_depth(code);
    if nesting_level > limits.max_nesting {
        errors.push(format!("Code has excessive nesting (maximum {} levels)", limits.max_nesting));
    }

    let functions = FUNCTION_DEF.find_iter(code).count();
    if functions > limits.max_functions {
        errors.push(format!("Too many function definitions (maximum {})", limits.max_functions));
    }

    let lines: Vec<&str> = code.split('\n').collect();
    if lines.iter().any(|line| line.chars().count() > limits.max_line_length) {
        errors.push(format!(
            "Code contains extremely long lines (maximum {} characters per line)",
            limits.max_line_length
        ));
    }

    if ALWAYS_TRUE_LOOPS.iter().any(|pattern| pattern.is_match(code)) {
        errors.push(MSG_INFINITE_LOOP.to_string());
    }

    finish(ValidationReport {
        valid: errors.is_empty(),
        errors,
        stats: ValidationStats { length, lines: lines.len(), functions, nesting_level },
    })
}

fn finish(report: ValidationReport) -> ValidationReport {
    if !report.valid {
        let message = report.errors.join("; ");
        SecurityEvent::new(
            Level::WARN,
            SecurityDomain::Validation,
            Severity::Low,
            "input_rejected",
            &message,
        )
        .emit();
    }
    report
}

/// Maximum bracket depth from a plain running counter. Strings and comments
/// are not skipped.
pub fn nesting_depth(code: &str) -> usize {
    let mut current: i64 = 0;
    let mut max: i64 = 0;
    for ch in code.chars() {
        match ch {
            '{' | '(' | '[' => {
                current += 1;
                max = max.max(current);
            }
            '}' | ')' | ']' => current -= 1,
            _ => {}
        }
    }
    max.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(code: &str) -> ValidationReport {
        validate(Some(code), &ValidationLimits::default())
    }

    #[test]
    fn missing_and_empty_input_short_circuit() {
        assert_eq!(validate(None, &ValidationLimits::default()).errors, vec![MSG_REQUIRED]);
        assert_eq!(check("  \n ").errors, vec![MSG_EMPTY]);
        let bytes = [0xff, 0xfe, 0x00];
        assert_eq!(
            validate_bytes(Some(&bytes[..]), &ValidationLimits::default()).errors,
            vec![MSG_NOT_TEXT]
        );
    }

    #[test]
    fn benign_code_passes_with_stats() {
        let report = check("function add(a, b) {\n  return [a, b];\n}");
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(report.stats.lines, 3);
        assert_eq!(report.stats.functions, 1);
        assert_eq!(report.stats.nesting_level, 2);
    }

    #[test]
    fn each_forbidden_construct_names_itself() {
        let cases = [
            ("const x = require('x');", "Node.js require() is not allowed"),
            ("import fs from 'fs'", "ES6 imports are not allowed"),
            ("import('x').then(f)", "Dynamic import() is not allowed"),
            ("process.exit(1)", "Process object access is not allowed"),
            ("console.log(__dirname)", "Node.js globals are not allowed"),
            ("os.platform()", "Node.js modules are not allowed"),
            ("var child_process = 1", "child_process access is not allowed"),
            ("globalThis.x = 1", "Host global object access is not allowed"),
        ];
        for (code, message) in cases {
            let report = check(code);
            assert!(!report.valid);
            assert!(report.errors.iter().any(|e| e == message), "{code}: {:?}", report.errors);
        }
    }

    #[test]
    fn identifier_boundaries_avoid_false_module_hits() {
        assert!(check("var photos = []; photos.push(1);").valid);
    }

    #[test]
    fn structural_limits_are_enforced() {
        let deep = format!("{}{}", "(".repeat(21), ")".repeat(21));
        assert!(check(&deep).errors[0].starts_with("Code has excessive nesting"));

        let many = "function f(){}\n".repeat(51);
        assert!(check(&many).errors.iter().any(|e| e.starts_with("Too many function definitions")));

        let long_line = format!("var s = '{}';", "a".repeat(1_001));
        assert!(check(&long_line).errors.iter().any(|e| e.contains("extremely long lines")));
    }

    #[test]
    fn always_true_loops_are_rejected_once() {
        let report = check("while (true) {}\nfor (;;) {}\ndo { x(); } while(1)");
        let hits = report.errors.iter().filter(|e| *e == MSG_INFINITE_LOOP).count();
        assert_eq!(hits, 1);
    }

    #[test]
    fn nesting_counter_ignores_stray_closers() {
        assert_eq!(nesting_depth("))((("), 1);
        assert_eq!(nesting_depth("no brackets"), 0);
    }
}
