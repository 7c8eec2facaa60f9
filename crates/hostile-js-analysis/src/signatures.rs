//! Declarative threat signatures for the static scanner.
//!
//! Every entry is data: a matcher, the behavior category it maps to, a
//! severity and a description. The scanner walks the table in order with a
//! single loop, so adding or removing a detector never touches control flow.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BehaviorKind, Severity};

/// Signature as written in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignatureSpec {
    pub id: String,
    pub pattern: String,
    pub category: BehaviorKind,
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature {id}: invalid pattern: {source}")]
    InvalidPattern {
        id: String,
        #[source]
        source: regex::Error,
    },
    #[error("duplicate signature id: {0}")]
    DuplicateId(String),
}

/// A compiled signature. Matching is always case-insensitive.
#[derive(Debug, Clone)]
pub struct Signature {
    pub id: String,
    pub pattern: String,
    pub category: BehaviorKind,
    pub severity: Severity,
    pub description: String,
    matcher: Regex,
}

impl Signature {
    pub fn compile(spec: &SignatureSpec) -> Result<Self, SignatureError> {
        let matcher = RegexBuilder::new(&spec.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| SignatureError::InvalidPattern { id: spec.id.clone(), source })?;
        Ok(Self {
            id: spec.id.clone(),
            pattern: spec.pattern.clone(),
            category: spec.category,
            severity: spec.severity,
            description: spec.description.clone(),
            matcher,
        })
    }

    pub fn find_all<'a>(&self, source: &'a str) -> Vec<&'a str> {
        self.matcher.find_iter(source).map(|m| m.as_str()).collect()
    }
}

use BehaviorKind::*;
use Severity::{High, Info, Low, Medium};

const BUILTIN: &[(&str, &str, BehaviorKind, Severity, &str)] = &[
    // outbound network
    ("network.fetch", r"fetch\s*\(", NetworkRequest, Medium, "Uses fetch() for network requests"),
    ("network.xhr", r"XMLHttpRequest", NetworkRequest, Medium, "Uses XMLHttpRequest for network requests"),
    ("network.send", r"\.send\s*\(", NetworkRequest, Low, "Sends network requests"),
    ("network.beacon", r"navigator\.sendBeacon", NetworkRequest, Medium, "Uses navigator.sendBeacon to ship data"),
    ("network.websocket", r"new\s+WebSocket\s*\(", NetworkRequest, Medium, "Opens a WebSocket connection"),
    // dynamic code
    ("eval.direct", r"\beval\s*\(", DynamicEvaluation, High, "Uses eval() for dynamic code execution"),
    (
        "eval.function_constructor",
        r#"\bnew\s+Function\s*\(|\bFunction\s*\(\s*["'`]"#,
        DynamicEvaluation,
        High,
        "Uses Function constructor for dynamic code",
    ),
    ("eval.set_timeout_string", r#"setTimeout\s*\(\s*["'`][^"'`]*["'`]"#, DynamicEvaluation, Medium, "Uses setTimeout with string code"),
    ("eval.set_interval_string", r#"setInterval\s*\(\s*["'`][^"'`]*["'`]"#, DynamicEvaluation, Medium, "Uses setInterval with string code"),
    // storage
    ("storage.cookie", r"document\.cookie", CookieAccess, Medium, "Accesses document cookies"),
    ("storage.local", r"localStorage", LocalStorage, Low, "Accesses localStorage"),
    ("storage.session", r"sessionStorage", LocalStorage, Low, "Accesses sessionStorage"),
    // DOM mutation
    ("dom.write", r"document\.write", DomManipulation, Medium, "Uses document.write()"),
    ("dom.inner_html", r"innerHTML\s*=", DomManipulation, Low, "Modifies innerHTML"),
    ("dom.outer_html", r"outerHTML\s*=", DomManipulation, Medium, "Modifies outerHTML"),
    // encode / decode
    ("codec.atob", r"atob\s*\(", Obfuscation, Medium, "Uses base64 decoding (atob)"),
    ("codec.btoa", r"btoa\s*\(", Obfuscation, Low, "Uses base64 encoding (btoa)"),
    ("codec.from_char_code", r"String\.fromCharCode", Obfuscation, Medium, "Uses String.fromCharCode for obfuscation"),
    ("codec.unescape", r"unescape\s*\(", Obfuscation, Medium, "Uses unescape() function"),
    // workers and bytecode VMs
    ("compute.wasm", r"WebAssembly", CryptoMining, Medium, "Uses WebAssembly (potential crypto mining)"),
    ("compute.worker", r"Worker\s*\(", CryptoMining, Low, "Creates web workers (potential crypto mining)"),
    // fingerprinting
    // Named properties only, so navigator.sendBeacon stays a single network finding.
    (
        "fingerprint.navigator",
        r"navigator\.(?:userAgent|userAgentData|appName|appVersion|platform|oscpu|vendor|languages?|plugins|mimeTypes|hardwareConcurrency|deviceMemory|maxTouchPoints|cookieEnabled|doNotTrack|webdriver|connection|getBattery|mediaDevices)\b",
        Fingerprinting,
        Low,
        "Accesses navigator properties",
    ),
    ("fingerprint.screen", r"screen\.", Fingerprinting, Low, "Accesses screen properties"),
    ("fingerprint.canvas", r"canvas", Fingerprinting, Low, "Uses canvas (potential fingerprinting)"),
    // timing
    ("timing.performance_now", r"performance\.now", TimingAttack, Low, "Uses high-resolution timing"),
    ("timing.date_now", r"Date\.now", TimingAttack, Info, "Uses timestamp functions"),
];

static BUILTIN_TABLE: Lazy<SignatureTable> = Lazy::new(|| {
    SignatureTable::from_specs(&builtin_specs()).expect("built-in signature patterns compile")
});

pub fn builtin_specs() -> Vec<SignatureSpec> {
    BUILTIN
        .iter()
        .map(|(id, pattern, category, severity, description)| SignatureSpec {
            id: (*id).to_string(),
            pattern: (*pattern).to_string(),
            category: *category,
            severity: *severity,
            description: (*description).to_string(),
        })
        .collect()
}

/// Ordered, read-only signature table. Shared across analyses without locking.
#[derive(Debug, Clone, Default)]
pub struct SignatureTable {
    signatures: Vec<Signature>,
}

impl SignatureTable {
    pub fn builtin() -> &'static SignatureTable {
        &BUILTIN_TABLE
    }

    pub fn from_specs(specs: &[SignatureSpec]) -> Result<Self, SignatureError> {
        let mut table = Self::default();
        table.extend(specs)?;
        Ok(table)
    }

    /// Built-in signatures followed by `extra`, in that order.
    pub fn with_extra(extra: &[SignatureSpec]) -> Result<Self, SignatureError> {
        let mut table = Self::builtin().clone();
        table.extend(extra)?;
        Ok(table)
    }

    fn extend(&mut self, specs: &[SignatureSpec]) -> Result<(), SignatureError> {
        for spec in specs {
            if self.signatures.iter().any(|sig| sig.id == spec.id) {
                return Err(SignatureError::DuplicateId(spec.id.clone()));
            }
            self.signatures.push(Signature::compile(spec)?);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        self.signatures.iter()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
