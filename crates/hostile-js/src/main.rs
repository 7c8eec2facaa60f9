use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use hostile_js_analysis::dynamic::SubprocessBackend;
use hostile_js_analysis::{sandbox_available, ExecutionBackend, StaticReport};
use hostile_js_core::model::Severity;
use hostile_js_core::validate::MSG_NOT_TEXT;
use hostile_js_core::{
    resolve_backend, validate_bytes, AnalysisError, AnalysisRequest, AnalysisResult, Analyzer,
    AnalyzerSettings, BackendKind, Config, ErrorResponse, ValidationReport,
};

const EXIT_INVALID_INPUT: i32 = 2;
const MAX_INPUT_FILE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "hjs", version, about = "Behavior analysis for untrusted JavaScript")]
struct Cli {
    /// Debug logging on stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Clone)]
struct RuntimeArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    profile: Option<String>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    memory_limit_mb: Option<u64>,
    /// Accepted for compatibility; outbound calls are always stubbed
    #[arg(long)]
    network_access: bool,
    #[arg(long, value_parser = ["auto", "in-process", "subprocess"])]
    backend: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Validate, scan and execute scripts, then score them")]
    Analyze {
        /// Script files, or `-` for stdin
        #[arg(value_name = "SCRIPT", required = true)]
        paths: Vec<String>,
        #[arg(long)]
        json: bool,
        #[arg(long, alias = "seq")]
        sequential: bool,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    #[command(about = "Run only the input validator")]
    Validate {
        #[arg(value_name = "SCRIPT")]
        path: String,
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    #[command(about = "Static signature scan without executing anything")]
    Scan {
        #[arg(value_name = "SCRIPT")]
        path: String,
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    #[command(about = "Show sandbox capabilities and effective limits")]
    Status {
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Analyze { paths, json, sequential, runtime } => {
            let settings = prepare(&runtime, cli.verbose)?;
            run_analyze(&paths, json, sequential, settings)?
        }
        Command::Validate { path, json, runtime } => {
            let settings = prepare(&runtime, cli.verbose)?;
            run_validate(&path, json, &settings)?
        }
        Command::Scan { path, json, runtime } => {
            let settings = prepare(&runtime, cli.verbose)?;
            run_scan(&path, json, settings)?
        }
        Command::Status { json, runtime } => {
            let settings = prepare(&runtime, cli.verbose)?;
            run_status(json, &settings)?
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Loads config, installs logging and applies command-line overrides.
fn prepare(runtime: &RuntimeArgs, verbose: bool) -> Result<AnalyzerSettings> {
    let config = match &runtime.config {
        Some(path) => Some(
            Config::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        ),
        None => None,
    };
    init_logging(verbose, config.as_ref().and_then(Config::log_level));

    let mut settings = AnalyzerSettings::default();
    match (&config, runtime.profile.as_deref()) {
        (Some(cfg), profile) => cfg.apply(&mut settings, profile)?,
        (None, Some(profile)) => {
            return Err(anyhow!("--profile {profile} requires --config"));
        }
        (None, None) => {}
    }

    if let Some(timeout_ms) = runtime.timeout_ms {
        if timeout_ms == 0 {
            return Err(anyhow!("--timeout-ms must be positive"));
        }
        settings.sandbox.timeout_ms = timeout_ms;
    }
    if let Some(memory) = runtime.memory_limit_mb {
        settings.sandbox.memory_limit_mb = memory;
    }
    if runtime.network_access {
        settings.sandbox.network_access = true;
    }
    if let Some(backend) = runtime.backend.as_deref() {
        settings.backend =
            BackendKind::parse(backend).ok_or_else(|| anyhow!("unknown backend {backend}"))?;
    }
    debug!(
        backend = settings.backend.as_str(),
        timeout_ms = settings.sandbox.timeout_ms,
        "Effective settings"
    );
    Ok(settings)
}

fn init_logging(verbose: bool, config_level: Option<&str>) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("debug")
    } else if let Some(level) = config_level {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    } else {
        EnvFilter::new("warn")
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_input(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .take(MAX_INPUT_FILE_BYTES + 1)
            .read_to_end(&mut buf)
            .context("failed to read stdin")?;
        if buf.len() as u64 > MAX_INPUT_FILE_BYTES {
            return Err(anyhow!("stdin exceeds {MAX_INPUT_FILE_BYTES} bytes"));
        }
        return Ok(buf);
    }
    let meta = fs::metadata(path).with_context(|| format!("cannot stat {path}"))?;
    if meta.len() > MAX_INPUT_FILE_BYTES {
        return Err(anyhow!("{path} exceeds {MAX_INPUT_FILE_BYTES} bytes"));
    }
    fs::read(path).with_context(|| format!("failed to read {path}"))
}

fn request_for(bytes: Vec<u8>) -> Result<AnalysisRequest, AnalysisError> {
    String::from_utf8(bytes)
        .map(AnalysisRequest::new)
        .map_err(|_| AnalysisError::Validation(vec![MSG_NOT_TEXT.to_string()]))
}

fn run_analyze(
    paths: &[String],
    json: bool,
    sequential: bool,
    settings: AnalyzerSettings,
) -> Result<i32> {
    if paths.iter().filter(|p| p.as_str() == "-").count() > 1 {
        return Err(anyhow!("stdin (-) can only be given once"));
    }
    let analyzer = Analyzer::new(settings)?;
    let process = |path: &String| -> Result<(String, Result<AnalysisResult, AnalysisError>)> {
        let bytes = read_input(path)?;
        let outcome = request_for(bytes).and_then(|request| analyzer.analyze(&request));
        Ok((path.clone(), outcome))
    };
    let entries = if sequential || paths.len() == 1 {
        paths.iter().map(process).collect::<Result<Vec<_>>>()?
    } else {
        paths.par_iter().map(process).collect::<Result<Vec<_>>>()?
    };

    let rejected = entries
        .iter()
        .any(|(_, outcome)| matches!(outcome, Err(AnalysisError::Validation(_))));
    let failed = entries.iter().any(|(_, outcome)| outcome.is_err());
    if json {
        let rendered: Vec<_> = entries
            .iter()
            .map(|(path, outcome)| match outcome {
                Ok(result) => json!({ "path": path, "result": result }),
                Err(err) => json!({ "path": path, "error": ErrorResponse::from(err) }),
            })
            .collect();
        let value = if rendered.len() == 1 {
            rendered.into_iter().next().unwrap_or_default()
        } else {
            serde_json::Value::Array(rendered)
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for (path, outcome) in &entries {
            match outcome {
                Ok(result) => print_result(path, result),
                Err(err) => print_error(path, err),
            }
        }
    }
    Ok(if rejected {
        EXIT_INVALID_INPUT
    } else if failed {
        1
    } else {
        0
    })
}

fn print_result(path: &str, result: &AnalysisResult) {
    println!(
        "{path}: risk {}/100 ({}) backend={} time={}ms",
        result.risk_score,
        result.risk_level.as_str(),
        result.backend,
        result.execution_time
    );
    if result.behaviors.is_empty() {
        println!("  no suspicious behavior");
    }
    for behavior in &result.behaviors {
        println!(
            "  [{}] {} ({:?}): {}",
            behavior.severity.as_str(),
            behavior.kind.as_str(),
            behavior.source,
            behavior.description
        );
    }
    let critical = result.count_by_severity(Severity::Critical);
    if critical > 0 {
        println!("  {critical} critical finding(s)");
    }
}

fn print_error(path: &str, err: &AnalysisError) {
    let response = ErrorResponse::from(err);
    println!("{path}: {}", response.error);
    for detail in &response.details {
        println!("  - {detail}");
    }
}

fn validate_input(path: &str, settings: &AnalyzerSettings) -> Result<ValidationReport> {
    let bytes = read_input(path)?;
    Ok(validate_bytes(Some(bytes.as_slice()), &settings.validation))
}

fn run_validate(path: &str, json: bool, settings: &AnalyzerSettings) -> Result<i32> {
    let report = validate_input(path, settings)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.valid {
        println!(
            "{path}: valid ({} chars, {} lines, {} functions, nesting {})",
            report.stats.length, report.stats.lines, report.stats.functions, report.stats.nesting_level
        );
    } else {
        println!("{path}: invalid");
        for error in &report.errors {
            println!("  - {error}");
        }
    }
    Ok(if report.valid { 0 } else { EXIT_INVALID_INPUT })
}

fn run_scan(path: &str, json: bool, settings: AnalyzerSettings) -> Result<i32> {
    let bytes = read_input(path)?;
    let report = validate_bytes(Some(bytes.as_slice()), &settings.validation);
    if !report.valid {
        let err = AnalysisError::Validation(report.errors);
        if json {
            println!("{}", serde_json::to_string_pretty(&ErrorResponse::from(&err))?);
        } else {
            print_error(path, &err);
        }
        return Ok(EXIT_INVALID_INPUT);
    }
    let code = String::from_utf8_lossy(&bytes);
    let analyzer = Analyzer::with_backend(
        settings,
        Box::new(hostile_js_analysis::InProcessBackend),
    )?;
    let scan = analyzer.scan(&code);
    if json {
        println!("{}", serde_json::to_string_pretty(&scan)?);
    } else {
        print_scan(path, &scan);
    }
    Ok(0)
}

fn print_scan(path: &str, scan: &StaticReport) {
    println!(
        "{path}: complexity {}/100, obfuscation {}/100, entropy {:.2} bits/char",
        scan.complexity.score, scan.obfuscation.score, scan.obfuscation.entropy
    );
    for pattern in &scan.patterns {
        println!("  {} x{} ({})", pattern.signature, pattern.matches, pattern.category.as_str());
    }
    for indicator in &scan.obfuscation.indicators {
        println!("  obfuscation: {} ({} pts)", indicator.name, indicator.points);
    }
}

fn run_status(json: bool, settings: &AnalyzerSettings) -> Result<i32> {
    let worker = settings
        .worker_path
        .clone()
        .or_else(|| SubprocessBackend::discover().map(|b| b.worker().to_path_buf()));
    let worker_display = worker.as_deref().map(Path::display).map(|d| d.to_string());
    let effective = resolve_backend(settings).map(|backend| backend.name()).unwrap_or("unavailable");
    let signatures = Analyzer::with_backend(
        settings.clone(),
        Box::new(hostile_js_analysis::InProcessBackend),
    )?
    .signatures()
    .len();
    let status = json!({
        "sandboxAvailable": sandbox_available(),
        "backend": settings.backend.as_str(),
        "effectiveBackend": effective,
        "worker": worker_display,
        "signatures": signatures,
        "limits": {
            "maxLength": settings.validation.max_length,
            "maxNesting": settings.validation.max_nesting,
            "maxFunctions": settings.validation.max_functions,
            "maxLineLength": settings.validation.max_line_length,
            "timeoutMs": settings.sandbox.timeout_ms,
            "graceMs": settings.sandbox.grace_ms,
            "memoryLimitMb": settings.sandbox.memory_limit_mb,
            "memoryLimitEnforced": false,
            "networkAccess": settings.sandbox.network_access,
            "loopIterationLimit": settings.sandbox.loop_iteration_limit,
            "recursionLimit": settings.sandbox.recursion_limit,
        },
        "scoring": { "diminishingPivot": settings.scoring.diminishing_pivot },
    });
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("sandbox: {}", if sandbox_available() { "available" } else { "not built" });
        println!("backend: {} ({effective})", settings.backend.as_str());
        println!("worker: {}", worker_display.as_deref().unwrap_or("not found"));
        println!("signatures: {signatures}");
        println!(
            "timeout: {}ms (+{}ms grace), memory: {}MB (advisory)",
            settings.sandbox.timeout_ms, settings.sandbox.grace_ms, settings.sandbox.memory_limit_mb
        );
        println!(
            "input: max {} chars, nesting {}, functions {}, line length {}",
            settings.validation.max_length,
            settings.validation.max_nesting,
            settings.validation.max_functions,
            settings.validation.max_line_length
        );
    }
    Ok(0)
}
