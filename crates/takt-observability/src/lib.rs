use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Which binary is emitting, trimmed to the two shapes this workspace actually builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingInitInfo {
    pub logs_dir: PathBuf,
    pub process: &'static str,
}

/// A structured event logged through `tracing` with a fixed field set, rather than ad hoc
/// `info!("...")` strings.
#[derive(Debug, Clone)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub correlation_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub movement: Option<&'a str>,
    pub persona_display_name: Option<&'a str>,
    pub provider_id: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Hashes arbitrary text to a short hex tag for log redaction. Not cryptographic — purely a
/// display aid so repeated values are recognisable without printing raw content.
pub fn short_hash(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:x}", hasher.finish())[..8].to_string()
}

/// Truncates long free text before it's attached to a log line, appending a short hash so
/// truncated duplicates are still distinguishable.
pub fn redact_text(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    format!("{}... [{}]", &text[..max_len], short_hash(text))
}

pub fn emit_event(level: Level, process: ProcessKind, event: &ObservabilityEvent<'_>) {
    let process = process.as_str();
    match level {
        Level::ERROR => tracing::error!(
            target: "takt.obs",
            process,
            event = event.event,
            component = event.component,
            correlation_id = event.correlation_id,
            run_id = event.run_id,
            movement = event.movement,
            persona_display_name = event.persona_display_name,
            provider_id = event.provider_id,
            model_id = event.model_id,
            status = event.status,
            error_code = event.error_code,
            detail = event.detail,
            "observability_event"
        ),
        Level::WARN => tracing::warn!(
            target: "takt.obs",
            process,
            event = event.event,
            component = event.component,
            correlation_id = event.correlation_id,
            run_id = event.run_id,
            movement = event.movement,
            persona_display_name = event.persona_display_name,
            provider_id = event.provider_id,
            model_id = event.model_id,
            status = event.status,
            error_code = event.error_code,
            detail = event.detail,
            "observability_event"
        ),
        _ => tracing::info!(
            target: "takt.obs",
            process,
            event = event.event,
            component = event.component,
            correlation_id = event.correlation_id,
            run_id = event.run_id,
            movement = event.movement,
            persona_display_name = event.persona_display_name,
            provider_id = event.provider_id,
            model_id = event.model_id,
            status = event.status,
            error_code = event.error_code,
            detail = event.detail,
            "observability_event"
        ),
    }
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join(".takt").join("logs")
}

fn cleanup_old_jsonl(dir: &Path, retention_days: u64) {
    let cutoff = match std::time::SystemTime::now().checked_sub(std::time::Duration::from_secs(retention_days * 86_400)) {
        Some(cutoff) => cutoff,
        None => return,
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                if modified < cutoff {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }
}

/// Initializes the process-wide `tracing` subscriber: a compact stderr layer filtered by
/// `RUST_LOG` (default `info`), plus a JSON-per-line rolling file layer under `logs_dir`.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<LoggingInitInfo> {
    std::fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, retention_days);

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(process.as_str())
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked intentionally: the guard must outlive the process for buffered lines to flush,
    // and this is called exactly once at startup.
    std::mem::forget(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_target(true);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))?;

    Ok(LoggingInitInfo {
        logs_dir: logs_dir.to_path_buf(),
        process: process.as_str(),
    })
}
