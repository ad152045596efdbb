use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// Crates whose events follow the configured level
const OWN_TARGETS: [&str; 3] = ["nsmesh", "nsmesh_core", "nsmesh_registry"];

/// Initialize structured logging based on configuration
///
/// JSON output carries the registry's structured fields (`client_id`,
/// `endpoint_id`, `generation`, ...) as top-level keys; pretty output is
/// for development. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = env_filter(&config.level)?;
    let writer = make_writer(config.file_path.as_deref())?;

    let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.format.as_str() == "json" {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_ansi(config.file_path.is_none())
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry().with(layer).with(filter).try_init()?;
    Ok(())
}

fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let level = parse_log_level(level)?;
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    Ok(EnvFilter::try_new(default_directives(level))?)
}

/// Our crates at `level`; dependencies (tonic, h2, redis) no louder than `warn`
fn default_directives(level: Level) -> String {
    let own = level.as_str().to_lowercase();
    let mut directives = level.min(Level::WARN).as_str().to_lowercase();
    for target in OWN_TARGETS {
        directives.push_str(&format!(",{target}={own}"));
    }
    directives
}

/// Append to `file_path` when set, stdout otherwise
fn make_writer(file_path: Option<&str>) -> anyhow::Result<BoxMakeWriter> {
    let Some(path) = file_path else {
        return Ok(BoxMakeWriter::new(std::io::stdout));
    };
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("Cannot open log file {path}: {e}"))?;
    Ok(BoxMakeWriter::new(Arc::new(file)))
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
