//! Observability infrastructure for Waitline.
//!
//! Structured logging with consistent spans. This module provides the
//! initialization helper and span constructors used by every binary.

use std::path::Path;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `waitline_ingest=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Initializes logging with an additional per-run log file under `log_dir`.
///
/// The file is named `{command}_{YYYYMMDD_HHMMSS}.log`. Falls back to
/// console-only logging if the directory cannot be created.
pub fn init_logging_with_file(format: LogFormat, log_dir: &Path, command: &str) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let file_layer = std::fs::create_dir_all(log_dir).ok().and_then(|()| {
            let name = format!(
                "{command}_{}.log",
                chrono::Utc::now().format("%Y%m%d_%H%M%S")
            );
            std::fs::File::create(log_dir.join(name)).ok()
        });

        let registry = tracing_subscriber::registry().with(env_filter);
        match (format, file_layer) {
            (LogFormat::Json, Some(file)) => registry
                .with(fmt::layer().json())
                .with(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
                .init(),
            (LogFormat::Json, None) => registry.with(fmt::layer().json()).init(),
            (LogFormat::Pretty, Some(file)) => registry
                .with(fmt::layer().pretty())
                .with(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
                .init(),
            (LogFormat::Pretty, None) => registry.with(fmt::layer().pretty()).init(),
        }
    });
}

/// Creates a span for ingest operations with standard fields.
#[must_use]
pub fn ingest_span(operation: &str, source_key: &str) -> Span {
    tracing::info_span!("ingest", op = operation, key = source_key)
}

/// Creates a span for modeling operations.
#[must_use]
pub fn modeling_span(operation: &str, entity_code: &str) -> Span {
    tracing::info_span!("modeling", op = operation, entity = entity_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = ingest_span("process_file", "export/wait_times/wdw/a.csv");
        let _guard = span.enter();
        tracing::info!("test message in span");

        let span = modeling_span("train", "MK101");
        let _guard2 = span.enter();
        tracing::info!("modeling message");
    }
}
