mod buffer;
mod logging;
mod metrics;
mod process;

pub use buffer::{BufferLayer, LogBuffer};
pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{format_uptime, MetricsSnapshot, ServerMetrics};
pub use process::{ProcessSampler, ProcessUsage};

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default filter directive (e.g. "info", "parley_server=debug").
    /// Overridden by RUST_LOG.
    pub level: String,
    /// Write JSON log lines to stderr.
    pub stderr: bool,
    /// Persist warn+ events to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    /// Lines kept in memory for the operator console.
    pub console_buffer_lines: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stderr: true,
            log_to_sqlite: true,
            log_db_path: default_log_db_path(),
            console_buffer_lines: 1000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("global tracing subscriber already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Handles to the installed log sinks. Keep it alive for the process lifetime.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    log_buffer: Arc<LogBuffer>,
}

impl TelemetryGuard {
    /// Persisted warn+ events, if SQLite logging is enabled.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }

    /// Recent log lines for display.
    pub fn log_buffer(&self) -> Arc<LogBuffer> {
        Arc::clone(&self.log_buffer)
    }
}

/// Install the global tracing subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let fmt_layer = config.stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_span_list(true)
            .with_filter(build_filter(&config.level))
    });

    let (sqlite_layer, log_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(Arc::clone(&sink))), Some(sink))
            }
            Err(e) => {
                eprintln!("parley-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let log_buffer = Arc::new(LogBuffer::new(config.console_buffer_lines));
    let buffer_layer = BufferLayer::new(Arc::clone(&log_buffer)).with_filter(build_filter(&config.level));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .with(buffer_layer)
        .try_init()?;

    Ok(TelemetryGuard {
        log_sink,
        log_buffer,
    })
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// `~/.parley/logs.db`
pub fn default_log_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".parley")
        .join("logs.db")
}
