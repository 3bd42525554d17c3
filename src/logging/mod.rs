//! Logging infrastructure - structured tracing for the linker
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels via `TYPTHON_LINK_LOG_LEVEL` or `RUST_LOG`
//! - Zero-cost when disabled
//! - Optional performance tracking of linkage requests
//! - Console or file output, human-readable or JSON
//!
//! Every event carries an `event = "..."` field so logs can be filtered
//! by what happened rather than by message text.

use crate::descriptor::FunctionDescriptor;
use crate::error::LinkError;
use crate::interop::CallingSequence;
use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Keeps the file writer flushing for the life of the process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

static TRACK_PERFORMANCE: AtomicBool = AtomicBool::new(cfg!(debug_assertions));

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable file logging
    pub file_output: bool,
    /// Log file path (if file_output enabled)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
    /// Enable performance tracking
    pub track_performance: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
            track_performance: cfg!(debug_assertions),
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // TYPTHON_LINK_LOG_LEVEL: trace, debug, info, warn, error
        if let Some(level) = var("TYPTHON_LINK_LOG_LEVEL") {
            config.level = parse_level(&level);
        }

        // TYPTHON_LINK_LOG_FILE: path to log file
        if let Some(path) = var("TYPTHON_LINK_LOG_FILE") {
            config.file_output = true;
            config.log_path = Some(path);
        }

        config.json_format = var("TYPTHON_LINK_LOG_JSON").is_some();
        config.show_spans = var("TYPTHON_LINK_LOG_SPANS").is_some();

        // TYPTHON_LINK_LOG_PERF: 1/true enables duration events
        if let Some(val) = var("TYPTHON_LINK_LOG_PERF") {
            config.track_performance = val == "1" || val.to_lowercase() == "true";
        }

        config
    }

    /// Create high-performance config (errors only)
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            track_performance: false,
            ..Self::default()
        }
    }

    /// Create debug config (verbose logging to a file)
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            file_output: true,
            log_path: Some("typthon_link.log".to_string()),
            json_format: false,
            show_spans: true,
            track_performance: true,
        }
    }
}

fn parse_level(value: &str) -> Level {
    match value.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call has an effect. If the host already installed a
/// global subscriber, linker events go to that one.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        TRACK_PERFORMANCE.store(config.track_performance, Ordering::Relaxed);

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "typthon_link={}",
                config.level.as_str().to_lowercase()
            ))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let writer = match config.log_path.as_deref().filter(|_| config.file_output) {
            Some(path) => file_writer(Path::new(path)),
            None => BoxMakeWriter::new(io::stderr),
        };

        let layer = fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(cfg!(debug_assertions))
            .with_line_number(cfg!(debug_assertions));

        let installed = if config.json_format {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init()
        };
        if installed.is_err() {
            tracing::debug!(event = "logging_init", "Global subscriber already installed");
        }
    });
}

fn file_writer(path: &Path) -> BoxMakeWriter {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file = path.file_name().unwrap_or(path.as_os_str());
    let appender = tracing_appender::rolling::never(dir, file);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);
    BoxMakeWriter::new(writer)
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Linker-specific logging functions
// ============================================================================

/// Log a linkage request entering the cache
pub fn log_link_request(kind: &str, descriptor: &FunctionDescriptor) {
    use tracing::trace;
    trace!(
        event = "link_request",
        kind = kind,
        descriptor = %descriptor,
        "Linkage requested"
    );
}

/// Log a cache miss (platform dispatch follows)
pub fn log_cache_miss(kind: &str, descriptor: &FunctionDescriptor) {
    use tracing::debug;
    debug!(
        event = "cache_miss",
        kind = kind,
        descriptor = %descriptor,
        "Arranging new linkage"
    );
}

/// Log a reclaim pass
pub fn log_cache_reclaim(cache: &str, demoted: usize, purged: usize) {
    use tracing::debug;
    debug!(
        event = "cache_reclaim",
        cache = cache,
        demoted = demoted,
        purged = purged,
        "Cache entries released"
    );
}

/// Log a rejected linkage request
pub fn log_link_rejected(operation: &str, error: &LinkError) {
    use tracing::debug;
    debug!(
        event = "link_rejected",
        operation = operation,
        error = %error,
        "Linkage request rejected"
    );
}

/// Log native access under the `warn` policy
pub fn log_access_warning(caller: &str, operation: &str) {
    use tracing::warn;
    warn!(
        event = "native_access",
        caller = caller,
        operation = operation,
        "Restricted linker operation called; native access will be denied under the deny policy"
    );
}

/// Log a downcall
#[inline]
pub fn log_native_call(target: usize, arg_count: usize, sequence: &CallingSequence) {
    use tracing::trace;
    trace!(
        event = "native_call",
        target = %format!("{:#x}", target),
        args = arg_count,
        sequence = %sequence,
        "Native function called"
    );
}

/// Log a freshly minted upcall stub
pub fn log_stub_minted(entry: usize, scope: u64, descriptor: &FunctionDescriptor) {
    use tracing::debug;
    debug!(
        event = "stub_minted",
        entry = %format!("{:#x}", entry),
        scope = scope,
        descriptor = %descriptor,
        "Upcall stub created"
    );
}

/// Log an unrecoverable upcall failure (the process aborts next)
pub fn log_upcall_fatal(scope: u64, message: &str) {
    use tracing::error;
    error!(
        event = "upcall_fatal",
        scope = scope,
        error = message,
        "Fatal error in upcall"
    );
}

/// Log native memory allocation
#[inline]
pub fn log_allocation(size: u64, address: usize) {
    use tracing::trace;
    trace!(
        event = "allocation",
        size_bytes = size,
        address = %format!("{:#x}", address),
        "Native memory allocated"
    );
}

/// Log an arena closing
pub fn log_scope_closed(scope: u64, blocks: usize, cleanups: usize) {
    use tracing::trace;
    trace!(
        event = "scope_closed",
        scope = scope,
        blocks_freed = blocks,
        cleanups_run = cleanups,
        "Arena closed"
    );
}

/// Performance tracking utilities
pub mod perf {
    use super::TRACK_PERFORMANCE;
    use std::sync::atomic::Ordering;
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: TRACK_PERFORMANCE
                .load(Ordering::Relaxed)
                .then(Instant::now),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Option<Instant>,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            if let Some(start) = self.start {
                debug!(
                    event = "perf",
                    operation = self.operation,
                    duration_us = start.elapsed().as_micros() as u64,
                    "operation completed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.file_output);

        let perf_config = LogConfig::performance();
        assert_eq!(perf_config.level, Level::ERROR);
        assert!(!perf_config.track_performance);

        let debug_config = LogConfig::debug();
        assert_eq!(debug_config.level, Level::TRACE);
    }

    #[test]
    fn test_config_from_lookup() {
        let config = LogConfig::from_lookup(|key| match key {
            "TYPTHON_LINK_LOG_LEVEL" => Some("Debug".to_string()),
            "TYPTHON_LINK_LOG_FILE" => Some("/tmp/link.log".to_string()),
            "TYPTHON_LINK_LOG_JSON" => Some(String::new()),
            "TYPTHON_LINK_LOG_PERF" => Some("true".to_string()),
            _ => None,
        });
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.file_output);
        assert_eq!(config.log_path.as_deref(), Some("/tmp/link.log"));
        assert!(config.json_format);
        assert!(!config.show_spans);
        assert!(config.track_performance);

        assert_eq!(parse_level("loud"), Level::INFO);
    }

    #[test]
    fn test_init_idempotent() {
        init_with_config(LogConfig::performance());
        init(); // Should not panic
        assert!(is_initialized());
        let _guard = perf::track("test");
    }
}
