//! # Logging
//!
//! Installs the global `tracing` subscriber for the delivery engine.
//!
//! Engine crates log at the configured level, HTTP stack noise is held at
//! `warn`. Events can also be mirrored to a host [`LoggerSink`], in which case
//! credential-bearing fields (tokens, keys, nonces, signed URLs) are scrubbed
//! by [`redact_if_sensitive`] first.
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//! use bridge_traits::time::LogLevel;
//!
//! init_logging(LoggingConfig::default().with_format(LogFormat::Json).with_level(LogLevel::Debug))?;
//! tracing::info!(track_id = "42", "Loading track");
//! ```

use crate::error::{Error, Result};

use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};
use core_async::runtime;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::format::FmtSpan,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer, Registry,
};

const ENGINE_CRATES: &[&str] = &[
    "sealed_audio_workspace",
    "core_runtime",
    "core_auth",
    "core_playback",
    "bridge_desktop",
];

const QUIET_CRATES: &[&str] = &["h2", "hyper", "reqwest", "rustls"];

const REDACTED: &str = "[REDACTED]";

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human readable. Default in debug builds.
    Pretty,
    /// One JSON object per line. Default in release builds.
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

/// Options for [`init_logging`].
#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Level applied to the engine crates.
    pub level: LogLevel,
    /// Scrub credentials from fields forwarded to the host sink.
    pub redact_secrets: bool,
    /// `EnvFilter` directives replacing the engine defaults.
    pub filter: Option<String>,
    pub logger_sink: Option<Arc<dyn LoggerSink>>,
    /// Log span enter/exit (pretty) or the span list (json).
    pub enable_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            redact_secrets: true,
            filter: None,
            logger_sink: None,
            enable_spans: true,
        }
    }
}

impl fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("format", &self.format)
            .field("level", &self.level)
            .field("redact_secrets", &self.redact_secrets)
            .field("filter", &self.filter)
            .field("logger_sink", &self.logger_sink.is_some())
            .field("enable_spans", &self.enable_spans)
            .finish()
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_secret_redaction(mut self, redact: bool) -> Self {
        self.redact_secrets = redact;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    pub fn with_spans(mut self, enable: bool) -> Self {
        self.enable_spans = enable;
        self
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns `Error::Config` if the filter does not parse or a global
/// subscriber is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = build_filter(&config)?;

    let console: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_span_events(if config.enable_spans {
                FmtSpan::ACTIVE
            } else {
                FmtSpan::NONE
            })
            .with_writer(io::stdout)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(config.enable_spans)
            .with_span_list(config.enable_spans)
            .with_writer(io::stdout)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(filter)
        .with(HostSinkLayer {
            sink: config.logger_sink,
            redact: config.redact_secrets,
        })
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = match &config.filter {
        Some(custom) => custom.clone(),
        None => {
            let level = level_str(config.level);
            ENGINE_CRATES
                .iter()
                .map(|name| format!("{}={}", name, level))
                .chain(QUIET_CRATES.iter().map(|name| format!("{}=warn", name)))
                .collect::<Vec<_>>()
                .join(",")
        }
    };

    EnvFilter::try_new(directives).map_err(|e| Error::Config(format!("Invalid log filter: {}", e)))
}

fn level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

// ============================================================================
// Host sink forwarding
// ============================================================================

struct HostSinkLayer {
    sink: Option<Arc<dyn LoggerSink>>,
    redact: bool,
}

impl<S> Layer<S> for HostSinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };

        let metadata = event.metadata();
        let level = match *metadata.level() {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        };
        if level < sink.min_level() {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let message = fields
            .message
            .unwrap_or_else(|| metadata.name().to_string());
        let mut entry = LogEntry::new(level, metadata.target(), message);
        for (key, value) in fields.values {
            let value = if self.redact {
                redact_if_sensitive(&key, &value)
            } else {
                value
            };
            entry = entry.with_field(key, value);
        }
        entry.span_id = ctx.lookup_current().map(|span| span.name().to_string());

        let sink = Arc::clone(sink);
        if let Ok(handle) = runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = sink.log(entry).await {
                    eprintln!("LoggerSink error: {}", err);
                }
            });
            return;
        }

        match runtime::block_on(async move { sink.log(entry).await }) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => eprintln!("LoggerSink error: {}", err),
            Err(err) => eprintln!("LoggerSink runtime error: {}", err),
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: HashMap<String, String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record(field, format!("{:?}", value));
    }
}

impl FieldCollector {
    fn record(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.values.insert(field.name().to_string(), value);
        }
    }
}

// ============================================================================
// Redaction
// ============================================================================

/// Scrub a field value whose name marks it as a credential.
///
/// URL values keep scheme, host and path but lose the query string, where
/// access tokens travel.
pub fn redact_if_sensitive(field_name: &str, value: &str) -> String {
    const SENSITIVE: &[&str] = &[
        "token",
        "key",
        "nonce",
        "secret",
        "authorization",
        "bearer",
        "password",
    ];

    let name = field_name.to_lowercase();
    if SENSITIVE.iter().any(|s| name.contains(s)) {
        REDACTED.to_string()
    } else if name.contains("url") || value.starts_with("http") {
        strip_query(value).to_string()
    } else {
        value.to_string()
    }
}

/// Drop the query string and fragment from a URL.
pub fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as SinkResult;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestLoggerSink {
        entries: Mutex<Vec<LogEntry>>,
    }

    #[async_trait]
    impl LoggerSink for TestLoggerSink {
        async fn log(&self, entry: LogEntry) -> SinkResult<()> {
            self.entries.lock().unwrap().push(entry);
            Ok(())
        }

        fn min_level(&self) -> LogLevel {
            LogLevel::Trace
        }
    }

    fn capture(redact: bool, emit: impl FnOnce()) -> Vec<LogEntry> {
        let sink = Arc::new(TestLoggerSink::default());
        let forward: Arc<dyn LoggerSink> = sink.clone();
        let layer = HostSinkLayer {
            sink: Some(forward),
            redact,
        };
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, emit);
        let entries = sink.entries.lock().unwrap();
        entries.clone()
    }

    #[test]
    fn test_default_filter_covers_engine_crates() {
        let config = LoggingConfig::default().with_level(LogLevel::Debug);
        let rendered = build_filter(&config).unwrap().to_string();
        assert!(rendered.contains("core_playback=debug"));
        assert!(rendered.contains("core_auth=debug"));
        assert!(rendered.contains("reqwest=warn"));
    }

    #[test]
    fn test_custom_filter_replaces_defaults() {
        let config = LoggingConfig::default().with_filter("core_auth=trace");
        let rendered = build_filter(&config).unwrap().to_string();
        assert!(rendered.contains("core_auth=trace"));
        assert!(!rendered.contains("core_playback"));
    }

    #[test]
    fn test_segment_credentials_are_redacted() {
        assert_eq!(redact_if_sensitive("segment_key", "00ff"), REDACTED);
        assert_eq!(redact_if_sensitive("nonce", "0102"), REDACTED);
        assert_eq!(
            redact_if_sensitive("url", "https://cdn.example.com/t/1/3?token=abc"),
            "https://cdn.example.com/t/1/3"
        );
        assert_eq!(strip_query("https://a/b#frag"), "https://a/b");
    }

    #[test]
    fn test_host_sink_receives_event_fields() {
        let entries = capture(false, || {
            tracing::info!(target: "core_playback", track_id = "42", index = 3u64, "segment appended");
        });

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target, "core_playback");
        assert_eq!(entries[0].message, "segment appended");
        assert_eq!(entries[0].fields.get("track_id"), Some(&"42".to_string()));
        assert_eq!(entries[0].fields.get("index"), Some(&"3".to_string()));
    }

    #[test]
    fn test_host_sink_never_sees_tokens() {
        let entries = capture(true, || {
            tracing::warn!(token = "tok-123", index = 4u64, "segment token refreshed");
        });

        assert_eq!(entries[0].fields.get("token"), Some(&REDACTED.to_string()));
        assert_eq!(entries[0].fields.get("index"), Some(&"4".to_string()));
    }
}
