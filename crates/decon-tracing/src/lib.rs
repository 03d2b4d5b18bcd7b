//! Shared tracing configuration for the deconvolution workspace.
//!
//! Library crates only emit `tracing` events and spans. Executables, integration
//! tests and benchmarks install a subscriber through this crate so the log surface
//! looks the same wherever a launcher is driven from.

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::error::Error;
use std::fmt;

#[doc(hidden)]
pub use tracing;
pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Environment variable selecting the preset (`local`, `ci`, `performance`).
pub const ENV_PROFILE: &str = "DECON_TRACING_PROFILE";
/// Environment variable overriding the filter directives.
pub const ENV_DIRECTIVES: &str = "DECON_TRACING_DIRECTIVES";
/// Environment variable selecting the output format (`pretty`, `compact`, `json`).
pub const ENV_FORMAT: &str = "DECON_TRACING_FORMAT";
/// Environment variable toggling per-tile / per-iteration timing spans.
pub const ENV_PERF_TRACING: &str = "DECON_PERF_TRACING";
/// Environment variable holding the minimum duration (µs) a timing span must reach to be logged.
pub const ENV_PERF_THRESHOLD_US: &str = "DECON_PERF_THRESHOLD_US";

/// How the shared subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Explicit filter directives (e.g. `decon_core=debug,info`). Falls back to
    /// `RUST_LOG`, then to [`TracingConfig::default_directive`].
    pub directives: Option<String>,
    /// Directive used when nothing else resolves.
    pub default_directive: String,
    /// Print event targets (module paths).
    pub include_targets: bool,
    /// ANSI colours; disable for log collectors.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Formatter used for the output layer.
    pub output: TracingOutput,
    /// Enables [`performance::PerformanceSpan`] timing output.
    pub enable_performance_tracing: bool,
    /// Spans shorter than this many microseconds are not logged.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Human-oriented output for development machines.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            enable_performance_tracing: cfg!(debug_assertions),
            performance_threshold_us: None,
        }
    }

    /// JSON lines without colour, for CI and log shipping.
    pub fn for_ci() -> Self {
        Self {
            ansi: false,
            output: TracingOutput::Json,
            enable_performance_tracing: false,
            ..Self::for_local()
        }
    }

    /// Verbose timing of staging, iterations and transfers.
    pub fn for_performance() -> Self {
        Self {
            directives: Some("decon_core=debug,decon_backends=debug".to_string()),
            ansi: false,
            span_events: FmtSpan::CLOSE,
            output: TracingOutput::Json,
            enable_performance_tracing: true,
            ..Self::for_local()
        }
    }

    /// Build a configuration from the `DECON_*` environment variables.
    ///
    /// Unknown or malformed values are ignored and the preset value is kept.
    pub fn from_env() -> Self {
        let profile = env::var(ENV_PROFILE)
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            "performance" => Self::for_performance(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var(ENV_DIRECTIVES) {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var(ENV_FORMAT) {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if config.output == TracingOutput::Json {
                    config.ansi = false;
                }
            }
        }

        if let Ok(flag) = env::var(ENV_PERF_TRACING) {
            config.enable_performance_tracing = parse_flag(&flag);
        }

        if let Ok(threshold) = env::var(ENV_PERF_THRESHOLD_US) {
            if let Ok(threshold_us) = threshold.trim().parse::<u64>() {
                config.performance_threshold_us = Some(threshold_us);
            }
        }

        config
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

/// Output format choices for the formatter layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Failure to configure the subscriber.
#[derive(Debug)]
pub enum TracingSetupError {
    /// The directive string could not be parsed.
    InvalidFilter(String),
    /// A global subscriber is already installed.
    SubscriberInit(tracing_subscriber::util::TryInitError),
}

impl fmt::Display for TracingSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TracingSetupError::InvalidFilter(msg) => write!(f, "invalid tracing directive: {msg}"),
            TracingSetupError::SubscriberInit(err) => write!(f, "failed to install global tracing subscriber: {err}"),
        }
    }
}

impl Error for TracingSetupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TracingSetupError::SubscriberInit(err) => Some(err),
            TracingSetupError::InvalidFilter(_) => None,
        }
    }
}

/// Build a subscriber for the given configuration without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.resolve_filter()?;
    let span_events = config.span_events.clone();

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.output {
        TracingOutput::Compact => Box::new(
            tracing_fmt::layer()
                .compact()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Pretty => Box::new(
            tracing_fmt::layer()
                .pretty()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Json => Box::new(
            tracing_fmt::layer()
                .json()
                .with_target(config.include_targets)
                .with_span_events(span_events)
                .with_ansi(false),
        ),
    };

    performance::configure(config.enable_performance_tracing, config.performance_threshold_us);

    Ok(Registry::default().with(layer).with(filter))
}

/// Install the configured subscriber as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?
        .try_init()
        .map_err(TracingSetupError::SubscriberInit)
}

/// Install a test-friendly subscriber once; later calls are no-ops.
pub fn init_test_tracing() {
    let config = TracingConfig {
        ansi: false,
        output: TracingOutput::Compact,
        ..TracingConfig::from_env()
    };
    let _ = init_global_tracing(&config);
}
