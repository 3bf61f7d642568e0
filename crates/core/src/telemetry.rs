// Telemetry Module
//
// Console tracing for the monitor: a registry with an EnvFilter-gated fmt
// layer. Filter comes from RUST_LOG, else LOG_LEVEL applied to the callrelay
// crates.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Crates whose level LOG_LEVEL controls
const CRATE_TARGETS: [&str; 5] = [
    "callrelay",
    "callrelay_core",
    "callrelay_browser",
    "callrelay_notify",
    "callrelay_worker",
];

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for tracing output
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name logged at startup
    pub service_name: String,
    /// Full filter directive (RUST_LOG syntax)
    pub log_filter: Option<String>,
    /// Include the event target in each line
    pub with_target: bool,
    /// Emit ANSI colors
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "callrelay".to_string(),
            log_filter: None,
            with_target: true,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG`: Full filter directive, used as-is
    /// - `LOG_LEVEL`: Level for the callrelay crates (default: info)
    /// - `NO_COLOR`: Disable ANSI colors when set
    pub fn from_env() -> Self {
        let log_filter = std::env::var("RUST_LOG").ok().or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .map(|level| crate_filter(&level))
        });
        Self {
            log_filter,
            ansi: std::env::var_os("NO_COLOR").is_none(),
            ..Default::default()
        }
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }
}

/// Filter directive applying `level` to the callrelay crates and `warn` elsewhere
pub fn crate_filter(level: &str) -> String {
    let level = level.trim().to_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(CRATE_TARGETS.iter().map(|t| format!("{}={}", t, level)));
    directives.join(",")
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the global tracing subscriber
///
/// Calling this more than once logs a warning and keeps the first subscriber.
pub fn init_telemetry(config: TelemetryConfig) {
    let filter = config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new(crate_filter("info")));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_ansi(config.ansi)
        .with_filter(filter);

    if let Err(e) = tracing_subscriber::registry().with(console_layer).try_init() {
        tracing::warn!(error = %e, "Tracing subscriber already initialized");
        return;
    }

    tracing::debug!(service = %config.service_name, "Telemetry initialized");
}
