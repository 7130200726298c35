use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "helm_llm" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of the compact human format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from a level name as found in settings. Unknown names fall
    /// back to INFO.
    pub fn from_level_name(level: &str, json: bool) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            json,
            ..Default::default()
        }
    }

    /// The `EnvFilter` directive this config produces when RUST_LOG is unset.
    pub fn directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Counts warn and error events seen since startup.
#[derive(Default)]
pub struct EventCounts {
    warnings: AtomicU64,
    errors: AtomicU64,
}

impl EventCounts {
    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

struct CountingLayer {
    counts: Arc<EventCounts>,
}

impl<S: Subscriber> Layer<S> for CountingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        match *event.metadata().level() {
            Level::WARN => {
                self.counts.warnings.fetch_add(1, Ordering::Relaxed);
            }
            Level::ERROR => {
                self.counts.errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Handle returned by [`init_telemetry`].
pub struct TelemetryGuard {
    directive: String,
    installed: bool,
    counts: Arc<EventCounts>,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
}

impl TelemetryGuard {
    /// The effective filter directive.
    pub fn directive(&self) -> &str {
        &self.directive
    }

    /// False when another global subscriber was already set.
    pub fn installed(&self) -> bool {
        self.installed
    }

    pub fn counts(&self) -> &EventCounts {
        &self.counts
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let counts = Arc::new(EventCounts::default());
    let (env_filter, directive) = match EnvFilter::try_from_default_env() {
        Ok(filter) => {
            let directive = filter.to_string();
            (filter, directive)
        }
        Err(_) => {
            let directive = config.directive();
            (EnvFilter::new(&directive), directive)
        }
    };

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(CountingLayer {
            counts: counts.clone(),
        })
        .try_init()
        .is_ok();

    TelemetryGuard {
        directive,
        installed,
        counts,
        module_levels: Arc::new(RwLock::new(config.module_levels)),
    }
}
