//! Prometheus metrics for the broker.
//!
//! Counters, gauges, and histograms registered once at construction; the
//! registry encodes to the Prometheus text format on demand. Duration
//! histograms additionally keep a bounded in-process sample so the health
//! document can report p50/p95/p99 without a scrape round trip.

use std::collections::HashMap;
use std::sync::Mutex;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Sample window per histogram name for quantile snapshots.
const QUANTILE_WINDOW: usize = 1024;

/// Label set carrying the tool name.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ToolLabels {
    /// The invoked tool: "execute_code", "manage_sessions", ...
    pub tool: String,
}

/// Label set carrying an operation name.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OpLabels {
    /// The operation: "create", "destroy", "list", ...
    pub op: String,
}

/// Label set for database-tier operations.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DbLabels {
    /// The operation: "put", "get", "delete", "list".
    pub op: String,
    /// The tier: "near", "redis", "memory".
    pub tier: String,
}

/// Label set carrying a language id.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LangLabels {
    /// Language id, e.g. "python".
    pub language: String,
}

/// Label set for error counting.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// The error code, e.g. "TIMEOUT", "POLICY_REJECTED".
    pub kind: String,
}

/// Quantile snapshot of one duration histogram.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Quantiles {
    /// Median, in milliseconds.
    pub p50: f64,
    /// 95th percentile, in milliseconds.
    pub p95: f64,
    /// 99th percentile, in milliseconds.
    pub p99: f64,
}

/// The broker's metric surface.
pub struct Metrics {
    registry: Mutex<Registry>,

    /// Tool invocations.
    pub requests_total: Family<ToolLabels, Counter>,
    /// Session lifecycle operations.
    pub session_operations_total: Family<OpLabels, Counter>,
    /// Helper-child operations (spawn, kill).
    pub container_operations_total: Family<OpLabels, Counter>,
    /// Metadata-store tier operations.
    pub database_operations_total: Family<DbLabels, Counter>,
    /// Completed executions by language.
    pub executions_total: Family<LangLabels, Counter>,
    /// Errors surfaced to callers, by code.
    pub errors_total: Family<ErrorLabels, Counter>,

    /// Live (non-terminal) sessions.
    pub active_sessions: Gauge,
    /// Helper ports currently held.
    pub ports_in_use: Gauge,
    /// Execution slots currently free.
    pub execution_slots_free: Gauge,

    /// Tool request duration.
    pub request_duration_ms: Family<ToolLabels, Histogram>,
    /// Execution wall time by language.
    pub execution_duration_ms: Family<LangLabels, Histogram>,

    samples: Mutex<HashMap<&'static str, Vec<f64>>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create and register every metric.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("kiln");

        let requests_total = Family::<ToolLabels, Counter>::default();
        registry.register(
            "requests_total",
            "Total tool invocations",
            requests_total.clone(),
        );

        let session_operations_total = Family::<OpLabels, Counter>::default();
        registry.register(
            "session_operations_total",
            "Session lifecycle operations",
            session_operations_total.clone(),
        );

        let container_operations_total = Family::<OpLabels, Counter>::default();
        registry.register(
            "container_operations_total",
            "Helper child-process operations",
            container_operations_total.clone(),
        );

        let database_operations_total = Family::<DbLabels, Counter>::default();
        registry.register(
            "database_operations_total",
            "Metadata store operations by tier",
            database_operations_total.clone(),
        );

        let executions_total = Family::<LangLabels, Counter>::default();
        registry.register(
            "executions_total",
            "Completed code executions by language",
            executions_total.clone(),
        );

        let errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "errors_total",
            "Errors surfaced to callers by code",
            errors_total.clone(),
        );

        let active_sessions = Gauge::default();
        registry.register(
            "active_sessions",
            "Live sessions across all kinds",
            active_sessions.clone(),
        );

        let ports_in_use = Gauge::default();
        registry.register(
            "ports_in_use",
            "Helper ports currently held",
            ports_in_use.clone(),
        );

        let execution_slots_free = Gauge::default();
        registry.register(
            "execution_slots_free",
            "Free execution slots",
            execution_slots_free.clone(),
        );

        let duration_buckets =
            || Histogram::new([1.0, 5.0, 25.0, 100.0, 500.0, 2_500.0, 10_000.0, 60_000.0, 300_000.0].into_iter());

        let request_duration_ms =
            Family::<ToolLabels, Histogram>::new_with_constructor(duration_buckets);
        registry.register(
            "request_duration_ms",
            "Tool request duration in milliseconds",
            request_duration_ms.clone(),
        );

        let execution_duration_ms =
            Family::<LangLabels, Histogram>::new_with_constructor(duration_buckets);
        registry.register(
            "execution_duration_ms",
            "Execution wall time in milliseconds",
            execution_duration_ms.clone(),
        );

        Self {
            registry: Mutex::new(registry),
            requests_total,
            session_operations_total,
            container_operations_total,
            database_operations_total,
            executions_total,
            errors_total,
            active_sessions,
            ports_in_use,
            execution_slots_free,
            request_duration_ms,
            execution_duration_ms,
            samples: Mutex::new(HashMap::new()),
        }
    }

    /// Record one tool invocation with its duration.
    pub fn record_request(&self, tool: &str, duration_ms: f64) {
        let labels = ToolLabels {
            tool: tool.to_string(),
        };
        self.requests_total.get_or_create(&labels).inc();
        self.request_duration_ms
            .get_or_create(&labels)
            .observe(duration_ms);
        self.push_sample("request_duration_ms", duration_ms);
    }

    /// Record one completed execution with its wall time.
    pub fn record_execution(&self, language: &str, duration_ms: f64) {
        let labels = LangLabels {
            language: language.to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_ms
            .get_or_create(&labels)
            .observe(duration_ms);
        self.push_sample("execution_duration_ms", duration_ms);
    }

    /// Count one surfaced error by code.
    pub fn record_error(&self, kind: &str) {
        self.errors_total
            .get_or_create(&ErrorLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    /// Count one session lifecycle operation.
    pub fn record_session_op(&self, op: &str) {
        self.session_operations_total
            .get_or_create(&OpLabels { op: op.to_string() })
            .inc();
    }

    /// Count one helper-child operation.
    pub fn record_container_op(&self, op: &str) {
        self.container_operations_total
            .get_or_create(&OpLabels { op: op.to_string() })
            .inc();
    }

    /// Count one metadata-store operation.
    pub fn record_db_op(&self, op: &str, tier: &str) {
        self.database_operations_total
            .get_or_create(&DbLabels {
                op: op.to_string(),
                tier: tier.to_string(),
            })
            .inc();
    }

    fn push_sample(&self, name: &'static str, value: f64) {
        let mut samples = self.samples.lock().expect("metrics samples lock poisoned");
        let window = samples.entry(name).or_default();
        if window.len() >= QUANTILE_WINDOW {
            window.remove(0);
        }
        window.push(value);
    }

    /// Quantile snapshot of a duration histogram, when it has samples.
    pub fn quantiles(&self, name: &'static str) -> Option<Quantiles> {
        let samples = self.samples.lock().expect("metrics samples lock poisoned");
        let window = samples.get(name)?;
        if window.is_empty() {
            return None;
        }
        let mut sorted = window.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("durations are finite"));
        let at = |q: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
            sorted[idx]
        };
        Some(Quantiles {
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        })
    }

    /// Encode the registry in the Prometheus text exposition format.
    pub fn export_text(&self) -> String {
        let registry = self.registry.lock().expect("metrics registry lock poisoned");
        let mut out = String::new();
        if let Err(e) = encode(&mut out, &registry) {
            tracing::warn!(error = %e, "metrics encoding failed");
        }
        out
    }
}
