// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults and fixed schema values shared by the loaders, the extractor and
// the command-line layer.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "noctua-engine";
pub const ENGINE_FULL_NAME: &str = "Noctua Reconciliation Engine";

// ----------------------------------------------------------------------------
// Snapshot Files
// ----------------------------------------------------------------------------

pub const DEFAULT_RULES_FILE: &str = "rules.csv";
pub const DEFAULT_METRICS_FILE: &str = "metrics.csv";
pub const DEFAULT_DASHBOARDS_FILE: &str = "dashboards.csv";

/// Header of `metrics.csv`
pub const METRICS_HEADER: [&str; 1] = ["name"];

/// Header of `rules.csv`
pub const RULES_HEADER: [&str; 7] = ["group", "type", "name", "query", "labels", "evalTime", "lastEval"];

/// Header of `dashboards.csv`
pub const DASHBOARDS_HEADER: [&str; 3] = ["uid", "title", "panels"];

// ----------------------------------------------------------------------------
// Limits & Batching
// ----------------------------------------------------------------------------

/// Rows buffered by the CSV writer between flushes
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default maximum result cardinality of every analysis
pub const DEFAULT_LIMIT: usize = 10;

/// Default deadline for one invocation (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

// ----------------------------------------------------------------------------
// PromQL
// ----------------------------------------------------------------------------

/// Reserved label carrying the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Token grammar of a metric name
pub const METRIC_NAME_PATTERN: &str = r"^[a-zA-Z_:][a-zA-Z0-9_:]*$";

/// Bracketed range whose duration is a template variable, e.g. `[$window]`
pub const VARIABLE_RANGE_PATTERN: &str = r"\[\$?\w+?\]";

/// Bracketed subquery whose range/step are template variables, e.g. `[$a:$b]`
pub const VARIABLE_SUBQUERY_PATTERN: &str = r"\[\$?\w+:\$?\w+?\]";

pub const DEFAULT_RANGE_LITERAL: &str = "[5m]";
pub const DEFAULT_SUBQUERY_LITERAL: &str = "[5m:1m]";

/// Dashboard template placeholders and the literal each is replaced with.
/// Earlier entries win when two placeholders start at the same offset.
pub const DEFAULT_SUBSTITUTIONS: [(&str, &str); 8] = [
    ("$__interval", "5m"),
    ("$interval", "5m"),
    ("$resolution", "5s"),
    ("$__rate_interval", "15s"),
    ("$rate_interval", "15s"),
    ("$__range", "1d"),
    ("${__range_s:glob}", "30"),
    ("${__range_s}", "30"),
];
