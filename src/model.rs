// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// The entities loaded from snapshots. All of them are created fresh per
// invocation and are read-only once loaded.
// ============================================================================

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use ahash::AHashSet;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// Metric Names
// ----------------------------------------------------------------------------

/// An opaque metric identifier. Equality and hashing are exact string match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricName(CompactString);

impl MetricName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(CompactString::new(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for MetricName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for MetricName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for MetricName {
    fn from(s: String) -> Self {
        Self(CompactString::from(s))
    }
}

impl Borrow<str> for MetricName {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

/// Identifiers referenced by one or more queries, ordered for deterministic output.
pub type MetricNames = BTreeSet<MetricName>;

/// The known-metrics universe. Lookup only, never iterated for output without sorting.
pub type MetricSet = AHashSet<MetricName>;

// ----------------------------------------------------------------------------
// Rules
// ----------------------------------------------------------------------------

/// Rule kind. Recording rules materialize new series, alerting rules do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    #[serde(rename = "record")]
    Recording,
    #[serde(rename = "alert")]
    Alerting,
}

impl RuleKind {
    /// Snapshot spelling of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Recording => "record",
            RuleKind::Alerting => "alert",
        }
    }

    pub fn produces_series(&self) -> bool {
        match self {
            RuleKind::Recording => true,
            RuleKind::Alerting => false,
        }
    }
}

impl Display for RuleKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "record" => Ok(RuleKind::Recording),
            "alert" => Ok(RuleKind::Alerting),
            other => Err(other.to_string()),
        }
    }
}

/// A Prometheus recording or alerting rule as captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub group: String,
    pub kind: RuleKind,
    pub name: String,
    pub query: String,
    /// Flattened `key=value,...` label text
    pub labels: String,
    pub eval_duration_secs: f64,
    /// Last evaluation timestamp, kept verbatim
    #[serde(default)]
    pub last_evaluation: String,
}

impl Rule {
    pub fn new(group: impl Into<String>, kind: RuleKind, name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind,
            name: name.into(),
            query: query.into(),
            labels: String::new(),
            eval_duration_secs: 0.0,
            last_evaluation: String::new(),
        }
    }

    pub fn with_labels(mut self, labels: impl Into<String>) -> Self {
        self.labels = labels.into();
        self
    }

    pub fn with_eval_duration(mut self, secs: f64) -> Self {
        self.eval_duration_secs = secs;
        self
    }

    pub fn with_last_evaluation(mut self, last: impl Into<String>) -> Self {
        self.last_evaluation = last.into();
        self
    }
}

/// Flatten a label map into the snapshot's `key=value,...` text, sorted by key.
pub fn render_labels<K, V>(labels: &BTreeMap<K, V>) -> String
where
    K: Display,
    V: Display,
{
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

// ----------------------------------------------------------------------------
// Dashboards
// ----------------------------------------------------------------------------

/// A Grafana dashboard. `uid` is the external identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub uid: String,
    pub title: String,
    #[serde(default)]
    pub panels: Vec<Panel>,
}

impl Board {
    pub fn new(uid: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            title: title.into(),
            panels: Vec::new(),
        }
    }

    pub fn with_panel(mut self, panel: Panel) -> Self {
        self.panels.push(panel);
        self
    }

    pub fn identity(&self) -> BoardRef {
        BoardRef {
            uid: self.uid.clone(),
            title: self.title.clone(),
        }
    }

    /// Every non-empty target expression with the id of its panel, in panel order.
    pub fn expressions(&self) -> impl Iterator<Item = (u64, &str)> + '_ {
        self.panels.iter().flat_map(|panel| {
            panel
                .targets
                .iter()
                .filter(|t| !t.expr.is_empty())
                .map(move |t| (panel.id, t.expr.as_str()))
        })
    }
}

/// Identity of a dashboard in results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoardRef {
    pub uid: String,
    pub title: String,
}

/// One dashboard panel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub panel_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<Target>,
}

impl Panel {
    pub fn new(id: u64, title: impl Into<String>, panel_type: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            panel_type: panel_type.into(),
            targets: Vec::new(),
        }
    }

    pub fn with_target(mut self, expr: impl Into<String>) -> Self {
        self.targets.push(Target::new(expr));
        self
    }
}

/// One query bound to a panel. An empty `expr` means "no query".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expr: String,
}

impl Target {
    pub fn new(expr: impl Into<String>) -> Self {
        Self {
            datasource: None,
            expr: expr.into(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_name_exact_match() {
        let a = MetricName::from("http_requests_total");
        let b = MetricName::from("http_requests_total".to_string());
        let c = MetricName::from("HTTP_requests_total");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = MetricSet::default();
        set.insert(a);
        assert!(set.contains("http_requests_total"));
        assert!(!set.contains("http_requests_total "));
    }

    #[test]
    fn test_rule_kind_round_trip() {
        assert_eq!("record".parse::<RuleKind>(), Ok(RuleKind::Recording));
        assert_eq!("alert".parse::<RuleKind>(), Ok(RuleKind::Alerting));
        assert!("Alert".parse::<RuleKind>().is_err());
        assert!(RuleKind::Recording.produces_series());
        assert!(!RuleKind::Alerting.produces_series());
    }

    #[test]
    fn test_render_labels_sorted() {
        let mut labels = BTreeMap::new();
        labels.insert("team", "infra");
        labels.insert("severity", "page");
        assert_eq!(render_labels(&labels), "severity=page,team=infra");
        assert_eq!(render_labels(&BTreeMap::<String, String>::new()), "");
    }

    #[test]
    fn test_board_expressions_skip_empty_targets() {
        let board = Board::new("u1", "Overview")
            .with_panel(Panel::new(1, "CPU", "timeseries").with_target("up").with_target(""))
            .with_panel(Panel::new(2, "Text", "text"))
            .with_panel(Panel::new(3, "Mem", "stat").with_target("node_memory_Active_bytes"));

        let exprs: Vec<_> = board.expressions().collect();
        assert_eq!(exprs, vec![(1, "up"), (3, "node_memory_Active_bytes")]);
    }

    #[test]
    fn test_panel_json_shape() {
        let raw = r#"[{"id":7,"title":"Load","type":"graph","targets":[{"expr":"node_load1","datasource":{"uid":"prom"}},{}]}]"#;
        let panels: Vec<Panel> = serde_json::from_str(raw).unwrap();
        assert_eq!(panels.len(), 1);
        assert_eq!(panels[0].panel_type, "graph");
        assert_eq!(panels[0].targets[0].expr, "node_load1");
        assert!(panels[0].targets[0].datasource.is_some());
        assert_eq!(panels[0].targets[1].expr, "");
    }
}
