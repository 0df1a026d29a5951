// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================
// Five bounded scans over the loaded snapshots. Every analysis:
// - loads its sources through the fan-in
// - clamps the limit to the candidate count before slicing
// - records query parse failures as soft errors and keeps scanning
// - returns results in a fully specified order
// ============================================================================

mod idle;
mod missing;
mod slowest;
mod top;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::constants::DEFAULT_LIMIT;
use crate::error::{EngineError, EngineResult, SoftError};
use crate::fanin::{self, Inputs, Snapshots};
use crate::model::{MetricName, RuleKind};
use crate::promql::MetricExtractor;

pub use self::idle::{idle_dashboards, idle_metrics, IdleDashboard};
pub use self::missing::{rules_missing_metrics, RuleMissingMetrics};
pub use self::slowest::{slowest_rules, SlowRule};
pub use self::top::{top_used_metrics, MetricUsage};

// ----------------------------------------------------------------------------
// Shared Types
// ----------------------------------------------------------------------------

/// Bounded result list plus the recoverable errors met on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Report<T> {
    pub items: Vec<T>,
    pub errors: Vec<SoftError>,
}

impl<T> Default for Report<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> Report<T> {
    /// Put load-time soft errors ahead of the analysis' own.
    fn after_load(mut self, mut load_errors: Vec<SoftError>) -> Self {
        load_errors.append(&mut self.errors);
        self.errors = load_errors;
        self
    }
}

/// Which rule names satisfy a dashboard reference in idle-dashboard scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuleNamePolicy {
    /// Every rule name, recording or alerting
    #[default]
    All,
    /// Only recording rules, since alerting rules produce no series
    Recording,
}

impl RuleNamePolicy {
    pub fn admits(&self, kind: RuleKind) -> bool {
        match (self, kind) {
            (RuleNamePolicy::All, RuleKind::Recording | RuleKind::Alerting) => true,
            (RuleNamePolicy::Recording, RuleKind::Recording) => true,
            (RuleNamePolicy::Recording, RuleKind::Alerting) => false,
        }
    }
}

/// Never let a caller-supplied limit exceed the candidate count.
pub fn clamp_limit(limit: usize, candidates: usize) -> usize {
    limit.min(candidates)
}

pub(crate) fn checkpoint(cancel: &CancellationToken) -> EngineResult<()> {
    if cancel.is_cancelled() {
        return Err(EngineError::cancelled("analysis"));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Reconciler
// ----------------------------------------------------------------------------

/// Entry point bundling the extractor, the limit and the rule-name policy.
#[derive(Debug, Clone)]
pub struct Reconciler {
    extractor: Arc<MetricExtractor>,
    limit: usize,
    rule_names: RuleNamePolicy,
}

impl Reconciler {
    pub fn new(extractor: Arc<MetricExtractor>) -> Self {
        Self {
            extractor,
            limit: DEFAULT_LIMIT,
            rule_names: RuleNamePolicy::default(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        let extractor = MetricExtractor::new(&config.extractor)?;
        Ok(Self::new(Arc::new(extractor))
            .with_limit(config.analysis.limit)
            .with_rule_names(config.analysis.rule_names))
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_rule_names(mut self, policy: RuleNamePolicy) -> Self {
        self.rule_names = policy;
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn extractor(&self) -> &MetricExtractor {
        &self.extractor
    }

    /// Rules whose query references metrics absent from the metrics snapshot.
    pub async fn rules_missing_metrics(
        &self,
        inputs: Inputs,
        cancel: &CancellationToken,
    ) -> EngineResult<Report<RuleMissingMetrics>> {
        let mut snapshots = fanin::load(inputs, cancel).await?;
        let report = rules_missing_metrics(
            &self.extractor,
            snapshots.rules()?,
            snapshots.metrics()?,
            self.limit,
            cancel,
        )?;
        Ok(finish("rules-missing-metrics", report, &mut snapshots))
    }

    /// Dashboards referencing identifiers that are neither metrics nor admitted rule names.
    pub async fn idle_dashboards(
        &self,
        inputs: Inputs,
        cancel: &CancellationToken,
    ) -> EngineResult<Report<IdleDashboard>> {
        let mut snapshots = fanin::load(inputs, cancel).await?;
        let report = idle_dashboards(
            &self.extractor,
            snapshots.dashboards()?,
            snapshots.metrics()?,
            snapshots.rules()?,
            self.rule_names,
            self.limit,
            cancel,
        )?;
        Ok(finish("idle-dashboards", report, &mut snapshots))
    }

    /// Known metrics no rule or dashboard consults, sorted by name.
    pub async fn idle_metrics(&self, inputs: Inputs, cancel: &CancellationToken) -> EngineResult<Report<MetricName>> {
        let mut snapshots = fanin::load(inputs, cancel).await?;
        let report = idle_metrics(
            &self.extractor,
            snapshots.rules()?,
            snapshots.dashboards()?,
            snapshots.metrics()?,
            self.limit,
            cancel,
        )?;
        Ok(finish("idle-metrics", report, &mut snapshots))
    }

    /// Metrics most referenced by dashboard panel targets.
    pub async fn top_used_metrics(
        &self,
        inputs: Inputs,
        cancel: &CancellationToken,
    ) -> EngineResult<Report<MetricUsage>> {
        let mut snapshots = fanin::load(inputs, cancel).await?;
        let report = top_used_metrics(&self.extractor, snapshots.dashboards()?, self.limit, cancel)?;
        Ok(finish("top-used-metrics", report, &mut snapshots))
    }

    /// Rules with the longest evaluation time.
    pub async fn slowest_rules(&self, inputs: Inputs, cancel: &CancellationToken) -> EngineResult<Report<SlowRule>> {
        let mut snapshots = fanin::load(inputs, cancel).await?;
        let report = slowest_rules(snapshots.rules()?, self.limit, cancel)?;
        Ok(finish("slowest-rules", report, &mut snapshots))
    }
}

fn finish<T>(analysis: &'static str, report: Report<T>, snapshots: &mut Snapshots) -> Report<T> {
    let report = report.after_load(snapshots.take_soft_errors());
    info!(
        target: "noctua::analysis",
        analysis,
        total = report.items.len(),
        err_count = report.errors.len(),
        "analysis complete"
    );
    report
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 5, 0)]
    #[case(3, 5, 3)]
    #[case(10, 5, 5)]
    #[case(usize::MAX, 0, 0)]
    fn test_clamp_limit(#[case] limit: usize, #[case] candidates: usize, #[case] expected: usize) {
        assert_eq!(clamp_limit(limit, candidates), expected);
    }

    #[test]
    fn test_rule_name_policy() {
        assert!(RuleNamePolicy::All.admits(RuleKind::Alerting));
        assert!(RuleNamePolicy::All.admits(RuleKind::Recording));
        assert!(RuleNamePolicy::Recording.admits(RuleKind::Recording));
        assert!(!RuleNamePolicy::Recording.admits(RuleKind::Alerting));
    }

    #[test]
    fn test_load_errors_come_first() {
        let load = SoftError::MalformedRecord {
            path: "m.csv".into(),
            line: 2,
            message: "x".into(),
        };
        let own = SoftError::MalformedRecord {
            path: "r.csv".into(),
            line: 3,
            message: "y".into(),
        };
        let report: Report<()> = Report {
            items: vec![],
            errors: vec![own.clone()],
        };
        let merged = report.after_load(vec![load.clone()]);
        assert_eq!(merged.errors, vec![load, own]);
    }
}
