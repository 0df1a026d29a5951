// ----------------------------------------------------------------------------
// Rules Missing Metrics
// ----------------------------------------------------------------------------

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{checkpoint, clamp_limit, Report};
use crate::error::{EngineResult, QueryOrigin, SoftError};
use crate::model::{MetricNames, MetricSet, Rule};
use crate::promql::MetricExtractor;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleMissingMetrics {
    pub rule: Rule,
    pub missing_metrics: MetricNames,
}

/// Scan rules in snapshot order and stop once `limit` offenders were found.
pub fn rules_missing_metrics(
    extractor: &MetricExtractor,
    rules: &[Rule],
    metrics: &MetricSet,
    limit: usize,
    cancel: &CancellationToken,
) -> EngineResult<Report<RuleMissingMetrics>> {
    let limit = clamp_limit(limit, rules.len());
    let mut report = Report::default();

    for rule in rules {
        if report.items.len() >= limit {
            break;
        }
        checkpoint(cancel)?;

        let referenced = match extractor.extract(&rule.query) {
            Ok(names) => names,
            Err(source) => {
                report.errors.push(SoftError::QueryParse {
                    origin: QueryOrigin::Rule {
                        group: rule.group.clone(),
                        name: rule.name.clone(),
                    },
                    query: rule.query.clone(),
                    source,
                });
                continue;
            }
        };

        let missing: MetricNames = referenced.into_iter().filter(|m| !metrics.contains(m)).collect();
        if !missing.is_empty() {
            report.items.push(RuleMissingMetrics {
                rule: rule.clone(),
                missing_metrics: missing,
            });
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractorConfig;
    use crate::model::{MetricName, RuleKind};
    use pretty_assertions::assert_eq;

    fn metrics(names: &[&str]) -> MetricSet {
        names.iter().map(|n| MetricName::from(*n)).collect()
    }

    fn rule(name: &str, query: &str) -> Rule {
        Rule::new("g", RuleKind::Alerting, name, query)
    }

    #[test]
    fn test_reports_only_absent_metrics() {
        let ex = MetricExtractor::new(&ExtractorConfig::default()).unwrap();
        let rules = vec![
            rule("A", "rate(disk_io[5m]) + cpu_usage"),
            rule("B", "mem_usage > 0"),
        ];
        let report = rules_missing_metrics(
            &ex,
            &rules,
            &metrics(&["cpu_usage", "mem_usage"]),
            10,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].rule.name, "A");
        assert_eq!(
            report.items[0].missing_metrics,
            [MetricName::from("disk_io")].into_iter().collect::<MetricNames>()
        );
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_parse_errors_are_soft() {
        let ex = MetricExtractor::new(&ExtractorConfig::default()).unwrap();
        let rules = vec![rule("Broken", "sum(rate(x[5m])"), rule("Ok", "gone_metric")];
        let report = rules_missing_metrics(&ex, &rules, &metrics(&[]), 10, &CancellationToken::new()).unwrap();

        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].rule.name, "Ok");
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            &report.errors[0],
            SoftError::QueryParse { origin: QueryOrigin::Rule { name, .. }, .. } if name == "Broken"
        ));
    }

    #[test]
    fn test_stops_at_limit() {
        let ex = MetricExtractor::new(&ExtractorConfig::default()).unwrap();
        let rules = vec![rule("A", "a"), rule("B", "b"), rule("C", "sum(")];
        let report = rules_missing_metrics(&ex, &rules, &metrics(&[]), 2, &CancellationToken::new()).unwrap();

        let names: Vec<_> = report.items.iter().map(|r| r.rule.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        // the third rule is never parsed
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_cancellation_aborts() {
        let ex = MetricExtractor::new(&ExtractorConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = rules_missing_metrics(&ex, &[rule("A", "a")], &metrics(&[]), 10, &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }
}
