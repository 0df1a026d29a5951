// ----------------------------------------------------------------------------
// Idle Dashboards & Idle Metrics
// ----------------------------------------------------------------------------

use ahash::{AHashMap, AHashSet};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{checkpoint, clamp_limit, Report, RuleNamePolicy};
use crate::error::{EngineResult, QueryOrigin, SoftError};
use crate::model::{Board, BoardRef, MetricName, MetricNames, MetricSet, Rule};
use crate::promql::MetricExtractor;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdleDashboard {
    pub board: BoardRef,
    pub missing_metrics: MetricNames,
}

fn panel_error(board: &Board, panel_id: u64, query: &str, source: crate::error::ParseError) -> SoftError {
    SoftError::QueryParse {
        origin: QueryOrigin::Panel {
            board_uid: board.uid.clone(),
            panel_id,
        },
        query: query.to_string(),
        source,
    }
}

/// Rows sharing a uid, keyed by first appearance.
fn group_by_uid(boards: &[Board]) -> Vec<Vec<&Board>> {
    let mut slots: AHashMap<&str, usize> = AHashMap::new();
    let mut groups: Vec<Vec<&Board>> = Vec::new();
    for board in boards {
        match slots.get(board.uid.as_str()) {
            Some(&slot) => groups[slot].push(board),
            None => {
                slots.insert(board.uid.as_str(), groups.len());
                groups.push(vec![board]);
            }
        }
    }
    groups
}

/// Dashboards with at least one unsatisfied reference, in snapshot order.
/// A reference is satisfied by a known metric or an admitted rule name.
/// Rows with the same uid are one dashboard; the first row names it.
pub fn idle_dashboards(
    extractor: &MetricExtractor,
    boards: &[Board],
    metrics: &MetricSet,
    rules: &[Rule],
    policy: RuleNamePolicy,
    limit: usize,
    cancel: &CancellationToken,
) -> EngineResult<Report<IdleDashboard>> {
    let rule_names: AHashSet<&str> = rules
        .iter()
        .filter(|r| policy.admits(r.kind))
        .map(|r| r.name.as_str())
        .collect();

    let groups = group_by_uid(boards);
    let limit = clamp_limit(limit, groups.len());
    let mut report = Report::default();

    for group in &groups {
        if report.items.len() >= limit {
            break;
        }
        checkpoint(cancel)?;

        let mut missing = MetricNames::new();
        for board in group {
            for (panel_id, expr) in board.expressions() {
                match extractor.extract(expr) {
                    Ok(names) => missing.extend(
                        names
                            .into_iter()
                            .filter(|m| !metrics.contains(m) && !rule_names.contains(m.as_str())),
                    ),
                    Err(source) => report.errors.push(panel_error(board, panel_id, expr, source)),
                }
            }
        }

        if !missing.is_empty() {
            report.items.push(IdleDashboard {
                board: group[0].identity(),
                missing_metrics: missing,
            });
        }
    }

    Ok(report)
}

/// Known metrics that no rule query and no panel expression references,
/// sorted by name and truncated to `limit`.
pub fn idle_metrics(
    extractor: &MetricExtractor,
    rules: &[Rule],
    boards: &[Board],
    metrics: &MetricSet,
    limit: usize,
    cancel: &CancellationToken,
) -> EngineResult<Report<MetricName>> {
    let mut report = Report::default();
    let mut used = AHashSet::<MetricName>::new();

    for rule in rules {
        checkpoint(cancel)?;
        match extractor.extract(&rule.query) {
            Ok(names) => used.extend(names),
            Err(source) => report.errors.push(SoftError::QueryParse {
                origin: QueryOrigin::Rule {
                    group: rule.group.clone(),
                    name: rule.name.clone(),
                },
                query: rule.query.clone(),
                source,
            }),
        }
    }

    for board in boards {
        checkpoint(cancel)?;
        for (panel_id, expr) in board.expressions() {
            match extractor.extract(expr) {
                Ok(names) => used.extend(names),
                Err(source) => report.errors.push(panel_error(board, panel_id, expr, source)),
            }
        }
    }

    let mut idle: Vec<MetricName> = metrics.iter().filter(|m| !used.contains(*m)).cloned().collect();
    idle.sort_unstable();
    idle.truncate(clamp_limit(limit, idle.len()));
    report.items = idle;

    Ok(report)
}
