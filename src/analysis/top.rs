// ----------------------------------------------------------------------------
// Top Used Metrics
// ----------------------------------------------------------------------------

use ahash::AHashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{checkpoint, clamp_limit, Report};
use crate::error::{EngineResult, QueryOrigin, SoftError};
use crate::model::{Board, MetricName};
use crate::promql::MetricExtractor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricUsage {
    pub metric: MetricName,
    /// Panel target expressions referencing the metric
    pub count: usize,
}

/// Rank identifiers by how many panel target expressions reference them.
/// Order: count descending, then name ascending.
pub fn top_used_metrics(
    extractor: &MetricExtractor,
    boards: &[Board],
    limit: usize,
    cancel: &CancellationToken,
) -> EngineResult<Report<MetricUsage>> {
    let mut report = Report::default();
    let mut counts: AHashMap<MetricName, usize> = AHashMap::new();

    for board in boards {
        checkpoint(cancel)?;
        for (panel_id, expr) in board.expressions() {
            match extractor.extract(expr) {
                Ok(names) => {
                    for name in names {
                        *counts.entry(name).or_insert(0) += 1;
                    }
                }
                Err(source) => report.errors.push(SoftError::QueryParse {
                    origin: QueryOrigin::Panel {
                        board_uid: board.uid.clone(),
                        panel_id,
                    },
                    query: expr.to_string(),
                    source,
                }),
            }
        }
    }

    let mut ranked: Vec<MetricUsage> = counts
        .into_iter()
        .map(|(metric, count)| MetricUsage { metric, count })
        .collect();
    ranked.sort_unstable_by(|a, b| b.count.cmp(&a.count).then_with(|| a.metric.cmp(&b.metric)));
    ranked.truncate(clamp_limit(limit, ranked.len()));
    report.items = ranked;

    Ok(report)
}
