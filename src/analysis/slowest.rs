// ----------------------------------------------------------------------------
// Slowest Rules
// ----------------------------------------------------------------------------

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{checkpoint, clamp_limit, Report};
use crate::error::EngineResult;
use crate::model::Rule;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowRule {
    pub rule: Rule,
    #[serde(with = "humantime_serde")]
    pub eval_duration: Duration,
}

fn as_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 { Duration::MAX } else { Duration::ZERO })
}

/// Rules ordered by evaluation time descending, then name ascending.
pub fn slowest_rules(rules: &[Rule], limit: usize, cancel: &CancellationToken) -> EngineResult<Report<SlowRule>> {
    checkpoint(cancel)?;

    let mut ranked: Vec<&Rule> = rules.iter().collect();
    // +0.0 so that -0 and 0 tie
    ranked.sort_by(|a, b| {
        (b.eval_duration_secs + 0.0)
            .total_cmp(&(a.eval_duration_secs + 0.0))
            .then_with(|| a.name.cmp(&b.name))
    });

    let limit = clamp_limit(limit, ranked.len());
    let items = ranked
        .into_iter()
        .take(limit)
        .map(|rule| SlowRule {
            rule: rule.clone(),
            eval_duration: as_duration(rule.eval_duration_secs),
        })
        .collect();

    Ok(Report {
        items,
        errors: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuleKind;
    use pretty_assertions::assert_eq;

    fn rule(name: &str, secs: f64) -> Rule {
        Rule::new("g", RuleKind::Recording, name, "up").with_eval_duration(secs)
    }

    #[test]
    fn test_descending_with_name_tie_break() {
        let rules = vec![rule("b", 0.5), rule("c", 2.0), rule("a", 0.5), rule("d", 0.01)];
        let report = slowest_rules(&rules, 3, &CancellationToken::new()).unwrap();
        let names: Vec<_> = report.items.iter().map(|s| s.rule.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(report.items[0].eval_duration, Duration::from_secs(2));
    }

    #[test]
    fn test_signed_zeros_tie_on_name() {
        let rules = vec![rule("b", 0.0), rule("a", -0.0), rule("c", 0.1)];
        let report = slowest_rules(&rules, 10, &CancellationToken::new()).unwrap();
        let names: Vec<_> = report.items.iter().map(|s| s.rule.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_limit_bounds() {
        let rules = vec![rule("a", 1.0), rule("b", 2.0)];
        let cancel = CancellationToken::new();
        assert!(slowest_rules(&rules, 0, &cancel).unwrap().items.is_empty());
        assert_eq!(slowest_rules(&rules, 100, &cancel).unwrap().items.len(), 2);
    }

    #[test]
    fn test_out_of_range_durations_do_not_panic() {
        assert_eq!(as_duration(-1.0), Duration::ZERO);
        assert_eq!(as_duration(f64::NAN), Duration::ZERO);
        assert_eq!(as_duration(f64::INFINITY), Duration::MAX);
    }
}
