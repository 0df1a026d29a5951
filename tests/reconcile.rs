//! End-to-end reconciliation over on-disk snapshots.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use rstest::rstest;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use noctua_engine::config::ExtractorConfig;
use noctua_engine::snapshot::{load_dashboards, write_dashboards, write_metrics, write_rules};
use noctua_engine::{
    Board, EngineError, ErrorKind, Inputs, MetricExtractor, MetricName, MetricNames, Panel, Reconciler, Rule, RuleKind,
    Source,
};

struct Fixture {
    _dir: TempDir,
    metrics: PathBuf,
    rules: PathBuf,
    dashboards: PathBuf,
}

impl Fixture {
    fn new(metrics: &[&str], rules: &[Rule], boards: &[Board]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let paths = Self::paths(dir.path());

        let names: Vec<MetricName> = metrics.iter().map(|m| MetricName::from(*m)).collect();
        write_metrics(&paths.0, 100, &names, &cancel).unwrap();
        write_rules(&paths.1, 100, rules, &cancel).unwrap();
        write_dashboards(&paths.2, 100, boards, &cancel).unwrap();

        Self {
            _dir: dir,
            metrics: paths.0,
            rules: paths.1,
            dashboards: paths.2,
        }
    }

    fn paths(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
        (dir.join("metrics.csv"), dir.join("rules.csv"), dir.join("dashboards.csv"))
    }

    fn all(&self) -> Inputs {
        Inputs::new()
            .with_metrics(Source::file(&self.metrics))
            .with_rules(Source::file(&self.rules))
            .with_dashboards(Source::file(&self.dashboards))
    }
}

fn reconciler(limit: usize) -> Reconciler {
    let extractor = MetricExtractor::new(&ExtractorConfig::default()).unwrap();
    Reconciler::new(Arc::new(extractor)).with_limit(limit)
}

fn names(list: &[&str]) -> MetricNames {
    list.iter().map(|n| MetricName::from(*n)).collect()
}

fn board(uid: &str, exprs: &[&str]) -> Board {
    let panel = exprs.iter().fold(Panel::new(1, "p", "timeseries"), |p, e| p.with_target(*e));
    Board::new(uid, format!("Board {uid}")).with_panel(panel)
}

fn stack() -> Fixture {
    Fixture::new(
        &["cpu_usage", "mem_usage", "disk_free", "net_rx"],
        &[
            Rule::new("node", RuleKind::Alerting, "DiskIO", "rate(disk_io[5m]) + cpu_usage").with_eval_duration(0.2),
            Rule::new("node", RuleKind::Recording, "node:mem:ratio", "mem_usage / 100").with_eval_duration(1.5),
            Rule::new("node", RuleKind::Alerting, "Broken", "sum(rate(x[5m])").with_eval_duration(0.2),
        ],
        &[
            board("u1", &["node:mem:ratio", "cpu_usage"]),
            board("u2", &["rate(foo[$__rate_interval])", "cpu_usage"]),
            board("u3", &["rate("]),
        ],
    )
}

#[tokio::test]
async fn test_rules_missing_metrics_reports_disk_io() {
    let fx = Fixture::new(
        &["cpu_usage", "mem_usage"],
        &[Rule::new("g", RuleKind::Alerting, "A", "rate(disk_io[5m]) + cpu_usage")],
        &[],
    );
    let report = reconciler(10)
        .rules_missing_metrics(
            Inputs::new()
                .with_metrics(Source::file(&fx.metrics))
                .with_rules(Source::file(&fx.rules)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.items.len(), 1);
    assert_eq!(report.items[0].missing_metrics, names(&["disk_io"]));
}

#[tokio::test]
async fn test_idle_dashboards_respect_rule_names() {
    let fx = stack();
    let report = reconciler(10)
        .idle_dashboards(fx.all(), &CancellationToken::new())
        .await
        .unwrap();

    let found: Vec<_> = report
        .items
        .iter()
        .map(|d| (d.board.uid.clone(), d.missing_metrics.clone()))
        .collect();
    assert_eq!(found, vec![("u2".to_string(), names(&["foo"]))]);
    // one unparseable panel
    assert_eq!(report.errors.len(), 1);
}

#[tokio::test]
async fn test_idle_metrics_sorted() {
    let fx = stack();
    let report = reconciler(10).idle_metrics(fx.all(), &CancellationToken::new()).await.unwrap();

    let idle: Vec<_> = report.items.iter().map(MetricName::as_str).collect();
    assert_eq!(idle, vec!["disk_free", "net_rx"]);
    assert_eq!(report.errors.len(), 2);
}

#[tokio::test]
async fn test_top_used_tie_break() {
    let fx = Fixture::new(
        &[],
        &[],
        &[
            board("u1", &["a", "b", "c"]),
            board("u2", &["a + b"]),
            board("u3", &["sum(b)", "rate(a[5m])"]),
        ],
    );
    let report = reconciler(2)
        .top_used_metrics(
            Inputs::new().with_dashboards(Source::file(&fx.dashboards)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let ranked: Vec<_> = report.items.iter().map(|u| (u.metric.as_str(), u.count)).collect();
    assert_eq!(ranked, vec![("a", 3), ("b", 3)]);
}

#[tokio::test]
async fn test_slowest_rules() {
    let fx = stack();
    let report = reconciler(2)
        .slowest_rules(Inputs::new().with_rules(Source::file(&fx.rules)), &CancellationToken::new())
        .await
        .unwrap();

    let ranked: Vec<_> = report.items.iter().map(|s| s.rule.name.as_str()).collect();
    assert_eq!(ranked, vec!["node:mem:ratio", "Broken"]);
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(1000)]
#[tokio::test]
async fn test_limit_bounds_every_analysis(#[case] limit: usize) {
    let fx = stack();
    let rc = reconciler(limit);
    let cancel = CancellationToken::new();

    let missing = rc.rules_missing_metrics(fx.all(), &cancel).await.unwrap();
    let boards = rc.idle_dashboards(fx.all(), &cancel).await.unwrap();
    let idle = rc.idle_metrics(fx.all(), &cancel).await.unwrap();
    let top = rc.top_used_metrics(fx.all(), &cancel).await.unwrap();
    let slow = rc.slowest_rules(fx.all(), &cancel).await.unwrap();

    for len in [missing.items.len(), boards.items.len(), idle.items.len(), top.items.len(), slow.items.len()] {
        assert!(len <= limit);
    }
    if limit == 0 {
        assert!(missing.items.is_empty() && idle.items.is_empty() && slow.items.is_empty());
    }
    if limit == 1000 {
        assert_eq!(slow.items.len(), 3);
        assert_eq!(idle.items.len(), 2);
        assert_eq!(top.items.len(), 3);
        assert_eq!(boards.items.len(), 1);
        assert_eq!(missing.items.len(), 1);
    }
}

#[tokio::test]
async fn test_analyses_are_idempotent() {
    let fx = stack();
    let rc = reconciler(10);
    let cancel = CancellationToken::new();

    let first = rc.top_used_metrics(fx.all(), &cancel).await.unwrap();
    let second = rc.top_used_metrics(fx.all(), &cancel).await.unwrap();
    assert_eq!(first, second);

    let first = rc.idle_metrics(fx.all(), &cancel).await.unwrap();
    let second = rc.idle_metrics(fx.all(), &cancel).await.unwrap();
    assert_eq!(first, second);

    let first = rc.idle_dashboards(fx.all(), &cancel).await.unwrap();
    let second = rc.idle_dashboards(fx.all(), &cancel).await.unwrap();
    assert_eq!(first, second);

    let first = rc.rules_missing_metrics(fx.all(), &cancel).await.unwrap();
    let second = rc.rules_missing_metrics(fx.all(), &cancel).await.unwrap();
    assert_eq!(first, second);

    let first = rc.slowest_rules(fx.all(), &cancel).await.unwrap();
    let second = rc.slowest_rules(fx.all(), &cancel).await.unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_board_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dashboards.csv");
    let cancel = CancellationToken::new();
    let boards = vec![Board::new("u1", "T").with_panel(Panel::default().with_target("up"))];

    write_dashboards(&path, 100, &boards, &cancel).unwrap();
    let loaded = load_dashboards(&path, &cancel).unwrap();
    assert_eq!(loaded.value, boards);
}

#[test]
fn test_template_substitution() {
    let extractor = MetricExtractor::new(&ExtractorConfig::default()).unwrap();
    assert_eq!(extractor.extract("rate(foo[$__rate_interval])").unwrap(), names(&["foo"]));
}

#[tokio::test]
async fn test_fan_in_fault_isolation() {
    let fx = stack();
    fs::write(&fx.dashboards, "uid,title,panels\nu1,Broken,{not json\n").unwrap();

    let err = reconciler(10)
        .idle_metrics(fx.all(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::PanelDecode { .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::Structural);
}

#[tokio::test]
async fn test_cancellation_is_distinct() {
    let fx = stack();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = reconciler(10).idle_metrics(fx.all(), &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn test_inline_collections() {
    let metrics = ["up"].iter().map(|m| MetricName::from(*m)).collect();
    let rules = vec![Rule::new("g", RuleKind::Alerting, "A", "up == 0 or absent(gone)")];

    let report = reconciler(10)
        .rules_missing_metrics(
            Inputs::new()
                .with_metrics(Source::Loaded(metrics))
                .with_rules(Source::Loaded(rules)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.items[0].missing_metrics, names(&["gone"]));
}

#[tokio::test]
async fn test_missing_source_is_reported() {
    let err = reconciler(10)
        .slowest_rules(Inputs::new(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingSnapshot { snapshot: "rules" }));
}
