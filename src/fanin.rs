// ============================================================================
// CONCURRENT FAN-IN LOADER
// ============================================================================
// Loads the snapshot sources an analysis needs, one blocking task per source,
// all under one child cancellation scope:
// - first fatal error cancels the scope, the rest are drained and dropped
// - soft errors are merged after every task finished, in the fixed order
//   metrics, rules, dashboards
// ============================================================================

use std::path::{Path, PathBuf};

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SnapshotsConfig;
use crate::error::{EngineError, EngineResult, SoftError};
use crate::model::{Board, MetricSet, Rule};
use crate::snapshot::{self, Loaded};

// ----------------------------------------------------------------------------
// Inputs
// ----------------------------------------------------------------------------

/// A snapshot source: a file to load, or a collection the caller already has.
#[derive(Debug, Clone)]
pub enum Source<T> {
    File(PathBuf),
    Loaded(T),
}

impl<T> Source<T> {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Source::File(path.into())
    }
}

/// The sources one analysis asks for. Absent sources are not loaded.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    pub metrics: Option<Source<MetricSet>>,
    pub rules: Option<Source<Vec<Rule>>>,
    pub dashboards: Option<Source<Vec<Board>>>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// All three snapshot files from configuration
    pub fn from_config(config: &SnapshotsConfig) -> Self {
        Self::new()
            .with_metrics(Source::file(&config.metrics_file))
            .with_rules(Source::file(&config.rules_file))
            .with_dashboards(Source::file(&config.dashboards_file))
    }

    pub fn with_metrics(mut self, source: Source<MetricSet>) -> Self {
        self.metrics = Some(source);
        self
    }

    pub fn with_rules(mut self, source: Source<Vec<Rule>>) -> Self {
        self.rules = Some(source);
        self
    }

    pub fn with_dashboards(mut self, source: Source<Vec<Board>>) -> Self {
        self.dashboards = Some(source);
        self
    }
}

// ----------------------------------------------------------------------------
// Loaded Snapshots
// ----------------------------------------------------------------------------

/// Every requested source, loaded, plus the merged soft errors.
#[derive(Debug, Default)]
pub struct Snapshots {
    metrics: Option<MetricSet>,
    rules: Option<Vec<Rule>>,
    dashboards: Option<Vec<Board>>,
    soft_errors: Vec<SoftError>,
}

impl Snapshots {
    pub fn metrics(&self) -> EngineResult<&MetricSet> {
        self.metrics
            .as_ref()
            .ok_or(EngineError::MissingSnapshot { snapshot: "metrics" })
    }

    pub fn rules(&self) -> EngineResult<&[Rule]> {
        self.rules
            .as_deref()
            .ok_or(EngineError::MissingSnapshot { snapshot: "rules" })
    }

    pub fn dashboards(&self) -> EngineResult<&[Board]> {
        self.dashboards
            .as_deref()
            .ok_or(EngineError::MissingSnapshot { snapshot: "dashboards" })
    }

    pub fn soft_errors(&self) -> &[SoftError] {
        &self.soft_errors
    }

    pub fn take_soft_errors(&mut self) -> Vec<SoftError> {
        std::mem::take(&mut self.soft_errors)
    }
}

// ----------------------------------------------------------------------------
// Fan-in
// ----------------------------------------------------------------------------

enum Payload {
    Metrics(Loaded<MetricSet>),
    Rules(Loaded<Vec<Rule>>),
    Dashboards(Loaded<Vec<Board>>),
}

enum Failure {
    Engine(EngineError),
    Join(JoinError),
}

type TaskOutput = (&'static str, EngineResult<Payload>);

/// Load every source in `inputs` concurrently.
///
/// Returns the first fatal error observed. Completion order of the loaders
/// never affects the returned collections or the order of soft errors.
pub async fn load(inputs: Inputs, cancel: &CancellationToken) -> EngineResult<Snapshots> {
    if cancel.is_cancelled() {
        return Err(EngineError::cancelled("fan-in"));
    }

    let scope = cancel.child_token();
    let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
    let mut outstanding: Vec<&'static str> = Vec::with_capacity(3);

    if let Some(source) = inputs.metrics {
        spawn(&mut tasks, &mut outstanding, "metrics", &scope, move |token| {
            resolve(source, token, |p, c| snapshot::load_metrics(p, c)).map(Payload::Metrics)
        });
    }
    if let Some(source) = inputs.rules {
        spawn(&mut tasks, &mut outstanding, "rules", &scope, move |token| {
            resolve(source, token, |p, c| snapshot::load_rules(p, c)).map(Payload::Rules)
        });
    }
    if let Some(source) = inputs.dashboards {
        spawn(&mut tasks, &mut outstanding, "dashboards", &scope, move |token| {
            resolve(source, token, |p, c| snapshot::load_dashboards(p, c)).map(Payload::Dashboards)
        });
    }

    let mut first_failure: Option<Failure> = None;
    let mut metrics = None;
    let mut rules = None;
    let mut dashboards = None;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, result)) => {
                outstanding.retain(|n| *n != name);
                match result {
                    Ok(Payload::Metrics(loaded)) => metrics = Some(loaded),
                    Ok(Payload::Rules(loaded)) => rules = Some(loaded),
                    Ok(Payload::Dashboards(loaded)) => dashboards = Some(loaded),
                    Err(err) if first_failure.is_none() => {
                        warn!(
                            target: "noctua::fanin",
                            snapshot = name,
                            category = err.category(),
                            error = %err,
                            "loader failed, cancelling siblings"
                        );
                        scope.cancel();
                        first_failure = Some(Failure::Engine(err));
                    }
                    Err(err) => {
                        debug!(
                            target: "noctua::fanin",
                            snapshot = name,
                            error = %err,
                            "loader stopped after earlier failure"
                        );
                    }
                }
            }
            Err(join) => {
                if first_failure.is_none() {
                    warn!(target: "noctua::fanin", error = %join, "loader task aborted, cancelling siblings");
                    scope.cancel();
                    first_failure = Some(Failure::Join(join));
                }
            }
        }
    }

    match first_failure {
        Some(Failure::Engine(err)) => return Err(err),
        Some(Failure::Join(source)) => {
            return Err(EngineError::Task {
                snapshot: outstanding.first().copied().unwrap_or("loader"),
                source,
            })
        }
        None => {}
    }

    let mut snapshots = Snapshots::default();
    if let Some(loaded) = metrics {
        snapshots.soft_errors.extend(loaded.soft_errors);
        snapshots.metrics = Some(loaded.value);
    }
    if let Some(loaded) = rules {
        snapshots.soft_errors.extend(loaded.soft_errors);
        snapshots.rules = Some(loaded.value);
    }
    if let Some(loaded) = dashboards {
        snapshots.soft_errors.extend(loaded.soft_errors);
        snapshots.dashboards = Some(loaded.value);
    }

    debug!(target: "noctua::fanin", soft_errors = snapshots.soft_errors.len(), "fan-in complete");
    Ok(snapshots)
}

fn spawn<F>(
    tasks: &mut JoinSet<TaskOutput>,
    outstanding: &mut Vec<&'static str>,
    name: &'static str,
    scope: &CancellationToken,
    job: F,
) where
    F: FnOnce(&CancellationToken) -> EngineResult<Payload> + Send + 'static,
{
    let token = scope.child_token();
    outstanding.push(name);
    debug!(target: "noctua::fanin", snapshot = name, "spawn loader");
    tasks.spawn_blocking(move || (name, job(&token)));
}

fn resolve<T, L>(source: Source<T>, cancel: &CancellationToken, load: L) -> EngineResult<Loaded<T>>
where
    L: FnOnce(&Path, &CancellationToken) -> EngineResult<Loaded<T>>,
{
    match source {
        Source::File(path) => load(&path, cancel),
        Source::Loaded(_) if cancel.is_cancelled() => Err(EngineError::cancelled("fan-in")),
        Source::Loaded(value) => Ok(Loaded::clean(value)),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::{MetricName, RuleKind};
    use std::fs;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_loads_requested_sources_only() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = write(dir.path(), "metrics.csv", "name\nup\n");

        let snapshots = load(Inputs::new().with_metrics(Source::file(metrics)), &CancellationToken::new())
            .await
            .unwrap();

        assert!(snapshots.metrics().unwrap().contains("up"));
        assert!(matches!(
            snapshots.rules().unwrap_err(),
            EngineError::MissingSnapshot { snapshot: "rules" }
        ));
    }

    #[tokio::test]
    async fn test_inline_sources_skip_io() {
        let mut set = MetricSet::default();
        set.insert(MetricName::from("up"));
        let rules = vec![Rule::new("g", RuleKind::Alerting, "A", "up == 0")];

        let inputs = Inputs::new()
            .with_metrics(Source::Loaded(set))
            .with_rules(Source::Loaded(rules.clone()));
        let snapshots = load(inputs, &CancellationToken::new()).await.unwrap();

        assert_eq!(snapshots.rules().unwrap(), rules.as_slice());
        assert!(snapshots.soft_errors().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_error_wins_over_success() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = write(dir.path(), "metrics.csv", "name\nup\n");
        let dashboards = write(dir.path(), "dashboards.csv", "uid,title,panels\nu1,Broken,not-json\n");

        let inputs = Inputs::new()
            .with_metrics(Source::file(metrics))
            .with_dashboards(Source::file(dashboards));
        let err = load(inputs, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, EngineError::PanelDecode { .. }));
        assert_eq!(err.kind(), ErrorKind::Structural);
    }

    #[tokio::test]
    async fn test_soft_errors_merge_in_source_order() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = write(dir.path(), "metrics.csv", "name\nup\na,b\n");
        let rules = write(
            dir.path(),
            "rules.csv",
            "group,type,name,query,labels,evalTime,lastEval\nx\ng,alert,A,up,,0.1,\n",
        );

        let inputs = Inputs::new()
            .with_rules(Source::file(rules.clone()))
            .with_metrics(Source::file(metrics.clone()));
        let snapshots = load(inputs, &CancellationToken::new()).await.unwrap();

        let paths: Vec<_> = snapshots
            .soft_errors()
            .iter()
            .map(|e| match e {
                SoftError::MalformedRecord { path, .. } => path.clone(),
                other => panic!("unexpected soft error: {other}"),
            })
            .collect();
        assert_eq!(paths, vec![metrics, rules]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = load(Inputs::new(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_missing_file_is_io() {
        let inputs = Inputs::new().with_rules(Source::file("/no/such/rules.csv"));
        let err = load(inputs, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
