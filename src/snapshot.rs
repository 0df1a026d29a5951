// ============================================================================
// SNAPSHOT LOADERS & WRITERS
// ============================================================================
// Typed decoding of the three snapshot kinds on top of the tabular layer.
//
//   metrics.csv     name
//   rules.csv       group,type,name,query,labels,evalTime,lastEval
//   dashboards.csv  uid,title,panels   (panels = JSON array)
//
// Rows narrower than the schema, unknown rule types, bad evaluation times and
// undecodable panel JSON are snapshot corruption and abort the load.
// ============================================================================

use std::io::{Read, Write};
use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::{DASHBOARDS_HEADER, METRICS_HEADER, RULES_HEADER};
use crate::error::{EngineError, EngineResult, SoftError};
use crate::model::{Board, MetricName, MetricSet, Panel, Rule, RuleKind};
use crate::tabular::{BatchWriter, Record, TabularReader};

/// A loaded collection plus the rows that were skipped on the way.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub value: T,
    pub soft_errors: Vec<SoftError>,
}

impl<T> Loaded<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            soft_errors: Vec::new(),
        }
    }
}

fn require_width<R: Read>(reader: &TabularReader<R>, record: &Record, expected: usize) -> EngineResult<()> {
    if record.len() < expected {
        return Err(EngineError::ShortRecord {
            path: reader.path().to_path_buf(),
            line: record.line,
            expected,
            found: record.len(),
        });
    }
    Ok(())
}

fn finish<R: Read, T>(snapshot: &'static str, mut reader: TabularReader<R>, value: T, count: usize) -> Loaded<T> {
    let soft_errors = reader.take_skipped();
    debug!(
        target: "noctua::snapshot",
        snapshot,
        path = %reader.path().display(),
        rows = reader.rows_read(),
        loaded = count,
        skipped = soft_errors.len(),
        "snapshot loaded"
    );
    Loaded { value, soft_errors }
}

// ----------------------------------------------------------------------------
// Metrics
// ----------------------------------------------------------------------------

pub fn load_metrics(path: impl AsRef<Path>, cancel: &CancellationToken) -> EngineResult<Loaded<MetricSet>> {
    read_metrics(TabularReader::open(path)?, cancel)
}

pub fn read_metrics<R: Read>(
    mut reader: TabularReader<R>,
    cancel: &CancellationToken,
) -> EngineResult<Loaded<MetricSet>> {
    let mut metrics = MetricSet::default();
    while let Some(record) = reader.next_record(cancel)? {
        require_width(&reader, &record, METRICS_HEADER.len())?;
        metrics.insert(MetricName::new(record.get(0)));
    }
    let count = metrics.len();
    Ok(finish("metrics", reader, metrics, count))
}

/// Write a metrics snapshot, one name per row in iteration order.
pub fn write_metrics<'a, I>(
    path: impl AsRef<Path>,
    batch_size: usize,
    metrics: I,
    cancel: &CancellationToken,
) -> EngineResult<()>
where
    I: IntoIterator<Item = &'a MetricName>,
{
    write_metrics_to(BatchWriter::create(path, batch_size)?, metrics, cancel).map(drop)
}

pub fn write_metrics_to<'a, W, I>(mut writer: BatchWriter<W>, metrics: I, cancel: &CancellationToken) -> EngineResult<W>
where
    W: Write,
    I: IntoIterator<Item = &'a MetricName>,
{
    writer.write_header(&METRICS_HEADER)?;
    for metric in metrics {
        writer.write_row(cancel, |row| {
            row[0].push_str(metric.as_str());
            Ok(())
        })?;
    }
    writer.finish()
}

// ----------------------------------------------------------------------------
// Rules
// ----------------------------------------------------------------------------

pub fn load_rules(path: impl AsRef<Path>, cancel: &CancellationToken) -> EngineResult<Loaded<Vec<Rule>>> {
    read_rules(TabularReader::open(path)?, cancel)
}

pub fn read_rules<R: Read>(
    mut reader: TabularReader<R>,
    cancel: &CancellationToken,
) -> EngineResult<Loaded<Vec<Rule>>> {
    let mut rules = Vec::new();
    while let Some(record) = reader.next_record(cancel)? {
        require_width(&reader, &record, RULES_HEADER.len())?;
        rules.push(decode_rule(&reader, &record)?);
    }
    let count = rules.len();
    Ok(finish("rules", reader, rules, count))
}

fn decode_rule<R: Read>(reader: &TabularReader<R>, record: &Record) -> EngineResult<Rule> {
    let kind: RuleKind = record.get(1).parse().map_err(|value| EngineError::UnknownRuleKind {
        path: reader.path().to_path_buf(),
        line: record.line,
        value,
    })?;

    let raw = record.get(5);
    let eval_duration_secs = parse_eval_duration(raw).map_err(|reason| EngineError::EvalDuration {
        path: reader.path().to_path_buf(),
        line: record.line,
        value: raw.to_string(),
        reason,
    })?;

    Ok(Rule::new(record.get(0), kind, record.get(2), record.get(3))
        .with_labels(record.get(4))
        .with_eval_duration(eval_duration_secs)
        .with_last_evaluation(record.get(6)))
}

fn parse_eval_duration(raw: &str) -> Result<f64, String> {
    let secs: f64 = raw.trim().parse().map_err(|e: std::num::ParseFloatError| e.to_string())?;
    if !secs.is_finite() {
        return Err("not a finite number".to_string());
    }
    if secs < 0.0 {
        return Err("negative duration".to_string());
    }
    // folds -0 into +0
    Ok(secs + 0.0)
}

pub fn write_rules(
    path: impl AsRef<Path>,
    batch_size: usize,
    rules: &[Rule],
    cancel: &CancellationToken,
) -> EngineResult<()> {
    write_rules_to(BatchWriter::create(path, batch_size)?, rules, cancel).map(drop)
}

pub fn write_rules_to<W: Write>(
    mut writer: BatchWriter<W>,
    rules: &[Rule],
    cancel: &CancellationToken,
) -> EngineResult<W> {
    writer.write_header(&RULES_HEADER)?;
    for rule in rules {
        writer.write_row(cancel, |row| {
            row[0].push_str(&rule.group);
            row[1].push_str(rule.kind.as_str());
            row[2].push_str(&rule.name);
            row[3].push_str(&rule.query);
            row[4].push_str(&rule.labels);
            row[5].push_str(&rule.eval_duration_secs.to_string());
            row[6].push_str(&rule.last_evaluation);
            Ok(())
        })?;
    }
    writer.finish()
}

// ----------------------------------------------------------------------------
// Dashboards
// ----------------------------------------------------------------------------

pub fn load_dashboards(path: impl AsRef<Path>, cancel: &CancellationToken) -> EngineResult<Loaded<Vec<Board>>> {
    read_dashboards(TabularReader::open(path)?, cancel)
}

pub fn read_dashboards<R: Read>(
    mut reader: TabularReader<R>,
    cancel: &CancellationToken,
) -> EngineResult<Loaded<Vec<Board>>> {
    let mut boards = Vec::new();
    while let Some(record) = reader.next_record(cancel)? {
        require_width(&reader, &record, DASHBOARDS_HEADER.len())?;
        let uid = record.get(0);
        let panels: Vec<Panel> = serde_json::from_str(record.get(2)).map_err(|source| EngineError::PanelDecode {
            path: reader.path().to_path_buf(),
            line: record.line,
            uid: uid.to_string(),
            source,
        })?;
        boards.push(Board {
            uid: uid.to_string(),
            title: record.get(1).to_string(),
            panels,
        });
    }
    let count = boards.len();
    Ok(finish("dashboards", reader, boards, count))
}

pub fn write_dashboards(
    path: impl AsRef<Path>,
    batch_size: usize,
    boards: &[Board],
    cancel: &CancellationToken,
) -> EngineResult<()> {
    write_dashboards_to(BatchWriter::create(path, batch_size)?, boards, cancel).map(drop)
}

pub fn write_dashboards_to<W: Write>(
    mut writer: BatchWriter<W>,
    boards: &[Board],
    cancel: &CancellationToken,
) -> EngineResult<W> {
    writer.write_header(&DASHBOARDS_HEADER)?;
    for board in boards {
        writer.write_row(cancel, |row| {
            let panels = serde_json::to_string(&board.panels).map_err(|source| EngineError::PanelEncode {
                uid: board.uid.clone(),
                source,
            })?;
            row[0].push_str(&board.uid);
            row[1].push_str(&board.title);
            row[2].push_str(&panels);
            Ok(())
        })?;
    }
    writer.finish()
}

// ============================================================================
// TESTS
// ============================================================================
