// ============================================================================
// CLI & COMMAND LINE INTERFACE
// ============================================================================
// Subcommands per analysis plus configuration helpers. Every analysis runs
// under one cancellation token that fires on the configured timeout or on
// Ctrl-C. Text output goes through the logger, JSON output to stdout.
// ============================================================================

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::{IdleDashboard, MetricUsage, Reconciler, Report, RuleMissingMetrics, RuleNamePolicy, SlowRule};
use crate::config::EngineConfig;
use crate::constants::{ENGINE_FULL_NAME, ENGINE_NAME, ENGINE_VERSION};
use crate::error::EngineError;
use crate::fanin::{Inputs, Source};
use crate::logging::{init_logging, LogLevel};
use crate::model::{MetricName, MetricNames};

// ----------------------------------------------------------------------------
// CLI Argument Parser
// ----------------------------------------------------------------------------

/// Noctua CLI
#[derive(Parser, Debug)]
#[command(
    name = "noctua",
    author = "AIOps Team",
    version,
    about = "Cross-reference Prometheus rules, metrics and Grafana dashboards",
    long_about = "Noctua reads CSV snapshots of a monitoring stack (recording and alerting \
                  rules, scraped metric names, dashboard panels) and reports the drift \
                  between what is produced and what is consulted."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "NOCTUA_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(short, long, value_enum, ignore_case = true, env = "NOCTUA_LOG_LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,

    /// Deadline for the whole invocation, e.g. "30s" or "5m"
    #[arg(long, value_parser = humantime::parse_duration, global = true)]
    pub timeout: Option<Duration>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One log event per finding plus a summary
    Text,
    /// A single JSON document on stdout
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Rule analyses
    Rules {
        #[command(subcommand)]
        action: RulesCommands,
    },

    /// Dashboard analyses
    Dashboards {
        #[command(subcommand)]
        action: DashboardsCommands,
    },

    /// Metric analyses
    Metrics {
        #[command(subcommand)]
        action: MetricsCommands,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

#[derive(Subcommand, Debug)]
pub enum RulesCommands {
    /// Rules whose query references metrics that are not scraped
    Missing {
        #[arg(long)]
        rules_file: Option<PathBuf>,
        #[arg(long)]
        metrics_file: Option<PathBuf>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Rules with the longest evaluation time
    Slowest {
        #[arg(long)]
        rules_file: Option<PathBuf>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum DashboardsCommands {
    /// Dashboards referencing metrics nobody produces
    Idle {
        #[arg(long)]
        rules_file: Option<PathBuf>,
        #[arg(long)]
        metrics_file: Option<PathBuf>,
        #[arg(long)]
        dashboards_file: Option<PathBuf>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Which rule names count as produced series
        #[arg(long, value_enum)]
        rule_names: Option<RuleNamePolicy>,
    },

    /// Metrics most referenced by dashboard panels
    Top {
        #[arg(long)]
        dashboards_file: Option<PathBuf>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum MetricsCommands {
    /// Metrics that no rule or dashboard consults
    Idle {
        #[arg(long)]
        rules_file: Option<PathBuf>,
        #[arg(long)]
        metrics_file: Option<PathBuf>,
        #[arg(long)]
        dashboards_file: Option<PathBuf>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

// ----------------------------------------------------------------------------
// Analysis Requests
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    RulesMissingMetrics,
    SlowestRules,
    IdleDashboards,
    TopUsedMetrics,
    IdleMetrics,
}

impl AnalysisKind {
    pub fn name(&self) -> &'static str {
        match self {
            AnalysisKind::RulesMissingMetrics => "rules-missing-metrics",
            AnalysisKind::SlowestRules => "slowest-rules",
            AnalysisKind::IdleDashboards => "idle-dashboards",
            AnalysisKind::TopUsedMetrics => "top-used-metrics",
            AnalysisKind::IdleMetrics => "idle-metrics",
        }
    }

    fn needs(&self) -> (bool, bool, bool) {
        // (metrics, rules, dashboards)
        match self {
            AnalysisKind::RulesMissingMetrics => (true, true, false),
            AnalysisKind::SlowestRules => (false, true, false),
            AnalysisKind::IdleDashboards | AnalysisKind::IdleMetrics => (true, true, true),
            AnalysisKind::TopUsedMetrics => (false, false, true),
        }
    }
}

/// One analysis with its command-line overrides folded into the config.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub kind: AnalysisKind,
    pub config: EngineConfig,
}

impl AnalysisRequest {
    fn inputs(&self) -> Inputs {
        let (metrics, rules, dashboards) = self.kind.needs();
        let files = &self.config.snapshots;
        let mut inputs = Inputs::new();
        if metrics {
            inputs = inputs.with_metrics(Source::file(&files.metrics_file));
        }
        if rules {
            inputs = inputs.with_rules(Source::file(&files.rules_file));
        }
        if dashboards {
            inputs = inputs.with_dashboards(Source::file(&files.dashboards_file));
        }
        inputs
    }
}

#[derive(Debug, Default)]
struct Overrides {
    rules_file: Option<PathBuf>,
    metrics_file: Option<PathBuf>,
    dashboards_file: Option<PathBuf>,
    limit: Option<usize>,
    rule_names: Option<RuleNamePolicy>,
}

impl Overrides {
    fn apply(self, mut config: EngineConfig) -> EngineConfig {
        if let Some(path) = self.rules_file {
            config.snapshots.rules_file = path;
        }
        if let Some(path) = self.metrics_file {
            config.snapshots.metrics_file = path;
        }
        if let Some(path) = self.dashboards_file {
            config.snapshots.dashboards_file = path;
        }
        if let Some(limit) = self.limit {
            config.analysis.limit = limit;
        }
        if let Some(policy) = self.rule_names {
            config.analysis.rule_names = policy;
        }
        config
    }
}

/// Map an analysis subcommand onto a request. `None` for the helper commands.
pub fn analysis_request(command: Commands, config: EngineConfig) -> Option<AnalysisRequest> {
    let (kind, overrides) = match command {
        Commands::Rules {
            action: RulesCommands::Missing {
                rules_file,
                metrics_file,
                limit,
            },
        } => (
            AnalysisKind::RulesMissingMetrics,
            Overrides {
                rules_file,
                metrics_file,
                limit,
                ..Default::default()
            },
        ),
        Commands::Rules {
            action: RulesCommands::Slowest { rules_file, limit },
        } => (
            AnalysisKind::SlowestRules,
            Overrides {
                rules_file,
                limit,
                ..Default::default()
            },
        ),
        Commands::Dashboards {
            action:
                DashboardsCommands::Idle {
                    rules_file,
                    metrics_file,
                    dashboards_file,
                    limit,
                    rule_names,
                },
        } => (
            AnalysisKind::IdleDashboards,
            Overrides {
                rules_file,
                metrics_file,
                dashboards_file,
                limit,
                rule_names,
            },
        ),
        Commands::Dashboards {
            action: DashboardsCommands::Top { dashboards_file, limit },
        } => (
            AnalysisKind::TopUsedMetrics,
            Overrides {
                dashboards_file,
                limit,
                ..Default::default()
            },
        ),
        Commands::Metrics {
            action:
                MetricsCommands::Idle {
                    rules_file,
                    metrics_file,
                    dashboards_file,
                    limit,
                },
        } => (
            AnalysisKind::IdleMetrics,
            Overrides {
                rules_file,
                metrics_file,
                dashboards_file,
                limit,
                ..Default::default()
            },
        ),
        Commands::Validate { .. } | Commands::GenerateConfig { .. } | Commands::Version => return None,
    };

    Some(AnalysisRequest {
        kind,
        config: overrides.apply(config),
    })
}

// ----------------------------------------------------------------------------
// Report Rendering
// ----------------------------------------------------------------------------

/// A result item that can describe itself in a log line.
trait Finding: Serialize {
    fn log_found(&self);
}

fn join_names(names: &MetricNames) -> String {
    names.iter().map(MetricName::as_str).collect::<Vec<_>>().join(",")
}

impl Finding for RuleMissingMetrics {
    fn log_found(&self) {
        info!(
            target: "noctua::cli",
            group = %self.rule.group,
            name = %self.rule.name,
            kind = %self.rule.kind,
            missing_metrics = %join_names(&self.missing_metrics),
            "Found"
        );
    }
}

impl Finding for IdleDashboard {
    fn log_found(&self) {
        info!(
            target: "noctua::cli",
            uid = %self.board.uid,
            title = %self.board.title,
            missing_metrics = %join_names(&self.missing_metrics),
            "Found"
        );
    }
}

impl Finding for MetricName {
    fn log_found(&self) {
        info!(target: "noctua::cli", metric = %self, "Found");
    }
}

impl Finding for MetricUsage {
    fn log_found(&self) {
        info!(target: "noctua::cli", metric = %self.metric, count = self.count, "Found");
    }
}

impl Finding for SlowRule {
    fn log_found(&self) {
        info!(
            target: "noctua::cli",
            group = %self.rule.group,
            name = %self.rule.name,
            kind = %self.rule.kind,
            eval_duration = %humantime::format_duration(self.eval_duration),
            "Found"
        );
    }
}

fn render<T: Finding, W: Write>(
    analysis: &'static str,
    report: &Report<T>,
    format: OutputFormat,
    out: &mut W,
) -> AnyhowResult<()> {
    for err in &report.errors {
        debug!(target: "noctua::cli", analysis, error = %err, "recoverable error");
    }

    match format {
        OutputFormat::Text => {
            for item in &report.items {
                item.log_found();
            }
            info!(
                target: "noctua::cli",
                analysis,
                total = report.items.len(),
                err_count = report.errors.len(),
                "Summary"
            );
        }
        OutputFormat::Json => {
            let doc = json!({
                "analysis": analysis,
                "items": report.items,
                "errors": report.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            });
            serde_json::to_writer_pretty(&mut *out, &doc).context("Failed to encode report")?;
            writeln!(out).context("Failed to write report")?;
        }
    }
    Ok(())
}

/// A finished analysis, not yet rendered.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    RulesMissingMetrics(Report<RuleMissingMetrics>),
    SlowestRules(Report<SlowRule>),
    IdleDashboards(Report<IdleDashboard>),
    TopUsedMetrics(Report<MetricUsage>),
    IdleMetrics(Report<MetricName>),
}

impl Outcome {
    pub fn kind(&self) -> AnalysisKind {
        match self {
            Outcome::RulesMissingMetrics(_) => AnalysisKind::RulesMissingMetrics,
            Outcome::SlowestRules(_) => AnalysisKind::SlowestRules,
            Outcome::IdleDashboards(_) => AnalysisKind::IdleDashboards,
            Outcome::TopUsedMetrics(_) => AnalysisKind::TopUsedMetrics,
            Outcome::IdleMetrics(_) => AnalysisKind::IdleMetrics,
        }
    }

    pub fn render<W: Write>(&self, format: OutputFormat, out: &mut W) -> AnyhowResult<()> {
        let name = self.kind().name();
        match self {
            Outcome::RulesMissingMetrics(report) => render(name, report, format, out),
            Outcome::SlowestRules(report) => render(name, report, format, out),
            Outcome::IdleDashboards(report) => render(name, report, format, out),
            Outcome::TopUsedMetrics(report) => render(name, report, format, out),
            Outcome::IdleMetrics(report) => render(name, report, format, out),
        }
    }
}

/// Run one analysis to completion.
pub async fn analyse(request: AnalysisRequest, cancel: &CancellationToken) -> AnyhowResult<Outcome> {
    let reconciler = Reconciler::from_config(&request.config)?;
    let inputs = request.inputs();
    info!(target: "noctua::cli", analysis = request.kind.name(), limit = reconciler.limit(), "Running analysis");

    let outcome = match request.kind {
        AnalysisKind::RulesMissingMetrics => {
            Outcome::RulesMissingMetrics(reconciler.rules_missing_metrics(inputs, cancel).await?)
        }
        AnalysisKind::SlowestRules => Outcome::SlowestRules(reconciler.slowest_rules(inputs, cancel).await?),
        AnalysisKind::IdleDashboards => Outcome::IdleDashboards(reconciler.idle_dashboards(inputs, cancel).await?),
        AnalysisKind::TopUsedMetrics => Outcome::TopUsedMetrics(reconciler.top_used_metrics(inputs, cancel).await?),
        AnalysisKind::IdleMetrics => Outcome::IdleMetrics(reconciler.idle_metrics(inputs, cancel).await?),
    };
    Ok(outcome)
}

/// Run one analysis and render its report into `out`.
pub async fn execute<W: Write>(
    request: AnalysisRequest,
    format: OutputFormat,
    cancel: &CancellationToken,
    out: &mut W,
) -> AnyhowResult<()> {
    analyse(request, cancel).await?.render(format, out)
}

// ----------------------------------------------------------------------------
// CLI Handler Functions
// ----------------------------------------------------------------------------

/// Parse-independent entry point used by the binary.
pub async fn run(cli: Cli) -> AnyhowResult<()> {
    // Handle subcommands that don't need full initialization
    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Commands::Validate { verbose } => {
            handle_validate(cli.config.as_deref(), *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let mut config = match cli.config.as_deref() {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::load_or_default(None).context("Failed to load configuration")?,
    };

    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.debug {
        config.logging.level = LogLevel::Debug;
    }
    if let Some(timeout) = cli.timeout {
        config.analysis.timeout = timeout;
    }

    init_logging(&config.logging)?;
    info!(target: "noctua::cli", "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let timeout = config.analysis.timeout;
    let Some(request) = analysis_request(cli.command, config) else {
        return Ok(());
    };

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    spawn_cancel_watcher(cancel.clone(), timeout);

    let outcome = analyse(request, &cancel).await.map_err(|e| {
        if e.downcast_ref::<EngineError>().is_some_and(EngineError::is_cancelled) {
            e.context(format!("Analysis aborted (timeout {} or interrupt)", humantime::format_duration(timeout)))
        } else {
            e
        }
    })?;

    outcome.render(cli.format, &mut io::stdout().lock())
}

/// Fire `cancel` on timeout or Ctrl-C, whichever comes first.
fn spawn_cancel_watcher(cancel: CancellationToken, timeout: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    target: "noctua::cli",
                    timeout = %humantime::format_duration(timeout),
                    "Deadline reached, cancelling"
                );
                cancel.cancel();
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(target: "noctua::cli", "Received interrupt, cancelling");
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    });
}

/// Handle the validate subcommand
fn handle_validate(config_path: Option<&Path>, verbose: bool) -> AnyhowResult<()> {
    match config_path {
        Some(path) => println!("Validating configuration file: {}", path.display()),
        None => println!("Validating built-in defaults and environment overrides"),
    }

    match EngineConfig::load_or_default(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Rules snapshot: {}", config.snapshots.rules_file.display());
            println!("  • Metrics snapshot: {}", config.snapshots.metrics_file.display());
            println!("  • Dashboards snapshot: {}", config.snapshots.dashboards_file.display());
            println!("  • Result limit: {}", config.analysis.limit);
            println!("  • Timeout: {}", humantime::format_duration(config.analysis.timeout));
            println!("  • Rule names as satisfiers: {:?}", config.analysis.rule_names);
            println!("  • CSV batch size: {}", config.csv.batch_size);
            println!("  • Placeholder rewrites: {}", config.extractor.substitutions.len());

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(EngineError::Config(e).into())
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)
                .map_err(|e| EngineError::io("write", path, e))?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("🦉 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Package: {}", ENGINE_NAME);
    println!("  • Target OS: {}", std::env::consts::OS);
    println!("  • Target Arch: {}", std::env::consts::ARCH);
}

// ============================================================================
// TESTS
// ============================================================================
