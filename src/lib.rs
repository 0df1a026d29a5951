//! # Noctua Engine - Monitoring Stack Reconciliation
//!
//! Inventories the artifacts of a Prometheus/Grafana monitoring stack
//! (alerting and recording rules, scraped metric names, dashboard panels) and
//! cross-references them to surface drift between what is produced and what
//! is consulted.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                             NOCTUA ENGINE                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  CSV SNAPSHOTS → LOADERS (fan-in) → IDENTIFIER SETS → ANALYSES → REPORTS    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Analyses
//!
//! - **Rules missing metrics**: rules whose query references unknown metrics
//! - **Idle dashboards**: dashboards referencing metrics nobody produces
//! - **Idle metrics**: metrics no rule or dashboard consults
//! - **Top used metrics**: metrics most referenced by dashboard panels
//! - **Slowest rules**: rules with the longest evaluation time
//!
//! The engine never talks to the network. It consumes flat CSV snapshots (or
//! collections the caller already fetched) and produces bounded result lists
//! plus a side list of recoverable errors.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod analysis;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod fanin;
pub mod logging;
pub mod model;
pub mod promql;
pub mod snapshot;
pub mod tabular;

pub use analysis::{
    IdleDashboard, MetricUsage, Reconciler, Report, RuleMissingMetrics, RuleNamePolicy, SlowRule,
};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, ErrorKind, ParseError, QueryOrigin, SoftError};
pub use fanin::{Inputs, Snapshots, Source};
pub use model::{Board, BoardRef, MetricName, MetricNames, MetricSet, Panel, Rule, RuleKind, Target};
pub use promql::MetricExtractor;
