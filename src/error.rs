// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Two families of errors flow through the engine:
// - EngineError: fatal or cancellation, aborts the operation with no result
// - SoftError: recoverable, batched into the report's side list
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

// ----------------------------------------------------------------------------
// Core Engine Errors
// ----------------------------------------------------------------------------

/// Fatal and cancellation errors. Every variant carries enough context
/// (stage, file, line) to diagnose the failure without a backtrace.
#[derive(Error, Debug)]
pub enum EngineError {
    // ---- I/O Errors ----
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read header {}: file is empty", .path.display())]
    MissingHeader { path: PathBuf },

    #[error("write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    // ---- Structural Errors ----
    #[error("{}:{line}: record has {found} columns, schema requires {expected}", .path.display())]
    ShortRecord {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("{}:{line}: decode panels of dashboard '{uid}': {source}", .path.display())]
    PanelDecode {
        path: PathBuf,
        line: u64,
        uid: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode panels of dashboard '{uid}': {source}")]
    PanelEncode {
        uid: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{}:{line}: parse eval-duration '{value}': {reason}", .path.display())]
    EvalDuration {
        path: PathBuf,
        line: u64,
        value: String,
        reason: String,
    },

    #[error("{}:{line}: unknown rule type '{value}'", .path.display())]
    UnknownRuleKind { path: PathBuf, line: u64, value: String },

    // ---- Cancellation ----
    #[error("cancelled during {stage}")]
    Cancelled { stage: &'static str },

    // ---- Orchestration Errors ----
    #[error("analysis requires the {snapshot} snapshot but none was supplied")]
    MissingSnapshot { snapshot: &'static str },

    #[error("loader task for {snapshot} failed: {source}")]
    Task {
        snapshot: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Cannot open, read or write a snapshot
    Io,
    /// Snapshot content is corrupt
    Structural,
    /// Deadline or explicit cancel observed
    Cancelled,
    /// Invalid configuration
    Configuration,
    /// Orchestration failure
    Internal,
}

impl EngineError {
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        EngineError::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn cancelled(stage: &'static str) -> Self {
        EngineError::Cancelled { stage }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Io { .. } | EngineError::MissingHeader { .. } | EngineError::Write { .. } => {
                ErrorKind::Io
            }
            EngineError::ShortRecord { .. }
            | EngineError::PanelDecode { .. }
            | EngineError::PanelEncode { .. }
            | EngineError::EvalDuration { .. }
            | EngineError::UnknownRuleKind { .. } => ErrorKind::Structural,
            EngineError::Cancelled { .. } => ErrorKind::Cancelled,
            EngineError::Config(_) => ErrorKind::Configuration,
            EngineError::MissingSnapshot { .. } | EngineError::Task { .. } | EngineError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Io => "io",
            ErrorKind::Structural => "structural",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// PromQL Parse Errors
// ----------------------------------------------------------------------------

/// A query expression failed to lex or parse. `position` is the byte offset
/// into the expression after placeholder substitution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("parse error at char {position}: {message}")]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Recoverable Errors
// ----------------------------------------------------------------------------

/// Where a failing query came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOrigin {
    Rule { group: String, name: String },
    Panel { board_uid: String, panel_id: u64 },
}

impl Display for QueryOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            QueryOrigin::Rule { group, name } => write!(f, "rule {group}/{name}"),
            QueryOrigin::Panel { board_uid, panel_id } => {
                write!(f, "dashboard {board_uid} panel {panel_id}")
            }
        }
    }
}

/// Recoverable per-record failures. They never abort an analysis.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SoftError {
    #[error("parse expr of {origin}: {source}")]
    QueryParse {
        origin: QueryOrigin,
        query: String,
        #[source]
        source: ParseError,
    },

    #[error("{}:{line}: skipped malformed record: {message}", .path.display())]
    MalformedRecord { path: PathBuf, line: u64, message: String },
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

// ============================================================================
// TESTS
// ============================================================================
