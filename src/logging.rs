// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging to stderr so stdout stays free for reports. RUST_LOG
// overrides the configured level.
// ============================================================================

use std::io;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt as tfmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{EngineError, EngineResult};

// ----------------------------------------------------------------------------
// Levels & Formats
// ----------------------------------------------------------------------------

/// Default verbosity. `RUST_LOG` directives take precedence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    #[value(alias = "warning")]
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Event layout on stderr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

// ----------------------------------------------------------------------------
// Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> EngineResult<()> {
    let level = LevelFilter::from(config.level);
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(
                tfmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
        LogFormat::Compact => tracing::subscriber::set_global_default(
            registry.with(
                tfmt::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            ),
        ),
        LogFormat::Pretty => tracing::subscriber::set_global_default(
            registry.with(
                tfmt::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
    };
    installed.map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "noctua::cli",
        level = %level,
        format = ?config.format,
        "Logging initialized"
    );

    Ok(())
}
