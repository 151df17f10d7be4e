// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging initialisation for processes hosting exports
//!
//! The core only emits `tracing` events. A host calls [`init`] (or
//! [`init_from_config`] with the `[logging]` section of its configuration)
//! once at startup; `RUST_LOG` overrides the configured level.

use std::io;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::FsError;

pub use tracing::Level;

const CRATE_TARGET: &str = "sharefs_core";

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Plaintext,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Plaintext => "plaintext",
            LogFormat::Json => "json",
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [LogFormat::Plaintext, LogFormat::Json]
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| FsError::Config(format!("unknown log format {s:?}, expected plaintext or json")))
    }
}

/// `[logging]` section of the configuration document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for this crate's events; other targets stay at `warn`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level, FsError> {
        self.level
            .parse()
            .map_err(|_| FsError::Config(format!("invalid log level {:?}", self.level)))
    }
}

/// Install a global subscriber writing to stdout.
///
/// Fails if a global subscriber is already installed.
pub fn init(level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(level, format, io::stdout)
}

pub fn init_from_config(config: &LoggingConfig) -> anyhow::Result<()> {
    init(config.level()?, config.format)
}

/// Install a global subscriber writing to `writer`.
pub fn init_with_writer<W>(level: Level, format: LogFormat, writer: W) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,{CRATE_TARGET}={level}")));
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt.json().with_current_span(false))
            .try_init()?,
        LogFormat::Plaintext => tracing_subscriber::registry().with(filter).with(fmt).try_init()?,
    }
    Ok(())
}

/// Route events to the test harness' captured output. Every test may call
/// it; only the first call installs a subscriber.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{CRATE_TARGET}=debug")));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}
