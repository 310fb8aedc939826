//! Diagnostic logging for hosts embedding the bridge
//!
//! The `[logging]` table of [`BridgeConfig`](crate::config::BridgeConfig)
//! sets the level for this crate's targets and the output format. A
//! `RUST_LOG` directive set in the environment replaces the configured level.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::error::{BridgeError, Result};

const TARGET: &str = "rvoip_erlang_bridge";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`
    pub level: String,
    pub json: bool,
    /// Also report listener spans opening and closing
    pub spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level> {
        parse_log_level(&self.level)
    }

    fn filter(&self) -> Result<EnvFilter> {
        let level = self.level()?;
        Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", TARGET, level.to_string().to_lowercase()))))
    }
}

/// Install the global subscriber
///
/// Returns `Ok(false)` when the host already installed one; the bridge then
/// logs through that.
pub fn setup_logging(config: &LoggingConfig) -> Result<bool> {
    let spans = if config.spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter()?)
        .with_span_events(spans);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    Ok(installed.is_ok())
}

pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| BridgeError::config(format!("Invalid log level: {}", level)))
}
