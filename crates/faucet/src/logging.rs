//! Logging configuration
//!
//! Structured logging for the faucet. `RUST_LOG` overrides the configured
//! level. Reconciliation alerts are emitted under the
//! `faucet::reconciliation` target so they can be filtered or routed on
//! their own.

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::Layered, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Target for events that need manual correction of claim records.
pub const RECONCILIATION_TARGET: &str = "faucet::reconciliation";

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    pub format: LogFormat,

    /// Directory for daily-rolling log files; stdout only when unset
    pub file_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file_dir: None,
        }
    }
}

type Base = Layered<EnvFilter, Registry>;

impl LogConfig {
    /// Initialize the global subscriber.
    ///
    /// Returns a WorkerGuard that must be kept alive for the duration of the
    /// program when file output is enabled.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        let mut layers: Vec<Box<dyn Layer<Base> + Send + Sync>> = Vec::new();
        layers.push(match self.format {
            LogFormat::Json => fmt::layer().json().boxed(),
            LogFormat::Pretty => fmt::layer().boxed(),
        });

        let guard = match &self.file_dir {
            Some(dir) => {
                let file_appender = tracing_appender::rolling::daily(dir, "faucet.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                layers.push(
                    fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(non_blocking)
                        .boxed(),
                );
                Some(guard)
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(layers)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to set subscriber: {}", e))?;

        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file_dir.is_none());
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert!(LogFormat::from_str("invalid").is_err());
    }
}
