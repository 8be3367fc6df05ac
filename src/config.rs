use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "schoold=info";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Process-level settings read from the environment at startup.
///
/// Per-workspace behaviour (risk thresholds, notification toggles) lives in the
/// workspace `settings` table instead, see `ipc::handlers::setup`.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub log_filter: String,
    pub log_format: LogFormat,
    pub workspace: Option<PathBuf>,
    pub busy_timeout: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_filter = lookup("SCHOOLD_LOG")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let log_format = match lookup("SCHOOLD_LOG_FORMAT")
            .map(|s| s.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => anyhow::bail!("SCHOOLD_LOG_FORMAT must be text or json, got {other}"),
        };
        let workspace = lookup("SCHOOLD_WORKSPACE")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        let busy_timeout_ms = match lookup("SCHOOLD_BUSY_TIMEOUT_MS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("SCHOOLD_BUSY_TIMEOUT_MS is not a number: {raw}"))?,
            None => DEFAULT_BUSY_TIMEOUT_MS,
        };
        Ok(Self {
            log_filter,
            log_format,
            workspace,
            busy_timeout: Duration::from_millis(busy_timeout_ms),
        })
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_format: LogFormat::Text,
            workspace: None,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

/// Logs go to stderr; stdout carries the IPC protocol.
pub fn init_logging(config: &DaemonConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid log filter: {}", config.log_filter))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let result = match config.log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
