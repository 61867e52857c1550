use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Settings relevant to the runtime of a single runner process: its own
/// RPC listener, worker threads, logging, and how it reaches the shard
/// manager.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct General {
    /// The IP address of the local network interface the runner will bind to
    /// for its own RPC listener.
    ///
    /// _Default:_ `0.0.0.0`
    #[serde(default = "General::host")]
    pub host: String,

    /// The TCP port the runner will bind to for its own RPC listener.
    ///
    /// _Default:_ `7432`
    #[serde(default = "General::port")]
    pub port: u16,

    /// Number of Tokio worker threads. `0` means use the current-thread runtime.
    ///
    /// _Default:_ `2`
    #[serde(default = "General::workers")]
    pub workers: usize,

    /// Address of the shard manager, as `host:port`. Absent when this process
    /// is itself the shard manager.
    pub shard_manager_address: Option<String>,

    /// The port used for the OpenMetrics HTTP endpoint.
    pub openmetrics_port: Option<u16>,

    /// Log output format.
    ///
    /// _Default:_ `text`
    #[serde(default)]
    pub log_format: LogFormat,

    /// How many times to retry persisting a new assignment map before
    /// degrading the affected runners for this rebalance cycle.
    ///
    /// _Default:_ `3`
    #[serde(default = "General::persist_retry_count")]
    pub persist_retry_count: usize,

    /// Delay between assignment-persistence retries, in milliseconds.
    ///
    /// _Default:_ `250`
    #[serde(default = "General::persist_retry_interval")]
    pub persist_retry_interval: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            host: Self::host(),
            port: Self::port(),
            workers: Self::workers(),
            shard_manager_address: Self::shard_manager_address(),
            openmetrics_port: Self::openmetrics_port(),
            log_format: Self::log_format(),
            persist_retry_count: Self::persist_retry_count(),
            persist_retry_interval: Self::persist_retry_interval(),
        }
    }
}

impl General {
    fn env_or_default<T: std::str::FromStr>(env_var: &str, default: T) -> T {
        env::var(env_var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn env_string_or_default(env_var: &str, default: &str) -> String {
        env::var(env_var).unwrap_or_else(|_| default.to_string())
    }

    fn env_option<T: std::str::FromStr>(env_var: &str) -> Option<T> {
        env::var(env_var).ok().and_then(|v| v.parse().ok())
    }

    fn env_option_string(env_var: &str) -> Option<String> {
        env::var(env_var).ok().filter(|s| !s.is_empty())
    }

    fn env_enum_or_default<T: std::str::FromStr + Default>(env_var: &str) -> T {
        env::var(env_var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    fn host() -> String {
        Self::env_string_or_default("SHARDKEEP_HOST", "0.0.0.0")
    }

    pub fn port() -> u16 {
        Self::env_or_default("SHARDKEEP_PORT", 7432)
    }

    fn workers() -> usize {
        Self::env_or_default("SHARDKEEP_WORKERS", 2)
    }

    fn shard_manager_address() -> Option<String> {
        Self::env_option_string("SHARDKEEP_SHARD_MANAGER_ADDRESS")
    }

    fn openmetrics_port() -> Option<u16> {
        Self::env_option("SHARDKEEP_OPENMETRICS_PORT")
    }

    fn log_format() -> LogFormat {
        Self::env_enum_or_default("SHARDKEEP_LOG_FORMAT")
    }

    fn persist_retry_count() -> usize {
        Self::env_or_default("SHARDKEEP_PERSIST_RETRY_COUNT", 3)
    }

    fn persist_retry_interval() -> u64 {
        Self::env_or_default("SHARDKEEP_PERSIST_RETRY_INTERVAL", 250)
    }

    pub fn persist_retry_interval(&self) -> Duration {
        Duration::from_millis(self.persist_retry_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_host_port() {
        env::set_var("SHARDKEEP_HOST", "192.168.1.1");
        env::set_var("SHARDKEEP_PORT", "9432");

        assert_eq!(General::host(), "192.168.1.1");
        assert_eq!(General::port(), 9432);

        env::remove_var("SHARDKEEP_HOST");
        env::remove_var("SHARDKEEP_PORT");

        assert_eq!(General::host(), "0.0.0.0");
        assert_eq!(General::port(), 7432);
    }

    #[test]
    fn test_env_workers() {
        env::set_var("SHARDKEEP_WORKERS", "8");
        assert_eq!(General::workers(), 8);
        env::remove_var("SHARDKEEP_WORKERS");
        assert_eq!(General::workers(), 2);
    }

    #[test]
    fn test_env_log_format() {
        env::set_var("SHARDKEEP_LOG_FORMAT", "json");
        assert_eq!(General::log_format(), LogFormat::Json);
        env::remove_var("SHARDKEEP_LOG_FORMAT");
        assert_eq!(General::log_format(), LogFormat::Text);
    }

    #[test]
    fn test_env_invalid_values_fall_back() {
        env::set_var("SHARDKEEP_WORKERS", "not_a_number");
        assert_eq!(General::workers(), 2);
        env::remove_var("SHARDKEEP_WORKERS");
    }

    #[test]
    fn test_default_serializable() {
        let general = General::default();
        toml::to_string(&general).unwrap();
    }
}
