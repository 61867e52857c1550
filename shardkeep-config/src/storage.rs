use serde::{Deserialize, Serialize};
use std::env;

/// Selects and configures the `MessageStorage`/`RunnerStorage` backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Storage {
    /// Which backend to use.
    ///
    /// _Default:_ `memory`
    #[serde(default)]
    pub backend: Backend,

    /// Postgres connection string for the `sql` backend.
    pub database_url: Option<String>,

    /// Prefix applied to the `runners`, `locks`, `requests` and `replies`
    /// tables.
    ///
    /// _Default:_ `shardkeep`
    #[serde(default = "Storage::table_prefix")]
    pub table_prefix: String,

    /// Maximum number of pooled SQL connections.
    ///
    /// _Default:_ `10`
    #[serde(default = "Storage::pool_size")]
    pub pool_size: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Sql,
}

impl std::str::FromStr for Backend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "sql" => Ok(Backend::Sql),
            _ => Err(()),
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            database_url: Self::database_url(),
            table_prefix: Self::table_prefix(),
            pool_size: Self::pool_size(),
        }
    }
}

impl Storage {
    fn env_or_default<T: std::str::FromStr>(env_var: &str, default: T) -> T {
        env::var(env_var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn env_string_or_default(env_var: &str, default: &str) -> String {
        env::var(env_var).unwrap_or_else(|_| default.to_string())
    }

    fn database_url() -> Option<String> {
        env::var("SHARDKEEP_DATABASE_URL").ok().filter(|s| !s.is_empty())
    }

    fn table_prefix() -> String {
        Self::env_string_or_default("SHARDKEEP_TABLE_PREFIX", "shardkeep")
    }

    fn pool_size() -> u32 {
        Self::env_or_default("SHARDKEEP_STORAGE_POOL_SIZE", 10)
    }

    pub fn requests_table(&self) -> String {
        format!("{}_requests", self.table_prefix)
    }

    pub fn replies_table(&self) -> String {
        format!("{}_replies", self.table_prefix)
    }

    pub fn runners_table(&self) -> String {
        format!("{}_runners", self.table_prefix)
    }

    pub fn locks_table(&self) -> String {
        format!("{}_locks", self.table_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        let storage = Storage {
            table_prefix: "sk".into(),
            ..Storage::default()
        };
        assert_eq!(storage.requests_table(), "sk_requests");
        assert_eq!(storage.replies_table(), "sk_replies");
        assert_eq!(storage.runners_table(), "sk_runners");
        assert_eq!(storage.locks_table(), "sk_locks");
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("sql".parse::<Backend>().unwrap(), Backend::Sql);
        assert_eq!("memory".parse::<Backend>().unwrap(), Backend::Memory);
        assert!("bogus".parse::<Backend>().is_err());
    }

    #[test]
    fn test_default_serializable() {
        toml::to_string(&Storage::default()).unwrap();
    }
}
