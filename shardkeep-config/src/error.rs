use thiserror::Error;

/// Errors that can occur while loading `shardkeep.toml`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml parse error in \"{path}\": {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl Error {
    pub fn config(path: &str, source: toml::de::Error) -> Self {
        Error::Toml {
            path: path.to_string(),
            source,
        }
    }
}
