use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage backend unreachable: {0}")]
    Persistence(String),

    #[error("stored message failed to decode: {0}")]
    Malformed(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
    pub fn is_persistence(&self) -> bool {
        matches!(self, Error::Persistence(_))
    }
}
