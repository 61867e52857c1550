use thiserror::Error;

use crate::storage;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error("io error talking to {peer}: {source}")]
    Io {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("entity {0} is not assigned to this runner")]
    EntityNotAssignedToRunner(String),

    #[error("entity type {0} is not registered on this runner")]
    EntityNotManagedByRunner(String),

    #[error("mailbox for {0} is full")]
    MailboxFull(String),

    #[error("request {0} is already being processed")]
    AlreadyProcessingMessage(i64),

    #[error("runner {0} is unavailable")]
    RunnerUnavailable(String),
}

impl Error {
    pub fn io(peer: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            peer: peer.into(),
            source,
        }
    }
}
