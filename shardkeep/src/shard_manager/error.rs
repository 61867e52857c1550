use thiserror::Error;

use crate::storage;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error("runner {0} is not registered")]
    UnknownRunner(String),
}
