use thiserror::Error;

use crate::{runners, storage};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Runners(#[from] runners::Error),

    #[error(transparent)]
    Storage(#[from] storage::Error),
}
