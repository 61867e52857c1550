use serde::{Deserialize, Serialize};

use super::entity_address::EntityAddress;

/// Collapses duplicate requests to a single execution: two requests with an
/// equal primary key share the original request's reply stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PrimaryKey {
    pub entity_type: String,
    pub entity_id: String,
    pub tag: String,
    pub key: String,
}

impl PrimaryKey {
    pub fn new(address: &EntityAddress, tag: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity_type: address.entity_type.clone(),
            entity_id: address.entity_id.clone(),
            tag: tag.into(),
            key: key.into(),
        }
    }
}
