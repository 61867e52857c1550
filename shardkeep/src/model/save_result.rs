use super::reply::Reply;

/// Result of `MessageStorage::save_request`.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveResult {
    /// First sight of this primary key.
    Success,
    /// The primary key already has an outstanding request; the caller should
    /// attach to `original_id`'s reply stream instead of executing again.
    Duplicate {
        original_id: i64,
        last_reply: Option<Reply>,
    },
}

impl SaveResult {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, SaveResult::Duplicate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_duplicate() {
        assert!(!SaveResult::Success.is_duplicate());
        assert!(SaveResult::Duplicate {
            original_id: 1,
            last_reply: None,
        }
        .is_duplicate());
    }
}
