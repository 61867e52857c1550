use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Counters for `MessageStorage` operations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageCounts {
    pub requests_saved: usize,
    pub requests_duplicate: usize,
    pub replies_saved: usize,
    pub replies_rejected_post_exit: usize,
    pub persistence_errors: usize,
    pub persistence_retries: usize,
}

impl Add for StorageCounts {
    type Output = StorageCounts;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            requests_saved: self.requests_saved.saturating_add(rhs.requests_saved),
            requests_duplicate: self.requests_duplicate.saturating_add(rhs.requests_duplicate),
            replies_saved: self.replies_saved.saturating_add(rhs.replies_saved),
            replies_rejected_post_exit: self
                .replies_rejected_post_exit
                .saturating_add(rhs.replies_rejected_post_exit),
            persistence_errors: self.persistence_errors.saturating_add(rhs.persistence_errors),
            persistence_retries: self
                .persistence_retries
                .saturating_add(rhs.persistence_retries),
        }
    }
}

impl Sub for StorageCounts {
    type Output = StorageCounts;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            requests_saved: self.requests_saved.saturating_sub(rhs.requests_saved),
            requests_duplicate: self.requests_duplicate.saturating_sub(rhs.requests_duplicate),
            replies_saved: self.replies_saved.saturating_sub(rhs.replies_saved),
            replies_rejected_post_exit: self
                .replies_rejected_post_exit
                .saturating_sub(rhs.replies_rejected_post_exit),
            persistence_errors: self.persistence_errors.saturating_sub(rhs.persistence_errors),
            persistence_retries: self
                .persistence_retries
                .saturating_sub(rhs.persistence_retries),
        }
    }
}
