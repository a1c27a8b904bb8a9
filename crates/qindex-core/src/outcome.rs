//! Transition flags returned by index mutations.
//!
//! The coverage accountant derives count deltas from these flags without
//! re-reading the index row.

use serde::{Deserialize, Serialize};

/// Result of a single-record index upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOutcome {
    /// An index row existed before the call.
    pub existed: bool,
    /// The pre-existing row was soft-deleted.
    pub was_deleted: bool,
    /// A new index row was created.
    pub created: bool,
    /// A soft-deleted row was brought back to life.
    pub revived: bool,
}

impl UpsertOutcome {
    /// Outcome for a record whose base row was missing: any stale index row
    /// was removed and nothing was written.
    #[must_use]
    pub fn removed(existed: bool, was_deleted: bool) -> Self {
        Self {
            existed,
            was_deleted,
            created: false,
            revived: false,
        }
    }

    /// Delta to apply to the indexed count for this transition. Only a
    /// create or a revive adds an active row; plain updates are neutral.
    #[must_use]
    pub fn index_delta(&self) -> i64 {
        i64::from(self.created || self.revived)
    }
}

/// Result of a single-record index delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    /// An active (non-soft-deleted) row was removed; the indexed count
    /// decreases only in this case.
    pub was_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_delta() {
        let created = UpsertOutcome {
            created: true,
            ..Default::default()
        };
        assert_eq!(created.index_delta(), 1);

        let revived = UpsertOutcome {
            existed: true,
            was_deleted: true,
            revived: true,
            ..Default::default()
        };
        assert_eq!(revived.index_delta(), 1);

        let updated = UpsertOutcome {
            existed: true,
            ..Default::default()
        };
        assert_eq!(updated.index_delta(), 0);

        let removed = UpsertOutcome::removed(true, false);
        assert_eq!(removed.index_delta(), 0);
    }
}
