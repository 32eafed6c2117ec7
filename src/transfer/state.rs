//! Transfer state machine
//!
//! ```text
//!             ┌──────────► completed
//!   pending ──┤
//!             └──────────► failed
//! ```
//!
//! A transfer is created `pending` (or directly `failed` when the failure is
//! recorded after a rollback) and is immutable once terminal.

use crate::error::LedgerError;
use crate::models::OperationStatus;

impl OperationStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }

    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (OperationStatus::Pending, OperationStatus::Completed)
                | (OperationStatus::Pending, OperationStatus::Failed)
        )
    }
}

/// Validate a status change, failing with `InvalidStatusTransition`
pub fn ensure_transition(from: OperationStatus, to: OperationStatus) -> Result<(), LedgerError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(LedgerError::InvalidStatusTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
