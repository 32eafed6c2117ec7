//! Transfer Engine
//!
//! Moves funds between two accounts of the same currency as a single store
//! transaction.
//!
//! # State Machine
//!
//! ```text
//! pending → completed
//!    ↓
//!  failed
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Atomicity**: debit, credit, both ledger entries and the final status
//!    commit together or not at all
//! 2. **Lock Order**: account row locks are always taken in ascending id order
//! 3. **Idempotency**: a repeated key returns the stored outcome and never
//!    re-applies balance changes
//! 4. **No Mid-flight Cancellation**: once the store transaction is open it
//!    runs to commit or rollback

pub mod engine;
pub mod idempotency;
pub mod retry;
pub mod state;

#[cfg(test)]
mod integration_tests;

pub use engine::{TransferEngine, TransferRequest};
pub use idempotency::KeyedLocks;
pub use retry::{RetryPolicy, with_retry};
