//! Core types used throughout the ledger
//!
//! Internal row identifiers mirror the `BIGSERIAL` primary keys of the
//! persisted schema. The externally visible transfer identifier is a UUID
//! and lives on [`crate::models::Transfer`] instead.

/// User ID - primary key of `users`.
pub type UserId = i64;

/// Currency ID - primary key of `currencies`.
pub type CurrencyId = i64;

/// Account ID - primary key of `accounts`.
///
/// # Lock ordering
/// Row locks are always taken in ascending `AccountId` order, so the
/// numeric order of this type is part of the concurrency contract.
pub type AccountId = i64;

/// Transfer ID - internal primary key of `transfers`.
///
/// Ledger entries reference transfers through this id. Callers only ever
/// see the transfer's `public_id`.
pub type TransferId = i64;

/// Transaction ID - primary key of `transactions` (ledger entries).
pub type TransactionId = i64;

/// Monetary amount, stored as `DECIMAL(18, 2)`.
pub type Amount = rust_decimal::Decimal;
