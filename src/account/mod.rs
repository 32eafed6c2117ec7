//! Account management module
//!
//! Users own accounts; an account holds one currency and a non-negative
//! balance. Accounts are never deleted, only moved to `closed`.

pub mod repository;
pub mod validation;

pub use repository::{AccountRepository, UserRepository};
pub use validation::Email;
