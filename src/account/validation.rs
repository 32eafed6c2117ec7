//! Input validation for user identities
//!
//! Validated types keep their field private so the only way to obtain one
//! is through `new()`.

use std::fmt;

use crate::error::LedgerError;

/// Maximum email length accepted (RFC 5321 path limit)
pub const MAX_EMAIL_LEN: usize = 254;

// ============================================================================
// Email - Validated, normalized email address
// ============================================================================

/// Validated email address (trimmed, lower-cased)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Email(String);

impl Email {
    /// Create a new validated Email
    ///
    /// # Validation Rules
    /// - Trimmed and lower-cased before checking
    /// - Length: 3-254 characters
    /// - Exactly one `@` with a non-empty local part
    /// - Domain contains a dot that is neither first nor last
    /// - No whitespace or control characters
    ///
    /// # Examples
    /// ```
    /// use transfer_ledger::account::validation::Email;
    ///
    /// let email = Email::new(" Alice@Example.COM ").unwrap();
    /// assert_eq!(email.as_str(), "alice@example.com");
    ///
    /// assert!(Email::new("alice@localhost").is_err());
    /// ```
    pub fn new(raw: &str) -> Result<Self, LedgerError> {
        let email = raw.trim().to_lowercase();
        let invalid = |reason: &str| LedgerError::InvalidEmail(format!("'{raw}': {reason}"));

        if email.len() < 3 || email.len() > MAX_EMAIL_LEN {
            return Err(invalid("length must be 3-254 characters"));
        }

        if email.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("contains whitespace"));
        }

        let (local, domain) = match email.split_once('@') {
            Some((local, domain)) if !domain.contains('@') => (local, domain),
            _ => return Err(invalid("must contain exactly one '@'")),
        };

        if local.is_empty() {
            return Err(invalid("empty local part"));
        }

        if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
            return Err(invalid("domain must be a dotted name"));
        }

        Ok(Self(email))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
