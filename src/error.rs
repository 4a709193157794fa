use std::time::Duration;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::validate::{ValidationError, ValidationKind};

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

pub const LAST_COLUMN_MESSAGE: &str =
    "Please remove candidate cards from the last remaining column before deleting it.";

/// Edits refused because applying them would lose or clobber data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    #[error("Please remove candidate cards from the last remaining column before deleting it.")]
    LastColumn,
    #[error("A password has already been set up for this database.")]
    AlreadySetUp,
}

impl Conflict {
    pub fn code(&self) -> &'static str {
        match self {
            Conflict::LastColumn => "last_column",
            Conflict::AlreadySetUp => "already_setup",
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Schema(#[from] ValidationError),

    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error("{what} `{id}` not found")]
    NotFound { what: &'static str, id: String },

    #[error("Invalid password.")]
    NotAuthenticated,

    #[error("Too many failed attempts. Try again in {} seconds.", .retry_after.as_secs().max(1))]
    LockedOut { retry_after: Duration },

    #[error("{0}")]
    InvalidInput(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            what,
            id: id.into(),
        }
    }

    /// Stable code the UI layer switches on.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Crypto(_) => "crypto",
            StoreError::Schema(err) => err.kind.as_str(),
            StoreError::Conflict(conflict) => conflict.code(),
            StoreError::NotFound { .. } => "not_found",
            StoreError::NotAuthenticated => "password",
            StoreError::LockedOut { .. } => "locked",
            StoreError::InvalidInput(_) => "invalid",
            StoreError::Io(_) => "io",
            StoreError::Json(_) => "json",
        }
    }

    pub fn is_fraud(&self) -> bool {
        matches!(self, StoreError::Schema(err) if err.kind == ValidationKind::Fraud)
    }

    /// Message safe to show the user as-is.
    pub fn user_message(&self) -> String {
        match self {
            StoreError::Schema(err) => match err.kind {
                ValidationKind::Fraud => format!(
                    "Warning: this file contains content that looks tampered with or malicious and was not imported. ({})",
                    err.message
                ),
                ValidationKind::Broken => {
                    format!("This file doesn't look valid. ({})", err.message)
                }
            },
            StoreError::Crypto(_) => {
                "Unable to decrypt the file. Check the password and try again.".to_string()
            }
            StoreError::NotFound { .. } => "Nothing to undo or redo.".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_validation_kind() {
        let fraud = StoreError::from(ValidationError::fraud("reserved key"));
        let broken = StoreError::from(ValidationError::broken("missing columns"));
        assert_eq!(fraud.code(), "fraud");
        assert_eq!(broken.code(), "broken");
        assert!(fraud.is_fraud());
        assert!(!broken.is_fraud());
        assert!(fraud.user_message().starts_with("Warning"));
        assert!(broken.user_message().starts_with("This file doesn't look valid"));
    }

    #[test]
    fn last_column_message_is_fixed() {
        let err = StoreError::from(Conflict::LastColumn);
        assert_eq!(err.code(), "last_column");
        assert_eq!(err.to_string(), LAST_COLUMN_MESSAGE);
    }
}
