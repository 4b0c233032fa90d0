//! Errors raised while parsing domain values.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Parse failure of an identifier or reference code.
///
/// Storage and transport failures are not domain errors; they live in
/// `relayq-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid {kind}: {reason}")]
    InvalidId { kind: &'static str, reason: String },

    #[error("invalid code {code:?}: {reason}")]
    InvalidCode { code: String, reason: &'static str },
}

impl DomainError {
    pub fn invalid_id(kind: &'static str, reason: impl ToString) -> Self {
        Self::InvalidId {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn invalid_code(code: &str, reason: &'static str) -> Self {
        Self::InvalidCode {
            code: code.to_string(),
            reason,
        }
    }
}
