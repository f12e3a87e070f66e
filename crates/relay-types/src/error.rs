//! Error types for the relay.
//!
//! `LedgerError` is what a ledger client reports for a failed call; its
//! `kind()` is the classification the relay processor acts on.

use thiserror::Error;

use crate::TransferId;

/// How the relay processor treats a failed ledger call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The ledger's own replay guard already consumed the transfer id.
    AlreadyProcessed,
    /// The relay identity lacks the privileged role for the call.
    NotAuthorized,
    /// Network, gas, nonce or any other condition an operator may re-drive.
    Transient,
}

/// Errors reported by a ledger client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("transfer {0} already processed")]
    AlreadyProcessed(TransferId),

    #[error("relay identity not authorized: {0}")]
    NotAuthorized(String),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("ledger transport error: {0}")]
    Transport(String),

    #[error("event subscription failed: {0}")]
    Subscription(String),
}

impl LedgerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LedgerError::AlreadyProcessed(_) => FailureKind::AlreadyProcessed,
            LedgerError::NotAuthorized(_) => FailureKind::NotAuthorized,
            LedgerError::Reverted(_) | LedgerError::Transport(_) | LedgerError::Subscription(_) => {
                FailureKind::Transient
            }
        }
    }

    /// Short label for log fields.
    pub fn error_type(&self) -> &'static str {
        match self {
            LedgerError::AlreadyProcessed(_) => "already_processed",
            LedgerError::NotAuthorized(_) => "not_authorized",
            LedgerError::Reverted(_) => "reverted",
            LedgerError::Transport(_) => "transport",
            LedgerError::Subscription(_) => "subscription",
        }
    }
}

/// Relay error types.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid {kind} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("address book: {0}")]
    AddressBook(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("relay engine is already running")]
    AlreadyRunning,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_classification() {
        let id = TransferId([1; 32]);
        assert_eq!(LedgerError::AlreadyProcessed(id).kind(), FailureKind::AlreadyProcessed);
        assert_eq!(
            LedgerError::NotAuthorized("not an operator".into()).kind(),
            FailureKind::NotAuthorized
        );
        for transient in [
            LedgerError::Reverted("out of gas".into()),
            LedgerError::Transport("connection reset".into()),
            LedgerError::Subscription("filter not found".into()),
        ] {
            assert_eq!(transient.kind(), FailureKind::Transient, "{transient}");
        }
    }

    #[test]
    fn test_relay_error_wraps_ledger_error() {
        let err: RelayError = LedgerError::Transport("timeout".into()).into();
        assert_eq!(err.to_string(), "ledger transport error: timeout");
    }
}
