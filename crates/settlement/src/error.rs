//! Settlement error taxonomy.

use crate::policy::VerifyError;

/// Errors surfaced by the settlement gate and the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettleError {
    /// The intent is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A referenced row does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The owner does not own the referenced resource.
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    /// The mutation conflicts with current state.
    #[error("conflict: {0}")]
    Conflict(&'static str),
    /// The confirmed transaction does not satisfy the feature policy.
    #[error(transparent)]
    Policy(#[from] VerifyError),
    /// The transaction terminally failed on chain.
    #[error("transaction {tx_id} failed on chain ({raw_state})")]
    TxFailed {
        /// The failed transaction id.
        tx_id: String,
        /// Raw status string reported by the chain.
        raw_state: String,
    },
    /// The transaction did not reach a terminal state before the deadline.
    #[error("timed out waiting for transaction {tx_id}")]
    Timeout {
        /// The transaction id still pending at the deadline.
        tx_id: String,
    },
    /// The payment or invoice recipient could not be resolved to a user.
    #[error("recipient could not be resolved")]
    RecipientUnresolved,
    /// The storage engine failed; nothing was applied.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SettleError {
    /// Stable machine-readable kind, used in error bodies and ledger rows.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::Policy(VerifyError::PolicyMismatch { .. }) => "policy_mismatch",
            Self::Policy(VerifyError::SignerMismatch { .. }) => "signer_mismatch",
            Self::Policy(VerifyError::ClaimInputMismatch) => "claim_input_mismatch",
            Self::TxFailed { .. } => "tx_failed",
            Self::Timeout { .. } => "timeout",
            Self::RecipientUnresolved => "recipient_unresolved",
            Self::Storage(_) => "storage_error",
        }
    }
}
