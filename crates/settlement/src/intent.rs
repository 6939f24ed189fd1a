//! Settlement intents.
//!
//! A [`SettlementIntent`] is the structured request a feature route hands to
//! the gate after the user's transaction has been submitted. Intents are
//! consumed exactly once; the `intent_id` doubles as the idempotency key, so
//! replaying an already-applied intent returns the recorded receipt.

use serde::{Deserialize, Serialize};

/// How a payment or invoice names its counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRef {
    /// A claimed username, resolved through the on-chain claim index.
    Username(String),
    /// A legacy phone-registered user.
    Phone(String),
    /// A raw wallet address.
    Address(String),
}

/// One planned step of a yield action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YieldStepPlan {
    /// Program the step must execute in.
    pub program_id: String,
    /// Function the step must call.
    pub function_name: String,
    /// The transaction id the caller broadcast for this step.
    pub tx_id: String,
}

/// Feature-specific intent payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "feature", rename_all = "snake_case")]
pub enum IntentPayload {
    /// Settle a swap against a previously issued quote.
    SwapExecute {
        /// The confirmed swap transaction.
        tx_id: String,
        /// The quote being executed.
        quote_id: String,
    },
    /// Settle an outbound payment.
    PaymentSend {
        /// The confirmed payment transaction.
        tx_id: String,
        /// Who receives the payment.
        recipient: RecipientRef,
        /// Token identifier.
        token: String,
        /// Amount in atomic units.
        amount_atomic: u64,
        /// Optional memo, hashed on chain.
        memo: Option<String>,
    },
    /// Record a newly created invoice.
    InvoiceCreate {
        /// The confirmed creation transaction.
        tx_id: String,
        /// Caller-assigned invoice id.
        invoice_id: String,
        /// Token identifier.
        token: String,
        /// Amount in atomic units.
        amount_atomic: u64,
        /// Restricts who may pay, when present.
        payer: Option<RecipientRef>,
        /// Optional memo, hashed on chain.
        memo: Option<String>,
    },
    /// Pay an open invoice.
    InvoicePay {
        /// The confirmed payment transaction.
        tx_id: String,
        /// The invoice being paid.
        invoice_id: String,
    },
    /// Apply a multi-step yield action.
    YieldStep {
        /// The yield quote the plan was built from.
        yield_quote_id: String,
        /// Planned transitions with their transaction ids, in order.
        steps: Vec<YieldStepPlan>,
    },
    /// Claim a username.
    IdentityClaim {
        /// The confirmed claim transaction.
        tx_id: String,
        /// The claimed username, lowercase.
        username: String,
        /// The claimed display name.
        display_name: String,
    },
}

impl IntentPayload {
    /// The feature kind this payload settles.
    pub const fn feature_kind(&self) -> crate::FeatureKind {
        match self {
            Self::SwapExecute { .. } => crate::FeatureKind::Swap,
            Self::PaymentSend { .. } => crate::FeatureKind::PaymentSettle,
            Self::InvoiceCreate { .. } => crate::FeatureKind::InvoiceCreate,
            Self::InvoicePay { .. } => crate::FeatureKind::InvoicePay,
            Self::YieldStep { .. } => crate::FeatureKind::YieldStep,
            Self::IdentityClaim { .. } => crate::FeatureKind::IdentityClaim,
        }
    }

    /// The transaction id recorded on the ledger for this payload: the only
    /// tx for single-transaction features, the last planned tx for yield.
    pub fn ledger_tx_id(&self) -> &str {
        match self {
            Self::SwapExecute { tx_id, .. }
            | Self::PaymentSend { tx_id, .. }
            | Self::InvoiceCreate { tx_id, .. }
            | Self::InvoicePay { tx_id, .. }
            | Self::IdentityClaim { tx_id, .. } => tx_id,
            Self::YieldStep { steps, .. } => {
                steps.last().map_or("", |step| step.tx_id.as_str())
            }
        }
    }
}

/// A settlement request, consumed exactly once by the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementIntent {
    /// Caller-assigned idempotency key.
    pub intent_id: String,
    /// The authenticated owner.
    pub owner_user_id: u64,
    /// Feature payload.
    pub payload: IntentPayload,
}
