//! Feature policies and the transaction policy verifier.
//!
//! A [`FeaturePolicy`] declares which program and functions a feature's
//! settlement transactions may execute and whether the fee payer must match
//! the owner's wallet. The table is built from configuration at startup and
//! immutable for the lifetime of the process.
//!
//! [`verify`] is pure over its inputs; it never queries the chain.

use envelop_aleo::{DecodedTransaction, Transition};
use envelop_common::field::hash_to_field;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// The settlement features gated by confirmed transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Token swap settlement.
    Swap,
    /// Payment intent creation.
    PaymentCreate,
    /// Payment settlement.
    PaymentSettle,
    /// Invoice creation.
    InvoiceCreate,
    /// Invoice payment.
    InvoicePay,
    /// One step of a yield plan.
    YieldStep,
    /// Username claim.
    IdentityClaim,
}

impl FeatureKind {
    /// All feature kinds, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Swap,
        Self::PaymentCreate,
        Self::PaymentSettle,
        Self::InvoiceCreate,
        Self::InvoicePay,
        Self::YieldStep,
        Self::IdentityClaim,
    ];

    /// Stable string form, used in ledger rows and configuration keys.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Swap => "swap",
            Self::PaymentCreate => "payment_create",
            Self::PaymentSettle => "payment_settle",
            Self::InvoiceCreate => "invoice_create",
            Self::InvoicePay => "invoice_pay",
            Self::YieldStep => "yield_step",
            Self::IdentityClaim => "identity_claim",
        }
    }
}

impl std::fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-feature transaction policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturePolicy {
    /// The feature this policy gates.
    pub feature_kind: FeatureKind,
    /// The only program settlement transitions may belong to.
    pub allowed_program_id: String,
    /// Accepted function names within the program. Empty rejects everything.
    pub allowed_function_names: Vec<String>,
    /// Whether a fee-payer mismatch is fatal rather than advisory.
    pub require_fee_payer_match: bool,
}

/// The process-wide policy table, one row per feature kind.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<FeatureKind, FeaturePolicy>,
}

impl PolicyTable {
    /// The default deployment policies for the Envelop programs.
    pub fn defaults(require_fee_payer_match: bool) -> Self {
        let rows = [
            (FeatureKind::Swap, "envelop_swap.aleo", &["create_swap_request", "settle_swap_onchain"][..]),
            (FeatureKind::PaymentCreate, "envelop_payments.aleo", &["create_payment_intent"][..]),
            (FeatureKind::PaymentSettle, "envelop_payments.aleo", &["create_payment_intent", "settle_payment_onchain"][..]),
            (FeatureKind::InvoiceCreate, "envelop_invoices.aleo", &["create_invoice"][..]),
            (FeatureKind::InvoicePay, "envelop_invoices.aleo", &["pay_invoice"][..]),
            (FeatureKind::YieldStep, "envelop_yield.aleo", &["stake_onchain", "unstake_onchain", "claim_onchain"][..]),
            (FeatureKind::IdentityClaim, "envelop_identity.aleo", &["claim_username"][..]),
        ];

        let policies = rows
            .into_iter()
            .map(|(feature_kind, program, functions)| {
                (
                    feature_kind,
                    FeaturePolicy {
                        feature_kind,
                        allowed_program_id: program.to_owned(),
                        allowed_function_names:
                            functions.iter().map(|f| (*f).to_owned()).collect(),
                        require_fee_payer_match,
                    },
                )
            })
            .collect();
        Self { policies }
    }

    /// Replaces the policy row for one feature.
    pub fn set(&mut self, policy: FeaturePolicy) {
        self.policies.insert(policy.feature_kind, policy);
    }

    /// Returns the policy for a feature. Every kind has a row by
    /// construction.
    pub fn get(&self, feature_kind: FeatureKind) -> &FeaturePolicy {
        self.policies.get(&feature_kind).expect("policy table covers every feature kind")
    }
}

/// Identity claim inputs re-hashed during verification.
#[derive(Debug, Clone)]
pub struct ClaimCheck {
    /// The claimed username.
    pub username: String,
    /// The claimed display name.
    pub display_name: String,
}

/// Policy verification failures, first failing rule wins.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// No transition matches the allowed program and function set.
    #[error("transaction executes no transition allowed for {feature}")]
    PolicyMismatch {
        /// The feature whose policy failed.
        feature: &'static str,
    },
    /// The fee payer is not the expected wallet.
    #[error("transaction fee payer does not match the owner wallet")]
    SignerMismatch {
        /// The fee payer found on the transaction, if any.
        found: Option<String>,
    },
    /// The recorded claim hashes do not match the provided strings.
    #[error("claim inputs do not match the confirmed transition")]
    ClaimInputMismatch,
}

/// Verifies a confirmed transaction against a feature policy.
///
/// Returns the matched transition. For identity claims, `claim` carries the
/// plaintext strings whose hashes must appear among the transition inputs.
pub fn verify(
    decoded: &DecodedTransaction,
    policy: &FeaturePolicy,
    expected_wallet_address: &str,
    claim: Option<&ClaimCheck>,
) -> Result<Transition, VerifyError> {
    let matched = decoded
        .find_transition(&policy.allowed_program_id, &policy.allowed_function_names)
        .ok_or(VerifyError::PolicyMismatch { feature: policy.feature_kind.as_str() })?;

    let payer_matches = decoded.fee_payer.as_deref() == Some(expected_wallet_address);
    if !payer_matches {
        if policy.require_fee_payer_match {
            return Err(VerifyError::SignerMismatch { found: decoded.fee_payer.clone() });
        }
        warn!(
            target: "settlement::verify",
            feature = policy.feature_kind.as_str(),
            fee_payer = decoded.fee_payer.as_deref().unwrap_or("<absent>"),
            "Fee payer does not match owner wallet; policy is advisory"
        );
    }

    if let Some(claim) = claim {
        let username_hash = hash_to_field(&claim.username);
        let display_name_hash = hash_to_field(&claim.display_name);
        let recorded = &matched.inputs;
        if !recorded.contains(&username_hash) || !recorded.contains(&display_name_hash) {
            return Err(VerifyError::ClaimInputMismatch);
        }
    }

    Ok(matched.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoded(transitions: &[(&str, &str)], fee_payer: &str) -> DecodedTransaction {
        let transitions = transitions
            .iter()
            .map(|(program, function)| json!({"program": program, "function": function}))
            .collect::<Vec<_>>();
        envelop_aleo::decode::decode_transaction(&json!({
            "owner": fee_payer,
            "transitions": transitions,
        }))
    }

    fn swap_policy() -> FeaturePolicy {
        PolicyTable::defaults(true).get(FeatureKind::Swap).clone()
    }

    #[test]
    fn accepts_matching_transition() {
        let tx = decoded(
            &[
                ("envelop_swap.aleo", "create_swap_request"),
                ("envelop_swap.aleo", "settle_swap_onchain"),
            ],
            "aleo1owner",
        );
        let matched = verify(&tx, &swap_policy(), "aleo1owner", None).unwrap();
        assert_eq!(matched.function_name, "create_swap_request");
    }

    #[test]
    fn rejects_wrong_program() {
        let tx = decoded(&[("envelop_payments.aleo", "create_payment_intent")], "aleo1owner");
        assert_eq!(
            verify(&tx, &swap_policy(), "aleo1owner", None),
            Err(VerifyError::PolicyMismatch { feature: "swap" })
        );
    }

    #[test]
    fn rejects_wrong_function() {
        let tx = decoded(&[("envelop_swap.aleo", "mint")], "aleo1owner");
        assert!(matches!(
            verify(&tx, &swap_policy(), "aleo1owner", None),
            Err(VerifyError::PolicyMismatch { .. })
        ));
    }

    #[test]
    fn empty_function_set_rejects_everything() {
        let mut policy = swap_policy();
        policy.allowed_function_names.clear();
        let tx = decoded(&[("envelop_swap.aleo", "create_swap_request")], "aleo1owner");
        assert!(matches!(
            verify(&tx, &policy, "aleo1owner", None),
            Err(VerifyError::PolicyMismatch { .. })
        ));
    }

    #[test]
    fn fee_payer_mismatch_is_fatal_when_required() {
        let tx = decoded(&[("envelop_swap.aleo", "create_swap_request")], "aleo1other");
        assert_eq!(
            verify(&tx, &swap_policy(), "aleo1owner", None),
            Err(VerifyError::SignerMismatch { found: Some("aleo1other".to_owned()) })
        );
    }

    #[test]
    fn fee_payer_mismatch_is_advisory_when_not_required() {
        let mut policy = swap_policy();
        policy.require_fee_payer_match = false;
        let tx = decoded(&[("envelop_swap.aleo", "create_swap_request")], "aleo1other");
        assert!(verify(&tx, &policy, "aleo1owner", None).is_ok());
    }

    #[test]
    fn claim_hashes_must_match_transition_inputs() {
        let policy = PolicyTable::defaults(true).get(FeatureKind::IdentityClaim).clone();
        let claim =
            ClaimCheck { username: "alice".to_owned(), display_name: "Alice".to_owned() };

        let good = envelop_aleo::decode::decode_transaction(&json!({
            "owner": "aleo1owner",
            "transitions": [{
                "program": "envelop_identity.aleo",
                "function": "claim_username",
                "inputs": [hash_to_field("alice"), hash_to_field("Alice"), "aleo1owner"]
            }]
        }));
        assert!(verify(&good, &policy, "aleo1owner", Some(&claim)).is_ok());

        let bad = envelop_aleo::decode::decode_transaction(&json!({
            "owner": "aleo1owner",
            "transitions": [{
                "program": "envelop_identity.aleo",
                "function": "claim_username",
                "inputs": [hash_to_field("mallory"), hash_to_field("Alice")]
            }]
        }));
        assert_eq!(
            verify(&bad, &policy, "aleo1owner", Some(&claim)),
            Err(VerifyError::ClaimInputMismatch)
        );
    }
}
