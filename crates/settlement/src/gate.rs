//! The settlement gate.
//!
//! Conducts one [`SettlementIntent`] from submitted transaction to applied
//! feature row: poll the status oracle until the transaction is terminal,
//! verify the confirmed transaction against the feature policy, then apply
//! the feature mutation and the ledger event in one atomic store
//! transaction. Policy verification always precedes the transaction, so the
//! state lock is never held across network I/O.
//!
//! Intents of the same `(owner, feature)` pair are serialized; everything
//! else runs in parallel.

use crate::{
    error::SettleError,
    handlers,
    intent::{IntentPayload, SettlementIntent, YieldStepPlan},
    policy::{self, ClaimCheck, FeatureKind, FeaturePolicy, PolicyTable},
    store::{FeatureRow, LedgerOutcome, SettlementReceipt, Store},
};
use envelop_aleo::{oracle::StatusOracle, Transition, TxState, TxStatusSnapshot};
use envelop_common::unix_epoch_ms;
use metrics::Counter;
use metrics_derive::Metrics;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Default status poll cadence in milliseconds.
pub const DEFAULT_POLL_MS: u64 = 4_000;
/// Default settlement deadline in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Gate configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Status poll cadence.
    pub poll_ms: u64,
    /// Settlement deadline applied to every intent.
    pub timeout_ms: u64,
    /// When true the chain is the source of truth and cached balances are
    /// never moved; when false settlement moves balances in the same
    /// transaction as the feature row.
    pub onchain_ledger: bool,
    /// When true, payment and invoice recipients must resolve through the
    /// on-chain claim index.
    pub require_onchain_recipient: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            poll_ms: DEFAULT_POLL_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            onchain_ledger: true,
            require_onchain_recipient: false,
        }
    }
}

/// The settlement gate.
#[derive(Debug, Clone)]
pub struct SettlementGate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    store: Arc<Store>,
    oracle: Arc<StatusOracle>,
    policies: PolicyTable,
    config: GateConfig,
    /// Per-(owner, feature) serialization locks.
    locks: Mutex<HashMap<(u64, FeatureKind), Arc<tokio::sync::Mutex<()>>>>,
    metrics: GateMetrics,
}

impl SettlementGate {
    /// Creates a gate over the given store, oracle, and policy table.
    pub fn new(
        store: Arc<Store>,
        oracle: Arc<StatusOracle>,
        policies: PolicyTable,
        config: GateConfig,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                store,
                oracle,
                policies,
                config,
                locks: Mutex::new(HashMap::new()),
                metrics: GateMetrics::default(),
            }),
        }
    }

    /// The store the gate settles into.
    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Settles an intent under the configured deadline.
    pub async fn settle(
        &self,
        intent: SettlementIntent,
    ) -> Result<SettlementReceipt, SettleError> {
        let deadline =
            Instant::now() + Duration::from_millis(self.inner.config.timeout_ms);
        self.settle_with_deadline(intent, deadline).await
    }

    /// Settles an intent, polling no later than `deadline`.
    ///
    /// Replaying an already-applied intent id is a no-op returning the
    /// recorded receipt.
    pub async fn settle_with_deadline(
        &self,
        intent: SettlementIntent,
        deadline: Instant,
    ) -> Result<SettlementReceipt, SettleError> {
        let feature = intent.payload.feature_kind();

        let lock = {
            let mut locks = self.inner.locks.lock();
            locks.entry((intent.owner_user_id, feature)).or_default().clone()
        };
        let _permit = lock.lock().await;

        if let Some(receipt) = self
            .inner
            .store
            .read(|state| state.receipts.get(&intent.intent_id).cloned())
        {
            debug!(
                target: "settlement::gate",
                intent_id = %intent.intent_id,
                "Replaying receipt for applied intent"
            );
            return Ok(receipt);
        }

        let outcome = self.drive(&intent, feature, deadline).await;
        match &outcome {
            Ok(_) => self.inner.metrics.settled_intents.increment(1),
            Err(SettleError::Timeout { .. }) => {
                self.inner.metrics.timed_out_intents.increment(1)
            }
            Err(SettleError::TxFailed { .. }) => {
                self.inner.metrics.failed_intents.increment(1)
            }
            Err(_) => self.inner.metrics.rejected_intents.increment(1),
        }
        outcome
    }

    /// Runs the settlement protocol for one intent.
    async fn drive(
        &self,
        intent: &SettlementIntent,
        feature: FeatureKind,
        deadline: Instant,
    ) -> Result<SettlementReceipt, SettleError> {
        let owner = self
            .inner
            .store
            .user(intent.owner_user_id)
            .ok_or(SettleError::NotFound("user"))?;

        // Cheap shape checks before the first poll.
        if let IntentPayload::IdentityClaim { username, .. } = &intent.payload {
            if !handlers::validate_username(username) {
                return Err(SettleError::InvalidArgument(
                    "username must be 3-64 characters from [a-z0-9._-]".to_owned(),
                ));
            }
        }

        let policy = self.inner.policies.get(feature);

        let matched = match &intent.payload {
            IntentPayload::YieldStep { steps, .. } => {
                self.verify_yield_plan(intent, policy, steps, &owner.wallet_address, deadline)
                    .await?
            }
            payload => {
                let tx_id = payload.ledger_tx_id().to_owned();
                let snapshot = self.await_confirmed(intent, feature, &tx_id, deadline).await?;
                self.verify_confirmed(intent, feature, policy, &snapshot, &owner.wallet_address)?
            }
        };

        self.apply(intent, feature, &matched).await
    }

    /// Polls until `tx_id` is terminal, recording failed and timed-out
    /// outcomes on the ledger.
    async fn await_confirmed(
        &self,
        intent: &SettlementIntent,
        feature: FeatureKind,
        tx_id: &str,
        deadline: Instant,
    ) -> Result<TxStatusSnapshot, SettleError> {
        match self.wait_for_terminal(tx_id, deadline).await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                let outcome = match &err {
                    SettleError::Timeout { .. } => LedgerOutcome::Timeout,
                    _ => LedgerOutcome::Failed,
                };
                self.record_event(intent, feature, tx_id, outcome, None, None);
                Err(err)
            }
        }
    }

    /// Verifies a confirmed snapshot, recording a rejection on the ledger
    /// when the policy fails.
    fn verify_confirmed(
        &self,
        intent: &SettlementIntent,
        feature: FeatureKind,
        policy: &FeaturePolicy,
        snapshot: &TxStatusSnapshot,
        owner_wallet: &str,
    ) -> Result<Transition, SettleError> {
        let claim_check = match &intent.payload {
            IntentPayload::IdentityClaim { username, display_name, .. } => Some(ClaimCheck {
                username: username.clone(),
                display_name: display_name.clone(),
            }),
            _ => None,
        };

        policy::verify(&snapshot.decoded, policy, owner_wallet, claim_check.as_ref()).map_err(
            |err| {
                self.record_event(
                    intent,
                    feature,
                    &snapshot.tx_id,
                    LedgerOutcome::ConfirmedRejected,
                    snapshot.decoded.program_id.clone(),
                    snapshot.decoded.function_name.clone(),
                );
                SettleError::Policy(err)
            },
        )
    }

    /// Verifies every step of a yield plan in order against its planned
    /// transition. Any failure aborts the whole intent.
    async fn verify_yield_plan(
        &self,
        intent: &SettlementIntent,
        policy: &FeaturePolicy,
        steps: &[YieldStepPlan],
        owner_wallet: &str,
        deadline: Instant,
    ) -> Result<Transition, SettleError> {
        if steps.is_empty() {
            return Err(SettleError::InvalidArgument("yield plan has no steps".to_owned()));
        }

        let mut last = None;
        for step in steps {
            // The planned pair must itself be within the feature policy.
            if step.program_id != policy.allowed_program_id
                || !policy.allowed_function_names.contains(&step.function_name)
            {
                self.record_event(
                    intent,
                    FeatureKind::YieldStep,
                    &step.tx_id,
                    LedgerOutcome::ConfirmedRejected,
                    Some(step.program_id.clone()),
                    Some(step.function_name.clone()),
                );
                return Err(SettleError::Policy(policy::VerifyError::PolicyMismatch {
                    feature: FeatureKind::YieldStep.as_str(),
                }));
            }

            let snapshot =
                self.await_confirmed(intent, FeatureKind::YieldStep, &step.tx_id, deadline).await?;

            let step_policy = FeaturePolicy {
                feature_kind: FeatureKind::YieldStep,
                allowed_program_id: step.program_id.clone(),
                allowed_function_names: vec![step.function_name.clone()],
                require_fee_payer_match: policy.require_fee_payer_match,
            };
            last = Some(self.verify_confirmed(
                intent,
                FeatureKind::YieldStep,
                &step_policy,
                &snapshot,
                owner_wallet,
            )?);
        }

        Ok(last.expect("plan verified to be non-empty"))
    }

    /// Applies the feature mutation, the settled ledger event, and the
    /// receipt in one atomic transaction.
    async fn apply(
        &self,
        intent: &SettlementIntent,
        feature: FeatureKind,
        matched: &Transition,
    ) -> Result<SettlementReceipt, SettleError> {
        let now = unix_epoch_ms();
        let config = &self.inner.config;
        let ledger_tx_id = intent.payload.ledger_tx_id().to_owned();
        let owner = intent.owner_user_id;

        let result = self.inner.store.transaction(|state| {
            let row = match &intent.payload {
                IntentPayload::SwapExecute { tx_id, quote_id } => FeatureRow::Swap(
                    handlers::apply_swap(state, owner, quote_id, tx_id, now, config.onchain_ledger)?,
                ),
                IntentPayload::PaymentSend { tx_id, recipient, token, amount_atomic, memo } => {
                    FeatureRow::Payment(handlers::apply_payment(
                        state,
                        owner,
                        recipient,
                        token,
                        *amount_atomic,
                        memo.as_deref(),
                        tx_id,
                        now,
                        config.onchain_ledger,
                        config.require_onchain_recipient,
                    )?)
                }
                IntentPayload::InvoiceCreate {
                    tx_id,
                    invoice_id,
                    token,
                    amount_atomic,
                    payer,
                    memo,
                } => FeatureRow::Invoice(handlers::apply_invoice_create(
                    state,
                    owner,
                    invoice_id,
                    token,
                    *amount_atomic,
                    payer.as_ref(),
                    memo.as_deref(),
                    tx_id,
                    now,
                    config.require_onchain_recipient,
                )?),
                IntentPayload::InvoicePay { tx_id, invoice_id } => {
                    FeatureRow::Invoice(handlers::apply_invoice_pay(
                        state,
                        owner,
                        invoice_id,
                        tx_id,
                        now,
                        config.onchain_ledger,
                    )?)
                }
                IntentPayload::YieldStep { yield_quote_id, steps } => {
                    FeatureRow::YieldAction(handlers::apply_yield_action(
                        state,
                        owner,
                        yield_quote_id,
                        steps
                            .iter()
                            .map(|s| {
                                (s.program_id.clone(), s.function_name.clone(), s.tx_id.clone())
                            })
                            .collect(),
                        now,
                    )?)
                }
                IntentPayload::IdentityClaim { tx_id, username, display_name } => {
                    FeatureRow::Identity(handlers::apply_identity_claim(
                        state,
                        owner,
                        username,
                        display_name,
                        tx_id,
                        &matched.program_id,
                        &matched.function_name,
                        now,
                    )?)
                }
            };

            state.push_event(
                feature,
                &ledger_tx_id,
                owner,
                LedgerOutcome::ConfirmedSettled,
                Some(matched.program_id.clone()),
                Some(matched.function_name.clone()),
                now,
            );

            let receipt = SettlementReceipt {
                intent_id: intent.intent_id.clone(),
                feature_kind: feature,
                row,
            };
            state.receipts.insert(intent.intent_id.clone(), receipt.clone());
            Ok(receipt)
        });

        match result {
            Ok(receipt) => {
                info!(
                    target: "settlement::gate",
                    intent_id = %intent.intent_id,
                    feature = %feature,
                    tx_id = %ledger_tx_id,
                    "Intent settled"
                );
                Ok(receipt)
            }
            Err(err) => {
                // The transaction rolled back; the confirmed transaction was
                // rejected by feature invariants rather than policy.
                self.record_event(
                    intent,
                    feature,
                    &ledger_tx_id,
                    LedgerOutcome::ConfirmedRejected,
                    Some(matched.program_id.clone()),
                    Some(matched.function_name.clone()),
                );
                Err(err)
            }
        }
    }

    /// Polls the oracle at the configured cadence until `tx_id` is terminal
    /// or the deadline elapses. Unknown states keep polling.
    async fn wait_for_terminal(
        &self,
        tx_id: &str,
        deadline: Instant,
    ) -> Result<TxStatusSnapshot, SettleError> {
        let poll = Duration::from_millis(self.inner.config.poll_ms.max(1));
        loop {
            let snapshot = self.inner.oracle.lookup(tx_id).await;
            match snapshot.state {
                TxState::Confirmed => return Ok(snapshot),
                TxState::Failed => {
                    return Err(SettleError::TxFailed {
                        tx_id: tx_id.to_owned(),
                        raw_state: snapshot
                            .raw_state
                            .unwrap_or_else(|| "failed".to_owned()),
                    })
                }
                TxState::Pending | TxState::Unknown => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SettleError::Timeout { tx_id: tx_id.to_owned() });
                    }
                    sleep(poll.min(deadline - now)).await;
                }
            }
        }
    }

    /// Appends a terminal outcome to the settlement ledger.
    fn record_event(
        &self,
        intent: &SettlementIntent,
        feature: FeatureKind,
        tx_id: &str,
        outcome: LedgerOutcome,
        program_id: Option<String>,
        function_name: Option<String>,
    ) {
        let now = unix_epoch_ms();
        let owner = intent.owner_user_id;
        // Infallible over the in-memory engine; a storage failure here would
        // surface from the enclosing settlement instead.
        let _ = self.inner.store.transaction(|state| {
            state.push_event(feature, tx_id, owner, outcome, program_id.clone(), function_name.clone(), now);
            Ok(())
        });
    }
}

/// Metrics for the settlement gate.
#[derive(Metrics)]
#[metrics(scope = "settlement")]
struct GateMetrics {
    /// Intents applied successfully.
    settled_intents: Counter,
    /// Intents rejected by policy or feature invariants.
    rejected_intents: Counter,
    /// Intents whose transaction failed on chain.
    failed_intents: Counter,
    /// Intents that hit the settlement deadline.
    timed_out_intents: Counter,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        intent::RecipientRef,
        store::{InvoiceStatus, SwapQuote, User},
    };
    use envelop_aleo::oracle::mock::MockStatusSource;
    use serde_json::json;

    const OWNER_WALLET: &str = "aleo1owner";

    fn seeded_store() -> Arc<Store> {
        let store = Arc::new(Store::new());
        store.upsert_user(User {
            user_id: 1,
            wallet_address: OWNER_WALLET.to_owned(),
            phone: None,
            username: None,
            display_name: None,
            username_claim_tx_id: None,
        });
        store.upsert_user(User {
            user_id: 2,
            wallet_address: "aleo1friend".to_owned(),
            phone: Some("+15550001111".to_owned()),
            username: None,
            display_name: None,
            username_claim_tx_id: None,
        });
        store.insert_swap_quote(SwapQuote {
            quote_id: "q1".to_owned(),
            owner_user_id: 1,
            token_in: "ALEO".to_owned(),
            token_out: "USDC".to_owned(),
            amount_in_atomic: 1_000_000,
            amount_out_atomic: 500_000,
            expires_at: unix_epoch_ms() + 60_000,
        });
        store
    }

    fn gate_with(
        store: Arc<Store>,
        mock: &MockStatusSource,
        config: GateConfig,
    ) -> SettlementGate {
        let oracle = Arc::new(StatusOracle::new(vec![Box::new(mock.clone())], 0));
        SettlementGate::new(store, oracle, PolicyTable::defaults(true), config)
    }

    fn confirmed_swap_body(signer: &str) -> serde_json::Value {
        json!({
            "status": "confirmed",
            "transaction": {
                "owner": signer,
                "execution": {"transitions": [
                    {"program": "envelop_swap.aleo", "function": "create_swap_request"},
                    {"program": "envelop_swap.aleo", "function": "settle_swap_onchain"}
                ]}
            }
        })
    }

    fn swap_intent(intent_id: &str) -> SettlementIntent {
        SettlementIntent {
            intent_id: intent_id.to_owned(),
            owner_user_id: 1,
            payload: IntentPayload::SwapExecute {
                tx_id: "at1aaa".to_owned(),
                quote_id: "q1".to_owned(),
            },
        }
    }

    #[tokio::test]
    async fn swap_happy_path() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1aaa", [confirmed_swap_body(OWNER_WALLET)]);
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        let receipt = gate.settle(swap_intent("i1")).await.unwrap();
        let FeatureRow::Swap(swap) = &receipt.row else { panic!("expected swap row") };
        assert_eq!(swap.aleo_tx_id, "at1aaa");
        assert_eq!(swap.quote_id, "q1");

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, LedgerOutcome::ConfirmedSettled);
        assert_eq!(events[0].program_id.as_deref(), Some("envelop_swap.aleo"));

        // Mode A: balances untouched.
        assert_eq!(store.balance(1, "ALEO"), 0);
        assert_eq!(store.balance(1, "USDC"), 0);
    }

    #[tokio::test]
    async fn swap_simulated_ledger_moves_balances() {
        let store = seeded_store();
        store.set_balance(1, "ALEO", 2_000_000);
        let mock = MockStatusSource::new();
        mock.script("at1aaa", [confirmed_swap_body(OWNER_WALLET)]);
        let config = GateConfig { onchain_ledger: false, ..Default::default() };
        let gate = gate_with(store.clone(), &mock, config);

        gate.settle(swap_intent("i1")).await.unwrap();
        assert_eq!(store.balance(1, "ALEO"), 1_000_000);
        assert_eq!(store.balance(1, "USDC"), 500_000);
    }

    #[tokio::test]
    async fn wrong_program_is_policy_mismatch() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script(
            "at1aaa",
            [json!({
                "status": "confirmed",
                "transaction": {
                    "owner": OWNER_WALLET,
                    "execution": {"transitions": [
                        {"program": "envelop_payments.aleo", "function": "create_payment_intent"}
                    ]}
                }
            })],
        );
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        let err = gate.settle(swap_intent("i1")).await.unwrap_err();
        assert_eq!(err.kind(), "policy_mismatch");
        assert!(store.swaps().is_empty());

        let events = store.events();
        assert_eq!(events[0].outcome, LedgerOutcome::ConfirmedRejected);
    }

    #[tokio::test]
    async fn wrong_signer_is_signer_mismatch() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1aaa", [confirmed_swap_body("aleo1mallory")]);
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        let err = gate.settle(swap_intent("i1")).await.unwrap_err();
        assert_eq!(err.kind(), "signer_mismatch");
        assert!(store.swaps().is_empty());
    }

    #[tokio::test]
    async fn failed_transaction_is_fatal() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1aaa", [json!({"status": "rejected"})]);
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        let err = gate.settle(swap_intent("i1")).await.unwrap_err();
        assert_eq!(err.kind(), "tx_failed");
        assert_eq!(store.events()[0].outcome, LedgerOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_transaction_times_out() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1aaa", [json!({"status": "pending"})]);
        let config = GateConfig { poll_ms: 4_000, timeout_ms: 8_000, ..Default::default() };
        let gate = gate_with(store.clone(), &mock, config);

        let err = gate.settle(swap_intent("i1")).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(store.swaps().is_empty());
        assert_eq!(store.events()[0].outcome, LedgerOutcome::Timeout);
        // Polls at 0, 4000 and 8000 virtual milliseconds.
        assert_eq!(mock.fetches(), 3);
    }

    #[tokio::test]
    async fn zero_timeout_times_out_on_first_poll() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1aaa", [json!({"status": "pending"})]);
        let config = GateConfig { timeout_ms: 0, ..Default::default() };
        let gate = gate_with(store.clone(), &mock, config);

        let err = gate.settle(swap_intent("i1")).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(mock.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_rides_out_pending_and_unknown() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script(
            "at1aaa",
            [
                json!({"status": "pending"}),
                json!({"status": "broadcasting"}),
                confirmed_swap_body(OWNER_WALLET),
            ],
        );
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        let receipt = gate.settle(swap_intent("i1")).await.unwrap();
        assert!(matches!(receipt.row, FeatureRow::Swap(_)));
        assert_eq!(mock.fetches(), 3);
    }

    #[tokio::test]
    async fn settle_is_idempotent_per_intent_id() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1aaa", [confirmed_swap_body(OWNER_WALLET)]);
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        let first = gate.settle(swap_intent("i1")).await.unwrap();
        let fetches_after_first = mock.fetches();
        let second = gate.settle(swap_intent("i1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.swaps().len(), 1);
        // The replay never polls the oracle.
        assert_eq!(mock.fetches(), fetches_after_first);
    }

    #[tokio::test]
    async fn expired_quote_is_rejected_after_confirmation() {
        let store = seeded_store();
        store.insert_swap_quote(SwapQuote {
            quote_id: "q-old".to_owned(),
            owner_user_id: 1,
            token_in: "ALEO".to_owned(),
            token_out: "USDC".to_owned(),
            amount_in_atomic: 1,
            amount_out_atomic: 1,
            expires_at: unix_epoch_ms().saturating_sub(1),
        });
        let mock = MockStatusSource::new();
        mock.script("at1aaa", [confirmed_swap_body(OWNER_WALLET)]);
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        let err = gate
            .settle(SettlementIntent {
                intent_id: "i1".to_owned(),
                owner_user_id: 1,
                payload: IntentPayload::SwapExecute {
                    tx_id: "at1aaa".to_owned(),
                    quote_id: "q-old".to_owned(),
                },
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "conflict");
        assert!(store.swaps().is_empty());
        assert_eq!(store.events()[0].outcome, LedgerOutcome::ConfirmedRejected);
    }

    fn yield_body(signer: &str, function: &str) -> serde_json::Value {
        json!({
            "status": "finalized",
            "transaction": {
                "owner": signer,
                "execution": {"transitions": [
                    {"program": "envelop_yield.aleo", "function": function}
                ]}
            }
        })
    }

    #[tokio::test]
    async fn yield_plan_verifies_every_step_in_order() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1b", [yield_body(OWNER_WALLET, "stake_onchain")]);
        mock.script("at1c", [yield_body(OWNER_WALLET, "claim_onchain")]);
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        let receipt = gate
            .settle(SettlementIntent {
                intent_id: "y1".to_owned(),
                owner_user_id: 1,
                payload: IntentPayload::YieldStep {
                    yield_quote_id: "yq1".to_owned(),
                    steps: vec![
                        YieldStepPlan {
                            program_id: "envelop_yield.aleo".to_owned(),
                            function_name: "stake_onchain".to_owned(),
                            tx_id: "at1b".to_owned(),
                        },
                        YieldStepPlan {
                            program_id: "envelop_yield.aleo".to_owned(),
                            function_name: "claim_onchain".to_owned(),
                            tx_id: "at1c".to_owned(),
                        },
                    ],
                },
            })
            .await
            .unwrap();

        let FeatureRow::YieldAction(action) = &receipt.row else { panic!("expected yield row") };
        assert_eq!(action.final_tx_id, "at1c");
        assert_eq!(action.steps.len(), 2);

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tx_id, "at1c");
    }

    #[tokio::test]
    async fn yield_plan_aborts_on_step_mismatch() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        // The confirmed transition does not match the planned function.
        mock.script("at1b", [yield_body(OWNER_WALLET, "unstake_onchain")]);
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        let err = gate
            .settle(SettlementIntent {
                intent_id: "y1".to_owned(),
                owner_user_id: 1,
                payload: IntentPayload::YieldStep {
                    yield_quote_id: "yq1".to_owned(),
                    steps: vec![YieldStepPlan {
                        program_id: "envelop_yield.aleo".to_owned(),
                        function_name: "stake_onchain".to_owned(),
                        tx_id: "at1b".to_owned(),
                    }],
                },
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "policy_mismatch");
        assert!(store.read(|state| state.yield_actions.is_empty()));
    }

    fn claim_body(signer: &str, username: &str, display_name: &str) -> serde_json::Value {
        use envelop_common::field::hash_to_field;
        json!({
            "status": "confirmed",
            "transaction": {
                "owner": signer,
                "execution": {"transitions": [{
                    "program": "envelop_identity.aleo",
                    "function": "claim_username",
                    "inputs": [hash_to_field(username), hash_to_field(display_name)]
                }]}
            }
        })
    }

    fn claim_intent(intent_id: &str, tx_id: &str, username: &str) -> SettlementIntent {
        SettlementIntent {
            intent_id: intent_id.to_owned(),
            owner_user_id: 1,
            payload: IntentPayload::IdentityClaim {
                tx_id: tx_id.to_owned(),
                username: username.to_owned(),
                display_name: "Alice".to_owned(),
            },
        }
    }

    #[tokio::test]
    async fn username_claim_is_one_shot() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1d", [claim_body(OWNER_WALLET, "alice", "Alice")]);
        mock.script("at1e", [claim_body(OWNER_WALLET, "alicia", "Alice")]);
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        gate.settle(claim_intent("c1", "at1d", "alice")).await.unwrap();
        let user = store.user(1).unwrap();
        assert_eq!(user.username.as_deref(), Some("alice"));
        assert_eq!(user.username_claim_tx_id.as_deref(), Some("at1d"));

        let err = gate.settle(claim_intent("c2", "at1e", "alicia")).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(store.user(1).unwrap().username.as_deref(), Some("alice"));
        assert!(store.identity_claim("alicia").is_none());
    }

    #[tokio::test]
    async fn claim_with_mismatched_hashes_is_rejected() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1d", [claim_body(OWNER_WALLET, "someoneelse", "Alice")]);
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        let err = gate.settle(claim_intent("c1", "at1d", "alice")).await.unwrap_err();
        assert_eq!(err.kind(), "claim_input_mismatch");
        assert!(store.identity_claim("alice").is_none());
    }

    #[tokio::test]
    async fn invalid_username_fails_before_polling() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        let gate = gate_with(store, &mock, GateConfig::default());

        let err = gate.settle(claim_intent("c1", "at1d", "Not Valid")).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        assert_eq!(mock.fetches(), 0);
    }

    fn payment_body(signer: &str) -> serde_json::Value {
        json!({
            "status": "confirmed",
            "transaction": {
                "owner": signer,
                "execution": {"transitions": [
                    {"program": "envelop_payments.aleo", "function": "create_payment_intent"}
                ]}
            }
        })
    }

    #[tokio::test]
    async fn payment_resolves_recipient_through_claim_index() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1p", [payment_body(OWNER_WALLET)]);
        mock.script("at1claim", [claim_body("aleo1friend", "bob", "Bob")]);
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        // Bob claims his username, then Alice pays @bob.
        gate.settle(SettlementIntent {
            intent_id: "c-bob".to_owned(),
            owner_user_id: 2,
            payload: IntentPayload::IdentityClaim {
                tx_id: "at1claim".to_owned(),
                username: "bob".to_owned(),
                display_name: "Bob".to_owned(),
            },
        })
        .await
        .unwrap();

        let receipt = gate
            .settle(SettlementIntent {
                intent_id: "p1".to_owned(),
                owner_user_id: 1,
                payload: IntentPayload::PaymentSend {
                    tx_id: "at1p".to_owned(),
                    recipient: RecipientRef::Username("bob".to_owned()),
                    token: "USDC".to_owned(),
                    amount_atomic: 250,
                    memo: None,
                },
            })
            .await
            .unwrap();

        let FeatureRow::Payment(payment) = &receipt.row else { panic!("expected payment row") };
        assert_eq!(payment.recipient_user_id, Some(2));
        assert_eq!(payment.recipient_address, "aleo1friend");
    }

    #[tokio::test]
    async fn onchain_only_recipient_policy_rejects_phone() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1p", [payment_body(OWNER_WALLET)]);
        let config = GateConfig { require_onchain_recipient: true, ..Default::default() };
        let gate = gate_with(store.clone(), &mock, config);

        let err = gate
            .settle(SettlementIntent {
                intent_id: "p1".to_owned(),
                owner_user_id: 1,
                payload: IntentPayload::PaymentSend {
                    tx_id: "at1p".to_owned(),
                    recipient: RecipientRef::Phone("+15550001111".to_owned()),
                    token: "USDC".to_owned(),
                    amount_atomic: 250,
                    memo: None,
                },
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "recipient_unresolved");
        assert!(store.payments().is_empty());
    }

    fn invoice_body(signer: &str, function: &str) -> serde_json::Value {
        json!({
            "status": "confirmed",
            "transaction": {
                "owner": signer,
                "execution": {"transitions": [
                    {"program": "envelop_invoices.aleo", "function": function}
                ]}
            }
        })
    }

    #[tokio::test]
    async fn invoice_create_then_pay() {
        let store = seeded_store();
        let mock = MockStatusSource::new();
        mock.script("at1ic", [invoice_body("aleo1friend", "create_invoice")]);
        mock.script("at1ip", [invoice_body(OWNER_WALLET, "pay_invoice")]);
        let gate = gate_with(store.clone(), &mock, GateConfig::default());

        gate.settle(SettlementIntent {
            intent_id: "inv-c".to_owned(),
            owner_user_id: 2,
            payload: IntentPayload::InvoiceCreate {
                tx_id: "at1ic".to_owned(),
                invoice_id: "inv-1".to_owned(),
                token: "USDC".to_owned(),
                amount_atomic: 990,
                payer: None,
                memo: Some("consulting".to_owned()),
            },
        })
        .await
        .unwrap();
        assert_eq!(store.invoice("inv-1").unwrap().status, InvoiceStatus::Open);

        gate.settle(SettlementIntent {
            intent_id: "inv-p".to_owned(),
            owner_user_id: 1,
            payload: IntentPayload::InvoicePay {
                tx_id: "at1ip".to_owned(),
                invoice_id: "inv-1".to_owned(),
            },
        })
        .await
        .unwrap();

        let invoice = store.invoice("inv-1").unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.paid_tx_id.as_deref(), Some("at1ip"));
        assert_eq!(store.payments()[0].invoice_id.as_deref(), Some("inv-1"));
    }
}
