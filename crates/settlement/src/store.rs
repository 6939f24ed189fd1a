//! The settlement store.
//!
//! An in-memory storage engine behind the same transactional surface a SQL
//! engine would offer: [`Store::transaction`] runs a closure against the
//! state and rolls the state back wholesale if the closure errors, so a
//! failed settlement never leaves partial rows behind. Verification happens
//! before the transaction; no network I/O ever runs under the state lock.

use crate::{error::SettleError, policy::FeatureKind};
use envelop_aleo::submit::{NewSubmission, SubmissionRecord, SubmissionStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A backend user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique user id.
    pub user_id: u64,
    /// The user's Aleo wallet address.
    pub wallet_address: String,
    /// Legacy phone identifier, when onboarded by phone.
    pub phone: Option<String>,
    /// Claimed username, set at most once.
    pub username: Option<String>,
    /// Display name recorded with the username claim.
    pub display_name: Option<String>,
    /// The transaction that claimed the username.
    pub username_claim_tx_id: Option<String>,
}

/// A swap quote issued to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapQuote {
    /// Quote id.
    pub quote_id: String,
    /// The user the quote was issued to.
    pub owner_user_id: u64,
    /// Token sold.
    pub token_in: String,
    /// Token bought.
    pub token_out: String,
    /// Amount sold, atomic units.
    pub amount_in_atomic: u64,
    /// Amount bought, atomic units.
    pub amount_out_atomic: u64,
    /// Unix epoch milliseconds after which the quote is unusable.
    pub expires_at: u64,
}

/// A settled swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRecord {
    /// Row id.
    pub swap_id: u64,
    /// The quote this swap executed.
    pub quote_id: String,
    /// The swapping user.
    pub owner_user_id: u64,
    /// Token sold.
    pub token_in: String,
    /// Token bought.
    pub token_out: String,
    /// Amount sold, atomic units.
    pub amount_in_atomic: u64,
    /// Amount bought, atomic units.
    pub amount_out_atomic: u64,
    /// The confirmed chain transaction.
    pub aleo_tx_id: String,
    /// Unix epoch milliseconds.
    pub created_at: u64,
}

/// A settled payment, standalone or against an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Row id.
    pub payment_id: u64,
    /// The paying user.
    pub sender_user_id: u64,
    /// The receiving user, when resolved to one.
    pub recipient_user_id: Option<u64>,
    /// The receiving wallet address.
    pub recipient_address: String,
    /// Token identifier.
    pub token: String,
    /// Amount in atomic units.
    pub amount_atomic: u64,
    /// The invoice this payment settles, if any.
    pub invoice_id: Option<String>,
    /// Hash-to-field of the memo, when one was attached.
    pub memo_hash: Option<String>,
    /// The confirmed chain transaction.
    pub aleo_tx_id: String,
    /// Unix epoch milliseconds.
    pub created_at: u64,
}

/// Invoice lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Awaiting payment.
    Open,
    /// Paid and closed.
    Paid,
}

/// An invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    /// Caller-assigned invoice id.
    pub invoice_id: String,
    /// The invoicing user.
    pub creator_user_id: u64,
    /// Token identifier.
    pub token: String,
    /// Amount in atomic units.
    pub amount_atomic: u64,
    /// When set, only this user may pay.
    pub payer_user_id: Option<u64>,
    /// Hash-to-field of the memo, when one was attached.
    pub memo_hash: Option<String>,
    /// Lifecycle status.
    pub status: InvoiceStatus,
    /// The confirmed creation transaction.
    pub create_tx_id: String,
    /// The confirmed payment transaction, once paid.
    pub paid_tx_id: Option<String>,
    /// Unix epoch milliseconds.
    pub created_at: u64,
}

/// A completed multi-step yield action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YieldActionRecord {
    /// Row id.
    pub action_id: u64,
    /// The yield quote the plan was built from.
    pub yield_quote_id: String,
    /// The acting user.
    pub owner_user_id: u64,
    /// Verified `(program_id, function_name, tx_id)` steps, in order.
    pub steps: Vec<(String, String, String)>,
    /// The last confirmed transaction of the plan.
    pub final_tx_id: String,
    /// Unix epoch milliseconds.
    pub created_at: u64,
}

/// A username claim bound to a wallet address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaimRow {
    /// The claimed username, lowercase, unique.
    pub username: String,
    /// Hash-to-field of the username.
    pub username_hash: String,
    /// Hash-to-field of the display name.
    pub display_name_hash: String,
    /// The wallet the username is bound to; never reassigned.
    pub wallet_address: String,
    /// The confirmed claim transaction.
    pub claim_tx_id: String,
    /// Program that executed the claim.
    pub program_id: String,
    /// Function that executed the claim.
    pub function_name: String,
    /// Unix epoch milliseconds.
    pub claimed_at: u64,
}

/// Terminal settlement outcomes recorded on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    /// Confirmed, policy passed, feature applied.
    ConfirmedSettled,
    /// Confirmed but rejected by policy verification.
    ConfirmedRejected,
    /// The transaction failed on chain.
    Failed,
    /// The deadline elapsed before a terminal state.
    Timeout,
}

impl LedgerOutcome {
    /// Stable string form.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConfirmedSettled => "confirmed_settled",
            Self::ConfirmedRejected => "confirmed_rejected",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

/// One appended settlement ledger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Row id.
    pub event_id: u64,
    /// The feature the intent settled.
    pub feature_kind: FeatureKind,
    /// The transaction id the outcome is about.
    pub tx_id: String,
    /// The intent owner.
    pub owner_user_id: u64,
    /// Terminal outcome.
    pub outcome: LedgerOutcome,
    /// Program id of the matched (or attempted) transition.
    pub program_id: Option<String>,
    /// Function name of the matched (or attempted) transition.
    pub function_name: Option<String>,
    /// Unix epoch milliseconds.
    pub created_at: u64,
}

/// The feature row written by a settled intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureRow {
    /// A settled swap.
    Swap(SwapRecord),
    /// A settled payment.
    Payment(PaymentRecord),
    /// A created or paid invoice.
    Invoice(InvoiceRecord),
    /// A completed yield action.
    YieldAction(YieldActionRecord),
    /// A recorded username claim.
    Identity(IdentityClaimRow),
}

/// The recorded result of an applied intent, replayed on idempotent retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    /// The intent this receipt belongs to.
    pub intent_id: String,
    /// The feature that settled.
    pub feature_kind: FeatureKind,
    /// The row the settlement wrote.
    pub row: FeatureRow,
}

/// All settlement tables.
#[derive(Debug, Clone, Default)]
pub(crate) struct LedgerState {
    pub(crate) users: HashMap<u64, User>,
    /// Balance cache keyed by `(user_id, token)`; authoritative only in
    /// backend-simulated ledger mode.
    pub(crate) balances: HashMap<(u64, String), u64>,
    pub(crate) swap_quotes: HashMap<String, SwapQuote>,
    pub(crate) swaps: Vec<SwapRecord>,
    pub(crate) payments: Vec<PaymentRecord>,
    pub(crate) invoices: HashMap<String, InvoiceRecord>,
    pub(crate) yield_actions: Vec<YieldActionRecord>,
    /// Claim index keyed by username.
    pub(crate) identity_claims: HashMap<String, IdentityClaimRow>,
    pub(crate) events: Vec<LedgerEvent>,
    pub(crate) submissions: Vec<SubmissionRecord>,
    pub(crate) receipts: HashMap<String, SettlementReceipt>,
}

/// The settlement storage engine.
#[derive(Debug, Default)]
pub struct Store {
    state: Mutex<LedgerState>,
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` atomically: if it errors, every mutation it made is rolled
    /// back. The closure must not perform I/O.
    pub(crate) fn transaction<T>(
        &self,
        f: impl FnOnce(&mut LedgerState) -> Result<T, SettleError>,
    ) -> Result<T, SettleError> {
        let mut state = self.state.lock();
        let backup = state.clone();
        match f(&mut state) {
            Ok(value) => Ok(value),
            Err(err) => {
                *state = backup;
                Err(err)
            }
        }
    }

    /// Runs a read-only closure against the state.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&LedgerState) -> T) -> T {
        f(&self.state.lock())
    }

    /// Inserts or replaces a user row.
    pub fn upsert_user(&self, user: User) {
        self.state.lock().users.insert(user.user_id, user);
    }

    /// Returns a user row.
    pub fn user(&self, user_id: u64) -> Option<User> {
        self.read(|state| state.users.get(&user_id).cloned())
    }

    /// Inserts a swap quote.
    pub fn insert_swap_quote(&self, quote: SwapQuote) {
        self.state.lock().swap_quotes.insert(quote.quote_id.clone(), quote);
    }

    /// Sets a cached balance.
    pub fn set_balance(&self, user_id: u64, token: &str, amount: u64) {
        self.state.lock().balances.insert((user_id, token.to_owned()), amount);
    }

    /// Reads a cached balance.
    pub fn balance(&self, user_id: u64, token: &str) -> u64 {
        self.read(|state| state.balances.get(&(user_id, token.to_owned())).copied().unwrap_or(0))
    }

    /// Returns an invoice row.
    pub fn invoice(&self, invoice_id: &str) -> Option<InvoiceRecord> {
        self.read(|state| state.invoices.get(invoice_id).cloned())
    }

    /// Returns the claim row for a username.
    pub fn identity_claim(&self, username: &str) -> Option<IdentityClaimRow> {
        self.read(|state| state.identity_claims.get(username).cloned())
    }

    /// Returns all settled swaps.
    pub fn swaps(&self) -> Vec<SwapRecord> {
        self.read(|state| state.swaps.clone())
    }

    /// Returns all settled payments.
    pub fn payments(&self) -> Vec<PaymentRecord> {
        self.read(|state| state.payments.clone())
    }

    /// Returns the settlement ledger, oldest first.
    pub fn events(&self) -> Vec<LedgerEvent> {
        self.read(|state| state.events.clone())
    }
}

impl LedgerState {
    /// Appends a ledger event, assigning its id.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn push_event(
        &mut self,
        feature_kind: FeatureKind,
        tx_id: &str,
        owner_user_id: u64,
        outcome: LedgerOutcome,
        program_id: Option<String>,
        function_name: Option<String>,
        created_at: u64,
    ) {
        let event_id = self.events.len() as u64 + 1;
        self.events.push(LedgerEvent {
            event_id,
            feature_kind,
            tx_id: tx_id.to_owned(),
            owner_user_id,
            outcome,
            program_id,
            function_name,
            created_at,
        });
    }

    /// Finds the user row owning `wallet_address`.
    pub(crate) fn user_by_wallet(&self, wallet_address: &str) -> Option<&User> {
        self.users.values().find(|user| user.wallet_address == wallet_address)
    }

    /// Finds the user row registered under `phone`.
    pub(crate) fn user_by_phone(&self, phone: &str) -> Option<&User> {
        self.users.values().find(|user| user.phone.as_deref() == Some(phone))
    }
}

impl SubmissionStore for Store {
    fn find_by_client_tx_id(
        &self,
        owner_user_id: u64,
        client_tx_id: &str,
    ) -> Option<SubmissionRecord> {
        self.read(|state| {
            state
                .submissions
                .iter()
                .find(|record| {
                    record.owner_user_id == owner_user_id
                        && record.client_tx_id.as_deref() == Some(client_tx_id)
                })
                .cloned()
        })
    }

    fn insert(&self, submission: NewSubmission) -> SubmissionRecord {
        let mut state = self.state.lock();
        let record = SubmissionRecord {
            submission_id: state.submissions.len() as u64 + 1,
            owner_user_id: submission.owner_user_id,
            client_tx_id: submission.client_tx_id,
            tx_blob_len: submission.tx_blob_len,
            tx_id: submission.tx_id,
            mode: submission.mode,
            status: submission.status,
            response: submission.response,
            note: submission.note,
            created_at: submission.created_at,
        };
        state.submissions.push(record.clone());
        record
    }
}
