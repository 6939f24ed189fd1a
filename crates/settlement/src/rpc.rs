//! `settlement_` RPC namespace.
//!
//! Thin mapping from feature calls to [`SettlementIntent`]s awaited on the
//! gate. Authentication happens in the gateway in front of this server; the
//! `owner_user_id` in each call is trusted. Each error reply carries the
//! machine-readable error kind (and the transaction state for terminal
//! transaction failures) in its data field.

use crate::{
    error::SettleError,
    gate::SettlementGate,
    intent::{IntentPayload, RecipientRef, SettlementIntent, YieldStepPlan},
    store::{
        FeatureRow, IdentityClaimRow, InvoiceRecord, PaymentRecord, SwapRecord,
        YieldActionRecord,
    },
};
use jsonrpsee::{
    core::{async_trait, RpcResult},
    proc_macros::rpc,
    types::{
        error::{INTERNAL_ERROR_CODE, INVALID_PARAMS_CODE},
        ErrorObject,
    },
};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// JSON-RPC error code for settlement rejections.
const SETTLEMENT_ERROR_CODE: i32 = -32002;

/// A `settlement_executeSwap` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteSwapParams {
    /// The authenticated user.
    pub owner_user_id: u64,
    /// Idempotency key for the settlement.
    pub intent_id: String,
    /// The confirmed (or pending) swap transaction.
    pub tx_id: String,
    /// The quote being executed.
    pub quote_id: String,
}

/// A `settlement_sendPayment` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPaymentParams {
    /// The authenticated user.
    pub owner_user_id: u64,
    /// Idempotency key for the settlement.
    pub intent_id: String,
    /// The payment transaction.
    pub tx_id: String,
    /// Who receives the payment.
    pub recipient: RecipientRef,
    /// Token identifier.
    pub token: String,
    /// Amount in atomic units.
    pub amount_atomic: u64,
    /// Optional memo.
    #[serde(default)]
    pub memo: Option<String>,
}

/// A `settlement_createInvoice` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvoiceParams {
    /// The authenticated user.
    pub owner_user_id: u64,
    /// Idempotency key for the settlement.
    pub intent_id: String,
    /// The invoice creation transaction.
    pub tx_id: String,
    /// Caller-assigned invoice id.
    pub invoice_id: String,
    /// Token identifier.
    pub token: String,
    /// Amount in atomic units.
    pub amount_atomic: u64,
    /// Restricts who may pay, when present.
    #[serde(default)]
    pub payer: Option<RecipientRef>,
    /// Optional memo.
    #[serde(default)]
    pub memo: Option<String>,
}

/// A `settlement_payInvoice` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayInvoiceParams {
    /// The authenticated user.
    pub owner_user_id: u64,
    /// Idempotency key for the settlement.
    pub intent_id: String,
    /// The payment transaction.
    pub tx_id: String,
    /// The invoice being paid.
    pub invoice_id: String,
}

/// A `settlement_solveYield` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveYieldParams {
    /// The authenticated user.
    pub owner_user_id: u64,
    /// Idempotency key for the settlement.
    pub intent_id: String,
    /// The yield quote the plan was built from.
    pub yield_quote_id: String,
    /// Planned transitions with their transaction ids, in order.
    pub steps: Vec<YieldStepPlan>,
}

/// A `settlement_claimUsername` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimUsernameParams {
    /// The authenticated user.
    pub owner_user_id: u64,
    /// Idempotency key for the settlement.
    pub intent_id: String,
    /// The claim transaction.
    pub tx_id: String,
    /// The claimed username, lowercase.
    pub username: String,
    /// The claimed display name.
    pub display_name: String,
}

/// Envelop `settlement_` RPC namespace.
#[cfg_attr(not(test), rpc(server, namespace = "settlement"))]
#[cfg_attr(test, rpc(server, client, namespace = "settlement"))]
pub trait SettlementApi {
    /// Settle a swap once its transaction confirms.
    #[method(name = "executeSwap")]
    async fn execute_swap(&self, params: ExecuteSwapParams) -> RpcResult<SwapRecord>;

    /// Settle an outbound payment once its transaction confirms.
    #[method(name = "sendPayment")]
    async fn send_payment(&self, params: SendPaymentParams) -> RpcResult<PaymentRecord>;

    /// Record an invoice once its creation transaction confirms.
    #[method(name = "createInvoice")]
    async fn create_invoice(&self, params: CreateInvoiceParams) -> RpcResult<InvoiceRecord>;

    /// Pay an open invoice once the payment transaction confirms.
    #[method(name = "payInvoice")]
    async fn pay_invoice(&self, params: PayInvoiceParams) -> RpcResult<InvoiceRecord>;

    /// Verify and record a multi-step yield action.
    #[method(name = "solveYield")]
    async fn solve_yield(&self, params: SolveYieldParams) -> RpcResult<YieldActionRecord>;

    /// Claim a username once the claim transaction confirms.
    #[method(name = "claimUsername")]
    async fn claim_username(&self, params: ClaimUsernameParams) -> RpcResult<IdentityClaimRow>;
}

/// Implementation of the `settlement_` namespace over a gate.
#[derive(Debug)]
pub struct SettlementRpc {
    gate: SettlementGate,
}

impl SettlementRpc {
    /// Creates the namespace over a settlement gate.
    pub const fn new(gate: SettlementGate) -> Self {
        Self { gate }
    }

    async fn settle(
        &self,
        owner_user_id: u64,
        intent_id: String,
        payload: IntentPayload,
    ) -> Result<FeatureRow, SettleError> {
        let receipt = self
            .gate
            .settle(SettlementIntent { intent_id, owner_user_id, payload })
            .await?;
        Ok(receipt.row)
    }
}

#[async_trait]
impl SettlementApiServer for SettlementRpc {
    async fn execute_swap(&self, params: ExecuteSwapParams) -> RpcResult<SwapRecord> {
        trace!(target: "rpc::settlement", owner = params.owner_user_id, "Serving settlement_executeSwap");
        let row = self
            .settle(
                params.owner_user_id,
                params.intent_id,
                IntentPayload::SwapExecute { tx_id: params.tx_id, quote_id: params.quote_id },
            )
            .await?;
        match row {
            FeatureRow::Swap(swap) => Ok(swap),
            _ => Err(unexpected_row()),
        }
    }

    async fn send_payment(&self, params: SendPaymentParams) -> RpcResult<PaymentRecord> {
        trace!(target: "rpc::settlement", owner = params.owner_user_id, "Serving settlement_sendPayment");
        let row = self
            .settle(
                params.owner_user_id,
                params.intent_id,
                IntentPayload::PaymentSend {
                    tx_id: params.tx_id,
                    recipient: params.recipient,
                    token: params.token,
                    amount_atomic: params.amount_atomic,
                    memo: params.memo,
                },
            )
            .await?;
        match row {
            FeatureRow::Payment(payment) => Ok(payment),
            _ => Err(unexpected_row()),
        }
    }

    async fn create_invoice(&self, params: CreateInvoiceParams) -> RpcResult<InvoiceRecord> {
        trace!(target: "rpc::settlement", owner = params.owner_user_id, "Serving settlement_createInvoice");
        let row = self
            .settle(
                params.owner_user_id,
                params.intent_id,
                IntentPayload::InvoiceCreate {
                    tx_id: params.tx_id,
                    invoice_id: params.invoice_id,
                    token: params.token,
                    amount_atomic: params.amount_atomic,
                    payer: params.payer,
                    memo: params.memo,
                },
            )
            .await?;
        match row {
            FeatureRow::Invoice(invoice) => Ok(invoice),
            _ => Err(unexpected_row()),
        }
    }

    async fn pay_invoice(&self, params: PayInvoiceParams) -> RpcResult<InvoiceRecord> {
        trace!(target: "rpc::settlement", owner = params.owner_user_id, "Serving settlement_payInvoice");
        let row = self
            .settle(
                params.owner_user_id,
                params.intent_id,
                IntentPayload::InvoicePay { tx_id: params.tx_id, invoice_id: params.invoice_id },
            )
            .await?;
        match row {
            FeatureRow::Invoice(invoice) => Ok(invoice),
            _ => Err(unexpected_row()),
        }
    }

    async fn solve_yield(&self, params: SolveYieldParams) -> RpcResult<YieldActionRecord> {
        trace!(target: "rpc::settlement", owner = params.owner_user_id, "Serving settlement_solveYield");
        let row = self
            .settle(
                params.owner_user_id,
                params.intent_id,
                IntentPayload::YieldStep {
                    yield_quote_id: params.yield_quote_id,
                    steps: params.steps,
                },
            )
            .await?;
        match row {
            FeatureRow::YieldAction(action) => Ok(action),
            _ => Err(unexpected_row()),
        }
    }

    async fn claim_username(&self, params: ClaimUsernameParams) -> RpcResult<IdentityClaimRow> {
        trace!(target: "rpc::settlement", owner = params.owner_user_id, "Serving settlement_claimUsername");
        let row = self
            .settle(
                params.owner_user_id,
                params.intent_id,
                IntentPayload::IdentityClaim {
                    tx_id: params.tx_id,
                    username: params.username,
                    display_name: params.display_name,
                },
            )
            .await?;
        match row {
            FeatureRow::Identity(claim) => Ok(claim),
            _ => Err(unexpected_row()),
        }
    }
}

fn unexpected_row() -> ErrorObject<'static> {
    ErrorObject::owned::<()>(INTERNAL_ERROR_CODE, "settlement returned an unexpected row", None)
}

impl From<SettleError> for ErrorObject<'static> {
    fn from(error: SettleError) -> Self {
        let code = match &error {
            SettleError::InvalidArgument(_) => INVALID_PARAMS_CODE,
            SettleError::Storage(_) => INTERNAL_ERROR_CODE,
            _ => SETTLEMENT_ERROR_CODE,
        };
        let tx_state = match &error {
            SettleError::TxFailed { .. } => Some("failed"),
            SettleError::Timeout { .. } => Some("pending"),
            _ => None,
        };
        let data = serde_json::json!({ "error": error.kind(), "tx_state": tx_state });
        Self::owned(code, error.to_string(), Some(data))
    }
}
