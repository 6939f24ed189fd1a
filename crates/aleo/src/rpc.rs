//! `relay_` RPC namespace.
//!
//! The inbound surface of the relay service. Authentication and resource
//! ownership checks happen in the gateway in front of this server; by the
//! time a call lands here the `owner_user_id` is trusted.

use crate::{
    oracle::StatusOracle,
    submit::{SubmissionMode, SubmissionStatus, SubmitError, SubmitRequest, Submitter},
    TxState,
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
use std::sync::Arc;
use tracing::trace;

/// A `relay_submitTransaction` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySubmitParams {
    /// The authenticated user on whose behalf the call is made.
    pub owner_user_id: u64,
    /// Serialized signed transaction to broadcast.
    #[serde(default)]
    pub serialized_transaction: Option<String>,
    /// Already-broadcast transaction id to register.
    #[serde(default)]
    pub tx_id: Option<String>,
    /// Caller idempotency key.
    #[serde(default)]
    pub client_tx_id: Option<String>,
}

/// Reply to `relay_submitTransaction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySubmitReply {
    /// Store-assigned submission id.
    pub submission_id: u64,
    /// Submission outcome.
    pub status: SubmissionStatus,
    /// How the submission was handled.
    pub mode: SubmissionMode,
    /// Chain transaction id, when known.
    pub tx_id: Option<String>,
    /// Diagnostic note on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Reply to `relay_transactionStatus`. Pending and unknown are ordinary
/// replies, not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStatusReply {
    /// The queried transaction id.
    pub tx_id: String,
    /// Normalized state.
    pub normalized_state: TxState,
    /// Raw status string from the answering endpoint.
    pub raw_state: Option<String>,
    /// Which endpoint answered.
    pub source: String,
}

/// Envelop `relay_` RPC namespace.
#[cfg_attr(not(test), rpc(server, namespace = "relay"))]
#[cfg_attr(test, rpc(server, client, namespace = "relay"))]
pub trait RelayApi {
    /// Submit a user-signed transaction for broadcast, or register an
    /// already-broadcast transaction id.
    #[method(name = "submitTransaction")]
    async fn submit_transaction(&self, params: RelaySubmitParams) -> RpcResult<RelaySubmitReply>;

    /// Read the normalized status of a transaction.
    #[method(name = "transactionStatus")]
    async fn transaction_status(&self, tx_id: String) -> RpcResult<RelayStatusReply>;
}

/// Implementation of the `relay_` namespace.
#[derive(Debug)]
pub struct RelayRpc {
    inner: Arc<RelayRpcInner>,
}

#[derive(Debug)]
struct RelayRpcInner {
    submitter: Submitter,
    oracle: Arc<StatusOracle>,
}

impl RelayRpc {
    /// Creates the namespace over a submitter and a status oracle.
    pub fn new(submitter: Submitter, oracle: Arc<StatusOracle>) -> Self {
        Self { inner: Arc::new(RelayRpcInner { submitter, oracle }) }
    }
}

#[async_trait]
impl RelayApiServer for RelayRpc {
    async fn submit_transaction(&self, params: RelaySubmitParams) -> RpcResult<RelaySubmitReply> {
        trace!(target: "rpc::relay", owner = params.owner_user_id, "Serving relay_submitTransaction");

        let record = self
            .inner
            .submitter
            .submit(SubmitRequest {
                owner_user_id: params.owner_user_id,
                serialized_tx: params.serialized_transaction,
                tx_id: params.tx_id,
                client_tx_id: params.client_tx_id,
            })
            .await?;

        Ok(RelaySubmitReply {
            submission_id: record.submission_id,
            status: record.status,
            mode: record.mode,
            tx_id: record.tx_id,
            note: record.note,
        })
    }

    async fn transaction_status(&self, tx_id: String) -> RpcResult<RelayStatusReply> {
        trace!(target: "rpc::relay", %tx_id, "Serving relay_transactionStatus");

        let snapshot = self.inner.oracle.lookup(&tx_id).await;
        Ok(RelayStatusReply {
            tx_id: snapshot.tx_id,
            normalized_state: snapshot.state,
            raw_state: snapshot.raw_state,
            source: snapshot.source,
        })
    }
}

impl From<SubmitError> for ErrorObject<'static> {
    fn from(error: SubmitError) -> Self {
        let code = match &error {
            SubmitError::InvalidArgument(_) => INVALID_PARAMS_CODE,
            SubmitError::NotConfigured => INTERNAL_ERROR_CODE,
        };
        Self::owned::<()>(code, error.to_string(), None)
    }
}
