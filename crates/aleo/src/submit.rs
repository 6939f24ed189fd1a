//! Relay submitter.
//!
//! Forwards serialized user-signed transactions to the configured broadcast
//! endpoint, or registers transaction ids the client already broadcast
//! itself. Every call persists a [`SubmissionRecord`]; a repeated submit
//! carrying the same `(owner, client_tx_id)` pair returns the existing record
//! unchanged.
//!
//! The submitter never inspects transition semantics and never queries the
//! status oracle; broadcast is single-shot, with the idempotency key as the
//! recovery mechanism for callers that need to retry.

use envelop_common::unix_epoch_ms;
use metrics::Counter;
use metrics_derive::Metrics;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{str::FromStr, sync::Arc};
use tracing::{debug, warn};
use url::Url;

/// Response fields probed for the broadcast-assigned transaction id, in
/// priority order.
const TX_ID_FIELDS: [&str; 3] = ["transactionId", "tx_id", "id"];

/// How a serialized transaction is wrapped for the broadcast endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadMode {
    /// Forward the body unchanged; it must already be JSON.
    Raw,
    /// Pick [`PayloadMode::Raw`] for JSON-looking payloads, wrap the rest.
    #[default]
    Auto,
    /// Send `{"transaction": <payload string>}`.
    Wrapped,
}

impl FromStr for PayloadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "auto" => Ok(Self::Auto),
            "wrapped" => Ok(Self::Wrapped),
            other => Err(format!("invalid payload mode `{other}`")),
        }
    }
}

/// Whether the relay broadcast the transaction or only recorded its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    /// The client broadcast the transaction itself and supplied the id.
    RegisterOnly,
    /// The relay forwarded the transaction to the broadcast endpoint.
    NetworkSubmit,
}

/// Terminal status of a submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// The transaction was registered or broadcast and has an id.
    Accepted,
    /// Broadcast did not yield a transaction id.
    Failed,
}

/// A persisted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    /// Store-assigned unique id.
    pub submission_id: u64,
    /// The authenticated user that submitted.
    pub owner_user_id: u64,
    /// Caller-supplied idempotency key.
    pub client_tx_id: Option<String>,
    /// Length of the serialized transaction blob, when one was supplied.
    pub tx_blob_len: Option<usize>,
    /// Chain transaction id; `None` when broadcast failed to return one.
    pub tx_id: Option<String>,
    /// How the submission was handled.
    pub mode: SubmissionMode,
    /// Outcome.
    pub status: SubmissionStatus,
    /// Broadcast endpoint response body, when one was received.
    pub response: Option<Value>,
    /// Human-readable diagnostic.
    pub note: Option<String>,
    /// Unix epoch milliseconds.
    pub created_at: u64,
}

/// A [`SubmissionRecord`] before the store assigns its id.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    /// See [`SubmissionRecord::owner_user_id`].
    pub owner_user_id: u64,
    /// See [`SubmissionRecord::client_tx_id`].
    pub client_tx_id: Option<String>,
    /// See [`SubmissionRecord::tx_blob_len`].
    pub tx_blob_len: Option<usize>,
    /// See [`SubmissionRecord::tx_id`].
    pub tx_id: Option<String>,
    /// See [`SubmissionRecord::mode`].
    pub mode: SubmissionMode,
    /// See [`SubmissionRecord::status`].
    pub status: SubmissionStatus,
    /// See [`SubmissionRecord::response`].
    pub response: Option<Value>,
    /// See [`SubmissionRecord::note`].
    pub note: Option<String>,
    /// See [`SubmissionRecord::created_at`].
    pub created_at: u64,
}

/// Persistence seam for submissions. The settlement store implements this;
/// tests use the in-memory implementation below.
pub trait SubmissionStore: Send + Sync {
    /// Finds the submission recorded for `(owner, client_tx_id)`, if any.
    fn find_by_client_tx_id(&self, owner_user_id: u64, client_tx_id: &str)
        -> Option<SubmissionRecord>;

    /// Persists a new submission, assigning its id.
    fn insert(&self, submission: NewSubmission) -> SubmissionRecord;
}

/// A submit call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    /// The authenticated user.
    pub owner_user_id: u64,
    /// Serialized signed transaction to broadcast.
    pub serialized_tx: Option<String>,
    /// Already-broadcast transaction id to register.
    pub tx_id: Option<String>,
    /// Caller idempotency key.
    pub client_tx_id: Option<String>,
}

/// Submitter configuration.
#[derive(Debug, Clone, Default)]
pub struct SubmitConfig {
    /// Broadcast endpoint; submission of serialized transactions is refused
    /// when absent.
    pub endpoint: Option<Url>,
    /// Payload wrapping behavior.
    pub payload_mode: PayloadMode,
}

/// Errors surfaced by [`Submitter::submit`].
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The request shape is wrong.
    #[error("{0}")]
    InvalidArgument(&'static str),
    /// No broadcast endpoint is configured.
    #[error("relay broadcast endpoint is not configured")]
    NotConfigured,
}

/// The relay submitter.
#[derive(Debug)]
pub struct Submitter {
    client: reqwest::Client,
    config: SubmitConfig,
    store: Arc<dyn SubmissionStore>,
    metrics: RelayMetrics,
}

impl std::fmt::Debug for dyn SubmissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SubmissionStore")
    }
}

impl Submitter {
    /// Creates a submitter persisting into `store`.
    pub fn new(client: reqwest::Client, config: SubmitConfig, store: Arc<dyn SubmissionStore>) -> Self {
        Self { client, config, store, metrics: RelayMetrics::default() }
    }

    /// Handles a submit call per the relay contract: exactly one of
    /// `serialized_tx` or `tx_id` must be present; a known
    /// `(owner, client_tx_id)` pair short-circuits to the prior record.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmissionRecord, SubmitError> {
        if let Some(client_tx_id) = request.client_tx_id.as_deref() {
            if let Some(existing) =
                self.store.find_by_client_tx_id(request.owner_user_id, client_tx_id)
            {
                debug!(
                    target: "relay::submit",
                    owner = request.owner_user_id,
                    client_tx_id,
                    submission_id = existing.submission_id,
                    "Replaying idempotent submission"
                );
                return Ok(existing);
            }
        }

        match (&request.serialized_tx, &request.tx_id) {
            (Some(_), Some(_)) => {
                self.metrics.invalid_submissions.increment(1);
                Err(SubmitError::InvalidArgument(
                    "provide either a serialized transaction or a transaction id, not both",
                ))
            }
            (None, None) => {
                self.metrics.invalid_submissions.increment(1);
                Err(SubmitError::InvalidArgument(
                    "provide a serialized transaction or a transaction id",
                ))
            }
            (None, Some(tx_id)) => Ok(self.register(&request, tx_id.clone())),
            (Some(serialized), None) => self.broadcast(&request, serialized).await,
        }
    }

    fn register(&self, request: &SubmitRequest, tx_id: String) -> SubmissionRecord {
        self.metrics.accepted_submissions.increment(1);
        self.store.insert(NewSubmission {
            owner_user_id: request.owner_user_id,
            client_tx_id: request.client_tx_id.clone(),
            tx_blob_len: None,
            tx_id: Some(tx_id),
            mode: SubmissionMode::RegisterOnly,
            status: SubmissionStatus::Accepted,
            response: None,
            note: None,
            created_at: unix_epoch_ms(),
        })
    }

    async fn broadcast(
        &self,
        request: &SubmitRequest,
        serialized: &str,
    ) -> Result<SubmissionRecord, SubmitError> {
        let Some(endpoint) = self.config.endpoint.clone() else {
            return Err(SubmitError::NotConfigured);
        };

        let payload = build_payload(serialized, self.config.payload_mode).ok_or({
            SubmitError::InvalidArgument("raw payload mode requires a JSON transaction body")
        })?;

        let (response, note) = match self.client.post(endpoint).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                (response.json::<Value>().await.ok(), None)
            }
            Ok(response) => {
                let status = response.status().as_u16();
                warn!(target: "relay::submit", status, "Broadcast endpoint rejected transaction");
                (response.json::<Value>().await.ok(), Some(format!("broadcast returned http {status}")))
            }
            Err(err) => {
                warn!(target: "relay::submit", %err, "Broadcast endpoint unreachable");
                (None, Some(format!("broadcast failed: {err}")))
            }
        };

        let tx_id = note.is_none().then(|| extract_tx_id(response.as_ref())).flatten();
        let (status, note) = match (&tx_id, note) {
            (Some(_), _) => (SubmissionStatus::Accepted, None),
            (None, Some(note)) => (SubmissionStatus::Failed, Some(note)),
            (None, None) => (
                SubmissionStatus::Failed,
                Some("broadcast returned no transaction id".to_owned()),
            ),
        };

        match status {
            SubmissionStatus::Accepted => self.metrics.accepted_submissions.increment(1),
            SubmissionStatus::Failed => self.metrics.failed_submissions.increment(1),
        }

        Ok(self.store.insert(NewSubmission {
            owner_user_id: request.owner_user_id,
            client_tx_id: request.client_tx_id.clone(),
            tx_blob_len: Some(serialized.len()),
            tx_id,
            mode: SubmissionMode::NetworkSubmit,
            status,
            response,
            note,
            created_at: unix_epoch_ms(),
        }))
    }
}

/// Builds the broadcast body for the configured mode. Returns `None` when raw
/// mode is required but the payload is not JSON.
fn build_payload(serialized: &str, mode: PayloadMode) -> Option<Value> {
    let as_json = || serde_json::from_str::<Value>(serialized).ok();
    match mode {
        PayloadMode::Raw => as_json(),
        PayloadMode::Wrapped => Some(serde_json::json!({ "transaction": serialized })),
        PayloadMode::Auto => {
            let trimmed = serialized.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                as_json().or_else(|| Some(serde_json::json!({ "transaction": serialized })))
            } else {
                Some(serde_json::json!({ "transaction": serialized }))
            }
        }
    }
}

/// Extracts the broadcast-assigned transaction id from a response body.
///
/// Some endpoints answer with a bare JSON string id rather than an object.
fn extract_tx_id(response: Option<&Value>) -> Option<String> {
    let response = response?;
    if let Value::String(id) = response {
        return Some(id.clone());
    }
    TX_ID_FIELDS
        .iter()
        .find_map(|field| response.get(field).and_then(Value::as_str).map(str::to_owned))
}

/// Metrics for the relay submitter.
#[derive(Metrics)]
#[metrics(scope = "relay")]
struct RelayMetrics {
    /// Number of submissions persisted as accepted.
    accepted_submissions: Counter,
    /// Number of broadcasts that did not yield a transaction id.
    failed_submissions: Counter,
    /// Number of malformed submit calls.
    invalid_submissions: Counter,
}

/// In-memory [`SubmissionStore`] used by tests and the default binary wiring.
#[derive(Debug, Default)]
pub struct MemorySubmissionStore {
    records: parking_lot::Mutex<Vec<SubmissionRecord>>,
}

impl SubmissionStore for MemorySubmissionStore {
    fn find_by_client_tx_id(
        &self,
        owner_user_id: u64,
        client_tx_id: &str,
    ) -> Option<SubmissionRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| {
                r.owner_user_id == owner_user_id
                    && r.client_tx_id.as_deref() == Some(client_tx_id)
            })
            .cloned()
    }

    fn insert(&self, submission: NewSubmission) -> SubmissionRecord {
        let mut records = self.records.lock();
        let record = SubmissionRecord {
            submission_id: records.len() as u64 + 1,
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
        records.push(record.clone());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submitter(config: SubmitConfig) -> (Submitter, Arc<MemorySubmissionStore>) {
        let store = Arc::new(MemorySubmissionStore::default());
        (Submitter::new(reqwest::Client::new(), config, store.clone()), store)
    }

    #[tokio::test]
    async fn register_only_persists_accepted_record() {
        let (submitter, _) = submitter(SubmitConfig::default());
        let record = submitter
            .submit(SubmitRequest {
                owner_user_id: 7,
                tx_id: Some("at1aaa".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(record.mode, SubmissionMode::RegisterOnly);
        assert_eq!(record.status, SubmissionStatus::Accepted);
        assert_eq!(record.tx_id.as_deref(), Some("at1aaa"));
        assert_eq!(record.submission_id, 1);
    }

    #[tokio::test]
    async fn both_or_neither_input_is_invalid() {
        let (submitter, _) = submitter(SubmitConfig::default());

        let neither = submitter.submit(SubmitRequest { owner_user_id: 1, ..Default::default() });
        assert!(matches!(neither.await, Err(SubmitError::InvalidArgument(_))));

        let both = submitter.submit(SubmitRequest {
            owner_user_id: 1,
            serialized_tx: Some("{}".to_owned()),
            tx_id: Some("at1".to_owned()),
            ..Default::default()
        });
        assert!(matches!(both.await, Err(SubmitError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn broadcast_without_endpoint_is_unavailable() {
        let (submitter, _) = submitter(SubmitConfig::default());
        let result = submitter
            .submit(SubmitRequest {
                owner_user_id: 1,
                serialized_tx: Some("{}".to_owned()),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(SubmitError::NotConfigured)));
    }

    #[tokio::test]
    async fn idempotent_resubmission_returns_existing_record() {
        let (submitter, store) = submitter(SubmitConfig::default());
        let request = SubmitRequest {
            owner_user_id: 7,
            tx_id: Some("at1aaa".to_owned()),
            client_tx_id: Some("client-1".to_owned()),
            ..Default::default()
        };

        let first = submitter.submit(request.clone()).await.unwrap();
        let second = submitter.submit(request).await.unwrap();

        assert_eq!(first.submission_id, second.submission_id);
        assert_eq!(store.records.lock().len(), 1);

        // A different owner with the same client id is a distinct submission.
        let other = submitter
            .submit(SubmitRequest {
                owner_user_id: 8,
                tx_id: Some("at1bbb".to_owned()),
                client_tx_id: Some("client-1".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_ne!(other.submission_id, first.submission_id);
    }

    #[test]
    fn payload_modes() {
        let raw = build_payload(r#"{"type":"execute"}"#, PayloadMode::Raw).unwrap();
        assert_eq!(raw, json!({"type": "execute"}));
        assert_eq!(build_payload("not-json", PayloadMode::Raw), None);

        let wrapped = build_payload("blob", PayloadMode::Wrapped).unwrap();
        assert_eq!(wrapped, json!({"transaction": "blob"}));

        assert_eq!(
            build_payload(r#"{"a":1}"#, PayloadMode::Auto).unwrap(),
            json!({"a": 1})
        );
        assert_eq!(
            build_payload("base64blob", PayloadMode::Auto).unwrap(),
            json!({"transaction": "base64blob"})
        );
    }

    #[test]
    fn tx_id_extraction_priority() {
        let body = json!({"id": "c", "tx_id": "b", "transactionId": "a"});
        assert_eq!(extract_tx_id(Some(&body)).as_deref(), Some("a"));

        let body = json!({"id": "c", "tx_id": "b"});
        assert_eq!(extract_tx_id(Some(&body)).as_deref(), Some("b"));

        let bare = json!("at1bare");
        assert_eq!(extract_tx_id(Some(&bare)).as_deref(), Some("at1bare"));

        assert_eq!(extract_tx_id(Some(&json!({"ok": true}))), None);
        assert_eq!(extract_tx_id(None), None);
    }

    #[test]
    fn payload_mode_parses_from_flag_values() {
        assert_eq!("raw".parse::<PayloadMode>().unwrap(), PayloadMode::Raw);
        assert_eq!("auto".parse::<PayloadMode>().unwrap(), PayloadMode::Auto);
        assert_eq!("wrapped".parse::<PayloadMode>().unwrap(), PayloadMode::Wrapped);
        assert!("json".parse::<PayloadMode>().is_err());
    }
}
