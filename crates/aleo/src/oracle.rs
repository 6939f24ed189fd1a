//! Chain status oracle.
//!
//! Looks up a transaction id against an ordered list of status sources and
//! returns a [`TxStatusSnapshot`]: the normalized state, the raw status
//! string, the decoded transaction, and which endpoint answered. Responses
//! are cached per transaction id for a short TTL so settlement polling and
//! user-facing status reads within the same window are idempotent.

use crate::{
    decode::{decode_transaction, extract_raw_status},
    DecodedTransaction,
};
use async_trait::async_trait;
use envelop_common::unix_epoch_ms;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};
use url::Url;

/// Default status response TTL in milliseconds.
pub const DEFAULT_CACHE_MS: u64 = 2_000;

/// Known public explorer endpoints, tried after the configured primary.
pub const FALLBACK_STATUS_ENDPOINTS: [&str; 2] = [
    "https://api.explorer.provable.com/v1/testnet",
    "https://api.explorer.aleo.org/v1/testnet",
];

/// Normalized transaction state.
///
/// `Unknown` means no endpoint could be reached; callers must treat it like
/// [`TxState::Pending`] for retry purposes, never as confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    /// Not yet terminal: queued, broadcast, or simply not found yet.
    Pending,
    /// Accepted and finalized on chain.
    Confirmed,
    /// Rejected, aborted, or otherwise terminally failed.
    Failed,
    /// No status source could be reached.
    Unknown,
}

impl TxState {
    /// Stable string form, used in responses and ledger rows.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the state is terminal for settlement purposes.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const FAILED_MARKERS: [&str; 7] =
    ["fail", "reject", "invalid", "drop", "revert", "abort", "error"];
const CONFIRMED_MARKERS: [&str; 8] =
    ["confirm", "final", "success", "complete", "accept", "execut", "includ", "commit"];

/// Normalizes a raw explorer status string.
///
/// Failure markers are checked first so that strings like
/// `"rejected_execution"` never read as confirmed, and anything
/// unrecognized is pending.
pub fn normalize_status(raw: &str) -> TxState {
    let lowered = raw.to_lowercase();
    if FAILED_MARKERS.iter().any(|m| lowered.contains(m)) {
        TxState::Failed
    } else if CONFIRMED_MARKERS.iter().any(|m| lowered.contains(m)) {
        TxState::Confirmed
    } else {
        TxState::Pending
    }
}

/// A point-in-time view of a transaction's status.
///
/// Snapshots are never mutated in place; a newer snapshot replaces an older
/// one in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatusSnapshot {
    /// The transaction id this snapshot describes.
    pub tx_id: String,
    /// Normalized state.
    pub state: TxState,
    /// Raw status string as returned by the source, if any.
    pub raw_state: Option<String>,
    /// Endpoint that answered, or the last endpoint tried on total failure.
    pub source: String,
    /// Unix epoch milliseconds when the snapshot was taken.
    pub fetched_at: u64,
    /// Decoded transaction record.
    pub decoded: DecodedTransaction,
    /// Last transport error when no source could be reached.
    pub error: Option<String>,
}

/// Errors reaching or reading a status source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Transport-level failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// The endpoint answered with a non-success status.
    #[error("endpoint returned http {0}")]
    BadStatus(u16),
    /// The body was not structured JSON.
    #[error("endpoint returned a non-JSON body")]
    NotJson,
}

/// A source of transaction status, injected at construction.
///
/// Variants: the configured primary endpoint, the known public fallbacks, and
/// [`mock::MockStatusSource`] for tests and local development.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Label identifying the source in snapshots and logs.
    fn endpoint(&self) -> &str;

    /// Fetches the raw transaction record for `tx_id`.
    async fn fetch(&self, tx_id: &str) -> Result<Value, SourceError>;
}

/// HTTP status source reading `{endpoint}/transaction/{tx_id}`.
#[derive(Debug)]
pub struct HttpStatusSource {
    client: reqwest::Client,
    base: Url,
    label: String,
}

impl HttpStatusSource {
    /// Creates a source for the given base endpoint.
    pub fn new(client: reqwest::Client, base: Url) -> Self {
        let label = base.to_string();
        Self { client, base, label }
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    fn endpoint(&self) -> &str {
        &self.label
    }

    async fn fetch(&self, tx_id: &str) -> Result<Value, SourceError> {
        let url = format!("{}/transaction/{tx_id}", self.base.as_str().trim_end_matches('/'));
        let response = self.client.get(url).send().await?;

        // Explorers answer 404 for ids they have not indexed yet. That is a
        // structured answer, not an outage.
        if response.status().as_u16() == 404 {
            return Ok(serde_json::json!({ "status": "not_found" }));
        }
        if !response.status().is_success() {
            return Err(SourceError::BadStatus(response.status().as_u16()));
        }

        response.json().await.map_err(|_| SourceError::NotJson)
    }
}

/// The chain status oracle.
#[derive(Debug)]
pub struct StatusOracle {
    sources: Vec<Box<dyn StatusSource>>,
    cache: Mutex<HashMap<String, TxStatusSnapshot>>,
    cache_ms: u64,
}

impl std::fmt::Debug for dyn StatusSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StatusSource({})", self.endpoint())
    }
}

impl StatusOracle {
    /// Creates an oracle over an ordered list of sources. The first source
    /// returning a structured response wins.
    pub fn new(sources: Vec<Box<dyn StatusSource>>, cache_ms: u64) -> Self {
        Self { sources, cache: Mutex::new(HashMap::new()), cache_ms }
    }

    /// Builds the production source list: the optional configured override
    /// first, then the known public fallbacks.
    pub fn with_endpoints(
        client: reqwest::Client,
        primary: Option<Url>,
        cache_ms: u64,
    ) -> Self {
        let mut sources: Vec<Box<dyn StatusSource>> = Vec::new();
        if let Some(url) = primary {
            sources.push(Box::new(HttpStatusSource::new(client.clone(), url)));
        }
        for endpoint in FALLBACK_STATUS_ENDPOINTS {
            let url = endpoint.parse().expect("static endpoint is a valid url");
            sources.push(Box::new(HttpStatusSource::new(client.clone(), url)));
        }
        Self::new(sources, cache_ms)
    }

    /// Looks up a transaction id, serving from cache within the TTL.
    ///
    /// This never errors: total source failure yields an
    /// [`TxState::Unknown`] snapshot carrying the last error, which is not
    /// cached so the next call retries the sources.
    pub async fn lookup(&self, tx_id: &str) -> TxStatusSnapshot {
        let now = unix_epoch_ms();
        if let Some(cached) = self.cached(tx_id, now) {
            return cached;
        }

        let mut last_error: Option<String> = None;
        let mut last_endpoint = String::new();

        for source in &self.sources {
            last_endpoint = source.endpoint().to_owned();
            match source.fetch(tx_id).await {
                Ok(body) => {
                    let snapshot = Self::snapshot_from_body(tx_id, &body, source.endpoint());
                    debug!(
                        target: "relay::oracle",
                        %tx_id,
                        state = %snapshot.state,
                        source = source.endpoint(),
                        "Transaction status fetched"
                    );
                    self.store(snapshot.clone());
                    return snapshot;
                }
                Err(err) => {
                    warn!(
                        target: "relay::oracle",
                        %tx_id,
                        source = source.endpoint(),
                        %err,
                        "Status source failed, trying next"
                    );
                    last_error = Some(err.to_string());
                }
            }
        }

        TxStatusSnapshot {
            tx_id: tx_id.to_owned(),
            state: TxState::Unknown,
            raw_state: None,
            source: last_endpoint,
            fetched_at: unix_epoch_ms(),
            decoded: DecodedTransaction::default(),
            error: last_error,
        }
    }

    fn snapshot_from_body(tx_id: &str, body: &Value, source: &str) -> TxStatusSnapshot {
        let raw_state = extract_raw_status(body);
        let state = raw_state.as_deref().map_or(TxState::Pending, normalize_status);
        TxStatusSnapshot {
            tx_id: tx_id.to_owned(),
            state,
            raw_state,
            source: source.to_owned(),
            fetched_at: unix_epoch_ms(),
            decoded: decode_transaction(body),
            error: None,
        }
    }

    fn cached(&self, tx_id: &str, now: u64) -> Option<TxStatusSnapshot> {
        let cache = self.cache.lock();
        cache
            .get(tx_id)
            .filter(|snapshot| snapshot.fetched_at + self.cache_ms > now)
            .cloned()
    }

    /// Last-writer-wins insert keyed on `fetched_at`, evicting anything
    /// already expired to bound the map.
    fn store(&self, snapshot: TxStatusSnapshot) {
        let now = unix_epoch_ms();
        let mut cache = self.cache.lock();
        cache.retain(|_, s| s.fetched_at + self.cache_ms > now);
        match cache.get(&snapshot.tx_id) {
            Some(existing) if existing.fetched_at > snapshot.fetched_at => {}
            _ => {
                cache.insert(snapshot.tx_id.clone(), snapshot);
            }
        }
    }
}

pub mod mock {
    //! Scripted status source for tests and local development.

    use super::{SourceError, StatusSource};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    /// A [`StatusSource`] that replays scripted responses.
    ///
    /// Responses for a transaction id are consumed in order; the last one is
    /// sticky, so a script of `[pending, confirmed]` keeps answering
    /// confirmed once reached. Unscripted ids answer `not_found`.
    #[derive(Debug, Clone, Default)]
    pub struct MockStatusSource {
        inner: Arc<MockInner>,
    }

    #[derive(Debug, Default)]
    struct MockInner {
        scripts: Mutex<HashMap<String, VecDeque<Value>>>,
        fetches: AtomicUsize,
        unreachable: Mutex<bool>,
    }

    impl MockStatusSource {
        /// Creates an empty mock.
        pub fn new() -> Self {
            Self::default()
        }

        /// Scripts the successive responses for `tx_id`.
        pub fn script(&self, tx_id: &str, responses: impl IntoIterator<Item = Value>) {
            self.inner
                .scripts
                .lock()
                .insert(tx_id.to_owned(), responses.into_iter().collect());
        }

        /// Makes every fetch fail as if the endpoint were down.
        pub fn set_unreachable(&self, unreachable: bool) {
            *self.inner.unreachable.lock() = unreachable;
        }

        /// Number of fetches served so far.
        pub fn fetches(&self) -> usize {
            self.inner.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusSource for MockStatusSource {
        fn endpoint(&self) -> &str {
            "mock://status"
        }

        async fn fetch(&self, tx_id: &str) -> Result<Value, SourceError> {
            self.inner.fetches.fetch_add(1, Ordering::SeqCst);
            if *self.inner.unreachable.lock() {
                return Err(SourceError::BadStatus(503));
            }
            let mut scripts = self.inner.scripts.lock();
            let Some(queue) = scripts.get_mut(tx_id) else {
                return Ok(serde_json::json!({ "status": "not_found" }));
            };
            let response = if queue.len() > 1 {
                queue.pop_front().expect("len checked")
            } else {
                queue.front().cloned().unwrap_or_else(|| serde_json::json!({ "status": "not_found" }))
            };
            Ok(response)
        }
    }
}
