//! Wallet pool and batch scheduler.
//!
//! Each EVM chain gets up to [`MAX_WALLETS_PER_CHAIN`] independent signer
//! wallets. A wallet owns its nonce counter: nonces are only ever reserved
//! through the wallet's own mutex, in FIFO order, so concurrent payouts can
//! never collide. Batch items are dispatched concurrently, each picking the
//! wallet with the fewest payouts in flight (ties broken randomly).
//!
//! Nonce and fee races (`nonce too low`, `replacement underpriced`) are
//! retried with a re-synced nonce and exponential backoff; all other send
//! errors are terminal. Surfaced error messages have the wallet address
//! redacted.

use crate::{
    client::{ChainClient, ClientError},
    gas::GasManager,
    queue::{Batch, BatchItem},
};
use alloy_network::EthereumWallet;
use alloy_primitives::{Address, ChainId, TxHash, TxKind};
use alloy_rpc_types::TransactionRequest;
use alloy_signer_local::PrivateKeySigner;
use envelop_common::unix_epoch_ms;
use metrics::{Counter, Gauge};
use metrics_derive::Metrics;
use rand::Rng;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    time::{sleep, Instant},
};
use tracing::{debug, warn};

/// Hard upper bound on signer wallets per chain.
pub const MAX_WALLETS_PER_CHAIN: usize = 2;

/// Default send retry budget for nonce and fee races.
pub const DEFAULT_RETRY_MAX: u32 = 3;
/// Default exponential backoff base in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;

/// Pool execution knobs.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Retries for nonce and fee races.
    pub retry_max: u32,
    /// Exponential backoff base between retries.
    pub backoff_base_ms: u64,
    /// Receipt poll cadence while waiting for the first confirmation.
    pub confirm_poll_ms: u64,
    /// Give up waiting for a receipt after this long.
    pub confirm_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            retry_max: DEFAULT_RETRY_MAX,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            confirm_poll_ms: 2_000,
            confirm_timeout_ms: 120_000,
        }
    }
}

/// Errors executing payouts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayoutError {
    /// More keys were configured than the pool allows.
    #[error("{count} wallets configured for chain {chain_id}, maximum is {max}")]
    TooManyWallets {
        /// Configured key count.
        count: usize,
        /// The chain being configured.
        chain_id: ChainId,
        /// The hard upper bound.
        max: usize,
    },
    /// The pool has no wallets.
    #[error("no wallets configured for chain {0}")]
    NoWallets(ChainId),
    /// The chain rejected the send terminally.
    #[error("send failed: {0}")]
    Send(String),
    /// The nonce/fee race retry budget was exhausted.
    #[error("send failed after {attempts} retries: {last}")]
    RetriesExhausted {
        /// Retries attempted.
        attempts: u32,
        /// The last (redacted) error.
        last: String,
    },
    /// The transaction mined but reverted.
    #[error("transaction {tx_hash} reverted")]
    Reverted {
        /// The reverted transaction.
        tx_hash: TxHash,
    },
    /// No receipt appeared within the confirmation window.
    #[error("no receipt for {tx_hash} within the confirmation window")]
    ConfirmTimeout {
        /// The unconfirmed transaction.
        tx_hash: TxHash,
    },
}

/// Outcome of one batch item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// The originating request.
    pub request_id: String,
    /// The wallet that carried the payout.
    pub wallet_address: Address,
    /// Confirmed hash, or the terminal error.
    pub outcome: Result<TxHash, PayoutError>,
}

/// One signer wallet. The nonce counter is only reachable through
/// [`PoolWallet::reserve_nonce`] and [`PoolWallet::reset_nonce`], both
/// serialized on the wallet's own mutex.
#[derive(Debug)]
struct PoolWallet {
    address: Address,
    signer: EthereumWallet,
    nonce: Mutex<u64>,
    in_flight: AtomicU64,
    last_used_at: AtomicU64,
}

impl PoolWallet {
    /// Reserves the next nonce. Concurrent reservations are handed out in
    /// FIFO order of arrival.
    async fn reserve_nonce(&self) -> u64 {
        let mut nonce = self.nonce.lock().await;
        let reserved = *nonce;
        *nonce += 1;
        reserved
    }

    /// Re-seeds the counter from the chain's pending nonce after a nonce
    /// race.
    async fn reset_nonce(&self, chain_pending: u64) {
        *self.nonce.lock().await = chain_pending;
    }

    fn touch(&self) {
        self.last_used_at.store(unix_epoch_ms(), Ordering::Relaxed);
    }
}

/// The signer wallet pool for one EVM chain.
#[derive(Debug)]
pub struct WalletPool {
    chain_id: ChainId,
    client: Arc<dyn ChainClient>,
    gas: GasManager,
    config: PoolConfig,
    wallets: Vec<Arc<PoolWallet>>,
    /// Guards wallet selection so concurrent items observe each other's
    /// in-flight claims.
    selection: parking_lot::Mutex<()>,
    completed: AtomicU64,
    started_at: Instant,
    metrics: PoolMetrics,
}

impl WalletPool {
    /// Builds the pool, seeding every wallet's nonce counter from the
    /// chain's pending nonce.
    pub async fn connect(
        chain_id: ChainId,
        signers: Vec<PrivateKeySigner>,
        client: Arc<dyn ChainClient>,
        gas: GasManager,
        config: PoolConfig,
    ) -> Result<Self, PayoutError> {
        if signers.is_empty() {
            return Err(PayoutError::NoWallets(chain_id));
        }
        if signers.len() > MAX_WALLETS_PER_CHAIN {
            return Err(PayoutError::TooManyWallets {
                count: signers.len(),
                chain_id,
                max: MAX_WALLETS_PER_CHAIN,
            });
        }

        let mut wallets = Vec::with_capacity(signers.len());
        for signer in signers {
            let address = signer.address();
            let pending = client
                .pending_nonce(address)
                .await
                .map_err(|err| PayoutError::Send(redact(&err.to_string(), address)))?;
            debug!(target: "evm::pool", chain_id, nonce = pending, "Seeded payout wallet");
            wallets.push(Arc::new(PoolWallet {
                address,
                signer: EthereumWallet::from(signer),
                nonce: Mutex::new(pending),
                in_flight: AtomicU64::new(0),
                last_used_at: AtomicU64::new(0),
            }));
        }

        Ok(Self {
            chain_id,
            client,
            gas,
            config,
            wallets,
            selection: parking_lot::Mutex::new(()),
            completed: AtomicU64::new(0),
            started_at: Instant::now(),
            metrics: PoolMetrics::default(),
        })
    }

    /// Number of wallets in the pool.
    pub fn wallet_count(&self) -> usize {
        self.wallets.len()
    }

    /// Executes every item of a batch concurrently, one task per item, each
    /// picking its own wallet.
    pub async fn execute_batch(&self, batch: Batch) -> Vec<ExecutionResult> {
        self.metrics.batches_executed.increment(1);
        debug!(
            target: "evm::pool",
            chain_id = self.chain_id,
            batch_id = batch.batch_id,
            items = batch.items.len(),
            "Executing payout batch"
        );
        futures::future::join_all(batch.items.into_iter().map(|item| self.execute_item(item)))
            .await
    }

    /// Informational stability gauge: whether the queue is draining faster
    /// than it fills. The observed pool rate already aggregates all `k`
    /// wallets.
    pub fn is_stable(&self, queue_depth: usize) -> bool {
        let elapsed = self.started_at.elapsed().as_secs_f64().max(1.0);
        let observed_rate = self.completed.load(Ordering::Relaxed) as f64 / elapsed;
        let stable = (queue_depth as f64) < observed_rate;
        self.metrics.queue_stable.set(if stable { 1.0 } else { 0.0 });
        stable
    }

    async fn execute_item(&self, item: BatchItem) -> ExecutionResult {
        let wallet = self.select_wallet();
        let outcome = self.send_with_retries(&wallet, &item).await;

        // Every path releases the in-flight claim.
        wallet.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::Relaxed);

        match &outcome {
            Ok(tx_hash) => {
                self.metrics.payouts_sent.increment(1);
                debug!(target: "evm::pool", chain_id = self.chain_id, %tx_hash, "Payout confirmed");
            }
            Err(err) => {
                self.metrics.payouts_failed.increment(1);
                warn!(target: "evm::pool", chain_id = self.chain_id, %err, "Payout failed");
            }
        }

        ExecutionResult { request_id: item.request_id, wallet_address: wallet.address, outcome }
    }

    /// Picks the wallet with the fewest payouts in flight, breaking ties
    /// randomly, and claims an in-flight slot on it.
    fn select_wallet(&self) -> Arc<PoolWallet> {
        let _guard = self.selection.lock();
        let min = self
            .wallets
            .iter()
            .map(|w| w.in_flight.load(Ordering::SeqCst))
            .min()
            .expect("pool is never empty");
        let candidates: Vec<_> = self
            .wallets
            .iter()
            .filter(|w| w.in_flight.load(Ordering::SeqCst) == min)
            .collect();
        let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        pick.in_flight.fetch_add(1, Ordering::SeqCst);
        Arc::clone(pick)
    }

    async fn send_with_retries(
        &self,
        wallet: &PoolWallet,
        item: &BatchItem,
    ) -> Result<TxHash, PayoutError> {
        let mut attempt: u32 = 0;
        loop {
            let nonce = wallet.reserve_nonce().await;
            let fees = self
                .gas
                .fees(self.client.as_ref(), self.chain_id)
                .await
                .map_err(|err| PayoutError::Send(redact(&err.to_string(), wallet.address)))?;

            let tx = TransactionRequest {
                from: Some(wallet.address),
                to: Some(TxKind::Call(item.recipient)),
                value: Some(item.amount_wei),
                nonce: Some(nonce),
                gas: Some(21_000),
                chain_id: Some(self.chain_id),
                max_fee_per_gas: Some(fees.max_fee_per_gas),
                max_priority_fee_per_gas: Some(fees.max_priority_fee_per_gas),
                ..Default::default()
            };

            match self.client.sign_and_send(&wallet.signer, tx).await {
                Ok(tx_hash) => {
                    wallet.touch();
                    self.await_confirmation(tx_hash).await?;
                    return Ok(tx_hash);
                }
                Err(err) if err.is_nonce_retryable() => {
                    if attempt >= self.config.retry_max {
                        return Err(PayoutError::RetriesExhausted {
                            attempts: attempt,
                            last: redact(&err.to_string(), wallet.address),
                        });
                    }
                    attempt += 1;
                    self.metrics.send_retries.increment(1);
                    warn!(
                        target: "evm::pool",
                        chain_id = self.chain_id,
                        attempt,
                        "Nonce race, re-syncing and retrying"
                    );
                    if let Ok(pending) = self.client.pending_nonce(wallet.address).await {
                        wallet.reset_nonce(pending).await;
                    }
                    let backoff = self.config.backoff_base_ms * 2u64.pow(attempt - 1);
                    sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) => {
                    return Err(PayoutError::Send(redact(&err.to_string(), wallet.address)))
                }
            }
        }
    }

    /// Polls for the first confirmation of `tx_hash`.
    async fn await_confirmation(&self, tx_hash: TxHash) -> Result<(), PayoutError> {
        let deadline =
            Instant::now() + Duration::from_millis(self.config.confirm_timeout_ms);
        loop {
            match self.client.receipt_status(tx_hash).await {
                Ok(Some(true)) => return Ok(()),
                Ok(Some(false)) => return Err(PayoutError::Reverted { tx_hash }),
                // Not mined yet, or a transient read failure: keep polling.
                Ok(None) | Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(PayoutError::ConfirmTimeout { tx_hash });
            }
            sleep(Duration::from_millis(self.config.confirm_poll_ms.max(1))).await;
        }
    }
}

/// Routes sealed batches to their chain's wallet pool and forwards item
/// results.
#[derive(Debug, Default)]
pub struct PayoutScheduler {
    pools: HashMap<ChainId, Arc<WalletPool>>,
}

impl PayoutScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self { pools: HashMap::new() }
    }

    /// Registers the pool serving one chain.
    pub fn with_pool(mut self, pool: WalletPool) -> Self {
        self.pools.insert(pool.chain_id, Arc::new(pool));
        self
    }

    /// Consumes sealed batches until the queue side closes. Each batch runs
    /// in its own task; item results are forwarded to `results`.
    pub async fn run(
        self,
        mut batches: mpsc::UnboundedReceiver<Batch>,
        results: mpsc::UnboundedSender<ExecutionResult>,
    ) {
        while let Some(batch) = batches.recv().await {
            let Some(pool) = self.pools.get(&batch.chain_id) else {
                warn!(
                    target: "evm::pool",
                    chain_id = batch.chain_id,
                    batch_id = batch.batch_id,
                    "No wallet pool for chain, dropping batch"
                );
                continue;
            };
            let pool = Arc::clone(pool);
            let results = results.clone();
            tokio::spawn(async move {
                for result in pool.execute_batch(batch).await {
                    if results.send(result).is_err() {
                        break;
                    }
                }
            });
        }
    }
}

/// Strips the wallet address from an error message before it is surfaced.
fn redact(message: &str, address: Address) -> String {
    let checksummed = address.to_string();
    message
        .replace(&checksummed, "<wallet>")
        .replace(&checksummed.to_lowercase(), "<wallet>")
}

/// Metrics for the payout pool.
#[derive(Metrics)]
#[metrics(scope = "payouts")]
struct PoolMetrics {
    /// Batches handed to this pool.
    batches_executed: Counter,
    /// Payouts confirmed.
    payouts_sent: Counter,
    /// Payouts that terminally failed.
    payouts_failed: Counter,
    /// Nonce/fee race retries.
    send_retries: Counter,
    /// 1 when the queue is draining faster than it fills.
    queue_stable: Gauge,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::mock::MockChainClient,
        queue::{BatchConfig, BatchQueues, ReadyReason},
    };
    use alloy_primitives::{address, U256};

    const SEPOLIA: ChainId = 11155111;
    const RECIPIENT: Address = address!("00000000000000000000000000000000000000aa");

    async fn pool_with(client: &MockChainClient, signers: Vec<PrivateKeySigner>) -> WalletPool {
        WalletPool::connect(
            SEPOLIA,
            signers,
            Arc::new(client.clone()),
            GasManager::new(),
            PoolConfig::default(),
        )
        .await
        .unwrap()
    }

    fn batch(batch_id: u64, n: usize) -> Batch {
        Batch {
            batch_id,
            chain_id: SEPOLIA,
            items: (0..n)
                .map(|i| BatchItem {
                    request_id: format!("req-{batch_id}-{i}"),
                    chain_id: SEPOLIA,
                    recipient: RECIPIENT,
                    amount_wei: U256::from(1_000),
                    enqueued_at: 0,
                })
                .collect(),
            ready_reason: ReadyReason::Size,
            ready_at: 0,
        }
    }

    #[tokio::test]
    async fn rejects_too_many_wallets() {
        let client = MockChainClient::new();
        let signers = (0..3).map(|_| PrivateKeySigner::random()).collect();
        let err = WalletPool::connect(
            SEPOLIA,
            signers,
            Arc::new(client),
            GasManager::new(),
            PoolConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PayoutError::TooManyWallets { count: 3, max: 2, .. }));
    }

    #[tokio::test]
    async fn nonces_are_contiguous_per_wallet_under_parallelism() {
        let client = MockChainClient::new();
        let signers: Vec<_> = (0..2).map(|_| PrivateKeySigner::random()).collect();
        let addresses: Vec<_> = signers.iter().map(|s| s.address()).collect();
        client.set_base_nonce(addresses[0], 7);
        client.set_base_nonce(addresses[1], 40);
        let pool = pool_with(&client, signers).await;

        // Two batches of five, as sealed by the queue for ten enqueued items.
        let results = pool.execute_batch(batch(1, 5)).await;
        let more = pool.execute_batch(batch(2, 5)).await;
        assert!(results.iter().chain(&more).all(|r| r.outcome.is_ok()));

        for (address, base) in [(addresses[0], 7u64), (addresses[1], 40u64)] {
            let mut nonces: Vec<_> =
                client.sent_by(address).iter().map(|t| t.nonce).collect();
            nonces.sort_unstable();
            let expected: Vec<_> = (base..base + nonces.len() as u64).collect();
            assert_eq!(nonces, expected, "wallet nonces must be contiguous with no gaps");
        }
        assert_eq!(client.sent().len(), 10);
    }

    #[tokio::test]
    async fn items_spread_across_wallets_by_in_flight_count() {
        let client = MockChainClient::new();
        let signers: Vec<_> = (0..2).map(|_| PrivateKeySigner::random()).collect();
        let addresses: Vec<_> = signers.iter().map(|s| s.address()).collect();
        let pool = pool_with(&client, signers).await;

        pool.execute_batch(batch(1, 6)).await;

        // With an even item count and min-in-flight selection both wallets
        // carry half the load.
        assert_eq!(client.sent_by(addresses[0]).len(), 3);
        assert_eq!(client.sent_by(addresses[1]).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_race_retries_with_resynced_nonce() {
        let client = MockChainClient::new();
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        client.set_base_nonce(address, 5);
        client.fail_sends(address, [ClientError::Rpc("nonce too low".to_owned())]);
        let pool = pool_with(&client, vec![signer]).await;

        let results = pool.execute_batch(batch(1, 1)).await;
        assert!(results[0].outcome.is_ok());

        let sent = client.sent_by(address);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].nonce, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_bounded() {
        let client = MockChainClient::new();
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        client.fail_sends(
            address,
            std::iter::repeat_with(|| ClientError::Rpc("replacement underpriced".to_owned()))
                .take(4),
        );
        let pool = pool_with(&client, vec![signer]).await;

        let results = pool.execute_batch(batch(1, 1)).await;
        assert!(matches!(
            results[0].outcome,
            Err(PayoutError::RetriesExhausted { attempts: 3, .. })
        ));
        assert!(client.sent().is_empty());
    }

    #[tokio::test]
    async fn terminal_errors_are_redacted() {
        let client = MockChainClient::new();
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        client.fail_sends(
            address,
            [ClientError::Rpc(format!("insufficient funds for {address}"))],
        );
        let pool = pool_with(&client, vec![signer]).await;

        let results = pool.execute_batch(batch(1, 1)).await;
        let Err(PayoutError::Send(message)) = &results[0].outcome else {
            panic!("expected terminal send error");
        };
        assert!(message.contains("<wallet>"));
        assert!(!message.contains(&address.to_string()));
    }

    #[tokio::test]
    async fn in_flight_count_returns_to_zero() {
        let client = MockChainClient::new();
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        client.fail_sends(address, [ClientError::Rpc("boom".to_owned())]);
        let pool = pool_with(&client, vec![signer]).await;

        pool.execute_batch(batch(1, 2)).await;
        assert!(pool.wallets.iter().all(|w| w.in_flight.load(Ordering::SeqCst) == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_routes_batches_from_the_queue() {
        let client = MockChainClient::new();
        let signers: Vec<_> = (0..2).map(|_| PrivateKeySigner::random()).collect();
        let pool = pool_with(&client, signers).await;

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let queues = BatchQueues::new(BatchConfig::default(), batch_tx);
        tokio::spawn(PayoutScheduler::new().with_pool(pool).run(batch_rx, result_tx));

        for i in 0..10 {
            queues
                .enqueue(format!("req-{i}"), SEPOLIA, RECIPIENT, U256::from(1_000))
                .unwrap();
        }

        let mut confirmed = 0;
        while confirmed < 10 {
            let result = result_rx.recv().await.unwrap();
            assert!(result.outcome.is_ok());
            confirmed += 1;
        }
        assert_eq!(client.sent().len(), 10);
    }
}
