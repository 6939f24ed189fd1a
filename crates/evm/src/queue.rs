//! Payout batching queues.
//!
//! One queue task per destination chain. A batch is sealed and emitted when
//! the queue reaches the size threshold or when the oldest item has aged past
//! the wait window; size wins when both trip at once. Emission is a
//! non-blocking handoff to the scheduler, so the queue is immediately
//! receptive to new items. Batches leave each queue in FIFO order of their
//! first item.

use alloy_primitives::{Address, ChainId, U256};
use envelop_common::unix_epoch_ms;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tracing::{debug, warn};

/// Default batch size threshold.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 5;
/// Default batch wait window in milliseconds.
pub const DEFAULT_BATCH_MAX_WAIT_MS: u64 = 10_000;

/// Batching knobs, per process.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Seal as soon as a queue holds this many items.
    pub max_size: usize,
    /// Seal once the oldest queued item is this old.
    pub max_wait_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_size: DEFAULT_BATCH_MAX_SIZE, max_wait_ms: DEFAULT_BATCH_MAX_WAIT_MS }
    }
}

/// One outbound payout awaiting batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Caller-assigned request id.
    pub request_id: String,
    /// Destination chain.
    pub chain_id: ChainId,
    /// Recipient address.
    pub recipient: Address,
    /// Transfer value in wei.
    pub amount_wei: U256,
    /// Unix epoch milliseconds when the item entered the queue.
    pub enqueued_at: u64,
}

/// Why a batch was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyReason {
    /// The size threshold was reached.
    Size,
    /// The oldest item aged past the wait window (or a shutdown flush cut
    /// the window short).
    Timer,
}

/// A sealed, immutable batch of payouts for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Queue-assigned sequence number.
    pub batch_id: u64,
    /// Destination chain.
    pub chain_id: ChainId,
    /// Items in enqueue order.
    pub items: Vec<BatchItem>,
    /// What sealed the batch.
    pub ready_reason: ReadyReason,
    /// Unix epoch milliseconds when the batch was sealed.
    pub ready_at: u64,
}

enum QueueCommand {
    Enqueue(BatchItem),
    Flush,
}

/// Errors enqueueing payouts.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue task has shut down.
    #[error("payout queue for chain {0} is closed")]
    Closed(ChainId),
}

/// The per-chain payout queues.
///
/// Queues are spawned lazily on the first item for a chain; every sealed
/// batch is handed to the single `output` channel.
#[derive(Debug)]
pub struct BatchQueues {
    config: BatchConfig,
    output: mpsc::UnboundedSender<Batch>,
    queues: Mutex<HashMap<ChainId, mpsc::UnboundedSender<QueueCommand>>>,
}

impl BatchQueues {
    /// Creates the queue set emitting sealed batches into `output`.
    pub fn new(config: BatchConfig, output: mpsc::UnboundedSender<Batch>) -> Self {
        Self { config, output, queues: Mutex::new(HashMap::new()) }
    }

    /// Enqueues a payout on its chain's queue.
    pub fn enqueue(
        &self,
        request_id: String,
        chain_id: ChainId,
        recipient: Address,
        amount_wei: U256,
    ) -> Result<(), QueueError> {
        let item =
            BatchItem { request_id, chain_id, recipient, amount_wei, enqueued_at: unix_epoch_ms() };
        self.sender_for(chain_id)
            .send(QueueCommand::Enqueue(item))
            .map_err(|_| QueueError::Closed(chain_id))
    }

    /// Seals every non-empty queue regardless of size or age. Called on
    /// shutdown.
    pub fn flush_all(&self) {
        for (chain_id, sender) in self.queues.lock().iter() {
            if sender.send(QueueCommand::Flush).is_err() {
                warn!(target: "evm::queue", chain_id, "Payout queue gone during flush");
            }
        }
    }

    fn sender_for(&self, chain_id: ChainId) -> mpsc::UnboundedSender<QueueCommand> {
        let mut queues = self.queues.lock();
        queues
            .entry(chain_id)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_queue(chain_id, self.config, rx, self.output.clone()));
                tx
            })
            .clone()
    }
}

/// One chain's queue loop.
async fn run_queue(
    chain_id: ChainId,
    config: BatchConfig,
    mut commands: mpsc::UnboundedReceiver<QueueCommand>,
    output: mpsc::UnboundedSender<Batch>,
) {
    let max_size = config.max_size.max(1);
    let wait = Duration::from_millis(config.max_wait_ms);

    let mut pending: Vec<BatchItem> = Vec::new();
    let mut oldest: Option<Instant> = None;
    let mut next_batch_id: u64 = 1;

    let mut seal = |pending: &mut Vec<BatchItem>, reason: ReadyReason| {
        let batch = Batch {
            batch_id: next_batch_id,
            chain_id,
            items: std::mem::take(pending),
            ready_reason: reason,
            ready_at: unix_epoch_ms(),
        };
        next_batch_id += 1;
        debug!(
            target: "evm::queue",
            chain_id,
            batch_id = batch.batch_id,
            items = batch.items.len(),
            reason = ?reason,
            "Sealed payout batch"
        );
        if output.send(batch).is_err() {
            warn!(target: "evm::queue", chain_id, "Batch receiver dropped; discarding batch");
        }
    };

    loop {
        let deadline = oldest.map(|first| first + wait);

        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(QueueCommand::Enqueue(item)) => {
                    if pending.is_empty() {
                        oldest = Some(Instant::now());
                    }
                    pending.push(item);
                    if pending.len() >= max_size {
                        seal(&mut pending, ReadyReason::Size);
                        oldest = None;
                    }
                }
                Some(QueueCommand::Flush) => {
                    if !pending.is_empty() {
                        seal(&mut pending, ReadyReason::Timer);
                        oldest = None;
                    }
                }
                None => {
                    if !pending.is_empty() {
                        seal(&mut pending, ReadyReason::Timer);
                    }
                    break;
                }
            },

            () = async { sleep_until(deadline.expect("guarded by condition")).await },
                if deadline.is_some() =>
            {
                seal(&mut pending, ReadyReason::Timer);
                oldest = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const RECIPIENT: Address = address!("00000000000000000000000000000000000000aa");
    const SEPOLIA: ChainId = 11155111;

    fn queues(config: BatchConfig) -> (BatchQueues, mpsc::UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BatchQueues::new(config, tx), rx)
    }

    fn push(q: &BatchQueues, chain_id: ChainId, n: usize) {
        for i in 0..n {
            q.enqueue(format!("req-{i}"), chain_id, RECIPIENT, U256::from(1_000)).unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn seals_on_size_threshold() {
        let (q, mut rx) = queues(BatchConfig::default());
        push(&q, SEPOLIA, 5);

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.ready_reason, ReadyReason::Size);
        assert_eq!(batch.items.len(), 5);
        assert_eq!(batch.chain_id, SEPOLIA);
        // Enqueue order preserved.
        let ids: Vec<_> = batch.items.iter().map(|i| i.request_id.as_str()).collect();
        assert_eq!(ids, ["req-0", "req-1", "req-2", "req-3", "req-4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn seals_on_age() {
        let (q, mut rx) = queues(BatchConfig::default());
        push(&q, SEPOLIA, 2);

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.ready_reason, ReadyReason::Timer);
        assert_eq!(batch.items.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn size_one_seals_each_item_immediately() {
        let (q, mut rx) = queues(BatchConfig { max_size: 1, ..Default::default() });
        push(&q, SEPOLIA, 3);

        for _ in 0..3 {
            let batch = rx.recv().await.unwrap();
            assert_eq!(batch.ready_reason, ReadyReason::Size);
            assert_eq!(batch.items.len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_is_receptive_after_sealing() {
        let (q, mut rx) = queues(BatchConfig::default());
        push(&q, SEPOLIA, 10);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.batch_id, 1);
        assert_eq!(second.batch_id, 2);
        assert_eq!(first.items.len(), 5);
        assert_eq!(second.items.len(), 5);
        assert!(first.items.iter().all(|i| i.request_id.starts_with("req-")));
    }

    #[tokio::test(start_paused = true)]
    async fn chains_batch_independently() {
        let (q, mut rx) = queues(BatchConfig::default());
        push(&q, SEPOLIA, 5);
        push(&q, 84532, 5);

        let mut chains = vec![rx.recv().await.unwrap().chain_id, rx.recv().await.unwrap().chain_id];
        chains.sort_unstable();
        assert_eq!(chains, [84532, SEPOLIA]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_seals_partial_queues() {
        let (q, mut rx) = queues(BatchConfig::default());
        push(&q, SEPOLIA, 3);
        q.flush_all();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.items.len(), 3);
        assert_eq!(batch.ready_reason, ReadyReason::Timer);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_restarts_with_the_next_first_item() {
        let (q, mut rx) = queues(BatchConfig::default());
        push(&q, SEPOLIA, 1);

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(rx.recv().await.unwrap().items.len(), 1);

        // A later item starts a fresh window rather than inheriting the old
        // deadline.
        push(&q, SEPOLIA, 1);
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.ready_reason, ReadyReason::Timer);
    }
}
