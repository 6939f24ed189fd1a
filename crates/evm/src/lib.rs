//! # Envelop EVM payouts.
//!
//! The outbound EVM leg of the relayer: payout requests are coalesced into
//! batches per destination chain, then dispatched through a small pool of
//! independent signer wallets, each with its own nonce discipline.
//!
//! - [`queue`] — per-chain batching queues sealing on size or age.
//! - [`pool`] — the wallet pool and batch scheduler.
//! - [`gas`] — EIP-1559 fee estimation with per-chain multipliers.
//! - [`client`] — the chain client seam over an EVM JSON-RPC provider, with
//!   a mock variant for tests.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod client;
pub mod gas;
pub mod pool;
pub mod queue;

pub use client::{AlloyChainClient, ChainClient, ClientError};
pub use gas::{FeeMultiplier, GasManager};
pub use pool::{ExecutionResult, PayoutError, PayoutScheduler, PoolConfig, WalletPool};
pub use queue::{Batch, BatchConfig, BatchItem, BatchQueues, QueueError, ReadyReason};
