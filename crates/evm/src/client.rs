//! The chain client seam.
//!
//! A [`ChainClient`] is capable of reading nonces and fees, signing, and
//! propagating signed transactions for one EVM chain. Variants: the alloy
//! provider in production and [`mock::MockChainClient`] in tests; both are
//! injected at construction, never swapped at runtime.

use alloy_network::{eip2718::Encodable2718, Ethereum, EthereumWallet, TransactionBuilder};
use alloy_primitives::{Address, TxHash};
use alloy_provider::{utils::Eip1559Estimation, Provider};
use alloy_rpc_types::TransactionRequest;
use async_trait::async_trait;

/// Errors talking to an EVM chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The RPC endpoint rejected the call or could not be reached.
    #[error("rpc error: {0}")]
    Rpc(String),
    /// The transaction request could not be built into a signed envelope.
    #[error("failed to build transaction: {0}")]
    Build(String),
}

impl ClientError {
    /// Whether the error is a nonce or fee race that a re-reserved nonce and
    /// a retry can recover from.
    pub fn is_nonce_retryable(&self) -> bool {
        let Self::Rpc(message) = self else { return false };
        let lowered = message.to_lowercase();
        lowered.contains("nonce too low") || lowered.contains("replacement underpriced")
    }
}

/// A client for one EVM chain: nonce reads, fee estimation, and transaction
/// propagation.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The account's next nonce, including pending transactions.
    async fn pending_nonce(&self, address: Address) -> Result<u64, ClientError>;

    /// EIP-1559 fee estimate for the next block.
    async fn estimate_fees(&self) -> Result<Eip1559Estimation, ClientError>;

    /// Signs the request with `wallet` and broadcasts it.
    async fn sign_and_send(
        &self,
        wallet: &EthereumWallet,
        tx: TransactionRequest,
    ) -> Result<TxHash, ClientError>;

    /// Execution status of a mined transaction: `None` until mined, then
    /// `Some(succeeded)`.
    async fn receipt_status(&self, tx_hash: TxHash) -> Result<Option<bool>, ClientError>;
}

impl std::fmt::Debug for dyn ChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChainClient")
    }
}

/// A [`ChainClient`] over an alloy provider.
#[derive(Debug)]
pub struct AlloyChainClient<P> {
    provider: P,
}

impl<P> AlloyChainClient<P> {
    /// Creates a client over the given provider.
    pub const fn new(provider: P) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P> ChainClient for AlloyChainClient<P>
where
    P: Provider + Send + Sync,
{
    async fn pending_nonce(&self, address: Address) -> Result<u64, ClientError> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|err| ClientError::Rpc(err.to_string()))
    }

    async fn estimate_fees(&self) -> Result<Eip1559Estimation, ClientError> {
        self.provider
            .estimate_eip1559_fees()
            .await
            .map_err(|err| ClientError::Rpc(err.to_string()))
    }

    async fn sign_and_send(
        &self,
        wallet: &EthereumWallet,
        tx: TransactionRequest,
    ) -> Result<TxHash, ClientError> {
        let envelope = <TransactionRequest as TransactionBuilder<Ethereum>>::build::<
            EthereumWallet,
        >(tx, wallet)
        .await
        .map_err(|err| ClientError::Build(err.to_string()))?;

        self.provider
            .send_raw_transaction(&envelope.encoded_2718())
            .await
            .map(|pending| *pending.tx_hash())
            .map_err(|err| ClientError::Rpc(err.to_string()))
    }

    async fn receipt_status(&self, tx_hash: TxHash) -> Result<Option<bool>, ClientError> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map(|receipt| receipt.map(|r| r.status()))
            .map_err(|err| ClientError::Rpc(err.to_string()))
    }
}

pub mod mock {
    //! Scripted chain client for tests.

    use super::{ChainClient, ClientError};
    use alloy_network::{EthereumWallet, NetworkWallet};
    use alloy_primitives::{Address, TxHash, B256, U256};
    use alloy_provider::utils::Eip1559Estimation;
    use alloy_rpc_types::TransactionRequest;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::{
        collections::{HashMap, VecDeque},
        sync::Arc,
    };

    /// A transfer accepted by the mock chain.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentTransfer {
        /// Sending wallet.
        pub from: Address,
        /// Reserved nonce carried by the transaction.
        pub nonce: u64,
        /// Recipient.
        pub to: Option<Address>,
        /// Transfer value.
        pub value: U256,
        /// Hash the mock assigned.
        pub hash: TxHash,
    }

    #[derive(Debug)]
    struct MockInner {
        base_nonces: Mutex<HashMap<Address, u64>>,
        sent: Mutex<Vec<SentTransfer>>,
        send_faults: Mutex<HashMap<Address, VecDeque<ClientError>>>,
        fees: Mutex<Eip1559Estimation>,
        fee_calls: Mutex<u64>,
    }

    impl Default for MockInner {
        fn default() -> Self {
            Self {
                base_nonces: Mutex::default(),
                sent: Mutex::default(),
                send_faults: Mutex::default(),
                fees: Mutex::new(Eip1559Estimation {
                    max_fee_per_gas: 1_000_000_000,
                    max_priority_fee_per_gas: 1_000_000_000,
                }),
                fee_calls: Mutex::default(),
            }
        }
    }

    /// A [`ChainClient`] replaying scripted behavior against an in-memory
    /// chain view.
    #[derive(Debug, Clone, Default)]
    pub struct MockChainClient {
        inner: Arc<MockInner>,
    }

    impl MockChainClient {
        /// Creates a mock with zero nonces and 1 gwei fees.
        pub fn new() -> Self {
            Self::default()
        }

        /// Sets the starting pending nonce for an address.
        pub fn set_base_nonce(&self, address: Address, nonce: u64) {
            self.inner.base_nonces.lock().insert(address, nonce);
        }

        /// Overrides the served fee estimate.
        pub fn set_fees(&self, fees: Eip1559Estimation) {
            *self.inner.fees.lock() = fees;
        }

        /// Scripts errors returned by successive sends from `address` before
        /// sends start succeeding again.
        pub fn fail_sends(&self, address: Address, errors: impl IntoIterator<Item = ClientError>) {
            self.inner
                .send_faults
                .lock()
                .entry(address)
                .or_default()
                .extend(errors);
        }

        /// Everything the mock chain accepted, in send order.
        pub fn sent(&self) -> Vec<SentTransfer> {
            self.inner.sent.lock().clone()
        }

        /// Accepted transfers sent by `address`.
        pub fn sent_by(&self, address: Address) -> Vec<SentTransfer> {
            self.sent().into_iter().filter(|t| t.from == address).collect()
        }

        /// Number of fee estimations served.
        pub fn fee_calls(&self) -> u64 {
            *self.inner.fee_calls.lock()
        }
    }

    #[async_trait]
    impl ChainClient for MockChainClient {
        async fn pending_nonce(&self, address: Address) -> Result<u64, ClientError> {
            let base =
                self.inner.base_nonces.lock().get(&address).copied().unwrap_or_default();
            let in_chain =
                self.inner.sent.lock().iter().filter(|t| t.from == address).count() as u64;
            Ok(base + in_chain)
        }

        async fn estimate_fees(&self) -> Result<Eip1559Estimation, ClientError> {
            *self.inner.fee_calls.lock() += 1;
            Ok(*self.inner.fees.lock())
        }

        async fn sign_and_send(
            &self,
            wallet: &EthereumWallet,
            tx: TransactionRequest,
        ) -> Result<TxHash, ClientError> {
            // Suspend once, like a real broadcast would, so concurrent
            // callers interleave realistically.
            tokio::task::yield_now().await;

            let from = NetworkWallet::<alloy_network::Ethereum>::default_signer_address(wallet);

            if let Some(fault) =
                self.inner.send_faults.lock().get_mut(&from).and_then(VecDeque::pop_front)
            {
                return Err(fault);
            }

            let mut sent = self.inner.sent.lock();
            let hash = B256::from(U256::from(sent.len() as u64 + 1));
            sent.push(SentTransfer {
                from,
                nonce: tx.nonce.unwrap_or_default(),
                to: tx.to.and_then(|kind| kind.to().copied()),
                value: tx.value.unwrap_or_default(),
                hash,
            });
            Ok(hash)
        }

        async fn receipt_status(&self, tx_hash: TxHash) -> Result<Option<bool>, ClientError> {
            let mined = self.inner.sent.lock().iter().any(|t| t.hash == tx_hash);
            Ok(mined.then_some(true))
        }
    }
}
