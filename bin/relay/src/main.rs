//! # Envelop Relay
//!
//! The relay service for the Envelop backend: forwards user-signed
//! private-chain transactions, reports their confirmation status, settles
//! feature intents once their transactions confirm, and drives
//! confirmation-gated EVM payouts through the batching queue and wallet
//! pool.

use alloy_provider::ProviderBuilder;
use alloy_rpc_client::RpcClient;
use alloy_signer_local::PrivateKeySigner;
use clap::Parser;
use envelop_aleo::{
    oracle::{StatusOracle, DEFAULT_CACHE_MS},
    rpc::{RelayApiServer, RelayRpc},
    submit::{PayloadMode, SubmissionStore, SubmitConfig},
    Submitter, TxState,
};
use envelop_evm::{
    pool::PayoutScheduler,
    queue::{BatchQueues, DEFAULT_BATCH_MAX_SIZE, DEFAULT_BATCH_MAX_WAIT_MS},
    AlloyChainClient, BatchConfig, GasManager, PoolConfig, WalletPool,
};
use envelop_settlement::{
    gate::{DEFAULT_POLL_MS, DEFAULT_TIMEOUT_MS},
    rpc::SettlementApiServer,
    FeatureKind, FeaturePolicy, GateConfig, PolicyTable, SettlementGate, SettlementRpc, Store,
};
use eyre::{bail, Context, OptionExt};
use hyper::Method;
use jsonrpsee::{
    core::{async_trait, RpcResult},
    proc_macros::rpc,
    server::Server,
    types::{error::INVALID_PARAMS_CODE, ErrorObject},
};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use url::Url;

/// The Envelop relayer: transaction forwarding, confirmation-gated
/// settlement, and EVM payout dispatch.
#[derive(Debug, Parser)]
#[command(author, about = "Relay", long_about = None)]
struct Args {
    /// The address to serve the RPC on.
    #[arg(long = "http.addr", value_name = "ADDR", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    address: IpAddr,
    /// The port to serve the RPC on.
    #[arg(long = "http.port", value_name = "PORT", default_value_t = 9119)]
    port: u16,

    /// Primary explorer endpoint for transaction status; known public
    /// fallbacks are always tried after it.
    #[arg(long = "chain.status-url", value_name = "URL")]
    status_url: Option<Url>,
    /// Status response cache TTL in milliseconds.
    #[arg(long = "chain.cache-ms", value_name = "MS", default_value_t = DEFAULT_CACHE_MS)]
    cache_ms: u64,

    /// Broadcast endpoint for serialized transactions; submission is
    /// register-only when absent.
    #[arg(long = "relay.submit-url", value_name = "URL")]
    submit_url: Option<Url>,
    /// How broadcast payloads are wrapped: raw, auto, or wrapped.
    #[arg(long = "relay.payload-mode", value_name = "MODE", default_value = "auto")]
    payload_mode: PayloadMode,

    /// Settlement status poll cadence in milliseconds.
    #[arg(long = "settle.poll-ms", value_name = "MS", default_value_t = DEFAULT_POLL_MS)]
    poll_ms: u64,
    /// Settlement deadline in milliseconds.
    #[arg(long = "settle.timeout-ms", value_name = "MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,
    /// Treat the chain as the ledger of record and leave cached balances
    /// untouched; `false` moves balances in the settlement transaction.
    #[arg(long = "settle.onchain-ledger", value_name = "BOOL", default_value_t = true, action = clap::ArgAction::Set)]
    onchain_ledger: bool,
    /// Require payment and invoice recipients to resolve through the
    /// on-chain claim index.
    #[arg(long = "settle.require-onchain-recipient", value_name = "BOOL", default_value_t = false, action = clap::ArgAction::Set)]
    require_onchain_recipient: bool,
    /// Reject settlement transactions whose fee payer is not the owner's
    /// wallet.
    #[arg(long = "tx.enforce-fee-payer-match", value_name = "BOOL", default_value_t = true, action = clap::ArgAction::Set)]
    enforce_fee_payer_match: bool,
    /// Feature policy override, `feature=program_id:function,function,…`.
    /// May be repeated, one per feature.
    #[arg(long = "policy", value_name = "POLICY")]
    policies: Vec<String>,

    /// Seal a payout batch at this many items.
    #[arg(long = "batch.max-size", value_name = "N", default_value_t = DEFAULT_BATCH_MAX_SIZE)]
    batch_max_size: usize,
    /// Seal a payout batch once its oldest item is this old, in
    /// milliseconds.
    #[arg(long = "batch.max-wait-ms", value_name = "MS", default_value_t = DEFAULT_BATCH_MAX_WAIT_MS)]
    batch_max_wait_ms: u64,
    /// EVM JSON-RPC endpoint, `chain_id=url`. May be repeated.
    #[arg(long = "evm.rpc", value_name = "CHAIN=URL")]
    evm_rpc: Vec<String>,
    /// EVM signer keys, `chain_id=key[,key]`. May be repeated; also read
    /// from the environment.
    #[arg(long = "evm.keys", value_name = "CHAIN=KEYS", env = "EVM_PRIVATE_KEYS", hide_env_values = true, value_delimiter = ' ')]
    evm_keys: Vec<String>,
}

impl Args {
    /// Run the relayer service.
    async fn run(self) -> eyre::Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();

        let http = reqwest::Client::new();
        let store = Arc::new(Store::new());

        // Chain status oracle and relay submitter.
        let oracle = Arc::new(StatusOracle::with_endpoints(
            http.clone(),
            self.status_url.clone(),
            self.cache_ms,
        ));
        let submitter = Submitter::new(
            http,
            SubmitConfig { endpoint: self.submit_url.clone(), payload_mode: self.payload_mode },
            store.clone() as Arc<dyn SubmissionStore>,
        );

        // Settlement gate.
        let mut policies = PolicyTable::defaults(self.enforce_fee_payer_match);
        for entry in &self.policies {
            policies.set(parse_policy(entry, self.enforce_fee_payer_match)?);
        }
        let gate = SettlementGate::new(
            store.clone(),
            oracle.clone(),
            policies,
            GateConfig {
                poll_ms: self.poll_ms,
                timeout_ms: self.timeout_ms,
                onchain_ledger: self.onchain_ledger,
                require_onchain_recipient: self.require_onchain_recipient,
            },
        );

        // EVM payout pipeline.
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let queues = Arc::new(BatchQueues::new(
            BatchConfig { max_size: self.batch_max_size, max_wait_ms: self.batch_max_wait_ms },
            batch_tx,
        ));

        let endpoints = parse_keyed(&self.evm_rpc, "--evm.rpc")?;
        let keys = parse_keyed(&self.evm_keys, "--evm.keys")?;
        let mut scheduler = PayoutScheduler::new();
        for (chain_id, endpoint) in endpoints {
            let Some(raw_keys) = keys.get(&chain_id) else {
                warn!(chain_id, "No signer keys for configured EVM chain, skipping");
                continue;
            };
            let signers = raw_keys
                .split(',')
                .map(|key| key.trim().parse::<PrivateKeySigner>())
                .collect::<Result<Vec<_>, _>>()
                .wrap_err_with(|| format!("invalid signing key for chain {chain_id}"))?;
            let url: Url = endpoint.parse().wrap_err("invalid EVM RPC url")?;
            let provider = ProviderBuilder::new().connect_client(RpcClient::new_http(url));
            let pool = WalletPool::connect(
                chain_id,
                signers,
                Arc::new(AlloyChainClient::new(provider)),
                GasManager::new(),
                PoolConfig::default(),
            )
            .await?;
            info!(chain_id, wallets = pool.wallet_count(), "Connected payout wallet pool");
            scheduler = scheduler.with_pool(pool);
        }
        tokio::spawn(scheduler.run(batch_rx, result_tx));
        tokio::spawn(async move {
            while let Some(result) = result_rx.recv().await {
                match result.outcome {
                    Ok(tx_hash) => {
                        info!(request_id = %result.request_id, %tx_hash, "Payout confirmed")
                    }
                    Err(err) => {
                        warn!(request_id = %result.request_id, %err, "Payout failed")
                    }
                }
            }
        });

        // Assemble the RPC module: relay + settlement + payouts.
        let mut module = RelayRpc::new(submitter, oracle.clone()).into_rpc();
        module.merge(SettlementRpc::new(gate).into_rpc())?;
        module.merge(
            PayoutRpc {
                oracle,
                queues: queues.clone(),
                poll: Duration::from_millis(self.poll_ms.max(1)),
                timeout: Duration::from_millis(self.timeout_ms),
            }
            .into_rpc(),
        )?;

        // Start the server.
        let cors = CorsLayer::new()
            .allow_methods([Method::POST])
            .allow_origin(Any)
            .allow_headers([hyper::header::CONTENT_TYPE]);
        let middleware = tower::ServiceBuilder::new().layer(cors);
        let server = Server::builder()
            .set_http_middleware(middleware)
            .build((self.address, self.port))
            .await?;
        info!(addr = ?server.local_addr()?, "Started relay service");

        let handle = server.start(module);
        let stopper = handle.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down, flushing payout queues");
            queues.flush_all();
            let _ = stopper.stop();
        });
        handle.stopped().await;

        Ok(())
    }
}

/// Parses `feature=program_id:function,function,…` into a policy row.
fn parse_policy(entry: &str, require_fee_payer_match: bool) -> eyre::Result<FeaturePolicy> {
    let (feature, rest) =
        entry.split_once('=').ok_or_eyre("policy must look like feature=program:functions")?;
    let feature_kind = *FeatureKind::ALL
        .iter()
        .find(|kind| kind.as_str() == feature)
        .ok_or_eyre("unknown feature kind in --policy")?;
    let (program, functions) =
        rest.split_once(':').ok_or_eyre("policy must look like feature=program:functions")?;
    if program.is_empty() {
        bail!("policy for {feature} has an empty program id");
    }
    Ok(FeaturePolicy {
        feature_kind,
        allowed_program_id: program.to_owned(),
        allowed_function_names: functions
            .split(',')
            .filter(|f| !f.is_empty())
            .map(str::to_owned)
            .collect(),
        require_fee_payer_match,
    })
}

/// Parses repeated `chain_id=value` flags into a map.
fn parse_keyed(entries: &[String], flag: &str) -> eyre::Result<HashMap<u64, String>> {
    entries
        .iter()
        .map(|entry| {
            let (chain, value) = entry
                .split_once('=')
                .ok_or_else(|| eyre::eyre!("{flag} must look like chain_id=value"))?;
            let chain_id =
                chain.parse::<u64>().wrap_err_with(|| format!("invalid chain id in {flag}"))?;
            Ok((chain_id, value.to_owned()))
        })
        .collect()
}

/// A queued (not yet executed) payout acknowledgement.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct QueuePayoutReply {
    /// The accepted request id.
    request_id: String,
    /// The chain the payout will execute on.
    chain_id: u64,
}

/// Confirmation-gated EVM payout queueing.
#[rpc(server, namespace = "relay")]
trait PayoutApi {
    /// Wait for the settlement transaction to confirm, then enqueue the
    /// payout on its chain's batch queue.
    #[method(name = "queuePayout")]
    async fn queue_payout(
        &self,
        request_id: String,
        settlement_tx_id: String,
        chain_id: u64,
        recipient: String,
        amount_wei: String,
    ) -> RpcResult<QueuePayoutReply>;
}

#[derive(Debug)]
struct PayoutRpc {
    oracle: Arc<StatusOracle>,
    queues: Arc<BatchQueues>,
    poll: Duration,
    timeout: Duration,
}

#[async_trait]
impl PayoutApiServer for PayoutRpc {
    async fn queue_payout(
        &self,
        request_id: String,
        settlement_tx_id: String,
        chain_id: u64,
        recipient: String,
        amount_wei: String,
    ) -> RpcResult<QueuePayoutReply> {
        let recipient = recipient
            .parse()
            .map_err(|_| invalid_params("recipient is not a valid EVM address"))?;
        let amount_wei = amount_wei
            .parse()
            .map_err(|_| invalid_params("amount_wei is not a valid integer"))?;

        // The payout only enters the queue once the private-chain settlement
        // it pays out for is confirmed.
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let snapshot = self.oracle.lookup(&settlement_tx_id).await;
            match snapshot.state {
                TxState::Confirmed => break,
                TxState::Failed => {
                    return Err(invalid_params(&format!(
                        "settlement transaction {settlement_tx_id} failed"
                    )))
                }
                TxState::Pending | TxState::Unknown => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(invalid_params(&format!(
                            "timed out waiting for {settlement_tx_id}"
                        )));
                    }
                    tokio::time::sleep(self.poll).await;
                }
            }
        }

        self.queues
            .enqueue(request_id.clone(), chain_id, recipient, amount_wei)
            .map_err(|err| invalid_params(&err.to_string()))?;
        Ok(QueuePayoutReply { request_id, chain_id })
    }
}

fn invalid_params(message: &str) -> ErrorObject<'static> {
    ErrorObject::owned::<()>(INVALID_PARAMS_CODE, message, None)
}

#[doc(hidden)]
#[tokio::main]
async fn main() {
    // Enable backtraces unless a RUST_BACKTRACE value has already been explicitly provided.
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }

    let args = Args::parse();
    if let Err(err) = args.run().await {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
