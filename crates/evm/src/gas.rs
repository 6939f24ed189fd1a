//! EIP-1559 fee management.
//!
//! Wraps the chain client's fee oracle and applies per-chain multipliers, so
//! congested chains can be configured to bid above the raw estimate without
//! touching call sites.

use crate::client::{ChainClient, ClientError};
use alloy_primitives::ChainId;
use alloy_provider::utils::Eip1559Estimation;
use std::collections::HashMap;

/// Fee multiplier in percent; `100` passes the estimate through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeMultiplier {
    /// Applied to `max_fee_per_gas`.
    pub max_fee_percent: u64,
    /// Applied to `max_priority_fee_per_gas`.
    pub priority_fee_percent: u64,
}

impl Default for FeeMultiplier {
    fn default() -> Self {
        Self { max_fee_percent: 100, priority_fee_percent: 100 }
    }
}

/// Per-chain EIP-1559 fee estimation.
#[derive(Debug, Clone, Default)]
pub struct GasManager {
    multipliers: HashMap<ChainId, FeeMultiplier>,
}

impl GasManager {
    /// Creates a manager passing estimates through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the multiplier for one chain.
    pub fn with_multiplier(mut self, chain_id: ChainId, multiplier: FeeMultiplier) -> Self {
        self.multipliers.insert(chain_id, multiplier);
        self
    }

    /// Returns the fee settings for the next transaction on `chain_id`.
    pub async fn fees<C>(
        &self,
        client: &C,
        chain_id: ChainId,
    ) -> Result<Eip1559Estimation, ClientError>
    where
        C: ChainClient + ?Sized,
    {
        let estimate = client.estimate_fees().await?;
        let multiplier = self.multipliers.get(&chain_id).copied().unwrap_or_default();
        Ok(Eip1559Estimation {
            max_fee_per_gas: scale(estimate.max_fee_per_gas, multiplier.max_fee_percent),
            max_priority_fee_per_gas: scale(
                estimate.max_priority_fee_per_gas,
                multiplier.priority_fee_percent,
            ),
        })
    }
}

fn scale(fee: u128, percent: u64) -> u128 {
    fee.saturating_mul(u128::from(percent)) / 100
}
