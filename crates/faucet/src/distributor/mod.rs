//! Token distributors
//!
//! A distributor moves tokens on the ledger and reports how many the faucet
//! still holds. The claim coordinator treats it as an opaque capability.

pub mod erc20;
pub mod rpc;

pub use erc20::Erc20Distributor;
pub use rpc::BlockchainRpcClient;

use crate::error::DistributorError;
use crate::identity::Identity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Proof that the ledger accepted a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub tx_hash: String,
}

#[async_trait]
pub trait Distributor: Send + Sync {
    /// Current faucet balance in token base units.
    async fn balance(&self) -> Result<u128, DistributorError>;

    /// Transfer `amount` base units to `recipient`.
    async fn submit(&self, recipient: &Identity, amount: u128)
        -> Result<TransferReceipt, DistributorError>;

    /// Hash of a signed transfer to `recipient` whose `submit` was dropped
    /// before the node answered. Taking it clears it.
    fn take_abandoned(&self, _recipient: &Identity) -> Option<String> {
        None
    }
}
