//! Token faucet service
//!
//! Dispenses a fixed amount of an ERC-20 token to any address, at most once
//! per cooldown window. The per-address claim record lives behind the
//! [`store::ClaimStore`] trait (memory, sled, Redis or a REST KV endpoint);
//! transfers go through [`distributor::Distributor`].

pub mod api;
pub mod config;
pub mod coordinator;
pub mod distributor;
pub mod error;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod store;
pub mod units;

pub use config::{FaucetConfig, StoreConfig};
pub use coordinator::{ClaimCoordinator, ClaimOutcome, CoordinatorSettings, Dispensation, FaucetStatus};
pub use distributor::{Distributor, Erc20Distributor, TransferReceipt};
pub use error::{DistributorError, FaucetError, FaucetResult, StoreError};
pub use identity::Identity;
pub use store::{ClaimPolicy, ClaimRecord, ClaimStore, MemoryClaimStore, SledClaimStore};
