//! Faucet configuration

use crate::error::{FaucetError, FaucetResult};
use crate::logging::LogConfig;
use crate::units::parse_units;
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Claim store backend and its connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local map. Cooldowns reset on restart.
    Memory,
    /// Local sled database directory.
    Sled {
        #[serde(default = "default_sled_path")]
        path: String,
    },
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
    /// Hosted Redis-compatible REST endpoint.
    RestKv {
        url: String,
        token: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory
    }
}

fn default_sled_path() -> String {
    "./faucet_data".to_string()
}

fn default_key_prefix() -> String {
    "faucet:claim:".to_string()
}

/// Longest accepted cooldown (ten years).
const MAX_COOLDOWN_HOURS: f64 = 10.0 * 365.0 * 24.0;

/// Faucet service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaucetConfig {
    /// Server address
    pub server_addr: String,

    /// JSON-RPC endpoint of the ledger
    pub rpc_url: String,

    /// Human-readable network name reported by the status endpoint
    pub network: String,

    /// Faucet account private key (hex)
    pub private_key: String,

    /// ERC-20 token contract address
    pub token_address: String,

    /// Token symbol reported to claimants
    pub token_symbol: String,

    /// Token decimal precision
    pub decimals: u8,

    /// Amount dispensed per claim, in whole tokens (decimal string)
    pub dispense_amount: String,

    /// Minimum spacing between two claims of one address, in hours
    pub cooldown_hours: f64,

    /// Upper bound on a single transfer submission
    pub submit_timeout_secs: u64,

    /// Age after which an unfinished reservation is considered abandoned
    pub reservation_timeout_secs: u64,

    /// Commit attempts after a confirmed transfer before alerting
    pub commit_retries: u32,

    /// Initial backoff between commit attempts (doubles each retry)
    pub commit_retry_backoff_ms: u64,

    /// Gas limit for transfer transactions
    pub gas_limit: u64,

    /// Fixed gas price in wei; queried from the node when unset
    pub gas_price: Option<String>,

    /// Chain ID override; queried from the node when unset
    pub chain_id: Option<u64>,

    /// Enable CORS
    pub cors_enabled: bool,

    /// Interval of the expired-record sweep for stores without native expiry
    pub purge_interval_secs: u64,

    /// Claim store backend
    pub store: StoreConfig,

    /// Logging
    pub log: LogConfig,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:3000".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            network: "arb-sepolia".to_string(),
            private_key: String::new(),
            token_address: String::new(),
            token_symbol: "SLR".to_string(),
            decimals: 18,
            dispense_amount: "5".to_string(),
            cooldown_hours: 12.0,
            submit_timeout_secs: 30,
            reservation_timeout_secs: 90,
            commit_retries: 3,
            commit_retry_backoff_ms: 200,
            gas_limit: 100_000,
            gas_price: None,
            chain_id: None,
            cors_enabled: true,
            purge_interval_secs: 86400, // Daily
            store: StoreConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl FaucetConfig {
    /// Load defaults, then the optional file, then `FAUCET_*` variables.
    ///
    /// Nested keys use a double underscore: `FAUCET_STORE__KIND=redis`.
    pub fn load(path: Option<&Path>) -> FaucetResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("FAUCET")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| FaucetError::Config(format!("Failed to build configuration: {}", e)))?;

        settings
            .try_deserialize::<FaucetConfig>()
            .map_err(|e| FaucetError::Config(format!("Failed to deserialize configuration: {}", e)))
    }

    /// Reject settings the claim protocol cannot work with.
    pub fn validate(&self) -> FaucetResult<()> {
        if self.dispense_amount_units()? == 0 {
            return Err(FaucetError::Config("dispense_amount must be positive".to_string()));
        }
        if !(self.cooldown_hours.is_finite() && self.cooldown_hours > 0.0) {
            return Err(FaucetError::Config("cooldown_hours must be positive".to_string()));
        }
        if self.cooldown_hours > MAX_COOLDOWN_HOURS {
            return Err(FaucetError::Config(format!(
                "cooldown_hours must not exceed {}",
                MAX_COOLDOWN_HOURS
            )));
        }
        if self.submit_timeout_secs == 0 {
            return Err(FaucetError::Config("submit_timeout_secs must be positive".to_string()));
        }
        if self.reservation_timeout_secs <= self.submit_timeout_secs {
            return Err(FaucetError::Config(format!(
                "reservation_timeout_secs ({}) must exceed submit_timeout_secs ({})",
                self.reservation_timeout_secs, self.submit_timeout_secs
            )));
        }
        Ok(())
    }

    /// Dispense amount in token base units.
    pub fn dispense_amount_units(&self) -> FaucetResult<u128> {
        parse_units(&self.dispense_amount, self.decimals)
            .map_err(|e| FaucetError::Config(format!("dispense_amount: {}", e)))
    }

    /// Fixed gas price, if configured.
    pub fn gas_price_wei(&self) -> FaucetResult<Option<u128>> {
        self.gas_price
            .as_deref()
            .map(|p| {
                p.parse::<u128>()
                    .map_err(|_| FaucetError::Config(format!("Invalid gas price: {}", p)))
            })
            .transpose()
    }

    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.cooldown_hours * 3600.0).unwrap_or(Duration::MAX)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout_secs)
    }

    pub fn commit_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.commit_retry_backoff_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}
