//! Claim admission
//!
//! [`ClaimCoordinator::request_claim`] runs one claim through
//!
//! 1. funding check (an empty faucet never consumes a claim slot),
//! 2. reservation in the claim store (one in-flight transfer per address),
//! 3. the transfer, bounded by a timeout,
//! 4. commit on success, release on failure.
//!
//! The store and the ledger are never updated together. Failures are biased
//! towards leaving the claim available again; the cases where that is not
//! possible (a transfer whose outcome is unknown, a commit that cannot be
//! written) are logged under [`RECONCILIATION_TARGET`].

use crate::config::FaucetConfig;
use crate::distributor::{Distributor, TransferReceipt};
use crate::error::{DistributorError, FaucetError, FaucetResult};
use crate::identity::Identity;
use crate::logging::RECONCILIATION_TARGET;
use crate::metrics;
use crate::store::{ClaimPolicy, ClaimStore, Rejection, Reservation, ReserveOutcome};
use crate::units::format_units;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What a single claim pays out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispensation {
    /// Base units per claim
    pub amount: u128,
    pub decimals: u8,
    pub token_symbol: String,
    pub token_address: String,
}

impl Dispensation {
    pub fn from_config(config: &FaucetConfig) -> FaucetResult<Self> {
        Ok(Self {
            amount: config.dispense_amount_units()?,
            decimals: config.decimals,
            token_symbol: config.token_symbol.clone(),
            token_address: config.token_address.clone(),
        })
    }

    /// Amount in whole tokens, e.g. `"5"`.
    pub fn display_amount(&self) -> String {
        format_units(self.amount, self.decimals)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub submit_timeout: Duration,
    /// Commit attempts after a confirmed transfer
    pub commit_retries: u32,
    /// Backoff before the second attempt; doubles afterwards
    pub commit_retry_backoff: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &FaucetConfig) -> Self {
        Self {
            submit_timeout: config.submit_timeout(),
            commit_retries: config.commit_retries,
            commit_retry_backoff: config.commit_retry_backoff(),
        }
    }
}

/// Result of one claim request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Transfer accepted and claim recorded.
    Dispatched(TransferReceipt),
    /// Cooldown still running. Nothing changed.
    Throttled(Duration),
    /// Balance below one dispensation. Nothing changed.
    Underfunded,
    /// Transfer failed or timed out; the reservation was released.
    TransferFailed(DistributorError),
}

impl ClaimOutcome {
    fn label(&self) -> &'static str {
        match self {
            ClaimOutcome::Dispatched(_) => "dispatched",
            ClaimOutcome::Throttled(_) => "throttled",
            ClaimOutcome::Underfunded => "underfunded",
            ClaimOutcome::TransferFailed(_) => "transfer_failed",
        }
    }
}

/// Faucet status snapshot. Reads the ledger only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaucetStatus {
    pub token: String,
    pub symbol: String,
    pub funding_level: String,
    pub dispense_amount: String,
    pub cooldown_hours: f64,
    pub backend: String,
}

pub struct ClaimCoordinator {
    store: Arc<dyn ClaimStore>,
    distributor: Arc<dyn Distributor>,
    dispensation: Dispensation,
    policy: ClaimPolicy,
    settings: CoordinatorSettings,
}

impl ClaimCoordinator {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        distributor: Arc<dyn Distributor>,
        dispensation: Dispensation,
        policy: ClaimPolicy,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            distributor,
            dispensation,
            policy,
            settings,
        }
    }

    pub fn dispensation(&self) -> &Dispensation {
        &self.dispensation
    }

    pub fn store(&self) -> &Arc<dyn ClaimStore> {
        &self.store
    }

    /// Admit and execute one claim for `identity` at time `now`.
    ///
    /// `Err` is reserved for infrastructure failures before any transfer was
    /// attempted (ledger unreachable for the balance check, store down).
    pub async fn request_claim(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> FaucetResult<ClaimOutcome> {
        let result = self.run_claim(identity, now).await;
        match &result {
            Ok(outcome) => metrics::record_outcome(outcome.label()),
            Err(e) => {
                error!(%identity, error = %e, "Claim aborted");
                metrics::record_outcome("error");
            }
        }
        result
    }

    async fn run_claim(&self, identity: &Identity, now: DateTime<Utc>) -> FaucetResult<ClaimOutcome> {
        // 1. Funding before reservation
        let balance = self.funding_level().await?;
        if balance < self.dispensation.amount {
            warn!(
                balance = %format_units(balance, self.dispensation.decimals),
                "Faucet balance below one dispensation"
            );
            return Ok(ClaimOutcome::Underfunded);
        }

        // 2. Reserve
        let reservation = match self.store.try_reserve(identity, now).await? {
            ReserveOutcome::Reserved(reservation) => reservation,
            ReserveOutcome::Rejected(Rejection::Cooldown { remaining }) => {
                debug!(%identity, remaining_secs = remaining.as_secs(), "Claim throttled");
                return Ok(ClaimOutcome::Throttled(remaining));
            }
            ReserveOutcome::Rejected(Rejection::InFlight { remaining }) => {
                debug!(%identity, remaining_secs = remaining.as_secs(), "Claim already in flight");
                return Ok(ClaimOutcome::Throttled(remaining));
            }
        };

        // 3-4. Detached: dropping this future must not strand the reservation.
        let settlement = tokio::spawn(self.settlement().run(reservation, now));
        settlement
            .await
            .map_err(|e| FaucetError::Internal(format!("Settlement task failed: {}", e)))
    }

    /// Current faucet balance in base units.
    pub async fn funding_level(&self) -> FaucetResult<u128> {
        let balance = self.distributor.balance().await.map_err(|e| {
            warn!(error = %e, "Balance check failed");
            FaucetError::Distributor(e)
        })?;
        metrics::record_funding_level(balance);
        Ok(balance)
    }

    pub async fn status(&self) -> FaucetResult<FaucetStatus> {
        let balance = self.funding_level().await?;
        Ok(FaucetStatus {
            token: self.dispensation.token_address.clone(),
            symbol: self.dispensation.token_symbol.clone(),
            funding_level: format_units(balance, self.dispensation.decimals),
            dispense_amount: self.dispensation.display_amount(),
            cooldown_hours: self.policy.cooldown.as_secs_f64() / 3600.0,
            backend: self.store.backend().to_string(),
        })
    }

    fn settlement(&self) -> Settlement {
        Settlement {
            store: self.store.clone(),
            distributor: self.distributor.clone(),
            amount: self.dispensation.amount,
            reservation_timeout: self.policy.reservation_timeout,
            settings: self.settings,
        }
    }
}

/// Everything after a successful reservation: submit, then commit or
/// release. Owns its handles so it can outlive the request.
struct Settlement {
    store: Arc<dyn ClaimStore>,
    distributor: Arc<dyn Distributor>,
    amount: u128,
    reservation_timeout: Duration,
    settings: CoordinatorSettings,
}

impl Settlement {
    async fn run(self, reservation: Reservation, now: DateTime<Utc>) -> ClaimOutcome {
        let identity = &reservation.identity;

        match self.submit(identity).await {
            Ok(receipt) => {
                self.commit(&reservation, now, &receipt).await;
                info!(%identity, tx_hash = %receipt.tx_hash, "Claim dispatched");
                ClaimOutcome::Dispatched(receipt)
            }
            Err(cause) => {
                if let DistributorError::Ambiguous { tx_hash, reason } = &cause {
                    error!(
                        target: RECONCILIATION_TARGET,
                        %identity,
                        tx_hash = tx_hash.as_deref().unwrap_or("unknown"),
                        %reason,
                        "Transfer outcome unknown; releasing reservation. Check the ledger and record the claim by hand if it landed"
                    );
                    metrics::record_reconciliation("ambiguous_transfer");
                } else {
                    warn!(%identity, error = %cause, "Transfer failed");
                }
                self.release(&reservation).await;
                ClaimOutcome::TransferFailed(cause)
            }
        }
    }

    async fn submit(&self, identity: &Identity) -> Result<TransferReceipt, DistributorError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.settings.submit_timeout,
            self.distributor.submit(identity, self.amount),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DistributorError::Ambiguous {
                tx_hash: self.distributor.take_abandoned(identity),
                reason: format!("no answer within {:?}", self.settings.submit_timeout),
            }),
        };
        metrics::SUBMIT_DURATION.observe(started.elapsed().as_secs_f64());
        result
    }

    /// Record a landed transfer, retrying with backoff.
    async fn commit(&self, reservation: &Reservation, now: DateTime<Utc>, receipt: &TransferReceipt) {
        let attempts = self.settings.commit_retries.max(1);
        let mut backoff = self.settings.commit_retry_backoff;

        for attempt in 1..=attempts {
            match self.store.commit(reservation, now).await {
                Ok(()) => return,
                Err(e) if attempt < attempts => {
                    warn!(identity = %reservation.identity, attempt, error = %e, "Commit failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(
                        target: RECONCILIATION_TARGET,
                        identity = %reservation.identity,
                        tx_hash = %receipt.tx_hash,
                        claimed_at = %now.to_rfc3339(),
                        error = %e,
                        "Transfer landed but the claim could not be recorded; cooldown is not enforced for this address"
                    );
                    metrics::record_reconciliation("commit_lost");
                }
            }
        }
    }

    /// Drop a reservation after a failed transfer. A failed release leaves
    /// the reservation to expire on its own.
    async fn release(&self, reservation: &Reservation) {
        if let Err(e) = self.store.release(reservation).await {
            error!(
                target: RECONCILIATION_TARGET,
                identity = %reservation.identity,
                error = %e,
                retry_after_secs = self.reservation_timeout.as_secs(),
                "Could not release reservation; address stays blocked until it goes stale"
            );
            metrics::record_reconciliation("release_failed");
        }
    }
}
