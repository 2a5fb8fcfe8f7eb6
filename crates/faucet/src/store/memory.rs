//! Volatile in-process claim store
//!
//! Records live in a `moka` cache whose time-to-live covers the cooldown,
//! so finished claims are garbage collected without a sweep. Nothing
//! survives a restart and nothing is shared with other processes: running
//! two faucet processes on this backend allows one claim per process.

use super::locks::KeyedLocks;
use super::{evaluate, ClaimPolicy, ClaimRecord, ClaimState, ClaimStore, Reservation, ReserveOutcome};
use crate::error::StoreResult;
use crate::identity::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct MemoryClaimStore {
    records: Cache<Identity, ClaimRecord>,
    locks: KeyedLocks<Identity>,
    policy: ClaimPolicy,
}

impl MemoryClaimStore {
    pub fn new(policy: ClaimPolicy) -> Self {
        let records = Cache::builder()
            .time_to_live(policy.cooldown + policy.reservation_timeout)
            .build();

        warn!("Using in-memory claim store: cooldowns reset on restart and are not shared between processes");

        Self {
            records,
            locks: KeyedLocks::new(),
            policy,
        }
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, identity: &Identity) -> StoreResult<Option<ClaimRecord>> {
        Ok(self.records.get(identity))
    }

    async fn try_reserve(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> StoreResult<ReserveOutcome> {
        let _guard = self.locks.lock(identity).await;

        let existing = self.records.get(identity);
        let previous = match evaluate(existing.as_ref(), now, &self.policy) {
            Ok(previous) => previous,
            Err(rejection) => return Ok(ReserveOutcome::Rejected(rejection)),
        };

        let token = Uuid::new_v4();
        self.records.insert(
            identity.clone(),
            ClaimRecord {
                identity: identity.clone(),
                last_claim_at: now,
                state: ClaimState::Reserved { token, previous },
            },
        );

        debug!(%identity, %token, "Reserved claim slot");
        Ok(ReserveOutcome::Reserved(Reservation {
            identity: identity.clone(),
            token,
            reserved_at: now,
        }))
    }

    async fn commit(&self, reservation: &Reservation, now: DateTime<Utc>) -> StoreResult<()> {
        let identity = &reservation.identity;
        let _guard = self.locks.lock(identity).await;

        match self.records.get(identity).map(|r| r.state) {
            Some(ClaimState::Reserved { token, .. }) if token == reservation.token => {}
            other => warn!(%identity, current = ?other, "Committing claim whose reservation is no longer current"),
        }

        self.records
            .insert(identity.clone(), ClaimRecord::committed(identity.clone(), now));
        Ok(())
    }

    async fn release(&self, reservation: &Reservation) -> StoreResult<()> {
        let identity = &reservation.identity;
        let _guard = self.locks.lock(identity).await;

        let previous = match self.records.get(identity).map(|r| r.state) {
            Some(ClaimState::Reserved { token, previous }) if token == reservation.token => previous,
            _ => {
                debug!(%identity, "Reservation already gone; nothing to release");
                return Ok(());
            }
        };

        match previous {
            Some(at) => self
                .records
                .insert(identity.clone(), ClaimRecord::committed(identity.clone(), at)),
            None => self.records.invalidate(identity),
        }
        Ok(())
    }
}
