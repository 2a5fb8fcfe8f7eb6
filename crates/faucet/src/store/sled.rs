//! Durable claim store on a local sled database
//!
//! Reservations are written with sled's native compare-and-swap, so the
//! check-and-write needs no lock. Records survive restarts; a reservation
//! left behind by a crash is recovered once the reservation timeout
//! passes. sled has no TTL, so expired records are removed by
//! [`ClaimStore::purge_expired`].

use super::{
    evaluate, ClaimPolicy, ClaimRecord, ClaimState, ClaimStore, Reservation, ReserveOutcome,
    StoredClaim,
};
use crate::error::{StoreError, StoreResult};
use crate::identity::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::{IVec, Tree};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_CAS_ATTEMPTS: usize = 16;

pub struct SledClaimStore {
    db: sled::Db,
    claims: Tree,
    policy: ClaimPolicy,
}

impl SledClaimStore {
    /// Create or open the claim database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, policy: ClaimPolicy) -> StoreResult<Self> {
        info!("Opening claim database at: {}", path.as_ref().display());

        let db = sled::Config::default().path(path.as_ref()).open()?;
        let claims = db.open_tree("claims")?;

        Ok(Self { db, claims, policy })
    }

    /// Number of stored records, expired or not.
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    async fn flush(&self) -> StoreResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

fn encode(record: &ClaimRecord) -> StoreResult<Vec<u8>> {
    bincode::serialize(&StoredClaim::from_record(record))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(identity: &Identity, bytes: &[u8]) -> StoreResult<ClaimRecord> {
    let stored: StoredClaim = bincode::deserialize(bytes).map_err(|e| StoreError::Corrupt {
        identity: identity.to_string(),
        reason: e.to_string(),
    })?;
    stored.into_record(identity)
}

fn decode_entry(key: &IVec, value: &IVec) -> StoreResult<ClaimRecord> {
    let identity = Identity::normalize(&String::from_utf8_lossy(key));
    decode(&identity, value)
}

#[async_trait]
impl ClaimStore for SledClaimStore {
    fn backend(&self) -> &'static str {
        "sled"
    }

    async fn get(&self, identity: &Identity) -> StoreResult<Option<ClaimRecord>> {
        let claims = self.claims.clone();
        let identity = identity.clone();

        tokio::task::spawn_blocking(move || -> StoreResult<Option<ClaimRecord>> {
            claims
                .get(identity.as_str())?
                .map(|bytes| decode(&identity, &bytes))
                .transpose()
        })
        .await?
    }

    async fn try_reserve(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> StoreResult<ReserveOutcome> {
        let claims = self.claims.clone();
        let policy = self.policy;
        let identity = identity.clone();

        let outcome = tokio::task::spawn_blocking(move || -> StoreResult<ReserveOutcome> {
            for _ in 0..MAX_CAS_ATTEMPTS {
                let current = claims.get(identity.as_str())?;
                let existing = current
                    .as_ref()
                    .map(|bytes| decode(&identity, bytes))
                    .transpose()?;

                let previous = match evaluate(existing.as_ref(), now, &policy) {
                    Ok(previous) => previous,
                    Err(rejection) => return Ok(ReserveOutcome::Rejected(rejection)),
                };

                let token = Uuid::new_v4();
                let reserved = encode(&ClaimRecord {
                    identity: identity.clone(),
                    last_claim_at: now,
                    state: ClaimState::Reserved { token, previous },
                })?;

                if claims
                    .compare_and_swap(identity.as_str(), current.as_ref(), Some(reserved))?
                    .is_ok()
                {
                    return Ok(ReserveOutcome::Reserved(Reservation {
                        identity: identity.clone(),
                        token,
                        reserved_at: now,
                    }));
                }
                debug!(%identity, "Claim record changed under us, retrying");
            }
            Err(StoreError::Contention(MAX_CAS_ATTEMPTS))
        })
        .await??;

        if matches!(outcome, ReserveOutcome::Reserved(_)) {
            self.flush().await?;
        }
        Ok(outcome)
    }

    async fn commit(&self, reservation: &Reservation, now: DateTime<Utc>) -> StoreResult<()> {
        let claims = self.claims.clone();
        let reservation = reservation.clone();

        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let identity = &reservation.identity;
            let committed = encode(&ClaimRecord::committed(identity.clone(), now))?;
            let replaced = claims.insert(identity.as_str(), committed)?;

            let held = match replaced {
                Some(bytes) => matches!(
                    decode(identity, &bytes)?.state,
                    ClaimState::Reserved { token, .. } if token == reservation.token
                ),
                None => false,
            };
            if !held {
                warn!(%identity, "Committing claim whose reservation is no longer current");
            }
            Ok(())
        })
        .await??;

        self.flush().await
    }

    async fn release(&self, reservation: &Reservation) -> StoreResult<()> {
        let claims = self.claims.clone();
        let reservation = reservation.clone();

        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let identity = &reservation.identity;
            for _ in 0..MAX_CAS_ATTEMPTS {
                let Some(current) = claims.get(identity.as_str())? else {
                    return Ok(());
                };
                let previous = match decode(identity, &current)?.state {
                    ClaimState::Reserved { token, previous } if token == reservation.token => previous,
                    _ => {
                        debug!(%identity, "Reservation already gone; nothing to release");
                        return Ok(());
                    }
                };

                let restored = previous
                    .map(|at| encode(&ClaimRecord::committed(identity.clone(), at)))
                    .transpose()?;

                if claims
                    .compare_and_swap(identity.as_str(), Some(&current), restored)?
                    .is_ok()
                {
                    return Ok(());
                }
            }
            Err(StoreError::Contention(MAX_CAS_ATTEMPTS))
        })
        .await??;

        self.flush().await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let claims = self.claims.clone();
        let policy = self.policy;

        let removed = tokio::task::spawn_blocking(move || -> StoreResult<usize> {
            let mut removed = 0;
            for item in claims.iter() {
                let (key, value) = item?;
                let record = match decode_entry(&key, &value) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Skipping unreadable claim record: {}", e);
                        continue;
                    }
                };

                if record.is_expired(now, &policy)
                    && claims
                        .compare_and_swap(&key, Some(&value), None as Option<IVec>)?
                        .is_ok()
                {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await??;

        if removed > 0 {
            self.flush().await?;
        }
        debug!(removed, "Purge pass complete");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Rejection;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn policy() -> ClaimPolicy {
        ClaimPolicy::new(Duration::from_secs(12 * 3600), Duration::from_secs(90))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn id(n: u8) -> Identity {
        Identity::normalize(&format!("0x{:040x}", n))
    }

    fn expect_reserved(outcome: ReserveOutcome) -> Reservation {
        match outcome {
            ReserveOutcome::Reserved(r) => r,
            other => panic!("expected reservation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_basic_protocol() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledClaimStore::open(temp_dir.path(), policy()).unwrap();

        let reservation = expect_reserved(store.try_reserve(&id(1), at(0)).await.unwrap());
        assert_eq!(
            store.try_reserve(&id(1), at(1)).await.unwrap(),
            ReserveOutcome::Rejected(Rejection::InFlight {
                remaining: Duration::from_secs(89)
            })
        );

        store.commit(&reservation, at(2)).await.unwrap();
        assert_eq!(
            store.get(&id(1)).await.unwrap(),
            Some(ClaimRecord::committed(id(1), at(2)))
        );

        // Other identities are unaffected
        expect_reserved(store.try_reserve(&id(2), at(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = SledClaimStore::open(temp_dir.path(), policy()).unwrap();
            let reservation = expect_reserved(store.try_reserve(&id(1), at(0)).await.unwrap());
            store.commit(&reservation, at(0)).await.unwrap();
        }

        let store = SledClaimStore::open(temp_dir.path(), policy()).unwrap();
        assert_eq!(
            store.try_reserve(&id(1), at(3600)).await.unwrap(),
            ReserveOutcome::Rejected(Rejection::Cooldown {
                remaining: Duration::from_secs(11 * 3600)
            })
        );
    }

    #[tokio::test]
    async fn test_crashed_reservation_recovers_after_timeout() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = SledClaimStore::open(temp_dir.path(), policy()).unwrap();
            expect_reserved(store.try_reserve(&id(1), at(0)).await.unwrap());
        }

        let store = SledClaimStore::open(temp_dir.path(), policy()).unwrap();
        assert_eq!(
            store.try_reserve(&id(1), at(30)).await.unwrap(),
            ReserveOutcome::Rejected(Rejection::InFlight {
                remaining: Duration::from_secs(60)
            })
        );
        expect_reserved(store.try_reserve(&id(1), at(91)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_restores_previous_claim() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledClaimStore::open(temp_dir.path(), policy()).unwrap();

        let first = expect_reserved(store.try_reserve(&id(1), at(0)).await.unwrap());
        store.commit(&first, at(0)).await.unwrap();

        let second = expect_reserved(store.try_reserve(&id(1), at(13 * 3600)).await.unwrap());
        store.release(&second).await.unwrap();

        assert_eq!(
            store.get(&id(1)).await.unwrap(),
            Some(ClaimRecord::committed(id(1), at(0)))
        );
    }

    #[tokio::test]
    async fn test_concurrent_reservations_admit_one() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SledClaimStore::open(temp_dir.path(), policy()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.try_reserve(&id(7), at(0)).await.unwrap() }));
        }

        let mut reserved = 0;
        for handle in handles {
            if let ReserveOutcome::Reserved(_) = handle.await.unwrap() {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 1);
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledClaimStore::open(temp_dir.path(), policy()).unwrap();

        let old = expect_reserved(store.try_reserve(&id(1), at(0)).await.unwrap());
        store.commit(&old, at(0)).await.unwrap();
        let recent = expect_reserved(store.try_reserve(&id(2), at(10 * 3600)).await.unwrap());
        store.commit(&recent, at(10 * 3600)).await.unwrap();

        let removed = store.purge_expired(at(13 * 3600)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&id(1)).await.unwrap().is_none());
        assert!(store.get(&id(2)).await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }
}
