//! Claim stores: who claimed when
//!
//! Every backend exposes the same reservation protocol:
//!
//! 1. `try_reserve` atomically checks eligibility and writes a `Reserved`
//!    record stamped with the request time.
//! 2. After the transfer, `commit` turns it into a `Committed` record that
//!    starts the cooldown, or `release` drops it and restores the previous
//!    committed claim (if any).
//!
//! A `Reserved` record older than the reservation timeout is treated as
//! abandoned and may be taken over.
//!
//! Backends:
//! - [`MemoryClaimStore`]: process-local, lost on restart, not shared
//!   between processes.
//! - [`SledClaimStore`]: local durable file, native compare-and-swap.
//! - [`RedisClaimStore`]: networked KV, server-side scripts, native expiry.
//! - [`RestKvClaimStore`]: managed KV over HTTPS, same scripts.

pub mod locks;
pub mod memory;
pub mod redis;
pub mod rest_kv;
mod scripts;
pub mod sled;

pub use self::memory::MemoryClaimStore;
pub use self::redis::RedisClaimStore;
pub use self::rest_kv::RestKvClaimStore;
pub use self::sled::SledClaimStore;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::identity::Identity;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Timing rules shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    /// Minimum spacing between two committed claims of one identity.
    pub cooldown: Duration,
    /// Age after which a reservation counts as abandoned.
    pub reservation_timeout: Duration,
}

impl ClaimPolicy {
    pub fn new(cooldown: Duration, reservation_timeout: Duration) -> Self {
        Self {
            cooldown,
            reservation_timeout,
        }
    }

    pub(crate) fn cooldown_ms(&self) -> i64 {
        self.cooldown.as_millis() as i64
    }

    pub(crate) fn reservation_timeout_ms(&self) -> i64 {
        self.reservation_timeout.as_millis() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimState {
    /// A transfer is in flight. `previous` is the committed claim time the
    /// reservation replaced, restored on release.
    Reserved {
        token: Uuid,
        previous: Option<DateTime<Utc>>,
    },
    Committed,
}

/// The single visible record for an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRecord {
    pub identity: Identity,
    /// Commit time for `Committed`, reservation time for `Reserved`.
    pub last_claim_at: DateTime<Utc>,
    pub state: ClaimState,
}

impl ClaimRecord {
    pub fn committed(identity: Identity, at: DateTime<Utc>) -> Self {
        Self {
            identity,
            last_claim_at: at,
            state: ClaimState::Committed,
        }
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self.state, ClaimState::Reserved { .. })
    }

    /// Whether this record has stopped blocking new claims at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, policy: &ClaimPolicy) -> bool {
        match &self.state {
            ClaimState::Committed => elapsed(self.last_claim_at, now) >= policy.cooldown,
            // A stale reservation still carries the claim it replaced.
            ClaimState::Reserved { previous, .. } => {
                elapsed(self.last_claim_at, now) >= policy.reservation_timeout
                    && previous.map_or(true, |prev| elapsed(prev, now) >= policy.cooldown)
            }
        }
    }
}

/// Handle for a reservation created by [`ClaimStore::try_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub identity: Identity,
    pub token: Uuid,
    pub reserved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A committed claim is still cooling down.
    Cooldown { remaining: Duration },
    /// Another request for this identity holds a live reservation that
    /// goes stale after `remaining`.
    InFlight { remaining: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved(Reservation),
    Rejected(Rejection),
}

/// Pluggable persistence of claim records.
///
/// `try_reserve` must be atomic per identity: two concurrent callers never
/// both get `Reserved`.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Short backend name for logs and status output.
    fn backend(&self) -> &'static str;

    async fn get(&self, identity: &Identity) -> StoreResult<Option<ClaimRecord>>;

    async fn try_reserve(&self, identity: &Identity, now: DateTime<Utc>)
        -> StoreResult<ReserveOutcome>;

    /// Record a confirmed transfer. Writes the committed claim even when the
    /// reservation was lost or taken over, since the transfer happened.
    async fn commit(&self, reservation: &Reservation, now: DateTime<Utc>) -> StoreResult<()>;

    /// Drop a reservation after a failed transfer. No-op if the reservation
    /// is no longer the visible record.
    async fn release(&self, reservation: &Reservation) -> StoreResult<()>;

    /// Physically remove expired records. Backends with native expiry
    /// return 0.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> StoreResult<usize> {
        Ok(0)
    }
}

/// Eligibility decision shared by the in-process backends.
///
/// On success returns the committed time the new reservation should
/// remember for release.
pub(crate) fn evaluate(
    existing: Option<&ClaimRecord>,
    now: DateTime<Utc>,
    policy: &ClaimPolicy,
) -> Result<Option<DateTime<Utc>>, Rejection> {
    let Some(record) = existing else {
        return Ok(None);
    };

    match &record.state {
        ClaimState::Committed => {
            let since = elapsed(record.last_claim_at, now);
            if since < policy.cooldown {
                Err(Rejection::Cooldown {
                    remaining: policy.cooldown - since,
                })
            } else {
                Ok(Some(record.last_claim_at))
            }
        }
        ClaimState::Reserved { previous, .. } => {
            let age = elapsed(record.last_claim_at, now);
            if age < policy.reservation_timeout {
                return Err(Rejection::InFlight {
                    remaining: policy.reservation_timeout - age,
                });
            }
            // Abandoned reservation; the remembered claim still counts.
            match previous {
                Some(prev) if elapsed(*prev, now) < policy.cooldown => Err(Rejection::Cooldown {
                    remaining: policy.cooldown - elapsed(*prev, now),
                }),
                _ => Ok(*previous),
            }
        }
    }
}

/// Non-negative time between two instants.
pub(crate) fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Persisted form of a [`ClaimRecord`]: epoch milliseconds plus state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredClaim {
    pub reserved: bool,
    pub at_ms: i64,
    pub token: Option<Uuid>,
    pub previous_ms: Option<i64>,
}

impl StoredClaim {
    pub fn from_record(record: &ClaimRecord) -> Self {
        match &record.state {
            ClaimState::Committed => Self {
                reserved: false,
                at_ms: record.last_claim_at.timestamp_millis(),
                token: None,
                previous_ms: None,
            },
            ClaimState::Reserved { token, previous } => Self {
                reserved: true,
                at_ms: record.last_claim_at.timestamp_millis(),
                token: Some(*token),
                previous_ms: previous.map(|p| p.timestamp_millis()),
            },
        }
    }

    pub fn into_record(self, identity: &Identity) -> StoreResult<ClaimRecord> {
        let corrupt = |reason: &str| StoreError::Corrupt {
            identity: identity.to_string(),
            reason: reason.to_string(),
        };

        let last_claim_at = from_millis(self.at_ms).ok_or_else(|| corrupt("timestamp out of range"))?;
        let state = if self.reserved {
            let token = self.token.ok_or_else(|| corrupt("reservation without token"))?;
            let previous = match self.previous_ms {
                Some(ms) => Some(from_millis(ms).ok_or_else(|| corrupt("previous timestamp out of range"))?),
                None => None,
            };
            ClaimState::Reserved { token, previous }
        } else {
            ClaimState::Committed
        };

        Ok(ClaimRecord {
            identity: identity.clone(),
            last_claim_at,
            state,
        })
    }
}

/// Open the backend selected in the configuration.
pub async fn open_store(config: &StoreConfig, policy: ClaimPolicy) -> StoreResult<Arc<dyn ClaimStore>> {
    let store: Arc<dyn ClaimStore> = match config {
        StoreConfig::Memory => Arc::new(MemoryClaimStore::new(policy)),
        StoreConfig::Sled { path } => Arc::new(SledClaimStore::open(path, policy)?),
        StoreConfig::Redis { url, key_prefix } => {
            Arc::new(RedisClaimStore::connect(url, key_prefix, policy).await?)
        }
        StoreConfig::RestKv {
            url,
            token,
            key_prefix,
        } => Arc::new(RestKvClaimStore::new(url, token, key_prefix, policy)?),
    };

    info!(backend = store.backend(), "Claim store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ClaimPolicy {
        ClaimPolicy::new(Duration::from_secs(12 * 3600), Duration::from_secs(90))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn id() -> Identity {
        Identity::normalize("0x00000000000000000000000000000000000000ab")
    }

    #[test]
    fn test_absent_record_is_eligible() {
        assert_eq!(evaluate(None, at(0), &policy()), Ok(None));
    }

    #[test]
    fn test_committed_record_blocks_until_cooldown() {
        let record = ClaimRecord::committed(id(), at(0));

        assert_eq!(
            evaluate(Some(&record), at(3600), &policy()),
            Err(Rejection::Cooldown {
                remaining: Duration::from_secs(11 * 3600)
            })
        );
        assert_eq!(
            evaluate(Some(&record), at(12 * 3600), &policy()),
            Ok(Some(at(0)))
        );
    }

    #[test]
    fn test_live_reservation_blocks() {
        let record = ClaimRecord {
            identity: id(),
            last_claim_at: at(0),
            state: ClaimState::Reserved {
                token: Uuid::new_v4(),
                previous: None,
            },
        };

        assert_eq!(
            evaluate(Some(&record), at(10), &policy()),
            Err(Rejection::InFlight {
                remaining: Duration::from_secs(80)
            })
        );
        assert_eq!(evaluate(Some(&record), at(90), &policy()), Ok(None));
    }

    #[test]
    fn test_stale_reservation_keeps_previous_claim() {
        let record = ClaimRecord {
            identity: id(),
            last_claim_at: at(13 * 3600),
            state: ClaimState::Reserved {
                token: Uuid::new_v4(),
                previous: Some(at(0)),
            },
        };

        // Previous claim is outside the cooldown, so the takeover is allowed
        // and keeps remembering it.
        assert_eq!(
            evaluate(Some(&record), at(14 * 3600), &policy()),
            Ok(Some(at(0)))
        );
    }

    #[test]
    fn test_stored_claim_round_trip_keeps_millis() {
        let record = ClaimRecord {
            identity: id(),
            last_claim_at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            state: ClaimState::Reserved {
                token: Uuid::new_v4(),
                previous: Some(at(0)),
            },
        };

        let stored = StoredClaim::from_record(&record);
        assert_eq!(stored.at_ms, 1_700_000_000_123);
        assert_eq!(stored.into_record(&id()).unwrap(), record);
    }

    #[test]
    fn test_expiry_is_logical() {
        let record = ClaimRecord::committed(id(), at(0));
        assert!(!record.is_expired(at(3600), &policy()));
        assert!(record.is_expired(at(12 * 3600), &policy()));

        let reserved = ClaimRecord {
            identity: id(),
            last_claim_at: at(0),
            state: ClaimState::Reserved {
                token: Uuid::new_v4(),
                previous: None,
            },
        };
        assert!(!reserved.is_expired(at(30), &policy()));
        assert!(reserved.is_expired(at(90), &policy()));
    }
}
