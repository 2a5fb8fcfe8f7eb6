//! Networked claim store on Redis
//!
//! Reserve, commit and release run as Lua scripts, so each is a single
//! atomic step on the server and safe across any number of faucet
//! processes sharing the instance. Keys expire natively after one cooldown.

use super::scripts::{self, claim_key, record_from_fields, reserve_outcome, ttl_ms};
use super::{ClaimPolicy, ClaimRecord, ClaimStore, Reservation, ReserveOutcome};
use crate::error::StoreResult;
use crate::identity::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct RedisClaimStore {
    conn: ConnectionManager,
    key_prefix: String,
    policy: ClaimPolicy,
    reserve: Script,
    commit: Script,
    release: Script,
}

impl RedisClaimStore {
    pub async fn connect(url: &str, key_prefix: &str, policy: ClaimPolicy) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis claim store");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            policy,
            reserve: Script::new(scripts::RESERVE),
            commit: Script::new(scripts::COMMIT),
            release: Script::new(scripts::RELEASE),
        })
    }

    fn key(&self, identity: &Identity) -> String {
        claim_key(&self.key_prefix, identity)
    }
}

#[async_trait]
impl ClaimStore for RedisClaimStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, identity: &Identity) -> StoreResult<Option<ClaimRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.key(identity))
            .query_async(&mut conn)
            .await?;
        record_from_fields(identity, &fields)
    }

    async fn try_reserve(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> StoreResult<ReserveOutcome> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4();

        let (status, remaining_ms): (i64, i64) = self
            .reserve
            .key(self.key(identity))
            .arg(now.timestamp_millis())
            .arg(self.policy.cooldown_ms())
            .arg(self.policy.reservation_timeout_ms())
            .arg(token.to_string())
            .arg(ttl_ms(&self.policy))
            .invoke_async(&mut conn)
            .await?;

        debug!(%identity, status, "Reserve script returned");
        Ok(reserve_outcome(
            status,
            remaining_ms,
            Reservation {
                identity: identity.clone(),
                token,
                reserved_at: now,
            },
        ))
    }

    async fn commit(&self, reservation: &Reservation, now: DateTime<Utc>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let held: i64 = self
            .commit
            .key(self.key(&reservation.identity))
            .arg(now.timestamp_millis())
            .arg(reservation.token.to_string())
            .arg(self.policy.cooldown_ms())
            .invoke_async(&mut conn)
            .await?;

        if held == 0 {
            warn!(identity = %reservation.identity, "Committing claim whose reservation is no longer current");
        }
        Ok(())
    }

    async fn release(&self, reservation: &Reservation) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release
            .key(self.key(&reservation.identity))
            .arg(reservation.token.to_string())
            .arg(self.policy.cooldown_ms())
            .invoke_async(&mut conn)
            .await?;

        if released == 0 {
            debug!(identity = %reservation.identity, "Reservation already gone; nothing to release");
        }
        Ok(())
    }
}
