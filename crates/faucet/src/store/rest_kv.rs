//! Managed key-value service over HTTPS
//!
//! Talks to hosted Redis-compatible services that accept commands as a
//! JSON array POSTed with a bearer token (Upstash / Vercel KV style). The
//! same Lua scripts as [`super::RedisClaimStore`] run through `EVAL`, so
//! atomicity and native expiry are identical.

use super::scripts::{self, claim_key, record_from_fields, reserve_outcome, ttl_ms};
use super::{ClaimPolicy, ClaimRecord, ClaimStore, Reservation, ReserveOutcome};
use crate::error::{StoreError, StoreResult};
use crate::identity::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RestKvClaimStore {
    url: String,
    token: String,
    key_prefix: String,
    policy: ClaimPolicy,
    client: reqwest::Client,
}

impl RestKvClaimStore {
    pub fn new(url: &str, token: &str, key_prefix: &str, policy: ClaimPolicy) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::RestKv(format!("Client setup failed: {}", e)))?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            key_prefix: key_prefix.to_string(),
            policy,
            client,
        })
    }

    async fn command(&self, args: Vec<String>) -> StoreResult<Value> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await
            .map_err(|e| StoreError::RestKv(format!("Request failed: {}", e)))?;

        let status = response.status();
        let json: Value = response
            .json()
            .await
            .map_err(|e| StoreError::RestKv(format!("Invalid response ({}): {}", status, e)))?;

        if let Some(error) = json.get("error") {
            return Err(StoreError::RestKv(error.to_string()));
        }

        Ok(json.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn eval(&self, script: &str, identity: &Identity, args: Vec<String>) -> StoreResult<Value> {
        let mut command = vec![
            "EVAL".to_string(),
            script.to_string(),
            "1".to_string(),
            claim_key(&self.key_prefix, identity),
        ];
        command.extend(args);
        self.command(command).await
    }
}

fn as_int(value: &Value) -> StoreResult<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| StoreError::RestKv(format!("Expected integer, got {}", value)))
}

/// HGETALL replies arrive as a flat `[field, value, ...]` array.
fn fields_from_reply(value: &Value) -> StoreResult<HashMap<String, String>> {
    let items = match value {
        Value::Null => return Ok(HashMap::new()),
        Value::Array(items) => items,
        other => return Err(StoreError::RestKv(format!("Unexpected HGETALL reply: {}", other))),
    };

    let mut fields = HashMap::new();
    for pair in items.chunks(2) {
        if let [Value::String(k), Value::String(v)] = pair {
            fields.insert(k.clone(), v.clone());
        } else {
            return Err(StoreError::RestKv("Malformed HGETALL reply".to_string()));
        }
    }
    Ok(fields)
}

#[async_trait]
impl ClaimStore for RestKvClaimStore {
    fn backend(&self) -> &'static str {
        "rest_kv"
    }

    async fn get(&self, identity: &Identity) -> StoreResult<Option<ClaimRecord>> {
        let reply = self
            .command(vec![
                "HGETALL".to_string(),
                claim_key(&self.key_prefix, identity),
            ])
            .await?;
        record_from_fields(identity, &fields_from_reply(&reply)?)
    }

    async fn try_reserve(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> StoreResult<ReserveOutcome> {
        let token = Uuid::new_v4();
        let reply = self
            .eval(
                scripts::RESERVE,
                identity,
                vec![
                    now.timestamp_millis().to_string(),
                    self.policy.cooldown_ms().to_string(),
                    self.policy.reservation_timeout_ms().to_string(),
                    token.to_string(),
                    ttl_ms(&self.policy).to_string(),
                ],
            )
            .await?;

        let (status, remaining_ms) = match reply.as_array().map(Vec::as_slice) {
            Some([status, remaining]) => (as_int(status)?, as_int(remaining)?),
            _ => return Err(StoreError::RestKv(format!("Unexpected reserve reply: {}", reply))),
        };

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
        let reply = self
            .eval(
                scripts::COMMIT,
                &reservation.identity,
                vec![
                    now.timestamp_millis().to_string(),
                    reservation.token.to_string(),
                    self.policy.cooldown_ms().to_string(),
                ],
            )
            .await?;

        if as_int(&reply)? == 0 {
            warn!(identity = %reservation.identity, "Committing claim whose reservation is no longer current");
        }
        Ok(())
    }

    async fn release(&self, reservation: &Reservation) -> StoreResult<()> {
        let reply = self
            .eval(
                scripts::RELEASE,
                &reservation.identity,
                vec![
                    reservation.token.to_string(),
                    self.policy.cooldown_ms().to_string(),
                ],
            )
            .await?;

        if as_int(&reply)? == 0 {
            debug!(identity = %reservation.identity, "Reservation already gone; nothing to release");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hgetall_reply_parsing() {
        let fields = fields_from_reply(&json!(["state", "committed", "at", "1700000000000"])).unwrap();
        assert_eq!(fields.get("state").map(String::as_str), Some("committed"));
        assert_eq!(fields.len(), 2);

        assert!(fields_from_reply(&json!([])).unwrap().is_empty());
        assert!(fields_from_reply(&Value::Null).unwrap().is_empty());
        assert!(fields_from_reply(&json!(["state"])).is_err());
        assert!(fields_from_reply(&json!("OK")).is_err());
    }

    #[test]
    fn test_integer_replies() {
        assert_eq!(as_int(&json!(1)).unwrap(), 1);
        assert_eq!(as_int(&json!("42")).unwrap(), 42);
        assert!(as_int(&json!(null)).is_err());
    }

    // FAUCET_TEST_REST_KV_URL=https://... FAUCET_TEST_REST_KV_TOKEN=... cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_live_protocol() {
        let url = std::env::var("FAUCET_TEST_REST_KV_URL").unwrap();
        let token = std::env::var("FAUCET_TEST_REST_KV_TOKEN").unwrap();
        let store = RestKvClaimStore::new(
            &url,
            &token,
            &format!("faucet-test:{}:", Uuid::new_v4()),
            ClaimPolicy::new(Duration::from_secs(12 * 3600), Duration::from_secs(90)),
        )
        .unwrap();
        let id = Identity::normalize("0x00000000000000000000000000000000000000ab");

        let reservation = match store.try_reserve(&id, Utc::now()).await.unwrap() {
            ReserveOutcome::Reserved(r) => r,
            other => panic!("expected reservation, got {:?}", other),
        };
        store.commit(&reservation, Utc::now()).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_some());
    }
}
