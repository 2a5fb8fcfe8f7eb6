//! Server-side scripts for the Redis-protocol backends
//!
//! A claim is a hash under `<prefix><identity>`:
//! `state` (`reserved` | `committed`), `at` (epoch ms), and for
//! reservations `token` and `prev` (replaced committed time, or empty).
//! Every write refreshes a PEXPIRE of one cooldown window.

use super::{from_millis, ClaimPolicy, ClaimRecord, ClaimState, Rejection, Reservation, ReserveOutcome};
use crate::error::{StoreError, StoreResult};
use crate::identity::Identity;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// KEYS[1] claim; ARGV: now_ms, cooldown_ms, reservation_timeout_ms, token, ttl_ms.
/// Returns `{1, 0}` reserved, `{0, remaining_ms}` cooling down,
/// `{2, remaining_ms}` in flight.
pub(crate) const RESERVE: &str = r#"
local now = tonumber(ARGV[1])
local cooldown = tonumber(ARGV[2])
local state = redis.call('HGET', KEYS[1], 'state')
local at = redis.call('HGET', KEYS[1], 'at')
local prev = ''
if state == 'committed' then
  local since = now - tonumber(at)
  if since < cooldown then
    return {0, cooldown - since}
  end
  prev = at
elseif state == 'reserved' then
  local age = now - tonumber(at)
  if age < tonumber(ARGV[3]) then
    return {2, tonumber(ARGV[3]) - age}
  end
  prev = redis.call('HGET', KEYS[1], 'prev') or ''
  if prev ~= '' then
    local since = now - tonumber(prev)
    if since < cooldown then
      return {0, cooldown - since}
    end
  end
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'state', 'reserved', 'at', ARGV[1], 'token', ARGV[4], 'prev', prev)
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {1, 0}
"#;

/// KEYS[1] claim; ARGV: now_ms, token, ttl_ms.
/// Always writes the committed claim. Returns 1 if the token still held it.
pub(crate) const COMMIT: &str = r#"
local held = redis.call('HGET', KEYS[1], 'token') == ARGV[2]
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'state', 'committed', 'at', ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
if held then
  return 1
end
return 0
"#;

/// KEYS[1] claim; ARGV: token, ttl_ms.
/// Returns 1 if released, 0 if the reservation was no longer current.
pub(crate) const RELEASE: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'reserved' or redis.call('HGET', KEYS[1], 'token') ~= ARGV[1] then
  return 0
end
local prev = redis.call('HGET', KEYS[1], 'prev')
redis.call('DEL', KEYS[1])
if prev and prev ~= '' then
  redis.call('HSET', KEYS[1], 'state', 'committed', 'at', prev)
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 1
"#;

pub(crate) fn claim_key(prefix: &str, identity: &Identity) -> String {
    format!("{}{}", prefix, identity)
}

/// Translate a RESERVE reply.
pub(crate) fn reserve_outcome(status: i64, remaining_ms: i64, reservation: Reservation) -> ReserveOutcome {
    let remaining = Duration::from_millis(remaining_ms.max(0) as u64);
    match status {
        1 => ReserveOutcome::Reserved(reservation),
        2 => ReserveOutcome::Rejected(Rejection::InFlight { remaining }),
        _ => ReserveOutcome::Rejected(Rejection::Cooldown { remaining }),
    }
}

pub(crate) fn ttl_ms(policy: &ClaimPolicy) -> i64 {
    policy.cooldown_ms().max(policy.reservation_timeout_ms())
}

/// Rebuild a record from HGETALL fields. Empty means absent.
pub(crate) fn record_from_fields(
    identity: &Identity,
    fields: &HashMap<String, String>,
) -> StoreResult<Option<ClaimRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let corrupt = |reason: String| StoreError::Corrupt {
        identity: identity.to_string(),
        reason,
    };
    let millis = |name: &str, raw: &str| {
        raw.parse::<i64>()
            .ok()
            .and_then(from_millis)
            .ok_or_else(|| corrupt(format!("bad {} timestamp {:?}", name, raw)))
    };

    let at = fields
        .get("at")
        .ok_or_else(|| corrupt("missing at".to_string()))?;
    let last_claim_at = millis("at", at)?;

    let state = match fields.get("state").map(String::as_str) {
        Some("committed") => ClaimState::Committed,
        Some("reserved") => {
            let token = fields
                .get("token")
                .and_then(|t| Uuid::parse_str(t).ok())
                .ok_or_else(|| corrupt("missing or bad token".to_string()))?;
            let previous = match fields.get("prev").map(String::as_str) {
                None | Some("") => None,
                Some(raw) => Some(millis("prev", raw)?),
            };
            ClaimState::Reserved { token, previous }
        }
        other => return Err(corrupt(format!("unknown state {:?}", other))),
    };

    Ok(Some(ClaimRecord {
        identity: identity.clone(),
        last_claim_at,
        state,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn id() -> Identity {
        Identity::normalize("0x00000000000000000000000000000000000000ab")
    }

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_committed_fields() {
        let record = record_from_fields(&id(), &fields(&[("state", "committed"), ("at", "1700000000000")]))
            .unwrap()
            .unwrap();
        assert_eq!(record.state, ClaimState::Committed);
        assert_eq!(record.last_claim_at, Utc.timestamp_millis_opt(1_700_000_000_000).unwrap());
    }

    #[test]
    fn test_reserved_fields() {
        let token = Uuid::new_v4();
        let record = record_from_fields(
            &id(),
            &fields(&[
                ("state", "reserved"),
                ("at", "1700000000000"),
                ("token", &token.to_string()),
                ("prev", ""),
            ]),
        )
        .unwrap()
        .unwrap();
        assert_eq!(record.state, ClaimState::Reserved { token, previous: None });
    }

    #[test]
    fn test_empty_and_corrupt_fields() {
        assert!(record_from_fields(&id(), &HashMap::new()).unwrap().is_none());
        assert!(matches!(
            record_from_fields(&id(), &fields(&[("state", "bogus"), ("at", "1")])),
            Err(StoreError::Corrupt { .. })
        ));
        assert!(matches!(
            record_from_fields(&id(), &fields(&[("state", "committed"), ("at", "soon")])),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_reserve_replies() {
        let reservation = Reservation {
            identity: id(),
            token: Uuid::new_v4(),
            reserved_at: Utc::now(),
        };
        assert!(matches!(
            reserve_outcome(1, 0, reservation.clone()),
            ReserveOutcome::Reserved(_)
        ));
        assert_eq!(
            reserve_outcome(2, 30_000, reservation.clone()),
            ReserveOutcome::Rejected(Rejection::InFlight {
                remaining: Duration::from_secs(30)
            })
        );
        assert_eq!(
            reserve_outcome(0, 1500, reservation),
            ReserveOutcome::Rejected(Rejection::Cooldown {
                remaining: Duration::from_millis(1500)
            })
        );
    }
}
