use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use beacon_common::clock::Clock;

use super::{Admission, BreakerKey, BreakerSettings, BreakerState, CircuitBreaker};

const KEY_PREFIX: &str = "beacon:breaker";

/// Counter handing out half-open trial tokens, shared by every key.
const TRIAL_SEQ_KEY: &str = "beacon:breaker:trial_seq";

/// Returns `{1, 0}` (allowed), `{2, token}` (trial) or `{0, 0}` (rejected).
const ALLOW_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state or state == 'closed' then
    return {1, 0}
end
local now = tonumber(ARGV[1])
local since = tonumber(redis.call('HGET', KEYS[1], 'since') or '0')
if now - since >= tonumber(ARGV[2]) then
    local token = redis.call('INCR', KEYS[2])
    redis.call('HSET', KEYS[1], 'state', 'half_open', 'since', now, 'trial', token)
    redis.call('PEXPIRE', KEYS[1], ARGV[3])
    return {2, token}
end
return {0, 0}
"#;

/// Returns 1 when this failure opened (or re-opened) the circuit.
/// ARGV[5] is the trial token, 0 for ordinary calls.
const FAILURE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local threshold = tonumber(ARGV[3])
local state = redis.call('HGET', KEYS[1], 'state')
if state == 'open' then
    return 0
end
if state == 'half_open' then
    if tonumber(redis.call('HGET', KEYS[1], 'trial') or '-1') ~= tonumber(ARGV[5]) then
        return 0
    end
    redis.call('HSET', KEYS[1], 'state', 'open', 'since', now, 'failures', 0)
    redis.call('PEXPIRE', KEYS[1], ARGV[4])
    return 1
end
local start = tonumber(redis.call('HGET', KEYS[1], 'window_start') or '0')
local failures = tonumber(redis.call('HGET', KEYS[1], 'failures') or '0')
if now - start > window then
    failures = 0
    start = now
end
failures = failures + 1
if failures >= threshold then
    redis.call('HSET', KEYS[1], 'state', 'open', 'since', now, 'failures', 0, 'window_start', now)
    redis.call('PEXPIRE', KEYS[1], ARGV[4])
    return 1
end
redis.call('HSET', KEYS[1], 'state', 'closed', 'failures', failures, 'window_start', start)
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return 0
"#;

/// Returns 1 when a half-open circuit was closed. ARGV[1] is the trial token.
const SUCCESS_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state == 'open' then
    return 0
end
if state == 'half_open' then
    if tonumber(redis.call('HGET', KEYS[1], 'trial') or '-1') ~= tonumber(ARGV[1]) then
        return 0
    end
    redis.call('DEL', KEYS[1])
    return 1
end
redis.call('DEL', KEYS[1])
return 0
"#;

fn trial_token(admission: Admission) -> u64 {
    match admission {
        Admission::Trial(token) => token,
        Admission::Allowed | Admission::Rejected => 0,
    }
}

/// Breaker state shared through Redis. Every transition runs as one Lua
/// script, so concurrent dispatchers see atomic updates per key.
///
/// Timestamps come from the injected clock, not the Redis server.
#[derive(Clone)]
pub struct RedisBreaker {
    conn: ConnectionManager,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
}

impl RedisBreaker {
    pub fn new(conn: ConnectionManager, settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn,
            settings,
            clock,
        }
    }

    fn redis_key(key: &BreakerKey) -> String {
        format!("{KEY_PREFIX}:{}:{}", key.provider, key.channel)
    }

    /// Idle keys expire once they can no longer influence a decision.
    fn ttl_ms(&self) -> i64 {
        (self.settings.window.num_milliseconds() + self.settings.reset_timeout.num_milliseconds())
            .max(1_000)
            * 2
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

#[async_trait]
impl CircuitBreaker for RedisBreaker {
    async fn allow_call(&self, key: &BreakerKey) -> anyhow::Result<Admission> {
        let mut conn = self.conn.clone();
        let (result, token): (i64, u64) = redis::Script::new(ALLOW_SCRIPT)
            .key(Self::redis_key(key))
            .key(TRIAL_SEQ_KEY)
            .arg(self.now_ms())
            .arg(self.settings.reset_timeout.num_milliseconds())
            .arg(self.ttl_ms())
            .invoke_async(&mut conn)
            .await?;

        Ok(match result {
            1 => Admission::Allowed,
            2 => {
                tracing::info!(breaker = %key, "Circuit half-open, allowing trial call");
                Admission::Trial(token)
            }
            _ => Admission::Rejected,
        })
    }

    async fn record_success(&self, key: &BreakerKey, admission: Admission) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let closed: i64 = redis::Script::new(SUCCESS_SCRIPT)
            .key(Self::redis_key(key))
            .arg(trial_token(admission))
            .invoke_async(&mut conn)
            .await?;
        if closed == 1 {
            tracing::info!(breaker = %key, "Trial call succeeded, circuit closed");
        }
        Ok(())
    }

    async fn record_failure(&self, key: &BreakerKey, admission: Admission) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let opened: i64 = redis::Script::new(FAILURE_SCRIPT)
            .key(Self::redis_key(key))
            .arg(self.now_ms())
            .arg(self.settings.window.num_milliseconds())
            .arg(self.settings.failure_threshold)
            .arg(self.ttl_ms())
            .arg(trial_token(admission))
            .invoke_async(&mut conn)
            .await?;
        if opened == 1 {
            tracing::warn!(breaker = %key, "Circuit opened");
        }
        Ok(())
    }

    async fn state(&self, key: &BreakerKey) -> anyhow::Result<BreakerState> {
        let mut conn = self.conn.clone();
        let state: Option<String> = redis::cmd("HGET")
            .arg(Self::redis_key(key))
            .arg("state")
            .query_async(&mut conn)
            .await?;
        Ok(match state.as_deref() {
            Some("open") => BreakerState::Open,
            Some("half_open") => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        })
    }
}
