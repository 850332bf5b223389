//! Per-(provider, channel) circuit breaking.
//!
//! A breaker is **closed** until `failure_threshold` failures land inside the
//! observation window, then **open**: calls are refused without reaching
//! the provider. Once `reset_timeout` has passed, a single trial call is let
//! through (**half-open**). Its success closes the breaker; its failure opens
//! it again with a fresh timeout.
//!
//! State lives either in process ([`InMemoryBreaker`]) or in Redis
//! ([`RedisBreaker`]) so that several dispatcher processes share it.

pub mod memory;
pub mod redis_state;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use beacon_common::config::AppConfig;
use beacon_common::types::Channel;

pub use memory::InMemoryBreaker;
pub use redis_state::RedisBreaker;

/// Breakers are isolated per provider and channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub provider: String,
    pub channel: Channel,
}

impl BreakerKey {
    pub fn new(provider: impl Into<String>, channel: Channel) -> Self {
        Self {
            provider: provider.into(),
            channel,
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Answer to "may I call the provider now?".
///
/// The caller hands it back with the call's outcome, so the breaker can
/// tell the half-open trial apart from calls admitted earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial call, identified by its token.
    Trial(u64),
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub window: chrono::Duration,
    pub reset_timeout: chrono::Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: chrono::Duration::seconds(60),
            reset_timeout: chrono::Duration::seconds(30),
        }
    }
}

impl BreakerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold.max(1),
            window: chrono::Duration::seconds(config.breaker_window_secs as i64),
            reset_timeout: chrono::Duration::seconds(config.breaker_reset_timeout_secs as i64),
        }
    }
}

/// Injectable breaker. Read-modify-write of one key's state is atomic.
///
/// While half-open only the outcome reported with the current trial's
/// [`Admission::Trial`] token moves the breaker; other results are ignored.
///
/// Errors come from the state backend only. Callers treat them as
/// [`Admission::Allowed`] so an unreachable backend never blocks delivery.
#[async_trait]
pub trait CircuitBreaker: Send + Sync {
    async fn allow_call(&self, key: &BreakerKey) -> anyhow::Result<Admission>;

    async fn record_success(&self, key: &BreakerKey, admission: Admission) -> anyhow::Result<()>;

    async fn record_failure(&self, key: &BreakerKey, admission: Admission) -> anyhow::Result<()>;

    async fn state(&self, key: &BreakerKey) -> anyhow::Result<BreakerState>;
}
