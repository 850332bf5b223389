use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use beacon_common::clock::Clock;

use super::{Admission, BreakerKey, BreakerSettings, BreakerState, CircuitBreaker};

#[derive(Debug, Clone, Copy)]
enum Slot {
    Closed {
        failures: u32,
        window_start: DateTime<Utc>,
    },
    Open {
        since: DateTime<Utc>,
    },
    HalfOpen {
        trial_started: DateTime<Utc>,
        token: u64,
    },
}

/// Process-local breaker. Each key's slot is updated under its map shard lock.
#[derive(Debug)]
pub struct InMemoryBreaker {
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    slots: DashMap<BreakerKey, Slot>,
    next_token: AtomicU64,
}

impl InMemoryBreaker {
    pub fn new(settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            slots: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    fn half_open(&self, now: DateTime<Utc>) -> (Slot, Admission) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        (
            Slot::HalfOpen {
                trial_started: now,
                token,
            },
            Admission::Trial(token),
        )
    }

    fn closed(now: DateTime<Utc>) -> Slot {
        Slot::Closed {
            failures: 0,
            window_start: now,
        }
    }
}

#[async_trait]
impl CircuitBreaker for InMemoryBreaker {
    async fn allow_call(&self, key: &BreakerKey) -> anyhow::Result<Admission> {
        let now = self.clock.now();
        let mut slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Self::closed(now));

        let admission = match *slot {
            Slot::Closed { .. } => Admission::Allowed,
            Slot::Open { since } if now - since >= self.settings.reset_timeout => {
                let (next, admission) = self.half_open(now);
                *slot = next;
                admission
            }
            // A trial that never reported back is replaced after another timeout.
            Slot::HalfOpen { trial_started, .. }
                if now - trial_started >= self.settings.reset_timeout =>
            {
                let (next, admission) = self.half_open(now);
                *slot = next;
                admission
            }
            Slot::Open { .. } | Slot::HalfOpen { .. } => Admission::Rejected,
        };

        if matches!(admission, Admission::Trial(_)) {
            tracing::info!(breaker = %key, "Circuit half-open, allowing trial call");
        }
        Ok(admission)
    }

    async fn record_success(&self, key: &BreakerKey, admission: Admission) -> anyhow::Result<()> {
        let now = self.clock.now();
        let mut slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Self::closed(now));

        match *slot {
            Slot::Closed { .. } => *slot = Self::closed(now),
            Slot::HalfOpen { token, .. } if admission == Admission::Trial(token) => {
                *slot = Self::closed(now);
                tracing::info!(breaker = %key, "Trial call succeeded, circuit closed");
            }
            // Late result from a call admitted before the circuit opened.
            Slot::HalfOpen { .. } | Slot::Open { .. } => {}
        }
        Ok(())
    }

    async fn record_failure(&self, key: &BreakerKey, admission: Admission) -> anyhow::Result<()> {
        let now = self.clock.now();
        let mut slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Self::closed(now));

        match *slot {
            Slot::Closed {
                failures,
                window_start,
            } => {
                let (failures, window_start) = if now - window_start > self.settings.window {
                    (1, now)
                } else {
                    (failures + 1, window_start)
                };
                if failures >= self.settings.failure_threshold {
                    *slot = Slot::Open { since: now };
                    tracing::warn!(breaker = %key, failures, "Circuit opened");
                } else {
                    *slot = Slot::Closed {
                        failures,
                        window_start,
                    };
                }
            }
            Slot::HalfOpen { token, .. } if admission == Admission::Trial(token) => {
                *slot = Slot::Open { since: now };
                tracing::warn!(breaker = %key, "Trial call failed, circuit re-opened");
            }
            Slot::HalfOpen { .. } | Slot::Open { .. } => {}
        }
        Ok(())
    }

    async fn state(&self, key: &BreakerKey) -> anyhow::Result<BreakerState> {
        Ok(match self.slots.get(key).map(|slot| *slot) {
            None | Some(Slot::Closed { .. }) => BreakerState::Closed,
            Some(Slot::Open { .. }) => BreakerState::Open,
            Some(Slot::HalfOpen { .. }) => BreakerState::HalfOpen,
        })
    }
}
