// src/ratelimit.rs
//
// Cooperative token bucket plus hard daily quota, shared across workers
// through the transactional store. One lease step is one transaction:
// refill, daily reset, and the grant decrement all commit together, so
// concurrent callers cannot double-spend a token.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Days, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{LimiterStore, StoreError};

/// Minimum sleep handed back to a waiting caller.
const MIN_WAIT: StdDuration = StdDuration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterState {
    pub tokens: f64,
    pub last_refill_at: DateTime<Utc>,
    pub daily_remaining: i64,
    pub daily_reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeaseParams {
    /// Sustained requests per second; fractional (>= 0.1) supported.
    pub tps: f64,
    pub burst: f64,
    pub daily_max: i64,
}

impl LeaseParams {
    pub fn from_cfg(cfg: &crate::config::LimiterCfg) -> Self {
        Self {
            tps: cfg.tps,
            burst: cfg.burst,
            daily_max: cfg.daily_max,
        }
    }

    fn fill_interval(&self) -> StdDuration {
        let tps = self.tps.max(0.1);
        StdDuration::from_millis((1000.0 / tps).round() as u64)
    }
}

/// Outcome of one transactional lease step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LeaseStep {
    Granted,
    /// No token yet; sleep this long and retry.
    Wait(StdDuration),
    /// Daily quota spent; effectively fatal for the current run.
    Exhausted { retry_at: DateTime<Utc> },
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("daily quota exhausted until {retry_at}")]
    DailyQuotaExhausted { retry_at: DateTime<Utc> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Days::new(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc()
}

pub struct RateLimiter<S> {
    store: std::sync::Arc<S>,
}

impl<S: LimiterStore> RateLimiter<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }

    /// One lease attempt at `now`. Pure with respect to wall-clock: the
    /// caller supplies the instant, which keeps the arithmetic testable.
    pub async fn try_lease(
        &self,
        key: &str,
        params: LeaseParams,
        now: DateTime<Utc>,
    ) -> Result<LeaseStep, LeaseError> {
        let init = LimiterState {
            tokens: params.burst,
            last_refill_at: now,
            daily_remaining: params.daily_max,
            daily_reset_at: next_utc_midnight(now),
        };
        let fill_interval = params.fill_interval();

        let step = self
            .store
            .with_limiter(key, init, &mut |state: &mut LimiterState| {
                // Refill: whole intervals elapsed since the last refill.
                let elapsed = (now - state.last_refill_at)
                    .to_std()
                    .unwrap_or(StdDuration::ZERO);
                let intervals = (elapsed.as_millis() / fill_interval.as_millis().max(1)) as f64;
                if intervals >= 1.0 {
                    let refilled = (state.tokens + intervals).min(params.burst);
                    // only advance the refill clock when tokens actually grew
                    if refilled > state.tokens {
                        state.tokens = refilled;
                        state.last_refill_at = now;
                    }
                }

                // Idempotent daily reset at the fixed boundary.
                if now >= state.daily_reset_at {
                    state.daily_remaining = params.daily_max;
                    state.daily_reset_at = next_utc_midnight(now);
                }

                if state.daily_remaining <= 0 {
                    return LeaseStep::Exhausted {
                        retry_at: state.daily_reset_at,
                    };
                }

                if state.tokens < 1.0 {
                    let rem_ms = (elapsed.as_millis() % fill_interval.as_millis().max(1)) as u64;
                    let wait = fill_interval
                        .saturating_sub(StdDuration::from_millis(rem_ms))
                        .max(MIN_WAIT);
                    return LeaseStep::Wait(wait);
                }

                state.tokens -= 1.0;
                state.daily_remaining -= 1;
                LeaseStep::Granted
            })
            .await?;

        match step {
            LeaseStep::Granted => counter!("limiter_leases_granted_total").increment(1),
            LeaseStep::Exhausted { .. } => {
                counter!("limiter_quota_exhausted_total").increment(1)
            }
            LeaseStep::Wait(_) => {}
        }
        Ok(step)
    }

    /// Block until a lease is granted or the daily quota is spent.
    pub async fn lease(&self, key: &str, params: LeaseParams) -> Result<(), LeaseError> {
        loop {
            match self.try_lease(key, params, Utc::now()).await? {
                LeaseStep::Granted => return Ok(()),
                LeaseStep::Wait(wait) => {
                    tracing::trace!(key = %key, wait_ms = wait.as_millis() as u64, "lease wait");
                    tokio::time::sleep(wait).await;
                }
                LeaseStep::Exhausted { retry_at } => {
                    return Err(LeaseError::DailyQuotaExhausted { retry_at });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use chrono::Duration;
    use std::sync::Arc;

    fn limiter() -> RateLimiter<MemStore> {
        RateLimiter::new(Arc::new(MemStore::new()))
    }

    fn params(tps: f64, burst: f64, daily: i64) -> LeaseParams {
        LeaseParams {
            tps,
            burst,
            daily_max: daily,
        }
    }

    #[tokio::test]
    async fn burst_then_wait() {
        let rl = limiter();
        let p = params(1.0, 3.0, 100);
        let now = Utc::now();

        for _ in 0..3 {
            assert_eq!(rl.try_lease("k", p, now).await.unwrap(), LeaseStep::Granted);
        }
        match rl.try_lease("k", p, now).await.unwrap() {
            LeaseStep::Wait(w) => assert!(w >= MIN_WAIT && w <= p.fill_interval()),
            other => panic!("expected wait, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refill_is_floored_and_capped() {
        let rl = limiter();
        let p = params(2.0, 5.0, 100);
        let t0 = Utc::now();
        for _ in 0..5 {
            assert_eq!(rl.try_lease("k", p, t0).await.unwrap(), LeaseStep::Granted);
        }
        // 1.4s at 2 tps = 2 whole intervals -> 2 tokens back
        let t1 = t0 + Duration::milliseconds(1400);
        assert_eq!(rl.try_lease("k", p, t1).await.unwrap(), LeaseStep::Granted);
        assert_eq!(rl.try_lease("k", p, t1).await.unwrap(), LeaseStep::Granted);
        assert!(matches!(
            rl.try_lease("k", p, t1).await.unwrap(),
            LeaseStep::Wait(_)
        ));
        // a long idle period never exceeds the burst cap
        let t2 = t1 + Duration::hours(1);
        let state = rl.store.read_limiter("k").await.unwrap().unwrap();
        assert!(state.tokens <= p.burst);
        for _ in 0..5 {
            assert_eq!(rl.try_lease("k", p, t2).await.unwrap(), LeaseStep::Granted);
        }
        assert!(matches!(
            rl.try_lease("k", p, t2).await.unwrap(),
            LeaseStep::Wait(_)
        ));
    }

    #[tokio::test]
    async fn fractional_tps_supported() {
        let rl = limiter();
        // one request every 10 seconds
        let p = params(0.1, 1.0, 100);
        let t0 = Utc::now();
        assert_eq!(rl.try_lease("k", p, t0).await.unwrap(), LeaseStep::Granted);
        match rl.try_lease("k", p, t0 + Duration::seconds(4)).await.unwrap() {
            LeaseStep::Wait(w) => assert_eq!(w, StdDuration::from_secs(6)),
            other => panic!("expected wait, got {other:?}"),
        }
        assert_eq!(
            rl.try_lease("k", p, t0 + Duration::seconds(10)).await.unwrap(),
            LeaseStep::Granted
        );
    }

    #[tokio::test]
    async fn daily_quota_blocks_until_reset() {
        let rl = limiter();
        let p = params(100.0, 100.0, 2);
        let t0 = Utc::now();
        assert_eq!(rl.try_lease("k", p, t0).await.unwrap(), LeaseStep::Granted);
        assert_eq!(rl.try_lease("k", p, t0).await.unwrap(), LeaseStep::Granted);
        let exhausted = rl.try_lease("k", p, t0).await.unwrap();
        let retry_at = match exhausted {
            LeaseStep::Exhausted { retry_at } => retry_at,
            other => panic!("expected exhausted, got {other:?}"),
        };
        assert!(retry_at > t0);

        // after the boundary the counter resets idempotently
        let after = retry_at + Duration::seconds(1);
        assert_eq!(rl.try_lease("k", p, after).await.unwrap(), LeaseStep::Granted);
        let state = rl.store.read_limiter("k").await.unwrap().unwrap();
        assert_eq!(state.daily_remaining, 1);
        assert!(state.daily_reset_at > after);
    }

    #[tokio::test]
    async fn tokens_never_negative_and_daily_cap_holds() {
        let rl = limiter();
        let p = params(1.0, 2.0, 5);
        let mut now = Utc::now();
        let mut granted = 0;
        for _ in 0..50 {
            match rl.try_lease("k", p, now).await.unwrap() {
                LeaseStep::Granted => granted += 1,
                LeaseStep::Wait(w) => now += Duration::from_std(w).unwrap(),
                LeaseStep::Exhausted { .. } => break,
            }
            let state = rl.store.read_limiter("k").await.unwrap().unwrap();
            assert!(state.tokens >= 0.0 && state.tokens <= p.burst);
        }
        assert_eq!(granted, 5);
    }
}
