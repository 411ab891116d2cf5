//! Per-client admission control.
//!
//! Two policies are supported: a sliding window that admits at most
//! `max_requests` within any rolling `window`, and a cooldown that rejects a
//! request arriving less than `min_gap` after the client's last admission.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPolicy {
    SlidingWindow { window: Duration, max_requests: usize },
    Cooldown { min_gap: Duration },
}

impl RateLimitPolicy {
    fn horizon(&self) -> TimeDelta {
        let span = match self {
            Self::SlidingWindow { window, .. } => *window,
            Self::Cooldown { min_gap } => *min_gap,
        };
        TimeDelta::from_std(span).unwrap_or_else(|_| TimeDelta::days(365))
    }

    fn capacity(&self) -> usize {
        match self {
            Self::SlidingWindow { max_requests, .. } => *max_requests,
            Self::Cooldown { .. } => 1,
        }
    }
}

type WindowMap = HashMap<String, VecDeque<DateTime<Utc>>>;

pub struct RateLimiter {
    policy: RateLimitPolicy,
    windows: Mutex<WindowMap>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Admits the client and records the admission, or rejects it without
    /// recording anything. Check and record happen under one lock.
    pub async fn admit(&self, client_key: &str) -> Result<(), ServiceError> {
        self.admit_at(client_key, Utc::now()).await
    }

    /// Reports whether `admit` would currently reject the client, without
    /// consuming a slot.
    pub async fn check(&self, client_key: &str) -> Result<(), ServiceError> {
        self.check_at(client_key, Utc::now()).await
    }

    pub(crate) async fn admit_at(
        &self,
        client_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut windows = self.windows.lock().await;
        let entries = windows.entry(client_key.to_string()).or_default();
        prune(entries, now, self.policy.horizon());

        if let Some(retry_after_seconds) = self.retry_after(entries, now) {
            debug!("Rate limit rejected client {client_key}");
            if entries.is_empty() {
                windows.remove(client_key);
            }
            return Err(ServiceError::RateLimited {
                retry_after_seconds,
            });
        }

        entries.push_back(now);
        Ok(())
    }

    pub(crate) async fn check_at(
        &self,
        client_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut windows = self.windows.lock().await;
        let Some(entries) = windows.get_mut(client_key) else {
            return Ok(());
        };
        prune(entries, now, self.policy.horizon());

        let rejection = self.retry_after(entries, now);
        if entries.is_empty() {
            windows.remove(client_key);
        }

        match rejection {
            Some(retry_after_seconds) => Err(ServiceError::RateLimited {
                retry_after_seconds,
            }),
            None => Ok(()),
        }
    }

    /// Drops every client whose admissions have all left the window.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let horizon = self.policy.horizon();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, entries| {
            prune(entries, now, horizon);
            !entries.is_empty()
        });
        before - windows.len()
    }

    pub async fn tracked_clients(&self) -> usize {
        self.windows.lock().await.len()
    }

    fn retry_after(&self, entries: &VecDeque<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u64> {
        if entries.len() < self.policy.capacity() {
            return None;
        }

        let oldest = entries.front().copied().unwrap_or(now);
        let reset_at = oldest + self.policy.horizon();
        let remaining_ms = (reset_at - now).num_milliseconds().max(0);
        Some(u64::try_from((remaining_ms + 999) / 1000).unwrap_or(1).max(1))
    }
}

fn prune(entries: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, horizon: TimeDelta) {
    while let Some(oldest) = entries.front() {
        if now - *oldest >= horizon {
            entries.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sliding(max_requests: usize) -> RateLimiter {
        RateLimiter::new(RateLimitPolicy::SlidingWindow {
            window: Duration::from_secs(60),
            max_requests,
        })
    }

    #[tokio::test]
    async fn eleventh_request_in_window_is_rejected() {
        let limiter = sliding(10);
        let start = Utc::now();

        for offset in 0..10 {
            limiter
                .admit_at("1.2.3.4", start + TimeDelta::seconds(offset))
                .await
                .unwrap();
        }

        let rejected = limiter
            .admit_at("1.2.3.4", start + TimeDelta::seconds(10))
            .await;
        match rejected {
            Err(ServiceError::RateLimited {
                retry_after_seconds,
            }) => assert_eq!(retry_after_seconds, 50),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clients_are_tracked_independently() {
        let limiter = sliding(1);
        let now = Utc::now();

        limiter.admit_at("a", now).await.unwrap();
        limiter.admit_at("b", now).await.unwrap();
        assert!(limiter.admit_at("a", now).await.is_err());
    }

    #[tokio::test]
    async fn window_slides_as_old_admissions_expire() {
        let limiter = sliding(2);
        let start = Utc::now();

        limiter.admit_at("c", start).await.unwrap();
        limiter
            .admit_at("c", start + TimeDelta::seconds(30))
            .await
            .unwrap();
        assert!(
            limiter
                .admit_at("c", start + TimeDelta::seconds(59))
                .await
                .is_err()
        );
        limiter
            .admit_at("c", start + TimeDelta::seconds(60))
            .await
            .unwrap();
        assert!(
            limiter
                .admit_at("c", start + TimeDelta::seconds(61))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn rejection_does_not_consume_a_slot() {
        let limiter = sliding(1);
        let start = Utc::now();

        limiter.admit_at("d", start).await.unwrap();
        for offset in 1..20 {
            let _ = limiter
                .admit_at("d", start + TimeDelta::seconds(offset))
                .await;
        }
        limiter
            .admit_at("d", start + TimeDelta::seconds(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn check_never_records() {
        let limiter = sliding(1);
        let now = Utc::now();

        for _ in 0..5 {
            limiter.check_at("e", now).await.unwrap();
        }
        limiter.admit_at("e", now).await.unwrap();
        assert!(limiter.check_at("e", now).await.is_err());
    }

    #[tokio::test]
    async fn cooldown_enforces_minimum_gap() {
        let limiter = RateLimiter::new(RateLimitPolicy::Cooldown {
            min_gap: Duration::from_secs(5),
        });
        let start = Utc::now();

        limiter.admit_at("f", start).await.unwrap();
        match limiter.admit_at("f", start + TimeDelta::seconds(2)).await {
            Err(ServiceError::RateLimited {
                retry_after_seconds,
            }) => assert_eq!(retry_after_seconds, 3),
            other => panic!("expected cooldown rejection, got {other:?}"),
        }
        limiter
            .admit_at("f", start + TimeDelta::seconds(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_drops_expired_clients() {
        let limiter = sliding(3);
        let start = Utc::now();

        for client in 0..100 {
            limiter.admit_at(&format!("10.0.0.{client}"), start).await.unwrap();
        }
        limiter
            .admit_at("late", start + TimeDelta::seconds(59))
            .await
            .unwrap();
        assert_eq!(limiter.tracked_clients().await, 101);

        let removed = limiter.sweep_at(start + TimeDelta::seconds(61)).await;
        assert_eq!(removed, 100);
        assert_eq!(limiter.tracked_clients().await, 1);
    }

    #[tokio::test]
    async fn concurrent_admissions_never_exceed_capacity() {
        let limiter = std::sync::Arc::new(sliding(10));
        let now = Utc::now();

        let handles = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.admit_at("g", now).await.is_ok() })
            })
            .collect::<Vec<_>>();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
