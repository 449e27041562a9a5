//! Bounded exponential backoff around fallible cluster operations.
//!
//! The wait before the next attempt is `factor * 2^(attempt + 1)` seconds,
//! with no jitter. A policy can restrict retries to an allow-set of error
//! kinds and can name kinds that always propagate immediately.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::constants::{DEFAULT_RETRY_COUNT, DEFAULT_RETRY_FACTOR};
use crate::error::{CbError, CbResult, ErrorKind};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Base factor in seconds
    pub factor: f64,
    /// When set, only these kinds are retried
    pub allow: Option<Vec<ErrorKind>>,
    /// Kinds propagated on first occurrence regardless of `allow`
    pub always_raise: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_COUNT, DEFAULT_RETRY_FACTOR)
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, factor: f64) -> Self {
        Self {
            retries,
            factor,
            allow: None,
            always_raise: Vec::new(),
        }
    }

    pub fn allow(mut self, kinds: &[ErrorKind]) -> Self {
        self.allow = Some(kinds.to_vec());
        self
    }

    pub fn always_raise(mut self, kinds: &[ErrorKind]) -> Self {
        self.always_raise = kinds.to_vec();
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.saturating_add(1).min(62) as i32);
        Duration::from_secs_f64((self.factor * exp).max(0.0))
    }

    pub fn should_retry(&self, err: &CbError) -> bool {
        let kind = err.kind();
        if self.always_raise.contains(&kind) {
            return false;
        }
        match &self.allow {
            Some(allowed) => allowed.contains(&kind),
            None => true,
        }
    }

    /// Sum of every wait the policy can impose.
    pub fn total_budget(&self) -> Duration {
        (0..self.retries).map(|a| self.delay_for(a)).sum()
    }
}

/// Run `op` until it succeeds, the policy refuses the failure, or attempts
/// are exhausted. The last failure is returned unchanged.
pub async fn retry_with_backoff<T, F, Fut>(label: &str, policy: &RetryPolicy, mut op: F) -> CbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CbResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", label, attempt);
                }
                return Ok(v);
            }
            Err(e) => {
                if attempt >= policy.retries || !policy.should_retry(&e) {
                    if attempt > 0 {
                        warn!("{} failed after {} retries: {}", label, attempt, e);
                    }
                    return Err(e);
                }
                let wait = policy.delay_for(attempt);
                debug!("{} attempt {} failed ({}), retrying in {:?}", label, attempt + 1, e, wait);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_progression() {
        let p = RetryPolicy::new(10, 0.01);
        assert_eq!(p.delay_for(0), Duration::from_secs_f64(0.02));
        assert_eq!(p.delay_for(1), Duration::from_secs_f64(0.04));
        assert_eq!(p.delay_for(3), Duration::from_secs_f64(0.16));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, 0.001);
        let c = calls.clone();
        let out = retry_with_backoff("flaky", &policy, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CbError::Transient("busy".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, 0.001);
        let c = calls.clone();
        let err = retry_with_backoff("down", &policy, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CbError::NodeUnreachable(format!("attempt {}", n)))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("attempt 2"));
    }

    #[tokio::test]
    async fn test_allow_set_filters() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, 0.001).allow(&[ErrorKind::Transient]);
        let c = calls.clone();
        let err = retry_with_backoff("schema", &policy, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CbError::SchemaConfig("bad".into()))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaConfig);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_always_raise_wins_over_allow() {
        let policy = RetryPolicy::new(5, 0.001)
            .allow(&[ErrorKind::IndexExists])
            .always_raise(&[ErrorKind::IndexExists]);
        assert!(!policy.should_retry(&CbError::IndexExists("ix".into())));
        assert!(RetryPolicy::new(1, 0.1).should_retry(&CbError::QueryEmpty));
    }
}
