//! Keyed token-bucket rate limiting.
//!
//! Buckets refill lazily on access, so idle keys cost nothing but memory.
//! A periodic purge drops buckets that have refilled completely, which are
//! indistinguishable from fresh ones.
//!
//! Accounting is floating point; drift over long bucket lifetimes is
//! accepted.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics;

/// Token bucket for one key.
#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    rate: f64,
    per: f64,
    allowance: f64,
    last_check: Instant,
}

impl TokenBucket {
    fn new(rate: f64, per: f64, now: Instant) -> Self {
        Self {
            rate,
            per,
            allowance: rate,
            last_check: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        // Clock readings from other threads may lag; never go backwards.
        if now > self.last_check {
            let elapsed = now.duration_since(self.last_check).as_secs_f64();
            self.allowance = (self.allowance + elapsed * (self.rate / self.per)).min(self.rate);
            self.last_check = now;
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.allowance >= 1.0 {
            self.allowance -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_saturated(&self) -> bool {
        self.allowance >= self.rate
    }
}

/// Pool of token buckets keyed by an arbitrary string.
pub struct TokenBucketPool {
    name: String,
    rate: f64,
    per: Duration,
    buckets: DashMap<String, TokenBucket>,
}

impl TokenBucketPool {
    /// Create a pool admitting `rate` events per `per` window and key.
    pub fn new(name: impl Into<String>, rate: f64, per: Duration) -> Self {
        Self {
            name: name.into(),
            rate: rate.max(1.0),
            per: if per.is_zero() {
                Duration::from_secs(1)
            } else {
                per
            },
            buckets: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn per(&self) -> Duration {
        self.per
    }

    /// Admit or reject one event for `key`.
    pub fn consume(&self, key: &str) -> bool {
        self.consume_at(key, Instant::now())
    }

    /// [`consume`](Self::consume) against an explicit clock reading.
    pub fn consume_at(&self, key: &str, now: Instant) -> bool {
        let (rate, per) = (self.rate, self.per.as_secs_f64());
        let admitted = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(rate, per, now))
            .try_consume(now);
        if !admitted {
            debug!(limiter = %self.name, key, "Rate limit exceeded");
            metrics::record_rate_limited(&self.name);
        }
        admitted
    }

    /// Current allowance of a key, if it has a bucket.
    pub fn allowance(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|b| b.allowance)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every bucket that has refilled completely.
    pub fn purge(&self) -> usize {
        self.purge_at(Instant::now())
    }

    /// [`purge`](Self::purge) against an explicit clock reading.
    ///
    /// Eligibility is decided under the same shard lock `consume` takes, so
    /// a concurrent consume either lands before the check (the bucket is no
    /// longer saturated and stays) or after the removal (it starts a fresh,
    /// full bucket).
    pub fn purge_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            bucket.refill(now);
            if bucket.is_saturated() {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(limiter = %self.name, removed, remaining = self.buckets.len(), "Purged idle buckets");
        }
        removed
    }

    /// Run [`purge`](Self::purge) every `interval` until cancelled.
    pub fn spawn_purge_task(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            info!(limiter = %self.name, interval_secs = interval.as_secs(), "Bucket purge task started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.purge();
                    }
                }
            }
            debug!(limiter = %self.name, "Bucket purge task stopped");
        })
    }
}

impl fmt::Debug for TokenBucketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketPool")
            .field("name", &self.name)
            .field("rate", &self.rate)
            .field("per", &self.per)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}
