//! Per-identity token-bucket rate limiter.
//!
//! Each caller identity owns a bucket of `points` that refills continuously
//! over `window`. A consume that finds the bucket empty puts the identity
//! into a block for `block` duration; further consumes during the block fail
//! immediately with the remaining block time.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Points available per window.
    pub points: u64,
    /// Refill window.
    pub window: Duration,
    /// Block duration applied on exhaustion.
    pub block: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            points: 100,
            window: Duration::from_secs(60),
            block: Duration::from_secs(300),
        }
    }
}

/// Outcome of a [`RateLimiter::consume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The cost was deducted; the caller may proceed.
    Allowed,
    /// The caller is blocked; retry after the given duration.
    Blocked {
        /// Time until the block expires.
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    /// Whether the caller may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

/// Internal per-identity state, protected together so refill and consume are
/// atomic with respect to each other.
#[derive(Debug)]
struct Bucket {
    /// Current points scaled by 1000 for sub-point refill precision.
    scaled_points: u64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

/// Token-bucket rate limiter keyed by caller identity.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Create a limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically consume `cost` points for `identity`.
    ///
    /// Refills the identity's bucket for the time elapsed since its last
    /// refill, then either deducts the cost or starts/extends a block.
    pub fn consume(&self, identity: &str, cost: u64) -> RateLimitDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");

        let bucket = buckets.entry(identity.to_string()).or_insert_with(|| Bucket {
            scaled_points: self.config.points * 1000,
            last_refill: now,
            blocked_until: None,
            last_seen: now,
        });
        bucket.last_seen = now;

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return RateLimitDecision::Blocked {
                    retry_after: until - now,
                };
            }
            // Block expired: start over with a full bucket.
            bucket.blocked_until = None;
            bucket.scaled_points = self.config.points * 1000;
            bucket.last_refill = now;
        }

        // Continuous refill: points * elapsed / window, scaled by 1000.
        let elapsed_ms = now.duration_since(bucket.last_refill).as_millis() as u64;
        let window_ms = self.config.window.as_millis().max(1) as u64;
        if elapsed_ms > 0 {
            let refill = elapsed_ms.saturating_mul(self.config.points * 1000) / window_ms;
            bucket.scaled_points =
                (bucket.scaled_points + refill).min(self.config.points * 1000);
            bucket.last_refill = now;
        }

        let scaled_cost = cost.saturating_mul(1000);
        if bucket.scaled_points >= scaled_cost {
            bucket.scaled_points -= scaled_cost;
            RateLimitDecision::Allowed
        } else {
            bucket.blocked_until = Some(now + self.config.block);
            tracing::warn!(identity, "rate limit exhausted, blocking caller");
            RateLimitDecision::Blocked {
                retry_after: self.config.block,
            }
        }
    }

    /// Drop buckets idle for longer than `max_idle`. Returns how many were
    /// removed.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let before = buckets.len();
        buckets.retain(|_, b| {
            now.duration_since(b.last_seen) < max_idle || b.blocked_until.is_some_and(|u| u > now)
        });
        before - buckets.len()
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.buckets.lock().expect("rate limiter lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(points: u64, window_ms: u64, block_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            points,
            window: Duration::from_millis(window_ms),
            block: Duration::from_millis(block_ms),
        })
    }

    #[test]
    fn allows_up_to_points() {
        let rl = limiter(5, 60_000, 60_000);
        for _ in 0..5 {
            assert!(rl.consume("c1", 1).is_allowed());
        }
    }

    #[test]
    fn blocks_after_exhaustion() {
        let rl = limiter(3, 60_000, 60_000);
        for _ in 0..3 {
            assert!(rl.consume("c1", 1).is_allowed());
        }
        let decision = rl.consume("c1", 1);
        let RateLimitDecision::Blocked { retry_after } = decision else {
            panic!("expected block");
        };
        assert!(retry_after <= Duration::from_millis(60_000));
    }

    #[test]
    fn block_rejects_until_it_expires() {
        let rl = limiter(1, 60_000, 50);
        assert!(rl.consume("c1", 1).is_allowed());
        assert!(!rl.consume("c1", 1).is_allowed());
        // Still blocked immediately after
        assert!(!rl.consume("c1", 1).is_allowed());

        std::thread::sleep(Duration::from_millis(60));
        assert!(
            rl.consume("c1", 1).is_allowed(),
            "bucket should be full again after the block expires"
        );
    }

    #[test]
    fn identities_are_independent() {
        let rl = limiter(1, 60_000, 60_000);
        assert!(rl.consume("c1", 1).is_allowed());
        assert!(!rl.consume("c1", 1).is_allowed());
        assert!(rl.consume("c2", 1).is_allowed());
    }

    #[test]
    fn bucket_refills_over_the_window() {
        // 10 points per 100ms window
        let rl = limiter(10, 100, 60_000);
        for _ in 0..10 {
            assert!(rl.consume("c1", 1).is_allowed());
        }
        std::thread::sleep(Duration::from_millis(60));
        // ~6 points refilled by now
        assert!(rl.consume("c1", 1).is_allowed());
    }

    #[test]
    fn multi_point_cost_deducts_at_once() {
        let rl = limiter(10, 60_000, 60_000);
        assert!(rl.consume("c1", 10).is_allowed());
        assert!(!rl.consume("c1", 1).is_allowed());
    }

    #[test]
    fn prune_drops_idle_but_keeps_blocked() {
        let rl = limiter(1, 60_000, 60_000);
        assert!(rl.consume("idle", 1).is_allowed());
        let _ = rl.consume("blocked", 1);
        let _ = rl.consume("blocked", 1); // now blocked
        assert_eq!(rl.tracked_identities(), 2);

        std::thread::sleep(Duration::from_millis(20));
        rl.prune_idle(Duration::from_millis(1));
        // idle is gone, blocked survives its block window
        assert_eq!(rl.tracked_identities(), 1);
    }

    #[test]
    fn concurrent_consumes_never_exceed_points() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let rl = Arc::new(limiter(100, 600_000, 600_000));
        let allowed = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = rl.clone();
                let allowed = allowed.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if rl.consume("shared", 1).is_allowed() {
                            allowed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(allowed.load(Ordering::SeqCst), 100);
    }
}
