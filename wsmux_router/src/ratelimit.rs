//! The rate-limiter backend seam plus an in-process token-bucket
//! backend and the middleware that consumes it.
//!
//! Horizontal coordination between processes is the backend's
//! business, not the router's.

use {
    crate::{
        context::{Context, EmitOptions},
        error::BoxError,
        router::{Flow, Middleware, MiddlewareFuture},
    },
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        sync::Arc,
        time::{Duration, Instant},
    },
    wsmux_rpc::error::ErrorCode,
};

/// Outcome of one `consume` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,

    /// Tokens left after the call.
    pub remaining: u64,

    /// When denied, how long until the call could succeed. `None`
    /// means the cost exceeds capacity and can never succeed under the
    /// policy.
    pub retry_after: Option<Duration>,
}

/// The rate-limiter backend contract. Policy validation happens at
/// backend construction, not here.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    async fn consume(&self, key: &str, cost: u64) -> Result<Decision, BoxError>;
}

/// Token-bucket policy: `capacity` tokens, `refill` added every
/// `interval`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucketPolicy {
    pub capacity: u64,
    pub refill: u64,
    pub interval: Duration,
}

/// Rejected token-bucket policies.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("capacity must be greater than zero")]
    ZeroCapacity,

    #[error("refill must be greater than zero")]
    ZeroRefill,

    #[error("refill interval must be greater than zero")]
    ZeroInterval,
}

struct Bucket {
    tokens: u64,
    refilled_at: Instant,
}

/// In-process token-bucket backend.
pub struct TokenBucket {
    policy: TokenBucketPolicy,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucket {
    pub fn new(policy: TokenBucketPolicy) -> Result<Self, PolicyError> {
        if policy.capacity == 0 {
            return Err(PolicyError::ZeroCapacity);
        }
        if policy.refill == 0 {
            return Err(PolicyError::ZeroRefill);
        }
        if policy.interval.is_zero() {
            return Err(PolicyError::ZeroInterval);
        }

        Ok(Self {
            policy,
            buckets: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait::async_trait]
impl RateLimiter for TokenBucket {
    async fn consume(&self, key: &str, cost: u64) -> Result<Decision, BoxError> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let bucket = buckets.entry(key.to_owned()).or_insert(Bucket {
            tokens: self.policy.capacity,
            refilled_at: now,
        });

        let interval_ms = self.policy.interval.as_millis().max(1) as u64;
        let elapsed_ms = now.duration_since(bucket.refilled_at).as_millis() as u64;
        let intervals = elapsed_ms / interval_ms;

        if intervals > 0 {
            bucket.tokens = bucket
                .tokens
                .saturating_add(intervals.saturating_mul(self.policy.refill))
                .min(self.policy.capacity);
            bucket.refilled_at += self.policy.interval * intervals as u32;
        }

        if cost > self.policy.capacity {
            return Ok(Decision {
                allowed: false,
                remaining: bucket.tokens,
                retry_after: None,
            });
        }

        if bucket.tokens >= cost {
            bucket.tokens -= cost;

            return Ok(Decision {
                allowed: true,
                remaining: bucket.tokens,
                retry_after: None,
            });
        }

        let needed = cost - bucket.tokens;
        let intervals_needed = needed.div_ceil(self.policy.refill);
        let ready_at = bucket.refilled_at + self.policy.interval * intervals_needed as u32;

        Ok(Decision {
            allowed: false,
            remaining: bucket.tokens,
            retry_after: Some(ready_at.saturating_duration_since(now)),
        })
    }
}

/// Middleware enforcing a rate limit per key. Denials emit
/// `RESOURCE_EXHAUSTED` with a `retryAfterMs` detail (`null` when the
/// cost exceeds capacity) and halt the chain; backend failures surface
/// as `INTERNAL`.
pub fn rate_limit<K>(limiter: Arc<dyn RateLimiter>, key: K, cost: u64) -> Middleware
where
    K: Fn(&Context) -> String + Send + Sync + 'static,
{
    let key = Arc::new(key);

    Arc::new(move |ctx: Context| -> MiddlewareFuture {
        let limiter = limiter.clone();
        let key = key.clone();

        Box::pin(async move {
            let decision = limiter.consume(&key(&ctx), cost).await?;

            if decision.allowed {
                return Ok(Flow::Continue);
            }

            let details = serde_json::json!({
                "retryAfterMs": decision.retry_after.map(|d| d.as_millis() as u64),
            });

            ctx.error(
                ErrorCode::ResourceExhausted,
                "Rate limit exceeded",
                Some(details),
                EmitOptions::default(),
            )
            .await
            .ok();

            Ok(Flow::Halt)
        })
    })
}
