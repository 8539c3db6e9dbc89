//! Token bucket rate limiting middleware.
//!
//! One bucket is created per middleware construction and shared by every
//! call through the wrapped handler. Tokens refill lazily on each access at
//! `rate` tokens per second, up to `capacity`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{Handler, Middleware};
use crate::observability::metrics;
use crate::transport::Side;

pub const DEFAULT_CAPACITY: u64 = 100;
pub const DEFAULT_RATE: f64 = 100.0;

const MIN_WAIT_STEP: Duration = Duration::from_millis(1);
const MAX_WAIT_STEP: Duration = Duration::from_secs(1);

/// A token bucket with lazy refill.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// A full bucket holding `capacity` tokens, refilled at `rate` tokens per second.
    pub fn new(capacity: u64, rate: f64) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::config("rate limit capacity must be positive"));
        }
        if !(rate.is_finite() && rate > 0.0) {
            return Err(Error::config("rate limit rate must be a positive number"));
        }
        Ok(Self::full(capacity as f64, rate))
    }

    fn full(capacity: f64, rate: f64) -> Self {
        Self {
            capacity,
            rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Take `n` tokens if they are available right now.
    pub fn try_acquire(&self, n: u64) -> bool {
        self.acquire_or_delay(n).is_ok()
    }

    /// Take `n` tokens, waiting for the refill when the bucket is short.
    ///
    /// Returns `RateLimitExceeded` immediately when `n` exceeds the capacity,
    /// and the context error when `ctx` finishes first.
    pub async fn wait(&self, ctx: &Context, n: u64) -> Result<(), Error> {
        if n as f64 > self.capacity {
            return Err(Error::RateLimitExceeded);
        }
        loop {
            match self.acquire_or_delay(n) {
                Ok(()) => return Ok(()),
                Err(delay) => ctx.run(tokio::time::sleep(delay)).await?,
            }
        }
    }

    /// Either takes the tokens or reports how long until they will be there.
    fn acquire_or_delay(&self, n: u64) -> Result<(), Duration> {
        let wanted = n as f64;
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= wanted {
            state.tokens -= wanted;
            return Ok(());
        }
        let missing = wanted - state.tokens;
        // Never hand back a zero delay, the loop would spin. Long waits are
        // taken in steps so tiny rates cannot overflow a `Duration`.
        let delay = Duration::try_from_secs_f64(missing / self.rate).unwrap_or(MAX_WAIT_STEP);
        Err(delay.clamp(MIN_WAIT_STEP, MAX_WAIT_STEP))
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_update = now;
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    disabled: bool,
    capacity: u64,
    rate: f64,
    wait_if_full: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            capacity: DEFAULT_CAPACITY,
            rate: DEFAULT_RATE,
            wait_if_full: false,
        }
    }
}

impl RateLimitSettings {
    pub fn builder() -> RateLimitSettingsBuilder {
        RateLimitSettingsBuilder::default()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn wait_if_full(&self) -> bool {
        self.wait_if_full
    }
}

#[derive(Debug, Default)]
pub struct RateLimitSettingsBuilder {
    settings: RateLimitSettings,
}

impl RateLimitSettingsBuilder {
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.settings.disabled = disabled;
        self
    }

    pub fn capacity(mut self, capacity: u64) -> Self {
        self.settings.capacity = capacity;
        self
    }

    /// Refill rate in tokens per second.
    pub fn rate(mut self, rate: f64) -> Self {
        self.settings.rate = rate;
        self
    }

    /// Block until a token is available instead of rejecting.
    pub fn wait_if_full(mut self, wait: bool) -> Self {
        self.settings.wait_if_full = wait;
        self
    }

    pub fn build(self) -> Result<RateLimitSettings, Error> {
        // Same checks as the bucket itself.
        TokenBucket::new(self.settings.capacity, self.settings.rate)?;
        Ok(self.settings)
    }
}

/// Rate limit middleware for inbound calls.
pub fn server<Req, Resp>(settings: RateLimitSettings) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    rate_limit(Side::Server, settings)
}

/// Rate limit middleware for outbound calls.
pub fn client<Req, Resp>(settings: RateLimitSettings) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    rate_limit(Side::Client, settings)
}

fn rate_limit<Req, Resp>(side: Side, settings: RateLimitSettings) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    if settings.disabled {
        return Middleware::identity();
    }
    let bucket = Arc::new(TokenBucket::full(settings.capacity as f64, settings.rate));
    let wait = settings.wait_if_full;

    Middleware::new(move |next: Handler<Req, Resp>| {
        let bucket = Arc::clone(&bucket);
        Handler::new(move |ctx: Context, req: Req| {
            let next = next.clone();
            let bucket = Arc::clone(&bucket);
            async move {
                let admitted = if wait {
                    bucket.wait(&ctx, 1).await
                } else if bucket.try_acquire(1) {
                    Ok(())
                } else {
                    Err(Error::RateLimitExceeded)
                };
                if let Err(err) = admitted {
                    let operation = ctx
                        .transport(side)
                        .map(|tr| tr.operation().to_string())
                        .unwrap_or_default();
                    if matches!(err, Error::RateLimitExceeded) {
                        tracing::warn!(side = %side, operation = %operation, "Rate limit exceeded");
                        metrics::record_rate_limited(side, &operation);
                    } else {
                        tracing::debug!(side = %side, operation = %operation, error = %err, "Rate limit wait abandoned");
                    }
                    return Err(err);
                }
                next.call(ctx, req).await
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(calls: Arc<AtomicU32>) -> Handler<(), ()> {
        Handler::new(move |_ctx, _req| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(10, 5.0).unwrap();
        assert!(bucket.try_acquire(10));
        assert!(!bucket.try_acquire(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!((bucket.available() - 5.0).abs() < 1e-6);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((bucket.available() - 10.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn request_above_capacity_is_rejected_at_once() {
        let bucket = TokenBucket::new(2, 1.0).unwrap();
        assert!(!bucket.try_acquire(3));
        assert!(matches!(
            bucket.wait(&Context::new(), 3).await,
            Err(Error::RateLimitExceeded)
        ));
        assert!((bucket.available() - 2.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_refill() {
        let bucket = TokenBucket::new(1, 10.0).unwrap();
        assert!(bucket.try_acquire(1));

        let started = Instant::now();
        bucket.wait(&Context::new(), 1).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(100), "waited {waited:?}");
        assert!(waited < Duration::from_millis(150), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_honours_context_deadline() {
        let bucket = TokenBucket::new(1, 0.1).unwrap();
        assert!(bucket.try_acquire(1));
        let ctx = Context::new().with_timeout(Duration::from_millis(50));
        assert!(matches!(
            bucket.wait(&ctx, 1).await,
            Err(Error::DeadlineExceeded)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_rate_still_honours_context() {
        let bucket = TokenBucket::new(1, 1e-20).unwrap();
        assert!(bucket.try_acquire(1));
        let ctx = Context::new().with_timeout(Duration::from_millis(10));
        assert!(matches!(
            bucket.wait(&ctx, 1).await,
            Err(Error::DeadlineExceeded)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn long_waits_are_taken_in_steps() {
        let bucket = TokenBucket::new(1, 0.25).unwrap();
        assert!(bucket.try_acquire(1));

        let started = Instant::now();
        bucket.wait(&Context::new(), 1).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(4), "waited {waited:?}");
        assert!(waited < Duration::from_millis(4100), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_mode_returns_context_error_when_abandoned() {
        let calls = Arc::new(AtomicU32::new(0));
        let settings = RateLimitSettings::builder()
            .capacity(1)
            .rate(0.001)
            .wait_if_full(true)
            .build()
            .unwrap();
        let h = server(settings).wrap(counting(Arc::clone(&calls)));
        h.call(Context::new(), ()).await.unwrap();

        let ctx = Context::new();
        ctx.token().cancel();
        assert!(matches!(h.call(ctx, ()).await, Err(Error::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn middleware_rejects_when_empty() {
        let calls = Arc::new(AtomicU32::new(0));
        let settings = RateLimitSettings::builder().capacity(2).rate(1.0).build().unwrap();
        let h = server(settings).wrap(counting(Arc::clone(&calls)));

        assert!(h.call(Context::new(), ()).await.is_ok());
        assert!(h.call(Context::new(), ()).await.is_ok());
        assert!(matches!(
            h.call(Context::new(), ()).await,
            Err(Error::RateLimitExceeded)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(h.call(Context::new(), ()).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_ten_then_refill() {
        let calls = Arc::new(AtomicU32::new(0));
        let settings = RateLimitSettings::builder().capacity(10).rate(10.0).build().unwrap();
        let h = client(settings).wrap(counting(Arc::clone(&calls)));

        for _ in 0..10 {
            h.call(Context::new(), ()).await.unwrap();
        }
        assert!(matches!(
            h.call(Context::new(), ()).await,
            Err(Error::RateLimitExceeded)
        ));

        tokio::time::advance(Duration::from_secs(1)).await;
        h.call(Context::new(), ()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_mode_waits_instead_of_rejecting() {
        let calls = Arc::new(AtomicU32::new(0));
        let settings = RateLimitSettings::builder()
            .capacity(1)
            .rate(20.0)
            .wait_if_full(true)
            .build()
            .unwrap();
        let h = client(settings).wrap(counting(Arc::clone(&calls)));

        for _ in 0..3 {
            h.call(Context::new(), ()).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn disabled_is_identity() {
        let calls = Arc::new(AtomicU32::new(0));
        let settings = RateLimitSettings::builder()
            .capacity(1)
            .disabled(true)
            .build()
            .unwrap();
        let h = server(settings).wrap(counting(Arc::clone(&calls)));
        for _ in 0..5 {
            h.call(Context::new(), ()).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(RateLimitSettings::builder().capacity(0).build().is_err());
        assert!(RateLimitSettings::builder().rate(0.0).build().is_err());
        assert!(RateLimitSettings::builder().rate(f64::NAN).build().is_err());
    }
}
