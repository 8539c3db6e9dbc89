//! Circuit breaker registry and middleware.
//!
//! Breakers are created lazily, one per key, and shared by every call with
//! that key for the lifetime of the middleware. The default key is
//! `"<name>_<operation>"`, where `name` defaults to the side
//! (`server` / `client`); without a transport the key is just `<name>`.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{Handler, Middleware};
use crate::resilience::circuit_breaker::{BreakerSettings, CircuitBreaker, CircuitState};
use crate::transport::Side;

pub type KeyFn = Arc<dyn Fn(&Context) -> String + Send + Sync>;

/// Concurrent map from key to breaker.
pub struct BreakerRegistry {
    settings: Arc<BreakerSettings>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("breakers", &self.breakers.len())
            .finish()
    }
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `key`, created on first use. Concurrent first uses of the
    /// same key observe the same breaker.
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, Arc::clone(&self.settings))));
        Arc::clone(entry.value())
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|b| Arc::clone(b.value()))
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshot of every breaker's state, sorted by key.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

/// Builds circuit breaker middleware for one side of a call.
pub struct CircuitBreakerLayer<Req, Resp> {
    side: Side,
    disabled: bool,
    prefix: String,
    registry: Arc<BreakerRegistry>,
    fallback: Option<Handler<Req, Resp>>,
    key_fn: Option<KeyFn>,
}

impl<Req, Resp> CircuitBreakerLayer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(side: Side, settings: BreakerSettings) -> Self {
        let prefix = settings
            .name()
            .filter(|name| !name.is_empty())
            .unwrap_or(side.as_str())
            .to_string();
        Self {
            side,
            disabled: settings.is_disabled(),
            prefix,
            registry: Arc::new(BreakerRegistry::new(settings)),
            fallback: None,
            key_fn: None,
        }
    }

    pub fn server(settings: BreakerSettings) -> Self {
        Self::new(Side::Server, settings)
    }

    pub fn client(settings: BreakerSettings) -> Self {
        Self::new(Side::Client, settings)
    }

    /// Handler invoked with the original request when admission is refused.
    /// Without one, the rejection error is returned.
    pub fn with_fallback(mut self, fallback: Handler<Req, Resp>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Override how calls are mapped to breakers.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Context) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Registry backing the middleware, for inspection.
    pub fn registry(&self) -> Arc<BreakerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn build(self) -> Middleware<Req, Resp> {
        if self.disabled {
            return Middleware::identity();
        }
        let side = self.side;
        let prefix = self.prefix;
        let key_fn: KeyFn = match self.key_fn {
            Some(key_fn) => key_fn,
            None => Arc::new(move |ctx: &Context| match ctx.transport(side) {
                Some(tr) => format!("{}_{}", prefix, tr.operation()),
                None => prefix.clone(),
            }),
        };
        let registry = self.registry;
        let fallback = self.fallback;

        Middleware::new(move |next: Handler<Req, Resp>| {
            let registry = Arc::clone(&registry);
            let key_fn = Arc::clone(&key_fn);
            let fallback = fallback.clone();
            Handler::new(move |ctx: Context, req: Req| {
                let next = next.clone();
                let fallback = fallback.clone();
                let breaker = registry.get_or_create(&key_fn(&ctx));
                async move {
                    match breaker.allow() {
                        Ok(ticket) => {
                            let result = next.call(ctx, req).await;
                            ticket.record(&result);
                            result
                        }
                        Err(err) => {
                            tracing::warn!(side = %side, breaker = %breaker.name(), error = %err, "Circuit breaker rejected call");
                            match fallback {
                                Some(fallback) => fallback.call(ctx, req).await,
                                None => Err(err),
                            }
                        }
                    }
                }
            })
        })
    }
}

/// Circuit breaker middleware for inbound calls, with default key and no fallback.
pub fn server<Req, Resp>(settings: BreakerSettings) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    CircuitBreakerLayer::server(settings).build()
}

/// Circuit breaker middleware for outbound calls, with default key and no fallback.
pub fn client<Req, Resp>(settings: BreakerSettings) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    CircuitBreakerLayer::client(settings).build()
}
