//! Rate limit guard implementation.

use async_trait::async_trait;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::ratelimit::{RateLimiter, Tier};

/// Identity of the caller carried by a request.
pub trait RequestContext {
    /// Logical client identifier (user, API key, ...).
    fn client_id(&self) -> &str;

    /// Cost of the request in tokens.
    fn weight(&self) -> u32 {
        1
    }
}

/// Supplies the caller's tier name for a request.
///
/// `None` means the caller has no tier and gets the free tier.
pub trait TierResolver<R>: Send + Sync {
    fn resolve_tier(&self, request: &R) -> Option<String>;
}

impl<R, F> TierResolver<R> for F
where
    F: Fn(&R) -> Option<String> + Send + Sync,
{
    fn resolve_tier(&self, request: &R) -> Option<String> {
        self(request)
    }
}

/// Supplies the caller's network address for a request.
pub trait AddressExtractor<R>: Send + Sync {
    fn client_addr(&self, request: &R) -> Option<IpAddr>;
}

impl<R, F> AddressExtractor<R> for F
where
    F: Fn(&R) -> Option<IpAddr> + Send + Sync,
{
    fn client_addr(&self, request: &R) -> Option<IpAddr> {
        self(request)
    }
}

/// An async request handler.
#[async_trait]
pub trait Handler<R>: Send + Sync
where
    R: Send + 'static,
{
    type Output: Send;

    async fn handle(&self, request: R) -> Self::Output;
}

/// Adapter turning an async function into a [`Handler`].
#[derive(Debug, Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async function as a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn { f }
}

#[async_trait]
impl<R, F, Fut> Handler<R> for HandlerFn<F>
where
    R: Send + 'static,
    F: Fn(R) -> Fut + Send + Sync,
    Fut: Future + Send + 'static,
    Fut::Output: Send,
{
    type Output = Fut::Output;

    async fn handle(&self, request: R) -> Self::Output {
        (self.f)(request).await
    }
}

/// Checks the rate limiter before delegating to the wrapped handler.
///
/// Denials surface as [`TollgateError::LimitExceeded`](crate::TollgateError::LimitExceeded)
/// carrying the retry hint; the wrapped handler is not invoked.
pub struct RateLimitGuard<H, T, A> {
    limiter: Arc<RateLimiter>,
    handler: H,
    tiers: T,
    addresses: A,
}

impl<H, T, A> RateLimitGuard<H, T, A> {
    /// Create a new guard around `handler`.
    pub fn new(limiter: Arc<RateLimiter>, handler: H, tiers: T, addresses: A) -> Self {
        Self {
            limiter,
            handler,
            tiers,
            addresses,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl<R, H, T, A> Handler<R> for RateLimitGuard<H, T, A>
where
    R: RequestContext + Send + 'static,
    H: Handler<R>,
    T: TierResolver<R>,
    A: AddressExtractor<R>,
{
    type Output = Result<H::Output>;

    #[instrument(skip(self, request), fields(client_id = %request.client_id()))]
    async fn handle(&self, request: R) -> Self::Output {
        let decision = {
            let tier = match self.tiers.resolve_tier(&request) {
                Some(name) => self.limiter.policy().resolve(&name),
                None => Tier::Free,
            };
            let addr = self.addresses.client_addr(&request);
            self.limiter
                .check_rate_limit(request.client_id(), tier, request.weight(), addr)
        };

        if !decision.allowed {
            debug!(retry_after = ?decision.retry_after, "Request rejected by rate limiter");
        }
        decision.into_result()?;

        Ok(self.handler.handle(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TollgateConfig;
    use crate::error::TollgateError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct TestRequest {
        client: String,
        plan: Option<String>,
        addr: Option<IpAddr>,
    }

    impl TestRequest {
        fn new(client: &str) -> Self {
            Self {
                client: client.to_string(),
                plan: None,
                addr: None,
            }
        }
    }

    impl RequestContext for TestRequest {
        fn client_id(&self) -> &str {
            &self.client
        }
    }

    fn plan(request: &TestRequest) -> Option<String> {
        request.plan.clone()
    }

    fn addr(request: &TestRequest) -> Option<IpAddr> {
        request.addr
    }

    fn limiter(burst: u32) -> Arc<RateLimiter> {
        let yaml = format!(
            r#"
tiers:
  free:
    requests_per_minute: 6
    requests_per_hour: 100
    requests_per_day: 1000
    burst_size: {burst}
"#
        );
        Arc::new(RateLimiter::new(TollgateConfig::from_yaml(&yaml).unwrap()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowed_request_reaches_handler() {
        let handler = handler_fn(|req: TestRequest| async move { format!("hello {}", req.client) });
        let guard = RateLimitGuard::new(limiter(2), handler, plan, addr);

        let output = guard.handle(TestRequest::new("alice")).await.unwrap();
        assert_eq!(output, "hello alice");
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_request_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |_req: TestRequest| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let guard = RateLimitGuard::new(limiter(1), handler, plan, addr);

        assert!(guard.handle(TestRequest::new("bob")).await.is_ok());
        let err = guard.handle(TestRequest::new("bob")).await.unwrap_err();
        assert!(matches!(err, TollgateError::LimitExceeded { retry_after: 10 }));
        assert_eq!(err.retry_after(), Some(10));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_ip_is_rejected() {
        let limiter = limiter(5);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        limiter.block_ip(ip, Duration::from_secs(900));

        let handler = handler_fn(|_req: TestRequest| async move {});
        let guard = RateLimitGuard::new(limiter, handler, plan, addr);

        let mut request = TestRequest::new("carol");
        request.addr = Some(ip);
        let err = guard.handle(request).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(300));

        // Same client from another address is fine.
        let mut request = TestRequest::new("carol");
        request.addr = Some("5.6.7.8".parse().unwrap());
        assert!(guard.handle(request).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_resolution() {
        let handler = handler_fn(|_req: TestRequest| async move {});
        let guard = RateLimitGuard::new(limiter(1), handler, plan, addr);

        let mut request = TestRequest::new("dave");
        request.plan = Some("enterprise".to_string());
        for _ in 0..10 {
            let mut req = TestRequest::new("dave");
            req.plan = request.plan.clone();
            assert!(guard.handle(req).await.is_ok());
        }

        // Misspelled tier falls back to the single-token free tier.
        let mut request = TestRequest::new("erin");
        request.plan = Some("enterprize".to_string());
        assert!(guard.handle(request).await.is_ok());
        let mut request = TestRequest::new("erin");
        request.plan = Some("enterprize".to_string());
        assert!(guard.handle(request).await.is_err());
    }
}
