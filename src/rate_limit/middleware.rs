use futures::future::BoxFuture;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

use crate::rate_limit::key::RequestHead;
use crate::rate_limit::limiter::RateLimiter;
use crate::rate_limit::store::{CounterStore, InMemoryCounterStore};
use crate::rate_limit::AdmissionDecision;
use crate::telemetry::{spawn_emit, AdmissionEvent, NullSink, TelemetrySink};

/// Policy maximum per window.
pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
/// Requests left in the current window.
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Window end, ISO-8601 UTC.
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// `error` field of every rejection body.
pub const REJECTION_ERROR: &str = "Rate limit exceeded";

/// A layer that enforces a [`RateLimiter`] on HTTP services.
#[derive(Debug)]
pub struct AdmissionLayer<S = InMemoryCounterStore, Sink = NullSink> {
    limiter: RateLimiter<S>,
    sink: Sink,
}

impl<S, Sink: Clone> Clone for AdmissionLayer<S, Sink> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), sink: self.sink.clone() }
    }
}

impl<S> AdmissionLayer<S, NullSink>
where
    S: CounterStore + 'static,
{
    /// Create a new admission layer with telemetry disabled.
    pub fn new(limiter: RateLimiter<S>) -> Self {
        Self { limiter, sink: NullSink }
    }
}

impl<S, Sink> AdmissionLayer<S, Sink> {
    /// Report every decision to `sink`.
    pub fn with_sink<NewSink>(self, sink: NewSink) -> AdmissionLayer<S, NewSink>
    where
        NewSink: TelemetrySink,
    {
        AdmissionLayer { limiter: self.limiter, sink }
    }

    pub fn limiter(&self) -> &RateLimiter<S> {
        &self.limiter
    }
}

impl<Inner, S, Sink: Clone> Layer<Inner> for AdmissionLayer<S, Sink> {
    type Service = AdmissionService<Inner, S, Sink>;

    fn layer(&self, inner: Inner) -> Self::Service {
        AdmissionService { inner, limiter: self.limiter.clone(), sink: self.sink.clone() }
    }
}

/// Wrap `service` with admission control for `limiter`.
pub fn with_admission_control<S, Inner>(
    limiter: RateLimiter<S>,
    service: Inner,
) -> AdmissionService<Inner, S, NullSink>
where
    S: CounterStore + 'static,
{
    AdmissionLayer::new(limiter).layer(service)
}

/// Middleware service that admits or rejects requests.
///
/// Denials are answered here with `429 Too Many Requests` and never reach the inner service.
/// Limiter failures let the request through without rate headers.
///
/// Every request is counted before the handler runs. When the policy skips an outcome class, the
/// count is handed back once the response shows the request fell into it, so at most `max`
/// requests are ever in flight or counted per window.
#[derive(Debug)]
pub struct AdmissionService<Inner, S = InMemoryCounterStore, Sink = NullSink> {
    inner: Inner,
    limiter: RateLimiter<S>,
    sink: Sink,
}

impl<Inner: Clone, S, Sink: Clone> Clone for AdmissionService<Inner, S, Sink> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), limiter: self.limiter.clone(), sink: self.sink.clone() }
    }
}

impl<Inner, S, Sink> AdmissionService<Inner, S, Sink> {
    pub fn limiter(&self) -> &RateLimiter<S> {
        &self.limiter
    }

    pub fn get_ref(&self) -> &Inner {
        &self.inner
    }
}

impl<Inner, S, Sink, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<Inner, S, Sink>
where
    Inner: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    Inner::Error: Send + 'static,
    S: CounterStore + 'static,
    Sink: TelemetrySink,
    Sink::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = Inner::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = self.limiter.clone();
        let sink = self.sink.clone();
        // `poll_ready` reserved capacity on `self.inner`; that instance must serve this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let caller = limiter.identify(&RequestHead::from(&req));

        Box::pin(async move {
            let policy = limiter.policy();
            let decision = match limiter.try_check(&caller).await {
                Ok(decision) => decision,
                Err(err) => {
                    tracing::error!(
                        target: "turnstile::middleware",
                        policy = %policy.name(),
                        key = %caller.key,
                        error = %err,
                        "rate limiter failed; failing open"
                    );
                    spawn_emit(sink, AdmissionEvent::FailedOpen { policy: policy.name().to_string() });
                    return inner.call(req).await;
                }
            };

            if !decision.allowed {
                spawn_emit(
                    sink,
                    AdmissionEvent::Denied {
                        policy: policy.name().to_string(),
                        limit: decision.limit,
                        retry_after: decision.retry_after.unwrap_or_default(),
                    },
                );
                // A 429 is a failed outcome like any other.
                if !policy.counts_outcome(false) {
                    release(&limiter, &caller.key, decision.reset_at).await;
                }
                return Ok(rejection(&decision, policy.message()));
            }

            spawn_emit(
                sink,
                AdmissionEvent::Allowed {
                    policy: policy.name().to_string(),
                    limit: decision.limit,
                    remaining: decision.remaining,
                },
            );

            let result = inner.call(req).await;

            if policy.defers_counting() {
                let succeeded = matches!(&result, Ok(resp) if resp.status().as_u16() < 400);
                if !policy.counts_outcome(succeeded) {
                    release(&limiter, &caller.key, decision.reset_at).await;
                }
            }

            result.map(|mut resp| {
                apply_rate_headers(resp.headers_mut(), &decision);
                resp
            })
        })
    }
}

async fn release<S: CounterStore + 'static>(limiter: &RateLimiter<S>, key: &str, reset_at: u64) {
    if let Err(err) = limiter.release(key, reset_at).await {
        tracing::error!(
            target: "turnstile::middleware",
            policy = %limiter.policy().name(),
            key = %key,
            error = %err,
            "failed to release uncounted request"
        );
    }
}

/// Set the `X-RateLimit-*` headers for `decision`.
pub fn apply_rate_headers(headers: &mut HeaderMap, decision: &AdmissionDecision) {
    headers.insert(HeaderName::from_static(X_RATELIMIT_LIMIT), HeaderValue::from(decision.limit));
    headers.insert(
        HeaderName::from_static(X_RATELIMIT_REMAINING),
        HeaderValue::from(decision.remaining),
    );
    if let Ok(reset) = HeaderValue::from_str(&decision.reset_iso8601()) {
        headers.insert(HeaderName::from_static(X_RATELIMIT_RESET), reset);
    }
}

/// Build the `429` response for a denied `decision`.
pub fn rejection<B: From<String>>(decision: &AdmissionDecision, message: &str) -> Response<B> {
    let retry_after = decision.retry_after_secs().unwrap_or(1);
    let body = serde_json::json!({
        "error": REJECTION_ERROR,
        "message": message,
        "retryAfter": retry_after,
    })
    .to_string();

    let mut response = Response::new(B::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    apply_rate_headers(headers, decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::policy::Policy;
    use crate::telemetry::MemorySink;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::{service_fn, ServiceExt};

    fn limiter(policy: Policy) -> RateLimiter {
        RateLimiter::new(policy, Arc::new(InMemoryCounterStore::new()))
            .with_clock(ManualClock::new(1_714_564_800_000))
    }

    fn request() -> Request<String> {
        Request::builder()
            .uri("/api/auth/login")
            .header("x-forwarded-for", "203.0.113.5")
            .body(String::new())
            .unwrap()
    }

    #[test]
    fn rejection_body_and_headers() {
        let decision = AdmissionDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: 1_714_565_700_000,
            retry_after: Some(Duration::from_secs(900)),
        };
        let resp: Response<String> = rejection(&decision, "Too many login attempts, please try again later.");

        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(resp.headers()[RETRY_AFTER], "900");
        assert_eq!(resp.headers()[X_RATELIMIT_LIMIT], "5");
        assert_eq!(resp.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(resp.headers()[X_RATELIMIT_RESET], "2024-05-01T12:15:00.000Z");

        let body: serde_json::Value = serde_json::from_str(resp.body()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "error": "Rate limit exceeded",
                "message": "Too many login attempts, please try again later.",
                "retryAfter": 900,
            })
        );
    }

    #[tokio::test]
    async fn allowed_requests_carry_headers() {
        let policy = Policy::builder("api").window(Duration::from_secs(60)).max(3).build().unwrap();
        let svc = with_admission_control(
            limiter(policy),
            service_fn(|_req: Request<String>| async {
                Ok::<_, Infallible>(Response::new(String::from("ok")))
            }),
        );

        let resp = svc.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[X_RATELIMIT_LIMIT], "3");
        assert_eq!(resp.headers()[X_RATELIMIT_REMAINING], "2");
        assert_eq!(resp.headers()[X_RATELIMIT_RESET], "2024-05-01T12:01:00.000Z");
    }

    #[tokio::test]
    async fn denied_requests_skip_the_handler_and_emit_events() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let sink = MemorySink::new();
        let policy = Policy::builder("auth").max(1).message("slow down").build().unwrap();
        let layer = AdmissionLayer::new(limiter(policy)).with_sink(sink.clone());
        let svc = layer.layer(service_fn(move |_req: Request<String>| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Infallible>(Response::new(String::new())) }
        }));

        let first = svc.clone().oneshot(request()).await.unwrap();
        let second = svc.clone().oneshot(request()).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Events are delivered on their own tasks.
        tokio::task::yield_now().await;
        assert_eq!(sink.count("allowed"), 1);
        assert_eq!(sink.count("denied"), 1);
    }

    #[tokio::test]
    async fn skip_successful_counts_only_failures() {
        let policy = Policy::builder("auth").max(2).skip_successful(true).build().unwrap();
        let limiter = limiter(policy);
        let status = Arc::new(std::sync::Mutex::new(StatusCode::OK));
        let handler_status = status.clone();
        let svc = with_admission_control(
            limiter.clone(),
            service_fn(move |_req: Request<String>| {
                let code = *handler_status.lock().unwrap();
                async move {
                    let mut resp = Response::new(String::new());
                    *resp.status_mut() = code;
                    Ok::<_, Infallible>(resp)
                }
            }),
        );

        for _ in 0..5 {
            let resp = svc.clone().oneshot(request()).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        assert!(limiter.store().is_empty(), "successes are never counted");

        *status.lock().unwrap() = StatusCode::UNAUTHORIZED;
        for _ in 0..2 {
            let resp = svc.clone().oneshot(request()).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }
        let resp = svc.clone().oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn skip_failed_ignores_handler_errors() {
        let policy = Policy::builder("email").max(1).skip_failed(true).build().unwrap();
        let limiter = limiter(policy);
        let svc = with_admission_control(
            limiter.clone(),
            service_fn(|_req: Request<String>| async {
                Err::<Response<String>, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
            }),
        );

        for _ in 0..3 {
            assert!(svc.clone().oneshot(request()).await.is_err());
        }
        assert!(limiter.store().is_empty());
    }

    #[tokio::test]
    async fn skip_failed_ignores_error_statuses() {
        let policy = Policy::builder("email").max(1).skip_failed(true).build().unwrap();
        let limiter = limiter(policy);
        let status = Arc::new(std::sync::Mutex::new(StatusCode::INTERNAL_SERVER_ERROR));
        let handler_status = status.clone();
        let svc = with_admission_control(
            limiter.clone(),
            service_fn(move |_req: Request<String>| {
                let code = *handler_status.lock().unwrap();
                async move {
                    let mut resp = Response::new(String::new());
                    *resp.status_mut() = code;
                    Ok::<_, Infallible>(resp)
                }
            }),
        );

        for _ in 0..3 {
            let resp = svc.clone().oneshot(request()).await.unwrap();
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        assert!(limiter.store().is_empty(), "5xx responses are never counted");

        *status.lock().unwrap() = StatusCode::ACCEPTED;
        assert_eq!(svc.clone().oneshot(request()).await.unwrap().status(), StatusCode::ACCEPTED);
        for _ in 0..2 {
            let resp = svc.clone().oneshot(request()).await.unwrap();
            assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        }
        let entry = limiter.store().get("email:203.0.113.5").await.unwrap().unwrap();
        assert_eq!(entry.count, 1, "rejections are failures too and hand their count back");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failures_never_exceed_max() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let policy = Policy::builder("auth").max(2).skip_successful(true).build().unwrap();
        let svc = with_admission_control(
            limiter(policy),
            service_fn(move |_req: Request<String>| {
                seen.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let mut resp = Response::new(String::new());
                    *resp.status_mut() = StatusCode::UNAUTHORIZED;
                    Ok::<_, Infallible>(resp)
                }
            }),
        );

        let attempts: Vec<_> = (0..20)
            .map(|_| tokio::spawn(svc.clone().oneshot(request())))
            .collect();
        let mut rejected = 0;
        for attempt in attempts {
            if attempt.await.unwrap().unwrap().status() == StatusCode::TOO_MANY_REQUESTS {
                rejected += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rejected, 18);
    }

    #[tokio::test]
    async fn ready_inner_service_handles_the_call() {
        let policy = Policy::builder("api").max(10).build().unwrap();
        let mut svc = AdmissionLayer::new(limiter(policy)).layer(tower::limit::ConcurrencyLimit::new(
            service_fn(|_req: Request<String>| async {
                Ok::<_, Infallible>(Response::new(String::from("ok")))
            }),
            1,
        ));

        for remaining in ["9", "8", "7"] {
            let resp = svc.ready().await.unwrap().call(request()).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(resp.headers()[X_RATELIMIT_REMAINING], remaining);
        }
    }

    /// Sink that never becomes ready.
    #[derive(Clone)]
    struct StalledSink;

    impl Service<AdmissionEvent> for StalledSink {
        type Response = ();
        type Error = Infallible;
        type Future = futures::future::Ready<Result<(), Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Pending
        }

        fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
            futures::future::ready(Ok(()))
        }
    }

    impl TelemetrySink for StalledSink {
        type SinkError = Infallible;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_sink_does_not_delay_responses() {
        let policy = Policy::builder("auth").max(1).build().unwrap();
        let svc = AdmissionLayer::new(limiter(policy)).with_sink(StalledSink).layer(service_fn(
            |_req: Request<String>| async { Ok::<_, Infallible>(Response::new(String::new())) },
        ));

        let admitted = tokio::time::timeout(Duration::from_secs(5), svc.clone().oneshot(request()))
            .await
            .expect("allowed request answered without waiting on telemetry");
        assert_eq!(admitted.unwrap().status(), StatusCode::OK);

        let denied = tokio::time::timeout(Duration::from_secs(5), svc.oneshot(request()))
            .await
            .expect("rejection answered without waiting on telemetry");
        assert_eq!(denied.unwrap().status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
