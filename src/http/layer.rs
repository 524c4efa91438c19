//! Tower middleware placing the admission controller in front of a service.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use tower::{Layer, Service};

use crate::admission::{
    AdmissionController, AdmissionStatus, Clock, Decision, KeyExtractor, KeySource, SystemClock,
};

const RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Applies [`AdmissionService`] to an inner service.
///
/// Every request is checked before the inner service sees it; rejected
/// requests are answered with `429 Too Many Requests` and never forwarded.
pub struct AdmissionLayer<K: KeyExtractor = KeySource, C: Clock = SystemClock> {
    controller: Arc<AdmissionController<K>>,
    clock: Arc<C>,
}

impl<K: KeyExtractor> AdmissionLayer<K, SystemClock> {
    /// Create a layer reading the wall clock.
    pub fn new(controller: Arc<AdmissionController<K>>) -> Self {
        Self::with_clock(controller, SystemClock)
    }
}

impl<K: KeyExtractor, C: Clock> AdmissionLayer<K, C> {
    /// Create a layer with an explicit time source.
    pub fn with_clock(controller: Arc<AdmissionController<K>>, clock: C) -> Self {
        Self {
            controller,
            clock: Arc::new(clock),
        }
    }
}

impl<K: KeyExtractor, C: Clock> Clone for AdmissionLayer<K, C> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S, K: KeyExtractor, C: Clock> Layer<S> for AdmissionLayer<K, C> {
    type Service = AdmissionService<S, K, C>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            controller: Arc::clone(&self.controller),
            clock: Arc::clone(&self.clock),
        }
    }
}

/// Service produced by [`AdmissionLayer`].
pub struct AdmissionService<S, K: KeyExtractor = KeySource, C: Clock = SystemClock> {
    inner: S,
    controller: Arc<AdmissionController<K>>,
    clock: Arc<C>,
}

impl<S: Clone, K: KeyExtractor, C: Clock> Clone for AdmissionService<S, K, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            controller: Arc::clone(&self.controller),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S, B, K, C> Service<Request<B>> for AdmissionService<S, K, C>
where
    S: Service<Request<B>, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: 'static,
    B: Send + 'static,
    K: KeyExtractor,
    C: Clock,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let status = self.controller.check(&request, self.clock.now());
        let emit_headers = self.controller.settings().emit_headers;

        if status.decision == Decision::Rejected {
            let response = rejection(&status, emit_headers);
            return Box::pin(async move { Ok(response) });
        }

        let future = self.inner.call(request);
        Box::pin(async move {
            let mut response = future.await?;
            if emit_headers {
                insert_quota_headers(response.headers_mut(), &status);
            }
            Ok(response)
        })
    }
}

/// The response sent instead of forwarding an over-limit request.
fn rejection(status: &AdmissionStatus, emit_headers: bool) -> Response {
    let body = Json(serde_json::json!({ "message": "Rate limit exceeded" }));
    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();

    let millis = status.reset_after.as_millis() as u64;
    let retry_after = millis.div_ceil(1000).max(1);
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    if emit_headers {
        insert_quota_headers(headers, status);
    }

    response
}

fn insert_quota_headers(headers: &mut HeaderMap, status: &AdmissionStatus) {
    headers.insert(HeaderName::from_static(RATELIMIT_LIMIT), HeaderValue::from(status.limit));
    headers.insert(
        HeaderName::from_static(RATELIMIT_REMAINING),
        HeaderValue::from(status.remaining),
    );
}
