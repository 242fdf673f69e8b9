//! Request instrumentation via `tracing` spans.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::dispatch::{DispatchError, Dispatched, InboundRequest};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps every dispatched request in a `request` span.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records duration and outcome of each request.
///
/// `outcome` is `ok`, the symbolic error code of a failed response
/// (e.g. `METHOD_NOT_FOUND`), or `rejected` when a layer refused the request.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

fn outcome_of(result: &Result<Dispatched, DispatchError>) -> &'static str {
    match result {
        Ok(out) => match &out.response.error {
            None => "ok",
            Some(err) => err.kind().map_or("error", |code| code.as_str()),
        },
        Err(_) => "rejected",
    }
}

impl<S> Service<InboundRequest> for MetricsService<S>
where
    S: Service<InboundRequest, Response = Dispatched, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = Dispatched;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Dispatched, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: InboundRequest) -> Self::Future {
        let span = info_span!(
            "request",
            id = %req.request.id,
            resource = %req.request.params.resource,
            method = %req.request.method,
            session = req.session.map(|s| s.0),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let outcome = outcome_of(&result);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::debug!(duration_ms, outcome, "request complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
