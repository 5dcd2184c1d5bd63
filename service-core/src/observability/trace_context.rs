//! Outbound trace propagation.
//!
//! Requests built through [`TracedClientExt`] carry the current span's W3C
//! `traceparent` (and `tracestate`, when set), so a slow upstream call shows
//! up under the span that issued it.

use opentelemetry::trace::{SpanContext, TraceContextExt};
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

/// `version-trace_id-span_id-flags`, version fixed at `00`.
fn traceparent(span_context: &SpanContext) -> String {
    format!(
        "00-{}-{}-{:02x}",
        span_context.trace_id(),
        span_context.span_id(),
        span_context.trace_flags().to_u8()
    )
}

fn headers_for(span_context: &SpanContext) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if !span_context.is_valid() {
        return headers;
    }

    if let Ok(value) = HeaderValue::from_str(&traceparent(span_context)) {
        headers.insert(TRACEPARENT_HEADER, value);
    }
    let state = span_context.trace_state().header();
    if !state.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&state) {
            headers.insert(TRACESTATE_HEADER, value);
        }
    }
    headers
}

/// Propagation headers for the current span; empty outside a traced span.
pub fn trace_headers() -> HeaderMap {
    let context = Span::current().context();
    headers_for(context.span().span_context())
}

/// Request builder that attaches propagation headers at send time.
pub struct TracedRequest {
    request: reqwest::RequestBuilder,
}

impl TracedRequest {
    pub fn bearer_auth<T: std::fmt::Display>(self, token: T) -> Self {
        Self {
            request: self.request.bearer_auth(token),
        }
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        Self {
            request: self.request.timeout(timeout),
        }
    }

    pub async fn send(self) -> Result<reqwest::Response, reqwest::Error> {
        self.request.headers(trace_headers()).send().await
    }
}

pub trait TracedClientExt {
    fn traced_get(&self, url: &str) -> TracedRequest;
}

impl TracedClientExt for reqwest::Client {
    fn traced_get(&self, url: &str) -> TracedRequest {
        TracedRequest {
            request: self.get(url),
        }
    }
}
