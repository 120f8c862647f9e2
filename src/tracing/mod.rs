use axum::http::Request;
use futures::Future;
use std::{cell::RefCell, fmt};
use tower_http::{
    classify::{SharedClassifier, StatusInRangeAsFailures},
    trace::{
        DefaultOnBodyChunk, DefaultOnEos, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse,
        MakeSpan, TraceLayer,
    },
};
use uuid::Uuid;

/// Header carrying the correlation id in both directions.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

const MAX_CORRELATION_ID_LEN: usize = 128;

/// Identifier tying together every log line and error body of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId(String);

impl Default for CorrelationId {
    fn default() -> Self {
        CorrelationId(Uuid::new_v4().to_string())
    }
}

impl CorrelationId {
    pub fn new(value: impl Into<String>) -> Self {
        CorrelationId(value.into())
    }

    /// Accepts a client supplied id only if it is short and made of
    /// header-safe characters; anything else is replaced by a fresh id.
    pub fn from_header(value: &str) -> Self {
        let trimmed = value.trim();
        let acceptable = !trimmed.is_empty()
            && trimmed.len() <= MAX_CORRELATION_ID_LEN
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
        if acceptable {
            CorrelationId(trimmed.to_string())
        } else {
            CorrelationId::default()
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

tokio::task_local! {
    static CURRENT_CORRELATION_ID: RefCell<Option<CorrelationId>>;
}

pub async fn scope_correlation_id<Fut, R>(correlation_id: CorrelationId, future: Fut) -> R
where
    Fut: Future<Output = R>,
{
    CURRENT_CORRELATION_ID
        .scope(RefCell::new(Some(correlation_id)), future)
        .await
}

pub fn current_correlation_id() -> Option<CorrelationId> {
    CURRENT_CORRELATION_ID
        .try_with(|cell| cell.borrow().clone())
        .ok()
        .flatten()
}

#[derive(Clone, Default)]
pub struct RequestSpanMaker;

impl<B> MakeSpan<B> for RequestSpanMaker {
    fn make_span(&mut self, request: &Request<B>) -> tracing::Span {
        let correlation_id = request
            .extensions()
            .get::<CorrelationId>()
            .cloned()
            .or_else(|| {
                request
                    .headers()
                    .get(CORRELATION_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(CorrelationId::from_header)
            })
            .unwrap_or_default();

        tracing::info_span!(
            "http.request",
            correlation_id = %correlation_id,
            method = %request.method(),
            uri = %request.uri(),
        )
    }
}

/// HTTP trace layer; only 5xx responses are classified as failures.
pub fn configure_http_tracing() -> TraceLayer<
    SharedClassifier<StatusInRangeAsFailures>,
    RequestSpanMaker,
    DefaultOnRequest,
    DefaultOnResponse,
    DefaultOnBodyChunk,
    DefaultOnEos,
    DefaultOnFailure,
> {
    let classifier = SharedClassifier::new(StatusInRangeAsFailures::new(500..=599));
    TraceLayer::new(classifier)
        .make_span_with(RequestSpanMaker)
        .on_request(DefaultOnRequest::default())
        .on_response(DefaultOnResponse::default())
        .on_body_chunk(DefaultOnBodyChunk::default())
        .on_eos(DefaultOnEos::default())
        .on_failure(DefaultOnFailure::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_values_are_sanitised() {
        assert_eq!(CorrelationId::from_header(" abc-123 ").as_str(), "abc-123");

        let replaced = CorrelationId::from_header("bad value\nwith newline");
        assert_ne!(replaced.as_str(), "bad value\nwith newline");
        assert!(Uuid::parse_str(replaced.as_str()).is_ok());

        let too_long = "a".repeat(MAX_CORRELATION_ID_LEN + 1);
        assert_ne!(CorrelationId::from_header(&too_long).as_str(), too_long);
    }

    #[tokio::test]
    async fn correlation_id_is_visible_inside_scope_only() {
        assert!(current_correlation_id().is_none());
        let seen = scope_correlation_id(CorrelationId::new("corr-1"), async {
            current_correlation_id()
        })
        .await;
        assert_eq!(seen, Some(CorrelationId::new("corr-1")));
    }
}
