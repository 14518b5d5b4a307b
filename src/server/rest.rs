//! REST adapter: one HTTP endpoint per core operation.
//!
//! Handlers decode the request, call the core, and encode the reply; no
//! business logic lives here. Error bodies are `{"error": "..."}` with
//! double quotes normalized to single quotes so the text embeds cleanly
//! in client-side messages.

use crate::core::error::{HtracedError, Result};
use crate::core::span::{Span, SpanId};
use crate::metrics::SinkHandle;
use crate::query::{Query as SpanQuery, QueryExecutor};
use crate::receivers::SharedReceiverList;
use crate::storage::store::DataStore;
use crate::storage::writer::now_ms;
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Header naming the default tracer id for spans that omit one.
pub const TRACER_ID_HEADER: &str = "htrace-trid";

/// Shared state behind every REST handler.
#[derive(Clone)]
pub struct RestState {
    pub store: Arc<DataStore>,
    pub sink: SinkHandle,
    pub executor: Arc<QueryExecutor>,
    pub receivers: Arc<SharedReceiverList>,
    pub query_timeout: Duration,
    pub children_default_limit: usize,
}

/// Static build information for `GET /server/info`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    #[serde(rename = "ReleaseVersion")]
    pub release_version: &'static str,
    #[serde(rename = "GitVersion")]
    pub git_version: &'static str,
}

impl Default for ServerInfo {
    fn default() -> Self {
        ServerInfo {
            release_version: env!("CARGO_PKG_VERSION"),
            git_version: option_env!("HTRACED_GIT_VERSION").unwrap_or("unknown"),
        }
    }
}

/// Replaces double quotes so error text nests inside JSON messages.
pub fn normalize_error_text(text: &str) -> String {
    text.replace('"', "'")
}

/// An error plus the HTTP status it maps to.
struct RestError {
    status: StatusCode,
    message: String,
}

impl RestError {
    fn from_error(err: HtracedError) -> RestError {
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        RestError {
            status,
            message: normalize_error_text(&err.to_string()),
        }
    }
}

impl From<HtracedError> for RestError {
    fn from(err: HtracedError) -> RestError {
        RestError::from_error(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Builds the REST router over the given state.
pub fn create_router(state: RestState) -> Router {
    Router::new()
        .route("/server/info", get(server_info))
        .route("/server/stats", get(server_stats))
        .route("/span/:id", get(find_span))
        .route("/span/:id/children", get(find_children))
        .route("/writeSpans", post(write_spans))
        .route("/query", post(run_query))
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(tower_http::cors::Any)
                        .allow_methods(tower_http::cors::Any)
                        .allow_headers(tower_http::cors::Any),
                ),
        )
        .with_state(state)
}

async fn server_info() -> Json<ServerInfo> {
    Json(ServerInfo::default())
}

async fn server_stats(
    State(state): State<RestState>,
) -> std::result::Result<Response, RestError> {
    // The snapshot round-trips through the sink channel; keep the await
    // point off the async worker.
    let sink = state.sink.clone();
    let stats = tokio::task::spawn_blocking(move || sink.access_totals())
        .await
        .map_err(|_| RestError::from_error(HtracedError::ChannelReceive))??;
    Ok(Json(stats).into_response())
}

fn parse_span_id(raw: &str) -> std::result::Result<SpanId, RestError> {
    SpanId::parse(raw).map_err(RestError::from_error)
}

async fn find_span(
    State(state): State<RestState>,
    Path(id): Path<String>,
) -> std::result::Result<Response, RestError> {
    let id = parse_span_id(&id)?;
    let store = state.store.clone();
    let found = tokio::task::spawn_blocking(move || store.find_span(&id))
        .await
        .map_err(|_| RestError::from_error(HtracedError::storage("Lookup task panicked")))??;
    match found {
        Some(span) => Ok(Json(span).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct ChildrenParams {
    lim: Option<usize>,
}

async fn find_children(
    State(state): State<RestState>,
    Path(id): Path<String>,
    Query(params): Query<ChildrenParams>,
) -> std::result::Result<Response, RestError> {
    let id = parse_span_id(&id)?;
    let limit = params.lim.unwrap_or(state.children_default_limit);
    let store = state.store.clone();
    let children = tokio::task::spawn_blocking(move || store.find_children(&id, limit))
        .await
        .map_err(|_| RestError::from_error(HtracedError::storage("Lookup task panicked")))??;
    Ok(Json(children).into_response())
}

/// Outcome report for a `writeSpans` batch.
#[derive(Debug, Serialize)]
struct WriteSpansResponse {
    #[serde(rename = "Written")]
    written: u64,
    #[serde(rename = "Dropped")]
    dropped: u64,
}

async fn write_spans(
    State(state): State<RestState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: String,
) -> std::result::Result<Response, RestError> {
    let remote_addr = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let default_tracer_id = headers
        .get(TRACER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    // The whole batch must decode before anything is ingested; malformed
    // JSON rejects the request.
    let mut spans: Vec<Span> = Vec::new();
    for parsed in serde_json::Deserializer::from_str(&body).into_iter::<Span>() {
        let span = parsed.map_err(|e| {
            RestError::from_error(HtracedError::bad_request(format!(
                "Invalid span JSON: {}",
                e
            )))
        })?;
        spans.push(span);
    }

    let store = state.store.clone();
    let receivers = state.receivers.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut ingestor = store.ingestor(&remote_addr, &default_tracer_id);
        let mut written = 0u64;
        let mut dropped = 0u64;
        let mut commits = Vec::new();
        for span in spans {
            let broadcast_copy = span.clone();
            let (done_sender, done_receiver) = tokio::sync::oneshot::channel();
            match ingestor.ingest_with_hook(span, Some(done_sender)) {
                Ok(()) => {
                    commits.push(done_receiver);
                    receivers.broadcast(&broadcast_copy);
                },
                Err(e) => {
                    // Bad spans and queue-full drops never fail the batch.
                    tracing::debug!(error = %e, "Span rejected during writeSpans");
                    dropped += 1;
                },
            }
        }
        // Wait for the batches to commit so a follow-up read sees them.
        for receiver in commits {
            match receiver.blocking_recv() {
                Ok(Ok(())) => written += 1,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(HtracedError::ChannelReceive),
            }
        }
        ingestor.close(now_ms());
        Ok(WriteSpansResponse { written, dropped })
    })
    .await
    .map_err(|_| RestError::from_error(HtracedError::storage("Ingest task panicked")))??;

    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    query: String,
}

async fn run_query(
    State(state): State<RestState>,
    Query(params): Query<QueryParams>,
) -> std::result::Result<Response, RestError> {
    let query = SpanQuery::parse(&params.query)?;
    let result = tokio::time::timeout(state.query_timeout, state.executor.execute(&query))
        .await
        .map_err(|_| {
            RestError::from_error(HtracedError::Timeout {
                timeout_ms: state.query_timeout.as_millis() as u64,
            })
        })??;
    Ok(Json(result.spans).into_response())
}

async fn not_found(uri: Uri) -> RestError {
    RestError {
        status: StatusCode::NOT_FOUND,
        message: normalize_error_text(&format!("No handler found for {}", uri.path())),
    }
}

/// Serves the router on the listener, tagging requests with peer
/// addresses so per-origin accounting works.
pub async fn serve(listener: tokio::net::TcpListener, router: Router) -> Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| HtracedError::network(format!("REST server failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_text_normalization() {
        assert_eq!(
            normalize_error_text(r#"expected "," at line 1"#),
            "expected ',' at line 1"
        );
    }

    #[test]
    fn test_server_info_shape() {
        let value = serde_json::to_value(ServerInfo::default()).unwrap();
        assert!(value.get("ReleaseVersion").is_some());
        assert!(value.get("GitVersion").is_some());
    }
}
