use airouter::compat::{anthropic_error, anthropic_event_stream, internal_to_anthropic, AnthropicRequest};
use airouter::providers::anthropic::AnthropicProvider;
use airouter::providers::google::GoogleProvider;
use airouter::providers::openai::OpenAiProvider;
use airouter::Router as AiRouter;
use airouter::{
    Capability, ExecuteOutcome, Provider, ProviderError, ResponseBody, RouterError, RouterResult,
    SseStream, StateStore,
};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::TryStreamExt;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::config::Config;

const SERVICE_NAME: &str = "airouter-proxy";

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    router: Arc<AiRouter>,
    api_key_digest: [u8; 32],
}

/// Which error wire shape a route speaks.
#[derive(Clone, Copy)]
enum ErrorShape {
    OpenAi,
    Anthropic,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub async fn run_server(config: Config, host: &str, port: u16) -> anyhow::Result<()> {
    let mut builder = AiRouter::builder().with_config(config.router_config());

    if let Some(key) = &config.openai_api_key {
        builder = builder.with_provider(Arc::new(OpenAiProvider::new(key)) as Arc<dyn Provider>);
    }
    if let Some(key) = &config.anthropic_api_key {
        builder = builder.with_provider(Arc::new(AnthropicProvider::new(key)) as Arc<dyn Provider>);
    }
    if let Some(key) = &config.google_api_key {
        builder = builder.with_provider(Arc::new(GoogleProvider::new(key)) as Arc<dyn Provider>);
    }

    if let Some(url) = &config.redis_url {
        match StateStore::connect(url, "airouter").await {
            Ok(store) => builder = builder.with_store(Arc::new(store)),
            // The proxy keeps serving from in-memory state.
            Err(err) => tracing::warn!(%err, "shared state store unavailable, running standalone"),
        }
    }

    let router = builder.build();
    router.hydrate().await;

    let state = Arc::new(AppState {
        router,
        api_key_digest: Sha256::digest(config.router_api_key.as_bytes()).into(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/providers/status", get(providers_status))
        .route("/v1/queue/{job_id}", get(poll_job))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/images/generations", post(image_generations))
        .route("/v1/embeddings", post(embeddings))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("ai router proxy listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Auth & shared response plumbing
// ---------------------------------------------------------------------------

/// Compare the provided key against the configured one in constant time over
/// SHA-256 digests, so neither length nor prefix leaks through timing.
fn key_matches(state: &AppState, provided: &str) -> bool {
    let digest: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
    let mut diff = 0u8;
    for (a, b) in digest.iter().zip(state.api_key_digest.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

fn require_auth(state: &AppState, headers: &HeaderMap, shape: ErrorShape) -> Result<(), Response> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()));

    match provided {
        Some(key) if key_matches(state, key) => Ok(()),
        _ => Err(error_response(
            shape,
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            None,
            "invalid or missing router API key",
        )),
    }
}

/// Echo a well-formed inbound request id, otherwise mint a fresh one.
/// Anything that does not parse as a UUID is replaced, not forwarded.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn routed_headers(result: &RouterResult, request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-ai-router-provider"),
        HeaderValue::from_static(result.vendor.as_str()),
    );
    if let Ok(value) = HeaderValue::from_str(&result.vendor_model) {
        headers.insert(HeaderName::from_static("x-ai-router-model"), value);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }
    headers
}

fn error_response(
    shape: ErrorShape,
    status: StatusCode,
    error_type: &str,
    code: Option<&str>,
    message: &str,
) -> Response {
    let body = match shape {
        ErrorShape::OpenAi => json!({
            "error": {"message": message, "type": error_type, "code": code}
        }),
        ErrorShape::Anthropic => anthropic_error(error_type, message),
    };
    (status, Json(body)).into_response()
}

fn status_from(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Map a router failure onto the route's error shape per the taxonomy:
/// client 4xx pass through, exhaustion/queue problems become 503/408, and
/// cancellation is 499.
fn router_error_response(shape: ErrorShape, err: RouterError) -> Response {
    match err {
        RouterError::NoRoute(model) => error_response(
            shape,
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            Some("model_not_found"),
            &format!("no provider can serve model {}", model),
        ),
        RouterError::Provider(ProviderError::Http { status, body, .. }) => {
            let error_type = if status == 401 || status == 403 {
                "authentication_error"
            } else {
                "invalid_request_error"
            };
            error_response(shape, status_from(status), error_type, Some("upstream_error"), &body)
        }
        RouterError::Provider(err) => error_response(
            shape,
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            None,
            &err.to_string(),
        ),
        RouterError::QueueFull => error_response(
            shape,
            StatusCode::SERVICE_UNAVAILABLE,
            "api_error",
            Some("queue_full"),
            "queue is full",
        ),
        RouterError::Job(job_err) => error_response(
            shape,
            status_from(job_err.status),
            if job_err.status == 408 { "timeout_error" } else { "api_error" },
            Some(&job_err.code),
            &job_err.message,
        ),
        RouterError::Cancelled => error_response(
            shape,
            status_from(499),
            "api_error",
            Some("request_cancelled"),
            "request cancelled",
        ),
    }
}

fn queued_response(job_id: Uuid, estimated_wait_ms: u64, request_id: &str) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }
    (
        StatusCode::ACCEPTED,
        headers,
        Json(json!({
            "id": job_id,
            "object": "queue.job",
            "status": "pending",
            "estimated_wait_ms": estimated_wait_ms,
            "poll_url": format!("/v1/queue/{}", job_id),
        })),
    )
        .into_response()
}

/// Wrap an adapter stream as an SSE response with the framing headers every
/// streaming reply carries.
fn sse_response(stream: SseStream, extra_headers: HeaderMap) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    headers.extend(extra_headers);

    let body = Body::from_stream(
        stream
            .map_ok(axum::body::Bytes::from)
            .map_err(std::io::Error::other),
    );
    (StatusCode::OK, headers, body).into_response()
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------------
// GET /v1/providers/status (no auth)
// ---------------------------------------------------------------------------

async fn providers_status(
    State(state): State<Arc<AppState>>,
) -> Json<airouter::router::StatusSnapshot> {
    Json(state.router.status())
}

// ---------------------------------------------------------------------------
// GET /v1/queue/{job_id}
// ---------------------------------------------------------------------------

async fn poll_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&job_id) else {
        return error_response(
            ErrorShape::OpenAi,
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            Some("not_found"),
            "job not found",
        );
    };

    match state.router.queue().poll(id).await {
        airouter::PollResult::Pending { estimated_wait_ms } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "id": id,
                "object": "queue.job",
                "status": "pending",
                "estimated_wait_ms": estimated_wait_ms,
            })),
        )
            .into_response(),
        airouter::PollResult::Done(body) => (StatusCode::OK, Json(body)).into_response(),
        airouter::PollResult::Error(err) => error_response(
            ErrorShape::OpenAi,
            status_from(err.status),
            "api_error",
            Some(&err.code),
            &err.message,
        ),
        airouter::PollResult::Expired => error_response(
            ErrorShape::OpenAi,
            StatusCode::REQUEST_TIMEOUT,
            "timeout_error",
            Some("queue_timeout"),
            "job expired before a provider became available",
        ),
        airouter::PollResult::NotFound => error_response(
            ErrorShape::OpenAi,
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            Some("not_found"),
            "job not found",
        ),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/chat/completions - OpenAI compatible
// ---------------------------------------------------------------------------

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers, ErrorShape::OpenAi) {
        return resp;
    }

    let model = match body.get("model").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => {
            return error_response(
                ErrorShape::OpenAi,
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                Some("missing_model"),
                "model is required",
            );
        }
    };
    if !body
        .get("messages")
        .and_then(Value::as_array)
        .is_some_and(|m| !m.is_empty())
    {
        return error_response(
            ErrorShape::OpenAi,
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            Some("missing_messages"),
            "messages must be a non-empty list",
        );
    }

    let rid = request_id(&headers);
    dispatch(state, ErrorShape::OpenAi, model, Capability::Chat, body, rid, None).await
}

// ---------------------------------------------------------------------------
// POST /v1/messages - Anthropic compatible
// ---------------------------------------------------------------------------

async fn anthropic_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers, ErrorShape::Anthropic) {
        return resp;
    }

    let request: AnthropicRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(err) => {
            return error_response(
                ErrorShape::Anthropic,
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                None,
                &format!("malformed request: {}", err),
            );
        }
    };
    if request.model.is_empty() {
        return error_response(
            ErrorShape::Anthropic,
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            None,
            "model is required",
        );
    }
    if request.messages.is_empty() {
        return error_response(
            ErrorShape::Anthropic,
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            None,
            "messages must be a non-empty list",
        );
    }

    let rid = request_id(&headers);
    let model = request.model.clone();
    let internal = request.to_internal();
    dispatch(
        state,
        ErrorShape::Anthropic,
        model.clone(),
        Capability::Chat,
        internal,
        rid,
        Some(model),
    )
    .await
}

// ---------------------------------------------------------------------------
// POST /v1/images/generations & /v1/embeddings - OpenAI compatible
// ---------------------------------------------------------------------------

async fn image_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers, ErrorShape::OpenAi) {
        return resp;
    }

    if !body
        .get("prompt")
        .and_then(Value::as_str)
        .is_some_and(|p| !p.is_empty())
    {
        return error_response(
            ErrorShape::OpenAi,
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            Some("missing_prompt"),
            "prompt is required",
        );
    }

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or("dall-e-3")
        .to_string();
    let rid = request_id(&headers);
    dispatch(state, ErrorShape::OpenAi, model, Capability::Images, body, rid, None).await
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers, ErrorShape::OpenAi) {
        return resp;
    }

    if body.get("input").is_none_or(Value::is_null) {
        return error_response(
            ErrorShape::OpenAi,
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            Some("missing_input"),
            "input is required",
        );
    }

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or("text-embedding-3-small")
        .to_string();
    let rid = request_id(&headers);
    dispatch(state, ErrorShape::OpenAi, model, Capability::Embeddings, body, rid, None).await
}

// ---------------------------------------------------------------------------
// Shared dispatch
// ---------------------------------------------------------------------------

/// Run one request through the router and render the outcome in the route's
/// wire shape. `anthropic_model` carries the client-supplied model name for
/// outbound translation on the Anthropic path.
async fn dispatch(
    state: Arc<AppState>,
    shape: ErrorShape,
    model: String,
    capability: Capability,
    body: Value,
    rid: String,
    anthropic_model: Option<String>,
) -> Response {
    let signal = CancellationToken::new();

    match state.router.execute(&model, capability, signal, body).await {
        Ok(ExecuteOutcome::Completed(result)) => {
            let headers = routed_headers(&result, &rid);
            match (result.response.body, &anthropic_model) {
                (ResponseBody::Json(json_body), None) => {
                    (StatusCode::OK, headers, Json(json_body)).into_response()
                }
                (ResponseBody::Json(json_body), Some(client_model)) => {
                    let translated = internal_to_anthropic(&json_body, client_model);
                    (StatusCode::OK, headers, Json(translated)).into_response()
                }
                (ResponseBody::Stream(stream), None) => sse_response(stream, headers),
                (ResponseBody::Stream(stream), Some(client_model)) => {
                    let translated = anthropic_event_stream(stream, client_model.clone());
                    sse_response(translated, headers)
                }
            }
        }
        Ok(ExecuteOutcome::Queued {
            job_id,
            estimated_wait_ms,
        }) => queued_response(job_id, estimated_wait_ms, &rid),
        Err(err) => router_error_response(shape, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_key(key: &str) -> AppState {
        let router = AiRouter::builder().build();
        AppState {
            router,
            api_key_digest: Sha256::digest(key.as_bytes()).into(),
        }
    }

    #[test]
    fn key_comparison_accepts_only_the_exact_key() {
        let state = state_with_key("super-secret");
        assert!(key_matches(&state, "super-secret"));
        assert!(!key_matches(&state, "super-secret "));
        assert!(!key_matches(&state, "super"));
        assert!(!key_matches(&state, ""));
    }

    #[test]
    fn request_id_is_echoed_only_when_it_is_a_uuid() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("a9c1f8d0-18f1-4b9a-bf6a-111213141516"),
        );
        assert_eq!(request_id(&headers), "a9c1f8d0-18f1-4b9a-bf6a-111213141516");

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("not-a-uuid-%0a-injected"),
        );
        let minted = request_id(&headers);
        assert!(Uuid::parse_str(&minted).is_ok());

        let minted = request_id(&HeaderMap::new());
        assert!(Uuid::parse_str(&minted).is_ok());
    }
}
