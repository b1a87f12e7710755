//! API - HTTP transport for the record contract
//!
//! TigerStyle: Thin handlers, one error mapping, one span per request.
//!
//! # Routes
//!
//! ```text
//! GET  /health
//! POST /v1/records/{read,create,update,delete,search,query}
//! POST /v1/databases/{create,delete}
//! ```
//!
//! Bodies are the JSON request types from [`crate::service`]. The
//! `x-test-context: true` header marks a test call context. Errors map to
//! `400`/`404`/`503`/`500` with `{"error": {"code", "message"}}`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::Instrument;

use crate::error::ServiceError;
use crate::service::{
    CallContext, CreateRequest, DatabaseRequest, DeleteRequest, EmptyResponse, ReadRequest,
    ReadResponse, RecordApi, RunQueryRequest, SearchRequest, SearchResponse, UpdateRequest,
};
use crate::APP_VERSION;

/// Header marking a test call context
pub const HEADER_TEST_CONTEXT: &str = "x-test-context";

/// Header echoing the per-request id
pub const HEADER_REQUEST_ID: &str = "x-request-id";

/// Shared facade behind every handler.
pub type SharedApi = Arc<dyn RecordApi>;

// =============================================================================
// Router
// =============================================================================

/// Build the HTTP router over a facade.
pub fn router(api: SharedApi) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/records/read", post(read))
        .route("/v1/records/create", post(create))
        .route("/v1/records/update", post(update))
        .route("/v1/records/delete", post(delete))
        .route("/v1/records/search", post(search))
        .route("/v1/records/query", post(run_query))
        .route("/v1/databases/create", post(create_database))
        .route("/v1/databases/delete", post(delete_database))
        .layer(middleware::from_fn(request_span))
        .with_state(api)
}

async fn request_span(req: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    let mut response = next.run(req).instrument(span.clone()).await;
    span.in_scope(|| {
        tracing::debug!(status = response.status().as_u16(), "Request finished");
    });
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(HEADER_REQUEST_ID, value);
    }
    response
}

// =============================================================================
// Errors
// =============================================================================

/// Facade error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

/// HTTP status for a facade error.
#[must_use]
pub fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::NotAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status_for(&self.0), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// Extraction
// =============================================================================

fn call_context(headers: &HeaderMap) -> CallContext {
    let test = headers
        .get(HEADER_TEST_CONTEXT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
    if test {
        CallContext::test()
    } else {
        CallContext::new()
    }
}

/// Decode a JSON body; malformed bodies are bad requests, empty ones default.
fn decode<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError(ServiceError::bad_request(format!("invalid JSON body: {e}"))))
}

fn reply<T: Serialize>(value: T) -> ApiResult<T> {
    Ok(Json(value))
}

// =============================================================================
// Handlers
// =============================================================================

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": APP_VERSION }))
}

async fn read(State(api): State<SharedApi>, headers: HeaderMap, body: Bytes) -> ApiResult<ReadResponse> {
    let req: ReadRequest = decode(&body)?;
    reply(api.read(&call_context(&headers), req).await?)
}

async fn create(
    State(api): State<SharedApi>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<EmptyResponse> {
    let req: CreateRequest = decode(&body)?;
    reply(api.create(&call_context(&headers), req).await?)
}

async fn update(
    State(api): State<SharedApi>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<EmptyResponse> {
    let req: UpdateRequest = decode(&body)?;
    reply(api.update(&call_context(&headers), req).await?)
}

async fn delete(
    State(api): State<SharedApi>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<EmptyResponse> {
    let req: DeleteRequest = decode(&body)?;
    reply(api.delete(&call_context(&headers), req).await?)
}

async fn search(
    State(api): State<SharedApi>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<SearchResponse> {
    let req: SearchRequest = decode(&body)?;
    reply(api.search(&call_context(&headers), req).await?)
}

async fn run_query(
    State(api): State<SharedApi>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<SearchResponse> {
    let req: RunQueryRequest = decode(&body)?;
    reply(api.run_query(&call_context(&headers), req).await?)
}

async fn create_database(
    State(api): State<SharedApi>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<EmptyResponse> {
    let req: DatabaseRequest = decode(&body)?;
    reply(api.create_database(&call_context(&headers), req).await?)
}

async fn delete_database(
    State(api): State<SharedApi>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<EmptyResponse> {
    let req: DatabaseRequest = decode(&body)?;
    reply(api.delete_database(&call_context(&headers), req).await?)
}
