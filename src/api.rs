use std::{convert::Infallible, sync::Arc};

use hyper::{Method, Request, Response, StatusCode, header::HeaderValue};
use serde::Serialize;

use crate::{
    probe,
    proxy::{ProxyBody, boxed_full, boxed_incoming, simple_response},
    replay::{ReplayClient, replay},
    storage::{RequestStore, StoreError},
};

pub struct ApiState<S> {
    pub store: Arc<S>,
    pub client: ReplayClient,
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error: String,
}

/// Routes a query API request. Every route is GET; errors come back as a
/// JSON `{"error": ...}` envelope.
pub async fn api_handler<S, B>(
    req: Request<B>,
    state: Arc<ApiState<S>>,
) -> Result<Response<ProxyBody>, Infallible>
where
    S: RequestStore,
{
    if req.method() != Method::GET {
        return Ok(error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    }

    let path = req.uri().path();
    if path == "/requests" {
        return Ok(list_requests(&state).await);
    }
    if let Some(id) = parse_id(path, "/requests/") {
        return Ok(show_request(&state, id).await);
    }
    if let Some(id) = parse_id(path, "/repeat/") {
        return Ok(repeat_request(&state, id).await);
    }
    if let Some(id) = parse_id(path, "/scan/") {
        return Ok(scan_request(&state, id).await);
    }

    Ok(error_response(StatusCode::NOT_FOUND, "not found"))
}

fn parse_id(path: &str, prefix: &str) -> Option<i64> {
    path.strip_prefix(prefix)?.parse().ok()
}

async fn list_requests<S: RequestStore>(state: &ApiState<S>) -> Response<ProxyBody> {
    match state.store.get_requests().await {
        Ok(requests) => json_response(StatusCode::OK, &requests),
        Err(err) => store_error_response(err),
    }
}

async fn show_request<S: RequestStore>(state: &ApiState<S>, id: i64) -> Response<ProxyBody> {
    match state.store.get_request_by_id(id).await {
        Ok(record) => json_response(StatusCode::OK, &record),
        Err(err) => store_error_response(err),
    }
}

async fn repeat_request<S: RequestStore>(state: &ApiState<S>, id: i64) -> Response<ProxyBody> {
    let record = match state.store.get_request_by_id(id).await {
        Ok(record) => record,
        Err(err) => return store_error_response(err),
    };

    match replay(&state.client, &record).await {
        Ok(upstream) => Response::new(boxed_incoming(upstream.into_body())),
        Err(err) => error_response(StatusCode::BAD_GATEWAY, err.to_string()),
    }
}

async fn scan_request<S: RequestStore>(state: &ApiState<S>, id: i64) -> Response<ProxyBody> {
    let record = match state.store.get_request_by_id(id).await {
        Ok(record) => record,
        Err(err) => return store_error_response(err),
    };

    match probe::scan(&state.client, &record).await {
        Ok(verdict) => simple_response(StatusCode::OK, verdict.message()),
        Err(err) => error_response(StatusCode::BAD_GATEWAY, err.to_string()),
    }
}

fn store_error_response(err: StoreError) -> Response<ProxyBody> {
    let status = match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    json_response(
        status,
        &ApiErrorResponse {
            error: message.into(),
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<ProxyBody> {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(err) => {
            return simple_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("serialize response: {err}"),
            );
        }
    };

    let mut response = Response::new(boxed_full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
