//! HTTP boundary: every request the browser sends through the proxy lands here.

use axum::body::{to_bytes, Body};
use axum::extract::{Request as AxumRequest, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Router;
use std::sync::Arc;
use tracing::warn;

use crate::cache::{CacheResult, CacheRouter, CacheStorage, SqliteStorage};
use crate::http::{Request, Response};
use crate::network::{HttpNetwork, Network};

pub type SharedRouter = Arc<CacheRouter<SqliteStorage, HttpNetwork>>;

/// Header telling the browser where a response came from
const SOURCE_HEADER: &str = "x-cache";

/// When a response served from cache was stored
const CACHED_AT_HEADER: &str = "x-cached-at";

/// State shared by every request at the boundary.
struct Proxy<S: CacheStorage, N: Network> {
  cache: Arc<CacheRouter<S, N>>,
  max_body_bytes: usize,
}

/// Every path, every method, goes through `intercept`.
pub fn router<S: CacheStorage + 'static, N: Network>(
  cache: Arc<CacheRouter<S, N>>,
  max_body_bytes: usize,
) -> Router {
  let proxy = Arc::new(Proxy {
    cache,
    max_body_bytes,
  });
  Router::new().fallback(intercept::<S, N>).with_state(proxy)
}

async fn intercept<S: CacheStorage + 'static, N: Network>(
  State(proxy): State<Arc<Proxy<S, N>>>,
  req: AxumRequest,
) -> AxumResponse {
  let router = &proxy.cache;
  let (parts, body) = req.into_parts();

  let path_and_query = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");

  let url = match router.resolve(path_and_query) {
    Ok(url) => url,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  let body = match to_bytes(body, proxy.max_body_bytes).await {
    Ok(bytes) => bytes.to_vec(),
    Err(e) => {
      return (
        StatusCode::PAYLOAD_TOO_LARGE,
        format!("Failed to read request body: {}", e),
      )
        .into_response()
    }
  };

  let request = Request {
    method: parts.method,
    url,
    headers: parts.headers,
    body,
  };
  let target = request.url.clone();

  match router.handle(request).await {
    Ok(result) => into_axum(result),
    Err(e) => {
      warn!(url = %target, "request failed: {:#}", e);
      (StatusCode::BAD_GATEWAY, format!("{:#}", e)).into_response()
    }
  }
}

fn into_axum(result: CacheResult) -> AxumResponse {
  let Response {
    status,
    headers,
    body,
  } = result.response;

  let mut response = AxumResponse::new(Body::from(body));
  *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);

  let out = response.headers_mut();
  for (name, value) in headers {
    if is_hop_by_hop(&name) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(&value),
    ) {
      out.append(name, value);
    }
  }
  out.insert(
    HeaderName::from_static(SOURCE_HEADER),
    HeaderValue::from_static(result.source.as_str()),
  );
  if let Some(cached_at) = result.cached_at {
    if let Ok(value) = HeaderValue::from_str(&cached_at.to_rfc3339()) {
      out.insert(HeaderName::from_static(CACHED_AT_HEADER), value);
    }
  }

  response
}

/// Headers describing the backend connection rather than the payload.
fn is_hop_by_hop(name: &str) -> bool {
  ["connection", "content-length", "transfer-encoding", "keep-alive"]
    .iter()
    .any(|h| name.eq_ignore_ascii_case(h))
}
