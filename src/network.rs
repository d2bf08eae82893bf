//! Backend access.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::config::BackendConfig;
use crate::http::{Request, Response};

/// Something that can send a request to the backend.
///
/// An `Err` means the backend could not be reached. Any HTTP status, including
/// 4xx and 5xx, is a successful fetch.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &BackendConfig) -> Result<Self> {
    let mut builder = reqwest::Client::builder()
      // Redirects belong to the browser
      .redirect(reqwest::redirect::Policy::none());

    if let Some(secs) = config.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    debug!(method = %request.method, url = %request.url, "fetching from backend");

    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(forwardable_headers(&request.headers))
      .body(request.body.clone())
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

/// Request headers that may be passed on to the backend.
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
  let mut forwarded = headers.clone();
  for name in [HOST, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING] {
    forwarded.remove(name);
  }
  forwarded
}
