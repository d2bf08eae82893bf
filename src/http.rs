//! Request and response descriptors passed between the boundary, the router and the network.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, COOKIE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// Credentials kept with a queued write and sent again on replay.
///
/// The backend authenticates writes with a bearer token or a session cookie.
pub const CREDENTIAL_HEADERS: [HeaderName; 2] = [AUTHORIZATION, COOKIE];

/// An intercepted request.
///
/// The body is carried opaquely so writes can be forwarded or queued; nothing
/// in the cache path ever reads it.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
      body: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
    if let Ok(value) = HeaderValue::from_str(value) {
      self.headers.insert(name, value);
    }
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = body;
    self
  }

  /// Key under which the response to this request is cached.
  pub fn cache_key(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// Whether the `Accept` header asks for an HTML document.
  pub fn accepts_html(&self) -> bool {
    self
      .headers
      .get_all(ACCEPT)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .any(|v| v.contains("text/html"))
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
  }

  /// Credential headers of this request, as name/value pairs.
  pub fn credentials(&self) -> Vec<(String, String)> {
    CREDENTIAL_HEADERS
      .iter()
      .flat_map(|name| {
        self
          .headers
          .get_all(name)
          .iter()
          .filter_map(move |v| v.to_str().ok().map(|v| (name.to_string(), v.to_string())))
      })
      .collect()
  }

  /// Add stored name/value pairs, skipping any that are not valid headers.
  pub fn with_headers(mut self, headers: &[(String, String)]) -> Self {
    for (name, value) in headers {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        self.headers.append(name, value);
      }
    }
    self
  }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// 2xx status
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

#[cfg(test)]
impl Response {
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(path: &str) -> Url {
    Url::parse("http://localhost:5000").unwrap().join(path).unwrap()
  }

  #[test]
  fn test_cache_key_includes_method_and_url() {
    let req = Request::get(url("/workouts/?page=2"));
    assert_eq!(req.cache_key(), "GET http://localhost:5000/workouts/?page=2");
  }

  #[test]
  fn test_accepts_html() {
    let req = Request::get(url("/")).with_header(ACCEPT, "text/html,application/xhtml+xml");
    assert!(req.accepts_html());

    let req = Request::get(url("/")).with_header(ACCEPT, "application/json");
    assert!(!req.accepts_html());

    assert!(!Request::get(url("/")).accepts_html());
  }

  #[test]
  fn test_response_header_lookup_is_case_insensitive() {
    let resp = Response::new(200, "ok").with_header("Content-Type", "text/plain");
    assert_eq!(resp.header("content-type"), Some("text/plain"));
    assert_eq!(resp.header("etag"), None);
  }

  #[test]
  fn test_credentials_survive_a_round_trip() {
    let req = Request::get(url("/api/v1/workouts"))
      .with_header(AUTHORIZATION, "Bearer abc.def")
      .with_header(COOKIE, "session=42")
      .with_header(ACCEPT, "application/json");

    let stored = req.credentials();
    assert_eq!(
      stored,
      vec![
        ("authorization".to_string(), "Bearer abc.def".to_string()),
        ("cookie".to_string(), "session=42".to_string()),
      ]
    );

    let replay = Request::get(url("/api/v1/workouts")).with_headers(&stored);
    assert_eq!(replay.headers[AUTHORIZATION], "Bearer abc.def");
    assert_eq!(replay.headers[COOKIE], "session=42");
    assert!(replay.headers.get(ACCEPT).is_none());
  }

  #[test]
  fn test_with_headers_skips_invalid_pairs() {
    let req = Request::get(url("/")).with_headers(&[("bad header".to_string(), "x".to_string())]);
    assert!(req.headers.is_empty());
  }

  #[test]
  fn test_is_success() {
    assert!(Response::new(204, "").is_success());
    assert!(!Response::new(304, "").is_success());
    assert!(!Response::new(503, "").is_success());
  }
}
