//! Scripted network used by unit tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::http::{Request, Response};
use crate::network::Network;

pub const BASE: &str = "http://backend.test";

pub fn url(path: &str) -> Url {
  Url::parse(BASE).unwrap().join(path).unwrap()
}

/// Network double: answers from a table, records every call.
pub struct MockNetwork {
  online: AtomicBool,
  responses: Mutex<HashMap<String, Response>>,
  failing: Mutex<HashSet<String>>,
  requests: Mutex<Vec<Request>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      responses: Mutex::new(HashMap::new()),
      failing: Mutex::new(HashSet::new()),
      requests: Mutex::new(Vec::new()),
    }
  }

  /// Answer requests for `path` with `response`.
  pub fn respond(&self, path: &str, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url(path).to_string(), response);
  }

  /// Make requests for `path` fail as unreachable.
  pub fn fail(&self, path: &str) {
    self.failing.lock().unwrap().insert(url(path).to_string());
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Calls made so far, as "METHOD URL".
  pub fn calls(&self) -> Vec<String> {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .map(|r| format!("{} {}", r.method, r.url))
      .collect()
  }

  /// Every request received, headers and body included.
  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }
}

impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let url = request.url.to_string();
    self.requests.lock().unwrap().push(request.clone());

    if !self.online.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&url) {
      return Err(eyre!("Request to {} failed: connection refused", url));
    }

    Ok(
      self
        .responses
        .lock()
        .unwrap()
        .get(&url)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}
