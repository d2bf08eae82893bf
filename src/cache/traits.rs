//! Core types for the cache regions and lookup results.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// Partition of the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRegion {
  /// Immutable build assets
  Static,
  /// Previously seen pages and responses
  Dynamic,
}

impl CacheRegion {
  pub fn label(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
    }
  }
}

/// Versioned region names, e.g. `workout-static-v1`.
///
/// The version is the only invalidation mechanism: activation drops every
/// region whose name is not produced by the current `RegionNames`.
#[derive(Debug, Clone)]
pub struct RegionNames {
  prefix: String,
  version: String,
}

impl RegionNames {
  pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      version: version.into(),
    }
  }

  pub fn name(&self, region: CacheRegion) -> String {
    format!("{}-{}-{}", self.prefix, region.label(), self.version)
  }

  /// Names of all regions belonging to the current version
  pub fn current(&self) -> Vec<String> {
    vec![
      self.name(CacheRegion::Static),
      self.name(CacheRegion::Dynamic),
    ]
  }
}

/// A response read back from the store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the response was cached
  pub cached_at: DateTime<Utc>,
}

/// Result of routing one request, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub response: Response,
  pub source: ResponseSource,
  /// When the response was cached (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl CacheResult {
  /// Live response from the backend.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  /// Response served from a cache region.
  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ResponseSource::Cache,
      cached_at: Some(cached.cached_at),
    }
  }

  /// The offline document, served because network and cache both missed.
  pub fn offline_page(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ResponseSource::OfflinePage,
      cached_at: Some(cached.cached_at),
    }
  }

  /// Acknowledgement for a write stored in the pending queue.
  pub fn queued(id: i64) -> Self {
    let body = serde_json::json!({ "queued": true, "id": id }).to_string();
    let response = Response::new(202, body)
      .with_header("content-type", "application/json")
      .with_header(QUEUED_HEADER, &id.to_string());

    Self {
      response,
      source: ResponseSource::Queued,
      cached_at: None,
    }
  }
}

/// Header carrying the pending-write id on a queued response.
pub const QUEUED_HEADER: &str = "x-offline-queued";

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh response from the backend
  Network,
  /// Backend unreachable or skipped, served from a cache region
  Cache,
  /// Backend unreachable and no cached copy, served the offline document
  OfflinePage,
  /// Backend unreachable, write stored for later replay
  Queued,
}

impl ResponseSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::OfflinePage => "offline-page",
      Self::Queued => "queued",
    }
  }
}
