//! Request classification and the three caching strategies.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::queue::NewPendingWrite;
use super::storage::CacheStorage;
use super::traits::{CacheRegion, CacheResult, CachedResponse, RegionNames};
use crate::config::{CacheConfig, SyncConfig};
use crate::http::{Request, Response};
use crate::network::Network;

/// How a request is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Non-GET: network only, queued for replay if it fails on a queueable path
  Write,
  /// API path: network only
  Api,
  /// HTML document: network first, then cache, then offline page
  Page,
  /// Static asset: cache first
  StaticAsset,
  /// Anything else: network first, then cache
  Other,
}

/// URL rules deciding the route of a request.
#[derive(Debug, Clone)]
pub struct RoutingRules {
  pub api_prefixes: Vec<String>,
  pub static_prefix: String,
  pub queue_prefixes: Vec<String>,
}

impl RoutingRules {
  pub fn from_config(cache: &CacheConfig, sync: &SyncConfig) -> Self {
    Self {
      api_prefixes: cache.api_prefixes.clone(),
      static_prefix: cache.static_prefix.clone(),
      queue_prefixes: sync.queue_prefixes.clone(),
    }
  }

  /// Classify a request. First match wins.
  pub fn classify(&self, request: &Request) -> Route {
    let path = request.path();

    if request.method != Method::GET {
      Route::Write
    } else if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      Route::Api
    } else if request.accepts_html() {
      Route::Page
    } else if path.starts_with(self.static_prefix.as_str()) {
      Route::StaticAsset
    } else {
      Route::Other
    }
  }

  pub fn is_queueable(&self, request: &Request) -> bool {
    let path = request.path();
    self
      .queue_prefixes
      .iter()
      .any(|p| path.starts_with(p.as_str()))
  }
}

/// Routes intercepted requests between the network and the cache regions.
///
/// Caching is best effort: a failed store read counts as a miss and a failed
/// store write is logged, neither changes what the caller receives.
pub struct CacheRouter<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  regions: RegionNames,
  rules: RoutingRules,
  base: Url,
  offline_key: String,
}

impl<S: CacheStorage, N: Network> CacheRouter<S, N> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    regions: RegionNames,
    rules: RoutingRules,
    base: Url,
    offline_page: &str,
  ) -> Result<Self> {
    let offline_url = base
      .join(offline_page)
      .map_err(|e| eyre!("Invalid offline page path {}: {}", offline_page, e))?;
    let offline_key = Request::get(offline_url).cache_key();

    Ok(Self {
      storage,
      network,
      regions,
      rules,
      base,
      offline_key,
    })
  }

  /// Resolve a path (with optional query) against the backend base URL.
  pub fn resolve(&self, path_and_query: &str) -> Result<Url> {
    self
      .base
      .join(path_and_query)
      .map_err(|e| eyre!("Invalid request path {}: {}", path_and_query, e))
  }

  pub fn classify(&self, request: &Request) -> Route {
    self.rules.classify(request)
  }

  /// Satisfy one request.
  ///
  /// Fails only when the network is unreachable and the route has no fallback
  /// left: no cached copy, no offline page, and not a queueable write.
  pub async fn handle(&self, request: Request) -> Result<CacheResult> {
    let route = self.classify(&request);
    debug!(method = %request.method, url = %request.url, ?route, "routing request");

    match route {
      Route::Write => self.write(request).await,
      Route::Api => {
        let response = self.network.fetch(&request).await?;
        Ok(CacheResult::from_network(response))
      }
      Route::Page => self.network_first(&request, true).await,
      Route::StaticAsset => self.cache_first(&request).await,
      Route::Other => self.network_first(&request, false).await,
    }
  }

  /// Forward a write; queue it if the backend is unreachable and the path allows it.
  async fn write(&self, request: Request) -> Result<CacheResult> {
    let fetched = self.network.fetch(&request).await;

    match fetched {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(err) if self.rules.is_queueable(&request) => {
        let write = NewPendingWrite {
          url: request.url.to_string(),
          method: request.method.to_string(),
          content_type: request.content_type().map(String::from),
          headers: request.credentials(),
          body: request.body,
        };
        let id = self
          .storage
          .enqueue(&write)
          .map_err(|e| e.wrap_err(format!("Backend unreachable ({}) and queueing failed", err)))?;

        info!(id, method = %write.method, url = %write.url, "backend unreachable, write queued");
        Ok(CacheResult::queued(id))
      }
      Err(err) => Err(err),
    }
  }

  async fn network_first(&self, request: &Request, offline_fallback: bool) -> Result<CacheResult> {
    let key = request.cache_key();

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(CacheRegion::Dynamic, &key, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        debug!(url = %request.url, "network failed, trying cache: {}", err);

        if let Some(cached) = self.lookup_any(&key) {
          return Ok(CacheResult::from_cache(cached));
        }

        if offline_fallback {
          if let Some(page) = self.lookup_any(&self.offline_key) {
            return Ok(CacheResult::offline_page(page));
          }
        }

        Err(err.wrap_err(format!("Offline and no cached copy of {}", request.url)))
      }
    }
  }

  async fn cache_first(&self, request: &Request) -> Result<CacheResult> {
    let key = request.cache_key();

    if let Some(cached) = self.lookup(CacheRegion::Static, &key) {
      return Ok(CacheResult::from_cache(cached));
    }

    let response = self.network.fetch(request).await?;
    self.store(CacheRegion::Static, &key, &response);
    Ok(CacheResult::from_network(response))
  }

  fn lookup(&self, region: CacheRegion, key: &str) -> Option<CachedResponse> {
    let name = self.regions.name(region);
    match self.storage.get(&name, key) {
      Ok(found) => found,
      Err(e) => {
        warn!(region = %name, key, "cache read failed: {}", e);
        None
      }
    }
  }

  /// Look a key up in every current region, dynamic first.
  ///
  /// A key lives in one region only, and which one depends on how it was last
  /// fetched (precache, cache-first or network-first), so fallbacks check both.
  fn lookup_any(&self, key: &str) -> Option<CachedResponse> {
    self
      .lookup(CacheRegion::Dynamic, key)
      .or_else(|| self.lookup(CacheRegion::Static, key))
  }

  /// Store a copy of a successful response; the caller keeps the original.
  fn store(&self, region: CacheRegion, key: &str, response: &Response) {
    if !response.is_success() {
      return;
    }

    let name = self.regions.name(region);
    if let Err(e) = self.storage.put(&name, key, response) {
      warn!(region = %name, key, "cache write failed: {}", e);
    }
  }
}
