//! Install and activate steps run when the proxy starts.

use color_eyre::Result;
use futures::future::join_all;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheRegion, CacheStorage, RegionNames};
use crate::http::Request;
use crate::network::Network;

/// Fetch the precache list into the static region.
///
/// Best effort: an asset that cannot be fetched is logged and skipped so the
/// proxy still starts while offline. Returns how many assets were stored.
pub async fn install<S: CacheStorage, N: Network>(
  storage: &S,
  network: &N,
  regions: &RegionNames,
  base: &Url,
  precache: &[String],
) -> usize {
  let region = regions.name(CacheRegion::Static);

  let requests: Vec<Request> = precache
    .iter()
    .filter_map(|path| match base.join(path) {
      Ok(url) => Some(Request::get(url)),
      Err(e) => {
        warn!(path = %path, "skipping invalid precache path: {}", e);
        None
      }
    })
    .collect();

  let responses = join_all(requests.iter().map(|request| network.fetch(request))).await;

  let mut stored = 0;
  for (request, response) in requests.iter().zip(responses) {
    match response {
      Ok(response) if response.is_success() => {
        match storage.put(&region, &request.cache_key(), &response) {
          Ok(()) => stored += 1,
          Err(e) => warn!(url = %request.url, "failed to precache: {}", e),
        }
      }
      Ok(response) => warn!(url = %request.url, status = response.status, "precache fetch rejected"),
      Err(e) => warn!(url = %request.url, "precache fetch failed: {}", e),
    }
  }

  info!(region = %region, stored, total = precache.len(), "installed static assets");
  stored
}

/// Drop every region that does not belong to the current version.
pub fn activate<S: CacheStorage>(storage: &S, regions: &RegionNames) -> Result<Vec<String>> {
  let removed = storage.delete_all_except(&regions.current())?;

  for region in &removed {
    info!(region = %region, "removed old cache region");
  }

  Ok(removed)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::Response;
  use crate::testing::{url, MockNetwork, BASE};

  #[tokio::test]
  async fn test_install_precaches_available_assets() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = MockNetwork::new();
    network.respond("/static/css/style.css", Response::new(200, "css"));
    network.respond("/offline.html", Response::new(200, "offline"));
    network.fail("/static/js/app.js");

    let regions = RegionNames::new("workout", "v1");
    let precache = vec![
      "/static/css/style.css".to_string(),
      "/static/js/app.js".to_string(),
      "/static/missing.png".to_string(),
      "/offline.html".to_string(),
    ];

    let stored = install(
      &storage,
      &network,
      &regions,
      &Url::parse(BASE).unwrap(),
      &precache,
    )
    .await;
    assert_eq!(stored, 2);

    let offline = storage
      .get(
        "workout-static-v1",
        &Request::get(url("/offline.html")).cache_key(),
      )
      .unwrap()
      .unwrap();
    assert_eq!(offline.response.body, b"offline");
    assert!(storage
      .get(
        "workout-static-v1",
        &Request::get(url("/static/js/app.js")).cache_key()
      )
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_activate_drops_previous_version() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let ok = Response::new(200, "x");
    storage.put("workout-static-v1", "GET /a", &ok).unwrap();
    storage.put("workout-dynamic-v1", "GET /b", &ok).unwrap();
    storage.put("workout-dynamic-v1", "GET /c", &ok).unwrap();

    let v2 = RegionNames::new("workout", "v2");
    storage.put("workout-static-v2", "GET /d", &ok).unwrap();

    let mut removed = activate(&storage, &v2).unwrap();
    removed.sort();
    assert_eq!(removed, vec!["workout-dynamic-v1", "workout-static-v1"]);

    assert_eq!(storage.list_regions().unwrap(), vec!["workout-static-v2"]);
    for key in ["GET /a", "GET /b", "GET /c"] {
      assert!(storage.get("workout-static-v1", key).unwrap().is_none());
      assert!(storage.get("workout-dynamic-v1", key).unwrap().is_none());
    }
  }

  #[test]
  fn test_activate_same_version_is_noop() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put("workout-static-v1", "GET /a", &Response::new(200, "x"))
      .unwrap();

    let removed = activate(&storage, &RegionNames::new("workout", "v1")).unwrap();
    assert!(removed.is_empty());
    assert!(storage.get("workout-static-v1", "GET /a").unwrap().is_some());
  }
}
