//! Replay of queued writes once the backend is reachable again.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheStorage, PendingWrite};
use crate::http::Request;
use crate::network::Network;

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Writes accepted by the backend and removed from the queue
  pub replayed: usize,
  /// Writes that failed and stay queued
  pub failed: usize,
  /// Writes that failed for the last allowed time and were dead-lettered
  pub dead_lettered: usize,
}

/// Drains the pending-write queue against the backend.
pub struct SyncCoordinator<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  /// Failed replays before a write is dead-lettered; 0 keeps retrying forever
  max_attempts: u32,
  /// Held for the duration of a pass
  running: Mutex<()>,
}

impl<S: CacheStorage, N: Network> SyncCoordinator<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, max_attempts: u32) -> Self {
    Self {
      storage,
      network,
      max_attempts,
      running: Mutex::new(()),
    }
  }

  /// Replay every queued write in insertion order.
  ///
  /// A failed write stays queued and the pass moves on to the next one. If a
  /// pass is already running this returns an empty report without touching
  /// the queue.
  pub async fn sync(&self) -> Result<SyncReport> {
    let Ok(_guard) = self.running.try_lock() else {
      debug!("sync already in progress");
      return Ok(SyncReport::default());
    };

    let pending = self.storage.list_pending()?;
    let mut report = SyncReport::default();

    if pending.is_empty() {
      return Ok(report);
    }

    info!(count = pending.len(), "replaying queued writes");

    for write in pending {
      match self.replay(&write).await {
        Ok(()) => {
          if let Err(e) = self.storage.remove_pending(write.id) {
            error!(id = write.id, "replayed write could not be removed from the queue: {}", e);
          }
          report.replayed += 1;
        }
        Err(err) => {
          let reason = err.to_string();
          warn!(id = write.id, url = %write.url, queued_at = %write.created_at, "replay failed: {}", reason);
          self.note_failure(&write, &reason, &mut report);
        }
      }
    }

    info!(
      replayed = report.replayed,
      failed = report.failed,
      dead_lettered = report.dead_lettered,
      "sync finished"
    );

    Ok(report)
  }

  async fn replay(&self, write: &PendingWrite) -> Result<()> {
    let method = Method::from_bytes(write.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", write.method, e))?;
    let url = Url::parse(&write.url).map_err(|e| eyre!("Invalid url {}: {}", write.url, e))?;

    let mut request = Request::new(method, url)
      .with_headers(&write.headers)
      .with_body(write.body.clone());
    if let Some(content_type) = &write.content_type {
      request = request.with_header(CONTENT_TYPE, content_type);
    }

    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(eyre!("Backend answered {}", response.status));
    }

    debug!(id = write.id, status = response.status, "write replayed");
    Ok(())
  }

  fn note_failure(&self, write: &PendingWrite, reason: &str, report: &mut SyncReport) {
    let attempts = match self.storage.record_failure(write.id, reason) {
      Ok(attempts) => attempts,
      Err(e) => {
        warn!(id = write.id, "could not record failed attempt: {}", e);
        report.failed += 1;
        return;
      }
    };

    if self.max_attempts > 0 && attempts >= self.max_attempts {
      match self.storage.dead_letter(write.id, reason) {
        Ok(()) => {
          warn!(id = write.id, attempts, "write moved to dead letters");
          report.dead_lettered += 1;
        }
        Err(e) => {
          error!(id = write.id, "could not dead-letter write: {}", e);
          report.failed += 1;
        }
      }
    } else {
      report.failed += 1;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::queue::NewPendingWrite;
  use crate::cache::SqliteStorage;
  use crate::http::Response;
  use crate::testing::{url, MockNetwork};
  use reqwest::header::{AUTHORIZATION, COOKIE};

  fn setup(max_attempts: u32) -> (
    Arc<SqliteStorage>,
    Arc<MockNetwork>,
    SyncCoordinator<SqliteStorage, MockNetwork>,
  ) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(MockNetwork::new());
    let sync = SyncCoordinator::new(Arc::clone(&storage), Arc::clone(&network), max_attempts);
    (storage, network, sync)
  }

  fn queue(storage: &SqliteStorage, path: &str) -> i64 {
    storage
      .enqueue(&NewPendingWrite {
        url: url(path).to_string(),
        method: "POST".to_string(),
        body: br#"{"distance_km":5}"#.to_vec(),
        content_type: Some("application/json".to_string()),
        headers: vec![
          ("authorization".to_string(), "Bearer jwt-for-sam".to_string()),
          ("cookie".to_string(), "session=abc".to_string()),
        ],
      })
      .unwrap()
  }

  #[tokio::test]
  async fn test_empty_queue_makes_no_calls() {
    let (storage, network, sync) = setup(5);

    let report = sync.sync().await.unwrap();
    assert_eq!(report, SyncReport::default());
    assert_eq!(network.call_count(), 0);
    assert!(storage.list_pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_replays_in_insertion_order() {
    let (storage, network, sync) = setup(5);
    for path in ["/api/v1/workouts", "/api/v1/recovery", "/api/v1/workouts/3/logs"] {
      network.respond(path, Response::new(201, "{}"));
      queue(&storage, path);
    }

    let report = sync.sync().await.unwrap();
    assert_eq!(report.replayed, 3);
    assert_eq!(
      network.calls(),
      vec![
        format!("POST {}", url("/api/v1/workouts")),
        format!("POST {}", url("/api/v1/recovery")),
        format!("POST {}", url("/api/v1/workouts/3/logs")),
      ]
    );
    assert!(storage.list_pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_replay_sends_stored_credentials() {
    let (storage, network, sync) = setup(5);
    network.respond("/api/v1/workouts", Response::new(201, "{}"));
    queue(&storage, "/api/v1/workouts");

    assert_eq!(sync.sync().await.unwrap().replayed, 1);

    let sent = network.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].headers[AUTHORIZATION], "Bearer jwt-for-sam");
    assert_eq!(sent[0].headers[COOKIE], "session=abc");
    assert_eq!(sent[0].headers[CONTENT_TYPE], "application/json");
    assert_eq!(sent[0].body, br#"{"distance_km":5}"#);
  }

  #[tokio::test]
  async fn test_partial_failure_keeps_only_failed_write() {
    let (storage, network, sync) = setup(5);
    network.respond("/api/v1/workouts", Response::new(201, "{}"));
    network.fail("/api/v1/recovery");
    network.respond("/api/v1/workouts/3/logs", Response::new(201, "{}"));

    queue(&storage, "/api/v1/workouts");
    let second = queue(&storage, "/api/v1/recovery");
    queue(&storage, "/api/v1/workouts/3/logs");

    let report = sync.sync().await.unwrap();
    assert_eq!(report.replayed, 2);
    assert_eq!(report.failed, 1);

    let pending = storage.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second);
  }

  #[tokio::test]
  async fn test_error_status_counts_as_failure() {
    let (storage, network, sync) = setup(5);
    network.respond("/api/v1/workouts", Response::new(500, "boom"));
    queue(&storage, "/api/v1/workouts");

    let report = sync.sync().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(storage.list_pending().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_failed_write_retried_on_next_pass() {
    let (storage, network, sync) = setup(5);
    network.set_online(false);
    queue(&storage, "/api/v1/workouts");

    assert_eq!(sync.sync().await.unwrap().failed, 1);

    network.set_online(true);
    network.respond("/api/v1/workouts", Response::new(201, "{}"));
    assert_eq!(sync.sync().await.unwrap().replayed, 1);
    assert!(storage.list_pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_dead_letter_after_max_attempts() {
    let (storage, network, sync) = setup(2);
    network.set_online(false);
    let id = queue(&storage, "/api/v1/workouts");

    assert_eq!(sync.sync().await.unwrap().failed, 1);
    assert_eq!(sync.sync().await.unwrap().dead_lettered, 1);

    assert!(storage.list_pending().unwrap().is_empty());
    let dead = storage.list_dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].attempts, 2);

    // Nothing left to replay
    let calls = network.call_count();
    sync.sync().await.unwrap();
    assert_eq!(network.call_count(), calls);
  }

  #[tokio::test]
  async fn test_unlimited_attempts_never_dead_letter() {
    let (storage, network, sync) = setup(0);
    network.set_online(false);
    queue(&storage, "/api/v1/workouts");

    for _ in 0..10 {
      sync.sync().await.unwrap();
    }
    assert_eq!(storage.list_pending().unwrap().len(), 1);
    assert!(storage.list_dead_letters().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_pass_is_skipped() {
    let (storage, network, sync) = setup(5);
    network.respond("/api/v1/workouts", Response::new(201, "{}"));
    queue(&storage, "/api/v1/workouts");

    let _held = sync.running.lock().await;
    assert_eq!(sync.sync().await.unwrap(), SyncReport::default());
    assert_eq!(network.call_count(), 0);
    assert_eq!(storage.list_pending().unwrap().len(), 1);
  }
}
