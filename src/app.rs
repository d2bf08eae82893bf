use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{CacheRouter, CacheStorage, DeadLetter, RegionNames, RoutingRules, SqliteStorage};
use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::lifecycle;
use crate::network::HttpNetwork;
use crate::server;
use crate::sync::{SyncCoordinator, SyncReport};

/// Owns the store handle and wires it into the router and the sync coordinator.
pub struct App {
  config: Config,
  base: Url,
  regions: RegionNames,
  storage: Arc<SqliteStorage>,
  network: Arc<HttpNetwork>,
  router: server::SharedRouter,
  sync: SyncCoordinator<SqliteStorage, HttpNetwork>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let base = Url::parse(&config.backend.url)
      .map_err(|e| eyre!("Invalid backend url {}: {}", config.backend.url, e))?;

    let db_path = config.database_path()?;
    let storage = Arc::new(SqliteStorage::open(&db_path)?);
    let network = Arc::new(HttpNetwork::new(&config.backend)?);
    let regions = RegionNames::new(&config.cache.region_prefix, &config.cache.version);

    let router = Arc::new(CacheRouter::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      regions.clone(),
      RoutingRules::from_config(&config.cache, &config.sync),
      base.clone(),
      &config.cache.offline_page,
    )?);

    let sync = SyncCoordinator::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      config.sync.max_attempts,
    );

    info!(database = %db_path.display(), backend = %base, "opened cache");

    Ok(Self {
      config,
      base,
      regions,
      storage,
      network,
      router,
      sync,
    })
  }

  /// Install, activate, then serve until Ctrl-C.
  pub async fn run(&self) -> Result<()> {
    lifecycle::install(
      self.storage.as_ref(),
      self.network.as_ref(),
      &self.regions,
      &self.base,
      &self.config.cache.precache,
    )
    .await;
    self.activate()?;

    let mut events = EventHandler::new();
    let probe_url = self
      .base
      .join(&self.config.backend.health_path)
      .map_err(|e| eyre!("Invalid health path {}: {}", self.config.backend.health_path, e))?;
    events.spawn_monitor(
      Arc::clone(&self.network),
      probe_url,
      Duration::from_secs(self.config.sync.probe_interval_secs.max(1)),
    );

    // Drain whatever is left over from the last run
    if !events.emit(Event::Reconnected) {
      warn!("startup sync not scheduled");
    }

    let listener = tokio::net::TcpListener::bind(self.config.listen)
      .await
      .map_err(|e| eyre!("Failed to bind {}: {}", self.config.listen, e))?;
    info!("listening on http://{}", self.config.listen);

    let app = server::router(Arc::clone(&self.router), self.config.max_body_bytes);
    let mut server = tokio::spawn(async move { axum::serve(listener, app).await });

    loop {
      tokio::select! {
        event = events.next() => match event {
          Some(Event::Reconnected) => {
            if let Err(e) = self.sync.sync().await {
              error!("sync failed: {:#}", e);
            }
          }
          Some(Event::WentOffline) => info!("backend unreachable, serving from cache"),
          None => break,
        },
        result = &mut server => {
          return match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(eyre!("Server error: {}", e)),
            Err(e) => Err(eyre!("Server task failed: {}", e)),
          };
        }
        _ = tokio::signal::ctrl_c() => {
          info!("shutting down");
          break;
        }
      }
    }

    server.abort();
    Ok(())
  }

  /// Run one sync pass.
  pub async fn sync_once(&self) -> Result<SyncReport> {
    self.sync.sync().await
  }

  /// Drop cache regions from earlier versions.
  pub fn activate(&self) -> Result<Vec<String>> {
    lifecycle::activate(self.storage.as_ref(), &self.regions)
  }

  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    self.storage.list_dead_letters()
  }

  /// Move a dead letter back into the queue.
  pub fn requeue(&self, id: i64) -> Result<i64> {
    self
      .storage
      .requeue_dead_letter(id)?
      .ok_or_else(|| eyre!("No dead letter with id {}", id))
  }
}
