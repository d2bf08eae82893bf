use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::Request;
use crate::network::Network;

/// Application events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Backend became reachable after being offline
  Reconnected,
  /// Backend stopped answering
  WentOffline,
}

/// Tracks reachability and reports transitions.
#[derive(Debug)]
pub struct Connectivity {
  online: bool,
}

impl Connectivity {
  /// Starts out assuming the backend is reachable
  pub fn new() -> Self {
    Self { online: true }
  }

  /// Record a probe result; returns an event when the state flips.
  pub fn observe(&mut self, reachable: bool) -> Option<Event> {
    let event = match (self.online, reachable) {
      (false, true) => Some(Event::Reconnected),
      (true, false) => Some(Event::WentOffline),
      _ => None,
    };
    self.online = reachable;
    event
  }
}

/// Event handler fed by the connectivity monitor
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Inject an event into the loop. Returns false, after logging, if the
  /// loop has stopped receiving.
  pub fn emit(&self, event: Event) -> bool {
    match self.tx.send(event) {
      Ok(()) => true,
      Err(e) => {
        warn!(event = ?e.0, "event dropped, receiver closed");
        false
      }
    }
  }

  /// Spawn a task probing `probe_url` every `interval`.
  ///
  /// Any HTTP answer counts as reachable; only a failed fetch means offline.
  pub fn spawn_monitor<N: Network>(&self, network: Arc<N>, probe_url: Url, interval: Duration) {
    let tx = self.tx.clone();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut connectivity = Connectivity::new();
      let probe = Request::get(probe_url);

      loop {
        ticker.tick().await;

        let reachable = network.fetch(&probe).await.is_ok();
        debug!(reachable, "connectivity probe");

        if let Some(event) = connectivity.observe(reachable) {
          info!(?event, "connectivity changed");
          if tx.send(event).is_err() {
            break;
          }
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
