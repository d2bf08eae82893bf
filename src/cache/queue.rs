//! Pending-write queue records.

use chrono::{DateTime, Utc};

/// A write captured while the backend was unreachable, not yet assigned an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPendingWrite {
  pub url: String,
  pub method: String,
  pub body: Vec<u8>,
  pub content_type: Option<String>,
  /// Credential headers to send again on replay
  pub headers: Vec<(String, String)>,
}

/// A queued write waiting for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
  /// Auto-incrementing id; ordering by id is insertion order
  pub id: i64,
  pub url: String,
  pub method: String,
  pub body: Vec<u8>,
  pub content_type: Option<String>,
  /// Credential headers to send again on replay
  pub headers: Vec<(String, String)>,
  pub created_at: DateTime<Utc>,
}

/// A write that exhausted its replay attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
  pub id: i64,
  pub url: String,
  pub method: String,
  pub body: Vec<u8>,
  pub content_type: Option<String>,
  /// Credential headers to send again on replay
  pub headers: Vec<(String, String)>,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_error: String,
  pub failed_at: DateTime<Utc>,
}
