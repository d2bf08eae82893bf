//! Response cache and pending-write queue for offline support.
//!
//! This module provides:
//! - Versioned cache regions (static and dynamic) stored in SQLite
//! - Request routing: network-first, cache-first or straight to the network
//! - A queue of writes made while the backend was unreachable

pub mod queue;
mod router;
mod storage;
mod traits;

pub use queue::{DeadLetter, PendingWrite};
pub use router::{CacheRouter, RoutingRules};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheRegion, CacheResult, RegionNames};
