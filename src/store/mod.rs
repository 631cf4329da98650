//! Reservation store
//!
//! The shared store is the only authority on leases and assignments. Two
//! relations back it:
//! - `ShardReservationCluster(cluster, reshardedAt)`
//! - `ShardReservation(cluster, holder, shard, expiresAt)`
//!
//! plus the server-side `reshard_ShardReservations(cluster, minInterval)`
//! function. [`ShardStore`] exposes exactly the protocol queries the
//! registrar issues; implementations must provide the atomicity each one
//! documents.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use crate::common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;

/// One lease row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub cluster: String,
    pub holder: String,
    pub shard: Option<i32>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A holder's own row as read back during a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnReservation {
    pub shard: Option<i32>,
    /// Live rows of the cluster holding a shard
    pub num_shards: i32,
}

/// Cluster order: shard ascending with nulls last, then holder.
///
/// The first live row in this order is the coordinator.
pub fn reservation_order(a: &Reservation, b: &Reservation) -> Ordering {
    let by_shard = match (a.shard, b.shard) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_shard.then_with(|| a.holder.cmp(&b.holder))
}

#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Insert the cluster row if missing
    async fn upsert_cluster(&self, cluster: &str) -> Result<()>;

    /// Insert or renew `holder`'s lease until now + `lease`. Renewing a lease
    /// that had already expired clears its shard in the same write.
    async fn register(&self, cluster: &str, holder: &str, lease: Duration) -> Result<()>;

    /// Is `holder` the first live reservation of `cluster`?
    async fn is_coordinator(&self, cluster: &str, holder: &str) -> Result<bool>;

    /// Run the resharding function; returns when it may next run, if ever
    async fn reshard(&self, cluster: &str, min_interval: Duration)
        -> Result<Option<DateTime<Utc>>>;

    /// `holder`'s shard and the count of live assigned holders in `cluster`
    async fn own_reservation(&self, cluster: &str, holder: &str)
        -> Result<Option<OwnReservation>>;

    /// Delete `holder`'s row; clears the cluster's reshard marker when it was
    /// the last one
    async fn unregister(&self, cluster: &str, holder: &str) -> Result<()>;

    /// All rows of `cluster` in cluster order, expired ones included
    async fn reservations(&self, cluster: &str) -> Result<Vec<Reservation>>;
}
