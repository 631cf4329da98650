//! In-process reservation store
//!
//! Implements the reservation schema and the resharding function in memory.
//! Every query runs under one lock, which stands in for the row locks and
//! statement atomicity of the relational store.

use super::{reservation_order, OwnReservation, Reservation, ShardStore};
use crate::bus::{shard_channel, NotificationBus};
use crate::common::utils::chrono_duration;
use crate::common::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct Tables {
    /// cluster → reshardedAt
    clusters: HashMap<String, Option<DateTime<Utc>>>,
    /// holder → row
    reservations: HashMap<String, Reservation>,
}

impl Tables {
    fn rows_in<'a>(&'a self, cluster: &'a str) -> impl Iterator<Item = &'a Reservation> + 'a {
        self.reservations
            .values()
            .filter(move |r| r.cluster == cluster)
    }

    fn live_sorted<'a>(&'a self, cluster: &'a str, now: DateTime<Utc>) -> Vec<&'a Reservation> {
        let mut live: Vec<&Reservation> =
            self.rows_in(cluster).filter(|r| r.is_live(now)).collect();
        live.sort_by(|a, b| reservation_order(a, b));
        live
    }
}

/// Outcome of one resharding pass, computed under the lock
enum ReshardPlan {
    Unchanged,
    RateLimited(DateTime<Utc>),
    Applied {
        next: DateTime<Utc>,
        notifications: Vec<(String, String)>,
    },
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Held from planning through delivery so pushes leave in reshard order
    reshard_lock: tokio::sync::Mutex<()>,
    bus: Arc<dyn NotificationBus>,
}

impl MemoryStore {
    /// Create an empty store that publishes assignments on `bus`
    pub fn new(bus: Arc<dyn NotificationBus>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            reshard_lock: tokio::sync::Mutex::new(()),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Force `holder`'s lease into the past, as if its process had died
    /// without renewing. Returns whether the row existed.
    pub fn expire(&self, holder: &str) -> bool {
        let mut tables = self.lock();
        match tables.reservations.get_mut(holder) {
            Some(row) => {
                row.expires_at = Utc::now() - chrono::Duration::seconds(1);
                true
            }
            None => false,
        }
    }

    /// `reshardedAt` of `cluster`; outer `None` if the cluster row is missing
    pub fn resharded_at(&self, cluster: &str) -> Option<Option<DateTime<Utc>>> {
        self.lock().clusters.get(cluster).copied()
    }

    fn plan_reshard(
        &self,
        cluster: &str,
        min_interval: chrono::Duration,
        now: DateTime<Utc>,
    ) -> ReshardPlan {
        let mut tables = self.lock();
        let Some(resharded_at) = tables.clusters.get(cluster).copied() else {
            return ReshardPlan::Unchanged;
        };

        let live: Vec<String> = tables
            .live_sorted(cluster, now)
            .into_iter()
            .map(|r| r.holder.clone())
            .collect();
        let contiguous = live.iter().enumerate().all(|(i, holder)| {
            tables.reservations[holder].shard == Some(i as i32)
        });
        let stale_shards = tables
            .rows_in(cluster)
            .any(|r| !r.is_live(now) && r.shard.is_some());
        if contiguous && !stale_shards {
            return ReshardPlan::Unchanged;
        }

        if let Some(at) = resharded_at {
            let allowed = at + min_interval;
            if allowed > now {
                return ReshardPlan::RateLimited(allowed);
            }
        }

        for row in tables.reservations.values_mut() {
            if row.cluster == cluster && !row.is_live(now) {
                row.shard = None;
            }
        }
        let num_shards = live.len();
        let mut notifications = Vec::with_capacity(num_shards);
        for (shard, holder) in live.into_iter().enumerate() {
            if let Some(row) = tables.reservations.get_mut(&holder) {
                row.shard = Some(shard as i32);
            }
            let payload = serde_json::json!({ "shard": shard, "numShards": num_shards });
            notifications.push((holder, payload.to_string()));
        }
        tables.clusters.insert(cluster.to_string(), Some(now));

        ReshardPlan::Applied {
            next: now + min_interval,
            notifications,
        }
    }
}

#[async_trait]
impl ShardStore for MemoryStore {
    async fn upsert_cluster(&self, cluster: &str) -> Result<()> {
        self.lock().clusters.entry(cluster.to_string()).or_insert(None);
        Ok(())
    }

    async fn register(&self, cluster: &str, holder: &str, lease: Duration) -> Result<()> {
        let lease = chrono_duration(lease)?;
        let now = Utc::now();
        let mut tables = self.lock();
        if !tables.clusters.contains_key(cluster) {
            return Err(Error::Store(format!(
                "cluster {} does not exist",
                cluster
            )));
        }
        tables
            .reservations
            .entry(holder.to_string())
            .and_modify(|row| {
                if row.expires_at <= now {
                    row.shard = None;
                }
                row.expires_at = now + lease;
            })
            .or_insert_with(|| Reservation {
                cluster: cluster.to_string(),
                holder: holder.to_string(),
                shard: None,
                expires_at: now + lease,
            });
        Ok(())
    }

    async fn is_coordinator(&self, cluster: &str, holder: &str) -> Result<bool> {
        let tables = self.lock();
        let first = tables.live_sorted(cluster, Utc::now()).into_iter().next();
        Ok(first.is_some_and(|r| r.holder == holder))
    }

    async fn reshard(
        &self,
        cluster: &str,
        min_interval: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let min_interval = chrono_duration(min_interval)?;
        let _ordered = self.reshard_lock.lock().await;
        match self.plan_reshard(cluster, min_interval, Utc::now()) {
            ReshardPlan::Unchanged => Ok(None),
            ReshardPlan::RateLimited(at) => Ok(Some(at)),
            ReshardPlan::Applied {
                next,
                notifications,
            } => {
                tracing::debug!(cluster, holders = notifications.len(), "resharded");
                // Every holder is attempted even if one delivery fails.
                let mut failure = None;
                for (holder, payload) in notifications {
                    if let Err(e) = self.bus.notify(&shard_channel(&holder), &payload).await {
                        tracing::warn!(cluster, holder = %holder, "notify failed: {}", e);
                        failure.get_or_insert(e);
                    }
                }
                match failure {
                    Some(e) => Err(e),
                    None => Ok(Some(next)),
                }
            }
        }
    }

    async fn own_reservation(
        &self,
        cluster: &str,
        holder: &str,
    ) -> Result<Option<OwnReservation>> {
        let now = Utc::now();
        let tables = self.lock();
        let Some(row) = tables
            .reservations
            .get(holder)
            .filter(|r| r.cluster == cluster)
        else {
            return Ok(None);
        };
        let num_shards = tables
            .rows_in(cluster)
            .filter(|r| r.shard.is_some() && r.is_live(now))
            .count();
        Ok(Some(OwnReservation {
            shard: row.shard,
            num_shards: num_shards as i32,
        }))
    }

    async fn unregister(&self, cluster: &str, holder: &str) -> Result<()> {
        let mut tables = self.lock();
        if tables
            .reservations
            .get(holder)
            .is_some_and(|r| r.cluster == cluster)
        {
            tables.reservations.remove(holder);
        }
        if tables.rows_in(cluster).next().is_none() {
            if let Some(resharded_at) = tables.clusters.get_mut(cluster) {
                *resharded_at = None;
            }
        }
        Ok(())
    }

    async fn reservations(&self, cluster: &str) -> Result<Vec<Reservation>> {
        let tables = self.lock();
        let mut rows: Vec<Reservation> = tables.rows_in(cluster).cloned().collect();
        rows.sort_by(reservation_order);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    const LEASE: Duration = Duration::from_secs(30);
    const NO_LIMIT: Duration = Duration::ZERO;

    fn store() -> (Arc<MemoryBus>, MemoryStore) {
        let bus = Arc::new(MemoryBus::new());
        let store = MemoryStore::new(bus.clone());
        (bus, store)
    }

    async fn join(store: &MemoryStore, cluster: &str, holder: &str) {
        store.upsert_cluster(cluster).await.unwrap();
        store.register(cluster, holder, LEASE).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_requires_cluster() {
        let (_, store) = store();
        let err = store.register("a", "h1", LEASE).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn test_coordinator_is_first_live_row() {
        let (_, store) = store();
        join(&store, "a", "h2").await;
        join(&store, "a", "h1").await;

        // no shards yet: holder order decides
        assert!(store.is_coordinator("a", "h1").await.unwrap());
        assert!(!store.is_coordinator("a", "h2").await.unwrap());

        store.reshard("a", NO_LIMIT).await.unwrap();
        store.expire("h1");
        assert!(store.is_coordinator("a", "h2").await.unwrap());
    }

    #[tokio::test]
    async fn test_reshard_assigns_contiguous_and_notifies() {
        let (bus, store) = store();
        let mut subs = Vec::new();
        for holder in ["h1", "h2", "h3"] {
            subs.push(bus.listen(&shard_channel(holder)).await.unwrap());
            join(&store, "a", holder).await;
        }

        let next = store.reshard("a", Duration::from_secs(5)).await.unwrap();
        assert!(next.is_some());

        let rows = store.reservations("a").await.unwrap();
        let shards: Vec<Option<i32>> = rows.iter().map(|r| r.shard).collect();
        assert_eq!(shards, vec![Some(0), Some(1), Some(2)]);

        for (i, sub) in subs.iter_mut().enumerate() {
            let n = sub.recv().await.unwrap();
            let payload: serde_json::Value = serde_json::from_str(&n.payload).unwrap();
            assert_eq!(payload["shard"], i);
            assert_eq!(payload["numShards"], 3);
        }

        let own = store.own_reservation("a", "h3").await.unwrap().unwrap();
        assert_eq!(own, OwnReservation { shard: Some(2), num_shards: 3 });
    }

    #[tokio::test]
    async fn test_reshard_is_idempotent() {
        let (bus, store) = store();
        let mut sub = bus.listen(&shard_channel("h1")).await.unwrap();
        join(&store, "a", "h1").await;
        join(&store, "a", "h2").await;

        store.reshard("a", NO_LIMIT).await.unwrap();
        let before = store.reservations("a").await.unwrap();
        assert!(sub.recv().await.is_some());

        assert_eq!(store.reshard("a", NO_LIMIT).await.unwrap(), None);
        assert_eq!(store.reservations("a").await.unwrap(), before);

        bus.notify(&shard_channel("h1"), "marker").await.unwrap();
        assert_eq!(sub.recv().await.unwrap().payload, "marker");
    }

    #[tokio::test]
    async fn test_reshard_rate_limited() {
        let (_, store) = store();
        join(&store, "a", "h1").await;
        let first = store
            .reshard("a", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        join(&store, "a", "h2").await;
        let limited = store.reshard("a", Duration::from_secs(60)).await.unwrap();
        assert_eq!(limited, Some(first));
        let rows = store.reservations("a").await.unwrap();
        assert_eq!(rows[1].shard, None);
    }

    #[tokio::test]
    async fn test_expired_rows_lose_their_shard() {
        let (_, store) = store();
        join(&store, "a", "h1").await;
        join(&store, "a", "h2").await;
        store.reshard("a", NO_LIMIT).await.unwrap();

        store.expire("h1");
        let own = store.own_reservation("a", "h2").await.unwrap().unwrap();
        assert_eq!(own, OwnReservation { shard: Some(1), num_shards: 1 });

        store.reshard("a", NO_LIMIT).await.unwrap();
        let rows = store.reservations("a").await.unwrap();
        assert_eq!(rows[0].holder, "h2");
        assert_eq!(rows[0].shard, Some(0));
        assert_eq!(rows[1].shard, None);
    }

    #[tokio::test]
    async fn test_renewing_expired_lease_clears_shard() {
        let (_, store) = store();
        join(&store, "a", "h1").await;
        store.reshard("a", NO_LIMIT).await.unwrap();
        store.expire("h1");

        store.register("a", "h1", LEASE).await.unwrap();
        let own = store.own_reservation("a", "h1").await.unwrap().unwrap();
        assert_eq!(own.shard, None);
    }

    #[tokio::test]
    async fn test_unregister_last_holder_resets_cluster() {
        let (_, store) = store();
        join(&store, "a", "h1").await;
        join(&store, "a", "h2").await;
        store.reshard("a", NO_LIMIT).await.unwrap();

        store.unregister("a", "h1").await.unwrap();
        assert!(matches!(store.resharded_at("a"), Some(Some(_))));

        store.unregister("a", "h2").await.unwrap();
        assert_eq!(store.resharded_at("a"), Some(None));
        assert!(store.reservations("a").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reshards_deliver_latest_numbering_last() {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::new(bus.clone()));
        store.upsert_cluster("a").await.unwrap();

        let holders: Vec<String> = (0..8).map(|i| format!("h{}", i)).collect();
        let mut subs = Vec::new();
        for holder in &holders {
            subs.push(bus.listen(&shard_channel(holder)).await.unwrap());
        }

        // Membership changes between concurrent reshards.
        let mut tasks = Vec::new();
        for holder in holders.iter().rev() {
            store.register("a", holder, LEASE).await.unwrap();
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.reshard("a", NO_LIMIT).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        for (holder, sub) in holders.iter().zip(subs.iter_mut()) {
            let own = store.own_reservation("a", holder).await.unwrap().unwrap();
            let mut last = None;
            while let Some(n) = sub.try_recv() {
                last = Some(n.payload);
            }
            let last: serde_json::Value = serde_json::from_str(&last.unwrap()).unwrap();
            assert_eq!(last["shard"], own.shard.unwrap());
            assert_eq!(last["numShards"], own.num_shards);
        }
    }

    #[tokio::test]
    async fn test_clusters_are_independent() {
        let (_, store) = store();
        join(&store, "a", "a1").await;
        join(&store, "a", "a2").await;
        join(&store, "b", "b1").await;
        store.reshard("a", NO_LIMIT).await.unwrap();
        store.reshard("b", NO_LIMIT).await.unwrap();

        let own = store.own_reservation("b", "b1").await.unwrap().unwrap();
        assert_eq!(own, OwnReservation { shard: Some(0), num_shards: 1 });
        assert!(store.own_reservation("b", "a1").await.unwrap().is_none());
    }
}
