//! Store and bus failure handling

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{fast_config, wait_for, Harness, HEARTBEAT, TIMEOUT};
use shard_registrar::bus::Subscription;
use shard_registrar::store::{OwnReservation, Reservation};
use shard_registrar::{
    Error, MemoryStore, NotificationBus, RegistrarEvent, RegistrarState, Result, ShardInfo,
    ShardRegistrar, ShardStore, StopOptions,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

/// Delegates to a [`MemoryStore`], failing or stalling on demand
struct FlakyStore {
    inner: Arc<MemoryStore>,
    fail: AtomicBool,
    stall: AtomicBool,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail: AtomicBool::new(false),
            stall: AtomicBool::new(false),
        }
    }

    async fn check(&self) -> Result<()> {
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(HEARTBEAT * 3).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Store("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ShardStore for FlakyStore {
    async fn upsert_cluster(&self, cluster: &str) -> Result<()> {
        self.check().await?;
        self.inner.upsert_cluster(cluster).await
    }

    async fn register(&self, cluster: &str, holder: &str, lease: Duration) -> Result<()> {
        self.check().await?;
        self.inner.register(cluster, holder, lease).await
    }

    async fn is_coordinator(&self, cluster: &str, holder: &str) -> Result<bool> {
        self.check().await?;
        self.inner.is_coordinator(cluster, holder).await
    }

    async fn reshard(
        &self,
        cluster: &str,
        min_interval: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        self.check().await?;
        self.inner.reshard(cluster, min_interval).await
    }

    async fn own_reservation(
        &self,
        cluster: &str,
        holder: &str,
    ) -> Result<Option<OwnReservation>> {
        self.check().await?;
        self.inner.own_reservation(cluster, holder).await
    }

    async fn unregister(&self, cluster: &str, holder: &str) -> Result<()> {
        self.check().await?;
        self.inner.unregister(cluster, holder).await
    }

    async fn reservations(&self, cluster: &str) -> Result<Vec<Reservation>> {
        self.check().await?;
        self.inner.reservations(cluster).await
    }
}

/// A bus whose LISTEN always fails
struct DeadBus;

#[async_trait]
impl NotificationBus for DeadBus {
    async fn listen(&self, _channel: &str) -> Result<Subscription> {
        Err(Error::Bus("listener connection closed".into()))
    }

    async fn unlisten(&self, _channel: &str) -> Result<()> {
        Ok(())
    }

    async fn notify(&self, _channel: &str, _payload: &str) -> Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_errors_are_reported_and_loop_continues() {
    let h = Harness::new();
    let store = Arc::new(FlakyStore::new(h.store.clone()));
    store.fail.store(true, Ordering::SeqCst);

    let registrar = h.registrar_on("a", store.clone());
    let mut events = registrar.subscribe();
    registrar.start().await.unwrap();

    for _ in 0..2 {
        let event = tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap().unwrap();
        match event {
            RegistrarEvent::Error(e) => {
                assert!(matches!(*e, Error::Store(_)));
                assert!(e.is_transient());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(registrar.is_running());
    assert!(matches!(registrar.shard_info(), Err(Error::Unassigned)));

    store.fail.store(false, Ordering::SeqCst);
    wait_for(&registrar, |i| i == Some(ShardInfo { shard: 0, num_shards: 1 })).await;
    assert!(registrar.metrics().heartbeat_failures.get() >= 2);

    registrar.stop(StopOptions::default()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_waits_for_in_flight_heartbeat() {
    let h = Harness::new();
    let store = Arc::new(FlakyStore::new(h.store.clone()));
    let registrar = h.registrar_on("a", store.clone());
    registrar.start().await.unwrap();
    wait_for(&registrar, |i| i.is_some()).await;

    let mut events = registrar.subscribe();
    store.stall.store(true, Ordering::SeqCst);
    store.fail.store(true, Ordering::SeqCst);
    tokio::time::sleep(HEARTBEAT * 2).await;

    registrar.stop(StopOptions::unregister()).await;
    assert_eq!(registrar.state(), RegistrarState::Stopped);
    assert!(matches!(registrar.shard_info(), Err(Error::Unassigned)));

    // Errors raised while stopping are not surfaced, including the failed
    // unregister.
    while let Ok(event) = events.try_recv() {
        assert!(
            matches!(event, RegistrarEvent::Error(_)),
            "unexpected event {:?}",
            event
        );
    }
    tokio::time::sleep(HEARTBEAT * 4).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(h.store.reservations("a").await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clean_stop_is_not_a_heartbeat_failure() {
    let h = Harness::new();
    let store = Arc::new(FlakyStore::new(h.store.clone()));
    let registrar = h.registrar_on("a", store.clone());
    registrar.start().await.unwrap();
    wait_for(&registrar, |i| i.is_some()).await;

    // Stop lands while a slow store call is in flight.
    store.stall.store(true, Ordering::SeqCst);
    tokio::time::sleep(HEARTBEAT * 2).await;
    registrar.stop(StopOptions::default()).await;

    let metrics = registrar.metrics();
    assert!(metrics.heartbeats.get() >= 2);
    assert_eq!(metrics.heartbeat_failures.get(), 0);
}

/// Returns a fixed own row, whatever the tables hold
struct FixedRowStore {
    inner: Arc<MemoryStore>,
    row: OwnReservation,
}

#[async_trait]
impl ShardStore for FixedRowStore {
    async fn upsert_cluster(&self, cluster: &str) -> Result<()> {
        self.inner.upsert_cluster(cluster).await
    }

    async fn register(&self, cluster: &str, holder: &str, lease: Duration) -> Result<()> {
        self.inner.register(cluster, holder, lease).await
    }

    async fn is_coordinator(&self, _cluster: &str, _holder: &str) -> Result<bool> {
        Ok(false)
    }

    async fn reshard(
        &self,
        cluster: &str,
        min_interval: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.reshard(cluster, min_interval).await
    }

    async fn own_reservation(
        &self,
        _cluster: &str,
        _holder: &str,
    ) -> Result<Option<OwnReservation>> {
        Ok(Some(self.row))
    }

    async fn unregister(&self, cluster: &str, holder: &str) -> Result<()> {
        self.inner.unregister(cluster, holder).await
    }

    async fn reservations(&self, cluster: &str) -> Result<Vec<Reservation>> {
        self.inner.reservations(cluster).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_out_of_range_read_back_is_reported() {
    let h = Harness::new();
    let store = Arc::new(FixedRowStore {
        inner: h.store.clone(),
        row: OwnReservation {
            shard: Some(3),
            num_shards: 2,
        },
    });
    let registrar = h.registrar_on("a", store);
    let mut events = registrar.subscribe();
    registrar.start().await.unwrap();

    for _ in 0..2 {
        let event = tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap().unwrap();
        match event {
            RegistrarEvent::Error(e) => {
                assert!(matches!(*e, Error::InvalidAssignment(_)), "{:?}", e);
                assert_eq!(e.to_string(), "Invalid assignment: shard is >= numShards: 3 >= 2");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(registrar.is_running());
    assert!(matches!(registrar.shard_info(), Err(Error::Unassigned)));

    registrar.stop(StopOptions::default()).await;
}

#[tokio::test]
async fn test_start_fails_when_listen_fails() {
    let h = Harness::new();
    let registrar =
        ShardRegistrar::new(fast_config("a"), h.store.clone(), Arc::new(DeadBus)).unwrap();

    let err = registrar.start().await.unwrap_err();
    assert!(matches!(err, Error::Bus(_)));
    assert_eq!(registrar.state(), RegistrarState::Stopped);
    assert!(h.store.reservations("a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let h = Harness::new();
    let config = fast_config(" ").with_heartbeat_interval(Duration::from_millis(50));
    let err = ShardRegistrar::new(config, h.store.clone(), h.bus.clone()).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    let config = fast_config("a").with_heartbeat_interval(Duration::ZERO);
    assert!(ShardRegistrar::new(config, h.store.clone(), h.bus.clone()).is_err());
}
