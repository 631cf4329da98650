//! Shared helpers for the registrar integration tests

#![allow(dead_code)]

use shard_registrar::{
    MemoryBus, MemoryStore, RegistrarConfig, ShardInfo, ShardRegistrar, ShardStore,
};
use std::sync::Arc;
use std::time::Duration;

pub const HEARTBEAT: Duration = Duration::from_millis(50);
pub const GRACE: Duration = Duration::from_millis(150);
pub const RESHARD: Duration = Duration::from_millis(100);
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn fast_config(cluster: &str) -> RegistrarConfig {
    RegistrarConfig::new(cluster)
        .with_heartbeat_interval(HEARTBEAT)
        .with_grace_period(GRACE)
        .with_reshard_interval(RESHARD)
}

pub struct Harness {
    pub bus: Arc<MemoryBus>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::new(bus.clone()));
        Self { bus, store }
    }

    pub fn registrar(&self, cluster: &str) -> ShardRegistrar {
        ShardRegistrar::new(fast_config(cluster), self.store.clone(), self.bus.clone()).unwrap()
    }

    pub fn registrar_on(&self, cluster: &str, store: Arc<dyn ShardStore>) -> ShardRegistrar {
        ShardRegistrar::new(fast_config(cluster), store, self.bus.clone()).unwrap()
    }
}

/// Poll until `pred` holds for the registrar's assignment
pub async fn wait_for(
    registrar: &ShardRegistrar,
    pred: impl Fn(Option<ShardInfo>) -> bool,
) -> Option<ShardInfo> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let info = registrar.shard_info().ok();
        if pred(info) {
            return info;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "registrar {} stuck at {:?}",
                registrar.holder(),
                info
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until every registrar holds a distinct shard of `0..len`
pub async fn wait_converged(registrars: &[&ShardRegistrar]) -> Vec<ShardInfo> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let assigned: Vec<Option<ShardInfo>> =
            registrars.iter().map(|r| r.shard_info().ok()).collect();
        if let Some(infos) = converged(&assigned) {
            return infos;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("cluster did not converge: {:?}", assigned);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn converged(assigned: &[Option<ShardInfo>]) -> Option<Vec<ShardInfo>> {
    let infos: Vec<ShardInfo> = assigned.iter().copied().collect::<Option<_>>()?;
    let n = infos.len() as u32;
    let mut shards: Vec<u32> = infos.iter().map(|i| i.shard).collect();
    shards.sort_unstable();
    let distinct = shards.iter().copied().eq(0..n);
    (distinct && infos.iter().all(|i| i.num_shards == n)).then_some(infos)
}
