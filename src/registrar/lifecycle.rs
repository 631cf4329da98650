//! Registrar handle and lifecycle (start / stop / shard_info)

use super::events::{RegistrarEvent, RegistrarState, ShardInfo, StopOptions};
use super::heartbeat;
use crate::bus::{shard_channel, NotificationBus};
use crate::common::{holder_prefix, Error, RegistrarConfig, RegistrarMetrics, Result};
use crate::store::ShardStore;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};

const EVENT_CAPACITY: usize = 64;

/// Local, non-persisted view of this holder
#[derive(Debug)]
pub(crate) struct LocalState {
    pub(crate) state: RegistrarState,
    pub(crate) shard: Option<ShardInfo>,
    pub(crate) upserted_cluster: bool,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub(crate) struct Inner {
    pub(crate) config: RegistrarConfig,
    pub(crate) holder: String,
    pub(crate) channel: String,
    pub(crate) store: Arc<dyn ShardStore>,
    pub(crate) bus: Arc<dyn NotificationBus>,
    pub(crate) metrics: RegistrarMetrics,
    local: Mutex<LocalState>,
    events: broadcast::Sender<RegistrarEvent>,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

impl Inner {
    pub(crate) fn local(&self) -> MutexGuard<'_, LocalState> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn prefix(&self) -> &str {
        holder_prefix(&self.holder)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.local().state == RegistrarState::Running
    }

    /// Fails with `NotRunning` once a stop has begun
    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    /// Accept `info` if running and different from the held assignment.
    ///
    /// The state update and the event happen under one lock, so a
    /// `shard_info()` reader never sees one without the other.
    pub(crate) fn set_shard(&self, info: ShardInfo) -> bool {
        let mut local = self.local();
        if local.state != RegistrarState::Running || local.shard == Some(info) {
            return false;
        }
        local.shard = Some(info);
        self.metrics.shard_changes.inc();
        tracing::info!(
            "Registrar {} in cluster {}: shard {}",
            self.prefix(),
            self.config.cluster,
            info
        );
        let _ = self.events.send(RegistrarEvent::ShardChanged(info));
        true
    }

    /// Surface a non-fatal error, unless a stop has begun
    pub(crate) fn emit_error(&self, error: Error) {
        let local = self.local();
        if local.state != RegistrarState::Running {
            tracing::debug!("Registrar {} dropping error after stop: {}", self.prefix(), error);
            return;
        }
        tracing::warn!("Registrar {}: {}", self.prefix(), error);
        let _ = self.events.send(RegistrarEvent::Error(Arc::new(error)));
    }
}

/// One holder's membership in a cluster.
///
/// `start` subscribes to the holder's private channel and begins
/// heartbeating; assignments arrive as [`RegistrarEvent::ShardChanged`] and
/// through [`ShardRegistrar::shard_info`]. Store and bus are owned by the
/// embedder and may be shared by many registrars.
pub struct ShardRegistrar {
    inner: Arc<Inner>,
}

impl ShardRegistrar {
    pub fn new(
        config: RegistrarConfig,
        store: Arc<dyn ShardStore>,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<Self> {
        config.validate()?;
        let holder = uuid::Uuid::new_v4().to_string();
        let channel = shard_channel(&holder);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                holder,
                channel,
                store,
                bus,
                metrics: RegistrarMetrics::new(),
                local: Mutex::new(LocalState {
                    state: RegistrarState::Stopped,
                    shard: None,
                    upserted_cluster: false,
                }),
                events,
                worker: tokio::sync::Mutex::new(None),
            }),
        })
    }

    pub fn holder(&self) -> &str {
        &self.inner.holder
    }

    pub fn cluster(&self) -> &str {
        &self.inner.config.cluster
    }

    /// Private channel assignments are published on
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.inner.config
    }

    pub fn state(&self) -> RegistrarState {
        self.inner.local().state
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn metrics(&self) -> &RegistrarMetrics {
        &self.inner.metrics
    }

    /// Receive future events. Subscribe before `start` to see the first assignment.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistrarEvent> {
        self.inner.events.subscribe()
    }

    /// Future events as a stream; events missed by a lagging reader are skipped
    pub fn events(&self) -> impl Stream<Item = RegistrarEvent> {
        BroadcastStream::new(self.subscribe()).filter_map(|event| event.ok())
    }

    /// Current assignment, or `Unassigned` if none has been received
    pub fn shard_info(&self) -> Result<ShardInfo> {
        self.inner.local().shard.ok_or(Error::Unassigned)
    }

    /// Subscribe to the private channel, then heartbeat immediately and on
    /// every interval. No-op if already running.
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.inner.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }

        {
            let mut local = self.inner.local();
            local.state = RegistrarState::Starting;
            local.upserted_cluster = false;
        }

        let subscription = match self.inner.bus.listen(&self.inner.channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.inner.local().state = RegistrarState::Stopped;
                return Err(e);
            }
        };

        self.inner.local().state = RegistrarState::Running;
        tracing::info!(
            "Registrar {} joining cluster {} (heartbeat {:?}, lease {:?})",
            self.inner.prefix(),
            self.inner.config.cluster,
            self.inner.config.heartbeat_interval,
            self.inner.config.lease_duration()
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(heartbeat::run(
            self.inner.clone(),
            subscription,
            shutdown_rx,
        ));
        *worker = Some(Worker { shutdown, task });
        Ok(())
    }

    /// Stop heartbeating and drop the held assignment. Waits for the
    /// in-flight store operation; failures while stopping are logged and
    /// ignored. No-op if not running.
    pub async fn stop(&self, options: StopOptions) {
        let mut worker = self.inner.worker.lock().await;
        let Some(Worker { shutdown, task }) = worker.take() else {
            return;
        };

        {
            let mut local = self.inner.local();
            local.state = RegistrarState::Stopping;
            local.shard = None;
        }
        let _ = shutdown.send(true);

        if let Err(e) = self.inner.bus.unlisten(&self.inner.channel).await {
            tracing::debug!("Registrar {} failed to unlisten: {}", self.inner.prefix(), e);
        }
        if let Err(e) = task.await {
            tracing::debug!("Registrar {} heartbeat task ended abnormally: {}", self.inner.prefix(), e);
        }

        if options.unregister {
            let result = self
                .inner
                .store
                .unregister(&self.inner.config.cluster, &self.inner.holder)
                .await;
            if let Err(e) = result {
                tracing::debug!("Registrar {} failed to unregister: {}", self.inner.prefix(), e);
            }
        }

        self.inner.local().state = RegistrarState::Stopped;
        tracing::info!(
            "Registrar {} left cluster {}{}",
            self.inner.prefix(),
            self.inner.config.cluster,
            if options.unregister { " (unregistered)" } else { "" }
        );
    }
}

impl Drop for ShardRegistrar {
    fn drop(&mut self) {
        // Best effort: the lease simply expires.
        if let Ok(mut worker) = self.inner.worker.try_lock() {
            if let Some(worker) = worker.take() {
                worker.task.abort();
            }
        }
        let mut local = self.inner.local();
        local.state = RegistrarState::Stopped;
        local.shard = None;
    }
}

impl std::fmt::Debug for ShardRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRegistrar")
            .field("cluster", &self.inner.config.cluster)
            .field("holder", &self.inner.holder)
            .field("state", &self.state())
            .finish()
    }
}
