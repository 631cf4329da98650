//! Heartbeat loop
//!
//! One task per running registrar. It renews the lease, reshards when this
//! holder is the coordinator, reads back its own row and accepts pushed
//! assignments from the private channel.

use super::events::{parse_assignment, ShardInfo};
use super::lifecycle::Inner;
use crate::bus::{Notification, Subscription};
use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

const RESHARD_TARGET: &str = "shard_registrar::reshard";

pub(crate) async fn run(
    inner: Arc<Inner>,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next = Instant::now();
    let mut listening = true;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            notification = subscription.recv(), if listening => match notification {
                Some(notification) => on_notification(&inner, notification),
                None => {
                    if inner.is_running() {
                        tracing::warn!(
                            "Registrar {} lost its subscription; relying on heartbeats",
                            inner.prefix()
                        );
                    }
                    listening = false;
                }
            },

            _ = sleep_until(next) => {
                next = heartbeat(&inner).await;
            }
        }
    }

    tracing::debug!("Registrar {} heartbeat loop exited", inner.prefix());
}

/// Run one heartbeat cycle and return when the next one is due
async fn heartbeat(inner: &Inner) -> Instant {
    let started = Instant::now();
    let mut next = started + inner.config.heartbeat_interval;

    let result = register(inner).await;
    // A cycle cut short by `stop` is not a failure.
    let success = matches!(result, Ok(_) | Err(Error::NotRunning));
    match result {
        Ok(Some(reshard_at)) => {
            next = next.min(Instant::now() + until(reshard_at));
        }
        Ok(None) => {}
        Err(e) => inner.emit_error(e),
    }

    let elapsed = started.elapsed();
    tracing::debug!(
        "Registrar {} heartbeat {} in {:?}",
        inner.prefix(),
        if success { "ok" } else { "failed" },
        elapsed
    );
    inner.metrics.record_heartbeat(elapsed, success);
    next
}

fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// The store side of a heartbeat. Returns when a reshard may next run, if
/// this holder coordinated one.
async fn register(inner: &Inner) -> Result<Option<DateTime<Utc>>> {
    let cluster = inner.config.cluster.as_str();
    let holder = inner.holder.as_str();

    let upserted = inner.local().upserted_cluster;
    if !upserted {
        inner.ensure_running()?;
        inner.store.upsert_cluster(cluster).await?;
        inner.local().upserted_cluster = true;
    }

    inner.ensure_running()?;
    inner
        .store
        .register(cluster, holder, inner.config.lease_duration())
        .await?;

    inner.ensure_running()?;
    let mut reshard_at = None;
    if inner.store.is_coordinator(cluster, holder).await? {
        inner.ensure_running()?;
        reshard_at = inner
            .store
            .reshard(cluster, inner.config.reshard_interval)
            .await?;
        inner.metrics.reshards.inc();
        tracing::debug!(
            "Registrar {} coordinated cluster {}; next reshard {:?}",
            inner.prefix(),
            cluster,
            reshard_at
        );
        if tracing::enabled!(target: RESHARD_TARGET, tracing::Level::TRACE) {
            dump_reservations(inner).await;
        }
    }

    inner.ensure_running()?;
    if let Some(own) = inner.store.own_reservation(cluster, holder).await? {
        if let Some(shard) = own.shard {
            // Rejected values are reported but never applied.
            match ShardInfo::validate(f64::from(shard), f64::from(own.num_shards)) {
                Ok(info) => {
                    inner.set_shard(info);
                }
                Err(e) => inner.emit_error(e),
            }
        }
    }

    Ok(reshard_at)
}

async fn dump_reservations(inner: &Inner) {
    match inner.store.reservations(&inner.config.cluster).await {
        Ok(rows) => {
            let now = Utc::now();
            for row in rows {
                tracing::trace!(
                    target: RESHARD_TARGET,
                    cluster = %row.cluster,
                    holder = %row.holder,
                    shard = ?row.shard,
                    live = row.is_live(now),
                    expires_at = %row.expires_at,
                    "reservation"
                );
            }
        }
        Err(e) => tracing::debug!("Registrar {} failed to read reservations: {}", inner.prefix(), e),
    }
}

fn on_notification(inner: &Inner, notification: Notification) {
    match parse_assignment(&notification.channel, &notification.payload) {
        Ok(info) => {
            inner.set_shard(info);
        }
        Err(e) => {
            inner.metrics.notifications_rejected.inc();
            inner.emit_error(e);
        }
    }
}
