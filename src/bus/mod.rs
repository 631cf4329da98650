//! Notification bus
//!
//! Per-holder publish/subscribe channels used to push new assignments. The
//! registrar only sees the [`NotificationBus`] capability:
//! - [`MemoryBus`]: in-process channels
//! - [`PgBus`]: Postgres LISTEN/NOTIFY (feature `postgres`)

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryBus;
#[cfg(feature = "postgres")]
pub use postgres::PgBus;

use crate::common::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Channel name carrying assignments for one holder
pub fn shard_channel(holder: &str) -> String {
    format!("shardInfo/{}", holder)
}

/// A message received on a channel. The payload is untrusted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Receiving end of a `listen` call
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next notification, or `None` once the channel was unlistened
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// Next already-delivered notification, without waiting
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }
}

#[async_trait]
pub trait NotificationBus: Send + Sync {
    /// Start receiving notifications on `channel`. Delivery is established
    /// when this returns.
    async fn listen(&self, channel: &str) -> Result<Subscription>;

    /// Stop delivery on `channel` and close its subscriptions
    async fn unlisten(&self, channel: &str) -> Result<()>;

    async fn notify(&self, channel: &str, payload: &str) -> Result<()>;
}

/// Channel → subscriber table shared by the bus implementations
#[derive(Debug, Default)]
pub(crate) struct Routes {
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Notification>>>>,
}

impl Routes {
    pub(crate) fn add(&self, channel: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.entry(channel.to_string()).or_default().push(tx);
        Subscription {
            channel: channel.to_string(),
            receiver: rx,
        }
    }

    /// Drop every subscriber of `channel`; returns whether any existed
    pub(crate) fn remove(&self, channel: &str) -> bool {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(channel).is_some()
    }

    /// Deliver to live subscribers; returns how many received it
    pub(crate) fn dispatch(&self, channel: &str, payload: &str) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let Some(senders) = channels.get_mut(channel) else {
            return 0;
        };
        let notification = Notification {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        senders.retain(|tx| tx.send(notification.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            channels.remove(channel);
        }
        delivered
    }

    pub(crate) fn subscribers(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(channel).map_or(0, Vec::len)
    }
}
