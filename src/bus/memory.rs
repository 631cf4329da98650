//! In-process notification bus

use super::{NotificationBus, Routes, Subscription};
use crate::common::Result;
use async_trait::async_trait;

/// Notification bus backed by in-process channels.
///
/// Shared by every registrar of one process, the same way a single
/// LISTEN connection would be.
#[derive(Debug, Default)]
pub struct MemoryBus {
    routes: Routes,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`
    pub fn listeners(&self, channel: &str) -> usize {
        self.routes.subscribers(channel)
    }
}

#[async_trait]
impl NotificationBus for MemoryBus {
    async fn listen(&self, channel: &str) -> Result<Subscription> {
        tracing::debug!(channel, "listen");
        Ok(self.routes.add(channel))
    }

    async fn unlisten(&self, channel: &str) -> Result<()> {
        tracing::debug!(channel, "unlisten");
        self.routes.remove(channel);
        Ok(())
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let delivered = self.routes.dispatch(channel, payload);
        tracing::debug!(channel, payload, delivered, "notify");
        Ok(())
    }
}
