//! Postgres LISTEN/NOTIFY bus
//!
//! One dedicated LISTEN connection per bus, owned by a background task that
//! routes incoming notifications to subscriptions. `notify` goes through the
//! shared pool.

use super::{NotificationBus, Routes, Subscription};
use crate::common::{Error, Result};
use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Pause before polling a listener whose connection failed to come back
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

enum Command {
    Listen(String, oneshot::Sender<Result<()>>),
    Unlisten(String, oneshot::Sender<Result<()>>),
}

pub struct PgBus {
    pool: PgPool,
    routes: Arc<Routes>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl PgBus {
    /// Open the LISTEN connection from `pool` and start routing
    pub async fn connect(pool: PgPool) -> Result<Self> {
        let listener = PgListener::connect_with(&pool).await?;
        let routes = Arc::new(Routes::default());
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_listener(listener, rx, routes.clone()));

        Ok(Self {
            pool,
            routes,
            commands,
            task,
        })
    }

    async fn send(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(make(ack))
            .map_err(|_| Error::Bus("listener task has stopped".into()))?;
        done.await
            .map_err(|_| Error::Bus("listener task dropped the request".into()))?
    }
}

impl Drop for PgBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_listener(
    mut listener: PgListener,
    mut commands: mpsc::UnboundedReceiver<Command>,
    routes: Arc<Routes>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Listen(channel, ack)) => {
                    let _ = ack.send(listener.listen(&channel).await.map_err(Error::from));
                }
                Some(Command::Unlisten(channel, ack)) => {
                    let _ = ack.send(listener.unlisten(&channel).await.map_err(Error::from));
                }
                None => break,
            },
            received = listener.recv() => match received {
                Ok(notification) => {
                    let delivered = routes.dispatch(notification.channel(), notification.payload());
                    tracing::debug!(
                        channel = notification.channel(),
                        payload = notification.payload(),
                        delivered,
                        "notification"
                    );
                }
                Err(e) => {
                    tracing::warn!("LISTEN connection error: {}", e);
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            },
        }
    }
    tracing::debug!("LISTEN task stopped");
}

#[async_trait]
impl NotificationBus for PgBus {
    async fn listen(&self, channel: &str) -> Result<Subscription> {
        let subscription = self.routes.add(channel);
        let channel_name = channel.to_string();
        if let Err(e) = self.send(|ack| Command::Listen(channel_name, ack)).await {
            self.routes.remove(channel);
            return Err(e);
        }
        Ok(subscription)
    }

    async fn unlisten(&self, channel: &str) -> Result<()> {
        self.routes.remove(channel);
        let channel_name = channel.to_string();
        self.send(|ack| Command::Unlisten(channel_name, ack)).await
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
