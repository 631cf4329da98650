//! # shard-registrar
//!
//! Lease-based shard assignment for an elastic fleet of workers:
//! - Holders renew a lease in a shared store on every heartbeat
//! - The first live holder coordinates and reshards the cluster
//! - Assignments are pushed over per-holder notification channels
//! - Expired holders lose their shard and the survivors are renumbered
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!   │ holder A │   │ holder B │   │ holder C │
//!   │ shard 0  │   │ shard 1  │   │ shard 2  │
//!   └──┬───▲───┘   └──┬───▲───┘   └──┬───▲───┘
//!      │   │ shardInfo/<holder>      │   │
//!  heartbeat  │       │   │          │   │
//!   ┌──▼───┴──────────▼───┴──────────▼───┴───┐
//!   │   Shared store (Postgres)              │
//!   │   ShardReservationCluster              │
//!   │   ShardReservation                     │
//!   │   reshard_ShardReservations()          │
//!   └────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Apply the schema
//! ```bash
//! shard-registrar migrate --database-url postgres://localhost/app up
//! ```
//!
//! ### Join a cluster
//! ```bash
//! shard-registrar join \
//!   --database-url postgres://localhost/app \
//!   --cluster ingest \
//!   --heartbeat 10s
//! ```
//!
//! ### Embed
//! ```no_run
//! use shard_registrar::{MemoryBus, MemoryStore, RegistrarConfig, ShardRegistrar};
//! use std::sync::Arc;
//!
//! # async fn demo() -> shard_registrar::Result<()> {
//! let bus = Arc::new(MemoryBus::new());
//! let store = Arc::new(MemoryStore::new(bus.clone()));
//! let registrar = ShardRegistrar::new(RegistrarConfig::new("ingest"), store, bus)?;
//! let mut events = registrar.subscribe();
//! registrar.start().await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod common;
pub mod migrate;
pub mod registrar;
pub mod store;

// Re-export commonly used types
pub use bus::{MemoryBus, NotificationBus};
pub use common::{Config, Error, RegistrarConfig, Result};
pub use registrar::{RegistrarEvent, RegistrarState, ShardInfo, ShardRegistrar, StopOptions};
pub use store::{MemoryStore, ShardStore};

#[cfg(feature = "postgres")]
pub use bus::PgBus;
#[cfg(feature = "postgres")]
pub use store::PgStore;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
