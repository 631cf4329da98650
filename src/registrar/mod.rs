//! Shard registrar
//!
//! A holder joins a cluster by renewing a lease in the shared store. The
//! first live holder in cluster order coordinates: it runs the reshard
//! function, which numbers live holders `0..N` and pushes `{shard, numShards}`
//! to each on its private channel. Every holder also reads its own row back
//! on each heartbeat, so a lost notification only delays an assignment.

mod events;
mod heartbeat;
mod lifecycle;

pub use events::{parse_assignment, RegistrarEvent, RegistrarState, ShardInfo, StopOptions};
pub use lifecycle::ShardRegistrar;
