//! Assignment values, payload validation and registrar events

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A holder's position in its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardInfo {
    pub shard: u32,
    pub num_shards: u32,
}

impl ShardInfo {
    /// Range-check a raw `(shard, numShards)` pair.
    ///
    /// `shard` must be a non-negative integer, `num_shards` a positive
    /// integer, and `shard < num_shards`.
    pub fn validate(shard: f64, num_shards: f64) -> Result<Self> {
        if !is_whole(shard) || shard < 0.0 || shard > u32::MAX as f64 {
            return Err(Error::InvalidAssignment(format!("invalid shard: {}", shard)));
        }
        if !is_whole(num_shards) || num_shards <= 0.0 || num_shards > u32::MAX as f64 {
            return Err(Error::InvalidAssignment(format!(
                "invalid numShards: {}",
                num_shards
            )));
        }
        if shard >= num_shards {
            return Err(Error::InvalidAssignment(format!(
                "shard is >= numShards: {} >= {}",
                shard, num_shards
            )));
        }
        Ok(Self {
            shard: shard as u32,
            num_shards: num_shards as u32,
        })
    }
}

impl std::fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.shard, self.num_shards)
    }
}

fn is_whole(n: f64) -> bool {
    n.is_finite() && n.fract() == 0.0
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentPayload {
    shard: f64,
    num_shards: f64,
}

/// Decode and validate an assignment received on `channel`
pub fn parse_assignment(channel: &str, payload: &str) -> Result<ShardInfo> {
    if payload.trim().is_empty() {
        return Err(Error::invalid_payload(channel, "empty payload"));
    }
    let raw: AssignmentPayload = serde_json::from_str(payload)
        .map_err(|e| Error::invalid_payload(channel, format!("{}: {}", e, payload)))?;
    ShardInfo::validate(raw.shard, raw.num_shards)
}

/// Lifecycle of a registrar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for RegistrarState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrarState::Stopped => write!(f, "stopped"),
            RegistrarState::Starting => write!(f, "starting"),
            RegistrarState::Running => write!(f, "running"),
            RegistrarState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Delivered to every subscriber of a registrar
#[derive(Debug, Clone)]
pub enum RegistrarEvent {
    /// A new assignment was accepted
    ShardChanged(ShardInfo),
    /// A heartbeat or an inbound notification failed; the registrar keeps running
    Error(Arc<Error>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Delete this holder's reservation instead of letting it expire
    pub unregister: bool,
}

impl StopOptions {
    pub fn unregister() -> Self {
        Self { unregister: true }
    }
}
