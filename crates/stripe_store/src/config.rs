//! Runtime configuration shared by both node roles.

use std::net::SocketAddr;
use std::time::Duration;

use stripe_coding::Scheme;

/// Stripe geometry and coding scheme.
#[derive(Debug, Clone, Copy)]
pub struct CodingConfig {
    pub scheme: Scheme,
    /// Data chunks per stripe.
    pub k: u32,
    /// Parity chunks per stripe.
    pub m: u32,
    /// Chunk capacity in bytes.
    pub chunk_size: usize,
}

impl CodingConfig {
    pub fn chunk_count(&self) -> u32 {
        self.k + self.m
    }
}

/// Cluster-wide layout every node agrees on.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub coding: CodingConfig,
    /// Number of stripe lists spreading load across servers.
    pub num_lists: u32,
    /// Server table; index in this list is the server's identity for
    /// stripe-list placement.
    pub servers: Vec<SocketAddr>,
}

/// Per-node tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct NodeTuning {
    /// Slots in the bounded chunk arena used for reconstruction staging.
    pub chunk_pool_slots: usize,
    /// How long a degraded reconstruction may stay parked before its
    /// waiters are failed back to the clients.
    pub degraded_timeout: Duration,
    /// Interval for the server -> coordinator metadata sync.
    pub sync_interval: Duration,
    /// How often the coordinator polls server liveness.
    pub failure_check_interval: Duration,
    /// Upper bound on waiting for the reconstruction announcement round.
    pub announce_timeout: Duration,
}

impl Default for NodeTuning {
    fn default() -> Self {
        Self {
            chunk_pool_slots: 64,
            degraded_timeout: Duration::from_secs(30),
            sync_interval: Duration::from_millis(500),
            failure_check_interval: Duration::from_secs(1),
            announce_timeout: Duration::from_secs(10),
        }
    }
}
