//! stripestore: a distributed erasure-coded key-value store.
//!
//! Every stripe of data is split into `k` data chunks protected by `m`
//! parity chunks. The interesting machinery is the degraded-operation
//! subsystem: GET/UPDATE/DELETE keep working while chunk-holding servers
//! are down, through coordinator-granted degraded locks, on-the-fly
//! erasure decoding on the storage nodes, and background full-node
//! recovery onto idle backups.

pub mod chunk;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod degraded;
pub mod degraded_map;
pub mod lock_table;
pub mod metadata;
pub mod pending;
pub mod proto;
pub mod recovery;
pub mod server;
pub mod stripe_list;
pub mod transport;
