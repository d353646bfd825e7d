//! Node binary: one executable, role picked by subcommand.

use std::net::SocketAddr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stripe_store::config::{ClusterConfig, CodingConfig, NodeTuning};
use stripe_store::proto::NodeRole;
use stripe_store::{coordinator, server};

#[derive(Parser)]
#[command(name = "stripe-store-node", about = "Erasure-coded distributed KV store node")]
struct Args {
    /// Coding scheme: raid0, raid1, raid5 or rs.
    #[arg(long, default_value = "rs")]
    scheme: stripe_coding::Scheme,

    /// Data chunks per stripe.
    #[arg(long, default_value_t = 4)]
    k: u32,

    /// Parity chunks per stripe.
    #[arg(long, default_value_t = 2)]
    m: u32,

    /// Chunk capacity in bytes.
    #[arg(long, default_value_t = 1 << 16)]
    chunk_size: usize,

    /// Number of stripe lists.
    #[arg(long, default_value_t = 8)]
    num_lists: u32,

    /// Comma-separated server table, index-ordered.
    #[arg(long, value_delimiter = ',', required = true)]
    servers: Vec<SocketAddr>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run the coordinator.
    Coordinator {
        #[arg(long)]
        listen: SocketAddr,
    },
    /// Run a storage node. `listen` must be one of the table addresses.
    Server {
        #[arg(long)]
        listen: SocketAddr,
        #[arg(long)]
        coordinator: SocketAddr,
    },
    /// Run an idle backup node awaiting promotion.
    Backup {
        #[arg(long)]
        listen: SocketAddr,
        #[arg(long)]
        coordinator: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let cluster = ClusterConfig {
        coding: CodingConfig {
            scheme: args.scheme,
            k: args.k,
            m: args.m,
            chunk_size: args.chunk_size,
        },
        num_lists: args.num_lists,
        servers: args.servers,
    };
    let tuning = NodeTuning::default();

    match args.role {
        Role::Coordinator { listen } => coordinator::run(cluster, tuning, listen).await,
        Role::Server { listen, coordinator } => {
            server::run(cluster, tuning, listen, coordinator, NodeRole::Server).await
        }
        Role::Backup { listen, coordinator } => {
            server::run(cluster, tuning, listen, coordinator, NodeRole::Backup).await
        }
    }
}
