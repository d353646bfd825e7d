//! In-process cluster harness for integration tests.
//!
//! Each storage node runs on its own dedicated runtime so a test can kill
//! it the way a process death would look to the rest of the cluster: every
//! socket drops at once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use stripe_coding::Scheme;
use stripe_store::client::Client;
use stripe_store::config::{ClusterConfig, CodingConfig, NodeTuning};
use stripe_store::proto::NodeRole;
use stripe_store::{coordinator, server};

pub fn pick_free_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    listener.local_addr().expect("local addr")
}

/// Tight intervals so failure detection and metadata sync converge fast in
/// tests.
pub fn test_tuning() -> NodeTuning {
    NodeTuning {
        chunk_pool_slots: 16,
        degraded_timeout: Duration::from_secs(5),
        sync_interval: Duration::from_millis(100),
        failure_check_interval: Duration::from_millis(100),
        announce_timeout: Duration::from_secs(5),
    }
}

pub struct TestCluster {
    pub cluster: ClusterConfig,
    pub coordinator_addr: SocketAddr,
    pub backup_addr: Option<SocketAddr>,
    coordinator_rt: Option<tokio::runtime::Runtime>,
    server_rts: Vec<Option<tokio::runtime::Runtime>>,
    backup_rt: Option<tokio::runtime::Runtime>,
}

impl TestCluster {
    /// Start a coordinator plus `num_servers` storage nodes (and optionally
    /// one idle backup). Call from a non-async context.
    pub fn start(k: u32, m: u32, chunk_size: usize, num_servers: usize, with_backup: bool) -> Self {
        let servers: Vec<SocketAddr> = (0..num_servers).map(|_| pick_free_port()).collect();
        let coordinator_addr = pick_free_port();
        let cluster = ClusterConfig {
            coding: CodingConfig { scheme: Scheme::Rs, k, m, chunk_size },
            num_lists: 1,
            servers: servers.clone(),
        };
        let tuning = test_tuning();

        let coordinator_rt = tokio::runtime::Runtime::new().expect("coordinator runtime");
        {
            let cluster = cluster.clone();
            coordinator_rt.spawn(async move {
                if let Err(err) = coordinator::run(cluster, tuning, coordinator_addr).await {
                    eprintln!("coordinator exited: {err:?}");
                }
            });
        }

        let mut server_rts = Vec::new();
        for addr in &servers {
            server_rts.push(Some(spawn_node(
                cluster.clone(),
                tuning,
                *addr,
                coordinator_addr,
                NodeRole::Server,
            )));
        }

        let (backup_rt, backup_addr) = if with_backup {
            let addr = pick_free_port();
            (
                Some(spawn_node(cluster.clone(), tuning, addr, coordinator_addr, NodeRole::Backup)),
                Some(addr),
            )
        } else {
            (None, None)
        };

        // Give registration and the first sync a moment.
        std::thread::sleep(Duration::from_millis(800));

        Self {
            cluster,
            coordinator_addr,
            backup_addr,
            coordinator_rt: Some(coordinator_rt),
            server_rts,
            backup_rt,
        }
    }

    pub async fn client(&self) -> Arc<Client> {
        Client::connect(self.cluster.clone(), self.coordinator_addr)
            .await
            .expect("client connects")
    }

    /// Kill one storage node: all of its connections drop at once.
    pub fn kill_server(&mut self, index: usize) {
        if let Some(rt) = self.server_rts[index].take() {
            rt.shutdown_background();
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for rt in self.server_rts.iter_mut().filter_map(Option::take) {
            rt.shutdown_background();
        }
        if let Some(rt) = self.backup_rt.take() {
            rt.shutdown_background();
        }
        if let Some(rt) = self.coordinator_rt.take() {
            rt.shutdown_background();
        }
    }
}

fn spawn_node(
    cluster: ClusterConfig,
    tuning: NodeTuning,
    listen: SocketAddr,
    coordinator_addr: SocketAddr,
    role: NodeRole,
) -> tokio::runtime::Runtime {
    let rt = tokio::runtime::Runtime::new().expect("node runtime");
    rt.spawn(async move {
        // The coordinator may not be accepting yet; retry briefly.
        for _ in 0..50 {
            match server::run(cluster.clone(), tuning, listen, coordinator_addr, role).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::debug!(error = %err, "node start retry");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        eprintln!("node at {listen} failed to start");
    });
    rt
}

/// Poll until `check` passes or the deadline lapses.
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
