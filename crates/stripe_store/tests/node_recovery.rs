//! Full-node recovery: a dead server's stripes are rebuilt by survivors
//! and streamed onto a promoted backup, after which the backup serves the
//! failed slot.

mod common;

use std::time::Duration;

use common::{wait_for, TestCluster};

fn value_for(i: usize) -> Vec<u8> {
    format!("rec-{i:04}-abcdefghijklmnopqrstuvwxyz012345").into_bytes()
}

#[test]
fn failed_server_is_rebuilt_onto_backup() {
    let mut cluster = TestCluster::start(2, 1, 256, 3, true);
    let backup_addr = cluster.backup_addr.expect("backup configured");
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let client = cluster.client().await;

        for i in 0..50 {
            let key = format!("rec-{i:04}").into_bytes();
            assert!(client.set(&key, &value_for(i)).await.unwrap());
        }
        // Seals, parity and coordinator metadata settle before the crash.
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Kill data server 0; the coordinator should promote the backup
        // and drive reconstruction onto it.
        cluster.kill_server(0);
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Route slot 0 to the backup and poll until its catch-up makes
        // every key readable again without the degraded path.
        client.adopt_promotion(0, backup_addr);
        for i in 0..50 {
            let key = format!("rec-{i:04}").into_bytes();
            let client = client.clone();
            wait_for("recovered key to be served", Duration::from_secs(20), move || {
                let client = client.clone();
                let key = key.clone();
                let expect = value_for(i);
                async move {
                    match client.get(&key).await {
                        Ok(Some(value)) => value == expect,
                        _ => false,
                    }
                }
            })
            .await;
        }
    });
}
