//! Round trips through the normal (non-degraded) path, including seals and
//! parity-delta forwarding.

mod common;

use std::time::Duration;

use common::TestCluster;

fn value_for(i: usize) -> Vec<u8> {
    format!("value-{i:04}-abcdefghijklmnopqrstuvwxyz").into_bytes()
}

#[test]
fn set_get_update_delete_round_trip() {
    let cluster = TestCluster::start(2, 1, 256, 3, false);
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let client = cluster.client().await;

        for i in 0..40 {
            let key = format!("key-{i:04}").into_bytes();
            assert!(client.set(&key, &value_for(i)).await.unwrap(), "set {i}");
        }

        for i in 0..40 {
            let key = format!("key-{i:04}").into_bytes();
            let got = client.get(&key).await.unwrap();
            assert_eq!(got.as_deref(), Some(value_for(i).as_slice()), "get {i}");
        }
        assert_eq!(client.get(b"no-such-key").await.unwrap(), None);

        // In-place value update, sealed or unsealed.
        let key = b"key-0007".to_vec();
        assert!(client.update(&key, 6, b"XXXX").await.unwrap());
        let mut expect = value_for(7);
        expect[6..10].copy_from_slice(b"XXXX");
        assert_eq!(client.get(&key).await.unwrap().as_deref(), Some(expect.as_slice()));

        // Delete compacts and the key stops resolving.
        assert!(client.delete(b"key-0011").await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.get(b"key-0011").await.unwrap(), None);
        // Neighbours survive the compaction.
        assert_eq!(
            client.get(b"key-0012").await.unwrap().as_deref(),
            Some(value_for(12).as_slice())
        );
    });
}
