//! Integration tests for replicated stores.
//!
//! Tests cover:
//! - Convergence of several replicas under any delivery order
//! - Deletes surviving late or out-of-order delivery
//! - Heads staying an anti-chain of the DAG
//! - Per-replica data filters
//! - Live replication over the broadcast hub
//! - Persistence through the sled datastore

use mdcs_core::Key;
use mdcs_db::{
    DbError, MemoryDatastore, SledDatastore, Store, StoreConfig, StoreConfigBuilder, WriteBatch,
};
use mdcs_delta::{Element, Tombstone};
use mdcs_merkle::{BroadcastNetwork, Cid, DagService, MemoryBroadcaster, MemoryDag};
use std::sync::Arc;
use std::time::Duration;

type TestStore = Store<MemoryDatastore, MemoryDag, MemoryBroadcaster>;

fn replica(dag: &MemoryDag, network: &BroadcastNetwork, name: &str) -> TestStore {
    Store::new(
        "/kv",
        Arc::new(MemoryDatastore::new()),
        Arc::new(dag.connect()),
        Arc::new(network.join(name)),
        StoreConfigBuilder::new().replica_id(name).build(),
    )
}

async fn node_bytes(dag: &MemoryDag, cid: &Cid) -> Vec<u8> {
    dag.get(cid).await.unwrap().encode().unwrap()
}

fn assert_anti_chain(dag: &MemoryDag, heads: &[Cid]) {
    for head in heads {
        let ancestors = dag.ancestors(head);
        for other in heads {
            assert!(!ancestors.contains(other), "head is an ancestor of another head");
        }
    }
}

fn reject(element: &Element) -> Option<Vec<Tombstone>> {
    Some(vec![Tombstone::for_element(element)])
}

#[tokio::test]
async fn test_heads_follow_local_writes() {
    let dag = MemoryDag::new();
    let store = replica(&dag, &BroadcastNetwork::new(), "a");

    let first = store.put("k", b"1".to_vec()).await.unwrap();
    assert_eq!(store.heads().unwrap(), (vec![first], 0));

    let second = store.put("k", b"2".to_vec()).await.unwrap();
    assert_eq!(store.heads().unwrap(), (vec![second], 1));
    assert_eq!(store.get("k").unwrap(), b"2");

    let stats = store.stats().unwrap();
    assert_eq!(stats.heads, 1);
    assert_eq!(stats.max_height, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_concurrent_writers_converge_in_any_order() {
    let dag = MemoryDag::new();
    let network = BroadcastNetwork::new();
    let writers = [
        replica(&dag, &network, "a"),
        replica(&dag, &network, "b"),
        replica(&dag, &network, "c"),
    ];

    let mut payloads = Vec::new();
    for (i, writer) in writers.iter().enumerate() {
        writer.put("shared", format!("from-{}", i)).await.unwrap();
        let cid = writer.put(format!("own/{}", i), b"x".to_vec()).await.unwrap();
        payloads.push(node_bytes(&dag, &cid).await);
    }

    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    let mut results = Vec::new();
    for order in orders {
        let reader = replica(&dag, &network, "reader");
        for i in order {
            reader.handle_remote(&payloads[i]).await.unwrap();
        }
        let (heads, max_height) = reader.heads().unwrap();
        assert_eq!(heads.len(), 3);
        assert_eq!(max_height, 1);
        assert_anti_chain(&dag, &heads);
        results.push((reader.query(Key::root()).unwrap(), heads));
    }

    for result in &results[1..] {
        assert_eq!(result, &results[0]);
    }
    assert_eq!(results[0].0.len(), 4);
}

#[tokio::test]
async fn test_replicas_exchange_heads_and_agree() {
    let dag = MemoryDag::new();
    let network = BroadcastNetwork::new();
    let a = replica(&dag, &network, "a");
    let b = replica(&dag, &network, "b");

    let a_head = a.put("k", b"from-a".to_vec()).await.unwrap();
    let b_head = b.put("k", b"from-b".to_vec()).await.unwrap();

    b.handle_remote(&node_bytes(&dag, &a_head).await).await.unwrap();
    a.handle_remote(&node_bytes(&dag, &b_head).await).await.unwrap();

    assert_eq!(a.heads().unwrap(), b.heads().unwrap());
    assert_eq!(a.get("k").unwrap(), b.get("k").unwrap());

    // The next write on either side merges both branches
    let merged = a.put("k", b"after".to_vec()).await.unwrap();
    assert_eq!(a.heads().unwrap(), (vec![merged], 1));
    b.handle_remote(&node_bytes(&dag, &merged).await).await.unwrap();
    assert_eq!(b.heads().unwrap(), (vec![merged], 1));
    assert_eq!(b.get("k").unwrap(), b"after");
}

#[tokio::test]
async fn test_gap_repair_pulls_missing_ancestors() {
    let dag = MemoryDag::new();
    let network = BroadcastNetwork::new();
    let a = replica(&dag, &network, "a");
    let b = replica(&dag, &network, "b");

    let mut last = a.put("k", b"0".to_vec()).await.unwrap();
    for i in 1..5 {
        last = a.put(format!("k{}", i), b"v".to_vec()).await.unwrap();
    }

    let outcomes = b.handle_remote(&node_bytes(&dag, &last).await).await.unwrap();
    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.windows(2).all(|w| w[0].height < w[1].height));
    assert_eq!(b.heads().unwrap(), (vec![last], 4));
    assert_eq!(b.query(Key::root()).unwrap(), a.query(Key::root()).unwrap());
}

#[tokio::test]
async fn test_delete_is_not_resurrected() {
    let dag = MemoryDag::new();
    let network = BroadcastNetwork::new();
    let a = replica(&dag, &network, "a");
    let b = replica(&dag, &network, "b");
    let c = replica(&dag, &network, "c");

    let put = a.put("k", b"v".to_vec()).await.unwrap();
    b.handle_remote(&node_bytes(&dag, &put).await).await.unwrap();
    let delete = b.delete("k").await.unwrap();
    assert!(b.get("k").unwrap_err().is_not_found());

    // C hears about the delete first, then the original write
    c.handle_remote(&node_bytes(&dag, &delete).await).await.unwrap();
    c.handle_remote(&node_bytes(&dag, &put).await).await.unwrap();
    assert!(!c.has("k").unwrap());
    assert_eq!(c.heads().unwrap(), (vec![delete], 1));

    // A applies the delete on top of its own write
    a.handle_remote(&node_bytes(&dag, &delete).await).await.unwrap();
    assert!(!a.has("k").unwrap());
}

#[tokio::test]
async fn test_delete_missing_key() {
    let dag = MemoryDag::new();
    let store = replica(&dag, &BroadcastNetwork::new(), "a");

    assert!(matches!(store.delete("nope").await, Err(DbError::NotFound(_))));
    assert!(store.heads().unwrap().0.is_empty());
}

#[tokio::test]
async fn test_query_and_batches() {
    let dag = MemoryDag::new();
    let store = replica(&dag, &BroadcastNetwork::new(), "a");

    store
        .put_batch(
            WriteBatch::new()
                .put("users/1", b"ada".to_vec())
                .put("users/2", b"bob".to_vec())
                .put("usersx", b"other".to_vec()),
        )
        .await
        .unwrap();
    let cid = store
        .put_batch(WriteBatch::new().delete("users/2").delete("users/9"))
        .await
        .unwrap();

    let users = store.query("users").unwrap();
    assert_eq!(users, vec![(Key::new("users/1"), b"ada".to_vec())]);
    assert_eq!(store.query(Key::root()).unwrap().len(), 2);
    assert_eq!(store.heads().unwrap(), (vec![cid], 1));
}

#[tokio::test]
async fn test_batch_of_absent_deletes() {
    let dag = MemoryDag::new();
    let store = replica(&dag, &BroadcastNetwork::new(), "a");
    store.put("k", b"v".to_vec()).await.unwrap();
    let before = store.heads().unwrap();

    let err = store
        .put_batch(WriteBatch::new().delete("gone").delete("missing"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(
        store.put_batch(WriteBatch::new()).await,
        Err(DbError::UnsupportedOperation(_))
    ));
    assert_eq!(store.heads().unwrap(), before);
    assert_eq!(store.get("k").unwrap(), b"v");
}

#[tokio::test]
async fn test_reserved_keys() {
    let dag = MemoryDag::new();
    let store = replica(&dag, &BroadcastNetwork::new(), "a");

    assert!(matches!(
        store.put("heads/x", b"v".to_vec()).await,
        Err(DbError::InvalidKey(_))
    ));
    store.put("a", b"v".to_vec()).await.unwrap();
    // Bookkeeping entries never show up as records
    assert_eq!(store.query(Key::root()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_replica_filter_hides_rejected_keys() {
    let dag = MemoryDag::new();
    let network = BroadcastNetwork::new();
    let a = replica(&dag, &network, "a");
    let b = replica(&dag, &network, "b");
    b.filter()
        .register_element_filter("^/secret/", reject)
        .unwrap();

    let head = a.put("secret/plan", b"x".to_vec()).await.unwrap();
    a.put("public", b"y".to_vec()).await.unwrap();
    let last = a.heads().unwrap().0[0];

    let outcomes = b.handle_remote(&node_bytes(&dag, &last).await).await.unwrap();
    assert_eq!(outcomes[0].cid, head);
    assert_eq!(outcomes[0].filtered, 1);

    assert_eq!(a.get("secret/plan").unwrap(), b"x");
    assert!(!b.has("secret/plan").unwrap());
    assert_eq!(b.get("public").unwrap(), b"y");
    // Heads still track the author's nodes
    assert_eq!(a.heads().unwrap(), b.heads().unwrap());
}

#[tokio::test]
async fn test_local_filter_applies_before_persisting() {
    let dag = MemoryDag::new();
    let network = BroadcastNetwork::new();
    let a = replica(&dag, &network, "a");
    let b = replica(&dag, &network, "b");
    a.filter().register_element_filter("^/tmp/", reject).unwrap();

    let head = a.put("tmp/scratch", b"x".to_vec()).await.unwrap();
    assert!(!a.has("tmp/scratch").unwrap());

    // The stored node already carries the tombstone
    b.handle_remote(&node_bytes(&dag, &head).await).await.unwrap();
    assert!(!b.has("tmp/scratch").unwrap());
}

#[tokio::test]
async fn test_reject_by_default() {
    let dag = MemoryDag::new();
    let store: TestStore = Store::new(
        "/kv",
        Arc::new(MemoryDatastore::new()),
        Arc::new(dag.connect()),
        Arc::new(BroadcastNetwork::new().join("a")),
        StoreConfigBuilder::new().accept_by_default(false).build(),
    );

    store.put("k", b"v".to_vec()).await.unwrap();
    assert!(!store.has("k").unwrap());
}

#[tokio::test]
async fn test_live_replication_over_broadcast() {
    let dag = MemoryDag::new();
    let network = BroadcastNetwork::new();
    let a = replica(&dag, &network, "a");
    let b = replica(&dag, &network, "b");
    let task = b.subscribe().await.unwrap();

    a.put("k", b"live".to_vec()).await.unwrap();

    let mut seen = false;
    for _ in 0..100 {
        if b.has("k").unwrap() {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen);
    assert_eq!(b.heads().unwrap(), a.heads().unwrap());
    task.abort();
}

#[tokio::test]
async fn test_run_drains_until_closed() {
    let dag = MemoryDag::new();
    let network = BroadcastNetwork::new();
    let a = replica(&dag, &network, "a");
    let b = replica(&dag, &network, "b");

    let first = a.put("x", b"1".to_vec()).await.unwrap();
    let second = a.put("y", b"2".to_vec()).await.unwrap();

    let (sender, receiver) = tokio::sync::mpsc::channel(8);
    sender.send(node_bytes(&dag, &first).await).await.unwrap();
    sender.send(b"garbage".to_vec()).await.unwrap();
    sender.send(node_bytes(&dag, &second).await).await.unwrap();
    drop(sender);

    assert_eq!(b.run(receiver).await, 2);
    assert_eq!(b.query(Key::root()).unwrap().len(), 2);
}

#[tokio::test]
async fn test_namespaces_share_backends() {
    let dag = MemoryDag::new();
    let network = BroadcastNetwork::new();
    let datastore = Arc::new(MemoryDatastore::new());
    let open = |ns: &str| -> TestStore {
        Store::new(
            ns,
            Arc::clone(&datastore),
            Arc::new(dag.connect()),
            Arc::new(network.join(ns)),
            StoreConfig::default(),
        )
    };
    let users = open("/users");
    let orders = open("/orders");

    users.put("k", b"u".to_vec()).await.unwrap();
    orders.put("k", b"o".to_vec()).await.unwrap();

    assert_eq!(users.get("k").unwrap(), b"u");
    assert_eq!(orders.get("k").unwrap(), b"o");
    assert_ne!(users.heads().unwrap(), orders.heads().unwrap());
}

#[tokio::test]
async fn test_sled_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv");
    let dag = MemoryDag::new();
    let network = BroadcastNetwork::new();

    let head = {
        let store = Store::new(
            "/kv",
            Arc::new(SledDatastore::open(&path).unwrap()),
            Arc::new(dag.connect()),
            Arc::new(network.join("a")),
            StoreConfig::default(),
        );
        store.put("k", b"durable".to_vec()).await.unwrap()
    };

    let store = Store::new(
        "/kv",
        Arc::new(SledDatastore::open(&path).unwrap()),
        Arc::new(dag.connect()),
        Arc::new(network.join("a")),
        StoreConfig::default(),
    );
    assert_eq!(store.get("k").unwrap(), b"durable");
    assert_eq!(store.heads().unwrap(), (vec![head], 0));
    assert!(store.engine().is_processed(&head));
}
