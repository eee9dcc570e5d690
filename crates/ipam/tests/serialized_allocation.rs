//! Concurrency contract for the allocator owner task: parallel callers must
//! never observe the same position.

use std::collections::HashSet;
use std::sync::Arc;

use stevedore_core::{IpIndex, IP_INDEX_KEY};
use stevedore_ipam::spawn_allocator;
use stevedore_store::{collections, MemStore};

fn seeded_store(subnet: &str, index: u64) -> Arc<MemStore> {
    let store = Arc::new(MemStore::new());
    let idx = IpIndex { ip: String::new(), subnet: subnet.to_string(), index };
    stevedore_store::save(store.as_ref(), collections::IP_INDEX, IP_INDEX_KEY, &idx).unwrap();
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_parallel_allocations_are_distinct() {
    let store = seeded_store("10.0.0.0/16", 0);
    let handle = spawn_allocator(store, "10.0.0.0/16".parse().unwrap());

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let h = handle.clone();
            tokio::spawn(async move { h.allocate().await.unwrap() })
        })
        .collect();

    let mut positions = HashSet::new();
    let mut ips = HashSet::new();
    for t in futures::future::join_all(tasks).await {
        let lease = t.unwrap();
        assert!(positions.insert(lease.position), "duplicate position {}", lease.position);
        assert!(ips.insert(lease.ip), "duplicate address {}", lease.ip);
    }
    assert_eq!(positions.len(), 100);
}

#[tokio::test]
async fn commit_advances_the_persisted_cursor() {
    let store = seeded_store("10.0.0.0/24", 3);
    let handle = spawn_allocator(store.clone(), "10.0.0.0/24".parse().unwrap());

    let lease = handle.allocate().await.unwrap();
    assert_eq!(lease.position, 4);
    assert_eq!(lease.ip.to_string(), "10.0.0.4");
    handle.commit(lease).await.unwrap();

    let cur: IpIndex = stevedore_store::fetch(store.as_ref(), collections::IP_INDEX, IP_INDEX_KEY)
        .unwrap()
        .unwrap();
    assert_eq!(cur.index, 4);
    assert_eq!(cur.ip, "10.0.0.4");
    // subnet recorded on the cursor survives the commit
    assert_eq!(cur.subnet, "10.0.0.0/24");
}

#[tokio::test]
async fn out_of_order_commits_keep_the_high_water_mark() {
    let store = seeded_store("10.0.0.0/24", 0);
    let handle = spawn_allocator(store.clone(), "10.0.0.0/24".parse().unwrap());

    let first = handle.allocate().await.unwrap();
    let second = handle.allocate().await.unwrap();
    assert_eq!((first.position, second.position), (1, 2));
    handle.commit(second).await.unwrap();
    handle.commit(first).await.unwrap();

    let cur: IpIndex = stevedore_store::fetch(store.as_ref(), collections::IP_INDEX, IP_INDEX_KEY)
        .unwrap()
        .unwrap();
    assert_eq!(cur.index, 2, "late commit of an earlier lease must not rewind the cursor");

    // a new owner task on the same store must not reissue either position
    let respawned = spawn_allocator(store, "10.0.0.0/24".parse().unwrap());
    assert_eq!(respawned.allocate().await.unwrap().position, 3);
}

#[tokio::test]
async fn uncommitted_leases_stay_burned() {
    let store = seeded_store("10.0.0.0/24", 0);
    let handle = spawn_allocator(store, "10.0.0.0/24".parse().unwrap());

    let first = handle.allocate().await.unwrap();
    // first lease is dropped without commit; the next caller still moves on
    let second = handle.allocate().await.unwrap();
    assert_eq!(second.position, first.position + 1);
}
