//! Address allocation from a managed subnet.
//!
//! The persisted cursor hands out host positions that are never reclaimed:
//! a failed create burns its position rather than risking a reused address.
//! All allocate/commit traffic is serialized through one task owning the
//! cursor (see [`spawn_allocator`]) so concurrent creates cannot observe the
//! same position.

#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use metrics::counter;
use stevedore_core::{IpIndex, ProvisionError, ProvisionResult, IP_INDEX_KEY};
use stevedore_store::{collections, Store};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Number of host bits in the subnet.
pub fn host_bits(subnet: &IpNetwork) -> u32 {
    match subnet {
        IpNetwork::V4(n) => 32 - u32::from(n.prefix()),
        IpNetwork::V6(n) => 128 - u32::from(n.prefix()),
    }
}

/// Place `pos` into the host bits of the subnet base address, leaving the
/// network bits untouched. Positions past the host space fail with
/// `SubnetExhausted` instead of wrapping into network bits. The all-zeros
/// and all-ones host positions (network and v4 broadcast addresses) are not
/// excluded; the cursor hands out the full host range.
pub fn address_at(subnet: &IpNetwork, pos: u64) -> ProvisionResult<IpAddr> {
    let bits = host_bits(subnet);
    let exhausted = || ProvisionError::SubnetExhausted { subnet: subnet.to_string(), position: pos };
    match subnet {
        IpNetwork::V4(n) => {
            // bits <= 32, so the capacity always fits a u64
            if pos >= 1u64 << bits {
                return Err(exhausted());
            }
            let base = u32::from(n.network());
            Ok(IpAddr::V4((base | pos as u32).into()))
        }
        IpNetwork::V6(n) => {
            if bits < 64 && pos >= 1u64 << bits {
                return Err(exhausted());
            }
            let base = u128::from(n.network());
            Ok(IpAddr::V6((base | pos as u128).into()))
        }
    }
}

/// Cursor-based allocator. `allocate` computes the next position without
/// persisting; `update_index` commits it, and must run exactly once per
/// allocation that was actually used — never on failure.
///
/// The read-then-commit sequence is not safe under concurrent callers; go
/// through [`spawn_allocator`] unless allocation is already single-threaded.
pub struct IpAllocator {
    store: Arc<dyn Store>,
    subnet: IpNetwork,
}

impl IpAllocator {
    pub fn new(store: Arc<dyn Store>, subnet: IpNetwork) -> Self {
        Self { store, subnet }
    }

    pub fn subnet(&self) -> &IpNetwork {
        &self.subnet
    }

    fn read_cursor(&self) -> ProvisionResult<IpIndex> {
        let cur: Option<IpIndex> =
            stevedore_store::fetch(self.store.as_ref(), collections::IP_INDEX, IP_INDEX_KEY)
                .map_err(|e| ProvisionError::AllocationRead(e.to_string()))?;
        cur.ok_or_else(|| {
            ProvisionError::AllocationRead(format!("cursor {IP_INDEX_KEY} not seeded"))
        })
    }

    /// Next free position and its address. Does not advance the cursor.
    pub fn allocate(&self) -> ProvisionResult<(IpAddr, u64)> {
        let cursor = self.read_cursor()?;
        let pos = cursor.index + 1;
        let ip = address_at(&self.subnet, pos)?;
        Ok((ip, pos))
    }

    /// Commit a used position. Keeps the subnet recorded on the cursor.
    /// Commits can arrive out of allocation order; one behind the persisted
    /// high-water mark is dropped so the cursor never moves backwards.
    pub fn update_index(&self, ip: &IpAddr, pos: u64) -> ProvisionResult<()> {
        let (subnet, floor) = match self.read_cursor() {
            Ok(cur) => (cur.subnet, cur.index),
            Err(_) => (self.subnet.to_string(), 0),
        };
        if pos <= floor {
            debug!(index = floor, pos, "stale commit; cursor already ahead");
            return Ok(());
        }
        let update = IpIndex { ip: ip.to_string(), subnet, index: pos };
        stevedore_store::save(self.store.as_ref(), collections::IP_INDEX, IP_INDEX_KEY, &update)?;
        info!(ip = %update.ip, index = pos, "allocation cursor advanced");
        Ok(())
    }

    /// Seed the cursor at zero if the subnet has never handed out an
    /// address. Existing cursors are left alone.
    pub fn seed(&self) -> ProvisionResult<bool> {
        if self.read_cursor().is_ok() {
            return Ok(false);
        }
        let idx = IpIndex { ip: String::new(), subnet: self.subnet.to_string(), index: 0 };
        stevedore_store::save(self.store.as_ref(), collections::IP_INDEX, IP_INDEX_KEY, &idx)?;
        Ok(true)
    }
}

/// An allocated but not necessarily committed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub ip: IpAddr,
    pub position: u64,
}

enum Request {
    Allocate(oneshot::Sender<ProvisionResult<Lease>>),
    Commit(Lease, oneshot::Sender<ProvisionResult<()>>),
}

/// Cloneable handle to the single allocator owner task.
#[derive(Clone)]
pub struct AllocatorHandle {
    tx: mpsc::Sender<Request>,
}

impl AllocatorHandle {
    pub async fn allocate(&self) -> ProvisionResult<Lease> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Allocate(tx))
            .await
            .map_err(|_| ProvisionError::AllocationRead("allocator task stopped".to_string()))?;
        rx.await
            .map_err(|_| ProvisionError::AllocationRead("allocator task stopped".to_string()))?
    }

    pub async fn commit(&self, lease: Lease) -> ProvisionResult<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Commit(lease, tx))
            .await
            .map_err(|_| ProvisionError::Persistence("allocator task stopped".to_string()))?;
        rx.await
            .map_err(|_| ProvisionError::Persistence("allocator task stopped".to_string()))?
    }
}

/// Spawn the cursor owner. The task loads the persisted cursor on first use
/// and hands out strictly increasing positions from then on; positions whose
/// lease is never committed stay burned, matching the no-reclaim contract.
pub fn spawn_allocator(store: Arc<dyn Store>, subnet: IpNetwork) -> AllocatorHandle {
    let cap = std::env::var("STEVEDORE_ALLOC_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(64);
    let (tx, mut rx) = mpsc::channel::<Request>(cap);
    let allocator = IpAllocator::new(store, subnet);

    tokio::spawn(async move {
        let mut next: Option<u64> = None;
        while let Some(req) = rx.recv().await {
            match req {
                Request::Allocate(reply) => {
                    let pos = match next {
                        Some(n) => Ok(n),
                        None => allocator.read_cursor().map(|c| c.index + 1),
                    };
                    let res = pos.and_then(|p| {
                        let ip = address_at(allocator.subnet(), p)?;
                        next = Some(p + 1);
                        counter!("ipam_alloc_total", 1u64);
                        Ok(Lease { ip, position: p })
                    });
                    if let Err(e) = &res {
                        warn!(error = %e, "allocation failed");
                    }
                    let _ = reply.send(res);
                }
                Request::Commit(lease, reply) => {
                    let res = allocator.update_index(&lease.ip, lease.position);
                    if res.is_ok() {
                        counter!("ipam_commit_total", 1u64);
                    }
                    let _ = reply.send(res);
                }
            }
        }
        info!("allocator task stopped");
    });

    AllocatorHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_store::MemStore;

    fn subnet(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn seeded(subnet_s: &str, index: u64) -> Arc<MemStore> {
        let store = Arc::new(MemStore::new());
        let idx = IpIndex { ip: String::new(), subnet: subnet_s.to_string(), index };
        stevedore_store::save(store.as_ref(), collections::IP_INDEX, IP_INDEX_KEY, &idx).unwrap();
        store
    }

    #[test]
    fn position_lands_in_host_bits() {
        let n = subnet("10.0.0.0/24");
        assert_eq!(address_at(&n, 5).unwrap().to_string(), "10.0.0.5");
        let wide = subnet("10.0.0.0/16");
        assert_eq!(address_at(&wide, 260).unwrap().to_string(), "10.0.1.4");
    }

    #[test]
    fn network_bits_stay_untouched() {
        let n = subnet("192.168.7.0/24");
        assert_eq!(address_at(&n, 200).unwrap().to_string(), "192.168.7.200");
    }

    #[test]
    fn v6_positions_work() {
        let n = subnet("fd00::/64");
        assert_eq!(address_at(&n, 5).unwrap().to_string(), "fd00::5");
    }

    #[test]
    fn past_capacity_is_subnet_exhausted() {
        let n = subnet("192.168.1.0/24");
        assert!(address_at(&n, 255).is_ok());
        match address_at(&n, 256) {
            Err(ProvisionError::SubnetExhausted { position, .. }) => assert_eq!(position, 256),
            other => panic!("expected SubnetExhausted, got {:?}", other),
        }
    }

    #[test]
    fn allocate_is_cursor_plus_one() {
        let store = seeded("10.0.0.0/24", 7);
        let alloc = IpAllocator::new(store, subnet("10.0.0.0/24"));
        let (ip, pos) = alloc.allocate().unwrap();
        assert_eq!(pos, 8);
        assert_eq!(ip.to_string(), "10.0.0.8");
    }

    #[test]
    fn unseeded_cursor_is_allocation_read_error() {
        let alloc = IpAllocator::new(Arc::new(MemStore::new()), subnet("10.0.0.0/24"));
        assert!(matches!(alloc.allocate(), Err(ProvisionError::AllocationRead(_))));
    }

    #[test]
    fn committed_positions_are_never_reissued() {
        let store = seeded("10.0.0.0/24", 0);
        let alloc = IpAllocator::new(store, subnet("10.0.0.0/24"));
        let (ip, pos) = alloc.allocate().unwrap();
        alloc.update_index(&ip, pos).unwrap();
        let (_, pos2) = alloc.allocate().unwrap();
        assert_eq!(pos2, pos + 1);
    }

    #[test]
    fn reverse_order_commits_never_regress_the_cursor() {
        let net = subnet("10.0.0.0/24");
        let store = seeded("10.0.0.0/24", 0);
        let alloc = IpAllocator::new(store.clone(), net);
        alloc.update_index(&address_at(&net, 2).unwrap(), 2).unwrap();
        alloc.update_index(&address_at(&net, 1).unwrap(), 1).unwrap();

        let cur: IpIndex =
            stevedore_store::fetch(store.as_ref(), collections::IP_INDEX, IP_INDEX_KEY)
                .unwrap()
                .unwrap();
        assert_eq!(cur.index, 2);
        assert_eq!(cur.ip, "10.0.0.2");
        // a fresh reader of the cursor moves past both committed positions
        assert_eq!(alloc.allocate().unwrap().1, 3);
    }

    #[test]
    fn seed_only_writes_once() {
        let store = Arc::new(MemStore::new());
        let alloc = IpAllocator::new(store, subnet("10.0.0.0/24"));
        assert!(alloc.seed().unwrap());
        let (_, pos) = alloc.allocate().unwrap();
        alloc.update_index(&address_at(&subnet("10.0.0.0/24"), pos).unwrap(), pos).unwrap();
        assert!(!alloc.seed().unwrap());
        assert_eq!(alloc.allocate().unwrap().1, 2);
    }
}
