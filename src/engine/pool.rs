//! Open-Partition Pool
//!
//! Bounds the number of concurrently open partitions. A fixed vector of
//! slots carries reference counts under one mutex; waiters park on a
//! notify and retry when a slot frees up. The expensive open/close of a
//! partition store happens under a per-slot async mutex so the pool
//! lock is never held across I/O.
//!
//! Acquisition rules, in order: a slot already bound to the requested
//! id is shared; with `nowait` the probe stops there; otherwise any
//! slot with a zero reference count is rebound; otherwise the caller
//! waits for a release, honoring cancellation.

use crate::engine::partition::Partition;
use crate::engine::EngineError;
use crate::store::PartitionStore;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("not found")]
    NotFound,

    #[error("pool is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotEntry {
    /// Bound descriptor id; 0 means unbound.
    id: u64,
    refs: u32,
}

struct PoolState {
    closed: bool,
    entries: Vec<SlotEntry>,
}

struct Slot {
    /// The open store, if any. Guarded separately from the pool state
    /// so rebinding does not block other slots.
    backing: tokio::sync::Mutex<Option<Arc<PartitionStore>>>,
}

pub struct PartitionPool {
    slots: Vec<Slot>,
    state: Mutex<PoolState>,
    notify: Notify,
    num_shards: usize,
}

impl PartitionPool {
    pub fn new(size: usize, num_shards: usize) -> Arc<Self> {
        let size = size.max(1);
        Arc::new(Self {
            slots: (0..size)
                .map(|_| Slot {
                    backing: tokio::sync::Mutex::new(None),
                })
                .collect(),
            state: Mutex::new(PoolState {
                closed: false,
                entries: vec![SlotEntry::default(); size],
            }),
            notify: Notify::new(),
            num_shards,
        })
    }

    /// Acquire a lease on the slot for `id`, rebinding a free slot or
    /// waiting for one. Cancellation aborts the wait.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        id: u64,
        nowait: bool,
    ) -> Result<Lease, PoolError> {
        loop {
            let mut notified = Box::pin(self.notify.notified());
            {
                let mut st = self.state.lock();
                if st.closed {
                    return Err(PoolError::Closed);
                }

                if let Some(i) = st.entries.iter().position(|e| e.id == id && id != 0) {
                    st.entries[i].refs += 1;
                    return Ok(Lease {
                        pool: Arc::clone(self),
                        idx: i,
                    });
                }
                if nowait {
                    return Err(PoolError::NotFound);
                }
                if let Some(i) = st.entries.iter().position(|e| e.refs == 0) {
                    let entry = &mut st.entries[i];
                    entry.id = id;
                    entry.refs = 1;
                    return Ok(Lease {
                        pool: Arc::clone(self),
                        idx: i,
                    });
                }

                // Register interest before releasing the lock so a
                // release between unlock and await still wakes us.
                notified.as_mut().enable();
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            }
        }
    }

    fn release(&self, idx: usize) {
        let mut st = self.state.lock();
        let entry = &mut st.entries[idx];
        debug_assert!(entry.refs > 0, "release without a lease");
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        if st.closed {
            if let Ok(mut backing) = self.slots[idx].backing.try_lock() {
                if let Some(store) = backing.take() {
                    if let Err(e) = store.close() {
                        tracing::warn!("closing partition store on release: {}", e);
                    }
                }
            }
        } else {
            self.notify.notify_waiters();
        }
    }

    /// Whether any slot currently holds a lease for `id`. Retention
    /// uses this to defer deleting partitions that are in use.
    pub fn is_held(&self, id: u64) -> bool {
        self.state
            .lock()
            .entries
            .iter()
            .any(|e| e.id == id && e.refs > 0)
    }

    /// Mark the pool closed, wake all waiters, and close every idle
    /// backing. Slots with outstanding leases close on final release.
    pub fn close(&self) {
        let st = self.state.lock();
        if st.closed {
            return;
        }
        let mut st = st;
        st.closed = true;
        self.notify.notify_waiters();
        for (i, entry) in st.entries.iter().enumerate() {
            if entry.refs == 0 {
                if let Ok(mut backing) = self.slots[i].backing.try_lock() {
                    if let Some(store) = backing.take() {
                        if let Err(e) = store.close() {
                            tracing::warn!("closing partition store: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Acquire a lease for `partition` and bind its store, opening or
    /// creating it when the slot held something else. An open failure
    /// releases the lease before returning so waiters can proceed.
    pub async fn load(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        partition: &Arc<Partition>,
    ) -> Result<LeasedPartition, EngineError> {
        let lease = self.acquire(cancel, partition.id, false).await?;
        let mut backing = self.slots[lease.idx].backing.lock().await;

        if let Some(store) = backing.as_ref() {
            if store.id == partition.id {
                let store = Arc::clone(store);
                drop(backing);
                return Ok(LeasedPartition { store, lease });
            }
            // Slot was rebound to us; retire the previous backing.
            if let Some(old) = backing.take() {
                if let Err(e) = old.close() {
                    tracing::warn!("closing evicted partition store: {}", e);
                }
            }
        }

        let store = if partition.is_new() {
            let store = PartitionStore::create(
                partition.id,
                &partition.path,
                partition.end,
                self.num_shards,
            )?;
            partition.mark_opened();
            store
        } else {
            PartitionStore::open(partition.id, &partition.path)?
        };
        let store = Arc::new(store);
        *backing = Some(Arc::clone(&store));
        drop(backing);
        Ok(LeasedPartition { store, lease })
    }
}

/// A reference-counted claim on one pool slot. Dropping it releases
/// the slot exactly once.
pub struct Lease {
    pool: Arc<PartitionPool>,
    idx: usize,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("idx", &self.idx).finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release(self.idx);
    }
}

/// A lease together with the store it authorizes.
pub struct LeasedPartition {
    store: Arc<PartitionStore>,
    #[allow(dead_code)]
    lease: Lease,
}

impl LeasedPartition {
    pub fn store_id(&self) -> u64 {
        self.store.id
    }
}

impl Deref for LeasedPartition {
    type Target = PartitionStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(size: usize) -> Arc<PartitionPool> {
        PartitionPool::new(size, 1)
    }

    #[tokio::test]
    async fn test_acquire_shares_matching_slot() {
        let p = pool(2);
        let cancel = CancellationToken::new();

        let a = p.acquire(&cancel, 7, false).await.unwrap();
        let b = p.acquire(&cancel, 7, false).await.unwrap();
        assert_eq!(a.idx, b.idx);
        {
            let st = p.state.lock();
            assert_eq!(st.entries[a.idx].refs, 2);
        }
        drop(a);
        drop(b);
        let st = p.state.lock();
        assert_eq!(st.entries.iter().map(|e| e.refs).sum::<u32>(), 0);
    }

    #[tokio::test]
    async fn test_nowait_returns_not_found() {
        let p = pool(1);
        let cancel = CancellationToken::new();
        let _a = p.acquire(&cancel, 1, false).await.unwrap();
        assert_eq!(
            p.acquire(&cancel, 2, true).await.unwrap_err(),
            PoolError::NotFound
        );
    }

    #[tokio::test]
    async fn test_free_slot_is_rebound() {
        let p = pool(1);
        let cancel = CancellationToken::new();

        let a = p.acquire(&cancel, 1, false).await.unwrap();
        drop(a);
        let b = p.acquire(&cancel, 2, false).await.unwrap();
        let st = p.state.lock();
        assert_eq!(st.entries[b.idx].id, 2);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let p = pool(1);
        let cancel = CancellationToken::new();
        let held = p.acquire(&cancel, 1, false).await.unwrap();

        let p2 = Arc::clone(&p);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { p2.acquire(&cancel2, 2, false).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let lease = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(p.state.lock().entries[lease.idx].id, 2);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_waiters_without_leaks() {
        let p = pool(2);
        let cancel = CancellationToken::new();
        let _a = p.acquire(&cancel, 1, false).await.unwrap();
        let _b = p.acquire(&cancel, 2, false).await.unwrap();

        // Two waiters behind a full pool.
        let waiters: Vec<_> = (3..5)
            .map(|id| {
                let p = Arc::clone(&p);
                let c = cancel.clone();
                tokio::spawn(async move { p.acquire(&c, id, false).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        for w in waiters {
            let got = tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.unwrap_err(), PoolError::Cancelled);
        }

        // No leaked references; later acquisitions proceed normally.
        drop(_a);
        drop(_b);
        let fresh = CancellationToken::new();
        let lease = p.acquire(&fresh, 9, false).await.unwrap();
        assert_eq!(p.state.lock().entries[lease.idx].refs, 1);
    }

    #[tokio::test]
    async fn test_close_rejects_new_and_wakes_waiters() {
        let p = pool(1);
        let cancel = CancellationToken::new();
        let held = p.acquire(&cancel, 1, false).await.unwrap();

        let p2 = Arc::clone(&p);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { p2.acquire(&cancel2, 2, false).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        p.close();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap_err(), PoolError::Closed);

        assert_eq!(
            p.acquire(&cancel, 3, false).await.unwrap_err(),
            PoolError::Closed
        );
        drop(held);
    }

    #[tokio::test]
    async fn test_is_held() {
        let p = pool(2);
        let cancel = CancellationToken::new();
        let lease = p.acquire(&cancel, 5, false).await.unwrap();
        assert!(p.is_held(5));
        drop(lease);
        assert!(!p.is_held(5));
    }
}
