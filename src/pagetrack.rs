//! Lock-free per-page write statistics used by the COW snapshot manager to
//! decide which pages to prefault before marking the arena read-only (spec
//! §4.3). Grounded on the original C++ `PageWriteTracker`
//! (`examples/.../memmgr/page_write_tracker.hpp`) translated into safe
//! atomics in the spirit of this crate's own [crate::gate::Gate].
//!
//! A fixed-capacity table of buckets, each holding a small inline slot
//! array plus overflow into a shared pool, avoids allocation on the write
//! hot path. Page indices hash into a bucket; a page already tracked in a
//! full bucket chains into the pool.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::SeqCst};

/// Write threshold above which a page is considered hot.
const HOT_THRESHOLD: u32 = 4;
const SLOTS_PER_BUCKET: usize = 4;
const POOL_CAP: usize = 4096;

struct Slot {
    page: AtomicU64,
    writes: AtomicU32,
    accesses: AtomicU32,
    epoch: AtomicU64,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            page: AtomicU64::new(u64::MAX),
            writes: AtomicU32::new(0),
            accesses: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    fn is_hot(&self) -> bool {
        self.writes.load(SeqCst) >= HOT_THRESHOLD
    }
}

struct Bucket {
    slots: [Slot; SLOTS_PER_BUCKET],
    overflow: AtomicU64, // index into pool, u64::MAX if none
}

/// Fixed-capacity chained hash table of [Slot]s. `n_buckets` is the hashed
/// table size; overflow beyond `SLOTS_PER_BUCKET` entries per bucket
/// chains through a pre-allocated `pool` of size [POOL_CAP].
pub struct PageWriteTracker {
    buckets: Vec<Bucket>,
    pool: Vec<Slot>,
    pool_next: AtomicU64,
}

impl PageWriteTracker {
    pub fn new(n_buckets: usize) -> PageWriteTracker {
        let buckets = (0..n_buckets.max(1))
            .map(|_| Bucket {
                slots: [Slot::empty(), Slot::empty(), Slot::empty(), Slot::empty()],
                overflow: AtomicU64::new(u64::MAX),
            })
            .collect();
        let pool = (0..POOL_CAP).map(|_| Slot::empty()).collect();
        PageWriteTracker {
            buckets,
            pool,
            pool_next: AtomicU64::new(0),
        }
    }

    fn hash(&self, page: u64) -> usize {
        (page as usize) % self.buckets.len()
    }

    /// Record a write to `page`, bumping its write and access counters.
    /// Allocates a tracking slot for `page` on first sight.
    pub fn record_write(&self, page: u64, epoch: u64) {
        let slot = self.slot_for(page);
        slot.writes.fetch_add(1, SeqCst);
        slot.accesses.fetch_add(1, SeqCst);
        slot.epoch.store(epoch, SeqCst);
    }

    pub fn record_access(&self, page: u64) {
        self.slot_for(page).accesses.fetch_add(1, SeqCst);
    }

    fn slot_for(&self, page: u64) -> &Slot {
        let bucket = &self.buckets[self.hash(page)];
        for slot in &bucket.slots {
            let existing = slot.page.load(SeqCst);
            if existing == page {
                return slot;
            }
            if existing == u64::MAX
                && slot
                    .page
                    .compare_exchange(u64::MAX, page, SeqCst, SeqCst)
                    .is_ok()
            {
                return slot;
            }
        }
        self.find_in_pool(bucket, page)
    }

    /// A bucket's overflow chain is a single pool slot; a page that
    /// collides twice in the same bucket reuses or replaces that slot. This
    /// bounds lookup to O(1) at the cost of tracking precision under heavy
    /// collision, acceptable since `hot_pages()` is a prefault hint, not a
    /// correctness-critical result.
    fn find_in_pool(&self, bucket: &Bucket, page: u64) -> &Slot {
        let idx = bucket.overflow.load(SeqCst);
        if idx != u64::MAX {
            let slot = &self.pool[idx as usize];
            if slot.page.load(SeqCst) == page {
                return slot;
            }
        }
        let next = (self.pool_next.fetch_add(1, SeqCst) as usize) % POOL_CAP;
        let slot = &self.pool[next];
        slot.page.store(page, SeqCst);
        slot.writes.store(0, SeqCst);
        slot.accesses.store(0, SeqCst);
        bucket.overflow.store(next as u64, SeqCst);
        slot
    }

    /// Pages whose write count has crossed [HOT_THRESHOLD], for the
    /// snapshot manager to prefault before write-protecting the arena.
    pub fn hot_pages(&self) -> Vec<u64> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            for slot in &bucket.slots {
                let page = slot.page.load(SeqCst);
                if page != u64::MAX && slot.is_hot() {
                    out.push(page);
                }
            }
            let overflow = bucket.overflow.load(SeqCst);
            if overflow != u64::MAX {
                let slot = &self.pool[overflow as usize];
                let page = slot.page.load(SeqCst);
                if page != u64::MAX && slot.is_hot() {
                    out.push(page);
                }
            }
        }
        out
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            for slot in &bucket.slots {
                slot.page.store(u64::MAX, SeqCst);
                slot.writes.store(0, SeqCst);
                slot.accesses.store(0, SeqCst);
            }
            bucket.overflow.store(u64::MAX, SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_writes_and_marks_hot() {
        let t = PageWriteTracker::new(8);
        for epoch in 0..HOT_THRESHOLD as u64 {
            t.record_write(3, epoch);
        }
        assert_eq!(t.hot_pages(), vec![3]);
    }

    #[test]
    fn cold_pages_are_not_reported() {
        let t = PageWriteTracker::new(8);
        t.record_write(5, 0);
        assert!(t.hot_pages().is_empty());
    }

    #[test]
    fn reset_clears_all_slots() {
        let t = PageWriteTracker::new(8);
        for epoch in 0..HOT_THRESHOLD as u64 {
            t.record_write(3, epoch);
        }
        t.reset();
        assert!(t.hot_pages().is_empty());
    }

    #[test]
    fn distinct_pages_in_same_bucket_chain_through_pool() {
        let t = PageWriteTracker::new(1);
        for p in 0..(SLOTS_PER_BUCKET as u64 + 2) {
            for epoch in 0..HOT_THRESHOLD as u64 {
                t.record_write(p, epoch);
            }
        }
        assert!(t.hot_pages().contains(&0));
    }
}
