//! Latch-and-spin mechanism for non-blocking concurrency, used by the index
//! façade to serialize writers and exclude readers from an in-flight write
//! (spec §5: "reads and writes must not interleave on the same tree").
//!
//! Ported from the teacher's `src/gate.rs`. A [Gate] packs three fields
//! into one `AtomicU64`:
//!
//! * reader count, bits [0-61]
//! * latch flag, bit 62 (a writer wants in, stop admitting new readers)
//! * lock flag, bit 63 (a writer is inside)
//!
//! A writer first sets the latch, then spins until the reader count drops
//! to zero, then sets the lock. A reader spins while either flag is set,
//! then increments the reader count with a compare-exchange loop.

use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

pub struct Gate(AtomicU64);

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    const LATCH_FLAG: u64 = 0x4000_0000_0000_0000;
    const LOCK_FLAG: u64 = 0x8000_0000_0000_0000;
    const LATCH_LOCK_FLAG: u64 = 0xC000_0000_0000_0000;
    const READERS_FLAG: u64 = 0x3FFF_FFFF_FFFF_FFFF;

    pub fn new() -> Gate {
        Gate(AtomicU64::new(0))
    }

    /// Block until a read permit is granted; returns a guard that releases
    /// the permit on drop.
    pub fn acquire_read(&self) -> ReadPermit<'_> {
        loop {
            let bits = self.0.load(SeqCst);
            if bits & Self::LATCH_LOCK_FLAG != 0 {
                std::hint::spin_loop();
                continue;
            }
            let new_bits = bits + 1;
            if self
                .0
                .compare_exchange(bits, new_bits, SeqCst, SeqCst)
                .is_ok()
            {
                break ReadPermit { gate: self };
            }
        }
    }

    /// Non-blocking attempt to acquire a read permit; used by operations
    /// that must not stall behind a writer (none in this crate today, but
    /// kept for symmetry with the teacher's `Gate`).
    pub fn try_acquire_read(&self) -> Option<ReadPermit<'_>> {
        let bits = self.0.load(SeqCst);
        if bits & Self::LATCH_LOCK_FLAG != 0 {
            return None;
        }
        let new_bits = bits + 1;
        self.0
            .compare_exchange(bits, new_bits, SeqCst, SeqCst)
            .ok()
            .map(|_| ReadPermit { gate: self })
    }

    /// Block until exclusive write access is granted: no readers and no
    /// other writer may be inside. Returns a guard releasing on drop.
    pub fn acquire_write(&self) -> WritePermit<'_> {
        // latch first so no new readers are admitted while we wait for the
        // current ones to drain.
        loop {
            let bits = self.0.load(SeqCst);
            if bits & Self::LATCH_LOCK_FLAG != 0 {
                std::hint::spin_loop();
                continue;
            }
            let new_bits = bits | Self::LATCH_FLAG;
            if self
                .0
                .compare_exchange(bits, new_bits, SeqCst, SeqCst)
                .is_ok()
            {
                break;
            }
        }
        loop {
            let bits = self.0.load(SeqCst);
            if bits & Self::READERS_FLAG == 0 {
                let new_bits = Self::LOCK_FLAG;
                if self
                    .0
                    .compare_exchange(bits, new_bits, SeqCst, SeqCst)
                    .is_ok()
                {
                    break WritePermit { gate: self };
                }
            }
            std::hint::spin_loop();
        }
    }

    fn release_read(&self) {
        self.0.fetch_sub(1, SeqCst);
    }

    fn release_write(&self) {
        self.0.store(0, SeqCst);
    }

    pub fn n_readers(&self) -> u64 {
        self.0.load(SeqCst) & Self::READERS_FLAG
    }
}

pub struct ReadPermit<'a> {
    gate: &'a Gate,
}

impl Drop for ReadPermit<'_> {
    fn drop(&mut self) {
        self.gate.release_read();
    }
}

pub struct WritePermit<'a> {
    gate: &'a Gate,
}

impl Drop for WritePermit<'_> {
    fn drop(&mut self) {
        self.gate.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_can_overlap() {
        let gate = Gate::new();
        let r1 = gate.acquire_read();
        let r2 = gate.acquire_read();
        assert_eq!(gate.n_readers(), 2);
        drop(r1);
        drop(r2);
        assert_eq!(gate.n_readers(), 0);
    }

    #[test]
    fn writer_excludes_everyone() {
        let gate = Arc::new(Gate::new());
        let w = gate.acquire_write();
        assert!(gate.try_acquire_read().is_none());
        drop(w);
        assert!(gate.try_acquire_read().is_some());
    }

    #[test]
    fn writer_waits_for_readers_to_drain() {
        let gate = Arc::new(Gate::new());
        let r = gate.acquire_read();
        let gate2 = Arc::clone(&gate);
        let handle = thread::spawn(move || {
            let _w = gate2.acquire_write();
        });
        thread::sleep(std::time::Duration::from_millis(20));
        drop(r);
        handle.join().unwrap();
    }
}
