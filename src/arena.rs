//! Segmented bump allocator backing an in-memory or mmap-mode index (spec
//! §4.1). Offsets, not raw pointers, are the canonical reference type so
//! that loaded segments can be remapped without pointer fixup, mirroring
//! the teacher's append-only `fpos` bookkeeping in `src/robt/flush.rs`
//! translated from a single file to many in-memory segments.

use crate::config::Params;
use crate::{err_at, Error, Result};

const ALIGN: usize = 8;

fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Packs `(segment_index, intra_segment_offset)` into one `u64`: the high
/// 32 bits are the segment index, the low 32 bits the intra-segment byte
/// offset. 32 bits of intra-segment offset is enough for the spec's 1 GiB
/// segment cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Offset(pub u64);

impl Offset {
    fn pack(segment: u32, intra: u32) -> Offset {
        Offset(((segment as u64) << 32) | intra as u64)
    }

    pub fn segment(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn intra(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

struct Segment {
    bytes: Vec<u8>,
    used: usize,
}

/// Segmented bump allocator. Segments are never freed individually; the
/// whole arena is released with the index that owns it.
pub struct Arena {
    segment_cap: usize,
    segment_max: usize,
    segments: Vec<Segment>,
}

impl Arena {
    pub fn new(params: &Params) -> Arena {
        Arena {
            segment_cap: params.segment_cap,
            segment_max: params.segment_max,
            segments: Vec::new(),
        }
    }

    /// Bump-allocate `size` bytes, 8-byte aligned, growing a new segment
    /// if the current one would overflow. Fails with [Error::ArenaExhausted]
    /// once `segment_max` segments have been created.
    pub fn allocate(&mut self, size: usize) -> Result<Offset> {
        if size > self.segment_cap {
            return err_at!(
                ArenaExhausted,
                msg: "allocation of {} bytes exceeds segment cap {}",
                size,
                self.segment_cap
            );
        }
        if self.segments.is_empty() {
            self.grow()?;
        }
        let last = self.segments.len() - 1;
        let aligned = align_up(self.segments[last].used);
        if aligned + size > self.segment_cap {
            self.grow()?;
            return self.allocate(size);
        }
        let seg = &mut self.segments[last];
        if seg.bytes.len() < aligned + size {
            seg.bytes.resize(aligned + size, 0);
        }
        seg.used = aligned + size;
        Ok(Offset::pack(last as u32, aligned as u32))
    }

    fn grow(&mut self) -> Result<()> {
        if self.segments.len() >= self.segment_max {
            return err_at!(
                ArenaExhausted,
                msg: "segment cap reached: {} segments",
                self.segment_max
            );
        }
        self.segments.push(Segment {
            bytes: Vec::new(),
            used: 0,
        });
        Ok(())
    }

    /// Resolve `offset` to a mutable slice of at least the bytes allocated
    /// at that offset. Undefined (panics) if `offset` was never returned
    /// by [Arena::allocate] or [Arena::load_segment_from].
    pub fn resolve_mut(&mut self, offset: Offset, len: usize) -> &mut [u8] {
        let seg = &mut self.segments[offset.segment() as usize];
        let start = offset.intra() as usize;
        &mut seg.bytes[start..start + len]
    }

    pub fn resolve(&self, offset: Offset, len: usize) -> &[u8] {
        let seg = &self.segments[offset.segment() as usize];
        let start = offset.intra() as usize;
        &seg.bytes[start..start + len]
    }

    pub fn used_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.used).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.bytes.len()).sum()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Used bytes of segment `i`, for the snapshot manager to checksum and
    /// serialize.
    pub fn segment_data(&self, i: usize) -> &[u8] {
        &self.segments[i].bytes[..self.segments[i].used]
    }

    /// Install a segment loaded from a snapshot. Used only during recovery,
    /// in segment order; the bump pointer is left at `used` until
    /// [Arena::restore_state_after_load] is called once all segments are
    /// installed.
    pub fn load_segment_from(&mut self, bytes: Vec<u8>, used: usize) {
        self.segments.push(Segment { bytes, used });
    }

    /// After all segments have been installed via
    /// [Arena::load_segment_from], fix up the bump pointer so that future
    /// allocations never overwrite loaded data.
    pub fn restore_state_after_load(&mut self, last_segment: usize, last_used: usize) {
        if let Some(seg) = self.segments.get_mut(last_segment) {
            seg.used = last_used;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arena {
        let mut params = Params::new(2);
        params.set_segments(256, 4);
        Arena::new(&params)
    }

    #[test]
    fn allocates_within_one_segment() {
        let mut a = arena();
        let o1 = a.allocate(16).unwrap();
        let o2 = a.allocate(16).unwrap();
        assert_eq!(o1.segment(), 0);
        assert_eq!(o2.segment(), 0);
        assert_eq!(o2.intra(), 16);
    }

    #[test]
    fn grows_a_new_segment_on_overflow() {
        let mut a = arena();
        a.allocate(200).unwrap();
        let o2 = a.allocate(200).unwrap();
        assert_eq!(o2.segment(), 1);
    }

    #[test]
    fn exhausts_after_segment_max() {
        let mut a = arena();
        for _ in 0..4 {
            a.allocate(200).unwrap();
        }
        assert!(a.allocate(200).is_err());
    }

    #[test]
    fn resolve_round_trips_bytes() {
        let mut a = arena();
        let off = a.allocate(4).unwrap();
        a.resolve_mut(off, 4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(a.resolve(off, 4), &[1, 2, 3, 4]);
    }

    #[test]
    fn load_and_restore_state() {
        let mut a = arena();
        a.load_segment_from(vec![9; 64], 32);
        a.restore_state_after_load(0, 32);
        assert_eq!(a.used_bytes(), 32);
        let off = a.allocate(8).unwrap();
        assert_eq!(off.intra(), 32);
    }
}
