//! Copy-on-write snapshot manager (spec §4.2): atomic on-disk images of the
//! arena, written via temp-then-rename and verified by a rolling checksum,
//! loaded back through `memmap2`. Grounded on the teacher's flush-then-sync-
//! then-finalize sequence (`src/robt/index.rs` `build_flush`) and its
//! `fs2::FileExt` locking discipline (`src/robt/index.rs`, `src/file_lock.rs`).

use std::convert::TryInto;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::Mmap;

use crate::arena::Arena;
use crate::pagetrack::PageWriteTracker;
use crate::{err_at, Error, Result};

pub const MAGIC_V1: u32 = 0x5854_5245;
pub const MAGIC_V2: u32 = 0x5854_5246;

const V1_HEADER_LEN: usize = 64;
const V2_HEADER_LEN: usize = 64;
const SEGMENT_DESC_LEN: usize = 24; // size(8) + used(8) + file_offset(8)

/// A decoded snapshot header plus everything needed to hand segment ranges
/// back to the [Arena].
pub struct LoadedSnapshot {
    pub root_offset: u64,
    pub dimensions: u32,
    pub precision: u32,
    pub record_count: u64,
    pub segments: Vec<(Vec<u8>, usize)>,
    _mmap: Option<Mmap>,
}

/// 32-bit rolling XOR-shift checksum over a byte stream (spec §4.2 step 1).
pub fn rolling_checksum(bytes: &[u8]) -> u32 {
    let mut state: u32 = 0x9E37_79B9;
    for &b in bytes {
        state ^= b as u32;
        state = state.rotate_left(5).wrapping_mul(0x0100_0193);
    }
    state
}

/// Write an atomic snapshot of `arena` to `path`: temp file, fsync, rename.
/// Uses the v1 (single segment) layout when the arena has exactly one
/// segment, v2 otherwise.
pub fn save(
    path: &Path,
    arena: &Arena,
    dimensions: u32,
    precision: u32,
    record_count: u64,
    root_offset: u64,
    timestamp: u64,
) -> Result<()> {
    let tmp_path = tmp_path_for(path);
    let mut buf = Vec::new();

    if arena.segment_count() <= 1 {
        let seg = if arena.segment_count() == 1 {
            arena.segment_data(0)
        } else {
            &[]
        };
        let checksum = rolling_checksum(seg);
        buf.extend_from_slice(&MAGIC_V1.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes()); // version
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(&(seg.len() as u64).to_le_bytes()); // used
        buf.extend_from_slice(&(seg.len() as u64).to_le_bytes()); // arena size
        buf.extend_from_slice(&dimensions.to_le_bytes());
        buf.extend_from_slice(&precision.to_le_bytes());
        buf.extend_from_slice(&record_count.to_le_bytes());
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf.extend_from_slice(&root_offset.to_le_bytes());
        buf.resize(V1_HEADER_LEN, 0); // reserved padding
        buf.extend_from_slice(seg);
    } else {
        let n_segments = arena.segment_count();
        let total_used: u64 = (0..n_segments).map(|i| arena.segment_data(i).len() as u64).sum();
        let mut all_bytes = Vec::new();
        for i in 0..n_segments {
            all_bytes.extend_from_slice(arena.segment_data(i));
        }
        let checksum = rolling_checksum(&all_bytes);

        buf.extend_from_slice(&MAGIC_V2.to_le_bytes()); // 0
        buf.extend_from_slice(&2u32.to_le_bytes()); // 4
        buf.extend_from_slice(&timestamp.to_le_bytes()); // 8
        buf.extend_from_slice(&total_used.to_le_bytes()); // 16
        buf.extend_from_slice(&(n_segments as u64).to_le_bytes()); // 24
        buf.extend_from_slice(&root_offset.to_le_bytes()); // 32
        buf.extend_from_slice(&dimensions.to_le_bytes()); // 40
        buf.extend_from_slice(&precision.to_le_bytes()); // 44
        buf.extend_from_slice(&record_count.to_le_bytes()); // 48
        buf.extend_from_slice(&checksum.to_le_bytes()); // 56
        buf.resize(V2_HEADER_LEN, 0); // 60..64 reserved

        let mut file_offset = (V2_HEADER_LEN + n_segments * SEGMENT_DESC_LEN) as u64;
        for i in 0..n_segments {
            let used = arena.segment_data(i).len() as u64;
            buf.extend_from_slice(&used.to_le_bytes()); // size
            buf.extend_from_slice(&used.to_le_bytes()); // used
            buf.extend_from_slice(&file_offset.to_le_bytes());
            file_offset += used;
        }
        for i in 0..n_segments {
            buf.extend_from_slice(arena.segment_data(i));
        }
    }

    let mut f = err_at!(SnapshotIO, File::create(&tmp_path), "creating {:?}", tmp_path)?;
    err_at!(SnapshotIO, f.write_all(&buf), "writing {:?}", tmp_path)?;
    err_at!(SnapshotIO, f.sync_all(), "fsync {:?}", tmp_path)?;
    drop(f);
    err_at!(SnapshotIO, fs::rename(&tmp_path, path), "renaming {:?} -> {:?}", tmp_path, path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

/// Load a previously-saved snapshot: mmap the file, verify magic, version
/// and checksum, then return segment ranges for the allocator to install.
/// A checksum mismatch fails the whole recovery (spec §4.2, "the engine
/// must not proceed with a corrupt snapshot").
pub fn load(path: &Path) -> Result<LoadedSnapshot> {
    let f = err_at!(SnapshotIO, OpenOptions::new().read(true).open(path), "opening {:?}", path)?;
    err_at!(SnapshotIO, f.lock_shared(), "locking {:?}", path)?;
    let mmap = err_at!(SnapshotIO, unsafe { Mmap::map(&f) }, "mmap {:?}", path)?;
    let bytes: &[u8] = &mmap;

    if bytes.len() < 4 {
        return err_at!(SnapshotCorrupt, msg: "truncated snapshot file {:?}", path);
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    match magic {
        MAGIC_V1 => load_v1(bytes, mmap),
        MAGIC_V2 => load_v2(bytes, mmap),
        other => err_at!(SnapshotCorrupt, msg: "unknown snapshot magic {:#x} in {:?}", other, path),
    }
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}

fn u64_at(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

fn load_v1(bytes: &[u8], mmap: Mmap) -> Result<LoadedSnapshot> {
    if bytes.len() < V1_HEADER_LEN {
        return err_at!(SnapshotCorrupt, msg: "v1 header truncated");
    }
    let version = u32_at(bytes, 4);
    if version != 1 {
        return err_at!(SnapshotCorrupt, msg: "unexpected v1 version field {}", version);
    }
    let used = u64_at(bytes, 16) as usize;
    let dimensions = u32_at(bytes, 32);
    let precision = u32_at(bytes, 36);
    let record_count = u64_at(bytes, 40);
    let checksum = u32_at(bytes, 48);
    let root_offset = u64_at(bytes, 52);

    let segment = &bytes[V1_HEADER_LEN..V1_HEADER_LEN + used];
    if rolling_checksum(segment) != checksum {
        return err_at!(SnapshotCorrupt, msg: "checksum mismatch in v1 snapshot");
    }

    Ok(LoadedSnapshot {
        root_offset,
        dimensions,
        precision,
        record_count,
        segments: vec![(segment.to_vec(), used)],
        _mmap: Some(mmap),
    })
}

fn load_v2(bytes: &[u8], mmap: Mmap) -> Result<LoadedSnapshot> {
    if bytes.len() < V2_HEADER_LEN {
        return err_at!(SnapshotCorrupt, msg: "v2 header truncated");
    }
    let version = u32_at(bytes, 4);
    if version != 2 {
        return err_at!(SnapshotCorrupt, msg: "unexpected v2 version field {}", version);
    }
    let n_segments = u64_at(bytes, 16) as usize;
    let root_offset = u64_at(bytes, 32);
    let dimensions = u32_at(bytes, 40);
    let precision = u32_at(bytes, 44);
    let record_count = u64_at(bytes, 48);
    let checksum = u32_at(bytes, 56);

    let desc_start = V2_HEADER_LEN;
    if bytes.len() < desc_start + n_segments * SEGMENT_DESC_LEN {
        return err_at!(SnapshotCorrupt, msg: "v2 segment descriptors truncated");
    }

    let mut descs = Vec::with_capacity(n_segments);
    for i in 0..n_segments {
        let base = desc_start + i * SEGMENT_DESC_LEN;
        let used = u64_at(bytes, base + 8) as usize;
        let file_offset = u64_at(bytes, base + 16) as usize;
        descs.push((used, file_offset));
    }

    let mut all_bytes = Vec::new();
    let mut segments = Vec::with_capacity(n_segments);
    for (used, file_offset) in descs {
        if bytes.len() < file_offset + used {
            return err_at!(SnapshotCorrupt, msg: "v2 segment data truncated");
        }
        let seg = &bytes[file_offset..file_offset + used];
        all_bytes.extend_from_slice(seg);
        segments.push((seg.to_vec(), used));
    }
    if rolling_checksum(&all_bytes) != checksum {
        return err_at!(SnapshotCorrupt, msg: "checksum mismatch in v2 snapshot");
    }

    Ok(LoadedSnapshot {
        root_offset,
        dimensions,
        precision,
        record_count,
        segments,
        _mmap: Some(mmap),
    })
}

/// Pages the page write tracker has reported hot are touched once here to
/// warm them before the arena is conceptually made read-only for the
/// duration of a save. In this crate's in-process model that just means
/// reading the bytes; a future mmap-backed arena would `mprotect` them,
/// see [crate::pageguard].
pub fn prefault_hot_pages(tracker: &PageWriteTracker, arena: &Arena) -> usize {
    let mut touched = 0;
    for page in tracker.hot_pages() {
        let seg = (page >> 32) as usize;
        if seg < arena.segment_count() {
            let _ = arena.segment_data(seg).first();
            touched += 1;
        }
    }
    touched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use tempfile::tempdir;

    #[test]
    fn v1_round_trip() {
        let mut params = Params::new(2);
        params.set_segments(1024, 4);
        let mut arena = Arena::new(&params);
        let off = arena.allocate(32).unwrap();
        arena.resolve_mut(off, 32).copy_from_slice(&[7u8; 32]);

        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        save(&path, &arena, 2, 32, 5, off.0, 1234).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.dimensions, 2);
        assert_eq!(loaded.precision, 32);
        assert_eq!(loaded.record_count, 5);
        assert_eq!(loaded.root_offset, off.0);
        assert_eq!(loaded.segments.len(), 1);
        assert_eq!(&loaded.segments[0].0[..32], &[7u8; 32]);
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let mut params = Params::new(2);
        params.set_segments(1024, 4);
        let mut arena = Arena::new(&params);
        arena.allocate(8).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        save(&path, &arena, 2, 32, 0, 0, 0).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(load(&path).is_err());
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        fs::write(&path, [0u8; 64]).unwrap();
        assert!(load(&path).is_err());
    }
}
