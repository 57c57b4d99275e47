//! Configuration knobs for an index, per spec §6. Immutable once the index
//! is created except where noted.

/// Maximum fanout for a regular (non-supernode) bucket.
pub const M: usize = 231;
/// Subtree-choice shortlist size.
pub const P: usize = 132;
/// Supernode split threshold: a split candidate with percent overlap at or
/// above this is rejected in favor of forming a supernode.
pub const MAX_OVERLAP: f64 = 0.20;
/// Results per iterator batch.
pub const ITER_PAGE_SIZE: usize = 400;
/// Inserts before an automatic snapshot trigger.
pub const OPS_THRESHOLD: u64 = 10_000;
/// Tracked bytes before an automatic snapshot trigger.
pub const MEM_THRESHOLD: usize = 64 * 1024 * 1024;
/// Maximum interval, in seconds, between automatic snapshots.
pub const TIME_CEILING_SECS: u64 = 30;
/// Maximum bytes per arena segment.
pub const SEGMENT_CAP: usize = 1024 * 1024 * 1024;
/// Maximum number of arena segments.
pub const SEGMENT_MAX: usize = 4096;
/// Default precision: bits of mantissa retained in the ordered-float
/// encoding.
pub const PRECISION: u32 = 32;

/// Where an index keeps its state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Arena lives entirely in process memory; no persistence.
    InMemory,
    /// Arena is backed by a memory-mapped snapshot file (§4.2).
    Mmap,
    /// Nodes live in a durable node store (§4.4); every commit is fsynced.
    Durable,
}

/// Per-index configuration. `dimensions` and `precision` are immutable once
/// the index is built; the remaining knobs have spec-documented defaults
/// and can be overridden with the `set_*` builder methods, in the style of
/// the teacher's `robt::Config` (`src/robt/config.rs`).
#[derive(Clone, Debug)]
pub struct Params {
    pub dimensions: usize,
    pub precision: u32,
    pub mode: Mode,
    pub m: usize,
    pub p: usize,
    pub max_overlap: f64,
    pub m_max: usize,
    pub iter_page_size: usize,
    pub ops_threshold: u64,
    pub mem_threshold: usize,
    pub time_ceiling_secs: u64,
    pub segment_cap: usize,
    pub segment_max: usize,
}

impl Params {
    /// Create configuration for a `dimensions`-dimensional index running in
    /// memory. Use `set_mode` to switch to `Mmap` or `Durable`.
    pub fn new(dimensions: usize) -> Params {
        Params {
            dimensions,
            precision: PRECISION,
            mode: Mode::InMemory,
            m: M,
            p: P,
            max_overlap: MAX_OVERLAP,
            m_max: 3 * M,
            iter_page_size: ITER_PAGE_SIZE,
            ops_threshold: OPS_THRESHOLD,
            mem_threshold: MEM_THRESHOLD,
            time_ceiling_secs: TIME_CEILING_SECS,
            segment_cap: SEGMENT_CAP,
            segment_max: SEGMENT_MAX,
        }
    }

    pub fn set_precision(&mut self, precision: u32) -> &mut Self {
        self.precision = precision;
        self
    }

    pub fn set_mode(&mut self, mode: Mode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn set_fanout(&mut self, m: usize) -> &mut Self {
        self.m = m;
        self.m_max = 3 * m;
        self
    }

    pub fn set_shortlist(&mut self, p: usize) -> &mut Self {
        self.p = p;
        self
    }

    pub fn set_max_overlap(&mut self, max_overlap: f64) -> &mut Self {
        self.max_overlap = max_overlap;
        self
    }

    pub fn set_iter_page_size(&mut self, size: usize) -> &mut Self {
        self.iter_page_size = size;
        self
    }

    pub fn set_snapshot_triggers(
        &mut self,
        ops_threshold: u64,
        mem_threshold: usize,
        time_ceiling_secs: u64,
    ) -> &mut Self {
        self.ops_threshold = ops_threshold;
        self.mem_threshold = mem_threshold;
        self.time_ceiling_secs = time_ceiling_secs;
        self
    }

    pub fn set_segments(&mut self, segment_cap: usize, segment_max: usize) -> &mut Self {
        self.segment_cap = segment_cap;
        self.segment_max = segment_max;
        self
    }

    /// `m = ceil(0.4 * (M / 2))`, the minimum group size used by the split
    /// distribution enumeration (spec §4.7).
    pub fn split_min_group(&self) -> usize {
        let half = (self.m as f64) / 2.0;
        (0.4 * half).ceil() as usize
    }
}
