//! Shared value types: data records, node identity, and the child-entry
//! tuple that a bucket's children array is made of.

use crate::mbr::Mbr;

/// Stable identifier for a node, preserved across physical reallocation.
/// Assigned at first allocation and used as the cache and store key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const NIL: NodeId = NodeId(0);
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Whether a [NodeId] refers to an interior bucket or a leaf-held data
/// record. Used to cross-check store/cache agreement (spec invariant I5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Bucket,
    Record,
}

/// A value inserted by the user: a stable row identifier, one or more
/// k-dimensional points (every point expands the record's MBR), and the
/// record's MBR.
#[derive(Clone, Debug, PartialEq)]
pub struct DataRecord {
    pub row_id: Vec<u8>,
    pub points: Vec<Vec<f64>>,
    pub key: Mbr,
}

impl DataRecord {
    /// Footprint in bytes, used by the cache and the page write tracker to
    /// account for memory pressure (mirrors the teacher's `Footprint` trait,
    /// `src/clru/mod.rs`).
    pub fn footprint(&self) -> usize {
        let points_bytes: usize = self
            .points
            .iter()
            .map(|p| p.len() * std::mem::size_of::<f64>())
            .sum();
        self.row_id.len() + points_bytes + self.key.dim() * 16
    }
}

/// A child entry in a bucket's children array: either a reference to
/// another bucket or to a data record, always paired with that child's MBR.
#[derive(Clone, Debug)]
pub enum ChildRef {
    Bucket { id: NodeId, mbr: Mbr },
    Record { id: NodeId, mbr: Mbr, record: DataRecord },
}

impl ChildRef {
    pub fn mbr(&self) -> &Mbr {
        match self {
            ChildRef::Bucket { mbr, .. } => mbr,
            ChildRef::Record { mbr, .. } => mbr,
        }
    }

    pub fn id(&self) -> NodeId {
        match self {
            ChildRef::Bucket { id, .. } => *id,
            ChildRef::Record { id, .. } => *id,
        }
    }

    pub fn is_leaf_child(&self) -> bool {
        matches!(self, ChildRef::Record { .. })
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            ChildRef::Bucket { .. } => NodeKind::Bucket,
            ChildRef::Record { .. } => NodeKind::Record,
        }
    }
}

/// Query mode for the range iterator (spec §4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryMode {
    Intersects,
    Contains,
}

/// Traversal order for the query iterator's work list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraversalOrder {
    Dfs,
    Bfs,
}
