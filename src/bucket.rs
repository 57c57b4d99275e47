//! The X-tree bucket: node layout, `chooseSubtree`, `basicInsert`, the
//! R*-tree optimal split with supernode escape, and root-split handling
//! (spec §4.7). This is the heart of the crate (spec budget ~30%).
//!
//! Grounded on the original C++ `XTreeBucket`
//! (`examples/original_source/.../xtree.h`, `xtree.hpp`) for the exact
//! algorithm, and on the teacher's tagged-node-over-owned-children idiom
//! (`src/llrb_node.rs`) for how to express it as Rust: a plain struct with
//! an `is_leaf` flag rather than the source's class hierarchy, and a
//! [Storage] trait at the seam where the original reaches into its global
//! node table — mirroring how the teacher injects disk access through
//! trait bounds on `robt::Index` rather than hardcoding file I/O into the
//! node type itself.

use std::sync::{Arc, Mutex};

use crate::cache::Cache;
use crate::config::Params;
use crate::mbr::Mbr;
use crate::types::{ChildRef, DataRecord, NodeId};
use crate::{err_at, Error, Result};

/// An interior or leaf node. Children are always paired with their MBR;
/// `parent` is a non-owning back-reference used only for local relinking
/// during split (spec §9).
#[derive(Clone, Debug)]
pub struct Bucket {
    pub id: NodeId,
    pub mbr: Mbr,
    pub is_leaf: bool,
    pub is_supernode: bool,
    pub children: Vec<ChildRef>,
    pub parent: Option<NodeId>,
}

impl Bucket {
    pub fn empty_leaf(id: NodeId, dim: usize) -> Bucket {
        Bucket {
            id,
            mbr: Mbr::empty(dim),
            is_leaf: true,
            is_supernode: false,
            children: Vec::new(),
            parent: None,
        }
    }

    pub fn empty_internal(id: NodeId, dim: usize) -> Bucket {
        Bucket {
            id,
            mbr: Mbr::empty(dim),
            is_leaf: false,
            is_supernode: false,
            children: Vec::new(),
            parent: None,
        }
    }

    pub fn n(&self) -> usize {
        self.children.len()
    }

    /// Recompute this node's MBR as the union of its children's MBRs
    /// (invariant I1).
    pub fn recompute_mbr(&mut self) -> Result<()> {
        let dim = self.mbr.dim();
        let mut mbr = Mbr::empty(dim);
        for c in &self.children {
            mbr.expand_mbr(c.mbr())?;
        }
        self.mbr = mbr;
        Ok(())
    }

    fn update_child_mbr(&mut self, child_id: NodeId, new_mbr: Mbr) -> Result<()> {
        for c in &mut self.children {
            if c.id() == child_id {
                match c {
                    ChildRef::Bucket { mbr, .. } => *mbr = new_mbr,
                    ChildRef::Record { mbr, .. } => *mbr = new_mbr,
                }
                return Ok(());
            }
        }
        err_at!(Fatal, msg: "update_child_mbr: {} is not a child of {}", child_id, self.id)
    }
}

/// The storage seam: allocation and persistence of buckets and data
/// records, abstracting over the in-memory/mmap arena and the durable
/// node store (spec §4.9's façade owns exactly one of these). The bucket
/// algorithm itself only ever calls through this trait.
pub trait Storage: Send + Sync {
    fn new_bucket_id(&self) -> Result<NodeId>;
    fn new_record_id(&self) -> Result<NodeId>;
    /// Durable/mmap modes persist the encoded bytes; in-memory mode is a
    /// no-op since the cache is the only copy.
    fn persist_bucket(&self, bucket: &Bucket) -> Result<()>;
    fn persist_record(&self, id: NodeId, record: &DataRecord) -> Result<()>;

    /// Reload a bucket evicted from the cache. In-memory mode has no
    /// secondary copy, so the default is "not available"; durable mode
    /// overrides this to decode from the node-data file.
    fn load_bucket(&self, _id: NodeId) -> Result<Option<Bucket>> {
        Ok(None)
    }
}

/// Owns the tree's cache and storage seam and implements insertion,
/// `chooseSubtree`, and split. Concurrency (the write gate) and the public
/// façade API live one layer up in [crate::index].
pub struct Tree {
    pub storage: Box<dyn Storage>,
    pub cache: Cache<Bucket>,
    pub dim: usize,
    pub params: Params,
}

impl Tree {
    pub fn new(storage: Box<dyn Storage>, cache_capacity: usize, params: Params) -> Result<(Tree, NodeId)> {
        let dim = params.dimensions;
        let root_id = storage.new_bucket_id()?;
        let root = Bucket::empty_leaf(root_id, dim);
        let tree = Tree {
            storage,
            cache: Cache::new(cache_capacity),
            dim,
            params,
        };
        tree.cache.add(root_id, root);
        Ok((tree, root_id))
    }

    /// Resolve `id` to its decoded [Bucket], reloading through the storage
    /// seam on a cache miss (spec invariant I5: every `NodeID` resolves
    /// either via the cache or the store).
    pub fn fetch(&self, id: NodeId) -> Result<Arc<Mutex<Bucket>>> {
        if let Some(arc) = self.cache.get(id) {
            return Ok(arc);
        }
        match self.storage.load_bucket(id)? {
            Some(bucket) => Ok(self.cache.add(id, bucket)),
            None => err_at!(NotFound, msg: "bucket {} has no live mapping", id),
        }
    }

    fn max_fanout(&self, is_supernode: bool) -> usize {
        if is_supernode {
            self.params.m_max
        } else {
            self.params.m
        }
    }

    /// Insert `record`, descending from `root` via `chooseSubtree`, then
    /// walking back up performing splits as needed. Returns the root's
    /// `NodeId` after the insert — unchanged unless the root itself split.
    pub fn insert(&self, root: NodeId, record: DataRecord) -> Result<NodeId> {
        let mut path = vec![root];
        let mut cur = root;
        loop {
            let is_leaf = self.fetch(cur)?.lock().unwrap().is_leaf;
            if is_leaf {
                break;
            }
            let next = self.choose_subtree(cur, &record.key)?;
            path.push(next);
            cur = next;
        }

        let record_id = self.storage.new_record_id()?;
        self.storage.persist_record(record_id, &record)?;
        let mut must_split = self.basic_insert(cur, record_id, record)?;
        self.propagate_mbr_growth(&path)?;

        let mut new_root = root;
        let mut idx = path.len() - 1;
        while must_split {
            let node_id = path[idx];
            let parent_id = if idx == 0 { None } else { Some(path[idx - 1]) };
            match self.split(node_id, parent_id)? {
                SplitOutcome::Supernode => must_split = false,
                SplitOutcome::Split { new_root: Some(new_root_id), .. } => {
                    new_root = new_root_id;
                    must_split = false;
                }
                SplitOutcome::Split { sibling, updated_node_mbr, new_root: None } => {
                    let parent_id = parent_id.expect("non-root split has a parent");
                    must_split = self.reconcile_split_in_parent(parent_id, node_id, updated_node_mbr, sibling)?;
                    idx -= 1;
                }
            }
        }

        Ok(new_root)
    }

    fn propagate_mbr_growth(&self, path: &[NodeId]) -> Result<()> {
        for &id in path.iter().rev() {
            let arc = self.fetch(id)?;
            let mut node = arc.lock().unwrap();
            node.recompute_mbr()?;
            self.storage.persist_bucket(&node)?;
        }
        Ok(())
    }

    /// After `node_id` has split, fix up `parent_id`'s view of it: shrink
    /// the existing child entry's MBR to `updated_node_mbr` and add the new
    /// `sibling` entry. Returns whether `parent_id` itself must now split.
    fn reconcile_split_in_parent(
        &self,
        parent_id: NodeId,
        node_id: NodeId,
        updated_node_mbr: Mbr,
        sibling: ChildRef,
    ) -> Result<bool> {
        let arc = self.fetch(parent_id)?;
        let mut parent = arc.lock().unwrap();
        parent.update_child_mbr(node_id, updated_node_mbr)?;
        parent.children.push(sibling);
        parent.recompute_mbr()?;
        let must_split = parent.children.len() > self.max_fanout(parent.is_supernode);
        self.storage.persist_bucket(&parent)?;
        Ok(must_split)
    }

    /// `basicInsert`: append the record to `node`'s children if capacity
    /// allows, otherwise report that a split is needed. Returns `true` when
    /// the caller must split `node`.
    fn basic_insert(&self, node_id: NodeId, record_id: NodeId, record: DataRecord) -> Result<bool> {
        let arc = self.fetch(node_id)?;
        let mut node = arc.lock().unwrap();
        let key = record.key.clone();
        node.children.push(ChildRef::Record {
            id: record_id,
            mbr: key.clone(),
            record,
        });
        node.mbr.expand_mbr(&key)?;
        let must_split = node.children.len() > self.max_fanout(node.is_supernode);
        self.storage.persist_bucket(&node)?;
        Ok(must_split)
    }

    /// `chooseSubtree`: pick the child of `parent` to descend into when
    /// inserting `key` (spec §4.7).
    fn choose_subtree(&self, parent_id: NodeId, key: &Mbr) -> Result<NodeId> {
        let arc = self.fetch(parent_id)?;
        let parent = arc.lock().unwrap();
        let children_are_leaves = parent.children.first().map(|c| c.is_leaf_child()).unwrap_or(false);

        if children_are_leaves {
            // zero-enlargement short circuit: a child that already fully
            // contains `key` is picked immediately.
            for c in &parent.children {
                if c.mbr().contains(key)? {
                    return Ok(c.id());
                }
            }

            let siblings: Vec<Mbr> = parent.children.iter().map(|c| c.mbr().clone()).collect();
            let candidates: Vec<usize> = if parent.n() > self.params.p {
                let mut ranked: Vec<(usize, f64)> = parent
                    .children
                    .iter()
                    .enumerate()
                    .map(|(i, c)| Ok((i, c.mbr().area_enlargement(key)?)))
                    .collect::<Result<_>>()?;
                ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
                ranked.truncate(self.params.p);
                ranked.into_iter().map(|(i, _)| i).collect()
            } else {
                (0..parent.n()).collect()
            };

            let mut best: Option<(usize, f64, f64)> = None; // (idx, overlap_enl, area_enl)
            for i in candidates {
                let c = &parent.children[i];
                let others: Vec<Mbr> = siblings
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, m)| m.clone())
                    .collect();
                let overlap_enl = c.mbr().overlap_enlargement_against(key, &others)?;
                let area_enl = c.mbr().area_enlargement(key)?;
                let better = match &best {
                    None => true,
                    Some((_, bo, ba)) => (overlap_enl, area_enl) < (*bo, *ba),
                };
                if better {
                    best = Some((i, overlap_enl, area_enl));
                }
            }
            let (idx, ..) = best.ok_or(()).or_else(|_| err_at!(Fatal, msg: "chooseSubtree: no children"))?;
            Ok(parent.children[idx].id())
        } else {
            let mut best: Option<(usize, f64)> = None;
            for (i, c) in parent.children.iter().enumerate() {
                let enl = c.mbr().area_enlargement(key)?;
                if best.map(|(_, b)| enl < b).unwrap_or(true) {
                    best = Some((i, enl));
                }
            }
            let (idx, _) = best.ok_or(()).or_else(|_| err_at!(Fatal, msg: "chooseSubtree: no children"))?;
            Ok(parent.children[idx].id())
        }
    }

    /// `split`: partition `node`'s children into two groups using the
    /// R*-tree optimal split, or mark `node` a supernode if the best
    /// candidate's overlap exceeds `MAX_OVERLAP` and capacity remains
    /// (spec §4.7 steps 1-5).
    fn split(&self, node_id: NodeId, parent_id: Option<NodeId>) -> Result<SplitOutcome> {
        let arc = self.fetch(node_id)?;
        let mut node = arc.lock().unwrap();

        let distribution = best_distribution(&node.children, self.dim, self.params.split_min_group())?;
        let at_hard_cap = node.children.len() >= self.params.m_max;

        if distribution.percent_overlap >= self.params.max_overlap && !at_hard_cap {
            node.is_supernode = true;
            self.storage.persist_bucket(&node)?;
            return Ok(SplitOutcome::Supernode);
        }

        let Distribution { left, right, .. } = distribution;
        let sibling_id = self.storage.new_bucket_id()?;
        let new_root_id = match parent_id {
            None => Some(self.storage.new_bucket_id()?),
            Some(_) => None,
        };
        let effective_parent = new_root_id.or(parent_id);

        let mut sibling = Bucket {
            id: sibling_id,
            mbr: Mbr::empty(self.dim),
            is_leaf: node.is_leaf,
            is_supernode: false,
            children: right,
            parent: effective_parent,
        };
        sibling.recompute_mbr()?;

        node.children = left;
        node.is_supernode = false;
        node.parent = effective_parent;
        node.recompute_mbr()?;

        let sibling_mbr = sibling.mbr.clone();
        let node_mbr = node.mbr.clone();

        self.storage.persist_bucket(&node)?;
        self.storage.persist_bucket(&sibling)?;
        self.cache.add(sibling_id, sibling);

        if let Some(new_root_id) = new_root_id {
            let mut new_root = Bucket::empty_internal(new_root_id, self.dim);
            new_root.children.push(ChildRef::Bucket {
                id: node.id,
                mbr: node_mbr.clone(),
            });
            new_root.children.push(ChildRef::Bucket {
                id: sibling_id,
                mbr: sibling_mbr.clone(),
            });
            new_root.recompute_mbr()?;
            self.storage.persist_bucket(&new_root)?;
            self.cache.add(new_root_id, new_root);
            Ok(SplitOutcome::Split {
                sibling: ChildRef::Bucket { id: sibling_id, mbr: sibling_mbr },
                updated_node_mbr: node_mbr,
                new_root: Some(new_root_id),
            })
        } else {
            Ok(SplitOutcome::Split {
                sibling: ChildRef::Bucket { id: sibling_id, mbr: sibling_mbr },
                updated_node_mbr: node_mbr,
                new_root: None,
            })
        }
    }
}

enum SplitOutcome {
    Supernode,
    Split {
        sibling: ChildRef,
        updated_node_mbr: Mbr,
        new_root: Option<NodeId>,
    },
}

struct Distribution {
    left: Vec<ChildRef>,
    right: Vec<ChildRef>,
    percent_overlap: f64,
}

/// Enumerate the R*-tree split distributions across every axis and both
/// sort orders (by `min_i` and by `max_i`), picking the axis whose best
/// distribution has the minimum sum of margins, then the distribution on
/// that axis with minimum overlap (ties broken by area) (spec §4.7 steps
/// 1-2).
fn best_distribution(children: &[ChildRef], dim: usize, m: usize) -> Result<Distribution> {
    let n = children.len();
    if n < 2 {
        return err_at!(Fatal, msg: "cannot split a node with fewer than 2 children");
    }
    let m = m.clamp(1, n / 2);

    let mut best_axis: Option<(f64, Distribution)> = None;

    for axis in 0..dim {
        for sort_by_max in [false, true] {
            let mut sorted: Vec<ChildRef> = children.to_vec();
            sorted.sort_by(|a, b| {
                let ka = if sort_by_max { a.mbr().max_bound(axis) } else { a.mbr().min_bound(axis) };
                let kb = if sort_by_max { b.mbr().max_bound(axis) } else { b.mbr().min_bound(axis) };
                ka.cmp(&kb)
            });

            let mut axis_margin_sum = 0.0;
            let mut axis_best: Option<(f64, f64, Distribution)> = None; // (overlap, area, dist)

            for split_at in m..=(n - m) {
                let (left, right) = sorted.split_at(split_at);
                let mut left_mbr = Mbr::empty(dim);
                for c in left {
                    left_mbr.expand_mbr(c.mbr())?;
                }
                let mut right_mbr = Mbr::empty(dim);
                for c in right {
                    right_mbr.expand_mbr(c.mbr())?;
                }
                let overlap = left_mbr.overlap_area(&right_mbr)?;
                let area = left_mbr.area() + right_mbr.area();
                let margin = left_mbr.margin() + right_mbr.margin();
                axis_margin_sum += margin;

                let better = match &axis_best {
                    None => true,
                    Some((bo, ba, _)) => (overlap, area) < (*bo, *ba),
                };
                if better {
                    let percent_overlap = left_mbr.percent_overlap(&right_mbr)?;
                    axis_best = Some((
                        overlap,
                        area,
                        Distribution {
                            left: left.to_vec(),
                            right: right.to_vec(),
                            percent_overlap,
                        },
                    ));
                }
            }

            if let Some((_, _, dist)) = axis_best {
                let better = match &best_axis {
                    None => true,
                    Some((bm, _)) => axis_margin_sum < *bm,
                };
                if better {
                    best_axis = Some((axis_margin_sum, dist));
                }
            }
        }
    }

    best_axis
        .map(|(_, d)| d)
        .ok_or(())
        .or_else(|_| err_at!(Fatal, msg: "split: no valid distribution found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

    struct MemStorage {
        next: AtomicU64,
    }

    impl MemStorage {
        fn new() -> MemStorage {
            MemStorage { next: AtomicU64::new(1) }
        }
    }

    impl Storage for MemStorage {
        fn new_bucket_id(&self) -> Result<NodeId> {
            Ok(NodeId(self.next.fetch_add(1, SeqCst)))
        }
        fn new_record_id(&self) -> Result<NodeId> {
            Ok(NodeId(self.next.fetch_add(1, SeqCst)))
        }
        fn persist_bucket(&self, _b: &Bucket) -> Result<()> {
            Ok(())
        }
        fn persist_record(&self, _id: NodeId, _r: &DataRecord) -> Result<()> {
            Ok(())
        }
    }

    fn record(row: &str, x: f64, y: f64) -> DataRecord {
        DataRecord {
            row_id: row.as_bytes().to_vec(),
            points: vec![vec![x, y]],
            key: Mbr::from_point(&[x, y]).unwrap(),
        }
    }

    fn small_tree() -> (Tree, NodeId) {
        let mut params = Params::new(2);
        params.set_fanout(4);
        params.set_shortlist(4);
        Tree::new(Box::new(MemStorage::new()), 64, params).unwrap()
    }

    #[test]
    fn insert_below_capacity_does_not_split() {
        let (tree, root) = small_tree();
        let new_root = tree.insert(root, record("a", 1.0, 1.0)).unwrap();
        assert_eq!(new_root, root);
        let node = tree.cache.get(root).unwrap();
        assert_eq!(node.lock().unwrap().n(), 1);
    }

    #[test]
    fn splitting_leaf_promotes_new_root() {
        let (tree, root) = small_tree();
        let mut cur_root = root;
        for i in 0..6 {
            cur_root = tree.insert(cur_root, record(&format!("r{}", i), i as f64, i as f64)).unwrap();
        }
        let node = tree.fetch(cur_root).unwrap();
        let node = node.lock().unwrap();
        assert!(!node.is_leaf);
        assert_eq!(node.n(), 2);
    }

    #[test]
    fn root_mbr_covers_every_inserted_point() {
        let (tree, root) = small_tree();
        let mut cur_root = root;
        for i in 0..10 {
            cur_root = tree.insert(cur_root, record(&format!("r{}", i), i as f64, (9 - i) as f64)).unwrap();
        }
        let node = tree.fetch(cur_root).unwrap();
        let mbr = node.lock().unwrap().mbr.clone();
        for i in 0..10 {
            let p = Mbr::from_point(&[i as f64, (9 - i) as f64]).unwrap();
            assert!(mbr.contains(&p).unwrap());
        }
    }

    #[test]
    fn a_cluster_of_identical_points_forms_a_supernode_instead_of_splitting() {
        let (tree, root) = small_tree();
        let mut cur_root = root;
        for i in 0..6 {
            cur_root = tree.insert(cur_root, record(&format!("r{}", i), 3.0, 3.0)).unwrap();
        }
        let node = tree.fetch(cur_root).unwrap();
        let node = node.lock().unwrap();
        assert!(node.is_supernode);
        assert_eq!(node.n(), 6);
    }
}
