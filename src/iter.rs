//! Paged DFS/BFS query iterator (spec §4.8). Grounded on the teacher's
//! `robt::reader::Iter`/`IterLsm` explicit stack-of-blocks construction
//! (`src/robt/reader.rs`) — a lazy `Iterator::next` over an explicit work
//! list rather than recursion, so the traversal state survives across
//! paged calls and every node visited can be pinned for the iterator's
//! lifetime.

use std::collections::VecDeque;

use crate::bucket::{Bucket, Tree};
use crate::mbr::Mbr;
use crate::types::{DataRecord, NodeId, QueryMode, TraversalOrder};
use crate::Result;

enum WorkList {
    Stack(Vec<NodeId>),
    Queue(VecDeque<NodeId>),
}

impl WorkList {
    fn new(order: TraversalOrder, root: NodeId) -> WorkList {
        match order {
            TraversalOrder::Dfs => WorkList::Stack(vec![root]),
            TraversalOrder::Bfs => WorkList::Queue(VecDeque::from([root])),
        }
    }

    fn push(&mut self, id: NodeId) {
        match self {
            WorkList::Stack(s) => s.push(id),
            WorkList::Queue(q) => q.push_back(id),
        }
    }

    fn pop(&mut self) -> Option<NodeId> {
        match self {
            WorkList::Stack(s) => s.pop(),
            WorkList::Queue(q) => q.pop_front(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            WorkList::Stack(s) => s.is_empty(),
            WorkList::Queue(q) => q.is_empty(),
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &NodeId> + '_> {
        match self {
            WorkList::Stack(s) => Box::new(s.iter()),
            WorkList::Queue(q) => Box::new(q.iter()),
        }
    }
}

/// A lazy, pageable range query over a [Tree]. Every node this iterator has
/// visited and not yet finished with remains pinned in the cache; dropping
/// the iterator (or calling [QueryIter::invalidate]) unpins everything
/// still outstanding (spec §4.8 safety contract).
pub struct QueryIter<'a> {
    tree: &'a Tree,
    query: Mbr,
    mode: QueryMode,
    page_size: usize,
    work: WorkList,
    pinned: Vec<NodeId>,
    valid: bool,
}

impl<'a> QueryIter<'a> {
    pub fn new(tree: &'a Tree, root: NodeId, query: Mbr, mode: QueryMode, order: TraversalOrder) -> QueryIter<'a> {
        let page_size = tree.params.iter_page_size;
        let mut it = QueryIter {
            tree,
            query,
            mode,
            page_size,
            work: WorkList::new(order, root),
            pinned: Vec::new(),
            valid: true,
        };
        it.pin(root);
        it
    }

    fn pin(&mut self, id: NodeId) {
        if self.tree.fetch(id).is_ok() {
            self.tree.cache.pin(id);
            self.pinned.push(id);
        }
    }

    fn unpin(&mut self, id: NodeId) {
        self.tree.cache.unpin(id);
        self.pinned.retain(|x| *x != id);
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
        for id in self.pinned.drain(..) {
            self.tree.cache.unpin(id);
        }
    }

    pub fn has_next(&self) -> bool {
        self.valid && !self.work.is_empty()
    }

    /// Every node currently on the work list, for the pinning-contract test
    /// (spec scenario S6).
    pub fn pinned_nodes(&self) -> Vec<NodeId> {
        self.work.iter().copied().collect()
    }

    /// Fill and return up to one page ([crate::config::Params::iter_page_size])
    /// of matching records. An empty, non-empty-work-list result never
    /// happens: callers should stop once `has_next()` is false.
    pub fn next_page(&mut self) -> Result<Vec<DataRecord>> {
        let mut out = Vec::new();
        if !self.valid {
            return Ok(out);
        }

        while out.len() < self.page_size {
            let node_id = match self.work.pop() {
                Some(id) => id,
                None => break,
            };
            let arc = match self.tree.fetch(node_id) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let node: std::sync::MutexGuard<Bucket> = arc.lock().unwrap();
            self.unpin(node_id);

            let fully_contained = self.mode == QueryMode::Contains && self.query.contains(&node.mbr)?;

            for child in &node.children {
                match (child.is_leaf_child(), fully_contained) {
                    (true, true) => out.push(child_record(child)),
                    (true, false) => {
                        let matches = match self.mode {
                            QueryMode::Intersects => child.mbr().intersects(&self.query)?,
                            QueryMode::Contains => self.query.contains(child.mbr())?,
                        };
                        if matches {
                            out.push(child_record(child));
                        }
                    }
                    (false, _) => {
                        let descend = fully_contained || child.mbr().intersects(&self.query)?;
                        if descend {
                            self.work.push(child.id());
                            self.pin(child.id());
                        }
                    }
                }
            }
        }

        Ok(out)
    }
}

fn child_record(child: &crate::types::ChildRef) -> DataRecord {
    match child {
        crate::types::ChildRef::Record { record, .. } => record.clone(),
        crate::types::ChildRef::Bucket { .. } => unreachable!("leaf child is never a Bucket variant"),
    }
}

impl<'a> Drop for QueryIter<'a> {
    fn drop(&mut self) {
        self.invalidate();
    }
}
