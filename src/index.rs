//! Index façade (spec §4.9): owns dimensions/precision/cache/storage and the
//! current root handle, serializes writers through the write [Gate], and
//! (in `Mmap` mode) drives a background snapshot thread. Grounded on the
//! teacher's `Mvcc` atomically-swapped root snapshot (`src/mvcc.rs`) for
//! the root-handle discipline and on its `util::thread::Thread` gen-server
//! pattern (`src/util/thread.rs`) for the background worker, simplified
//! here to a single `mpsc` channel rather than a generic request/response
//! abstraction.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, warn};

use crate::arena::{Arena, Offset};
use crate::bucket::{Bucket, Storage, Tree};
use crate::config::{Mode, Params};
use crate::durable::wire::{self, WireChild};
use crate::durable::NodeStore;
use crate::gate::Gate;
use crate::iter::QueryIter;
use crate::mbr::Mbr;
use crate::pagetrack::PageWriteTracker;
use crate::snapshot;
use crate::types::{ChildRef, DataRecord, NodeId, NodeKind, QueryMode, TraversalOrder};
use crate::{err_at, Error, Result};

const CACHE_CAPACITY: usize = 16 * 1024;
const PAGE_TRACK_BUCKETS: usize = 4096;

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

fn directory_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".dir");
    PathBuf::from(s)
}

struct ArenaEntry {
    offset: Offset,
    len: usize,
    kind: NodeKind,
}

/// [Storage] backing `Mode::InMemory` and `Mode::Mmap`: nodes and records
/// are encoded with [crate::durable::wire] and bump-allocated into an
/// [Arena]. Every persist is a fresh allocation rather than an in-place
/// rewrite — the same copy-on-write discipline as the durable store — so a
/// `NodeId -> Offset` directory (analogous to
/// [crate::durable::identity::IdentityTable]) tracks each node's current
/// location.
struct ArenaStorage {
    dim: usize,
    arena: Mutex<Arena>,
    directory: Mutex<HashMap<NodeId, ArenaEntry>>,
    next_id: AtomicU64,
    tracker: PageWriteTracker,
}

impl ArenaStorage {
    fn new(params: &Params) -> ArenaStorage {
        ArenaStorage {
            dim: params.dimensions,
            arena: Mutex::new(Arena::new(params)),
            directory: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1), // 0 is NodeId::NIL
            tracker: PageWriteTracker::new(PAGE_TRACK_BUCKETS),
        }
    }

    fn fresh_id(&self) -> NodeId {
        NodeId(self.next_id.fetch_add(1, SeqCst))
    }

    fn store_bytes(&self, id: NodeId, kind: NodeKind, bytes: &[u8]) -> Result<()> {
        let offset = {
            let mut arena = self.arena.lock().unwrap();
            let offset = arena.allocate(bytes.len())?;
            arena.resolve_mut(offset, bytes.len()).copy_from_slice(bytes);
            offset
        };
        self.tracker.record_write(offset.segment() as u64, 0);
        self.directory.lock().unwrap().insert(
            id,
            ArenaEntry {
                offset,
                len: bytes.len(),
                kind,
            },
        );
        Ok(())
    }

    fn load_bytes(&self, id: NodeId) -> Result<Vec<u8>> {
        let (offset, len) = {
            let dir = self.directory.lock().unwrap();
            let e = dir
                .get(&id)
                .ok_or(())
                .or_else(|_| err_at!(NotFound, msg: "no arena mapping for {}", id))?;
            (e.offset, e.len)
        };
        self.tracker.record_access(offset.segment() as u64);
        let arena = self.arena.lock().unwrap();
        Ok(arena.resolve(offset, len).to_vec())
    }

    fn load_record(&self, id: NodeId) -> Result<DataRecord> {
        let bytes = self.load_bytes(id)?;
        let (key, row_id, points) = wire::decode_record(self.dim, &bytes)?;
        Ok(DataRecord { row_id, points, key })
    }

    /// Serialize the `NodeId -> Offset` directory to `<path>.dir`,
    /// temp-then-rename like [crate::snapshot::save]. Needed alongside an
    /// arena snapshot because snapshot bytes alone carry no index from
    /// stable node identity back to physical offset.
    fn save_directory(&self, path: &Path) -> Result<()> {
        let dir = self.directory.lock().unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.next_id.load(SeqCst)).to_le_bytes());
        buf.extend_from_slice(&(dir.len() as u64).to_le_bytes());
        for (id, e) in dir.iter() {
            buf.extend_from_slice(&id.0.to_le_bytes());
            buf.extend_from_slice(&e.offset.0.to_le_bytes());
            buf.extend_from_slice(&(e.len as u64).to_le_bytes());
            buf.push(match e.kind {
                NodeKind::Bucket => 0,
                NodeKind::Record => 1,
            });
            buf.extend_from_slice(&[0u8; 7]);
        }
        let dir_path = directory_path_for(path);
        let tmp = tmp_path_for(&dir_path);
        let mut f = err_at!(SnapshotIO, File::create(&tmp), "creating {:?}", tmp)?;
        err_at!(SnapshotIO, f.write_all(&buf), "writing {:?}", tmp)?;
        err_at!(SnapshotIO, f.sync_all(), "fsync {:?}", tmp)?;
        drop(f);
        err_at!(SnapshotIO, fs::rename(&tmp, &dir_path), "renaming {:?}", dir_path)?;
        Ok(())
    }

    fn load_directory(path: &Path) -> Result<(HashMap<NodeId, ArenaEntry>, u64)> {
        let dir_path = directory_path_for(path);
        let bytes = err_at!(SnapshotIO, fs::read(&dir_path), "reading {:?}", dir_path)?;
        if bytes.len() < 16 {
            return err_at!(SnapshotCorrupt, msg: "directory file truncated");
        }
        let next_id = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let n = u64::from_le_bytes(bytes[8..16].try_into().unwrap()) as usize;
        let mut map = HashMap::with_capacity(n);
        let mut off = 16;
        for _ in 0..n {
            if bytes.len() < off + 32 {
                return err_at!(SnapshotCorrupt, msg: "directory entry truncated");
            }
            let id = NodeId(u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()));
            let offset = Offset(u64::from_le_bytes(bytes[off + 8..off + 16].try_into().unwrap()));
            let len = u64::from_le_bytes(bytes[off + 16..off + 24].try_into().unwrap()) as usize;
            let kind = if bytes[off + 24] == 0 { NodeKind::Bucket } else { NodeKind::Record };
            map.insert(id, ArenaEntry { offset, len, kind });
            off += 32;
        }
        Ok((map, next_id))
    }
}

impl Storage for ArenaStorage {
    fn new_bucket_id(&self) -> Result<NodeId> {
        Ok(self.fresh_id())
    }

    fn new_record_id(&self) -> Result<NodeId> {
        Ok(self.fresh_id())
    }

    fn persist_bucket(&self, bucket: &Bucket) -> Result<()> {
        let children: Vec<WireChild> = bucket
            .children
            .iter()
            .map(|c| WireChild {
                id: c.id(),
                mbr: c.mbr().clone(),
                is_leaf_child: c.is_leaf_child(),
            })
            .collect();
        let bytes = wire::encode_node(self.dim, &bucket.mbr, bucket.is_leaf, bucket.is_supernode, &children);
        self.store_bytes(bucket.id, NodeKind::Bucket, &bytes)
    }

    fn persist_record(&self, id: NodeId, record: &DataRecord) -> Result<()> {
        let bytes = wire::encode_record(self.dim, &record.row_id, &record.points, &record.key);
        self.store_bytes(id, NodeKind::Record, &bytes)
    }

    fn load_bucket(&self, id: NodeId) -> Result<Option<Bucket>> {
        let bytes = self.load_bytes(id)?;
        let decoded = wire::decode_node(self.dim, &bytes)?;
        let mut children = Vec::with_capacity(decoded.children.len());
        for child in decoded.children {
            if child.is_leaf_child {
                let record = self.load_record(child.id)?;
                children.push(ChildRef::Record {
                    id: child.id,
                    mbr: child.mbr,
                    record,
                });
            } else {
                children.push(ChildRef::Bucket { id: child.id, mbr: child.mbr });
            }
        }
        Ok(Some(Bucket {
            id,
            mbr: decoded.mbr,
            is_leaf: decoded.is_leaf,
            is_supernode: decoded.is_supernode,
            children,
            parent: None,
        }))
    }
}

/// Thin handle so the façade and the [Tree] it builds can share one
/// [ArenaStorage] without `Tree` itself becoming generic over it.
struct ArenaHandle(Arc<ArenaStorage>);

impl Storage for ArenaHandle {
    fn new_bucket_id(&self) -> Result<NodeId> {
        self.0.new_bucket_id()
    }
    fn new_record_id(&self) -> Result<NodeId> {
        self.0.new_record_id()
    }
    fn persist_bucket(&self, bucket: &Bucket) -> Result<()> {
        self.0.persist_bucket(bucket)
    }
    fn persist_record(&self, id: NodeId, record: &DataRecord) -> Result<()> {
        self.0.persist_record(id, record)
    }
    fn load_bucket(&self, id: NodeId) -> Result<Option<Bucket>> {
        self.0.load_bucket(id)
    }
}

/// [Storage] backing `Mode::Durable`: delegates identity, allocation, and
/// persistence entirely to [NodeStore].
struct DurableStorage {
    dim: usize,
    store: Arc<NodeStore>,
}

impl DurableStorage {
    fn ensure_capacity(&self, id: NodeId, len: usize) -> Result<()> {
        if self.store.capacity(id)? < len {
            self.store.reallocate(id, len)?;
        }
        Ok(())
    }

    fn load_record(&self, id: NodeId) -> Result<DataRecord> {
        let bytes = self.store.read_node_bytes(id)?;
        let (key, row_id, points) = wire::decode_record(self.dim, &bytes)?;
        Ok(DataRecord { row_id, points, key })
    }
}

impl Storage for DurableStorage {
    fn new_bucket_id(&self) -> Result<NodeId> {
        Ok(self.store.allocate_node(wire::SIZE_CLASSES[0], NodeKind::Bucket)?.0)
    }

    fn new_record_id(&self) -> Result<NodeId> {
        Ok(self.store.allocate_node(wire::SIZE_CLASSES[0], NodeKind::Record)?.0)
    }

    fn persist_bucket(&self, bucket: &Bucket) -> Result<()> {
        let children: Vec<WireChild> = bucket
            .children
            .iter()
            .map(|c| WireChild {
                id: c.id(),
                mbr: c.mbr().clone(),
                is_leaf_child: c.is_leaf_child(),
            })
            .collect();
        let bytes = wire::encode_node(self.dim, &bucket.mbr, bucket.is_leaf, bucket.is_supernode, &children);
        self.ensure_capacity(bucket.id, bytes.len())?;
        self.store.write_node_bytes(bucket.id, &bytes)
    }

    fn persist_record(&self, id: NodeId, record: &DataRecord) -> Result<()> {
        let bytes = wire::encode_record(self.dim, &record.row_id, &record.points, &record.key);
        self.ensure_capacity(id, bytes.len())?;
        self.store.write_node_bytes(id, &bytes)
    }

    fn load_bucket(&self, id: NodeId) -> Result<Option<Bucket>> {
        let bytes = self.store.read_node_bytes(id)?;
        let decoded = wire::decode_node(self.dim, &bytes)?;
        let mut children = Vec::with_capacity(decoded.children.len());
        for child in decoded.children {
            if child.is_leaf_child {
                let record = self.load_record(child.id)?;
                children.push(ChildRef::Record {
                    id: child.id,
                    mbr: child.mbr,
                    record,
                });
            } else {
                children.push(ChildRef::Bucket { id: child.id, mbr: child.mbr });
            }
        }
        Ok(Some(Bucket {
            id,
            mbr: decoded.mbr,
            is_leaf: decoded.is_leaf,
            is_supernode: decoded.is_supernode,
            children,
            parent: None,
        }))
    }
}

enum WorkerMsg {
    Trigger,
    Shutdown,
}

/// Background snapshot thread for `Mode::Mmap`, grounded on the teacher's
/// gen-server `Thread` (`src/util/thread.rs`) but collapsed to a single
/// `mpsc` channel: no reply channel is needed since a snapshot failure is
/// logged, not reported to the trigger (spec §5, "best-effort").
struct SnapshotWorker {
    tx: mpsc::Sender<WorkerMsg>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SnapshotWorker {
    fn spawn(
        arena_storage: Arc<ArenaStorage>,
        gate: Arc<Gate>,
        root: Arc<Mutex<(NodeId, u64)>>,
        record_count: Arc<AtomicU64>,
        path: PathBuf,
        dimensions: u32,
        precision: u32,
        time_ceiling: Duration,
    ) -> SnapshotWorker {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || loop {
            match rx.recv_timeout(time_ceiling) {
                Ok(WorkerMsg::Shutdown) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Ok(WorkerMsg::Trigger) | Err(mpsc::RecvTimeoutError::Timeout) => {
                    let result = do_snapshot(&arena_storage, &gate, &root, &path, dimensions, precision, record_count.load(SeqCst));
                    if let Err(e) = result {
                        error!("background snapshot to {:?} failed: {}", path, e);
                    }
                }
            }
        });
        SnapshotWorker { tx, handle: Some(handle) }
    }

    fn trigger(&self) {
        let _ = self.tx.send(WorkerMsg::Trigger);
    }
}

impl Drop for SnapshotWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMsg::Shutdown);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Copy the arena and its directory out to `path` under a read permit (spec
/// §5 ordering guarantee 3: the snapshot is linearized against the writer
/// that held the gate, not against a half-finished insert).
fn do_snapshot(
    arena_storage: &ArenaStorage,
    gate: &Gate,
    root: &Mutex<(NodeId, u64)>,
    path: &Path,
    dimensions: u32,
    precision: u32,
    record_count: u64,
) -> Result<()> {
    let _permit = gate.acquire_read();
    let root_id = root.lock().unwrap().0;
    let root_offset = {
        let dir = arena_storage.directory.lock().unwrap();
        dir.get(&root_id).map(|e| e.offset.0).unwrap_or(0)
    };
    {
        let arena = arena_storage.arena.lock().unwrap();
        snapshot::save(path, &arena, dimensions, precision, record_count, root_offset, now_unix())?;
    }
    arena_storage.save_directory(path)?;
    arena_storage.tracker.reset();
    Ok(())
}

/// A pageable query in progress, holding a read permit for its whole
/// lifetime so no write can interleave with iteration (spec §5).
pub struct IndexIter<'a> {
    _permit: crate::gate::ReadPermit<'a>,
    inner: QueryIter<'a>,
}

impl<'a> IndexIter<'a> {
    pub fn has_next(&self) -> bool {
        self.inner.has_next()
    }

    pub fn next_page(&mut self) -> Result<Vec<DataRecord>> {
        self.inner.next_page()
    }

    pub fn invalidate(&mut self) {
        self.inner.invalidate()
    }

    /// Nodes currently pinned on the iterator's work list, for the pinning
    /// contract test (spec scenario S6).
    pub fn pinned_nodes(&self) -> Vec<NodeId> {
        self.inner.pinned_nodes()
    }
}

/// The public entry point (spec §4.9): owns the tree, the write gate, the
/// current root handle, and (depending on `mode`) either an [ArenaStorage]
/// or a [NodeStore].
pub struct Index {
    tree: Tree,
    gate: Arc<Gate>,
    root: Arc<Mutex<(NodeId, u64)>>,
    params: Params,
    op_count: AtomicU64,
    record_count: Arc<AtomicU64>,
    closed: Mutex<bool>,
    arena_storage: Option<Arc<ArenaStorage>>,
    node_store: Option<Arc<NodeStore>>,
    snapshot_path: Option<PathBuf>,
    worker: Option<SnapshotWorker>,
}

impl Index {
    /// Build a fresh index. `path` is required for `Mode::Mmap` and
    /// `Mode::Durable`, ignored for `Mode::InMemory`.
    pub fn create(params: Params, path: Option<&Path>) -> Result<Index> {
        match params.mode {
            Mode::InMemory | Mode::Mmap => {
                if params.mode == Mode::Mmap && path.is_none() {
                    return err_at!(InvalidInput, msg: "Mmap mode requires a snapshot path");
                }
                let arena_storage = Arc::new(ArenaStorage::new(&params));
                let (tree, root_id) = Tree::new(Box::new(ArenaHandle(Arc::clone(&arena_storage))), CACHE_CAPACITY, params.clone())?;
                let gate = Arc::new(Gate::new());
                let root = Arc::new(Mutex::new((root_id, 1)));
                let record_count = Arc::new(AtomicU64::new(0));

                let (worker, snapshot_path) = if params.mode == Mode::Mmap {
                    let path = path.unwrap().to_path_buf();
                    let worker = SnapshotWorker::spawn(
                        Arc::clone(&arena_storage),
                        Arc::clone(&gate),
                        Arc::clone(&root),
                        Arc::clone(&record_count),
                        path.clone(),
                        params.dimensions as u32,
                        params.precision,
                        Duration::from_secs(params.time_ceiling_secs),
                    );
                    (Some(worker), Some(path))
                } else {
                    (None, None)
                };

                Ok(Index {
                    tree,
                    gate,
                    root,
                    params,
                    op_count: AtomicU64::new(0),
                    record_count,
                    closed: Mutex::new(false),
                    arena_storage: Some(arena_storage),
                    node_store: None,
                    snapshot_path,
                    worker,
                })
            }
            Mode::Durable => {
                let dir = path.ok_or(()).or_else(|_| err_at!(InvalidInput, msg: "Durable mode requires a directory path"))?;
                err_at!(IOError, fs::create_dir_all(dir), "creating durable store directory {:?}", dir)?;
                let node_store = Arc::new(NodeStore::create(dir)?);
                let storage = DurableStorage {
                    dim: params.dimensions,
                    store: Arc::clone(&node_store),
                };
                let (tree, root_id) = Tree::new(Box::new(storage), CACHE_CAPACITY, params.clone())?;
                node_store.set_root(root_id, 1)?;

                Ok(Index {
                    tree,
                    gate: Arc::new(Gate::new()),
                    root: Arc::new(Mutex::new((root_id, 1))),
                    params,
                    op_count: AtomicU64::new(0),
                    record_count: Arc::new(AtomicU64::new(0)),
                    closed: Mutex::new(false),
                    arena_storage: None,
                    node_store: Some(node_store),
                    snapshot_path: None,
                    worker: None,
                })
            }
        }
    }

    /// Reopen an index that was previously `close()`d. `Mode::Mmap` reloads
    /// the arena from its snapshot + directory files; `Mode::Durable`
    /// delegates to [NodeStore::recover].
    pub fn recover(params: Params, path: &Path) -> Result<Index> {
        match params.mode {
            Mode::Mmap => {
                let loaded = snapshot::load(path)?;
                if loaded.dimensions as usize != params.dimensions || loaded.precision != params.precision {
                    return err_at!(
                        InvalidInput,
                        msg: "snapshot dimensions/precision {}/{} do not match requested {}/{}",
                        loaded.dimensions,
                        loaded.precision,
                        params.dimensions,
                        params.precision
                    );
                }
                let mut arena = Arena::new(&params);
                let last = loaded.segments.len().saturating_sub(1);
                for (i, (bytes, used)) in loaded.segments.into_iter().enumerate() {
                    arena.load_segment_from(bytes, used);
                    if i == last {
                        arena.restore_state_after_load(i, used);
                    }
                }
                let (directory, next_id) = ArenaStorage::load_directory(path)?;
                let root_id = directory
                    .iter()
                    .find(|(_, e)| e.offset.0 == loaded.root_offset)
                    .map(|(id, _)| *id)
                    .ok_or(())
                    .or_else(|_| err_at!(SnapshotCorrupt, msg: "root offset {} has no directory entry", loaded.root_offset))?;

                let arena_storage = Arc::new(ArenaStorage {
                    dim: params.dimensions,
                    arena: Mutex::new(arena),
                    directory: Mutex::new(directory),
                    next_id: AtomicU64::new(next_id),
                    tracker: PageWriteTracker::new(PAGE_TRACK_BUCKETS),
                });

                let dim = params.dimensions;
                let bucket = arena_storage
                    .load_bucket(root_id)?
                    .ok_or(())
                    .or_else(|_| err_at!(SnapshotCorrupt, msg: "recovered root {} failed to decode", root_id))?;
                let tree = Tree {
                    storage: Box::new(ArenaHandle(Arc::clone(&arena_storage))),
                    cache: crate::cache::Cache::new(CACHE_CAPACITY),
                    dim,
                    params: params.clone(),
                };
                tree.cache.add(root_id, bucket);

                let gate = Arc::new(Gate::new());
                let root = Arc::new(Mutex::new((root_id, 1)));
                let record_count = Arc::new(AtomicU64::new(loaded.record_count));
                let worker = SnapshotWorker::spawn(
                    Arc::clone(&arena_storage),
                    Arc::clone(&gate),
                    Arc::clone(&root),
                    Arc::clone(&record_count),
                    path.to_path_buf(),
                    params.dimensions as u32,
                    params.precision,
                    Duration::from_secs(params.time_ceiling_secs),
                );

                Ok(Index {
                    tree,
                    gate,
                    root,
                    params,
                    op_count: AtomicU64::new(0),
                    record_count,
                    closed: Mutex::new(false),
                    arena_storage: Some(arena_storage),
                    node_store: None,
                    snapshot_path: Some(path.to_path_buf()),
                    worker: Some(worker),
                })
            }
            Mode::Durable => {
                let node_store = Arc::new(NodeStore::recover(path)?);
                let (root_id, version) = node_store
                    .get_root()
                    .ok_or(())
                    .or_else(|_| err_at!(SnapshotCorrupt, msg: "recovered store has no root"))?;
                let storage = DurableStorage {
                    dim: params.dimensions,
                    store: Arc::clone(&node_store),
                };
                let tree = Tree {
                    storage: Box::new(storage),
                    cache: crate::cache::Cache::new(CACHE_CAPACITY),
                    dim: params.dimensions,
                    params: params.clone(),
                };

                Ok(Index {
                    tree,
                    gate: Arc::new(Gate::new()),
                    root: Arc::new(Mutex::new((root_id, version))),
                    params,
                    op_count: AtomicU64::new(0),
                    record_count: Arc::new(AtomicU64::new(0)),
                    closed: Mutex::new(false),
                    arena_storage: None,
                    node_store: Some(node_store),
                    snapshot_path: None,
                    worker: None,
                })
            }
            Mode::InMemory => err_at!(InvalidInput, msg: "InMemory mode has nothing to recover"),
        }
    }

    fn current_root(&self) -> NodeId {
        self.root.lock().unwrap().0
    }

    /// Insert `record`. Increments the operation counter and, depending on
    /// mode, may trigger a background snapshot (`Mmap`) or a synchronous
    /// commit (`Durable`) once `ops_threshold` is crossed (spec §4.9).
    pub fn insert(&self, record: DataRecord) -> Result<NodeId> {
        if record.key.dim() != self.params.dimensions {
            return err_at!(
                InvalidInput,
                msg: "record has {} dimensions, index has {}",
                record.key.dim(),
                self.params.dimensions
            );
        }
        let _permit = self.gate.acquire_write();
        let root_before = self.current_root();
        let new_root = self.tree.insert(root_before, record)?;
        if new_root != root_before {
            let mut root = self.root.lock().unwrap();
            root.0 = new_root;
            root.1 += 1;
        }
        self.record_count.fetch_add(1, SeqCst);
        let n = self.op_count.fetch_add(1, SeqCst) + 1;

        if n % self.params.ops_threshold == 0 {
            match self.params.mode {
                Mode::Mmap => {
                    if let Some(w) = &self.worker {
                        w.trigger();
                    }
                }
                Mode::Durable => {
                    if let Err(e) = self.commit(n) {
                        warn!("auto-commit at op {} failed: {}", n, e);
                    }
                }
                Mode::InMemory => {}
            }
        }
        Ok(new_root)
    }

    /// Start a paged range query over the current root (spec §4.8/§4.9).
    pub fn iterate(&self, query: Mbr, mode: QueryMode) -> IndexIter<'_> {
        self.iterate_ordered(query, mode, TraversalOrder::Dfs)
    }

    pub fn iterate_ordered(&self, query: Mbr, mode: QueryMode, order: TraversalOrder) -> IndexIter<'_> {
        let permit = self.gate.acquire_read();
        let root = self.current_root();
        let inner = QueryIter::new(&self.tree, root, query, mode, order);
        IndexIter { _permit: permit, inner }
    }

    /// Durably flush all outstanding node writes and advance the root
    /// version (`Mode::Durable` only).
    pub fn commit(&self, epoch: u64) -> Result<()> {
        let store = self
            .node_store
            .as_ref()
            .ok_or(())
            .or_else(|_| err_at!(InvalidInput, msg: "commit() is only valid in Durable mode"))?;
        let (root_id, version) = *self.root.lock().unwrap();
        store.set_root(root_id, version)?;
        store.commit(epoch)
    }

    /// Flush and release resources. Safe to call more than once (spec
    /// §4.9's `close()` idempotency, L4).
    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return Ok(());
        }
        *closed = true;
        drop(closed);

        match self.params.mode {
            Mode::Mmap => {
                if let (Some(arena_storage), Some(path)) = (&self.arena_storage, &self.snapshot_path) {
                    do_snapshot(
                        arena_storage,
                        &self.gate,
                        &self.root,
                        path,
                        self.params.dimensions as u32,
                        self.params.precision,
                        self.record_count.load(SeqCst),
                    )?;
                }
            }
            Mode::Durable => {
                let epoch = self.op_count.load(SeqCst);
                self.commit(epoch)?;
            }
            Mode::InMemory => {}
        }
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.params.dimensions
    }

    pub fn precision(&self) -> u32 {
        self.params.precision
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("error while closing index: {}", e);
        }
    }
}
