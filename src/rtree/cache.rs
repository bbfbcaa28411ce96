//! Reference-counted cache of node pages.
//!
//! Nodes live in an arena of slots addressed by [`NodeRef`] handles and are
//! found by node number through a fixed 128-bucket hash. A node enters
//! memory via [`NodeCache::acquire`] and leaves when its reference count
//! drops to zero, at which point a dirty page is flushed to the backing
//! store (the flush assigns a node number to pages created by splits).
//!
//! Parent handles form an up-going chain used by ancestor adjustment; each
//! occupied parent slot carries exactly one reference on the parent, so the
//! whole chain above a pinned node stays in memory.

use crate::error::{RtreeError, RtreeResult};
use crate::rtree::constants::{HASH_SIZE, MAX_DEPTH};
use crate::rtree::node::{node_cell_count, node_depth, Node, NodeRef};
use crate::rtree::storage::BackingStore;

pub(crate) struct NodeCache {
    node_size: usize,
    bytes_per_cell: usize,
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    buckets: Vec<Vec<NodeRef>>,
    /// Tree depth learned from root bytes [0..2); -1 while the root is not
    /// in memory.
    pub depth: i32,
    pub hits: u64,
    pub misses: u64,
    pub reads: u64,
    pub writes: u64,
}

impl NodeCache {
    pub fn new(node_size: usize, bytes_per_cell: usize) -> NodeCache {
        NodeCache {
            node_size,
            bytes_per_cell,
            slots: Vec::new(),
            free: Vec::new(),
            buckets: vec![Vec::new(); HASH_SIZE],
            depth: -1,
            hits: 0,
            misses: 0,
            reads: 0,
            writes: 0,
        }
    }

    pub fn node(&self, r: NodeRef) -> &Node {
        self.slots[r.0].as_ref().expect("stale node handle")
    }

    pub fn node_mut(&mut self, r: NodeRef) -> &mut Node {
        self.slots[r.0].as_mut().expect("stale node handle")
    }

    /// Number of nodes currently held in memory.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn add_ref(&mut self, r: NodeRef) {
        self.node_mut(r).refs += 1;
    }

    fn bucket_of(id: i64) -> usize {
        let x = (id >> 56)
            ^ (id >> 48)
            ^ (id >> 40)
            ^ (id >> 32)
            ^ (id >> 24)
            ^ (id >> 16)
            ^ (id >> 8)
            ^ id;
        (x as u64 % HASH_SIZE as u64) as usize
    }

    /// Finds the in-memory node with the given node number, if any.
    pub fn lookup(&self, id: i64) -> Option<NodeRef> {
        self.buckets[Self::bucket_of(id)]
            .iter()
            .copied()
            .find(|&r| self.node(r).id == id)
    }

    fn hash_insert(&mut self, r: NodeRef) {
        let id = self.node(r).id;
        debug_assert!(id != 0);
        self.buckets[Self::bucket_of(id)].push(r);
    }

    /// Unlinks `r` from the hash. Nodes with no assigned number are never
    /// hashed, and nodes condensed out of the tree are already unlinked.
    pub fn hash_remove(&mut self, r: NodeRef) {
        let id = self.node(r).id;
        if id != 0 {
            self.buckets[Self::bucket_of(id)].retain(|&x| x != r);
        }
    }

    fn alloc(&mut self, node: Node) -> NodeRef {
        match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(node);
                NodeRef(i)
            }
            None => {
                self.slots.push(Some(node));
                NodeRef(self.slots.len() - 1)
            }
        }
    }

    fn free_slot(&mut self, r: NodeRef) {
        self.slots[r.0] = None;
        self.free.push(r.0);
    }

    fn max_cells(&self) -> usize {
        (self.node_size - 4) / self.bytes_per_cell
    }

    /// Creates a zero-initialized, dirty node with no assigned node number.
    pub fn new_node(&mut self, parent: Option<NodeRef>) -> NodeRef {
        let r = self.alloc(Node {
            id: 0,
            parent,
            refs: 1,
            dirty: true,
            data: vec![0u8; self.node_size],
        });
        if let Some(p) = parent {
            self.add_ref(p);
        }
        r
    }

    /// Obtains a reference to node `id`, loading it from the backing store
    /// on a cache miss. A parent hint is attached (and referenced) if the
    /// node does not have one yet.
    pub fn acquire(
        &mut self,
        store: &dyn BackingStore,
        id: i64,
        parent: Option<NodeRef>,
    ) -> RtreeResult<NodeRef> {
        if let Some(r) = self.lookup(id) {
            self.hits += 1;
            if let Some(p) = parent {
                if self.node(r).parent.is_none() && p != r {
                    self.add_ref(p);
                    self.node_mut(r).parent = Some(p);
                }
            }
            self.node_mut(r).refs += 1;
            return Ok(r);
        }

        self.misses += 1;
        self.reads += 1;
        let data = store.read_node(id)?.ok_or_else(|| {
            RtreeError::corrupt(format!("node {} missing from backing store", id))
        })?;
        if data.len() != self.node_size {
            return Err(RtreeError::corrupt(format!(
                "node {} has size {}, expected {}",
                id,
                data.len(),
                self.node_size
            )));
        }

        // The root page records the tree depth. A depth beyond the
        // structural bound means the stored tree is corrupt.
        if id == 1 && node_depth(&data) as usize > MAX_DEPTH {
            log::warn!("rejecting root node with depth {}", node_depth(&data));
            return Err(RtreeError::corrupt(format!(
                "tree depth {} exceeds maximum {}",
                node_depth(&data),
                MAX_DEPTH
            )));
        }
        if node_cell_count(&data) as usize > self.max_cells() {
            return Err(RtreeError::corrupt(format!(
                "node {} holds {} cells, maximum is {}",
                id,
                node_cell_count(&data),
                self.max_cells()
            )));
        }

        if id == 1 {
            self.depth = node_depth(&data) as i32;
        }
        let r = self.alloc(Node {
            id,
            parent,
            refs: 1,
            dirty: false,
            data,
        });
        if let Some(p) = parent {
            self.add_ref(p);
        }
        self.hash_insert(r);
        Ok(r)
    }

    /// Writes the node out if it is dirty. A node with no assigned number
    /// receives one from the backing store and enters the hash.
    pub fn flush(&mut self, store: &dyn BackingStore, r: NodeRef) -> RtreeResult<()> {
        if self.node(r).dirty {
            let id = self.node(r).id;
            let assigned =
                store.write_node(if id != 0 { Some(id) } else { None }, &self.node(r).data)?;
            self.writes += 1;
            let node = self.node_mut(r);
            node.dirty = false;
            if id == 0 {
                node.id = assigned;
                self.hash_insert(r);
            }
        }
        Ok(())
    }

    /// Drops one reference. At zero the parent is released in turn, a dirty
    /// page is flushed, and the slot is freed.
    pub fn release(&mut self, store: &dyn BackingStore, r: NodeRef) -> RtreeResult<()> {
        {
            let node = self.node_mut(r);
            debug_assert!(node.refs > 0);
            node.refs -= 1;
            if node.refs > 0 {
                return Ok(());
            }
        }

        if self.node(r).id == 1 {
            self.depth = -1;
        }
        let parent = self.node_mut(r).parent.take();
        let mut rc = Ok(());
        if let Some(p) = parent {
            rc = self.release(store, p);
        }
        if rc.is_ok() {
            rc = self.flush(store, r);
        }
        self.hash_remove(r);
        self.free_slot(r);
        rc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtree::codec::write_u16;
    use crate::rtree::storage::MemoryStore;

    const NODE_SIZE: usize = 112;
    const BPC: usize = 16;

    fn store_with_root() -> MemoryStore {
        let store = MemoryStore::with_page_size(NODE_SIZE + 64);
        store.create_shadow_tables(NODE_SIZE).unwrap();
        store
    }

    #[test]
    fn test_acquire_release_root() {
        let store = store_with_root();
        let mut cache = NodeCache::new(NODE_SIZE, BPC);

        let root = cache.acquire(&store, 1, None).unwrap();
        assert_eq!(cache.depth, 0);
        assert_eq!(cache.node(root).id, 1);
        assert_eq!(cache.misses, 1);

        // Second acquire hits the hash.
        let again = cache.acquire(&store, 1, None).unwrap();
        assert_eq!(again, root);
        assert_eq!(cache.hits, 1);
        assert_eq!(cache.node(root).refs, 2);

        cache.release(&store, again).unwrap();
        cache.release(&store, root).unwrap();
        assert_eq!(cache.occupied(), 0);
        assert_eq!(cache.depth, -1);
    }

    #[test]
    fn test_missing_node_is_corrupt() {
        let store = store_with_root();
        let mut cache = NodeCache::new(NODE_SIZE, BPC);
        assert!(matches!(
            cache.acquire(&store, 99, None),
            Err(RtreeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_oversized_depth_is_corrupt() {
        let store = store_with_root();
        let mut data = vec![0u8; NODE_SIZE];
        write_u16(&mut data[0..2], 41);
        store.write_node(Some(1), &data).unwrap();

        let mut cache = NodeCache::new(NODE_SIZE, BPC);
        assert!(matches!(
            cache.acquire(&store, 1, None),
            Err(RtreeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_oversized_cell_count_is_corrupt() {
        let store = store_with_root();
        let mut data = vec![0u8; NODE_SIZE];
        // max cells is (112-4)/16 == 6
        write_u16(&mut data[2..4], 7);
        store.write_node(Some(1), &data).unwrap();

        let mut cache = NodeCache::new(NODE_SIZE, BPC);
        assert!(matches!(
            cache.acquire(&store, 1, None),
            Err(RtreeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_new_node_flush_assigns_number() {
        let store = store_with_root();
        let mut cache = NodeCache::new(NODE_SIZE, BPC);

        let fresh = cache.new_node(None);
        assert_eq!(cache.node(fresh).id, 0);
        assert!(cache.node(fresh).dirty);
        assert_eq!(cache.lookup(2), None);

        cache.flush(&store, fresh).unwrap();
        assert_eq!(cache.node(fresh).id, 2);
        assert_eq!(cache.lookup(2), Some(fresh));
        assert!(!cache.node(fresh).dirty);

        cache.release(&store, fresh).unwrap();
        assert_eq!(cache.occupied(), 0);
        assert_eq!(store.read_node(2).unwrap().unwrap().len(), NODE_SIZE);
    }

    #[test]
    fn test_release_flushes_dirty_page() {
        let store = store_with_root();
        let mut cache = NodeCache::new(NODE_SIZE, BPC);

        let root = cache.acquire(&store, 1, None).unwrap();
        cache.node_mut(root).data[4] = 0xAA;
        cache.node_mut(root).dirty = true;
        cache.release(&store, root).unwrap();

        assert_eq!(store.read_node(1).unwrap().unwrap()[4], 0xAA);
        assert_eq!(cache.writes, 1);
    }

    #[test]
    fn test_parent_chain_pins_ancestors() {
        let store = store_with_root();
        store.write_node(Some(2), &vec![0u8; NODE_SIZE]).unwrap();

        let mut cache = NodeCache::new(NODE_SIZE, BPC);
        let root = cache.acquire(&store, 1, None).unwrap();
        let child = cache.acquire(&store, 2, Some(root)).unwrap();
        assert_eq!(cache.node(root).refs, 2);

        // Dropping the caller's root reference keeps the root pinned
        // through the child's parent slot.
        cache.release(&store, root).unwrap();
        assert_eq!(cache.occupied(), 2);

        cache.release(&store, child).unwrap();
        assert_eq!(cache.occupied(), 0);
    }
}
