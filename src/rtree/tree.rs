//! The r-tree engine: lifecycle, insert, delete and update paths.
//!
//! `Rtree` is the virtual-table object. It owns the backing-store adapter,
//! the node cache and the tree bookkeeping, all behind a cheap-clone handle;
//! cursors hold a clone, so the instance outlives every open scan.
//!
//! The write paths implement the R*-tree algorithms: ChooseSubtree with the
//! overlap-enlargement rule at the leaf-parent level, AdjustTree, the
//! margin-driven split, forced reinsert (at most once per height per
//! top-level insert, never on the root), and the delete-time condense
//! protocol that queues under-full nodes and re-inserts their cells.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cell::{Cell, CoordSpace};
use crate::coord::{value_down, value_up, Coord, CoordKind};
use crate::error::{RtreeError, RtreeResult};
use crate::geometry::GeometryRegistry;
use crate::rtree::cache::NodeCache;
use crate::rtree::codec::write_u16;
use crate::rtree::constants::{MAX_CELLS, MAX_DIMENSIONS, PAGE_RESERVE};
use crate::rtree::node::{node_cell_count, read_cell, NodeRef};
use crate::rtree::storage::BackingStore;
use crate::value::Value;

/// Conflict handling mode the host has in effect for a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictMode {
    /// A duplicate rowid is an error.
    Abort,
    /// A duplicate rowid deletes the existing row first.
    Replace,
}

/// Snapshot of engine counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct RtreeStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub node_reads: u64,
    pub node_writes: u64,
    pub splits: u64,
    pub reinserts: u64,
}

pub(crate) struct TreeState {
    pub cache: NodeCache,
    /// Nodes condensed out of the tree, waiting for their cells to be
    /// re-inserted: (page bytes, subtree height).
    pub pending: Vec<(Vec<u8>, usize)>,
    /// Largest height forced reinsert has run on during the current
    /// top-level insert; -1 when none has.
    pub reinsert_height: i32,
    pub splits: u64,
    pub reinserts: u64,
}

pub(crate) struct RtreeInner {
    pub store: Arc<dyn BackingStore>,
    pub geometry: Arc<GeometryRegistry>,
    pub db_name: String,
    pub name: RwLock<String>,
    pub columns: Vec<String>,
    pub space: CoordSpace,
    pub node_size: usize,
    pub state: Mutex<TreeState>,
}

/// An r-tree index packaged as a virtual table.
#[derive(Clone)]
pub struct Rtree {
    pub(crate) inner: Arc<RtreeInner>,
}

impl std::fmt::Debug for Rtree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rtree")
            .field("name", &self.inner.name)
            .field("db_name", &self.inner.db_name)
            .finish()
    }
}

fn validate_args(args: &[String]) -> RtreeResult<()> {
    if args.len() < 6 {
        return Err(RtreeError::Schema(
            "Too few columns for an rtree table".to_string(),
        ));
    }
    if args.len() > MAX_DIMENSIONS * 2 + 4 {
        return Err(RtreeError::Schema(
            "Too many columns for an rtree table".to_string(),
        ));
    }
    if args.len() % 2 != 0 {
        return Err(RtreeError::Schema(
            "Wrong number of columns for an rtree table".to_string(),
        ));
    }
    Ok(())
}

impl Rtree {
    /// Creates a new index: derives the node size from the host page size,
    /// creates the three shadow tables with a zero-filled root node, and
    /// declares the table schema.
    ///
    /// `args` follow the host module convention: `args[0]` is the module
    /// name, `args[1]` the database name, `args[2]` the table name and
    /// `args[3..]` the column declarations (rowid alias first, then
    /// `2 * dim` coordinate columns).
    pub fn create(
        store: Arc<dyn BackingStore>,
        geometry: Arc<GeometryRegistry>,
        args: &[String],
        kind: CoordKind,
    ) -> RtreeResult<Rtree> {
        validate_args(args)?;
        let dim = (args.len() - 4) / 2;
        let space = CoordSpace::new(dim, kind);

        let mut node_size = store.page_size()?.saturating_sub(PAGE_RESERVE);
        if 4 + space.bytes_per_cell() * MAX_CELLS < node_size {
            node_size = 4 + space.bytes_per_cell() * MAX_CELLS;
        }
        store.create_shadow_tables(node_size)?;
        log::debug!(
            "created rtree table {:?} ({} dimensions, {} byte nodes)",
            args[2],
            dim,
            node_size
        );
        Ok(Self::assemble(store, geometry, args, space, node_size))
    }

    /// Connects to an existing index, re-deriving the node size from the
    /// stored root node.
    pub fn connect(
        store: Arc<dyn BackingStore>,
        geometry: Arc<GeometryRegistry>,
        args: &[String],
        kind: CoordKind,
    ) -> RtreeResult<Rtree> {
        validate_args(args)?;
        let dim = (args.len() - 4) / 2;
        let space = CoordSpace::new(dim, kind);
        let node_size = store.root_size()?;
        log::debug!("connected rtree table {:?} ({} byte nodes)", args[2], node_size);
        Ok(Self::assemble(store, geometry, args, space, node_size))
    }

    fn assemble(
        store: Arc<dyn BackingStore>,
        geometry: Arc<GeometryRegistry>,
        args: &[String],
        space: CoordSpace,
        node_size: usize,
    ) -> Rtree {
        let cache = NodeCache::new(node_size, space.bytes_per_cell());
        Rtree {
            inner: Arc::new(RtreeInner {
                store,
                geometry,
                db_name: args[1].clone(),
                name: RwLock::new(args[2].clone()),
                columns: args[3..].to_vec(),
                space,
                node_size,
                state: Mutex::new(TreeState {
                    cache,
                    pending: Vec::new(),
                    reinsert_height: -1,
                    splits: 0,
                    reinserts: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.name.read().clone()
    }

    /// Name of the database the index lives in.
    pub fn database_name(&self) -> &str {
        &self.inner.db_name
    }

    pub fn dim(&self) -> usize {
        self.inner.space.dim()
    }

    pub fn coord_kind(&self) -> CoordKind {
        self.inner.space.kind()
    }

    pub fn node_size(&self) -> usize {
        self.inner.node_size
    }

    /// The table declaration the host registers for this index.
    pub fn schema_decl(&self) -> String {
        format!("CREATE TABLE x({});", self.inner.columns.join(", "))
    }

    pub fn stats(&self) -> RtreeStats {
        let st = self.inner.state.lock();
        RtreeStats {
            cache_hits: st.cache.hits,
            cache_misses: st.cache.misses,
            node_reads: st.cache.reads,
            node_writes: st.cache.writes,
            splits: st.splits,
            reinserts: st.reinserts,
        }
    }

    /// Current depth of the stored tree (0 = all data on the root).
    pub fn tree_depth(&self) -> RtreeResult<usize> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        let st = &mut *state;
        let root = inner.acquire(st, 1, None)?;
        let depth = st.cache.depth as usize;
        inner.release(st, root)?;
        Ok(depth)
    }

    /// Renames the shadow tables for a new virtual-table name.
    pub fn rename(&self, new_name: &str) -> RtreeResult<()> {
        self.inner.store.rename_shadow_tables(new_name)?;
        let mut name = self.inner.name.write();
        log::debug!("renamed rtree table {:?} to {:?}", *name, new_name);
        *name = new_name.to_string();
        Ok(())
    }

    /// Drops the shadow tables. Outstanding cursors keep the in-memory
    /// object alive until they are closed.
    pub fn destroy(self) -> RtreeResult<()> {
        log::debug!("destroying rtree table {:?}", self.name());
        self.inner.store.drop_shadow_tables()
    }

    /// Applies a host write.
    ///
    /// `args[0]` is the rowid to delete (Null for a pure insert), `args[1]`
    /// the new rowid (Null to have the host assign one), and `args[2..]`
    /// the `2 * dim` coordinates interleaved `(lo0, hi0, lo1, hi1, ...)`.
    /// Returns the rowid of the inserted row, if any.
    pub fn update(&self, args: &[Value], on_conflict: ConflictMode) -> RtreeResult<Option<i64>> {
        if args.is_empty() {
            return Err(RtreeError::constraint("update requires at least one value"));
        }
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        let st = &mut *state;
        let dim = inner.space.dim();

        let mut cell = Cell::default();
        let mut have_rowid = false;

        if args.len() > 1 {
            if args.len() != 2 + dim * 2 {
                return Err(RtreeError::constraint(format!(
                    "expected {} coordinate values, got {}",
                    dim * 2,
                    args.len() - 2
                )));
            }

            // Decode the coordinates. For float indexes the stored range is
            // widened so it always contains the requested range; an
            // inverted range is rejected before anything is written.
            for d in 0..dim {
                match inner.space.kind() {
                    CoordKind::Float32 => {
                        let lo = value_down(args[2 + d * 2].as_f64());
                        let hi = value_up(args[2 + d * 2 + 1].as_f64());
                        if lo > hi {
                            return Err(RtreeError::constraint(format!(
                                "dimension {}: low coordinate exceeds high",
                                d
                            )));
                        }
                        cell.coords[d * 2] = Coord::from_f32(lo);
                        cell.coords[d * 2 + 1] = Coord::from_f32(hi);
                    }
                    CoordKind::Int32 => {
                        let lo = args[2 + d * 2].as_i64() as i32;
                        let hi = args[2 + d * 2 + 1].as_i64() as i32;
                        if lo > hi {
                            return Err(RtreeError::constraint(format!(
                                "dimension {}: low coordinate exceeds high",
                                d
                            )));
                        }
                        cell.coords[d * 2] = Coord::from_i32(lo);
                        cell.coords[d * 2 + 1] = Coord::from_i32(hi);
                    }
                }
            }

            // An explicitly supplied rowid that already exists is a
            // constraint failure, unless the conflict mode says to replace
            // the existing row.
            if !args[1].is_null() {
                cell.rowid = args[1].as_i64();
                if args[0].is_null() || args[0].as_i64() != cell.rowid {
                    if inner.store.read_rowid(cell.rowid)?.is_some() {
                        if on_conflict == ConflictMode::Replace {
                            inner.delete_rowid(st, cell.rowid)?;
                        } else {
                            return Err(RtreeError::constraint(format!(
                                "rowid {} already exists",
                                cell.rowid
                            )));
                        }
                    }
                }
                have_rowid = true;
            }
        }

        if !args[0].is_null() {
            inner.delete_rowid(st, args[0].as_i64())?;
        }

        if args.len() > 1 {
            if !have_rowid {
                cell.rowid = inner.store.write_rowid(None, None)?;
            }
            let leaf = inner.choose_subtree(st, &cell, 0)?;
            st.reinsert_height = -1;
            let rc = inner.insert_cell(st, leaf, &cell, 0);
            inner.release_after(st, leaf, rc)?;
            return Ok(Some(cell.rowid));
        }
        Ok(None)
    }

    /// Walks the stored tree and verifies its structural invariants:
    /// bounding-box tightness, cell-count bounds, depth consistency and
    /// the rowid/parent maps.
    pub fn integrity_check(&self) -> RtreeResult<()> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        let st = &mut *state;
        let root = inner.acquire(st, 1, None)?;
        let depth = st.cache.depth as usize;
        let rc = inner.check_subtree(st, root, depth).map(|_| ());
        inner.release_after(st, root, rc)
    }
}

impl RtreeInner {
    pub fn max_cells(&self) -> usize {
        (self.node_size - 4) / self.space.bytes_per_cell()
    }

    pub fn min_cells(&self) -> usize {
        self.max_cells() / 3
    }

    pub fn acquire(
        &self,
        st: &mut TreeState,
        id: i64,
        parent: Option<NodeRef>,
    ) -> RtreeResult<NodeRef> {
        st.cache.acquire(self.store.as_ref(), id, parent)
    }

    pub fn release(&self, st: &mut TreeState, r: NodeRef) -> RtreeResult<()> {
        st.cache.release(self.store.as_ref(), r)
    }

    /// Releases `r` after `rc`, preserving the first error.
    pub fn release_after(&self, st: &mut TreeState, r: NodeRef, rc: RtreeResult<()>) -> RtreeResult<()> {
        let rc2 = self.release(st, r);
        rc.and(rc2)
    }

    /// Index of the cell holding `rowid` within `node`. The caller knows the
    /// cell must be there; its absence means the structure is corrupt.
    pub fn node_rowid_index(
        &self,
        st: &TreeState,
        node: NodeRef,
        rowid: i64,
    ) -> RtreeResult<usize> {
        let n = st.cache.node(node).cell_count();
        for i in 0..n {
            if st.cache.node(node).cell_rowid(&self.space, i) == rowid {
                return Ok(i);
            }
        }
        Err(RtreeError::corrupt(format!(
            "rowid {} not found on node {}",
            rowid,
            st.cache.node(node).id
        )))
    }

    /// Index of the cell pointing at `node` within its parent, or None for
    /// the root.
    pub fn node_parent_index(&self, st: &TreeState, node: NodeRef) -> RtreeResult<Option<usize>> {
        match st.cache.node(node).parent {
            None => Ok(None),
            Some(parent) => {
                let id = st.cache.node(node).id;
                self.node_rowid_index(st, parent, id).map(Some)
            }
        }
    }

    /// Descends from the root to the node at `target_height` best suited to
    /// receive `cell`. At the leaf-parent level the child minimizing overlap
    /// enlargement wins (ties: area growth, then area); above it, the child
    /// minimizing area growth (ties: area).
    pub fn choose_subtree(
        &self,
        st: &mut TreeState,
        cell: &Cell,
        target_height: usize,
    ) -> RtreeResult<NodeRef> {
        let mut node = self.acquire(st, 1, None)?;
        let depth = st.cache.depth;

        let levels = (depth as usize).saturating_sub(target_height);
        for level in 0..levels {
            let n = st.cache.node(node).cell_count();
            let leaf_parent = level as i32 == depth - 1;

            let siblings: Vec<Cell> = if leaf_parent {
                (0..n).map(|i| st.cache.node(node).cell(&self.space, i)).collect()
            } else {
                Vec::new()
            };

            let mut best_rowid = 0i64;
            let mut min_growth = 0.0;
            let mut min_area = 0.0;
            let mut min_overlap = 0.0;
            for i in 0..n {
                let c = st.cache.node(node).cell(&self.space, i);
                let growth = self.space.growth(&c, cell);
                let area = self.space.area(&c);
                let overlap = if leaf_parent {
                    self.space.overlap_enlargement(&c, cell, &siblings, i)
                } else {
                    0.0
                };
                let best = i == 0
                    || overlap < min_overlap
                    || (overlap == min_overlap && growth < min_growth)
                    || (overlap == min_overlap && growth == min_growth && area < min_area);
                if best {
                    min_overlap = overlap;
                    min_growth = growth;
                    min_area = area;
                    best_rowid = c.rowid;
                }
            }

            let child = match self.acquire(st, best_rowid, Some(node)) {
                Ok(child) => child,
                Err(e) => {
                    let _ = self.release(st, node);
                    return Err(e);
                }
            };
            self.release(st, node)?;
            node = child;
        }
        Ok(node)
    }

    /// A cell with the same content as `cell` was just inserted under
    /// `node`; expands every ancestor cell that does not already cover it.
    pub fn adjust_tree(&self, st: &mut TreeState, node: NodeRef, cell: &Cell) -> RtreeResult<()> {
        let mut p = node;
        while let Some(parent) = st.cache.node(p).parent {
            let i = self
                .node_parent_index(st, p)?
                .ok_or_else(|| RtreeError::corrupt("parent link without parent cell"))?;
            let mut pc = st.cache.node(parent).cell(&self.space, i);
            if !self.space.contains(&pc, cell) {
                self.space.union_into(&mut pc, cell);
                st.cache.node_mut(parent).overwrite_cell(&self.space, i, &pc);
            }
            p = parent;
        }
        Ok(())
    }

    /// If the child node `child_rowid` points at is in memory, hands its
    /// parent slot over to `new_parent`.
    fn reparent_child(
        &self,
        st: &mut TreeState,
        child_rowid: i64,
        new_parent: NodeRef,
    ) -> RtreeResult<()> {
        if let Some(child) = st.cache.lookup(child_rowid) {
            if let Some(old) = st.cache.node_mut(child).parent.take() {
                self.release(st, old)?;
            }
            st.cache.add_ref(new_parent);
            st.cache.node_mut(child).parent = Some(new_parent);
        }
        Ok(())
    }

    /// Records that the entry `rowid` now lives on `node`: the `_rowid` map
    /// for leaf entries, the `_parent` map (plus in-memory re-parenting)
    /// for child nodes.
    fn update_mapping(
        &self,
        st: &mut TreeState,
        rowid: i64,
        node: NodeRef,
        height: usize,
    ) -> RtreeResult<()> {
        if height > 0 {
            self.reparent_child(st, rowid, node)?;
            let node_id = st.cache.node(node).id;
            self.store.write_parent(rowid, node_id)?;
        } else {
            let node_id = st.cache.node(node).id;
            self.store.write_rowid(Some(rowid), Some(node_id))?;
        }
        Ok(())
    }

    /// Inserts `cell` into `node`, which heads a subtree of the given
    /// height. Overflow triggers forced reinsert the first time a height is
    /// hit during a top-level insert, and a split otherwise.
    pub fn insert_cell(
        &self,
        st: &mut TreeState,
        node: NodeRef,
        cell: &Cell,
        height: usize,
    ) -> RtreeResult<()> {
        if height > 0 {
            self.reparent_child(st, cell.rowid, node)?;
        }
        let max = self.max_cells();
        let full = st.cache.node_mut(node).append_cell(&self.space, cell, max);
        if full {
            if height as i32 <= st.reinsert_height || st.cache.node(node).id == 1 {
                self.split_node(st, node, cell, height)
            } else {
                st.reinsert_height = height as i32;
                self.reinsert(st, node, cell, height)
            }
        } else {
            self.adjust_tree(st, node, cell)?;
            if height == 0 {
                let node_id = st.cache.node(node).id;
                self.store.write_rowid(Some(cell.rowid), Some(node_id))?;
            } else {
                let node_id = st.cache.node(node).id;
                self.store.write_parent(cell.rowid, node_id)?;
            }
            Ok(())
        }
    }

    /// R*-tree split: distributes the node's cells plus `cell` over two
    /// nodes along the dimension with the smallest margin sum, at the split
    /// point with the least overlap.
    fn split_node(
        &self,
        st: &mut TreeState,
        node: NodeRef,
        cell: &Cell,
        height: usize,
    ) -> RtreeResult<()> {
        st.splits += 1;

        let n = st.cache.node(node).cell_count();
        let mut cells: Vec<Cell> = (0..n)
            .map(|i| st.cache.node(node).cell(&self.space, i))
            .collect();
        cells.push(*cell);

        st.cache.node_mut(node).zero_entries();

        let was_root = st.cache.node(node).id == 1;
        let left;
        let right;
        if was_root {
            right = st.cache.new_node(Some(node));
            left = st.cache.new_node(Some(node));
            st.cache.depth += 1;
            let depth = st.cache.depth as u16;
            let root = st.cache.node_mut(node);
            write_u16(&mut root.data[0..2], depth);
            root.dirty = true;
        } else {
            left = node;
            st.cache.add_ref(left);
            let parent = st.cache.node(node).parent;
            right = st.cache.new_node(parent);
        }
        st.cache.node_mut(left).data.fill(0);
        st.cache.node_mut(left).dirty = true;

        let rc = self.split_node_work(st, cells, cell.rowid, was_root, left, right, height);
        let rc = self.release_after(st, right, rc);
        self.release_after(st, left, rc)
    }

    fn split_node_work(
        &self,
        st: &mut TreeState,
        cells: Vec<Cell>,
        new_rowid: i64,
        was_root: bool,
        left: NodeRef,
        right: NodeRef,
        height: usize,
    ) -> RtreeResult<()> {
        let (mut left_bbox, mut right_bbox) = self.assign_cells(st, &cells, left, right);

        // Both halves need node numbers before the parent cells can point
        // at them. The right node is always fresh; the left may already
        // have one.
        st.cache.flush(self.store.as_ref(), right)?;
        if st.cache.node(left).id == 0 {
            st.cache.flush(self.store.as_ref(), left)?;
        }
        left_bbox.rowid = st.cache.node(left).id;
        right_bbox.rowid = st.cache.node(right).id;

        if was_root {
            let parent = st
                .cache
                .node(left)
                .parent
                .ok_or_else(|| RtreeError::corrupt("split of a node with no parent link"))?;
            self.insert_cell(st, parent, &left_bbox, height + 1)?;
        } else {
            let parent = st
                .cache
                .node(left)
                .parent
                .ok_or_else(|| RtreeError::corrupt("split of a node with no parent link"))?;
            let i = self
                .node_parent_index(st, left)?
                .ok_or_else(|| RtreeError::corrupt("parent link without parent cell"))?;
            st.cache
                .node_mut(parent)
                .overwrite_cell(&self.space, i, &left_bbox);
            self.adjust_tree(st, parent, &left_bbox)?;
        }

        let right_parent = st
            .cache
            .node(right)
            .parent
            .ok_or_else(|| RtreeError::corrupt("split of a node with no parent link"))?;
        self.insert_cell(st, right_parent, &right_bbox, height + 1)?;

        let mut new_cell_went_right = false;
        for i in 0..st.cache.node(right).cell_count() {
            let rowid = st.cache.node(right).cell_rowid(&self.space, i);
            self.update_mapping(st, rowid, right, height)?;
            if rowid == new_rowid {
                new_cell_went_right = true;
            }
        }
        if was_root {
            for i in 0..st.cache.node(left).cell_count() {
                let rowid = st.cache.node(left).cell_rowid(&self.space, i);
                self.update_mapping(st, rowid, left, height)?;
            }
        } else if !new_cell_went_right {
            self.update_mapping(st, new_rowid, left, height)?;
        }
        Ok(())
    }

    /// Distributes `cells` over `left` and `right` per Beckmann's R*-tree
    /// split and returns the two bounding boxes.
    fn assign_cells(
        &self,
        st: &mut TreeState,
        cells: &[Cell],
        left: NodeRef,
        right: NodeRef,
    ) -> (Cell, Cell) {
        let n = cells.len();
        let dim = self.space.dim();
        let m = self.min_cells();

        // One index ordering per dimension, sorted by (lo, hi).
        let sorted: Vec<Vec<usize>> = (0..dim)
            .map(|d| {
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by(|&a, &b| {
                    let key_a = (
                        self.space.widen(cells[a].coords[d * 2]),
                        self.space.widen(cells[a].coords[d * 2 + 1]),
                    );
                    let key_b = (
                        self.space.widen(cells[b].coords[d * 2]),
                        self.space.widen(cells[b].coords[d * 2 + 1]),
                    );
                    key_a
                        .partial_cmp(&key_b)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                order
            })
            .collect();

        let mut best_dim = 0;
        let mut best_split = 0;
        let mut best_margin = 0.0;
        for d in 0..dim {
            let mut margin = 0.0;
            let mut min_overlap = 0.0;
            let mut min_area = 0.0;
            let mut best_left = 0;

            for n_left in m..=(n - m) {
                let mut lbox = cells[sorted[d][0]];
                for k in 1..n_left {
                    self.space.union_into(&mut lbox, &cells[sorted[d][k]]);
                }
                let mut rbox = cells[sorted[d][n - 1]];
                for k in n_left..n - 1 {
                    self.space.union_into(&mut rbox, &cells[sorted[d][k]]);
                }
                margin += self.space.margin(&lbox) + self.space.margin(&rbox);
                let overlap = self.space.overlap(&lbox, std::slice::from_ref(&rbox), None);
                let area = self.space.area(&lbox) + self.space.area(&rbox);
                if n_left == m || overlap < min_overlap || (overlap == min_overlap && area < min_area)
                {
                    best_left = n_left;
                    min_overlap = overlap;
                    min_area = area;
                }
            }

            if d == 0 || margin < best_margin {
                best_dim = d;
                best_margin = margin;
                best_split = best_left;
            }
        }

        let max = self.max_cells();
        let mut left_bbox = cells[sorted[best_dim][0]];
        let mut right_bbox = cells[sorted[best_dim][best_split]];
        for (pos, &ci) in sorted[best_dim].iter().enumerate() {
            let (target, bbox) = if pos < best_split {
                (left, &mut left_bbox)
            } else {
                (right, &mut right_bbox)
            };
            st.cache.node_mut(target).append_cell(&self.space, &cells[ci], max);
            self.space.union_into(bbox, &cells[ci]);
        }
        (left_bbox, right_bbox)
    }

    /// R*-tree forced reinsert: keeps the cells nearest the node center and
    /// re-inserts the `m` farthest from the root at the same height.
    fn reinsert(
        &self,
        st: &mut TreeState,
        node: NodeRef,
        cell: &Cell,
        height: usize,
    ) -> RtreeResult<()> {
        st.reinserts += 1;

        let dim = self.space.dim();
        let n = st.cache.node(node).cell_count() + 1;
        let mut cells: Vec<Cell> = (0..n - 1)
            .map(|i| st.cache.node(node).cell(&self.space, i))
            .collect();
        cells.push(*cell);

        // Mean of the cell centers, per dimension.
        let mut center = [0.0f64; MAX_DIMENSIONS];
        for c in &cells {
            for (d, slot) in center.iter_mut().enumerate().take(dim) {
                *slot += self.space.widen(c.coords[d * 2]) + self.space.widen(c.coords[d * 2 + 1]);
            }
        }
        for slot in center.iter_mut().take(dim) {
            *slot /= (n * 2) as f64;
        }

        let distance: Vec<f64> = cells
            .iter()
            .map(|c| {
                let mut dist = 0.0;
                for (d, ctr) in center.iter().enumerate().take(dim) {
                    let mid = (self.space.widen(c.coords[d * 2])
                        + self.space.widen(c.coords[d * 2 + 1]))
                        / 2.0;
                    dist += (mid - ctr) * (mid - ctr);
                }
                dist
            })
            .collect();

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            distance[a]
                .partial_cmp(&distance[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Rebuild the node with the nearest cells; the farthest go back
        // through ChooseSubtree at the same height.
        st.cache.node_mut(node).zero_entries();
        let keep = n - self.min_cells();
        let max = self.max_cells();
        for &ci in order.iter().take(keep) {
            let c = &cells[ci];
            st.cache.node_mut(node).append_cell(&self.space, c, max);
            if c.rowid == cell.rowid {
                let node_id = st.cache.node(node).id;
                if height == 0 {
                    self.store.write_rowid(Some(c.rowid), Some(node_id))?;
                } else {
                    self.store.write_parent(c.rowid, node_id)?;
                }
            }
        }
        self.fix_bounding_box(st, node)?;

        for &ci in order.iter().skip(keep) {
            let c = cells[ci];
            let target = self.choose_subtree(st, &c, height)?;
            let rc = self.insert_cell(st, target, &c, height);
            self.release_after(st, target, rc)?;
        }
        Ok(())
    }

    /// Loads the ancestor chain of `leaf` from the `_parent` map, refusing
    /// assignments that would close a reference cycle.
    fn fix_leaf_parent(&self, st: &mut TreeState, leaf: NodeRef) -> RtreeResult<()> {
        let mut child = leaf;
        loop {
            let (child_id, has_parent) = {
                let n = st.cache.node(child);
                (n.id, n.parent.is_some())
            };
            if child_id == 1 || has_parent {
                return Ok(());
            }
            let parent_id = self.store.read_parent(child_id)?.ok_or_else(|| {
                RtreeError::corrupt(format!("no parent entry for node {}", child_id))
            })?;

            // Walk the chain assembled so far; finding the prospective
            // parent in it would close a cycle.
            let mut probe = Some(leaf);
            while let Some(r) = probe {
                if st.cache.node(r).id == parent_id {
                    return Err(RtreeError::corrupt(format!(
                        "parent map cycle through node {}",
                        parent_id
                    )));
                }
                probe = st.cache.node(r).parent;
            }

            let parent = self.acquire(st, parent_id, None)?;
            st.cache.node_mut(child).parent = Some(parent);
            child = parent;
        }
    }

    /// Recomputes the bounding box of `node` inside its parent cell and
    /// propagates the tightened box to the root.
    fn fix_bounding_box(&self, st: &mut TreeState, node: NodeRef) -> RtreeResult<()> {
        if let Some(parent) = st.cache.node(node).parent {
            let n = st.cache.node(node).cell_count();
            let mut bbox = st.cache.node(node).cell(&self.space, 0);
            for i in 1..n {
                let c = st.cache.node(node).cell(&self.space, i);
                self.space.union_into(&mut bbox, &c);
            }
            bbox.rowid = st.cache.node(node).id;
            let i = self
                .node_parent_index(st, node)?
                .ok_or_else(|| RtreeError::corrupt("parent link without parent cell"))?;
            st.cache.node_mut(parent).overwrite_cell(&self.space, i, &bbox);
            self.fix_bounding_box(st, parent)?;
        }
        Ok(())
    }

    /// Removes `node` from the tree: deletes its cell from the parent,
    /// drops its rows, and queues its page for re-insertion of its cells.
    fn remove_node(&self, st: &mut TreeState, node: NodeRef, height: usize) -> RtreeResult<()> {
        let i = self
            .node_parent_index(st, node)?
            .ok_or_else(|| RtreeError::corrupt("removing a node with no parent link"))?;
        let parent = st
            .cache
            .node_mut(node)
            .parent
            .take()
            .ok_or_else(|| RtreeError::corrupt("removing a node with no parent link"))?;
        let rc = self.delete_cell(st, parent, i, height + 1);
        self.release_after(st, parent, rc)?;

        let node_id = st.cache.node(node).id;
        self.store.delete_node(node_id)?;
        self.store.delete_parent(node_id)?;

        let page = st.cache.node(node).data.clone();
        st.pending.push((page, height));
        st.cache.hash_remove(node);
        st.cache.node_mut(node).dirty = false;
        Ok(())
    }

    /// Deletes cell `i` of `node` and condenses the tree: a non-root node
    /// left under-full is removed and queued for re-insertion, otherwise
    /// the ancestor boxes are tightened.
    fn delete_cell(
        &self,
        st: &mut TreeState,
        node: NodeRef,
        i: usize,
        height: usize,
    ) -> RtreeResult<()> {
        self.fix_leaf_parent(st, node)?;
        st.cache.node_mut(node).remove_cell(&self.space, i);

        if st.cache.node(node).parent.is_some() {
            if st.cache.node(node).cell_count() < self.min_cells() {
                self.remove_node(st, node, height)?;
            } else {
                self.fix_bounding_box(st, node)?;
            }
        }
        Ok(())
    }

    /// Removes the entry with the given rowid from the tree, then drains
    /// the pending-reinsert queue and collapses a single-child root.
    pub fn delete_rowid(&self, st: &mut TreeState, rowid: i64) -> RtreeResult<()> {
        // The root reference also initialises the recorded depth.
        let root = self.acquire(st, 1, None)?;

        let rc = self.delete_rowid_work(st, root, rowid);
        self.release_after(st, root, rc)
    }

    fn delete_rowid_work(&self, st: &mut TreeState, root: NodeRef, rowid: i64) -> RtreeResult<()> {
        if let Some(leaf_id) = self.store.read_rowid(rowid)? {
            let leaf = self.acquire(st, leaf_id, None)?;
            let rc = self
                .node_rowid_index(st, leaf, rowid)
                .and_then(|i| self.delete_cell(st, leaf, i, 0));
            self.release_after(st, leaf, rc)?;
        }

        self.store.delete_rowid(rowid)?;

        // A root with exactly one child is replaced by that child: the
        // child is removed, its cells queued, and the tree gets shorter.
        if st.cache.depth > 0 && st.cache.node(root).cell_count() == 1 {
            let child_id = st.cache.node(root).cell_rowid(&self.space, 0);
            let child = self.acquire(st, child_id, Some(root))?;
            let rc = self.remove_node(st, child, st.cache.depth as usize - 1);
            self.release_after(st, child, rc)?;
            st.cache.depth -= 1;
            let depth = st.cache.depth as u16;
            let root_node = st.cache.node_mut(root);
            write_u16(&mut root_node.data[0..2], depth);
            root_node.dirty = true;
        }

        // Re-insert the contents of every node condensed out of the tree.
        let mut rc = Ok(());
        while let Some((page, height)) = st.pending.pop() {
            if rc.is_ok() {
                rc = self.reinsert_page(st, &page, height);
            }
        }
        rc
    }

    fn reinsert_page(&self, st: &mut TreeState, page: &[u8], height: usize) -> RtreeResult<()> {
        for i in 0..node_cell_count(page) as usize {
            let cell = read_cell(&self.space, page, i);
            let target = self.choose_subtree(st, &cell, height)?;
            let rc = self.insert_cell(st, target, &cell, height);
            self.release_after(st, target, rc)?;
        }
        Ok(())
    }

    /// Verifies the subtree headed by `node` and returns its bounding box.
    fn check_subtree(
        &self,
        st: &mut TreeState,
        node: NodeRef,
        height: usize,
    ) -> RtreeResult<Option<Cell>> {
        let n = st.cache.node(node).cell_count();
        let node_id = st.cache.node(node).id;
        if node_id != 1 && (n < self.min_cells() || n > self.max_cells()) {
            return Err(RtreeError::corrupt(format!(
                "node {} holds {} cells, outside [{}, {}]",
                node_id,
                n,
                self.min_cells(),
                self.max_cells()
            )));
        }

        let mut bbox: Option<Cell> = None;
        for i in 0..n {
            let c = st.cache.node(node).cell(&self.space, i);
            for d in 0..self.space.dim() {
                if self.space.widen(c.coords[d * 2]) > self.space.widen(c.coords[d * 2 + 1]) {
                    return Err(RtreeError::corrupt(format!(
                        "inverted range on node {} cell {}",
                        node_id, i
                    )));
                }
            }

            if height > 0 {
                if self.store.read_parent(c.rowid)? != Some(node_id) {
                    return Err(RtreeError::corrupt(format!(
                        "parent map entry for node {} is wrong",
                        c.rowid
                    )));
                }
                let child = self.acquire(st, c.rowid, Some(node))?;
                let rc = self.check_subtree(st, child, height - 1);
                let child_bbox = match rc {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = self.release(st, child);
                        return Err(e);
                    }
                };
                self.release(st, child)?;
                if let Some(cb) = child_bbox {
                    for j in 0..self.space.dim() * 2 {
                        if cb.coords[j].bits() != c.coords[j].bits() {
                            return Err(RtreeError::corrupt(format!(
                                "cell {} on node {} is not the tight union of node {}",
                                i, node_id, c.rowid
                            )));
                        }
                    }
                }
            } else if self.store.read_rowid(c.rowid)? != Some(node_id) {
                return Err(RtreeError::corrupt(format!(
                    "rowid map entry for {} is wrong",
                    c.rowid
                )));
            }

            match bbox.as_mut() {
                None => bbox = Some(c),
                Some(b) => self.space.union_into(b, &c),
            }
        }
        Ok(bbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryRegistry;
    use crate::rtree::codec::{read_u16, write_i64, write_u16};
    use crate::rtree::node::{node_cell_count, node_depth};
    use crate::rtree::storage::MemoryStore;

    fn args(cols: &[&str]) -> Vec<String> {
        let mut v = vec!["rtree".to_string(), "main".to_string(), "rt".to_string()];
        v.extend(cols.iter().map(|s| s.to_string()));
        v
    }

    /// 1-D float index over 112-byte nodes: 16 bytes per cell, so at most
    /// 6 and at least 2 cells per node.
    fn small_float_tree() -> (Arc<MemoryStore>, Rtree) {
        let store = Arc::new(MemoryStore::with_page_size(176));
        let tree = Rtree::create(
            store.clone(),
            Arc::new(GeometryRegistry::new()),
            &args(&["id", "x0", "x1"]),
            CoordKind::Float32,
        )
        .unwrap();
        (store, tree)
    }

    fn insert_f(tree: &Rtree, rowid: i64, lo: f64, hi: f64) {
        tree.update(
            &[
                Value::Null,
                Value::Integer(rowid),
                Value::Real(lo),
                Value::Real(hi),
            ],
            ConflictMode::Abort,
        )
        .unwrap();
    }

    fn delete(tree: &Rtree, rowid: i64) {
        tree.update(&[Value::Integer(rowid)], ConflictMode::Abort)
            .unwrap();
    }

    fn all_rowids(tree: &Rtree) -> Vec<i64> {
        let mut cursor = tree.cursor();
        cursor.filter(2, &[], &[]).unwrap();
        let mut out = Vec::new();
        while !cursor.eof() {
            out.push(cursor.rowid().unwrap());
            cursor.next().unwrap();
        }
        out
    }

    fn cache_is_idle(tree: &Rtree) -> bool {
        tree.inner.state.lock().cache.occupied() == 0
    }

    #[test]
    fn test_create_validates_column_count() {
        let make = |cols: &[&str]| {
            Rtree::create(
                Arc::new(MemoryStore::new()),
                Arc::new(GeometryRegistry::new()),
                &args(cols),
                CoordKind::Float32,
            )
        };
        let err = make(&["id", "x0"]).unwrap_err();
        assert_eq!(err.to_string(), "Too few columns for an rtree table");

        let err = make(&[
            "id", "a0", "a1", "b0", "b1", "c0", "c1", "d0", "d1", "e0", "e1", "f0",
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "Too many columns for an rtree table");

        let err = make(&["id", "x0", "x1", "y0"]).unwrap_err();
        assert_eq!(err.to_string(), "Wrong number of columns for an rtree table");
    }

    #[test]
    fn test_create_derives_node_size() {
        let (_, tree) = small_float_tree();
        assert_eq!(tree.node_size(), 112);
        assert_eq!(tree.dim(), 1);

        // Large pages are capped so a node never exceeds 51 cells.
        let tree = Rtree::create(
            Arc::new(MemoryStore::with_page_size(65536)),
            Arc::new(GeometryRegistry::new()),
            &args(&["id", "x0", "x1", "y0", "y1"]),
            CoordKind::Int32,
        )
        .unwrap();
        assert_eq!(tree.node_size(), 4 + 24 * 51);
    }

    #[test]
    fn test_schema_decl() {
        let (_, tree) = small_float_tree();
        assert_eq!(tree.schema_decl(), "CREATE TABLE x(id, x0, x1);");
    }

    #[test]
    fn test_fresh_tree_is_empty() {
        let (store, tree) = small_float_tree();
        assert_eq!(tree.tree_depth().unwrap(), 0);
        assert_eq!(all_rowids(&tree), Vec::<i64>::new());
        let root = store.read_node(1).unwrap().unwrap();
        assert!(root.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_split_on_seventh_insert() {
        let (store, tree) = small_float_tree();
        for i in 1..=7 {
            insert_f(&tree, i, i as f64, i as f64 + 0.5);
            assert!(cache_is_idle(&tree));
        }

        assert_eq!(tree.tree_depth().unwrap(), 1);
        let root = store.read_node(1).unwrap().unwrap();
        assert_eq!(node_depth(&root), 1);
        assert_eq!(node_cell_count(&root), 2);

        // Each leaf holds between 2 and 6 cells and the leaf boxes union
        // to the full range [1.0, 7.5].
        let space = CoordSpace::new(1, CoordKind::Float32);
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for i in 0..2 {
            let cell = read_cell(&space, &root, i);
            let leaf = store.read_node(cell.rowid).unwrap().unwrap();
            let n = node_cell_count(&leaf) as usize;
            assert!((2..=6).contains(&n), "leaf has {} cells", n);
            lo = lo.min(cell.coords[0].as_f32());
            hi = hi.max(cell.coords[1].as_f32());
        }
        assert_eq!(lo, 1.0);
        assert_eq!(hi, 7.5);

        assert_eq!(all_rowids(&tree), vec![1, 2, 3, 4, 5, 6, 7]);
        tree.integrity_check().unwrap();
    }

    #[test]
    fn test_reinsert_never_runs_on_the_root() {
        let (_, tree) = small_float_tree();
        for i in 1..=7 {
            insert_f(&tree, i, i as f64, i as f64 + 0.5);
        }
        // The seventh insert overflowed the root, which must split rather
        // than reinsert.
        let stats = tree.stats();
        assert_eq!(stats.splits, 1);
        assert_eq!(stats.reinserts, 0);
    }

    #[test]
    fn test_forced_reinsert_once_per_insert() {
        let (_, tree) = small_float_tree();
        let mut i = 1;
        while tree.stats().reinserts == 0 {
            assert!(i <= 100, "no reinsert after {} inserts", i);
            insert_f(&tree, i, i as f64, i as f64 + 0.5);
            tree.integrity_check().unwrap();
            i += 1;
        }
        // The insert that first overflowed a leaf ran reinsert exactly
        // once; the recursion guard stops any further reinsert at that
        // height within the same top-level insert.
        assert_eq!(tree.stats().reinserts, 1);
        let rowids = all_rowids(&tree);
        assert_eq!(rowids.len() as i64, i - 1);
    }

    #[test]
    fn test_delete_and_condense() {
        let (store, tree) = small_float_tree();
        for i in 1..=7 {
            insert_f(&tree, i, i as f64, i as f64 + 0.5);
        }

        // Shrink the fuller leaf to its minimum.
        for rowid in [5, 6, 7] {
            delete(&tree, rowid);
            tree.integrity_check().unwrap();
            assert!(cache_is_idle(&tree));
        }
        assert_eq!(tree.tree_depth().unwrap(), 1);

        // One more delete leaves that leaf under-full: it is condensed,
        // its survivors re-inserted, and the root collapses to a leaf.
        delete(&tree, 3);
        tree.integrity_check().unwrap();
        assert_eq!(tree.tree_depth().unwrap(), 0);

        let root = store.read_node(1).unwrap().unwrap();
        assert_eq!(node_depth(&root), 0);
        assert_eq!(node_cell_count(&root), 3);
        let mut rowids = all_rowids(&tree);
        rowids.sort_unstable();
        assert_eq!(rowids, vec![1, 2, 4]);

        // The condensed leaves' rows are gone from the node table.
        let (nodes, rowids, parents) = store.row_counts();
        assert_eq!(nodes, 1);
        assert_eq!(rowids, 3);
        assert_eq!(parents, 0);
    }

    #[test]
    fn test_duplicate_rowid_replace() {
        let store = Arc::new(MemoryStore::new());
        let tree = Rtree::create(
            store.clone(),
            Arc::new(GeometryRegistry::new()),
            &args(&["id", "x0", "x1", "y0", "y1"]),
            CoordKind::Int32,
        )
        .unwrap();

        let row = |rowid: i64, v: i64| {
            vec![
                Value::Null,
                Value::Integer(rowid),
                Value::Integer(v),
                Value::Integer(v),
                Value::Integer(v),
                Value::Integer(v),
            ]
        };
        tree.update(&row(1, 0), ConflictMode::Abort).unwrap();
        tree.update(&row(1, 5), ConflictMode::Replace).unwrap();

        let mut cursor = tree.cursor();
        cursor.filter(1, &[], &[Value::Integer(1)]).unwrap();
        assert!(!cursor.eof());
        for col in 1..=4 {
            assert_eq!(cursor.column(col).unwrap(), Value::Integer(5));
        }
        drop(cursor);

        let (_, rowid_rows, _) = store.row_counts();
        assert_eq!(rowid_rows, 1);

        // Without REPLACE the duplicate is a constraint error.
        let err = tree.update(&row(1, 9), ConflictMode::Abort).unwrap_err();
        assert!(matches!(err, RtreeError::Constraint(_)));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let store = Arc::new(MemoryStore::new());
        let tree = Rtree::create(
            store.clone(),
            Arc::new(GeometryRegistry::new()),
            &args(&["id", "x0", "x1", "y0", "y1"]),
            CoordKind::Int32,
        )
        .unwrap();
        let before = store.read_node(1).unwrap().unwrap();

        let err = tree
            .update(
                &[
                    Value::Null,
                    Value::Integer(10),
                    Value::Integer(3),
                    Value::Integer(1),
                    Value::Integer(0),
                    Value::Integer(0),
                ],
                ConflictMode::Abort,
            )
            .unwrap_err();
        assert!(matches!(err, RtreeError::Constraint(_)));

        // Nothing was written.
        assert_eq!(store.read_node(1).unwrap().unwrap(), before);
        assert_eq!(store.row_counts(), (1, 0, 0));
    }

    #[test]
    fn test_parent_cycle_is_corruption() {
        let (store, tree) = small_float_tree();

        // Hand-build a root pointing at leaf 5 whose parent entry points
        // back at itself.
        let mut leaf = vec![0u8; 112];
        write_u16(&mut leaf[2..4], 1);
        write_i64(&mut leaf[4..12], 42);
        let cell_lo = Coord::from_f32(1.0);
        let cell_hi = Coord::from_f32(2.0);
        leaf[12..16].copy_from_slice(&cell_lo.bits().to_be_bytes());
        leaf[16..20].copy_from_slice(&cell_hi.bits().to_be_bytes());
        store.write_node(Some(5), &leaf).unwrap();

        let mut root = vec![0u8; 112];
        write_u16(&mut root[0..2], 1);
        write_u16(&mut root[2..4], 1);
        write_i64(&mut root[4..12], 5);
        root[12..16].copy_from_slice(&cell_lo.bits().to_be_bytes());
        root[16..20].copy_from_slice(&cell_hi.bits().to_be_bytes());
        store.write_node(Some(1), &root).unwrap();

        store.write_rowid(Some(42), Some(5)).unwrap();
        store.write_parent(5, 5).unwrap();

        let err = tree
            .update(&[Value::Integer(42)], ConflictMode::Abort)
            .unwrap_err();
        assert!(matches!(err, RtreeError::Corrupt(_)), "got {:?}", err);

        // The node table was not touched.
        assert_eq!(store.read_node(1).unwrap().unwrap(), root);
        assert_eq!(store.read_node(5).unwrap().unwrap(), leaf);
        assert_eq!(store.read_rowid(42).unwrap(), Some(5));
        assert!(cache_is_idle(&tree));
    }

    #[test]
    fn test_missing_parent_entry_is_corruption() {
        let (store, tree) = small_float_tree();
        for i in 1..=7 {
            insert_f(&tree, i, i as f64, i as f64 + 0.5);
        }
        // Remove the parent entries out from under the tree.
        let root = store.read_node(1).unwrap().unwrap();
        let space = CoordSpace::new(1, CoordKind::Float32);
        for i in 0..node_cell_count(&root) as usize {
            let child = read_cell(&space, &root, i).rowid;
            store.delete_parent(child).unwrap();
        }
        let err = tree
            .update(&[Value::Integer(1)], ConflictMode::Abort)
            .unwrap_err();
        assert!(matches!(err, RtreeError::Corrupt(_)));
    }

    #[test]
    fn test_insert_delete_sweep_preserves_invariants() {
        let (store, tree) = small_float_tree();
        for i in 1..=50i64 {
            insert_f(&tree, i, i as f64, i as f64 + 0.5);
            tree.integrity_check().unwrap();
            assert!(cache_is_idle(&tree));
        }
        assert!(tree.tree_depth().unwrap() >= 2);

        // Delete in a scrambled order so condense and root collapse fire
        // at various tree shapes.
        for k in 0..50i64 {
            let rowid = (k * 7) % 50 + 1;
            delete(&tree, rowid);
            tree.integrity_check().unwrap();
            assert!(cache_is_idle(&tree));
        }

        assert_eq!(tree.tree_depth().unwrap(), 0);
        assert_eq!(all_rowids(&tree), Vec::<i64>::new());
        let (nodes, rowid_rows, parent_rows) = store.row_counts();
        assert_eq!(nodes, 1);
        assert_eq!(rowid_rows, 0);
        assert_eq!(parent_rows, 0);
    }

    #[test]
    fn test_update_moves_a_row() {
        let (_, tree) = small_float_tree();
        for i in 1..=10 {
            insert_f(&tree, i, i as f64, i as f64 + 0.5);
        }
        // UPDATE rt SET x0=100, x1=101 WHERE id=4
        tree.update(
            &[
                Value::Integer(4),
                Value::Integer(4),
                Value::Real(100.0),
                Value::Real(101.0),
            ],
            ConflictMode::Abort,
        )
        .unwrap();
        tree.integrity_check().unwrap();

        let mut cursor = tree.cursor();
        cursor.filter(2, b"Da", &[Value::Real(99.0)]).unwrap();
        assert_eq!(cursor.rowid().unwrap(), 4);
        cursor.next().unwrap();
        assert!(cursor.eof());
    }

    #[test]
    fn test_host_assigns_missing_rowid() {
        let (_, tree) = small_float_tree();
        let assigned = tree
            .update(
                &[Value::Null, Value::Null, Value::Real(0.0), Value::Real(1.0)],
                ConflictMode::Abort,
            )
            .unwrap();
        assert_eq!(assigned, Some(1));
        let assigned = tree
            .update(
                &[Value::Null, Value::Null, Value::Real(2.0), Value::Real(3.0)],
                ConflictMode::Abort,
            )
            .unwrap();
        assert_eq!(assigned, Some(2));
    }

    #[test]
    fn test_float_ranges_widen_to_contain_input() {
        let (_, tree) = small_float_tree();
        insert_f(&tree, 1, 1.3, 2.7);
        let mut cursor = tree.cursor();
        cursor.filter(1, &[], &[Value::Integer(1)]).unwrap();
        let lo = match cursor.column(1).unwrap() {
            Value::Real(f) => f,
            v => panic!("unexpected {:?}", v),
        };
        let hi = match cursor.column(2).unwrap() {
            Value::Real(f) => f,
            v => panic!("unexpected {:?}", v),
        };
        assert!(lo <= 1.3 && hi >= 2.7);
        assert!((1.3 - lo).abs() < 1e-6 && (hi - 2.7).abs() < 1e-6);
    }

    #[test]
    fn test_connect_rederives_node_size() {
        let (store, tree) = small_float_tree();
        for i in 1..=12 {
            insert_f(&tree, i, i as f64, i as f64 + 0.5);
        }
        drop(tree);

        let tree = Rtree::connect(
            store,
            Arc::new(GeometryRegistry::new()),
            &args(&["id", "x0", "x1"]),
            CoordKind::Float32,
        )
        .unwrap();
        assert_eq!(tree.node_size(), 112);
        tree.integrity_check().unwrap();
        assert_eq!(all_rowids(&tree).len(), 12);
    }

    #[test]
    fn test_rename_and_destroy() {
        let (store, tree) = small_float_tree();
        insert_f(&tree, 1, 0.0, 1.0);
        tree.rename("rt2").unwrap();
        assert_eq!(tree.name(), "rt2");

        tree.destroy().unwrap();
        assert_eq!(store.row_counts(), (0, 0, 0));
    }

    #[test]
    fn test_depth_bound_rejected() {
        let (store, tree) = small_float_tree();
        let mut root = store.read_node(1).unwrap().unwrap();
        write_u16(&mut root[0..2], 41);
        store.write_node(Some(1), &root).unwrap();
        let err = tree.tree_depth().unwrap_err();
        assert!(matches!(err, RtreeError::Corrupt(_)));
        assert_eq!(read_u16(&root[0..2]), 41);
    }
}
