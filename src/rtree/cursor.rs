//! Query planning and cursor scans.
//!
//! The host asks [`Rtree::best_index`] for a plan, then drives a [`Cursor`]
//! through filter/next/column/rowid. Two strategies exist: a direct rowid
//! lookup (strategy 1) and a constrained tree scan (strategy 2) whose
//! constraints travel as 2-byte `(op, column)` pairs. The scan descends
//! only into subtrees no constraint rules out, restoring its position when
//! a subtree turns out to be empty of matches.

use crate::cell::Cell;
use crate::error::{RtreeError, RtreeResult};
use crate::geometry::{decode_match, Containment, GeometryQuery};
use crate::rtree::constants::MAX_DIMENSIONS;
use crate::rtree::node::NodeRef;
use crate::rtree::tree::{Rtree, RtreeInner, TreeState};
use crate::value::Value;

/// Constraint operators as they appear in a strategy-2 plan string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueryOp {
    Eq,
    Le,
    Lt,
    Ge,
    Gt,
    Match,
}

impl QueryOp {
    pub fn to_byte(self) -> u8 {
        match self {
            QueryOp::Eq => 0x41,
            QueryOp::Le => 0x42,
            QueryOp::Lt => 0x43,
            QueryOp::Ge => 0x44,
            QueryOp::Gt => 0x45,
            QueryOp::Match => 0x46,
        }
    }

    pub fn from_byte(b: u8) -> Option<QueryOp> {
        match b {
            0x41 => Some(QueryOp::Eq),
            0x42 => Some(QueryOp::Le),
            0x43 => Some(QueryOp::Lt),
            0x44 => Some(QueryOp::Ge),
            0x45 => Some(QueryOp::Gt),
            0x46 => Some(QueryOp::Match),
            _ => None,
        }
    }
}

/// A constraint operator as the host reports it at planning time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
}

/// One WHERE-clause term offered to the planner. Column 0 is the rowid
/// alias; coordinate columns are 1-based.
#[derive(Clone, Copy, Debug)]
pub struct IndexConstraint {
    pub column: usize,
    pub op: IndexOp,
    pub usable: bool,
}

/// How the plan consumes one offered constraint.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstraintUsage {
    /// 1-based position of the constraint value in the filter arguments,
    /// or None if the plan ignores the constraint.
    pub argv_index: Option<usize>,
    /// Whether the host may skip re-checking the constraint itself.
    pub omit: bool,
}

/// A query plan: strategy number, encoded constraint string, cost estimate
/// and per-constraint usage.
#[derive(Clone, Debug)]
pub struct IndexPlan {
    pub idx_num: i32,
    pub idx_str: Vec<u8>,
    pub estimated_cost: f64,
    pub usage: Vec<ConstraintUsage>,
}

impl Rtree {
    /// Chooses a scan strategy for the given constraints.
    ///
    /// An equality on the rowid alias short-circuits to the direct-lookup
    /// strategy. Otherwise every usable coordinate or MATCH constraint is
    /// encoded into the plan string and the cost falls with the number of
    /// constraints.
    pub fn best_index(&self, constraints: &[IndexConstraint]) -> IndexPlan {
        let mut idx_str = Vec::new();
        let mut usage = vec![ConstraintUsage::default(); constraints.len()];

        for (i, c) in constraints.iter().enumerate() {
            if c.usable && c.column == 0 && c.op == IndexOp::Eq {
                // Direct lookup: two map probes and a linear cell scan,
                // nearly as cheap as a plain rowid lookup.
                for u in usage.iter_mut().take(i) {
                    *u = ConstraintUsage::default();
                }
                usage[i] = ConstraintUsage {
                    argv_index: Some(1),
                    omit: true,
                };
                return IndexPlan {
                    idx_num: 1,
                    idx_str: Vec::new(),
                    estimated_cost: 10.0,
                    usage,
                };
            }

            if c.usable
                && (c.column > 0 || c.op == IndexOp::Match)
                && idx_str.len() < MAX_DIMENSIONS * 8
            {
                let op = match c.op {
                    IndexOp::Eq => QueryOp::Eq,
                    IndexOp::Gt => QueryOp::Gt,
                    IndexOp::Le => QueryOp::Le,
                    IndexOp::Lt => QueryOp::Lt,
                    IndexOp::Ge => QueryOp::Ge,
                    IndexOp::Match => QueryOp::Match,
                };
                idx_str.push(op.to_byte());
                idx_str.push(b'a' + (c.column as u8).wrapping_sub(1));
                usage[i] = ConstraintUsage {
                    argv_index: Some(idx_str.len() / 2),
                    omit: true,
                };
            }
        }

        IndexPlan {
            idx_num: 2,
            estimated_cost: 2_000_000.0 / (idx_str.len() / 2 + 1) as f64,
            idx_str,
            usage,
        }
    }

    /// Opens a cursor over this index.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            tree: self.clone(),
            node: None,
            cell: 0,
            strategy: 0,
            constraints: Vec::new(),
        }
    }
}

/// One decoded scan constraint.
pub(crate) struct Constraint {
    pub op: QueryOp,
    /// Index of the constrained coordinate: even = lo side, odd = hi side.
    pub coord: usize,
    pub value: f64,
    pub geom: Option<GeometryQuery>,
}

/// A scan over one r-tree index.
pub struct Cursor {
    tree: Rtree,
    node: Option<NodeRef>,
    cell: usize,
    strategy: i32,
    constraints: Vec<Constraint>,
}

impl Cursor {
    /// Configures the scan from a plan produced by [`Rtree::best_index`]
    /// and positions the cursor on the first match.
    pub fn filter(&mut self, idx_num: i32, idx_str: &[u8], args: &[Value]) -> RtreeResult<()> {
        let tree = self.tree.clone();
        let inner = &*tree.inner;
        let mut state = inner.state.lock();
        let st = &mut *state;

        // Dropping old constraints also runs geometry-state destructors.
        self.constraints.clear();
        if let Some(n) = self.node.take() {
            inner.release(st, n)?;
        }
        self.strategy = idx_num;

        if idx_num == 1 {
            let rowid = args
                .first()
                .ok_or_else(|| RtreeError::constraint("rowid lookup without an argument"))?
                .as_i64();
            if let Some(leaf_id) = inner.store.read_rowid(rowid)? {
                let leaf = inner.acquire(st, leaf_id, None)?;
                match inner.node_rowid_index(st, leaf, rowid) {
                    Ok(i) => {
                        self.node = Some(leaf);
                        self.cell = i;
                    }
                    Err(e) => {
                        let _ = inner.release(st, leaf);
                        return Err(e);
                    }
                }
            }
            return Ok(());
        }

        if idx_str.len() != args.len() * 2 {
            return Err(RtreeError::constraint(
                "plan string does not match the argument count",
            ));
        }
        for (i, pair) in idx_str.chunks_exact(2).enumerate() {
            let op = QueryOp::from_byte(pair[0]).ok_or_else(|| {
                RtreeError::constraint(format!("unknown constraint operator {:#04x}", pair[0]))
            })?;
            let coord = pair[1].wrapping_sub(b'a') as usize;
            if coord >= inner.space.dim() * 2 {
                return Err(RtreeError::constraint(format!(
                    "constraint on unknown coordinate column {}",
                    coord
                )));
            }
            if op == QueryOp::Match {
                let geom = decode_match(&inner.geometry, &args[i])?;
                self.constraints.push(Constraint {
                    op,
                    coord,
                    value: 0.0,
                    geom: Some(geom),
                });
            } else {
                self.constraints.push(Constraint {
                    op,
                    coord,
                    value: args[i].as_f64(),
                    geom: None,
                });
            }
        }

        let root = inner.acquire(st, 1, None)?;
        let depth = st.cache.depth as usize;
        self.node = Some(root);
        let n = st.cache.node(root).cell_count();
        for i in 0..n {
            let mut pos_node = root;
            let mut pos_cell = i;
            match descend_to_cell(
                inner,
                st,
                &mut self.constraints,
                &mut pos_node,
                &mut pos_cell,
                depth,
            ) {
                Ok(false) => {
                    self.node = Some(pos_node);
                    self.cell = pos_cell;
                    return Ok(());
                }
                Ok(true) => {}
                Err(e) => {
                    self.node = Some(pos_node);
                    self.cell = pos_cell;
                    return Err(e);
                }
            }
        }
        self.node = None;
        inner.release(st, root)?;
        Ok(())
    }

    /// Advances to the next matching entry.
    pub fn next(&mut self) -> RtreeResult<()> {
        let tree = self.tree.clone();
        let inner = &*tree.inner;
        let mut state = inner.state.lock();
        let st = &mut *state;

        if self.strategy == 1 {
            // A rowid lookup yields at most one row.
            if let Some(n) = self.node.take() {
                inner.release(st, n)?;
            }
            return Ok(());
        }

        let mut height = 0usize;
        while let Some(node) = self.node {
            let n = st.cache.node(node).cell_count();
            let mut i = self.cell + 1;
            while i < n {
                let mut pos_node = node;
                let mut pos_cell = i;
                match descend_to_cell(
                    inner,
                    st,
                    &mut self.constraints,
                    &mut pos_node,
                    &mut pos_cell,
                    height,
                ) {
                    Ok(false) => {
                        self.node = Some(pos_node);
                        self.cell = pos_cell;
                        return Ok(());
                    }
                    Ok(true) => i += 1,
                    Err(e) => {
                        self.node = Some(pos_node);
                        self.cell = pos_cell;
                        return Err(e);
                    }
                }
            }

            // This node is exhausted; resume from its cell in the parent.
            let parent = st.cache.node(node).parent;
            let parent_index = inner.node_parent_index(st, node)?;
            self.node = parent;
            self.cell = parent_index.unwrap_or(0);
            if let Some(p) = parent {
                st.cache.add_ref(p);
            }
            inner.release(st, node)?;
            height += 1;
        }
        Ok(())
    }

    /// True once the scan is exhausted.
    pub fn eof(&self) -> bool {
        self.node.is_none()
    }

    /// Rowid of the current entry.
    pub fn rowid(&self) -> RtreeResult<i64> {
        let inner = &*self.tree.inner;
        let st = inner.state.lock();
        let node = self.node.ok_or_else(|| RtreeError::Host("cursor is at EOF".to_string()))?;
        Ok(st.cache.node(node).cell_rowid(&inner.space, self.cell))
    }

    /// Column `i` of the current entry: 0 is the rowid alias, then the
    /// coordinates in declaration order.
    pub fn column(&self, i: usize) -> RtreeResult<Value> {
        let inner = &*self.tree.inner;
        let st = inner.state.lock();
        let node = self.node.ok_or_else(|| RtreeError::Host("cursor is at EOF".to_string()))?;
        if i == 0 {
            return Ok(Value::Integer(
                st.cache.node(node).cell_rowid(&inner.space, self.cell),
            ));
        }
        if i > inner.space.dim() * 2 {
            return Err(RtreeError::Host(format!("no column {}", i)));
        }
        let coord = st.cache.node(node).cell_coord(&inner.space, self.cell, i - 1);
        Ok(match inner.space.kind() {
            crate::coord::CoordKind::Float32 => Value::Real(coord.as_f32() as f64),
            crate::coord::CoordKind::Int32 => Value::Integer(coord.as_i32() as i64),
        })
    }

    /// Releases the scan position explicitly, surfacing any write-back
    /// error from the final node release.
    pub fn close(mut self) -> RtreeResult<()> {
        let tree = self.tree.clone();
        let inner = &*tree.inner;
        let mut state = inner.state.lock();
        let st = &mut *state;
        self.constraints.clear();
        if let Some(n) = self.node.take() {
            inner.release(st, n)?;
        }
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(n) = self.node.take() {
            let inner = &*self.tree.inner;
            let mut state = inner.state.lock();
            let st = &mut *state;
            if let Err(e) = inner.release(st, n) {
                log::warn!("failed to release cursor node: {}", e);
            }
        }
    }
}

/// Tests the cell at `(node, cell)` and, for internal cells that pass,
/// descends to the left-most matching entry of the subtree below it.
/// Returns true if the cell (and its whole subtree) is filtered out; the
/// cursor position is restored in that case.
fn descend_to_cell(
    inner: &RtreeInner,
    st: &mut TreeState,
    constraints: &mut [Constraint],
    node: &mut NodeRef,
    cell: &mut usize,
    height: usize,
) -> RtreeResult<bool> {
    let saved_node = *node;
    let saved_cell = *cell;

    let filtered = if height == 0 {
        test_leaf_cell(inner, st, constraints, *node, *cell)?
    } else {
        test_internal_cell(inner, st, constraints, *node, *cell)?
    };
    if filtered || height == 0 {
        return Ok(filtered);
    }

    let child_id = st.cache.node(*node).cell_rowid(&inner.space, *cell);
    let child = inner.acquire(st, child_id, Some(*node))?;
    let prev = *node;
    *node = child;
    // The child's parent slot keeps the released node alive.
    inner.release(st, prev)?;

    let n = st.cache.node(child).cell_count();
    let mut filtered = true;
    for i in 0..n {
        *cell = i;
        filtered = descend_to_cell(inner, st, constraints, node, cell, height - 1)?;
        if !filtered {
            break;
        }
    }

    if filtered {
        debug_assert_eq!(*node, child);
        st.cache.add_ref(saved_node);
        let rc = inner.release(st, *node);
        *node = saved_node;
        *cell = saved_cell;
        rc?;
    }
    Ok(filtered)
}

fn invoke_geometry(
    inner: &RtreeInner,
    constraint: &mut Constraint,
    cell: &Cell,
) -> RtreeResult<Containment> {
    let coords: Vec<f64> = (0..inner.space.dim() * 2)
        .map(|j| inner.space.widen(cell.coords[j]))
        .collect();
    let geom = constraint
        .geom
        .as_mut()
        .ok_or_else(|| RtreeError::constraint("MATCH constraint without geometry"))?;
    geom.callback.test(&mut geom.state, &coords)
}

/// Would the subtree behind this internal cell be excluded by the
/// constraints?
fn test_internal_cell(
    inner: &RtreeInner,
    st: &TreeState,
    constraints: &mut [Constraint],
    node: NodeRef,
    icell: usize,
) -> RtreeResult<bool> {
    let cell = st.cache.node(node).cell(&inner.space, icell);
    for c in constraints.iter_mut() {
        let lo = inner.space.widen(cell.coords[(c.coord >> 1) * 2]);
        let hi = inner.space.widen(cell.coords[(c.coord >> 1) * 2 + 1]);
        let filtered = match c.op {
            QueryOp::Le | QueryOp::Lt => c.value < lo,
            QueryOp::Ge | QueryOp::Gt => c.value > hi,
            QueryOp::Eq => c.value < lo || c.value > hi,
            QueryOp::Match => invoke_geometry(inner, c, &cell)? == Containment::Disjoint,
        };
        if filtered {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Is the leaf cell excluded by the constraints? Leaf tests are exact.
fn test_leaf_cell(
    inner: &RtreeInner,
    st: &TreeState,
    constraints: &mut [Constraint],
    node: NodeRef,
    icell: usize,
) -> RtreeResult<bool> {
    let cell = st.cache.node(node).cell(&inner.space, icell);
    for c in constraints.iter_mut() {
        let matched = match c.op {
            QueryOp::Le => inner.space.widen(cell.coords[c.coord]) <= c.value,
            QueryOp::Lt => inner.space.widen(cell.coords[c.coord]) < c.value,
            QueryOp::Ge => inner.space.widen(cell.coords[c.coord]) >= c.value,
            QueryOp::Gt => inner.space.widen(cell.coords[c.coord]) > c.value,
            QueryOp::Eq => inner.space.widen(cell.coords[c.coord]) == c.value,
            QueryOp::Match => invoke_geometry(inner, c, &cell)? != Containment::Disjoint,
        };
        if !matched {
            return Ok(true);
        }
    }
    Ok(false)
}
