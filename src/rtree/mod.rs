//! Disk-backed R*-tree engine behind the virtual-table surface.
//!
//! The engine stores fixed-size node pages in a host table, caches them in
//! memory with reference counts, and implements the R*-tree insert, split,
//! forced-reinsert and delete/condense algorithms over them. Queries run
//! through a cursor that prunes subtrees against the active constraints.

pub mod codec;
pub mod constants;
pub mod node;
pub mod storage;

mod cache;
mod cursor;
mod tree;

pub use cursor::{ConstraintUsage, Cursor, IndexConstraint, IndexOp, IndexPlan};
pub use storage::{BackingStore, MemoryStore};
pub use tree::{ConflictMode, Rtree, RtreeStats};
