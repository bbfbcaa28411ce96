//! # startree - an R*-tree index as a relational virtual table
//!
//! This crate implements a multi-dimensional spatial index - an R-tree with
//! R*-tree insertion algorithms - designed to live inside a host relational
//! database as a virtual table. It maps axis-aligned bounding boxes in 1 to
//! 5 dimensions to 64-bit rowids and answers range queries, user-defined
//! geometry predicates (MATCH) and direct rowid lookups.
//!
//! The host side is abstracted behind two seams:
//!
//! - [`BackingStore`]: the three shadow tables (`%_node`, `%_rowid`,
//!   `%_parent`) the index persists through. [`MemoryStore`] is a complete
//!   in-memory implementation.
//! - [`GeometryRegistry`]: the scalar-function mechanism that exposes
//!   geometry predicates to MATCH constraints.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use startree::{
//!     ConflictMode, CoordKind, GeometryRegistry, MemoryStore, Rtree, Value,
//! };
//!
//! # fn main() -> startree::RtreeResult<()> {
//! let args: Vec<String> = ["rtree", "main", "demo", "id", "x0", "x1", "y0", "y1"]
//!     .iter()
//!     .map(|s| s.to_string())
//!     .collect();
//! let tree = Rtree::create(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(GeometryRegistry::new()),
//!     &args,
//!     CoordKind::Float32,
//! )?;
//!
//! // INSERT INTO demo VALUES(1, 0.0, 10.0, 0.0, 10.0)
//! tree.update(
//!     &[
//!         Value::Null,
//!         Value::Integer(1),
//!         Value::Real(0.0),
//!         Value::Real(10.0),
//!         Value::Real(0.0),
//!         Value::Real(10.0),
//!     ],
//!     ConflictMode::Abort,
//! )?;
//!
//! // SELECT id FROM demo WHERE x0 <= 5.0
//! let mut cursor = tree.cursor();
//! cursor.filter(2, b"Ba", &[Value::Real(5.0)])?;
//! assert_eq!(cursor.rowid()?, 1);
//! # Ok(())
//! # }
//! ```

pub mod cell;
pub mod coord;
pub mod error;
pub mod geometry;
pub mod rtree;
pub mod value;

pub use cell::{Cell, CoordSpace};
pub use coord::{value_down, value_up, Coord, CoordKind, WideCoord};
pub use error::{RtreeError, RtreeResult};
pub use geometry::{Containment, GeometryCallback, GeometryRegistry, GeometryState};
pub use rtree::{
    BackingStore, ConflictMode, ConstraintUsage, Cursor, IndexConstraint, IndexOp, IndexPlan,
    MemoryStore, Rtree, RtreeStats,
};
pub use value::Value;
