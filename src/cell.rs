//! Cells and the geometry primitives computed over them.
//!
//! A cell is one rowid plus an axis-aligned box of `2 * dim` coordinates,
//! laid out `(lo0, hi0, lo1, hi1, ...)`. On a leaf the rowid identifies a
//! user row; on an internal node it is the child node number.
//!
//! [`CoordSpace`] carries the per-index dimension count and coordinate
//! interpretation, and implements every box computation the insert, split
//! and query paths need. All results are widened to `f64`.

use crate::coord::{Coord, CoordKind, WideCoord};
use crate::rtree::constants::MAX_DIMENSIONS;

/// Maximum number of coordinate slots a cell can carry.
pub const MAX_COORDS: usize = MAX_DIMENSIONS * 2;

/// A deserialized r-tree record. Only the first `2 * dim` coordinate slots
/// are meaningful for a given index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cell {
    pub rowid: i64,
    pub coords: [Coord; MAX_COORDS],
}

/// The coordinate space of one index: dimension count and interpretation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoordSpace {
    dim: usize,
    kind: CoordKind,
}

impl CoordSpace {
    pub fn new(dim: usize, kind: CoordKind) -> CoordSpace {
        CoordSpace { dim, kind }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn kind(&self) -> CoordKind {
        self.kind
    }

    /// Serialized size of one cell: 8-byte rowid plus `2 * dim` coordinates.
    pub fn bytes_per_cell(&self) -> usize {
        8 + self.dim * 8
    }

    pub fn widen(&self, c: Coord) -> WideCoord {
        c.widen(self.kind)
    }

    /// N-dimensional volume of the cell's box.
    pub fn area(&self, c: &Cell) -> WideCoord {
        let mut area = 1.0;
        for d in 0..self.dim {
            area *= self.widen(c.coords[d * 2 + 1]) - self.widen(c.coords[d * 2]);
        }
        area
    }

    /// Sum of the box extents over all dimensions.
    pub fn margin(&self, c: &Cell) -> WideCoord {
        let mut margin = 0.0;
        for d in 0..self.dim {
            margin += self.widen(c.coords[d * 2 + 1]) - self.widen(c.coords[d * 2]);
        }
        margin
    }

    /// Replaces `a`'s box with the elementwise union of `a` and `b`.
    pub fn union_into(&self, a: &mut Cell, b: &Cell) {
        match self.kind {
            CoordKind::Float32 => {
                for d in 0..self.dim {
                    let lo = a.coords[d * 2].as_f32().min(b.coords[d * 2].as_f32());
                    let hi = a.coords[d * 2 + 1].as_f32().max(b.coords[d * 2 + 1].as_f32());
                    a.coords[d * 2] = Coord::from_f32(lo);
                    a.coords[d * 2 + 1] = Coord::from_f32(hi);
                }
            }
            CoordKind::Int32 => {
                for d in 0..self.dim {
                    let lo = a.coords[d * 2].as_i32().min(b.coords[d * 2].as_i32());
                    let hi = a.coords[d * 2 + 1].as_i32().max(b.coords[d * 2 + 1].as_i32());
                    a.coords[d * 2] = Coord::from_i32(lo);
                    a.coords[d * 2 + 1] = Coord::from_i32(hi);
                }
            }
        }
    }

    /// True iff the box of `b` lies entirely inside the box of `a`.
    pub fn contains(&self, a: &Cell, b: &Cell) -> bool {
        for d in 0..self.dim {
            let outside = match self.kind {
                CoordKind::Float32 => {
                    b.coords[d * 2].as_f32() < a.coords[d * 2].as_f32()
                        || b.coords[d * 2 + 1].as_f32() > a.coords[d * 2 + 1].as_f32()
                }
                CoordKind::Int32 => {
                    b.coords[d * 2].as_i32() < a.coords[d * 2].as_i32()
                        || b.coords[d * 2 + 1].as_i32() > a.coords[d * 2 + 1].as_i32()
                }
            };
            if outside {
                return false;
            }
        }
        true
    }

    /// Amount `a`'s area would grow if unioned with `b`.
    pub fn growth(&self, a: &Cell, b: &Cell) -> WideCoord {
        let mut merged = *a;
        let before = self.area(&merged);
        self.union_into(&mut merged, b);
        self.area(&merged) - before
    }

    /// Sum of the intersection volumes of `p` with every cell in `set`,
    /// skipping the entry at `exclude` if given. A dimension with no
    /// intersection contributes zero for that cell.
    pub fn overlap(&self, p: &Cell, set: &[Cell], exclude: Option<usize>) -> WideCoord {
        let mut total = 0.0;
        for (i, other) in set.iter().enumerate() {
            if exclude == Some(i) {
                continue;
            }
            let mut o = 1.0;
            for d in 0..self.dim {
                let x1 = self.widen(p.coords[d * 2]).max(self.widen(other.coords[d * 2]));
                let x2 = self
                    .widen(p.coords[d * 2 + 1])
                    .min(self.widen(other.coords[d * 2 + 1]));
                if x2 < x1 {
                    o = 0.0;
                    break;
                }
                o *= x2 - x1;
            }
            total += o;
        }
        total
    }

    /// Increase in overlap against `set` if `insert` were unioned into `p`.
    /// The entry at `exclude` (the cell `p` itself) is skipped on both
    /// sides of the difference.
    pub fn overlap_enlargement(
        &self,
        p: &Cell,
        insert: &Cell,
        set: &[Cell],
        exclude: usize,
    ) -> WideCoord {
        let before = self.overlap(p, set, Some(exclude));
        let mut merged = *p;
        self.union_into(&mut merged, insert);
        let after = self.overlap(&merged, set, Some(exclude));
        after - before
    }
}
