//! Limits and fixed parameters of the r-tree structure.

/// An index may have between 1 and this many dimensions.
pub const MAX_DIMENSIONS: usize = 5;

/// Number of buckets in the in-memory node hash. The table never holds many
/// entries at once, so a fixed bucket count suffices.
pub const HASH_SIZE: usize = 128;

/// Hard cap on cells per node, applied when deriving the node size.
pub const MAX_CELLS: usize = 51;

/// The smallest node is (512 - 64) == 448 bytes and the largest cell is 48
/// bytes, so every non-root node holds at least 3 entries and the tree can
/// never legitimately be deeper than this.
pub const MAX_DEPTH: usize = 40;

/// Node size is derived from the host page size less this reservation, so
/// one node always fits a single host page.
pub const PAGE_RESERVE: usize = 64;

/// Magic word opening every geometry MATCH blob.
pub const GEOMETRY_MAGIC: u32 = 0x891245AB;
