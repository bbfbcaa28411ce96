//! The backing-store seam between the engine and the host database.
//!
//! The index persists through three host tables:
//!
//! ```text
//! %_node(nodeno INTEGER PRIMARY KEY, data BLOB)
//! %_rowid(rowid INTEGER PRIMARY KEY, nodeno INTEGER)
//! %_parent(nodeno INTEGER PRIMARY KEY, parentnode INTEGER)
//! ```
//!
//! [`BackingStore`] exposes exactly the operations the engine performs
//! against them: one read, one insert-or-replace and one delete per table,
//! plus the shadow-table lifecycle the host runs on create, connect, rename
//! and destroy. Inserts return the host-assigned key when the caller passes
//! `None`, matching auto-assigned integer primary keys.
//!
//! [`MemoryStore`] is a complete in-memory host used by tests, benches and
//! embedders that do not need durability.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::{RtreeError, RtreeResult};

/// Host-side persistence for one r-tree index.
///
/// All methods are synchronous; the host serializes access. Errors surface
/// as [`RtreeError::Host`] and pass through the engine unchanged.
pub trait BackingStore: Send + Sync {
    /// Host page size, used to derive the node size on create.
    fn page_size(&self) -> RtreeResult<usize>;

    /// Creates the three shadow tables and stores a zero-filled root node
    /// (node number 1) of `node_size` bytes.
    fn create_shadow_tables(&self, node_size: usize) -> RtreeResult<()>;

    /// Drops the three shadow tables.
    fn drop_shadow_tables(&self) -> RtreeResult<()>;

    /// Renames the three shadow tables for a new table name.
    fn rename_shadow_tables(&self, new_name: &str) -> RtreeResult<()>;

    /// Size in bytes of the stored root node, used to re-derive the node
    /// size on connect.
    fn root_size(&self) -> RtreeResult<usize>;

    fn read_node(&self, id: i64) -> RtreeResult<Option<Vec<u8>>>;

    /// Inserts or replaces a node row. With `id == None` the host assigns
    /// and returns a fresh node number.
    fn write_node(&self, id: Option<i64>, data: &[u8]) -> RtreeResult<i64>;

    fn delete_node(&self, id: i64) -> RtreeResult<()>;

    fn read_rowid(&self, rowid: i64) -> RtreeResult<Option<i64>>;

    /// Inserts or replaces a rowid mapping. With `rowid == None` the host
    /// assigns and returns a fresh rowid; `node == None` stores a null
    /// mapping (used only to allocate a rowid).
    fn write_rowid(&self, rowid: Option<i64>, node: Option<i64>) -> RtreeResult<i64>;

    fn delete_rowid(&self, rowid: i64) -> RtreeResult<()>;

    fn read_parent(&self, node: i64) -> RtreeResult<Option<i64>>;

    fn write_parent(&self, node: i64, parent: i64) -> RtreeResult<()>;

    fn delete_parent(&self, node: i64) -> RtreeResult<()>;
}

const DEFAULT_PAGE_SIZE: usize = 4096;

struct Tables {
    nodes: BTreeMap<i64, Vec<u8>>,
    rowids: BTreeMap<i64, Option<i64>>,
    parents: BTreeMap<i64, i64>,
    created: bool,
}

/// In-memory [`BackingStore`] over three ordered maps.
pub struct MemoryStore {
    page_size: usize,
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// A store reporting the given host page size. Node size derivation is
    /// `page_size - 64`, so small page sizes produce small nodes.
    pub fn with_page_size(page_size: usize) -> MemoryStore {
        MemoryStore {
            page_size,
            tables: RwLock::new(Tables {
                nodes: BTreeMap::new(),
                rowids: BTreeMap::new(),
                parents: BTreeMap::new(),
                created: false,
            }),
        }
    }

    /// Row counts of the three tables: (nodes, rowids, parents). A test and
    /// debugging aid.
    pub fn row_counts(&self) -> (usize, usize, usize) {
        let t = self.tables.read();
        (t.nodes.len(), t.rowids.len(), t.parents.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

fn next_key<V>(map: &BTreeMap<i64, V>) -> i64 {
    map.keys().next_back().map_or(1, |k| k + 1)
}

impl BackingStore for MemoryStore {
    fn page_size(&self) -> RtreeResult<usize> {
        Ok(self.page_size)
    }

    fn create_shadow_tables(&self, node_size: usize) -> RtreeResult<()> {
        let mut t = self.tables.write();
        if t.created {
            return Err(RtreeError::Host("shadow tables already exist".to_string()));
        }
        t.created = true;
        t.nodes.insert(1, vec![0u8; node_size]);
        Ok(())
    }

    fn drop_shadow_tables(&self) -> RtreeResult<()> {
        let mut t = self.tables.write();
        t.nodes.clear();
        t.rowids.clear();
        t.parents.clear();
        t.created = false;
        Ok(())
    }

    fn rename_shadow_tables(&self, _new_name: &str) -> RtreeResult<()> {
        // Tables are not addressed by name in memory; nothing to move.
        Ok(())
    }

    fn root_size(&self) -> RtreeResult<usize> {
        let t = self.tables.read();
        t.nodes
            .get(&1)
            .map(|d| d.len())
            .ok_or_else(|| RtreeError::Host("root node row missing".to_string()))
    }

    fn read_node(&self, id: i64) -> RtreeResult<Option<Vec<u8>>> {
        Ok(self.tables.read().nodes.get(&id).cloned())
    }

    fn write_node(&self, id: Option<i64>, data: &[u8]) -> RtreeResult<i64> {
        let mut t = self.tables.write();
        let id = id.unwrap_or_else(|| next_key(&t.nodes));
        t.nodes.insert(id, data.to_vec());
        Ok(id)
    }

    fn delete_node(&self, id: i64) -> RtreeResult<()> {
        self.tables.write().nodes.remove(&id);
        Ok(())
    }

    fn read_rowid(&self, rowid: i64) -> RtreeResult<Option<i64>> {
        Ok(self.tables.read().rowids.get(&rowid).copied().flatten())
    }

    fn write_rowid(&self, rowid: Option<i64>, node: Option<i64>) -> RtreeResult<i64> {
        let mut t = self.tables.write();
        let rowid = rowid.unwrap_or_else(|| next_key(&t.rowids));
        t.rowids.insert(rowid, node);
        Ok(rowid)
    }

    fn delete_rowid(&self, rowid: i64) -> RtreeResult<()> {
        self.tables.write().rowids.remove(&rowid);
        Ok(())
    }

    fn read_parent(&self, node: i64) -> RtreeResult<Option<i64>> {
        Ok(self.tables.read().parents.get(&node).copied())
    }

    fn write_parent(&self, node: i64, parent: i64) -> RtreeResult<()> {
        self.tables.write().parents.insert(node, parent);
        Ok(())
    }

    fn delete_parent(&self, node: i64) -> RtreeResult<()> {
        self.tables.write().parents.remove(&node);
        Ok(())
    }
}
