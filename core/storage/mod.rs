//! The storage layer.
//!
//! Everything below the interpreter talks to an ordered key/value backend
//! through the `KvStore` and `KvCursor` traits. Keys and values are opaque
//! byte strings ordered by memcmp; the key codec upstream is what makes
//! that ordering meaningful. The in-memory reference backend lives in
//! `memstore`.
pub mod memstore;

pub use memstore::MemStore;

use crate::Result;

/// Handle for one ordered keyspace inside a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOp {
    GE,
    GT,
    LE,
    LT,
    EQ,
}

impl SeekOp {
    /// Direction a `Nearby` landing follows, and the natural scan
    /// direction after this seek.
    pub fn forward(&self) -> bool {
        matches!(self, SeekOp::GE | SeekOp::GT | SeekOp::EQ)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    /// Positioned exactly at the requested key.
    Exact,
    /// Positioned at the adjacent entry in seek direction.
    Nearby,
    /// Nothing on that side; the cursor is invalid.
    NotFound,
}

/// Ordered KV backend.
///
/// Transactions form a level stack: level 0 is no transaction, level 1 the
/// outermost transaction, higher levels nested savepoints. Writes at level
/// 0 commit immediately and cannot be rolled back.
pub trait KvStore: Send + Sync {
    /// Open nested transactions until the current level equals `level`.
    /// A level at or below the current one is a no-op.
    fn begin(&self, level: u32) -> Result<()>;

    /// Fold every level above `level` into it and make `level` current.
    /// Committing to level 0 makes all writes durable.
    fn commit(&self, level: u32) -> Result<()>;

    /// Undo all writes made above `level` and the writes of `level` itself
    /// back to its opening point. `level` stays open and current.
    fn rollback(&self, level: u32) -> Result<()>;

    fn current_level(&self) -> u32;

    fn open_cursor(&self, ns: NamespaceId) -> Result<Box<dyn KvCursor>>;

    fn create_namespace(&self) -> Result<NamespaceId>;
    fn drop_namespace(&self, ns: NamespaceId) -> Result<()>;
    fn clear_namespace(&self, ns: NamespaceId) -> Result<()>;
    fn namespace_len(&self, ns: NamespaceId) -> Result<u64>;
}

/// A position inside one namespace. A cursor owns a handle to its store,
/// so it can outlive the reference it was opened through. Movement
/// re-anchors on the saved key, so writes through other cursors never
/// leave this one pointing at garbage; the entry image served by
/// `key`/`value` is the one captured when the cursor last moved.
pub trait KvCursor {
    fn seek(&mut self, key: &[u8], op: SeekOp) -> Result<SeekResult>;
    fn first(&mut self) -> Result<bool>;
    fn last(&mut self) -> Result<bool>;
    fn next(&mut self) -> Result<bool>;
    fn prev(&mut self) -> Result<bool>;
    fn is_valid(&self) -> bool;
    fn key(&self) -> Result<&[u8]>;
    fn value(&self) -> Result<&[u8]>;
    /// Insert or overwrite, then position the cursor at the written entry.
    fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    /// Delete the entry under the cursor. The position stays anchored for
    /// a following `next`/`prev`, but reads are invalid until then.
    fn delete(&mut self) -> Result<()>;
}
