//! In-memory reference backend.
//!
//! Each namespace is a `BTreeMap` keyed by raw bytes, so iteration order is
//! memcmp order, which is exactly what the key codec upstream relies on.
//! The transaction stack is a flat undo log: every write made inside a
//! transaction pushes whatever is needed to reverse it, rollback replays
//! the log backwards, commit only relabels levels.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::BasaltError;
use crate::storage::{KvCursor, KvStore, NamespaceId, SeekOp, SeekResult};
use crate::Result;

type NsMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug)]
enum UndoKind {
    /// Reverses an insert, overwrite or delete of `key`. `prior` is the
    /// value the key held before the write, `None` when it was absent.
    Put { key: Vec<u8>, prior: Option<Vec<u8>> },
    CreateNs,
    DropNs { map: NsMap },
    ClearNs { map: NsMap },
}

#[derive(Debug)]
struct UndoEntry {
    level: u32,
    ns: NamespaceId,
    kind: UndoKind,
}

#[derive(Debug)]
struct StoreInner {
    namespaces: HashMap<NamespaceId, NsMap>,
    next_ns: u32,
    level: u32,
    undo: Vec<UndoEntry>,
    /// Bumped on every mutation. Cursors remember the generation they last
    /// read under, so stale cached rows are detectable.
    generation: u64,
}

fn no_such_ns(ns: NamespaceId) -> BasaltError {
    BasaltError::NotFound(format!("no such namespace: {}", ns.0))
}

impl StoreInner {
    fn ns_map(&self, ns: NamespaceId) -> Result<&NsMap> {
        self.namespaces.get(&ns).ok_or_else(|| no_such_ns(ns))
    }

    fn ns_map_mut(&mut self, ns: NamespaceId) -> Result<&mut NsMap> {
        self.namespaces.get_mut(&ns).ok_or_else(|| no_such_ns(ns))
    }

    /// Log the reversal of a write. Level 0 runs in auto-commit, so nothing
    /// is logged and the write is final.
    fn record(&mut self, ns: NamespaceId, kind: UndoKind) {
        if self.level > 0 {
            let level = self.level;
            self.undo.push(UndoEntry { level, ns, kind });
        }
    }

    fn apply_undo(&mut self, entry: UndoEntry) {
        match entry.kind {
            UndoKind::Put { key, prior } => {
                // The namespace is always live here: structural undos
                // sitting later in the log have already been replayed.
                if let Some(map) = self.namespaces.get_mut(&entry.ns) {
                    match prior {
                        Some(value) => {
                            map.insert(key, value);
                        }
                        None => {
                            map.remove(&key);
                        }
                    }
                }
            }
            UndoKind::CreateNs => {
                self.namespaces.remove(&entry.ns);
            }
            UndoKind::DropNs { map } | UndoKind::ClearNs { map } => {
                self.namespaces.insert(entry.ns, map);
            }
        }
    }
}

#[derive(Debug)]
pub struct MemStore {
    // Cursors hold their own handle, so they stay usable for as long as
    // the caller keeps them around.
    inner: Arc<RwLock<StoreInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                namespaces: HashMap::new(),
                next_ns: 1,
                level: 0,
                undo: Vec::new(),
                generation: 0,
            })),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemStore {
    fn begin(&self, level: u32) -> Result<()> {
        let mut inner = self.inner.write();
        if level > inner.level {
            tracing::trace!("begin(level={})", level);
            inner.level = level;
        }
        Ok(())
    }

    fn commit(&self, level: u32) -> Result<()> {
        let mut inner = self.inner.write();
        if level > inner.level {
            return Err(BasaltError::TxError(format!(
                "cannot commit to level {} from level {}",
                level, inner.level
            )));
        }
        tracing::trace!("commit(level={}, from={})", level, inner.level);
        if level == 0 {
            inner.undo.clear();
        } else {
            for entry in inner.undo.iter_mut() {
                if entry.level > level {
                    entry.level = level;
                }
            }
        }
        inner.level = level;
        Ok(())
    }

    fn rollback(&self, level: u32) -> Result<()> {
        let mut inner = self.inner.write();
        if level > inner.level {
            return Err(BasaltError::TxError(format!(
                "cannot roll back to level {} from level {}",
                level, inner.level
            )));
        }
        tracing::trace!("rollback(level={}, from={})", level, inner.level);
        // rollback(0) aborts everything; rollback(n) also undoes level n
        // itself but leaves it open.
        let cut = level.max(1);
        while inner.undo.last().is_some_and(|e| e.level >= cut) {
            if let Some(entry) = inner.undo.pop() {
                inner.apply_undo(entry);
            }
        }
        inner.generation += 1;
        inner.level = level;
        Ok(())
    }

    fn current_level(&self) -> u32 {
        self.inner.read().level
    }

    fn open_cursor(&self, ns: NamespaceId) -> Result<Box<dyn KvCursor>> {
        {
            let inner = self.inner.read();
            inner.ns_map(ns)?;
        }
        Ok(Box::new(MemCursor {
            inner: Arc::clone(&self.inner),
            ns,
            state: CursorState::Invalid,
        }))
    }

    fn create_namespace(&self) -> Result<NamespaceId> {
        let mut inner = self.inner.write();
        let ns = NamespaceId(inner.next_ns);
        // Ids are never reused, even after a rollback of the create.
        inner.next_ns += 1;
        inner.namespaces.insert(ns, NsMap::new());
        inner.record(ns, UndoKind::CreateNs);
        inner.generation += 1;
        tracing::trace!("create_namespace -> {:?}", ns);
        Ok(ns)
    }

    fn drop_namespace(&self, ns: NamespaceId) -> Result<()> {
        let mut inner = self.inner.write();
        let map = inner.namespaces.remove(&ns).ok_or_else(|| no_such_ns(ns))?;
        inner.record(ns, UndoKind::DropNs { map });
        inner.generation += 1;
        tracing::trace!("drop_namespace({:?})", ns);
        Ok(())
    }

    fn clear_namespace(&self, ns: NamespaceId) -> Result<()> {
        let mut inner = self.inner.write();
        let map = std::mem::take(inner.ns_map_mut(ns)?);
        inner.record(ns, UndoKind::ClearNs { map });
        inner.generation += 1;
        Ok(())
    }

    fn namespace_len(&self, ns: NamespaceId) -> Result<u64> {
        Ok(self.inner.read().ns_map(ns)?.len() as u64)
    }
}

#[derive(Debug)]
enum CursorState {
    /// Not positioned. A seek or `first`/`last` must come first.
    Invalid,
    /// Positioned at an entry. `key` and `value` are the image captured
    /// when the cursor landed, `stamp` the store generation at that time.
    At {
        key: Vec<u8>,
        value: Vec<u8>,
        stamp: u64,
    },
    /// The entry under the cursor was deleted through it. The key stays
    /// around as the anchor for the following `next`/`prev`.
    Gone { key: Vec<u8> },
}

struct MemCursor {
    inner: Arc<RwLock<StoreInner>>,
    ns: NamespaceId,
    state: CursorState,
}

impl MemCursor {
    /// Walk away from the anchor key. Re-anchoring through a fresh range
    /// query is what keeps the cursor sane across writes made through
    /// other cursors.
    fn step_from_anchor(&mut self, forward: bool) -> Result<bool> {
        let inner = self.inner.read();
        let map = inner.ns_map(self.ns)?;
        let landed = match &self.state {
            CursorState::Invalid => return Ok(false),
            CursorState::At { key, .. } | CursorState::Gone { key } => {
                let hit = if forward {
                    map.range::<[u8], _>((Bound::Excluded(key.as_slice()), Bound::Unbounded))
                        .next()
                } else {
                    map.range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key.as_slice())))
                        .next_back()
                };
                hit.map(|(k, v)| (k.clone(), v.clone()))
            }
        };
        let stamp = inner.generation;
        drop(inner);
        match landed {
            Some((key, value)) => {
                self.state = CursorState::At { key, value, stamp };
                Ok(true)
            }
            None => {
                self.state = CursorState::Invalid;
                Ok(false)
            }
        }
    }

    fn land_on_edge(&mut self, first: bool) -> Result<bool> {
        let inner = self.inner.read();
        let map = inner.ns_map(self.ns)?;
        let hit = if first {
            map.iter().next()
        } else {
            map.iter().next_back()
        };
        let landed = hit.map(|(k, v)| (k.clone(), v.clone()));
        let stamp = inner.generation;
        drop(inner);
        match landed {
            Some((key, value)) => {
                self.state = CursorState::At { key, value, stamp };
                Ok(true)
            }
            None => {
                self.state = CursorState::Invalid;
                Ok(false)
            }
        }
    }

    fn not_positioned() -> BasaltError {
        BasaltError::Misuse("cursor is not positioned at a row".to_string())
    }
}

impl KvCursor for MemCursor {
    fn seek(&mut self, key: &[u8], op: SeekOp) -> Result<SeekResult> {
        let inner = self.inner.read();
        let map = inner.ns_map(self.ns)?;
        let hit = match op {
            SeekOp::EQ => map.get_key_value(key),
            SeekOp::GE => map
                .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
                .next(),
            SeekOp::GT => map
                .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
                .next(),
            SeekOp::LE => map
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
                .next_back(),
            SeekOp::LT => map
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back(),
        };
        let landed = hit.map(|(k, v)| (k.clone(), v.clone()));
        let stamp = inner.generation;
        drop(inner);
        match landed {
            Some((found, value)) => {
                let exact = found.as_slice() == key;
                self.state = CursorState::At {
                    key: found,
                    value,
                    stamp,
                };
                Ok(if exact {
                    SeekResult::Exact
                } else {
                    SeekResult::Nearby
                })
            }
            None => {
                self.state = CursorState::Invalid;
                Ok(SeekResult::NotFound)
            }
        }
    }

    fn first(&mut self) -> Result<bool> {
        self.land_on_edge(true)
    }

    fn last(&mut self) -> Result<bool> {
        self.land_on_edge(false)
    }

    fn next(&mut self) -> Result<bool> {
        self.step_from_anchor(true)
    }

    fn prev(&mut self) -> Result<bool> {
        self.step_from_anchor(false)
    }

    fn is_valid(&self) -> bool {
        matches!(self.state, CursorState::At { .. })
    }

    fn key(&self) -> Result<&[u8]> {
        match &self.state {
            CursorState::At { key, .. } => Ok(key),
            _ => Err(Self::not_positioned()),
        }
    }

    fn value(&self) -> Result<&[u8]> {
        match &self.state {
            CursorState::At { value, .. } => Ok(value),
            _ => Err(Self::not_positioned()),
        }
    }

    fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        let ns = self.ns;
        let map = inner.ns_map_mut(ns)?;
        let prior = map.insert(key.to_vec(), value.to_vec());
        inner.record(
            ns,
            UndoKind::Put {
                key: key.to_vec(),
                prior,
            },
        );
        inner.generation += 1;
        let stamp = inner.generation;
        drop(inner);
        self.state = CursorState::At {
            key: key.to_vec(),
            value: value.to_vec(),
            stamp,
        };
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        let (key, stamp) = match &self.state {
            CursorState::At { key, stamp, .. } => (key.clone(), *stamp),
            _ => return Err(Self::not_positioned()),
        };
        let mut inner = self.inner.write();
        let ns = self.ns;
        // Matching stamp means nothing was written since this cursor read
        // the row, so it must still be there. Otherwise re-check.
        if stamp != inner.generation && !inner.ns_map(ns)?.contains_key(&key) {
            return Err(BasaltError::NotFound(
                "cursor entry was removed by another writer".to_string(),
            ));
        }
        let map = inner.ns_map_mut(ns)?;
        let prior = map.remove(&key);
        inner.record(
            ns,
            UndoKind::Put {
                key: key.clone(),
                prior,
            },
        );
        inner.generation += 1;
        drop(inner);
        self.state = CursorState::Gone { key };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(store: &MemStore, ns: NamespaceId, key: &[u8], value: &[u8]) {
        let mut cursor = store.open_cursor(ns).unwrap();
        cursor.insert(key, value).unwrap();
    }

    fn get(store: &MemStore, ns: NamespaceId, key: &[u8]) -> Option<Vec<u8>> {
        let mut cursor = store.open_cursor(ns).unwrap();
        match cursor.seek(key, SeekOp::EQ).unwrap() {
            SeekResult::Exact => Some(cursor.value().unwrap().to_vec()),
            _ => None,
        }
    }

    fn sample_store() -> (MemStore, NamespaceId) {
        let store = MemStore::new();
        let ns = store.create_namespace().unwrap();
        for key in [b"b", b"d", b"f"] {
            put(&store, ns, key, b"v");
        }
        (store, ns)
    }

    #[test]
    fn test_seek_matrix() {
        let (store, ns) = sample_store();
        let cases: &[(SeekOp, &[u8], SeekResult, Option<&[u8]>)] = &[
            (SeekOp::GE, b"d", SeekResult::Exact, Some(b"d")),
            (SeekOp::GE, b"c", SeekResult::Nearby, Some(b"d")),
            (SeekOp::GE, b"g", SeekResult::NotFound, None),
            (SeekOp::GT, b"d", SeekResult::Nearby, Some(b"f")),
            (SeekOp::GT, b"f", SeekResult::NotFound, None),
            (SeekOp::LE, b"d", SeekResult::Exact, Some(b"d")),
            (SeekOp::LE, b"e", SeekResult::Nearby, Some(b"d")),
            (SeekOp::LE, b"a", SeekResult::NotFound, None),
            (SeekOp::LT, b"d", SeekResult::Nearby, Some(b"b")),
            (SeekOp::LT, b"b", SeekResult::NotFound, None),
            (SeekOp::EQ, b"d", SeekResult::Exact, Some(b"d")),
            (SeekOp::EQ, b"c", SeekResult::NotFound, None),
        ];
        for (op, probe, want, want_key) in cases {
            let mut cursor = store.open_cursor(ns).unwrap();
            let got = cursor.seek(probe, *op).unwrap();
            assert_eq!(got, *want, "seek({:?}, {:?})", op, probe);
            match want_key {
                Some(k) => assert_eq!(cursor.key().unwrap(), *k),
                None => assert!(!cursor.is_valid()),
            }
        }
    }

    #[test]
    fn test_scan_order() {
        let store = MemStore::new();
        let ns = store.create_namespace().unwrap();
        for key in [b"d", b"a", b"c", b"b"] {
            put(&store, ns, key, b"v");
        }
        let mut cursor = store.open_cursor(ns).unwrap();
        let mut forward = Vec::new();
        let mut more = cursor.first().unwrap();
        while more {
            forward.push(cursor.key().unwrap().to_vec());
            more = cursor.next().unwrap();
        }
        assert_eq!(forward, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert!(!cursor.is_valid());

        let mut backward = Vec::new();
        let mut more = cursor.last().unwrap();
        while more {
            backward.push(cursor.key().unwrap().to_vec());
            more = cursor.prev().unwrap();
        }
        forward.reverse();
        assert_eq!(backward, forward);
    }

    #[test]
    fn test_empty_namespace() {
        let store = MemStore::new();
        let ns = store.create_namespace().unwrap();
        let mut cursor = store.open_cursor(ns).unwrap();
        assert!(!cursor.first().unwrap());
        assert!(!cursor.last().unwrap());
        assert!(!cursor.next().unwrap());
        assert!(cursor.key().is_err());
        assert_eq!(store.namespace_len(ns).unwrap(), 0);
    }

    #[test]
    fn test_insert_repositions_cursor() {
        let (store, ns) = sample_store();
        let mut cursor = store.open_cursor(ns).unwrap();
        cursor.insert(b"c", b"new").unwrap();
        assert_eq!(cursor.key().unwrap(), b"c");
        assert_eq!(cursor.value().unwrap(), b"new");
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.key().unwrap(), b"d");
    }

    #[test]
    fn test_cursor_anchor_survives_foreign_delete() {
        let (store, ns) = sample_store();
        let mut reader = store.open_cursor(ns).unwrap();
        assert_eq!(reader.seek(b"b", SeekOp::EQ).unwrap(), SeekResult::Exact);

        let mut writer = store.open_cursor(ns).unwrap();
        assert_eq!(writer.seek(b"b", SeekOp::EQ).unwrap(), SeekResult::Exact);
        writer.delete().unwrap();

        // The reader still serves the image it captured.
        assert_eq!(reader.value().unwrap(), b"v");
        // Moving re-anchors on the saved key and skips the hole.
        assert!(reader.next().unwrap());
        assert_eq!(reader.key().unwrap(), b"d");
    }

    #[test]
    fn test_delete_then_read_is_misuse() {
        let (store, ns) = sample_store();
        let mut cursor = store.open_cursor(ns).unwrap();
        cursor.seek(b"d", SeekOp::EQ).unwrap();
        cursor.delete().unwrap();
        assert!(!cursor.is_valid());
        assert!(matches!(cursor.key(), Err(BasaltError::Misuse(_))));
        assert!(matches!(cursor.value(), Err(BasaltError::Misuse(_))));
        // The anchor still works for movement.
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.key().unwrap(), b"f");
        assert!(cursor.prev().unwrap());
        assert_eq!(cursor.key().unwrap(), b"b");
    }

    #[test]
    fn test_double_delete_detected() {
        let (store, ns) = sample_store();
        let mut stale = store.open_cursor(ns).unwrap();
        stale.seek(b"b", SeekOp::EQ).unwrap();

        let mut writer = store.open_cursor(ns).unwrap();
        writer.seek(b"b", SeekOp::EQ).unwrap();
        writer.delete().unwrap();

        assert!(matches!(stale.delete(), Err(BasaltError::NotFound(_))));
    }

    #[test]
    fn test_nested_savepoints() {
        let store = MemStore::new();
        let ns = store.create_namespace().unwrap();
        put(&store, ns, b"k0", b"base");

        store.begin(1).unwrap();
        put(&store, ns, b"k1", b"one");
        store.begin(2).unwrap();
        put(&store, ns, b"k2", b"two");
        put(&store, ns, b"k0", b"patched");

        store.rollback(2).unwrap();
        assert_eq!(store.current_level(), 2);
        assert_eq!(get(&store, ns, b"k2"), None);
        assert_eq!(get(&store, ns, b"k1"), Some(b"one".to_vec()));
        assert_eq!(get(&store, ns, b"k0"), Some(b"base".to_vec()));

        // Level 2 stays open, so it can be written and folded down.
        put(&store, ns, b"k2", b"again");
        store.commit(1).unwrap();
        assert_eq!(store.current_level(), 1);
        assert_eq!(get(&store, ns, b"k2"), Some(b"again".to_vec()));

        store.rollback(1).unwrap();
        assert_eq!(get(&store, ns, b"k2"), None);
        assert_eq!(get(&store, ns, b"k1"), None);
        assert_eq!(get(&store, ns, b"k0"), Some(b"base".to_vec()));
    }

    #[test]
    fn test_commit_to_zero_is_durable() {
        let store = MemStore::new();
        let ns = store.create_namespace().unwrap();
        store.begin(1).unwrap();
        put(&store, ns, b"k", b"v");
        store.commit(0).unwrap();
        assert_eq!(store.current_level(), 0);

        store.begin(1).unwrap();
        store.rollback(1).unwrap();
        assert_eq!(get(&store, ns, b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_autocommit_writes_survive_rollback_to_zero() {
        let store = MemStore::new();
        let ns = store.create_namespace().unwrap();
        put(&store, ns, b"k", b"v");
        store.rollback(0).unwrap();
        assert_eq!(get(&store, ns, b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_misordered_levels() {
        let store = MemStore::new();
        assert!(matches!(store.commit(1), Err(BasaltError::TxError(_))));
        assert!(matches!(store.rollback(3), Err(BasaltError::TxError(_))));
        store.begin(2).unwrap();
        // Opening a level at or below the current one is a no-op.
        store.begin(1).unwrap();
        assert_eq!(store.current_level(), 2);
    }

    #[test]
    fn test_clear_namespace_undo() {
        let (store, ns) = sample_store();
        store.begin(1).unwrap();
        store.clear_namespace(ns).unwrap();
        assert_eq!(store.namespace_len(ns).unwrap(), 0);
        put(&store, ns, b"z", b"late");
        store.rollback(1).unwrap();
        assert_eq!(store.namespace_len(ns).unwrap(), 3);
        assert_eq!(get(&store, ns, b"z"), None);
        assert_eq!(get(&store, ns, b"b"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_drop_namespace_undo() {
        let (store, ns) = sample_store();
        store.begin(1).unwrap();
        store.drop_namespace(ns).unwrap();
        assert!(matches!(store.open_cursor(ns), Err(BasaltError::NotFound(_))));
        store.rollback(1).unwrap();
        assert_eq!(store.namespace_len(ns).unwrap(), 3);
    }

    #[test]
    fn test_create_namespace_undo() {
        let store = MemStore::new();
        store.begin(1).unwrap();
        let ns = store.create_namespace().unwrap();
        put(&store, ns, b"k", b"v");
        store.rollback(1).unwrap();
        assert!(matches!(store.open_cursor(ns), Err(BasaltError::NotFound(_))));
        // Ids are not recycled.
        let next = store.create_namespace().unwrap();
        assert_ne!(next, ns);
    }

    #[test]
    fn test_unknown_namespace() {
        let store = MemStore::new();
        let ns = NamespaceId(999);
        assert!(matches!(store.open_cursor(ns), Err(BasaltError::NotFound(_))));
        assert!(matches!(store.drop_namespace(ns), Err(BasaltError::NotFound(_))));
        assert!(matches!(store.namespace_len(ns), Err(BasaltError::NotFound(_))));
    }

    #[test]
    fn test_overwrite_undo_restores_prior_value() {
        let store = MemStore::new();
        let ns = store.create_namespace().unwrap();
        put(&store, ns, b"k", b"old");
        store.begin(1).unwrap();
        put(&store, ns, b"k", b"new");
        assert_eq!(get(&store, ns, b"k"), Some(b"new".to_vec()));
        store.rollback(1).unwrap();
        assert_eq!(get(&store, ns, b"k"), Some(b"old".to_vec()));
    }
}
