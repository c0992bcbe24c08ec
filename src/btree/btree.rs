use super::iterator::BTreeIterator;
use super::node::{inner_max_size, leaf_max_size, Node};
use crate::buffer_pool::PageSource;
use crate::pages::fixed_size::{Bounded, FixedSize};
use crate::pages::{PageId, INVALID_PAGE_ID};
use anyhow::{bail, Result};
use std::marker::PhantomData;

/// Where a key lives, as returned by [`BPlusTree::get_position`] /
/// [`BPlusTree::lower_bound`] and accepted back by [`BPlusTree::set_value`]
/// to skip a redundant descent when the caller already paid for one search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionHint {
    Found { page_id: PageId, slot: usize },
    NotFound,
}

/// A disk-backed B+ tree over fixed-size keys and values. Generic over
/// [`PageSource`] so the exact same tree logic runs against the caching
/// `BufferPoolManager` or the one-shot `ThinBufferPool`. The root page id
/// lives in one info slot of the backing pool, chosen by the caller at
/// construction time so several trees can share one pool/disk.
pub struct BPlusTree<K, V, P: PageSource> {
    pool: P,
    root_slot: usize,
    leaf_max: usize,
    leaf_min: usize,
    inner_max: usize,
    inner_min: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, P> BPlusTree<K, V, P>
where
    K: FixedSize + Ord + Copy,
    V: FixedSize + Copy,
    P: PageSource,
{
    /// Initializes `root_slot` to "empty tree". Callers must invoke this once
    /// per fresh database before constructing a tree against that slot —
    /// `new` only ever attaches to whatever is already there, so building
    /// several trees against one pool never clobbers each other's roots.
    pub fn bootstrap(pool: &P, root_slot: usize) -> Result<()> {
        pool.set_info_slot(root_slot, INVALID_PAGE_ID)
    }

    pub fn new(pool: P, root_slot: usize) -> Self {
        let frame_size = pool.frame_size();
        let leaf_max = leaf_max_size(frame_size, K::SIZE, V::SIZE);
        let inner_max = inner_max_size(frame_size, K::SIZE);
        Self::with_max_sizes(pool, root_slot, leaf_max, inner_max)
    }

    /// As [`Self::new`], but with `leaf_max`/`inner_max` capped below what
    /// the frame would actually fit. Exists so tests can force small,
    /// easy-to-reason-about splits/merges (e.g. `maxSize = 4`) without
    /// inserting thousands of keys against a real 4096-byte frame.
    pub fn with_max_sizes(pool: P, root_slot: usize, leaf_max: usize, inner_max: usize) -> Self {
        let frame_size = pool.frame_size();
        let frame_leaf_max = leaf_max_size(frame_size, K::SIZE, V::SIZE);
        let frame_inner_max = inner_max_size(frame_size, K::SIZE);
        let leaf_max = leaf_max.min(frame_leaf_max);
        let inner_max = inner_max.min(frame_inner_max);
        assert!(
            leaf_max >= 2,
            "frame too small to hold any leaf entries for this key/value size"
        );
        assert!(
            inner_max >= 2,
            "frame too small to hold any internal entries for this key size"
        );
        Self {
            pool,
            root_slot,
            leaf_max,
            leaf_min: leaf_max / 2,
            inner_max,
            inner_min: inner_max / 2,
            _marker: PhantomData,
        }
    }

    pub fn root_page_id(&self) -> PageId {
        self.pool.info_slot(self.root_slot)
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    fn set_root_page_id(&self, page_id: PageId) -> Result<()> {
        self.pool.set_info_slot(self.root_slot, page_id)
    }

    fn child_index(keys: &[K], key: &K) -> usize {
        match keys.binary_search(key) {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        }
    }

    /// Descends from the root to the leaf that would hold `key`, without
    /// recording ancestors. Used by read-only operations.
    fn find_leaf(&self, key: &K) -> Result<PageId> {
        let mut current = self.root_page_id();
        loop {
            let guard = self.pool.fetch_frame_basic(current)?;
            let is_leaf = guard.with_bytes(Node::<K, V>::is_leaf_bytes);
            if is_leaf {
                return Ok(current);
            }
            let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
            drop(guard);
            let Node::Internal { keys, children } = node else {
                unreachable!()
            };
            current = children[Self::child_index(&keys, key)];
        }
    }

    /// Descends from the root to the leaf that would hold `key`, recording
    /// the chain of ancestor page ids walked through. Used by mutating
    /// operations, which may need to splice a split upward or rebalance.
    fn find_leaf_with_breadcrumb(&self, key: &K) -> Result<(PageId, Vec<PageId>)> {
        let mut breadcrumb = Vec::new();
        let mut current = self.root_page_id();
        loop {
            let guard = self.pool.fetch_frame_basic(current)?;
            let is_leaf = guard.with_bytes(Node::<K, V>::is_leaf_bytes);
            if is_leaf {
                return Ok((current, breadcrumb));
            }
            let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
            drop(guard);
            let Node::Internal { keys, children } = node else {
                unreachable!()
            };
            breadcrumb.push(current);
            current = children[Self::child_index(&keys, key)];
        }
    }

    fn leftmost_leaf(&self, mut current: PageId) -> Result<PageId> {
        loop {
            let guard = self.pool.fetch_frame_basic(current)?;
            let is_leaf = guard.with_bytes(Node::<K, V>::is_leaf_bytes);
            if is_leaf {
                return Ok(current);
            }
            let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
            drop(guard);
            let Node::Internal { children, .. } = node else {
                unreachable!()
            };
            current = children[0];
        }
    }

    fn write_leaf(mut guard: P::Guard, next: PageId, entries: Vec<(K, V)>) {
        let node = Node::Leaf { next, entries };
        guard.with_bytes_mut(|b| node.encode(b));
    }

    fn write_internal(mut guard: P::Guard, keys: Vec<K>, children: Vec<PageId>) {
        let node = Node::Internal { keys, children };
        guard.with_bytes_mut(|b| node.encode(b));
    }

    pub fn get(&self, key: K) -> Result<Option<V>> {
        if self.is_empty() {
            return Ok(None);
        }
        let leaf_id = self.find_leaf(&key)?;
        let guard = self.pool.fetch_frame_basic(leaf_id)?;
        let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
        drop(guard);
        let Node::Leaf { entries, .. } = node else {
            unreachable!()
        };
        Ok(entries
            .binary_search_by_key(&key, |(k, _)| *k)
            .ok()
            .map(|pos| entries[pos].1))
    }

    /// Locates `key` without reading its value, for callers (like
    /// `set_value`) that want to update in place without decoding twice.
    pub fn get_position(&self, key: K) -> Result<PositionHint> {
        if self.is_empty() {
            return Ok(PositionHint::NotFound);
        }
        let leaf_id = self.find_leaf(&key)?;
        let guard = self.pool.fetch_frame_basic(leaf_id)?;
        let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
        drop(guard);
        let Node::Leaf { entries, .. } = node else {
            unreachable!()
        };
        Ok(match entries.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(pos) => PositionHint::Found { page_id: leaf_id, slot: pos },
            Err(_) => PositionHint::NotFound,
        })
    }

    /// The smallest key `>= key`, crossing into the next leaf if the current
    /// one is exhausted. `NotFound` means no such key exists in the tree.
    pub fn lower_bound(&self, key: K) -> Result<PositionHint> {
        if self.is_empty() {
            return Ok(PositionHint::NotFound);
        }
        let mut leaf_id = self.find_leaf(&key)?;
        loop {
            let guard = self.pool.fetch_frame_basic(leaf_id)?;
            let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
            drop(guard);
            let Node::Leaf { entries, next } = node else {
                unreachable!()
            };
            let pos = match entries.binary_search_by_key(&key, |(k, _)| *k) {
                Ok(pos) => pos,
                Err(pos) => pos,
            };
            if pos < entries.len() {
                return Ok(PositionHint::Found { page_id: leaf_id, slot: pos });
            }
            if next == INVALID_PAGE_ID {
                return Ok(PositionHint::NotFound);
            }
            leaf_id = next;
        }
    }

    /// An iterator over every entry in ascending key order.
    pub fn iter(&self) -> Result<BTreeIterator<K, V, P>> {
        if self.is_empty() {
            return Ok(BTreeIterator::empty(self.pool.clone()));
        }
        let leaf_id = self.leftmost_leaf(self.root_page_id())?;
        let guard = self.pool.fetch_frame_basic(leaf_id)?;
        Ok(BTreeIterator::new(self.pool.clone(), guard, 0))
    }

    /// An iterator starting at the first entry with key `>= key`.
    pub fn iter_from(&self, key: K) -> Result<BTreeIterator<K, V, P>> {
        match self.lower_bound(key)? {
            PositionHint::NotFound => Ok(BTreeIterator::empty(self.pool.clone())),
            PositionHint::Found { page_id, slot } => {
                let guard = self.pool.fetch_frame_basic(page_id)?;
                Ok(BTreeIterator::new(self.pool.clone(), guard, slot))
            }
        }
    }

    /// Inserts `key`/`value`. Returns `false` without modifying the tree if
    /// `key` is already present; duplicate keys are rejected, not overwritten
    /// (use [`Self::set_value`] to update in place).
    pub fn insert(&mut self, key: K, value: V) -> Result<bool> {
        if self.is_empty() {
            let (root_id, mut guard) = self.pool.new_frame_guarded()?;
            let node = Node::Leaf {
                next: INVALID_PAGE_ID,
                entries: vec![(key, value)],
            };
            guard.with_bytes_mut(|b| node.encode(b));
            drop(guard);
            self.set_root_page_id(root_id)?;
            return Ok(true);
        }

        let (leaf_id, mut breadcrumb) = self.find_leaf_with_breadcrumb(&key)?;
        let guard = self.pool.fetch_frame_basic(leaf_id)?;
        let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
        drop(guard);
        let Node::Leaf { next, mut entries } = node else {
            unreachable!()
        };

        let pos = match entries.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(_) => return Ok(false),
            Err(pos) => pos,
        };
        entries.insert(pos, (key, value));

        if entries.len() <= self.leaf_max {
            let guard = self.pool.fetch_frame_basic(leaf_id)?;
            Self::write_leaf(guard, next, entries);
            return Ok(true);
        }

        let split_at = (entries.len() + 1) / 2;
        let right_entries = entries.split_off(split_at);
        let separator = right_entries[0].0;

        let (right_id, right_guard) = self.pool.new_frame_guarded()?;
        Self::write_leaf(right_guard, next, right_entries);

        let left_guard = self.pool.fetch_frame_basic(leaf_id)?;
        Self::write_leaf(left_guard, right_id, entries);

        self.insert_in_parent(&mut breadcrumb, leaf_id, separator, right_id)?;
        Ok(true)
    }

    /// Splices `(sep_key, new_id)` into the parent of `old_id`, recursively
    /// splitting the parent (and promoting its own middle key) if it
    /// overflows, or creating a new root if `old_id` had none.
    fn insert_in_parent(
        &mut self,
        breadcrumb: &mut Vec<PageId>,
        old_id: PageId,
        sep_key: K,
        new_id: PageId,
    ) -> Result<()> {
        let Some(parent_id) = breadcrumb.pop() else {
            let (new_root_id, guard) = self.pool.new_frame_guarded()?;
            Self::write_internal(guard, vec![sep_key], vec![old_id, new_id]);
            self.set_root_page_id(new_root_id)?;
            return Ok(());
        };

        let guard = self.pool.fetch_frame_basic(parent_id)?;
        let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
        drop(guard);
        let Node::Internal { mut keys, mut children } = node else {
            unreachable!()
        };

        let idx = children
            .iter()
            .position(|&c| c == old_id)
            .expect("breadcrumb child must be present in its recorded parent");
        keys.insert(idx, sep_key);
        children.insert(idx + 1, new_id);

        if keys.len() <= self.inner_max {
            let guard = self.pool.fetch_frame_basic(parent_id)?;
            Self::write_internal(guard, keys, children);
            return Ok(());
        }

        let split_at = keys.len() / 2;
        let promoted = keys[split_at];
        let right_keys = keys.split_off(split_at + 1);
        keys.truncate(split_at);
        let right_children = children.split_off(split_at + 1);

        let (right_id, right_guard) = self.pool.new_frame_guarded()?;
        Self::write_internal(right_guard, right_keys, right_children);

        let left_guard = self.pool.fetch_frame_basic(parent_id)?;
        Self::write_internal(left_guard, keys, children);

        self.insert_in_parent(breadcrumb, parent_id, promoted, right_id)
    }

    /// Removes `key`. Returns `false` without modifying the tree if `key` is
    /// absent.
    pub fn remove(&mut self, key: K) -> Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }

        let (leaf_id, mut breadcrumb) = self.find_leaf_with_breadcrumb(&key)?;
        let guard = self.pool.fetch_frame_basic(leaf_id)?;
        let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
        drop(guard);
        let Node::Leaf { next, mut entries } = node else {
            unreachable!()
        };

        let pos = match entries.binary_search_by_key(&key, |(k, _)| *k) {
            Ok(pos) => pos,
            Err(_) => return Ok(false),
        };
        entries.remove(pos);

        if breadcrumb.is_empty() {
            // the leaf is the whole tree; no minimum occupancy applies to it.
            if entries.is_empty() {
                let guard = self.pool.fetch_frame_basic(leaf_id)?;
                guard.delete()?;
                self.set_root_page_id(INVALID_PAGE_ID)?;
            } else {
                let guard = self.pool.fetch_frame_basic(leaf_id)?;
                Self::write_leaf(guard, next, entries);
            }
            return Ok(true);
        }

        if entries.len() >= self.leaf_min {
            let guard = self.pool.fetch_frame_basic(leaf_id)?;
            Self::write_leaf(guard, next, entries);
            return Ok(true);
        }

        self.rebalance_leaf(&mut breadcrumb, leaf_id, next, entries)?;
        Ok(true)
    }

    /// `leaf_id` dropped below `leaf_min` entries after a removal. Borrows
    /// one entry from a sibling through the shared parent separator if the
    /// sibling can spare it, otherwise merges the two leaves and recurses
    /// into the parent, which may now itself be underfull.
    fn rebalance_leaf(
        &mut self,
        breadcrumb: &mut Vec<PageId>,
        leaf_id: PageId,
        next: PageId,
        mut entries: Vec<(K, V)>,
    ) -> Result<()> {
        let parent_id = *breadcrumb.last().expect("non-root leaf must have a parent");
        let guard = self.pool.fetch_frame_basic(parent_id)?;
        let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
        drop(guard);
        let Node::Internal { mut keys, mut children } = node else {
            unreachable!()
        };

        let child_idx = children
            .iter()
            .position(|&c| c == leaf_id)
            .expect("leaf must be a child of its recorded parent");

        if child_idx == 0 {
            let sibling_id = children[child_idx + 1];
            let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
            let sib_node = sib_guard.with_bytes(|b| Node::<K, V>::decode(b));
            drop(sib_guard);
            let Node::Leaf { next: sib_next, entries: mut sib_entries } = sib_node else {
                unreachable!()
            };

            if sib_entries.len() > self.leaf_min {
                let borrowed = sib_entries.remove(0);
                entries.push(borrowed);
                keys[child_idx] = sib_entries[0].0;

                let leaf_guard = self.pool.fetch_frame_basic(leaf_id)?;
                Self::write_leaf(leaf_guard, next, entries);
                let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
                Self::write_leaf(sib_guard, sib_next, sib_entries);
                let parent_guard = self.pool.fetch_frame_basic(parent_id)?;
                Self::write_internal(parent_guard, keys, children);
            } else {
                entries.extend(sib_entries);
                let leaf_guard = self.pool.fetch_frame_basic(leaf_id)?;
                Self::write_leaf(leaf_guard, sib_next, entries);

                let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
                sib_guard.delete()?;

                keys.remove(child_idx);
                children.remove(child_idx + 1);
                breadcrumb.pop();
                self.remove_in_internal(breadcrumb, parent_id, keys, children)?;
            }
        } else {
            let sibling_id = children[child_idx - 1];
            let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
            let sib_node = sib_guard.with_bytes(|b| Node::<K, V>::decode(b));
            drop(sib_guard);
            let Node::Leaf { entries: mut sib_entries, .. } = sib_node else {
                unreachable!()
            };

            if sib_entries.len() > self.leaf_min {
                let borrowed = sib_entries.pop().unwrap();
                entries.insert(0, borrowed);
                keys[child_idx - 1] = entries[0].0;

                let leaf_guard = self.pool.fetch_frame_basic(leaf_id)?;
                Self::write_leaf(leaf_guard, next, entries);
                let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
                Self::write_leaf(sib_guard, leaf_id, sib_entries);
                let parent_guard = self.pool.fetch_frame_basic(parent_id)?;
                Self::write_internal(parent_guard, keys, children);
            } else {
                sib_entries.extend(entries);
                let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
                Self::write_leaf(sib_guard, next, sib_entries);

                let leaf_guard = self.pool.fetch_frame_basic(leaf_id)?;
                leaf_guard.delete()?;

                keys.remove(child_idx - 1);
                children.remove(child_idx);
                breadcrumb.pop();
                self.remove_in_internal(breadcrumb, parent_id, keys, children)?;
            }
        }

        Ok(())
    }

    /// `node_id` (already updated to `keys`/`children`) may now be underfull.
    /// The root is exempt from the minimum-occupancy rule except that a root
    /// left with a single child collapses, making that child the new root.
    fn remove_in_internal(
        &mut self,
        breadcrumb: &mut Vec<PageId>,
        node_id: PageId,
        keys: Vec<K>,
        children: Vec<PageId>,
    ) -> Result<()> {
        if node_id == self.root_page_id() {
            if children.len() == 1 {
                let new_root = children[0];
                let guard = self.pool.fetch_frame_basic(node_id)?;
                guard.delete()?;
                self.set_root_page_id(new_root)?;
            } else {
                let guard = self.pool.fetch_frame_basic(node_id)?;
                Self::write_internal(guard, keys, children);
            }
            return Ok(());
        }

        if keys.len() >= self.inner_min {
            let guard = self.pool.fetch_frame_basic(node_id)?;
            Self::write_internal(guard, keys, children);
            return Ok(());
        }

        let mut keys = keys;
        let mut children = children;
        let parent_id = *breadcrumb
            .last()
            .expect("non-root internal node must have a parent");
        let guard = self.pool.fetch_frame_basic(parent_id)?;
        let parent = guard.with_bytes(|b| Node::<K, V>::decode(b));
        drop(guard);
        let Node::Internal { mut keys: pkeys, mut children: pchildren } = parent else {
            unreachable!()
        };

        let child_idx = pchildren
            .iter()
            .position(|&c| c == node_id)
            .expect("internal node must be a child of its recorded parent");

        if child_idx == 0 {
            let sibling_id = pchildren[child_idx + 1];
            let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
            let sib_node = sib_guard.with_bytes(|b| Node::<K, V>::decode(b));
            drop(sib_guard);
            let Node::Internal { keys: mut sib_keys, children: mut sib_children } = sib_node else {
                unreachable!()
            };

            if sib_keys.len() > self.inner_min {
                let separator = pkeys[child_idx];
                keys.push(separator);
                children.push(sib_children.remove(0));
                pkeys[child_idx] = sib_keys.remove(0);

                let node_guard = self.pool.fetch_frame_basic(node_id)?;
                Self::write_internal(node_guard, keys, children);
                let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
                Self::write_internal(sib_guard, sib_keys, sib_children);
                let parent_guard = self.pool.fetch_frame_basic(parent_id)?;
                Self::write_internal(parent_guard, pkeys, pchildren);
            } else {
                let separator = pkeys[child_idx];
                keys.push(separator);
                keys.extend(sib_keys);
                children.extend(sib_children);

                let node_guard = self.pool.fetch_frame_basic(node_id)?;
                Self::write_internal(node_guard, keys, children);

                let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
                sib_guard.delete()?;

                pkeys.remove(child_idx);
                pchildren.remove(child_idx + 1);
                breadcrumb.pop();
                self.remove_in_internal(breadcrumb, parent_id, pkeys, pchildren)?;
            }
        } else {
            let sibling_id = pchildren[child_idx - 1];
            let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
            let sib_node = sib_guard.with_bytes(|b| Node::<K, V>::decode(b));
            drop(sib_guard);
            let Node::Internal { keys: mut sib_keys, children: mut sib_children } = sib_node else {
                unreachable!()
            };

            if sib_keys.len() > self.inner_min {
                let separator = pkeys[child_idx - 1];
                keys.insert(0, separator);
                children.insert(0, sib_children.pop().unwrap());
                pkeys[child_idx - 1] = sib_keys.pop().unwrap();

                let node_guard = self.pool.fetch_frame_basic(node_id)?;
                Self::write_internal(node_guard, keys, children);
                let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
                Self::write_internal(sib_guard, sib_keys, sib_children);
                let parent_guard = self.pool.fetch_frame_basic(parent_id)?;
                Self::write_internal(parent_guard, pkeys, pchildren);
            } else {
                let separator = pkeys[child_idx - 1];
                sib_keys.push(separator);
                sib_keys.extend(keys);
                sib_children.extend(children);

                let sib_guard = self.pool.fetch_frame_basic(sibling_id)?;
                Self::write_internal(sib_guard, sib_keys, sib_children);

                let node_guard = self.pool.fetch_frame_basic(node_id)?;
                node_guard.delete()?;

                pkeys.remove(child_idx - 1);
                pchildren.remove(child_idx);
                breadcrumb.pop();
                self.remove_in_internal(breadcrumb, parent_id, pkeys, pchildren)?;
            }
        }

        Ok(())
    }

    /// Updates `key`'s value if present, inserts it otherwise. `hint`, if
    /// given, is checked against `key` before use and falls back to a fresh
    /// search on mismatch, so a stale hint never corrupts the tree.
    pub fn set_value(&mut self, key: K, value: V, hint: Option<PositionHint>) -> Result<bool> {
        if let Some(PositionHint::Found { page_id, slot }) = hint {
            let mut guard = self.pool.fetch_frame_basic(page_id)?;
            let mut node = guard.with_bytes(|b| Node::<K, V>::decode(b));
            if let Node::Leaf { ref mut entries, .. } = node {
                if slot < entries.len() && entries[slot].0 == key {
                    entries[slot].1 = value;
                    guard.with_bytes_mut(|b| node.encode(b));
                    return Ok(false);
                }
            }
        }

        match self.get_position(key)? {
            PositionHint::Found { page_id, slot } => {
                let mut guard = self.pool.fetch_frame_basic(page_id)?;
                let mut node = guard.with_bytes(|b| Node::<K, V>::decode(b));
                if let Node::Leaf { ref mut entries, .. } = node {
                    entries[slot].1 = value;
                }
                guard.with_bytes_mut(|b| node.encode(b));
                Ok(false)
            }
            PositionHint::NotFound => self.insert(key, value),
        }
    }

    /// Structural self-check: ascending keys within every node, every leaf
    /// within its parent-imposed key range, every leaf at the same depth,
    /// every non-root node within `[min, max]` occupancy, and the leaf chain
    /// strictly ascending end to end.
    pub fn validate(&self) -> Result<bool> {
        let root = self.root_page_id();
        if root == INVALID_PAGE_ID {
            return Ok(true);
        }

        if self.validate_node(root, true, None, None)?.is_none() {
            return Ok(false);
        }

        let mut current = self.leftmost_leaf(root)?;
        let mut last_key: Option<K> = None;
        loop {
            let guard = self.pool.fetch_frame_basic(current)?;
            let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
            drop(guard);
            let Node::Leaf { next, entries } = node else {
                return Ok(false);
            };
            for (k, _) in &entries {
                if let Some(last) = last_key {
                    if *k <= last {
                        return Ok(false);
                    }
                }
                last_key = Some(*k);
            }
            if next == INVALID_PAGE_ID {
                break;
            }
            current = next;
        }

        Ok(true)
    }

    fn validate_node(
        &self,
        page_id: PageId,
        is_root: bool,
        lower: Option<K>,
        upper: Option<K>,
    ) -> Result<Option<usize>> {
        let guard = self.pool.fetch_frame_basic(page_id)?;
        let node = guard.with_bytes(|b| Node::<K, V>::decode(b));
        drop(guard);

        match node {
            Node::Leaf { entries, .. } => {
                if is_root {
                    if entries.len() > self.leaf_max {
                        return Ok(None);
                    }
                } else if entries.len() < self.leaf_min || entries.len() > self.leaf_max {
                    return Ok(None);
                }
                for w in entries.windows(2) {
                    if w[0].0 >= w[1].0 {
                        return Ok(None);
                    }
                }
                if let Some(lo) = lower {
                    if entries.first().is_some_and(|(k, _)| *k < lo) {
                        return Ok(None);
                    }
                }
                if let Some(hi) = upper {
                    if entries.last().is_some_and(|(k, _)| *k >= hi) {
                        return Ok(None);
                    }
                }
                Ok(Some(0))
            }
            Node::Internal { keys, children } => {
                if !is_root && (keys.len() < self.inner_min || keys.len() > self.inner_max) {
                    return Ok(None);
                }
                for w in keys.windows(2) {
                    if w[0] >= w[1] {
                        return Ok(None);
                    }
                }

                let mut depth = None;
                for (i, &child) in children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(keys[i - 1]) };
                    let child_upper = if i == children.len() - 1 { upper } else { Some(keys[i]) };
                    let Some(child_depth) = self.validate_node(child, false, child_lower, child_upper)? else {
                        return Ok(None);
                    };
                    match depth {
                        None => depth = Some(child_depth),
                        Some(d) if d != child_depth => return Ok(None),
                        _ => {}
                    }
                }
                Ok(depth.map(|d| d + 1))
            }
        }
    }
}

/// Composite-key partial search, for trees keyed on `(A, B)` where queries
/// fix `A` and range over `B` (e.g. a secondary index keyed on
/// `(foreign_id, row_id)`).
impl<A, B, V, P> BPlusTree<(A, B), V, P>
where
    A: FixedSize + Ord + Copy,
    B: FixedSize + Ord + Copy + Bounded,
    V: FixedSize + Copy,
    P: PageSource,
{
    /// Every entry whose key's first component equals `prefix`, ascending by
    /// the second component. Seeks `lower_bound((prefix, B::MIN_VALUE))` and
    /// walks forward while the first component still matches.
    pub fn partial_search(&self, prefix: A) -> Result<Vec<(B, V)>> {
        let mut out = Vec::new();
        let mut iter = self.iter_from((prefix, B::MIN_VALUE))?;
        while let Some(((k1, k2), v)) = iter.next() {
            if k1 != prefix {
                break;
            }
            out.push((k2, v));
        }
        // A fetch failure mid-scan (pool exhaustion, I/O) looks identical to
        // the leaf chain genuinely ending; `error()` disambiguates so this
        // never silently returns a truncated match set as if it were
        // complete.
        if let Some(err) = iter.error() {
            bail!("partial_search interrupted by a storage error: {err}");
        }
        Ok(out)
    }

    /// Removes every entry matching `prefix`. Returns the number removed.
    pub fn remove_all(&mut self, prefix: A) -> Result<usize> {
        let matches = self.partial_search(prefix)?;
        let mut removed = 0;
        for (k2, _) in matches {
            if self.remove((prefix, k2))? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPoolManager;
    use rand::seq::SliceRandom;
    use rand::thread_rng;
    use tempfile::tempdir;

    fn test_pool(pool_size: usize) -> BufferPoolManager {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.db");
        Box::leak(Box::new(dir));
        BufferPoolManager::builder(path)
            .reset(true)
            .pool_size(pool_size)
            .pages_per_frame(1)
            .build()
            .unwrap()
    }

    fn small_tree(pool: &BufferPoolManager) -> BPlusTree<u32, u32, BufferPoolManager> {
        BPlusTree::<u32, u32, BufferPoolManager>::bootstrap(pool, 1).unwrap();
        BPlusTree::new(pool.clone(), 1)
    }

    #[test]
    fn basic_round_trip() {
        let pool = test_pool(64);
        let mut tree = small_tree(&pool);
        assert!(tree.insert(10, 100).unwrap());
        assert!(tree.insert(20, 200).unwrap());
        assert_eq!(tree.get(10).unwrap(), Some(100));
        assert_eq!(tree.get(20).unwrap(), Some(200));
        assert_eq!(tree.get(30).unwrap(), None);
        assert!(tree.validate().unwrap());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let pool = test_pool(64);
        let mut tree = small_tree(&pool);
        assert!(tree.insert(5, 50).unwrap());
        assert!(!tree.insert(5, 99).unwrap());
        assert_eq!(tree.get(5).unwrap(), Some(50));
    }

    #[test]
    fn ordered_scan_over_many_inserts_forces_splits() {
        let pool = test_pool(256);
        let mut tree = small_tree(&pool);
        let mut keys: Vec<u32> = (0..500).collect();
        keys.shuffle(&mut thread_rng());
        for k in &keys {
            assert!(tree.insert(*k, k * 10).unwrap());
        }
        assert!(tree.validate().unwrap());

        let scanned: Vec<u32> = tree.iter().unwrap().map(|(k, _)| k).collect();
        let expected: Vec<u32> = (0..500).collect();
        assert_eq!(scanned, expected);
    }

    #[test]
    fn deletes_trigger_borrow_and_merge_and_stay_valid() {
        let pool = test_pool(256);
        let mut tree = small_tree(&pool);
        for k in 0..200u32 {
            assert!(tree.insert(k, k).unwrap());
        }
        assert!(tree.validate().unwrap());

        let mut keys: Vec<u32> = (0..200).collect();
        keys.shuffle(&mut thread_rng());
        for k in keys.into_iter().take(180) {
            assert!(tree.remove(k).unwrap());
            assert!(tree.validate().unwrap());
        }

        let remaining: Vec<u32> = tree.iter().unwrap().map(|(k, _)| k).collect();
        assert_eq!(remaining.len(), 20);
        assert!(remaining.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn removing_every_entry_empties_the_tree() {
        let pool = test_pool(64);
        let mut tree = small_tree(&pool);
        for k in 0..30u32 {
            tree.insert(k, k).unwrap();
        }
        for k in 0..30u32 {
            assert!(tree.remove(k).unwrap());
        }
        assert!(tree.is_empty());
        assert!(tree.validate().unwrap());
        assert!(tree.iter().unwrap().next().is_none());
    }

    #[test]
    fn lower_bound_crosses_leaf_boundary() {
        let pool = test_pool(64);
        let mut tree = small_tree(&pool);
        for k in [10u32, 20, 30, 40, 50] {
            tree.insert(k, k).unwrap();
        }
        assert!(matches!(tree.lower_bound(25).unwrap(), PositionHint::Found { .. }));
        let from_25: Vec<u32> = tree.iter_from(25).unwrap().map(|(k, _)| k).collect();
        assert_eq!(from_25, vec![30, 40, 50]);

        assert_eq!(tree.lower_bound(51).unwrap(), PositionHint::NotFound);
    }

    #[test]
    fn set_value_updates_in_place_without_growing_the_tree() {
        let pool = test_pool(64);
        let mut tree = small_tree(&pool);
        tree.insert(1, 100).unwrap();
        let hint = tree.get_position(1).unwrap();
        assert!(!tree.set_value(1, 999, Some(hint)).unwrap());
        assert_eq!(tree.get(1).unwrap(), Some(999));

        assert!(tree.set_value(2, 222, None).unwrap());
        assert_eq!(tree.get(2).unwrap(), Some(222));
    }

    fn tiny_tree(pool: &BufferPoolManager, max: usize) -> BPlusTree<u32, u32, BufferPoolManager> {
        BPlusTree::<u32, u32, BufferPoolManager>::bootstrap(pool, 1).unwrap();
        BPlusTree::with_max_sizes(pool.clone(), 1, max, max)
    }

    #[test]
    fn first_split_happens_on_max_plus_one_insert_and_depth_becomes_two() {
        let pool = test_pool(64);
        let mut tree = tiny_tree(&pool, 4);
        for k in 1..=4u32 {
            assert!(tree.insert(k, k * 10).unwrap());
        }
        let Node::Leaf { .. } = Node::<u32, u32>::decode(
            &pool
                .fetch_frame_basic(tree.root_page_id())
                .unwrap()
                .with_bytes(|b| b.to_vec()),
        ) else {
            panic!("root should still be a single leaf after 4 inserts");
        };

        assert!(tree.insert(5, 50).unwrap());
        let Node::Internal { .. } = Node::<u32, u32>::decode(
            &pool
                .fetch_frame_basic(tree.root_page_id())
                .unwrap()
                .with_bytes(|b| b.to_vec()),
        ) else {
            panic!("fifth insert must split the root leaf, producing an internal root");
        };
        assert!(tree.validate().unwrap());
    }

    #[test]
    fn split_and_re_split_keeps_every_intermediate_state_valid() {
        let pool = test_pool(64);
        let mut tree = tiny_tree(&pool, 4);
        for k in 1..=20u32 {
            assert!(tree.insert(k, k * 10).unwrap());
            assert!(tree.validate().unwrap());
        }
        let chain: Vec<u32> = tree.iter().unwrap().map(|(k, _)| k).collect();
        assert_eq!(chain, (1..=20u32).collect::<Vec<_>>());
    }

    #[test]
    fn borrow_then_merge_keeps_every_intermediate_state_valid() {
        let pool = test_pool(64);
        let mut tree = tiny_tree(&pool, 4);
        for k in 1..=8u32 {
            assert!(tree.insert(k, k * 10).unwrap());
        }
        assert!(tree.validate().unwrap());

        for k in [1u32, 2, 3] {
            assert!(tree.remove(k).unwrap());
            assert!(tree.validate().unwrap());
        }

        for k in 4..=8u32 {
            assert_eq!(tree.get(k).unwrap(), Some(k * 10));
        }
    }

    #[test]
    fn close_and_reopen_preserves_every_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.db");

        {
            let pool = BufferPoolManager::builder(&path)
                .reset(true)
                .pool_size(64)
                .pages_per_frame(1)
                .build()
                .unwrap();
            BPlusTree::<u32, u32, BufferPoolManager>::bootstrap(&pool, 1).unwrap();
            let mut tree = BPlusTree::<u32, u32, BufferPoolManager>::new(pool.clone(), 1);
            for k in 0..100u32 {
                assert!(tree.insert(k, k * 10).unwrap());
            }
            pool.shutdown().unwrap();
        }

        {
            let pool = BufferPoolManager::builder(&path)
                .reset(false)
                .pool_size(64)
                .pages_per_frame(1)
                .build()
                .unwrap();
            let tree = BPlusTree::<u32, u32, BufferPoolManager>::new(pool, 1);
            assert!(tree.validate().unwrap());
            let entries: Vec<(u32, u32)> = tree.iter().unwrap().collect();
            let expected: Vec<(u32, u32)> = (0..100u32).map(|k| (k, k * 10)).collect();
            assert_eq!(entries, expected);
        }
    }

    #[test]
    fn pool_exhaustion_mid_scan_surfaces_as_iterator_error_not_early_end() {
        let pool = test_pool(3);
        let mut tree = tiny_tree(&pool, 2);
        for k in 1..=6u32 {
            assert!(tree.insert(k, k * 10).unwrap());
        }
        assert!(tree.validate().unwrap());

        let mut iter = tree.iter().unwrap();
        let first = iter.next();
        assert!(first.is_some());

        // Pin every remaining frame in the 3-frame pool so crossing into
        // the next leaf has nowhere to land.
        let (_p1, _g1) = pool.new_frame_guarded().unwrap();
        let (_p2, _g2) = pool.new_frame_guarded().unwrap();

        let mut saw_none = false;
        for _ in 0..10 {
            if iter.next().is_none() {
                saw_none = true;
                break;
            }
        }
        assert!(saw_none, "iteration should stop once the pool is exhausted");
        assert!(
            iter.error().is_some(),
            "pool exhaustion mid-scan must be surfaced as an error, not silently treated as end-of-chain"
        );
    }

    #[test]
    fn composite_key_partial_search_and_remove_all() {
        let pool = test_pool(64);
        BPlusTree::<(u32, u32), u32, BufferPoolManager>::bootstrap(&pool, 1).unwrap();
        let mut tree: BPlusTree<(u32, u32), u32, BufferPoolManager> = BPlusTree::new(pool.clone(), 1);
        for owner in 0..3u32 {
            for row in 0..5u32 {
                tree.insert((owner, row), owner * 100 + row).unwrap();
            }
        }

        let owned = tree.partial_search(1).unwrap();
        assert_eq!(owned, vec![(0, 100), (1, 101), (2, 102), (3, 103), (4, 104)]);

        let removed = tree.remove_all(1).unwrap();
        assert_eq!(removed, 5);
        assert!(tree.partial_search(1).unwrap().is_empty());
        assert_eq!(tree.partial_search(0).unwrap().len(), 5);
        assert!(tree.validate().unwrap());
    }
}
