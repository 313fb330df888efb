//! # On-disk B+ tree
//!
//! Maps variable-length byte keys to `u64` values. Every node occupies
//! exactly one page; page 0 holds the tree metadata (root id, entry count,
//! degree inputs, free-page list) and page 1 is the initial root.
//!
//! ## Write path
//!
//! ```text
//! put(key, val)
//!   └─ writer lock
//!        └─ pre-emptive descent: split any full child before entering it
//!             └─ leaf insert or in-place value update
//!                  └─ flush: marshal every dirty node, then metadata
//! ```
//!
//! Pre-emptive splitting keeps overflow transient: a node is split the
//! moment it is found full, so the node being descended into always has
//! room for one more entry. The root is handled first — when full, a new
//! root and a right sibling are allocated and the old root splits into
//! them, growing the tree by one level.
//!
//! ## Read path
//!
//! `get`/`scan` hold the reader lock. Lookups hit the node cache first and
//! deserialize misses into short-lived nodes without populating the cache;
//! only the write path (which holds the writer lock) inserts.
//!
//! ## Delete
//!
//! Standard B+ tree rebalancing: remove at the leaf, then walk the
//! recorded descent path upward fixing underflow by borrowing from a
//! sibling where one has entries to spare, merging otherwise. Internal
//! merges demote the parent separator; leaf merges splice the doubly
//! linked leaf chain. An internal root left with a single child is
//! collapsed and its page freed.
//!
//! ## Allocation
//!
//! New pages come from the persisted free list when it can satisfy the
//! request (contiguous run for multi-page allocations), falling back to
//! extending the file through the pager. Pages freed by merges and root
//! collapse return to the list.

use std::ops::Deref;

use eyre::{bail, ensure, Result};
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::debug;

use crate::error::Error;
use crate::storage::Pager;

use super::cache::NodeCache;
use super::meta::Metadata;
use super::node::{
    Entry, Node, CHILD_PTR_SIZE, INTERNAL_ENTRY_OVERHEAD, INTERNAL_HEADER_SIZE,
    LEAF_ENTRY_OVERHEAD, LEAF_HEADER_SIZE,
};

/// Configuration for [`BPlusTree::open`].
///
/// `page_size` and `max_key_size` only matter when the file is being
/// initialized; an existing tree is governed by its stored metadata.
#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// Refuse every mutation; the file must already be initialized.
    pub read_only: bool,
    /// Unix permission bits for a newly created file.
    pub file_mode: u32,
    /// Page size for a new file: a positive multiple of 4096, or zero for
    /// the OS page size.
    pub page_size: usize,
    /// Largest key accepted by `put`, in bytes. Larger values shrink the
    /// branching factor.
    pub max_key_size: u16,
    /// Pages to allocate up front onto the free list when initializing,
    /// trading file size for fewer remaps during early inserts.
    pub preallocate: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            file_mode: 0o644,
            page_size: 0,
            max_key_size: 100,
            preallocate: 0,
        }
    }
}

impl TreeOptions {
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn file_mode(mut self, file_mode: u32) -> Self {
        self.file_mode = file_mode;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn max_key_size(mut self, max_key_size: u16) -> Self {
        self.max_key_size = max_key_size;
        self
    }

    pub fn preallocate(mut self, preallocate: usize) -> Self {
        self.preallocate = preallocate;
        self
    }
}

/// An on-disk B+ tree index.
///
/// Safe to share across threads: `get`/`scan`/`size` take an internal
/// reader lock, `put`/`del`/`close` the writer lock. Writes are flushed to
/// the pager before the call returns; durability beyond the OS buffer
/// cache requires [`BPlusTree::sync`].
#[derive(Debug)]
pub struct BPlusTree {
    inner: RwLock<TreeInner>,
}

impl BPlusTree {
    /// Opens the named tree file, initializing it when empty. The sentinel
    /// path `":memory:"` opens an ephemeral in-memory tree.
    pub fn open(path: &str, opts: TreeOptions) -> Result<Self> {
        ensure!(opts.max_key_size >= 1, "max key size must be at least 1");

        let mut pager = Pager::open(path, opts.page_size, opts.read_only, opts.file_mode)?;
        let mut cache = NodeCache::new();

        let meta = if pager.count() == 0 {
            if opts.read_only {
                bail!(Error::corrupt(format!(
                    "'{}' is empty and cannot be initialized read-only",
                    path
                )));
            }
            init_tree(&mut pager, &mut cache, &opts)?
        } else {
            let mut meta = Metadata::default();
            pager.unmarshal(0, &mut meta)?;
            meta.validate(pager.page_size())?;
            meta
        };

        let (leaf_degree, degree) =
            compute_degrees(pager.page_size(), meta.max_key_size as usize)?;

        let mut inner = TreeInner {
            pager: Some(pager),
            meta,
            cache,
            degree,
            leaf_degree,
        };
        inner.fetch_mut(inner.meta.root_id)?;

        debug!(
            path,
            size = inner.meta.size,
            leaf_degree,
            degree,
            "opened b+ tree"
        );

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Fetches the value for the given key, `None` when absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        if key.is_empty() {
            bail!(Error::EmptyKey);
        }
        let inner = self.inner.read();
        inner.ensure_open()?;
        inner.get(key)
    }

    /// Inserts the key-value pair, or updates the value in place when the
    /// key already exists.
    pub fn put(&self, key: &[u8], val: u64) -> Result<()> {
        if key.is_empty() {
            bail!(Error::EmptyKey);
        }
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        inner.ensure_writable()?;

        let max = inner.meta.max_key_size as usize;
        if key.len() > max {
            bail!(Error::KeyTooLarge {
                size: key.len(),
                max,
            });
        }

        let inserted = inner.put(Entry::new(key.to_vec(), val))?;
        if inserted {
            inner.meta.size += 1;
            inner.meta.dirty = true;
        }

        inner.flush()
    }

    /// Removes the entry with the given key, returning its value, or
    /// `None` when absent.
    pub fn del(&self, key: &[u8]) -> Result<Option<u64>> {
        if key.is_empty() {
            bail!(Error::EmptyKey);
        }
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        inner.ensure_writable()?;

        let removed = inner.del(key)?;
        if removed.is_some() {
            inner.meta.size -= 1;
            inner.meta.dirty = true;
        }

        inner.flush()?;
        Ok(removed)
    }

    /// Visits entries in key order starting at `start_key` (or the
    /// relevant end of the tree when empty), walking backwards when
    /// `reverse`. The visitor returns `true` to stop the scan.
    pub fn scan<F>(&self, start_key: &[u8], reverse: bool, visit: F) -> Result<()>
    where
        F: FnMut(&[u8], u64) -> bool,
    {
        let inner = self.inner.read();
        inner.ensure_open()?;
        inner.scan(start_key, reverse, visit)
    }

    /// Number of entries in the tree.
    pub fn size(&self) -> i64 {
        self.inner.read().meta.size as i64
    }

    /// I/O statistics from the underlying pager.
    pub fn stats(&self) -> Result<crate::storage::Stats> {
        let inner = self.inner.read();
        let pager = inner.pager.as_ref().ok_or(Error::Closed)?;
        Ok(pager.stats())
    }

    /// Flushes the backing file to durable storage.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.write();
        let pager = inner.pager.as_ref().ok_or(Error::Closed)?;
        pager.sync()
    }

    /// Flushes pending writes and releases the backing file. Every
    /// subsequent operation fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        self.inner.write().close()
    }
}

impl Drop for BPlusTree {
    fn drop(&mut self) {
        let _ = self.inner.get_mut().close();
    }
}

#[derive(Debug)]
struct TreeInner {
    pager: Option<Pager>,
    meta: Metadata,
    cache: NodeCache,
    /// Internal-node degree; such a node is full at `2·degree − 1` entries.
    degree: usize,
    /// Leaf degree; a leaf is full at `2·leaf_degree − 1` entries.
    leaf_degree: usize,
}

/// A node obtained on the read path: either a borrow from the cache or a
/// short-lived instance deserialized for this operation only.
enum Fetched<'a> {
    Cached(&'a Node),
    Loaded(Box<Node>),
}

impl Deref for Fetched<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        match self {
            Fetched::Cached(n) => n,
            Fetched::Loaded(n) => n,
        }
    }
}

impl TreeInner {
    fn ensure_open(&self) -> Result<()> {
        if self.pager.is_none() {
            bail!(Error::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        let pager = self.pager.as_ref().ok_or(Error::Closed)?;
        if pager.read_only() {
            bail!(Error::ReadOnly);
        }
        Ok(())
    }

    /// Fetches a node for reading without populating the cache.
    fn fetch_ro(&self, id: u32) -> Result<Fetched<'_>> {
        if let Some(node) = self.cache.get(id) {
            return Ok(Fetched::Cached(node));
        }
        let pager = self.pager.as_ref().ok_or(Error::Closed)?;
        let mut node = Node::new(id);
        pager.unmarshal(id, &mut node)?;
        node.dirty = false;
        Ok(Fetched::Loaded(Box::new(node)))
    }

    /// Fetches a node into the cache (write path only) and returns it
    /// mutably.
    fn fetch_mut(&mut self, id: u32) -> Result<&mut Node> {
        if !self.cache.contains(id) {
            let pager = self.pager.as_ref().ok_or(Error::Closed)?;
            let mut node = Node::new(id);
            pager.unmarshal(id, &mut node)?;
            node.dirty = false;
            self.cache.insert(node);
        }
        Ok(self
            .cache
            .get_mut(id)
            .expect("node resident after fetch"))
    }

    fn full_at(&self, is_leaf: bool) -> usize {
        if is_leaf {
            2 * self.leaf_degree - 1
        } else {
            2 * self.degree - 1
        }
    }

    fn min_entries(&self, is_leaf: bool) -> usize {
        if is_leaf {
            self.leaf_degree - 1
        } else {
            self.degree - 1
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        let mut id = self.meta.root_id;
        loop {
            let node = self.fetch_ro(id)?;
            let (idx, found) = node.search(key);

            if node.is_leaf() {
                return Ok(if found { Some(node.entries[idx].val) } else { None });
            }

            id = node.children[if found { idx + 1 } else { idx }];
        }
    }

    /// Descends to the leaf that would contain `key`. Returns the leaf id,
    /// the entry index for `key` within it, and whether the key exists.
    fn locate_leaf(&self, key: &[u8]) -> Result<(u32, usize, bool)> {
        let mut id = self.meta.root_id;
        loop {
            let node = self.fetch_ro(id)?;
            let (idx, found) = node.search(key);

            if node.is_leaf() {
                return Ok((id, idx, found));
            }

            id = node.children[if found { idx + 1 } else { idx }];
        }
    }

    /// The leftmost (or rightmost) leaf of the tree.
    fn edge_leaf(&self, rightmost: bool) -> Result<u32> {
        let mut id = self.meta.root_id;
        loop {
            let node = self.fetch_ro(id)?;
            if node.is_leaf() {
                return Ok(id);
            }
            id = if rightmost {
                *node.children.last().expect("internal node has children")
            } else {
                node.children[0]
            };
        }
    }

    fn scan<F>(&self, start_key: &[u8], reverse: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], u64) -> bool,
    {
        if self.meta.size == 0 {
            return Ok(());
        }

        let mut leaf_id;
        let mut idx;

        if start_key.is_empty() {
            leaf_id = self.edge_leaf(reverse)?;
            idx = if reverse {
                self.fetch_ro(leaf_id)?.entries.len().saturating_sub(1)
            } else {
                0
            };
        } else {
            let (id, i, found) = self.locate_leaf(start_key)?;
            leaf_id = id;
            if !reverse || found {
                idx = i;
            } else if i > 0 {
                // predecessor: the last entry smaller than the start key
                idx = i - 1;
            } else {
                let prev = self.fetch_ro(id)?.prev;
                if prev == 0 {
                    return Ok(());
                }
                leaf_id = prev;
                idx = self.fetch_ro(prev)?.entries.len().saturating_sub(1);
            }
        }

        let mut first = true;
        loop {
            let node = self.fetch_ro(leaf_id)?;
            let count = node.entries.len();

            if !reverse {
                let start = if first { idx.min(count) } else { 0 };
                for e in &node.entries[start..] {
                    if visit(&e.key, e.val) {
                        return Ok(());
                    }
                }
                if node.next == 0 {
                    return Ok(());
                }
                leaf_id = node.next;
            } else {
                if count > 0 {
                    let start = if first { idx.min(count - 1) } else { count - 1 };
                    for i in (0..=start).rev() {
                        let e = &node.entries[i];
                        if visit(&e.key, e.val) {
                            return Ok(());
                        }
                    }
                }
                if node.prev == 0 {
                    return Ok(());
                }
                leaf_id = node.prev;
            }
            first = false;
        }
    }

    /// Inserts or updates. Returns whether a new entry was created.
    fn put(&mut self, entry: Entry) -> Result<bool> {
        let root_id = self.meta.root_id;
        let root_full = {
            let root = self
                .cache
                .get(root_id)
                .expect("root resident for the tree's lifetime");
            root.entries.len() == self.full_at(root.is_leaf())
        };

        if root_full {
            // the old root becomes child 0 of a fresh root and splits into
            // a fresh right sibling
            let new_root_id = self.alloc_nodes(2)?;
            let sibling_id = new_root_id + 1;
            self.cache
                .get_mut(new_root_id)
                .expect("allocated node resident")
                .children
                .push(root_id);
            self.meta.root_id = new_root_id;
            self.meta.dirty = true;
            self.split_child(new_root_id, root_id, sibling_id, 0)?;
        }

        self.insert_non_full(self.meta.root_id, entry)
    }

    fn insert_non_full(&mut self, mut id: u32, entry: Entry) -> Result<bool> {
        loop {
            let (is_leaf, idx, found) = {
                let node = self.fetch_mut(id)?;
                let (idx, found) = node.search(&entry.key);
                (node.is_leaf(), idx, found)
            };

            if is_leaf {
                let node = self.cache.get_mut(id).expect("leaf resident");
                if found {
                    node.set_val(idx, entry.val);
                    return Ok(false);
                }
                node.insert_at(idx, entry);
                return Ok(true);
            }

            let child_idx = if found { idx + 1 } else { idx };
            let child_id = self.cache.get(id).expect("node resident").children[child_idx];

            let (child_len, child_is_leaf) = {
                let child = self.fetch_mut(child_id)?;
                (child.entries.len(), child.is_leaf())
            };

            if child_len == self.full_at(child_is_leaf) {
                let sibling_id = self.alloc_nodes(1)?;
                self.split_child(id, child_id, sibling_id, child_idx)?;

                // the separator now sits at child_idx; re-pick the side
                let node = self.cache.get(id).expect("node resident");
                id = if entry.key.as_slice() >= node.entries[child_idx].key.as_slice() {
                    node.children[child_idx + 1]
                } else {
                    node.children[child_idx]
                };
            } else {
                id = child_id;
            }
        }
    }

    /// Splits the full child at position `i` of the parent. For leaves the
    /// fresh sibling takes the right half and is spliced into the leaf
    /// chain (successor's `prev` included); for internal nodes it takes
    /// the left half and the median separator moves up.
    fn split_child(
        &mut self,
        parent_id: u32,
        child_id: u32,
        sibling_id: u32,
        i: usize,
    ) -> Result<()> {
        let child_is_leaf = self
            .cache
            .get(child_id)
            .expect("child resident")
            .is_leaf();

        if child_is_leaf {
            let leaf_degree = self.leaf_degree;
            let (moved, old_next) = {
                let child = self.cache.get_mut(child_id).expect("child resident");
                child.dirty = true;
                let moved = child.entries.split_off(leaf_degree);
                let old_next = child.next;
                child.next = sibling_id;
                (moved, old_next)
            };

            if old_next != 0 {
                let successor = self.fetch_mut(old_next)?;
                successor.dirty = true;
                successor.prev = sibling_id;
            }

            let separator = {
                let sibling = self.cache.get_mut(sibling_id).expect("sibling resident");
                sibling.entries = moved;
                sibling.next = old_next;
                sibling.prev = child_id;
                sibling.entries[0].key.clone()
            };

            let parent = self.cache.get_mut(parent_id).expect("parent resident");
            parent.insert_child(i + 1, sibling_id);
            parent.insert_at(i, Entry::separator(separator));
        } else {
            let degree = self.degree;
            let (left_entries, median, left_children) = {
                let child = self.cache.get_mut(child_id).expect("child resident");
                child.dirty = true;

                let right_entries = child.entries.split_off(degree);
                let mut left_entries = std::mem::replace(&mut child.entries, right_entries);
                let median = left_entries.pop().expect("full internal node");

                let right_children = child.children.split_off(degree);
                let left_children = std::mem::replace(&mut child.children, right_children);

                (left_entries, median, left_children)
            };

            {
                let sibling = self.cache.get_mut(sibling_id).expect("sibling resident");
                sibling.entries = left_entries;
                sibling.children = left_children;
            }

            let parent = self.cache.get_mut(parent_id).expect("parent resident");
            parent.insert_child(i, sibling_id);
            parent.insert_at(i, Entry::separator(median.key));
        }

        Ok(())
    }

    fn del(&mut self, key: &[u8]) -> Result<Option<u64>> {
        let mut path: SmallVec<[(u32, usize); 8]> = SmallVec::new();
        let mut id = self.meta.root_id;

        loop {
            let (is_leaf, idx, found) = {
                let node = self.fetch_mut(id)?;
                let (idx, found) = node.search(key);
                (node.is_leaf(), idx, found)
            };

            if is_leaf {
                if !found {
                    return Ok(None);
                }
                let entry = self
                    .cache
                    .get_mut(id)
                    .expect("leaf resident")
                    .remove_entry(idx);
                self.rebalance(id, &path)?;
                return Ok(Some(entry.val));
            }

            let child_idx = if found { idx + 1 } else { idx };
            let child_id = self.cache.get(id).expect("node resident").children[child_idx];
            path.push((id, child_idx));
            id = child_id;
        }
    }

    /// Walks the descent path upward fixing any underflowing node, then
    /// collapses a single-child root.
    fn rebalance(&mut self, mut id: u32, path: &[(u32, usize)]) -> Result<()> {
        for &(parent_id, child_idx) in path.iter().rev() {
            let underflow = {
                let node = self.cache.get(id).expect("path node resident");
                node.entries.len() < self.min_entries(node.is_leaf())
            };
            if !underflow {
                break;
            }
            self.fix_underflow(parent_id, child_idx)?;
            id = parent_id;
        }

        self.collapse_root()
    }

    fn fix_underflow(&mut self, parent_id: u32, child_idx: usize) -> Result<()> {
        let (child_id, left_id, right_id) = {
            let parent = self.cache.get(parent_id).expect("parent resident");
            let left = (child_idx > 0).then(|| parent.children[child_idx - 1]);
            let right = (child_idx + 1 < parent.children.len())
                .then(|| parent.children[child_idx + 1]);
            (parent.children[child_idx], left, right)
        };

        if let Some(id) = left_id {
            self.fetch_mut(id)?;
        }
        if let Some(id) = right_id {
            self.fetch_mut(id)?;
        }

        let is_leaf = self.cache.get(child_id).expect("child resident").is_leaf();
        let min = self.min_entries(is_leaf);

        if let Some(left) = left_id {
            if self.cache.get(left).expect("sibling resident").entries.len() > min {
                self.borrow_from_left(parent_id, child_idx, left, child_id, is_leaf);
                return Ok(());
            }
        }

        if let Some(right) = right_id {
            if self.cache.get(right).expect("sibling resident").entries.len() > min {
                self.borrow_from_right(parent_id, child_idx, child_id, right, is_leaf);
                return Ok(());
            }
        }

        if let Some(left) = left_id {
            self.merge_into_left(parent_id, child_idx - 1, left, child_id, is_leaf)
        } else if let Some(right) = right_id {
            self.merge_into_left(parent_id, child_idx, child_id, right, is_leaf)
        } else {
            // single-child parent; nothing to rebalance against
            Ok(())
        }
    }

    /// Moves the left sibling's greatest entry into the child and updates
    /// the separator between them.
    fn borrow_from_left(
        &mut self,
        parent_id: u32,
        child_idx: usize,
        left_id: u32,
        child_id: u32,
        is_leaf: bool,
    ) {
        let sep_idx = child_idx - 1;

        if is_leaf {
            let moved = {
                let left = self.cache.get_mut(left_id).expect("sibling resident");
                left.dirty = true;
                left.entries.pop().expect("donor has entries to spare")
            };
            let new_separator = moved.key.clone();

            let child = self.cache.get_mut(child_id).expect("child resident");
            child.insert_at(0, moved);

            let parent = self.cache.get_mut(parent_id).expect("parent resident");
            parent.dirty = true;
            parent.entries[sep_idx].key = new_separator;
        } else {
            let (moved_child, promoted) = {
                let left = self.cache.get_mut(left_id).expect("sibling resident");
                left.dirty = true;
                let child = left.children.pop().expect("internal node has children");
                let entry = left.entries.pop().expect("donor has entries to spare");
                (child, entry)
            };

            let demoted_key = {
                let parent = self.cache.get_mut(parent_id).expect("parent resident");
                parent.dirty = true;
                std::mem::replace(&mut parent.entries[sep_idx].key, promoted.key)
            };

            let child = self.cache.get_mut(child_id).expect("child resident");
            child.insert_at(0, Entry::separator(demoted_key));
            child.insert_child(0, moved_child);
        }
    }

    /// Moves the right sibling's smallest entry into the child and updates
    /// the separator between them.
    fn borrow_from_right(
        &mut self,
        parent_id: u32,
        child_idx: usize,
        child_id: u32,
        right_id: u32,
        is_leaf: bool,
    ) {
        if is_leaf {
            let (moved, new_separator) = {
                let right = self.cache.get_mut(right_id).expect("sibling resident");
                right.dirty = true;
                let moved = right.entries.remove(0);
                let new_separator = right.entries[0].key.clone();
                (moved, new_separator)
            };

            let child = self.cache.get_mut(child_id).expect("child resident");
            child.dirty = true;
            child.entries.push(moved);

            let parent = self.cache.get_mut(parent_id).expect("parent resident");
            parent.dirty = true;
            parent.entries[child_idx].key = new_separator;
        } else {
            let (moved_child, promoted) = {
                let right = self.cache.get_mut(right_id).expect("sibling resident");
                right.dirty = true;
                let child = right.children.remove(0);
                let entry = right.entries.remove(0);
                (child, entry)
            };

            let demoted_key = {
                let parent = self.cache.get_mut(parent_id).expect("parent resident");
                parent.dirty = true;
                std::mem::replace(&mut parent.entries[child_idx].key, promoted.key)
            };

            let child = self.cache.get_mut(child_id).expect("child resident");
            child.dirty = true;
            child.entries.push(Entry::separator(demoted_key));
            child.children.push(moved_child);
        }
    }

    /// Merges the right node into the left, removing the separator between
    /// them from the parent and freeing the right node's page.
    fn merge_into_left(
        &mut self,
        parent_id: u32,
        sep_idx: usize,
        left_id: u32,
        right_id: u32,
        is_leaf: bool,
    ) -> Result<()> {
        let separator = {
            let parent = self.cache.get_mut(parent_id).expect("parent resident");
            let separator = parent.remove_entry(sep_idx);
            parent.remove_child(sep_idx + 1);
            separator
        };

        let mut right = self.cache.remove(right_id).expect("sibling resident");

        if is_leaf {
            let old_next = right.next;
            {
                let left = self.cache.get_mut(left_id).expect("left resident");
                left.dirty = true;
                left.entries.append(&mut right.entries);
                left.next = old_next;
            }
            if old_next != 0 {
                let successor = self.fetch_mut(old_next)?;
                successor.dirty = true;
                successor.prev = left_id;
            }
        } else {
            let left = self.cache.get_mut(left_id).expect("left resident");
            left.dirty = true;
            left.entries.push(Entry::separator(separator.key));
            left.entries.append(&mut right.entries);
            left.children.append(&mut right.children);
        }

        self.free_page(right_id);
        Ok(())
    }

    /// Shrinks the tree while the root is an internal node with a single
    /// child.
    fn collapse_root(&mut self) -> Result<()> {
        loop {
            let root_id = self.meta.root_id;
            let only_child = {
                let root = self.cache.get(root_id).expect("root resident");
                if root.is_leaf() || !root.entries.is_empty() {
                    return Ok(());
                }
                root.children[0]
            };

            self.free_page(root_id);
            self.meta.root_id = only_child;
            self.meta.dirty = true;
            self.fetch_mut(only_child)?;
        }
    }

    /// Allocates `n` nodes on sequential pages, free list first, and makes
    /// them resident. Returns the first id.
    fn alloc_nodes(&mut self, n: usize) -> Result<u32> {
        let first = match take_free_run(&mut self.meta.free_list, n) {
            Some(id) => {
                self.meta.dirty = true;
                id
            }
            None => {
                let pager = self.pager.as_mut().ok_or(Error::Closed)?;
                pager.alloc(n)?
            }
        };

        for i in 0..n as u32 {
            self.cache.insert(Node::new(first + i));
        }
        Ok(first)
    }

    /// Returns a page to the free list, dropping any resident node for it.
    fn free_page(&mut self, id: u32) {
        self.cache.remove(id);
        if let Err(pos) = self.meta.free_list.binary_search(&id) {
            self.meta.free_list.insert(pos, id);
        }
        self.meta.dirty = true;
    }

    fn flush(&mut self) -> Result<()> {
        let pager = self.pager.as_mut().ok_or(Error::Closed)?;
        if pager.read_only() {
            return Ok(());
        }
        self.cache.flush(pager, &mut self.meta)
    }

    fn close(&mut self) -> Result<()> {
        if self.pager.is_none() {
            return Ok(());
        }

        let flushed = self.flush();
        let pager = self.pager.take().expect("pager present");
        let synced = if pager.read_only() {
            Ok(())
        } else {
            pager.sync()
        };
        debug!(file = pager.name(), "closed b+ tree");

        flushed.and(synced)
    }
}

fn init_tree(pager: &mut Pager, cache: &mut NodeCache, opts: &TreeOptions) -> Result<Metadata> {
    pager.alloc(2 + opts.preallocate)?;

    cache.insert(Node::new(1));

    let mut meta = Metadata::new(pager.page_size() as u32, opts.max_key_size);
    meta.free_list = (2..2 + opts.preallocate as u32).collect();

    debug!(
        page_size = pager.page_size(),
        preallocate = opts.preallocate,
        "initialized new b+ tree"
    );

    Ok(meta)
}

/// Degrees derived from the page and key-size limits; each kind's
/// worst-case full node must serialize within one page, so the packed
/// capacity is halved to leave slack for variable-length keys.
fn compute_degrees(page_size: usize, max_key_size: usize) -> Result<(usize, usize)> {
    let leaf_content = page_size - LEAF_HEADER_SIZE;
    let internal_content = page_size - INTERNAL_HEADER_SIZE;

    let leaf_entry = LEAF_ENTRY_OVERHEAD + max_key_size;
    let internal_entry = INTERNAL_ENTRY_OVERHEAD + max_key_size;

    let leaf_degree = leaf_content / (2 * leaf_entry);
    let degree = (internal_content - CHILD_PTR_SIZE) / (2 * internal_entry);

    if leaf_degree <= 2 || degree <= 2 {
        bail!(Error::DegreeTooSmall {
            leaf: leaf_degree,
            internal: degree,
        });
    }

    Ok((leaf_degree, degree))
}

/// Extracts `n` sequential ids from the sorted free list, preferring the
/// head. Returns `None` when no run of that length exists.
fn take_free_run(free: &mut Vec<u32>, n: usize) -> Option<u32> {
    if free.len() < n || n == 0 {
        return None;
    }
    if n == 1 {
        return Some(free.remove(0));
    }

    let mut i = 0;
    while i + n <= free.len() {
        let j = i + n - 1;
        if free[j] == free[i] + (n as u32 - 1) {
            let id = free[i];
            free.drain(i..=j);
            return Some(id);
        }
        i += 1;
    }
    None
}
