//! Resident B+ tree nodes and their on-page binary layout.
//!
//! A node is the in-memory form of exactly one page. Leaves and internal
//! nodes share one struct; a node with no children is a leaf (the on-disk
//! tag byte makes the same distinction). Cross-node references are page
//! ids, never pointers — the node cache owns every resident instance.
//!
//! ## Page layouts (little-endian)
//!
//! Leaf:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------
//! 0       1     tag (0x00)
//! 1       2     entry_count
//! 3       4     next leaf id (0 = none)
//! 7       4     prev leaf id (0 = none)
//! 11      ...   entries: value(8) ‖ key_len(2) ‖ key(key_len)
//! ```
//!
//! Internal:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------
//! 0       1     tag (0x01, the internal bit)
//! 1       2     entry_count
//! 3       4     child[0]
//! 7       ...   entries: child[i+1](4) ‖ key_len(2) ‖ key(key_len)
//! ```
//!
//! A serialized node never exceeds one page; the degree bounds computed at
//! open time guarantee it, and `marshal_into` re-checks.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::Error;
use crate::storage::{BinaryMarshal, BinaryUnmarshal};

pub const LEAF_HEADER_SIZE: usize = 11;
pub const INTERNAL_HEADER_SIZE: usize = 3;

/// Per-entry overhead on a leaf page: value plus key-length prefix.
pub const LEAF_ENTRY_OVERHEAD: usize = 8 + 2;
/// Per-entry overhead on an internal page: child pointer plus key-length
/// prefix. child[0] is accounted separately.
pub const INTERNAL_ENTRY_OVERHEAD: usize = 4 + 2;
pub const CHILD_PTR_SIZE: usize = 4;

const TAG_LEAF: u8 = 0x00;
const TAG_INTERNAL: u8 = 0x01;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct LeafHeader {
    tag: u8,
    entry_count: U16,
    next: U32,
    prev: U32,
}

const _: () = assert!(std::mem::size_of::<LeafHeader>() == LEAF_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct InternalHeader {
    tag: u8,
    entry_count: U16,
}

const _: () = assert!(std::mem::size_of::<InternalHeader>() == INTERNAL_HEADER_SIZE);

/// One leaf record: caller-owned key bytes and an opaque 64-bit value.
/// Inside internal nodes only the key half is meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub val: u64,
}

impl Entry {
    pub fn new(key: Vec<u8>, val: u64) -> Self {
        Self { key, val }
    }

    /// A separator entry for internal nodes; the value slot is unused.
    pub fn separator(key: Vec<u8>) -> Self {
        Self { key, val: 0 }
    }
}

/// In-memory form of one tree page.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub id: u32,
    /// Set whenever in-memory state diverges from the on-disk page.
    /// Never serialized.
    pub dirty: bool,

    pub next: u32,
    pub prev: u32,
    pub entries: Vec<Entry>,
    pub children: Vec<u32>,
}

impl Node {
    /// A fresh node for a newly allocated page. Dirty from birth: the page
    /// contents are undefined until the first flush.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            dirty: true,
            ..Self::default()
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Binary search over the node's entries. Returns `(idx, found)`:
    /// `idx` is the entry's position when found, otherwise the position at
    /// which the key would be inserted.
    pub fn search(&self, key: &[u8]) -> (usize, bool) {
        match self.entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(idx) => (idx, true),
            Err(idx) => (idx, false),
        }
    }

    /// Inserts the entry at the given position.
    pub fn insert_at(&mut self, idx: usize, entry: Entry) {
        self.dirty = true;
        self.entries.insert(idx, entry);
    }

    /// Removes and returns the entry at the given position.
    pub fn remove_entry(&mut self, idx: usize) -> Entry {
        self.dirty = true;
        self.entries.remove(idx)
    }

    /// Updates the value of the entry at the given position; dirties the
    /// node only when the value actually changes.
    pub fn set_val(&mut self, idx: usize, val: u64) {
        if self.entries[idx].val != val {
            self.dirty = true;
            self.entries[idx].val = val;
        }
    }

    /// Inserts a child pointer at the given position.
    pub fn insert_child(&mut self, idx: usize, child_id: u32) {
        self.dirty = true;
        self.children.insert(idx, child_id);
    }

    /// Removes and returns the child pointer at the given position.
    pub fn remove_child(&mut self, idx: usize) -> u32 {
        self.dirty = true;
        self.children.remove(idx)
    }

    /// Exact size of the serialized form.
    pub fn serialized_size(&self) -> usize {
        let keys: usize = self.entries.iter().map(|e| e.key.len()).sum();
        if self.is_leaf() {
            LEAF_HEADER_SIZE + self.entries.len() * LEAF_ENTRY_OVERHEAD + keys
        } else {
            INTERNAL_HEADER_SIZE
                + CHILD_PTR_SIZE
                + self.entries.len() * INTERNAL_ENTRY_OVERHEAD
                + keys
        }
    }
}

impl BinaryMarshal for Node {
    fn marshal_into(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            self.serialized_size() <= buf.len(),
            "node {} serializes to {} bytes, over the {} byte page",
            self.id,
            self.serialized_size(),
            buf.len()
        );

        if self.is_leaf() {
            let header = LeafHeader {
                tag: TAG_LEAF,
                entry_count: U16::new(self.entries.len() as u16),
                next: U32::new(self.next),
                prev: U32::new(self.prev),
            };
            buf[..LEAF_HEADER_SIZE].copy_from_slice(header.as_bytes());

            let mut offset = LEAF_HEADER_SIZE;
            for e in &self.entries {
                buf[offset..offset + 8].copy_from_slice(U64::new(e.val).as_bytes());
                offset += 8;
                buf[offset..offset + 2].copy_from_slice(U16::new(e.key.len() as u16).as_bytes());
                offset += 2;
                buf[offset..offset + e.key.len()].copy_from_slice(&e.key);
                offset += e.key.len();
            }
        } else {
            ensure!(
                self.children.len() == self.entries.len() + 1,
                "internal node {} has {} children for {} entries",
                self.id,
                self.children.len(),
                self.entries.len()
            );

            let header = InternalHeader {
                tag: TAG_INTERNAL,
                entry_count: U16::new(self.entries.len() as u16),
            };
            buf[..INTERNAL_HEADER_SIZE].copy_from_slice(header.as_bytes());

            let mut offset = INTERNAL_HEADER_SIZE;
            buf[offset..offset + 4].copy_from_slice(U32::new(self.children[0]).as_bytes());
            offset += 4;

            for (i, e) in self.entries.iter().enumerate() {
                buf[offset..offset + 4]
                    .copy_from_slice(U32::new(self.children[i + 1]).as_bytes());
                offset += 4;
                buf[offset..offset + 2].copy_from_slice(U16::new(e.key.len() as u16).as_bytes());
                offset += 2;
                buf[offset..offset + e.key.len()].copy_from_slice(&e.key);
                offset += e.key.len();
            }
        }

        Ok(())
    }
}

impl BinaryUnmarshal for Node {
    fn unmarshal_from(&mut self, data: &[u8]) -> Result<()> {
        ensure!(
            !data.is_empty(),
            Error::corrupt("empty page data for node")
        );

        self.next = 0;
        self.prev = 0;
        self.entries.clear();
        self.children.clear();

        // Leaf when the internal bit is clear.
        if data[0] & TAG_INTERNAL == 0 {
            ensure!(
                data.len() >= LEAF_HEADER_SIZE,
                Error::corrupt(format!("page {} too short for a leaf header", self.id))
            );
            let header = LeafHeader::ref_from_bytes(&data[..LEAF_HEADER_SIZE])
                .map_err(|e| Error::corrupt(format!("bad leaf header on page {}: {e:?}", self.id)))?;

            let count = header.entry_count.get() as usize;
            self.next = header.next.get();
            self.prev = header.prev.get();

            let mut offset = LEAF_HEADER_SIZE;
            self.entries.reserve(count);
            for _ in 0..count {
                ensure!(
                    data.len() >= offset + LEAF_ENTRY_OVERHEAD,
                    Error::corrupt(format!("truncated leaf entry on page {}", self.id))
                );
                let val = u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap());
                offset += 8;
                let key_len =
                    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap()) as usize;
                offset += 2;
                ensure!(
                    data.len() >= offset + key_len,
                    Error::corrupt(format!("truncated leaf key on page {}", self.id))
                );
                let key = data[offset..offset + key_len].to_vec();
                offset += key_len;

                self.entries.push(Entry::new(key, val));
            }
        } else {
            ensure!(
                data.len() >= INTERNAL_HEADER_SIZE + CHILD_PTR_SIZE,
                Error::corrupt(format!("page {} too short for an internal header", self.id))
            );
            let header = InternalHeader::ref_from_bytes(&data[..INTERNAL_HEADER_SIZE]).map_err(
                |e| Error::corrupt(format!("bad internal header on page {}: {e:?}", self.id)),
            )?;

            let count = header.entry_count.get() as usize;

            let mut offset = INTERNAL_HEADER_SIZE;
            self.children
                .push(u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()));
            offset += 4;

            self.entries.reserve(count);
            self.children.reserve(count);
            for _ in 0..count {
                ensure!(
                    data.len() >= offset + INTERNAL_ENTRY_OVERHEAD,
                    Error::corrupt(format!("truncated internal entry on page {}", self.id))
                );
                let child =
                    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
                offset += 4;
                let key_len =
                    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap()) as usize;
                offset += 2;
                ensure!(
                    data.len() >= offset + key_len,
                    Error::corrupt(format!("truncated internal key on page {}", self.id))
                );
                let key = data[offset..offset + key_len].to_vec();
                offset += key_len;

                self.children.push(child);
                self.entries.push(Entry::separator(key));
            }
        }

        Ok(())
    }
}
