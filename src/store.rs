//! Key-value store facade.
//!
//! Wires the B+ tree index to a blob store: the index maps keys to opaque
//! 64-bit blob ids, the blob store owns the value bytes. Everything here
//! is thin dispatch; the interesting machinery lives in [`crate::tree`]
//! and [`crate::storage`].

use eyre::{bail, Result};
use hashbrown::HashMap;

use crate::error::Error;
use crate::tree::{BPlusTree, TreeOptions};

/// Storage backend for values, addressed by opaque 64-bit ids.
pub trait BlobStore: Send {
    /// Stores the value and returns an id for it.
    fn alloc(&mut self, val: &[u8]) -> Result<u64>;

    /// Retrieves the value with the given id.
    fn fetch(&self, id: u64) -> Result<Vec<u8>>;

    /// Releases the value with the given id.
    fn free(&mut self, id: u64) -> Result<()>;
}

/// In-memory [`BlobStore`].
#[derive(Debug, Default)]
pub struct MemBlobStore {
    blobs: HashMap<u64, Vec<u8>>,
    next_id: u64,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemBlobStore {
    fn alloc(&mut self, val: &[u8]) -> Result<u64> {
        // id 0 is reserved so the index never stores an ambiguous value
        self.next_id += 1;
        let id = self.next_id;
        self.blobs.insert(id, val.to_vec());
        Ok(id)
    }

    fn fetch(&self, id: u64) -> Result<Vec<u8>> {
        match self.blobs.get(&id) {
            Some(val) => Ok(val.clone()),
            None => bail!(Error::corrupt(format!("blob {} not found", id))),
        }
    }

    fn free(&mut self, id: u64) -> Result<()> {
        self.blobs.remove(&id);
        Ok(())
    }
}

/// A key-value store: a [`BPlusTree`] index over a [`BlobStore`].
pub struct Store<B: BlobStore> {
    index: BPlusTree,
    blobs: B,
}

impl<B: BlobStore> Store<B> {
    /// Opens the index at `path` (`":memory:"` for ephemeral) over the
    /// given blob store.
    pub fn open(path: &str, opts: TreeOptions, blobs: B) -> Result<Self> {
        let index = BPlusTree::open(path, opts)?;
        Ok(Self { index, blobs })
    }

    /// Returns the value for the key, `None` when absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.index.get(key)? {
            Some(id) => Ok(Some(self.blobs.fetch(id)?)),
            None => Ok(None),
        }
    }

    /// Stores the key-value pair, replacing (and releasing) any previous
    /// value for the key.
    pub fn put(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let previous = self.index.get(key)?;
        let id = self.blobs.alloc(val)?;
        if let Err(err) = self.index.put(key, id) {
            let _ = self.blobs.free(id);
            return Err(err);
        }
        if let Some(old) = previous {
            self.blobs.free(old)?;
        }
        Ok(())
    }

    /// Removes the entry for the key, returning whether it existed.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        match self.index.del(key)? {
            Some(id) => {
                self.blobs.free(id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Visits entries in key order starting at `start_key`, resolving each
    /// value through the blob store. The visitor returns `true` to stop.
    pub fn scan<F>(&self, start_key: &[u8], reverse: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let mut fetch_err = None;
        self.index.scan(start_key, reverse, |key, id| {
            match self.blobs.fetch(id) {
                Ok(val) => visit(key, &val),
                Err(err) => {
                    fetch_err = Some(err);
                    true
                }
            }
        })?;

        match fetch_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of entries in the store.
    pub fn len(&self) -> i64 {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes and closes the underlying index.
    pub fn close(&self) -> Result<()> {
        self.index.close()
    }
}
