//! # burrow — embeddable single-file key-value storage
//!
//! An embedded key→value engine whose durable state lives in one
//! memory-mapped, page-structured file: a B+ tree index mapping
//! variable-length byte keys to 64-bit values, with ordered scans in both
//! directions. Intended for one writer and many readers in a single
//! process.
//!
//! ## Quick start
//!
//! ```ignore
//! use burrow::{BPlusTree, TreeOptions};
//!
//! let tree = BPlusTree::open("index.bur", TreeOptions::default())?;
//! tree.put(b"hello", 42)?;
//! assert_eq!(tree.get(b"hello")?, Some(42));
//! tree.scan(b"", false, |key, val| {
//!     println!("{:?} -> {}", key, val);
//!     false
//! })?;
//! tree.close()?;
//! ```
//!
//! Pass `":memory:"` as the path for an ephemeral tree with no file
//! behind it.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────┐
//! │  Store (key → value bytes)        │  optional facade over a BlobStore
//! ├───────────────────────────────────┤
//! │  BPlusTree (key → u64)            │  nodes, cache, split/merge, scan
//! ├───────────────────────────────────┤
//! │  Pager (page id → page bytes)     │  alloc, whole-page read/write
//! ├───────────────────────────────────┤
//! │  BlockFile (mmap file / memory)   │  grow-by-truncate, remap
//! └───────────────────────────────────┘
//! ```
//!
//! Page 0 carries the tree metadata (root id, entry count, free-page
//! list); page 1 is the initial root; further pages are allocated on
//! demand and recycled through the free list.

pub mod error;
pub mod storage;
pub mod store;
pub mod tree;

pub use error::Error;
pub use storage::{Pager, Stats, IN_MEMORY_PATH};
pub use store::{BlobStore, MemBlobStore, Store};
pub use tree::{BPlusTree, TreeOptions};
