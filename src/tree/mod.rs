//! # B+ Tree Index
//!
//! On-disk B+ tree mapping variable-length byte keys to `u64` values, one
//! node per page, built on the [`crate::storage`] pager.
//!
//! ## Components
//!
//! - `node`: resident node form and its exact page layout
//! - `meta`: the page-0 metadata record (root id, size, free list)
//! - `cache`: owning id-keyed map of resident nodes with dirty tracking
//! - `tree`: the tree itself — lifecycle, search, pre-emptive-split
//!   insert, range scan, delete with rebalancing
//!
//! ## Structural invariants
//!
//! - All leaves sit at the same depth; entries within a node are strictly
//!   sorted with no duplicates.
//! - Leaves form a doubly-linked list in key order via `prev`/`next`.
//! - For an internal node with separators `k₁ … kₙ` and children
//!   `c₀ … cₙ`, the subtree at `cᵢ` holds keys in `[kᵢ, kᵢ₊₁)`.
//! - A serialized node never exceeds one page; the degrees computed at
//!   open time guarantee it.

mod cache;
mod meta;
mod node;
#[allow(clippy::module_inception)]
mod tree;

pub use tree::{BPlusTree, TreeOptions};
