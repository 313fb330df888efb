//! Owning cache of resident nodes.
//!
//! Every loaded node lives here for the tree's lifetime, keyed by page id;
//! cross-node references stay id-based so the graph has a single owner.
//! There is no eviction — an acknowledged limitation for very large trees.

use hashbrown::HashMap;

use eyre::Result;

use crate::storage::Pager;

use super::meta::Metadata;
use super::node::Node;

#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: HashMap<u32, Node>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Inserts a node under its own id, replacing any previous resident.
    pub fn insert(&mut self, node: Node) -> &mut Node {
        self.nodes.entry(node.id).insert(node).into_mut()
    }

    /// Drops the resident node for a freed page so it can never be
    /// flushed over a reused id.
    pub fn remove(&mut self, id: u32) -> Option<Node> {
        self.nodes.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Writes every dirty node through the pager, clearing flags, then the
    /// metadata page if it is dirty. Iteration order is unobservable.
    pub fn flush(&mut self, pager: &mut Pager, meta: &mut Metadata) -> Result<()> {
        for node in self.nodes.values_mut() {
            if node.dirty {
                pager.marshal(node.id, &*node)?;
                node.dirty = false;
            }
        }

        if meta.dirty {
            pager.marshal(0, &*meta)?;
            meta.dirty = false;
        }

        Ok(())
    }
}
