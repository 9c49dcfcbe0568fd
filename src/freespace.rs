/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Per-relation free-space map: a tournament tree over leaves (pages),
//! where every internal node carries the max of its children's
//! `max_space`, so a best-fit page for a given payload size can be found
//! in O(log N). See spec.md §3/§4.7.
//!
//! The tree is built as an arena of nodes addressed by index rather than
//! through parent/child pointers carried on the nodes themselves — the
//! same indices-over-references idiom the buffer pool's LRU list uses
//! (see `crate::buffer::lru`), for the same reason: no cross-references
//! to fight the borrow checker over.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use tracing::trace;

use crate::error::FreeSpaceError;
use crate::page::PageId;

#[derive(Debug, Clone, Copy)]
struct Node {
    /// `Some(page_id)` for a leaf; `None` for an internal node.
    leaf_id: Option<u32>,
    max_space: u16,
    children_count: u32,
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
}

impl Node {
    fn leaf(leaf_id: u32, max_space: u16, parent: Option<usize>) -> Self {
        Self {
            leaf_id: Some(leaf_id),
            max_space,
            children_count: 0,
            parent,
            left: None,
            right: None,
        }
    }

    fn internal(parent: Option<usize>) -> Self {
        Self {
            leaf_id: None,
            max_space: 0,
            children_count: 0,
            parent,
            left: None,
            right: None,
        }
    }
}

/// A single relation's tournament tree. Not internally synchronized —
/// callers serialize access per relation (see [`FreeSpaceManager`]).
#[derive(Debug, Default)]
struct FreeSpaceTree {
    nodes: Vec<Node>,
    root: Option<usize>,
    leaves: HashMap<u32, usize>,
}

impl FreeSpaceTree {
    fn new() -> Self {
        Self::default()
    }

    /// Insert or update the free-space figure for `id`, then propagate
    /// the new maximum up the ancestor chain until a level's computed
    /// max matches what's already stored there.
    fn set_free_space(&mut self, id: u32, free: u16) {
        let leaf = match self.root {
            None => {
                let idx = self.push(Node::leaf(id, free, None));
                self.root = Some(idx);
                self.leaves.insert(id, idx);
                idx
            }
            Some(_) => match self.leaves.get(&id) {
                Some(&idx) => idx,
                None => {
                    let idx = self.create_node(id, free);
                    self.leaves.insert(id, idx);
                    idx
                }
            },
        };

        self.nodes[leaf].max_space = free;
        self.propagate(leaf);
        trace!(page_id = id, free, "free-space map updated");
    }

    /// Find a page id with `max_space >= size` favored at every level,
    /// falling back to the sibling subtree otherwise; `None` if the
    /// root's max is already below `size`.
    fn get_match(&self, size: u16) -> Option<u32> {
        let mut idx = self.root?;
        if self.nodes[idx].max_space < size {
            return None;
        }
        while self.nodes[idx].leaf_id.is_none() {
            let left = self.nodes[idx].left;
            let right = self.nodes[idx].right;
            // `>=`, not `>`: a left subtree whose max exactly equals
            // `size` still satisfies the request. Using `>` here would
            // fall through to the right subtree even when it has *less*
            // free space than requested, since the only invariant this
            // descent relies on is `parent.max_space == max(left, right)`
            // — not that the right side is also a match.
            idx = match left {
                Some(l) if self.nodes[l].max_space >= size => l,
                _ => right.expect("an internal node always has both children"),
            };
        }
        self.nodes[idx].leaf_id
    }

    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Insert a new leaf for `id`, descending from the root into
    /// whichever subtree has fewer descendants, and promoting a
    /// childless node (including a childless root) into a new internal
    /// node with two children when a spot is found.
    fn create_node(&mut self, id: u32, free: u16) -> usize {
        let mut node = self.root.expect("create_node only called on a non-empty tree");
        loop {
            if self.nodes[node].left.is_none() && self.nodes[node].right.is_none() {
                return self.split_leaf(node, id, free);
            }
            if self.nodes[node].left.is_none() {
                self.nodes[node].children_count += 1;
                let idx = self.push(Node::leaf(id, free, Some(node)));
                self.nodes[node].left = Some(idx);
                return idx;
            }
            if self.nodes[node].right.is_none() {
                self.nodes[node].children_count += 1;
                let idx = self.push(Node::leaf(id, free, Some(node)));
                self.nodes[node].right = Some(idx);
                return idx;
            }
            let left = self.nodes[node].left.unwrap();
            let right = self.nodes[node].right.unwrap();
            self.nodes[node].children_count += 1;
            node = if self.nodes[left].children_count < self.nodes[right].children_count {
                left
            } else {
                right
            };
        }
    }

    /// `node` is a leaf (or a childless root). Promote it into an
    /// internal node with two children: itself as the left child and a
    /// fresh leaf for `id` as the right child.
    fn split_leaf(&mut self, node: usize, id: u32, free: u16) -> usize {
        let parent = self.nodes[node].parent;
        let new_internal = self.push(Node::internal(parent));
        self.nodes[new_internal].children_count = 2;
        self.nodes[new_internal].left = Some(node);
        self.nodes[node].parent = Some(new_internal);

        match parent {
            None => self.root = Some(new_internal),
            Some(parent) => {
                if self.nodes[parent].left == Some(node) {
                    self.nodes[parent].left = Some(new_internal);
                } else {
                    self.nodes[parent].right = Some(new_internal);
                }
            }
        }

        let new_leaf = self.push(Node::leaf(id, free, Some(new_internal)));
        self.nodes[new_internal].right = Some(new_leaf);
        new_leaf
    }

    fn propagate(&mut self, leaf: usize) {
        let mut current = leaf;
        while let Some(parent) = self.nodes[current].parent {
            let new_max = match (self.nodes[parent].left, self.nodes[parent].right) {
                (Some(l), Some(r)) => self.nodes[l].max_space.max(self.nodes[r].max_space),
                (Some(l), None) => self.nodes[l].max_space,
                (None, Some(r)) => self.nodes[r].max_space,
                (None, None) => 0,
            };
            if new_max == self.nodes[parent].max_space {
                break;
            }
            self.nodes[parent].max_space = new_max;
            current = parent;
        }
    }
}

/// Owns one [`FreeSpaceTree`] per registered relation, each guarded by
/// its own mutex per spec.md §4.7 ("updates and queries must be
/// externally serialized per relation").
#[derive(Default)]
pub struct FreeSpaceManager {
    trees: RwLock<HashMap<String, Mutex<FreeSpaceTree>>>,
}

impl FreeSpaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty tree for `relation`. Re-initializing an
    /// already-registered relation discards its prior tree.
    pub fn init(&self, relation: &str) {
        let mut trees = self.trees.write().unwrap();
        trees.insert(relation.to_string(), Mutex::new(FreeSpaceTree::new()));
    }

    /// Record that `page_id` within `relation` now has `free` bytes of
    /// free space.
    pub fn set_free_space(
        &self,
        relation: &str,
        page_id: u32,
        free: u16,
    ) -> Result<(), FreeSpaceError> {
        let trees = self.trees.read().unwrap();
        let tree = trees
            .get(relation)
            .ok_or_else(|| FreeSpaceError::RelationNotExists(relation.to_string()))?;
        tree.lock().unwrap().set_free_space(page_id, free);
        Ok(())
    }

    /// Find a page in `relation` with at least `req_size` bytes free.
    pub fn get_free_page_id(
        &self,
        relation: &str,
        req_size: u16,
    ) -> Result<PageId, FreeSpaceError> {
        let trees = self.trees.read().unwrap();
        let tree = trees
            .get(relation)
            .ok_or_else(|| FreeSpaceError::RelationNotExists(relation.to_string()))?;
        let guard = tree.lock().unwrap();
        guard
            .get_match(req_size)
            .map(|id| PageId::new(relation, id))
            .ok_or(FreeSpaceError::NoSpace(req_size))
    }
}
