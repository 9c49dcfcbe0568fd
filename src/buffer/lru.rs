/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Recency order over a fixed pool of frame indices, kept as a doubly
//! linked list threaded through a preallocated node array rather than
//! through back-references carried on the frames themselves — see
//! spec.md §9/REDESIGN FLAGS. `touch` (promote to most-recent) and
//! `remove` are both O(1); no predecessor scan is needed.

#[derive(Debug, Clone, Copy)]
struct Node {
    prev: Option<usize>,
    next: Option<usize>,
}

/// A recency list over frame indices `0..capacity`. A frame index may be
/// linked in or absent (not yet touched, or removed).
#[derive(Debug)]
pub struct LruList {
    nodes: Vec<Option<Node>>,
    /// Most-recently-touched frame index.
    head: Option<usize>,
    /// Least-recently-touched frame index — the first eviction candidate.
    tail: Option<usize>,
}

impl LruList {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: vec![None; capacity],
            head: None,
            tail: None,
        }
    }

    /// Unlink `frame_id` if it's currently linked in, leaving the rest of
    /// the list intact.
    pub fn remove(&mut self, frame_id: usize) {
        let Some(node) = self.nodes[frame_id] else {
            return;
        };
        match node.prev {
            Some(prev) => self.nodes[prev].as_mut().unwrap().next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].as_mut().unwrap().prev = node.prev,
            None => self.tail = node.prev,
        }
        self.nodes[frame_id] = None;
    }

    /// Link `frame_id` in (removing it first if already linked) as the
    /// new most-recent entry.
    pub fn touch(&mut self, frame_id: usize) {
        self.remove(frame_id);
        let old_head = self.head;
        self.nodes[frame_id] = Some(Node {
            prev: None,
            next: old_head,
        });
        if let Some(old_head) = old_head {
            self.nodes[old_head].as_mut().unwrap().prev = Some(frame_id);
        }
        self.head = Some(frame_id);
        if self.tail.is_none() {
            self.tail = Some(frame_id);
        }
    }

    /// Walk frame indices from least-recent to most-recent.
    pub fn iter_least_recent_first(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.tail;
        std::iter::from_fn(move || {
            let current = cursor?;
            cursor = self.nodes[current].unwrap().prev;
            Some(current)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_promotes_to_most_recent() {
        let mut list = LruList::new(4);
        list.touch(0);
        list.touch(1);
        list.touch(2);
        // Least-recent-first: 0, 1, 2.
        assert_eq!(list.iter_least_recent_first().collect::<Vec<_>>(), vec![0, 1, 2]);
        list.touch(0);
        // 0 is now most-recent: least-recent-first order is 1, 2, 0.
        assert_eq!(list.iter_least_recent_first().collect::<Vec<_>>(), vec![1, 2, 0]);
    }

    #[test]
    fn remove_unlinks_without_disturbing_neighbors() {
        let mut list = LruList::new(4);
        list.touch(0);
        list.touch(1);
        list.touch(2);
        list.remove(1);
        assert_eq!(list.iter_least_recent_first().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn removing_the_only_entry_empties_the_list() {
        let mut list = LruList::new(4);
        list.touch(0);
        list.remove(0);
        assert_eq!(list.iter_least_recent_first().collect::<Vec<_>>(), Vec::<usize>::new());
    }
}
