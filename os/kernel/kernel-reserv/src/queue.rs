//! Partially populated reservation queues.
//!
//! An intrusive-list stand-in: each queue is a doubly linked list whose
//! links live in a map keyed by node. Besides reservations a queue may hold
//! a single scan marker, which every population walk skips.

use crate::ReservIndex;
use alloc::collections::BTreeMap;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum QueueNode {
    Reserv(ReservIndex),
    Marker,
}

impl QueueNode {
    #[inline]
    const fn reserv(self) -> Option<ReservIndex> {
        match self {
            Self::Reserv(idx) => Some(idx),
            Self::Marker => None,
        }
    }
}

#[derive(Copy, Clone, Default)]
struct Links {
    prev: Option<QueueNode>,
    next: Option<QueueNode>,
}

/// Least recently changed first.
#[derive(Default)]
pub struct PartPopQueue {
    head: Option<QueueNode>,
    tail: Option<QueueNode>,
    links: BTreeMap<QueueNode, Links>,
    len: usize,
}

impl PartPopQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            links: BTreeMap::new(),
            len: 0,
        }
    }

    /// Number of reservations queued (the marker is not counted).
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn contains(&self, node: QueueNode) -> bool {
        self.links.contains_key(&node)
    }

    pub fn push_back(&mut self, node: QueueNode) {
        debug_assert!(!self.contains(node), "{node:?} queued twice");
        let links = Links {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(tail) => self.link_mut(tail).next = Some(node),
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.links.insert(node, links);
        self.count(node, true);
    }

    /// Inserts `node` directly after `anchor`, which must be queued.
    pub fn insert_after(&mut self, anchor: QueueNode, node: QueueNode) {
        debug_assert!(!self.contains(node), "{node:?} queued twice");
        let next = self.link_mut(anchor).next.replace(node);
        match next {
            Some(next) => self.link_mut(next).prev = Some(node),
            None => self.tail = Some(node),
        }
        self.links.insert(
            node,
            Links {
                prev: Some(anchor),
                next,
            },
        );
        self.count(node, true);
    }

    /// Unlinks `node`; returns the node that followed it, if any.
    pub fn remove(&mut self, node: QueueNode) -> Option<QueueNode> {
        let Some(links) = self.links.remove(&node) else {
            panic!("{node:?} is not queued");
        };
        match links.prev {
            Some(prev) => self.link_mut(prev).next = links.next,
            None => self.head = links.next,
        }
        match links.next {
            Some(next) => self.link_mut(next).prev = links.prev,
            None => self.tail = links.prev,
        }
        self.count(node, false);
        links.next
    }

    #[must_use]
    pub fn prev(&self, node: QueueNode) -> Option<QueueNode> {
        self.links.get(&node).and_then(|l| l.prev)
    }

    #[must_use]
    pub fn next(&self, node: QueueNode) -> Option<QueueNode> {
        self.links.get(&node).and_then(|l| l.next)
    }

    /// First reservation at or after `node`, skipping the marker.
    #[must_use]
    pub fn reserv_from(&self, mut node: Option<QueueNode>) -> Option<ReservIndex> {
        while let Some(n) = node {
            if let Some(idx) = n.reserv() {
                return Some(idx);
            }
            node = self.next(n);
        }
        None
    }

    /// First queued reservation.
    #[must_use]
    pub fn front(&self) -> Option<ReservIndex> {
        self.reserv_from(self.head)
    }

    /// Reservation following `idx`, skipping the marker.
    #[must_use]
    pub fn next_reserv(&self, idx: ReservIndex) -> Option<ReservIndex> {
        self.reserv_from(self.next(QueueNode::Reserv(idx)))
    }

    /// Reservations in queue order.
    pub fn iter(&self) -> impl Iterator<Item = ReservIndex> + '_ {
        let mut node = self.head;
        core::iter::from_fn(move || {
            let idx = self.reserv_from(node)?;
            node = self.next(QueueNode::Reserv(idx));
            Some(idx)
        })
    }

    fn link_mut(&mut self, node: QueueNode) -> &mut Links {
        let Some(links) = self.links.get_mut(&node) else {
            panic!("{node:?} is not queued");
        };
        links
    }

    const fn count(&mut self, node: QueueNode, added: bool) {
        if let QueueNode::Reserv(_) = node {
            if added {
                self.len += 1;
            } else {
                self.len -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn r(i: usize) -> QueueNode {
        QueueNode::Reserv(ReservIndex::new(i))
    }

    fn order(q: &PartPopQueue) -> Vec<usize> {
        q.iter().map(ReservIndex::get).collect()
    }

    #[test]
    fn fifo_order_and_removal() {
        let mut q = PartPopQueue::default();
        for i in 0..4 {
            q.push_back(r(i));
        }
        assert_eq!(q.len(), 4);
        assert_eq!(q.remove(r(1)), Some(r(2)));
        assert_eq!(q.remove(r(3)), None);
        q.push_back(r(1));
        assert_eq!(order(&q), [0, 2, 1]);
        assert_eq!(q.front(), Some(ReservIndex::new(0)));
    }

    #[test]
    fn marker_is_invisible_to_walks() {
        let mut q = PartPopQueue::default();
        q.push_back(r(5));
        q.push_back(r(6));
        q.insert_after(r(5), QueueNode::Marker);
        assert_eq!(q.len(), 2);
        assert_eq!(q.prev(QueueNode::Marker), Some(r(5)));
        assert_eq!(q.next_reserv(ReservIndex::new(5)), Some(ReservIndex::new(6)));
        assert_eq!(order(&q), [5, 6]);

        // the candidate leaves; the marker now follows the head
        q.remove(r(5));
        assert_eq!(q.prev(QueueNode::Marker), None);
        assert_eq!(q.remove(QueueNode::Marker), Some(r(6)));
        assert_eq!(order(&q), [6]);
    }

    #[test]
    fn marker_at_tail() {
        let mut q = PartPopQueue::default();
        q.push_back(r(1));
        q.insert_after(r(1), QueueNode::Marker);
        q.push_back(r(2));
        assert_eq!(q.next(QueueNode::Marker), Some(r(2)));
        assert_eq!(q.remove(QueueNode::Marker), Some(r(2)));
        assert_eq!(order(&q), [1, 2]);
        assert_eq!(q.len(), 2);
    }
}
