// This file is part of Loess.
//
// Loess is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Loess is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Loess.  If not, see <http://www.gnu.org/licenses/>.

const NONE: u32 = u32::MAX;

/// Recency ordering over a fixed range of small integer ids, implemented as
/// an intrusive doubly-linked list over two index vectors. Ids are not part
/// of the queue until the first `bring_to_front`.
#[derive(Clone, Debug)]
pub struct LruQueue {
    prev: Vec<u32>,
    next: Vec<u32>,
    linked: Vec<bool>,
    head: u32,
    tail: u32,
    len: usize,
}

impl LruQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity < NONE as usize);
        Self {
            prev: vec![NONE; capacity],
            next: vec![NONE; capacity],
            linked: vec![false; capacity],
            head: NONE,
            tail: NONE,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, id: usize) -> bool {
        self.linked[id]
    }

    /// Mark `id` as the most recently used entry, inserting it if needed.
    pub fn bring_to_front(&mut self, id: usize) {
        if self.linked[id] {
            self.unlink(id);
        }
        let id32 = id as u32;
        self.prev[id] = NONE;
        self.next[id] = self.head;
        if self.head != NONE {
            self.prev[self.head as usize] = id32;
        }
        self.head = id32;
        if self.tail == NONE {
            self.tail = id32;
        }
        self.linked[id] = true;
        self.len += 1;
    }

    /// Drop `id` from the recency ordering entirely.
    pub fn remove(&mut self, id: usize) {
        if self.linked[id] {
            self.unlink(id);
            self.linked[id] = false;
        }
    }

    /// The least recently used entry, if any.
    pub fn oldest(&self) -> Option<usize> {
        if self.tail == NONE {
            None
        } else {
            Some(self.tail as usize)
        }
    }

    /// Walk entries from least to most recently used.
    pub fn iter_oldest_first(&self) -> OldestFirst<'_> {
        OldestFirst {
            queue: self,
            cursor: self.tail,
        }
    }

    fn unlink(&mut self, id: usize) {
        let p = self.prev[id];
        let n = self.next[id];
        if p != NONE {
            self.next[p as usize] = n;
        } else {
            self.head = n;
        }
        if n != NONE {
            self.prev[n as usize] = p;
        } else {
            self.tail = p;
        }
        self.prev[id] = NONE;
        self.next[id] = NONE;
        self.len -= 1;
    }
}

pub struct OldestFirst<'a> {
    queue: &'a LruQueue,
    cursor: u32,
}

impl<'a> Iterator for OldestFirst<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cursor == NONE {
            return None;
        }
        let id = self.cursor as usize;
        self.cursor = self.queue.prev[id];
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recency_order() {
        let mut lru = LruQueue::with_capacity(4);
        assert_eq!(lru.oldest(), None);
        lru.bring_to_front(0);
        lru.bring_to_front(1);
        lru.bring_to_front(2);
        assert_eq!(lru.oldest(), Some(0));
        lru.bring_to_front(0);
        assert_eq!(lru.oldest(), Some(1));
        let order = lru.iter_oldest_first().collect::<Vec<_>>();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_remove_relinks() {
        let mut lru = LruQueue::with_capacity(4);
        lru.bring_to_front(0);
        lru.bring_to_front(1);
        lru.bring_to_front(2);
        lru.remove(1);
        assert!(!lru.contains(1));
        assert_eq!(lru.iter_oldest_first().collect::<Vec<_>>(), vec![0, 2]);
        lru.remove(0);
        lru.remove(2);
        assert!(lru.is_empty());
        assert_eq!(lru.oldest(), None);
        lru.bring_to_front(3);
        assert_eq!(lru.oldest(), Some(3));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut lru = LruQueue::with_capacity(2);
        lru.bring_to_front(1);
        lru.remove(1);
        lru.remove(1);
        assert_eq!(lru.len(), 0);
    }
}
