//! Binary min-heap
//!
//! Array-backed priority queue with explicit sift-up/sift-down, used by the
//! label merge to drain per-processor label runs in ascending order.

/// Min-heap over any `Ord` key
#[derive(Debug, Clone)]
pub struct MinHeap<T: Ord> {
    items: Vec<T>,
}

impl<T: Ord> Default for MinHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> MinHeap<T> {
    pub fn new() -> Self {
        MinHeap { items: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        MinHeap {
            items: Vec::with_capacity(capacity),
        }
    }

    /// Build a heap from an unordered vector in O(n)
    pub fn from_vec(items: Vec<T>) -> Self {
        let mut heap = MinHeap { items };
        let len = heap.items.len();
        for i in (0..len / 2).rev() {
            heap.sift_down(i);
        }
        heap
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        let last = self.items.len() - 1;
        self.sift_up(last);
    }

    /// Remove and return the smallest item
    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let min = self.items.pop();
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        min
    }

    fn sift_up(&mut self, mut child: usize) {
        while child > 0 {
            let parent = (child - 1) / 2;
            if self.items[child] >= self.items[parent] {
                break;
            }
            self.items.swap(child, parent);
            child = parent;
        }
    }

    fn sift_down(&mut self, mut parent: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * parent + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let smallest = if right < len && self.items[right] < self.items[left] {
                right
            } else {
                left
            };
            if self.items[parent] <= self.items[smallest] {
                break;
            }
            self.items.swap(parent, smallest);
            parent = smallest;
        }
    }
}

impl<T: Ord> Iterator for MinHeap<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.pop()
    }
}
