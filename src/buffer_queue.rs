//! Ring of cached subrecord state buffers
//!
//! Each subrecord keeps a small, fixed number of raw byte buffers, each
//! tagged with the state it currently holds. Reading a tagged state is a
//! cache hit and needs no I/O. On a miss the queue hands out an unused
//! buffer if there is one, otherwise the buffer just past the most recently
//! used one, and re-tags it.
//!
//! Resizing keeps cached data where it can:
//! - growing appends fresh buffers and keeps every existing one
//! - shrinking drops the buffers just past the most recently used pointer,
//!   so the most recently used subset survives, compacted to low indices
//! - changing the buffer length throws everything away
//!
//! New buffers are allocated as a batch before the live queue is touched,
//! so an allocation failure leaves the queue unchanged.

use crate::error::{MiliError, Result};

#[derive(Debug)]
struct Slot {
    data: Vec<u8>,
    state: Option<usize>,
}

/// Buffer queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferQueueStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Number of buffers
    pub buffers: usize,
    /// Buffers holding a state
    pub tagged: usize,
}

impl BufferQueueStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Fixed-capacity cache of per-state buffers for one subrecord
#[derive(Debug)]
pub struct BufferQueue {
    slots: Vec<Slot>,
    buffer_len: usize,
    recent: Option<usize>,
    hits: u64,
    misses: u64,
}

fn allocate_batch(qty: usize, len: usize) -> Result<Vec<Slot>> {
    let mut batch: Vec<Slot> = Vec::new();
    batch
        .try_reserve_exact(qty)
        .map_err(|e| MiliError::AllocFailed(format!("{} buffer slots: {}", qty, e)))?;
    for _ in 0..qty {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| MiliError::AllocFailed(format!("{} byte buffer: {}", len, e)))?;
        data.resize(len, 0);
        batch.push(Slot { data, state: None });
    }
    Ok(batch)
}

impl BufferQueue {
    /// Create a queue of `qty` buffers of `buffer_len` bytes each
    pub fn new(qty: usize, buffer_len: usize) -> Result<Self> {
        Ok(BufferQueue {
            slots: allocate_batch(qty, buffer_len)?,
            buffer_len,
            recent: None,
            hits: 0,
            misses: 0,
        })
    }

    /// Number of buffers
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Index of the most recently used buffer
    pub fn recent(&self) -> Option<usize> {
        self.recent
    }

    /// State held by buffer `index`
    pub fn state_at(&self, index: usize) -> Option<usize> {
        self.slots.get(index).and_then(|s| s.state)
    }

    /// States currently cached, in buffer order
    pub fn cached_states(&self) -> Vec<usize> {
        self.slots.iter().filter_map(|s| s.state).collect()
    }

    pub fn contains(&self, state: usize) -> bool {
        self.position(state).is_some()
    }

    fn position(&self, state: usize) -> Option<usize> {
        self.slots.iter().position(|s| s.state == Some(state))
    }

    /// Change the number of buffers and their length
    pub fn resize(&mut self, qty: usize, buffer_len: usize) -> Result<()> {
        if buffer_len != self.buffer_len {
            let fresh = allocate_batch(qty, buffer_len)?;
            self.slots = fresh;
            self.buffer_len = buffer_len;
            self.recent = None;
            return Ok(());
        }

        let count = self.slots.len();
        if qty > count {
            let fresh = allocate_batch(qty - count, buffer_len)?;
            self.slots.extend(fresh);
        } else if qty < count {
            self.shrink(qty);
        }
        Ok(())
    }

    fn shrink(&mut self, qty: usize) {
        let count = self.slots.len();
        let freed = count - qty;
        // First freed buffer sits just past the most recent one
        let start = self.recent.map_or(0, |r| (r + 1) % count);

        let mut old: Vec<Option<Slot>> = self.slots.drain(..).map(Some).collect();
        let mut kept = Vec::with_capacity(qty);
        for k in 0..qty {
            let index = (start + freed + k) % count;
            if let Some(slot) = old[index].take() {
                kept.push(slot);
            }
        }
        self.slots = kept;

        // The most recent buffer is always the last survivor
        if self.recent.is_some() {
            self.recent = qty.checked_sub(1);
        }
    }

    /// Return the buffer for `state`, loading it on a miss
    ///
    /// `load` fills the buffer from storage. If it fails the buffer is left
    /// untagged and the error is returned.
    pub fn get_or_load<F>(&mut self, state: usize, load: F) -> Result<&[u8]>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        if self.slots.is_empty() {
            return Err(MiliError::AllocFailed(
                "buffer queue has no buffers".to_string(),
            ));
        }

        if let Some(index) = self.position(state) {
            self.hits += 1;
            self.recent = Some(index);
            return Ok(&self.slots[index].data);
        }

        self.misses += 1;
        let index = match self.slots.iter().position(|s| s.state.is_none()) {
            Some(unused) => unused,
            None => self.recent.map_or(0, |r| (r + 1) % self.slots.len()),
        };

        let slot = &mut self.slots[index];
        slot.state = None;
        load(&mut slot.data)?;
        slot.state = Some(state);
        self.recent = Some(index);

        Ok(&self.slots[index].data)
    }

    /// Drop every cached state without freeing buffers
    pub fn invalidate(&mut self) {
        for slot in &mut self.slots {
            slot.state = None;
        }
        self.recent = None;
    }

    pub fn stats(&self) -> BufferQueueStats {
        BufferQueueStats {
            hits: self.hits,
            misses: self.misses,
            buffers: self.slots.len(),
            tagged: self.slots.iter().filter(|s| s.state.is_some()).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(state: usize) -> impl FnOnce(&mut [u8]) -> Result<()> {
        move |buf: &mut [u8]| {
            buf.fill(state as u8);
            Ok(())
        }
    }

    #[test]
    fn test_hit_and_miss() {
        let mut queue = BufferQueue::new(2, 4).unwrap();

        assert_eq!(queue.get_or_load(7, fill(7)).unwrap(), &[7, 7, 7, 7]);
        assert_eq!(queue.get_or_load(7, |_| panic!("hit must not load")).unwrap()[0], 7);

        let stats = queue.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_eviction_cycles_through_ring() {
        let mut queue = BufferQueue::new(2, 1).unwrap();
        queue.get_or_load(0, fill(0)).unwrap();
        queue.get_or_load(1, fill(1)).unwrap();
        queue.get_or_load(2, fill(2)).unwrap();

        // State 0 was oldest and got replaced
        assert!(!queue.contains(0));
        assert!(queue.contains(1));
        assert!(queue.contains(2));
        assert_eq!(queue.recent(), Some(0));
    }

    #[test]
    fn test_failed_load_leaves_slot_untagged() {
        let mut queue = BufferQueue::new(1, 2).unwrap();
        queue.get_or_load(3, fill(3)).unwrap();

        let err = queue
            .get_or_load(4, |_| Err(MiliError::ShortRead { expected: 2, actual: 0 }))
            .unwrap_err();
        assert!(matches!(err, MiliError::ShortRead { .. }));
        assert!(!queue.contains(3));
        assert!(!queue.contains(4));
    }

    #[test]
    fn test_grow_keeps_entries() {
        let mut queue = BufferQueue::new(2, 1).unwrap();
        queue.get_or_load(10, fill(10)).unwrap();
        queue.get_or_load(11, fill(11)).unwrap();

        queue.resize(4, 1).unwrap();
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.cached_states(), vec![10, 11]);

        // New buffers are used before anything is evicted
        queue.get_or_load(12, fill(12)).unwrap();
        queue.get_or_load(13, fill(13)).unwrap();
        assert_eq!(queue.cached_states(), vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_shrink_keeps_most_recent() {
        let mut queue = BufferQueue::new(4, 1).unwrap();
        for state in 0..6 {
            queue.get_or_load(state, fill(state)).unwrap();
        }
        // Ring now holds [4, 5, 2, 3] with recent at index 1
        assert_eq!(queue.recent(), Some(1));

        queue.resize(2, 1).unwrap();
        assert_eq!(queue.cached_states(), vec![4, 5]);
        assert_eq!(queue.recent(), Some(1));
        assert_eq!(queue.state_at(1), Some(5));

        // Next miss evicts the older survivor
        queue.get_or_load(6, fill(6)).unwrap();
        assert_eq!(queue.cached_states(), vec![6, 5]);
    }

    #[test]
    fn test_shrink_to_zero() {
        let mut queue = BufferQueue::new(3, 8).unwrap();
        queue.get_or_load(1, fill(1)).unwrap();
        queue.resize(0, 8).unwrap();
        assert!(queue.is_empty());
        assert!(queue.get_or_load(1, fill(1)).is_err());
    }

    #[test]
    fn test_length_change_discards() {
        let mut queue = BufferQueue::new(2, 4).unwrap();
        queue.get_or_load(1, fill(1)).unwrap();

        queue.resize(2, 8).unwrap();
        assert_eq!(queue.buffer_len(), 8);
        assert!(queue.cached_states().is_empty());
        assert_eq!(queue.get_or_load(1, fill(1)).unwrap().len(), 8);
    }

    #[test]
    fn test_failed_allocation_leaves_queue_intact() {
        let mut queue = BufferQueue::new(1, 4).unwrap();
        queue.get_or_load(9, fill(9)).unwrap();

        let err = queue.resize(2, usize::MAX).unwrap_err();
        assert!(matches!(err, MiliError::AllocFailed(_)));
        assert_eq!(queue.buffer_len(), 4);
        assert_eq!(queue.cached_states(), vec![9]);
    }
}
