//! Object id-blocks
//!
//! An id-block is an inclusive, 1-based `[first, last]` range of object
//! identifiers. Classes and subrecords describe their objects as a sorted
//! list of blocks; merged lists never contain overlapping or adjacent blocks.

use crate::error::{MiliError, Result};
use serde::{Deserialize, Serialize};

/// Inclusive range of object identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdBlock {
    pub first: usize,
    pub last: usize,
}

impl IdBlock {
    pub fn new(first: usize, last: usize) -> Self {
        IdBlock { first, last }
    }

    /// Number of objects in the block
    pub fn len(&self) -> usize {
        self.last + 1 - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }

    pub fn contains(&self, id: usize) -> bool {
        id >= self.first && id <= self.last
    }

    /// Check if two blocks share at least one identifier
    pub fn overlaps(&self, other: &IdBlock) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

/// Ordered list of id-blocks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockList {
    blocks: Vec<IdBlock>,
}

impl BlockList {
    pub fn new() -> Self {
        BlockList { blocks: Vec::new() }
    }

    /// Build from `(first, last)` pairs, rejecting empty or zero-based ranges
    pub fn from_ranges(ranges: &[(usize, usize)]) -> Result<Self> {
        let mut blocks = Vec::with_capacity(ranges.len());
        for &(first, last) in ranges {
            if first == 0 || last < first {
                return Err(MiliError::InvalidIdBlock { first, last });
            }
            blocks.push(IdBlock::new(first, last));
        }
        Ok(BlockList { blocks })
    }

    /// Convert an identifier list into canonical blocks
    ///
    /// Identifiers are sorted and deduplicated first, so the result is
    /// sorted with no overlapping or adjacent blocks.
    pub fn from_ids(ids: &[usize]) -> Self {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut blocks = Vec::new();
        let mut iter = sorted.into_iter();
        if let Some(first) = iter.next() {
            let mut current = IdBlock::new(first, first);
            for id in iter {
                if id == current.last + 1 {
                    current.last = id;
                } else {
                    blocks.push(current);
                    current = IdBlock::new(id, id);
                }
            }
            blocks.push(current);
        }
        BlockList { blocks }
    }

    pub fn blocks(&self) -> &[IdBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total number of objects described by the list
    pub fn qty(&self) -> usize {
        self.blocks.iter().map(IdBlock::len).sum()
    }

    /// Iterate all identifiers in list order
    pub fn ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks.iter().flat_map(|b| b.first..=b.last)
    }

    /// Highest identifier in the list
    pub fn max_id(&self) -> Option<usize> {
        self.blocks.iter().map(|b| b.last).max()
    }

    /// Check whether any block overlaps `block`
    pub fn overlaps(&self, block: &IdBlock) -> bool {
        self.blocks.iter().any(|b| b.overlaps(block))
    }

    /// Verify that no two blocks share an identifier
    pub fn check_disjoint(&self, class: &str) -> Result<()> {
        let mut sorted = self.blocks.clone();
        sorted.sort_unstable_by_key(|b| b.first);
        for pair in sorted.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(MiliError::ObjectRangeOverlap {
                    class: class.to_string(),
                    first: pair[1].first,
                    last: pair[1].last,
                });
            }
        }
        Ok(())
    }

    /// Append a block, rejecting overlap with existing blocks
    pub fn push(&mut self, block: IdBlock, class: &str) -> Result<()> {
        if self.overlaps(&block) {
            return Err(MiliError::ObjectRangeOverlap {
                class: class.to_string(),
                first: block.first,
                last: block.last,
            });
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Union of two sorted block lists
    ///
    /// Walks both lists in lock-step, always taking the block with the lower
    /// start. A candidate is folded into the current output block when its
    /// start is at most one past the current end, otherwise it opens a new
    /// output block.
    pub fn merge(&self, other: &BlockList) -> BlockList {
        let a = &self.blocks;
        let b = &other.blocks;
        let mut merged: Vec<IdBlock> = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);

        while i < a.len() || j < b.len() {
            let candidate = if j >= b.len() || (i < a.len() && a[i].first <= b[j].first) {
                i += 1;
                a[i - 1]
            } else {
                j += 1;
                b[j - 1]
            };

            match merged.last_mut() {
                Some(current) if candidate.first <= current.last + 1 => {
                    current.last = current.last.max(candidate.last);
                }
                _ => merged.push(candidate),
            }
        }

        BlockList { blocks: merged }
    }

    /// Map every identifier through `translate`, returning canonical blocks
    pub fn translate<F>(&self, mut translate: F) -> Result<BlockList>
    where
        F: FnMut(usize) -> Result<usize>,
    {
        let mut ids = Vec::with_capacity(self.qty());
        for id in self.ids() {
            ids.push(translate(id)?);
        }
        Ok(BlockList::from_ids(&ids))
    }

    /// Zero-based position of `id` in list order
    pub fn ordinal_of(&self, id: usize) -> Option<usize> {
        let mut base = 0;
        for block in &self.blocks {
            if block.contains(id) {
                return Some(base + id - block.first);
            }
            base += block.len();
        }
        None
    }

    /// Lookup table from identifier to ordinal for repeated queries
    pub fn ordinal_index(&self) -> OrdinalIndex {
        let mut starts = Vec::with_capacity(self.blocks.len());
        let mut base = 0;
        for block in &self.blocks {
            starts.push((block.first, block.last, base));
            base += block.len();
        }
        starts.sort_unstable_by_key(|&(first, _, _)| first);
        OrdinalIndex { starts }
    }
}

/// Sorted block index for binary-search ordinal lookups
#[derive(Debug, Clone)]
pub struct OrdinalIndex {
    starts: Vec<(usize, usize, usize)>,
}

impl OrdinalIndex {
    pub fn ordinal_of(&self, id: usize) -> Option<usize> {
        let pos = self.starts.partition_point(|&(first, _, _)| first <= id);
        if pos == 0 {
            return None;
        }
        let (first, last, base) = self.starts[pos - 1];
        if id <= last {
            Some(base + id - first)
        } else {
            None
        }
    }
}

impl FromIterator<IdBlock> for BlockList {
    fn from_iter<T: IntoIterator<Item = IdBlock>>(iter: T) -> Self {
        BlockList {
            blocks: iter.into_iter().collect(),
        }
    }
}
