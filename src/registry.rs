//! Handle-based ownership of open families

use crate::error::{MiliError, Result};
use crate::family::{AccessMode, Family};
use crate::numeric::Precision;
use ahash::AHashMap;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Opaque handle to a family owned by a [`FamilyRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FamilyId(u32);

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner of open families, addressed by handle
///
/// Closing a handle flushes and drops its family; the handle is never
/// reused.
#[derive(Default)]
pub struct FamilyRegistry {
    next_id: u32,
    families: AHashMap<FamilyId, Family>,
}

impl FamilyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of an open family
    pub fn insert(&mut self, family: Family) -> FamilyId {
        let id = FamilyId(self.next_id);
        self.next_id += 1;
        debug!("Registered family '{}' as {}", family.root(), id);
        self.families.insert(id, family);
        id
    }

    pub fn open<P: AsRef<Path>>(&mut self, dir: P, root: &str, mode: AccessMode) -> Result<FamilyId> {
        let family = Family::open(dir, root, mode)?;
        Ok(self.insert(family))
    }

    pub fn create<P: AsRef<Path>>(
        &mut self,
        dir: P,
        root: &str,
        precision: Precision,
        states_per_file: usize,
    ) -> Result<FamilyId> {
        let family = Family::create(dir, root, precision, states_per_file)?;
        Ok(self.insert(family))
    }

    pub fn get(&self, id: FamilyId) -> Result<&Family> {
        self.families
            .get(&id)
            .ok_or(MiliError::InvalidFamilyHandle(id.0))
    }

    pub fn get_mut(&mut self, id: FamilyId) -> Result<&mut Family> {
        self.families
            .get_mut(&id)
            .ok_or(MiliError::InvalidFamilyHandle(id.0))
    }

    /// Flush and release a family
    pub fn close(&mut self, id: FamilyId) -> Result<()> {
        let family = self
            .families
            .remove(&id)
            .ok_or(MiliError::InvalidFamilyHandle(id.0))?;
        family.close()
    }

    /// Close every family, reporting the first failure
    pub fn close_all(&mut self) -> Result<()> {
        let mut ids: Vec<FamilyId> = self.families.keys().copied().collect();
        ids.sort();
        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.close(id) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}
