//! Subrecords and state-record formats
//!
//! A state record is the byte buffer written for one time step. It is the
//! concatenation of its subrecords, each binding a list of state variables
//! to the objects of one class.
//!
//! Two layouts are supported:
//!
//! ```text
//! RESULT_ORDERED   [svar0: obj0 obj1 .. objN][svar1: obj0 obj1 .. objN] ..
//! OBJECT_ORDERED   [obj0: svar0 svar1 ..][obj1: svar0 svar1 ..] ..
//! ```
//!
//! In both cases one object's slice of one svar is contiguous, which is what
//! the combiner copies.

use crate::blocks::BlockList;
use crate::error::{MiliError, Result};
use crate::svar::StateVariable;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Buffer layout of a subrecord
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Organization {
    ResultOrdered,
    ObjectOrdered,
}

/// Placement of one svar inside a subrecord
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SvarSlot {
    pub atoms: usize,
    pub atom_size: usize,
    /// Start of the svar's span (result ordered) or its offset inside an
    /// object's lump (object ordered)
    pub offset: usize,
}

impl SvarSlot {
    pub fn bytes_per_object(&self) -> usize {
        self.atoms * self.atom_size
    }
}

/// Derived byte layout of a subrecord
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubrecordLayout {
    organization: Option<Organization>,
    slots: Vec<SvarSlot>,
    /// Bytes per object across all svars
    lump: usize,
    qty: usize,
}

impl SubrecordLayout {
    pub fn compute(organization: Organization, qty: usize, svars: &[&StateVariable]) -> Self {
        let mut slots = Vec::with_capacity(svars.len());
        let mut cursor = 0;
        for svar in svars {
            let slot = SvarSlot {
                atoms: svar.atoms_per_object(),
                atom_size: svar.atom_size(),
                offset: cursor,
            };
            cursor += match organization {
                Organization::ResultOrdered => slot.bytes_per_object() * qty,
                Organization::ObjectOrdered => slot.bytes_per_object(),
            };
            slots.push(slot);
        }
        let lump = slots.iter().map(SvarSlot::bytes_per_object).sum();

        SubrecordLayout {
            organization: Some(organization),
            slots,
            lump,
            qty,
        }
    }

    /// Total bytes of the subrecord in a state record
    pub fn size(&self) -> usize {
        self.lump * self.qty
    }

    /// Bytes per object across all svars
    pub fn lump(&self) -> usize {
        self.lump
    }

    pub fn slot(&self, svar_index: usize) -> Option<&SvarSlot> {
        self.slots.get(svar_index)
    }

    /// Byte range of object `ordinal`'s slice of svar `svar_index`
    pub fn object_range(&self, svar_index: usize, ordinal: usize) -> Range<usize> {
        let slot = self.slots[svar_index];
        let width = slot.bytes_per_object();
        let start = match self.organization {
            Some(Organization::ObjectOrdered) => ordinal * self.lump + slot.offset,
            _ => slot.offset + ordinal * width,
        };
        start..start + width
    }
}

/// Binding of state variables to the objects of one class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subrecord {
    pub name: String,
    pub class_name: String,
    pub organization: Organization,
    pub svar_names: Vec<String>,
    pub blocks: BlockList,
    /// Byte offset inside the state record
    pub offset: usize,
    #[serde(skip)]
    layout: SubrecordLayout,
}

impl Subrecord {
    pub fn new(
        name: impl Into<String>,
        class_name: impl Into<String>,
        organization: Organization,
        svars: &[&StateVariable],
        blocks: BlockList,
    ) -> Self {
        let qty = blocks.qty();
        Subrecord {
            name: name.into(),
            class_name: class_name.into(),
            organization,
            svar_names: svars.iter().map(|s| s.name.clone()).collect(),
            blocks,
            offset: 0,
            layout: SubrecordLayout::compute(organization, qty, svars),
        }
    }

    /// Recompute the layout after loading a definition from disk
    pub fn rebuild_layout(&mut self, svars: &[&StateVariable]) {
        self.layout = SubrecordLayout::compute(self.organization, self.qty(), svars);
    }

    pub fn qty(&self) -> usize {
        self.blocks.qty()
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn layout(&self) -> &SubrecordLayout {
        &self.layout
    }

    pub fn svar_index(&self, name: &str) -> Option<usize> {
        self.svar_names.iter().position(|n| n == name)
    }

    /// Byte range of the whole subrecord inside a state record
    pub fn span(&self) -> Range<usize> {
        self.offset..self.offset + self.size()
    }
}

/// Ordered subrecords making up one kind of state record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecordFormat {
    pub id: usize,
    pub mesh_id: usize,
    pub subrecords: Vec<Subrecord>,
    pub closed: bool,
}

impl StateRecordFormat {
    pub fn new(id: usize, mesh_id: usize) -> Self {
        StateRecordFormat {
            id,
            mesh_id,
            subrecords: Vec::new(),
            closed: false,
        }
    }

    /// Total bytes of one state record
    pub fn size(&self) -> usize {
        self.subrecords.iter().map(Subrecord::size).sum()
    }

    /// Append a subrecord, placing it after the existing ones
    pub fn add_subrecord(&mut self, mut subrecord: Subrecord) -> Result<usize> {
        if self.closed {
            return Err(MiliError::SrecClosed(self.id));
        }
        if self.subrecords.iter().any(|s| s.name == subrecord.name) {
            return Err(MiliError::EntryExists(subrecord.name));
        }
        subrecord.offset = self.size();
        self.subrecords.push(subrecord);
        Ok(self.subrecords.len() - 1)
    }

    pub fn find(&self, name: &str, class_name: &str) -> Option<usize> {
        self.subrecords
            .iter()
            .position(|s| s.name == name && s.class_name == class_name)
    }

    pub fn subrecord(&self, name: &str) -> Result<&Subrecord> {
        self.subrecords
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| MiliError::SubrecordNotFound(name.to_string()))
    }

    /// Byte range of one object's value of one svar inside a state record
    pub fn locate(&self, subrecord: &str, svar: &str, object_id: usize) -> Result<Range<usize>> {
        let sub = self.subrecord(subrecord)?;
        let svar_index = sub
            .svar_index(svar)
            .ok_or_else(|| MiliError::SvarNotFound(format!("{} in {}", svar, subrecord)))?;
        let ordinal = sub
            .blocks
            .ordinal_of(object_id)
            .ok_or_else(|| MiliError::ObjectNotInSubrecord {
                subrecord: subrecord.to_string(),
                id: object_id,
            })?;
        let range = sub.layout().object_range(svar_index, ordinal);
        Ok(sub.offset + range.start..sub.offset + range.end)
    }
}
