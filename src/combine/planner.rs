//! Subrecord merge planning
//!
//! Every `(state-record format, subrecord, class)` seen on any processor
//! becomes one combined subrecord. The first processor defining it fixes its
//! organization and svar list; every processor adds its objects, translated
//! to global ids, to the union of id-blocks.

use crate::blocks::BlockList;
use crate::error::{MiliError, Result};
use crate::family::Family;
use crate::labels::LabelSet;
use crate::registry::{FamilyId, FamilyRegistry};
use crate::srec::{Organization, Subrecord};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSubrecord {
    pub name: String,
    pub class_name: String,
    pub organization: Organization,
    pub svar_names: Vec<String>,
    pub blocks: BlockList,
    /// Processors contributing objects
    pub contributors: usize,
}

impl PlannedSubrecord {
    pub fn qty(&self) -> usize {
        self.blocks.qty()
    }
}

/// Combined layout of one input state-record format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSrec {
    pub input_id: usize,
    pub mesh_id: usize,
    pub subrecords: Vec<PlannedSubrecord>,
    /// Format id in the output once committed
    pub output_id: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    srecs: Vec<PlannedSrec>,
}

impl MergePlan {
    /// Union the subrecords of every input
    pub fn build(registry: &FamilyRegistry, inputs: &[FamilyId], labels: &LabelSet) -> Result<Self> {
        let mut plan = MergePlan::default();
        for (proc, &id) in inputs.iter().enumerate() {
            let family = registry.get(id)?;
            for srec in family.srecs() {
                let planned = plan.srec_entry(srec.id, srec.mesh_id);
                for sub in &srec.subrecords {
                    let blocks = global_blocks(family, proc, srec.mesh_id, sub, labels)?;
                    planned.add(sub, blocks);
                }
            }
        }
        debug!(
            "Planned {} state record formats with {} subrecords",
            plan.srecs.len(),
            plan.subrecord_qty()
        );
        Ok(plan)
    }

    fn srec_entry(&mut self, input_id: usize, mesh_id: usize) -> &mut PlannedSrec {
        let pos = match self.srecs.binary_search_by_key(&input_id, |s| s.input_id) {
            Ok(pos) => pos,
            Err(pos) => {
                self.srecs.insert(
                    pos,
                    PlannedSrec {
                        input_id,
                        mesh_id,
                        subrecords: Vec::new(),
                        output_id: None,
                    },
                );
                pos
            }
        };
        &mut self.srecs[pos]
    }

    pub fn srecs(&self) -> &[PlannedSrec] {
        &self.srecs
    }

    pub fn subrecord_qty(&self) -> usize {
        self.srecs.iter().map(|s| s.subrecords.len()).sum()
    }

    /// Output format holding states of input format `input_id`
    pub fn output_srec(&self, input_id: usize) -> Result<usize> {
        self.srecs
            .binary_search_by_key(&input_id, |s| s.input_id)
            .ok()
            .and_then(|pos| self.srecs[pos].output_id)
            .ok_or(MiliError::InvalidSrec(input_id))
    }

    /// Define the merged formats in `out`, or adopt matching existing ones
    pub fn commit(&mut self, out: &mut Family) -> Result<()> {
        if !out.srecs().is_empty() {
            return self.adopt(out);
        }
        for planned in &mut self.srecs {
            let srec_id = out.open_srec(planned.mesh_id)?;
            for sub in &planned.subrecords {
                let svar_names: Vec<&str> = sub.svar_names.iter().map(String::as_str).collect();
                out.define_subrecord(
                    srec_id,
                    &sub.name,
                    &sub.class_name,
                    sub.organization,
                    &svar_names,
                    sub.blocks.clone(),
                )?;
            }
            out.close_srec(srec_id)?;
            planned.output_id = Some(srec_id);
        }
        info!("Committed {} state record formats", self.srecs.len());
        Ok(())
    }

    /// Match the plan against formats an earlier run already wrote
    fn adopt(&mut self, out: &Family) -> Result<()> {
        let existing = out.srecs();
        if existing.len() != self.srecs.len() {
            return Err(MiliError::Corrupted(format!(
                "output has {} state record formats, inputs need {}",
                existing.len(),
                self.srecs.len()
            )));
        }
        for (planned, srec) in self.srecs.iter_mut().zip(existing) {
            let matches = srec.mesh_id == planned.mesh_id
                && srec.subrecords.len() == planned.subrecords.len()
                && srec.subrecords.iter().zip(&planned.subrecords).all(|(s, p)| {
                    s.name == p.name && s.class_name == p.class_name && s.blocks == p.blocks
                });
            if !matches {
                return Err(MiliError::Corrupted(format!(
                    "output state record format {} differs from the inputs",
                    srec.id
                )));
            }
            planned.output_id = Some(srec.id);
        }
        debug!("Reusing {} existing state record formats", existing.len());
        Ok(())
    }
}

impl PlannedSrec {
    fn add(&mut self, sub: &Subrecord, blocks: BlockList) {
        match self
            .subrecords
            .iter_mut()
            .find(|p| p.name == sub.name && p.class_name == sub.class_name)
        {
            Some(planned) => {
                if planned.svar_names != sub.svar_names {
                    warn!(
                        "Subrecord {} lists different svars across processors, keeping the first",
                        sub.name
                    );
                }
                planned.blocks = planned.blocks.merge(&blocks);
                planned.contributors += 1;
            }
            None => self.subrecords.push(PlannedSubrecord {
                name: sub.name.clone(),
                class_name: sub.class_name.clone(),
                organization: sub.organization,
                svar_names: sub.svar_names.clone(),
                blocks,
                contributors: 1,
            }),
        }
    }
}

/// A subrecord's object ids in global numbering
fn global_blocks(
    family: &Family,
    proc: usize,
    mesh_id: usize,
    sub: &Subrecord,
    labels: &LabelSet,
) -> Result<BlockList> {
    let superclass = family.class(mesh_id, &sub.class_name)?.superclass;
    if superclass.label_prefix().is_none() {
        return sub.blocks.translate(Ok);
    }
    let class = labels
        .class(mesh_id, &sub.class_name)
        .ok_or_else(|| MiliError::MissingLabels(sub.class_name.clone()))?;
    sub.blocks.translate(|id| class.global_id(proc, id))
}
