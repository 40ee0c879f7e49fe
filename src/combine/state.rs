//! State-data merge
//!
//! For each processor and input format a list of [`SubrecordRoute`]s is
//! computed once: where every input object lands in the output subrecord and
//! which svars are shared. Merging a state then only copies bytes.

use crate::error::{MiliError, Result};
use crate::family::Family;
use crate::labels::LabelSet;
use crate::numeric::copy_atoms;
use crate::registry::{FamilyId, FamilyRegistry};
use crate::srec::SubrecordLayout;
use ahash::AHashMap;
use tracing::debug;

use super::planner::MergePlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SvarPair {
    input: usize,
    output: usize,
    atom_size: usize,
}

/// Copy plan from one input subrecord into its output counterpart
#[derive(Debug, Clone)]
pub struct SubrecordRoute {
    input_subrecord: usize,
    output_offset: usize,
    input_layout: SubrecordLayout,
    output_layout: SubrecordLayout,
    /// Output ordinal of each input object, in input order
    ordinals: Vec<usize>,
    svars: Vec<SvarPair>,
}

impl SubrecordRoute {
    pub fn object_qty(&self) -> usize {
        self.ordinals.len()
    }

    pub fn shared_svars(&self) -> usize {
        self.svars.len()
    }
}

/// Routes for every subrecord of input format `input_srec` on processor `proc`
pub fn build_routes(
    input: &Family,
    proc: usize,
    input_srec: usize,
    labels: &LabelSet,
    out: &Family,
    output_srec: usize,
) -> Result<Vec<SubrecordRoute>> {
    let in_srec = input.srec(input_srec)?;
    let out_srec = out.srec(output_srec)?;
    let mut routes = Vec::with_capacity(in_srec.subrecords.len());

    for (index, sub) in in_srec.subrecords.iter().enumerate() {
        let Some(out_index) = out_srec.find(&sub.name, &sub.class_name) else {
            debug!("Subrecord {} has no output counterpart", sub.name);
            continue;
        };
        let out_sub = &out_srec.subrecords[out_index];

        let class_labels = match input.class(in_srec.mesh_id, &sub.class_name)?.superclass {
            s if s.label_prefix().is_some() => Some(
                labels
                    .class(in_srec.mesh_id, &sub.class_name)
                    .ok_or_else(|| MiliError::MissingLabels(sub.class_name.clone()))?,
            ),
            _ => None,
        };
        let index_of = out_sub.blocks.ordinal_index();
        let mut ordinals = Vec::with_capacity(sub.qty());
        for id in sub.blocks.ids() {
            let global = match class_labels {
                Some(class) => class.global_id(proc, id)?,
                None => id,
            };
            ordinals.push(index_of.ordinal_of(global).ok_or_else(|| {
                MiliError::ObjectNotInSubrecord {
                    subrecord: out_sub.name.clone(),
                    id: global,
                }
            })?);
        }

        let mut svars = Vec::with_capacity(sub.svar_names.len());
        for (in_svar, name) in sub.svar_names.iter().enumerate() {
            let Some(out_svar) = out_sub.svar_index(name) else {
                continue;
            };
            let (Some(src), Some(dst)) = (sub.layout().slot(in_svar), out_sub.layout().slot(out_svar))
            else {
                return Err(MiliError::Corrupted(format!(
                    "svar {} has no layout in subrecord {}",
                    name, sub.name
                )));
            };
            if src.atoms != dst.atoms || src.atom_size != dst.atom_size {
                return Err(MiliError::TypeMismatch {
                    name: name.clone(),
                    stored: format!("{} x {} bytes", dst.atoms, dst.atom_size),
                    requested: format!("{} x {} bytes", src.atoms, src.atom_size),
                });
            }
            svars.push(SvarPair {
                input: in_svar,
                output: out_svar,
                atom_size: src.atom_size,
            });
        }

        routes.push(SubrecordRoute {
            input_subrecord: index,
            output_offset: out_sub.offset,
            input_layout: sub.layout().clone(),
            output_layout: out_sub.layout().clone(),
            ordinals,
            svars,
        });
    }
    Ok(routes)
}

/// Copy one processor's state `state` into the output state buffer `dst`
///
/// Output slices without an input counterpart keep whatever `dst` held.
/// Returns the number of objects copied.
pub fn merge_state_data(
    input: &mut Family,
    state: usize,
    routes: &[SubrecordRoute],
    dst: &mut [u8],
) -> Result<usize> {
    let mut copied = 0;
    for route in routes {
        let src = input.read_subrecord(state, route.input_subrecord)?;
        for (k, &ordinal) in route.ordinals.iter().enumerate() {
            for pair in &route.svars {
                let from = route.input_layout.object_range(pair.input, k);
                let to = route.output_layout.object_range(pair.output, ordinal);
                let to = route.output_offset + to.start..route.output_offset + to.end;
                copy_atoms(&mut dst[to], &src[from], pair.atom_size);
            }
        }
        copied += route.ordinals.len();
    }
    Ok(copied)
}

/// Merges states of all processors into reused per-format output buffers
#[derive(Debug, Default)]
pub struct StateMerger {
    routes: AHashMap<(usize, usize), Vec<SubrecordRoute>>,
    buffers: AHashMap<usize, Vec<u8>>,
}

impl StateMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combine input state `state` and append it to `out`
    pub fn merge(
        &mut self,
        registry: &mut FamilyRegistry,
        inputs: &[FamilyId],
        state: usize,
        plan: &MergePlan,
        labels: &LabelSet,
        out: &mut Family,
    ) -> Result<usize> {
        let Some(&first) = inputs.first() else {
            return Err(MiliError::Config("no input families".to_string()));
        };
        let time = registry.get(first)?.state_time(state)?;
        let output_srec = plan.output_srec(registry.get(first)?.state_srec(state)?)?;

        if !self.buffers.contains_key(&output_srec) {
            let buf = out.new_state_buffer(output_srec)?;
            self.buffers.insert(output_srec, buf);
        }
        let buf = self
            .buffers
            .get_mut(&output_srec)
            .ok_or(MiliError::InvalidSrec(output_srec))?;

        let mut copied = 0;
        for (proc, &id) in inputs.iter().enumerate() {
            let family = registry.get_mut(id)?;
            let input_srec = family.state_srec(state)?;
            if plan.output_srec(input_srec)? != output_srec {
                return Err(MiliError::Corrupted(format!(
                    "state {} of '{}' uses format {} unlike processor 0",
                    state,
                    family.root(),
                    input_srec
                )));
            }
            if !self.routes.contains_key(&(proc, input_srec)) {
                let routes = build_routes(family, proc, input_srec, labels, out, output_srec)?;
                self.routes.insert((proc, input_srec), routes);
            }
            let routes = &self.routes[&(proc, input_srec)];
            copied += merge_state_data(family, state, routes, buf)?;
        }

        let written = out.write_state(output_srec, time, buf)?;
        debug!(
            "Combined state {} (t={}) from {} objects into output state {}",
            state, time, copied, written
        );
        Ok(written)
    }

    /// Routes computed so far for a processor and input format
    pub fn routes(&self, proc: usize, input_srec: usize) -> Option<&[SubrecordRoute]> {
        self.routes.get(&(proc, input_srec)).map(Vec::as_slice)
    }
}
