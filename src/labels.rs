//! Label merging across processors
//!
//! Each processor numbers its objects locally and stores an external label
//! per object. Objects on partition boundaries (shared nodes) appear on
//! several processors with the same label. Merging drains all contributed
//! labels through a min-heap in ascending order: every new label value gets
//! the next dense global index, repeats collapse onto the index already
//! assigned. The resulting `map` translates `(processor, local index)` into
//! that global index.

use crate::error::{MiliError, Result};
use crate::heap::MinHeap;
use crate::mesh::Superclass;
use crate::registry::{FamilyId, FamilyRegistry};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LabelEntry {
    label: i32,
    proc: usize,
    local: usize,
}

/// Merged labels of one class across all processors
#[derive(Debug, Clone)]
pub struct ClassLabels {
    pub mesh_id: usize,
    pub class_name: String,
    pub superclass: Superclass,
    per_proc: Vec<Option<Vec<i32>>>,
    synthetic: Vec<bool>,
    counts: Vec<usize>,
    offsets: Vec<usize>,
    labels: Vec<i32>,
    global: Vec<i32>,
    map: Vec<usize>,
}

impl ClassLabels {
    pub fn new(mesh_id: usize, class_name: &str, superclass: Superclass, proc_qty: usize) -> Self {
        ClassLabels {
            mesh_id,
            class_name: class_name.to_string(),
            superclass,
            per_proc: vec![None; proc_qty],
            synthetic: vec![false; proc_qty],
            counts: vec![0; proc_qty],
            offsets: vec![0; proc_qty],
            labels: Vec::new(),
            global: Vec::new(),
            map: Vec::new(),
        }
    }

    /// Record a processor's local labels
    pub fn set_local(&mut self, proc: usize, labels: Vec<i32>) {
        self.counts[proc] = labels.len();
        self.per_proc[proc] = Some(labels);
        self.synthetic[proc] = false;
    }

    /// Mark a processor whose labels are generated from its offset at merge
    pub fn set_synthetic(&mut self, proc: usize, count: usize) {
        self.counts[proc] = count;
        self.per_proc[proc] = None;
        self.synthetic[proc] = true;
    }

    /// Build the global label array and the local-to-global map
    pub fn merge(&mut self) {
        let mut total = 0;
        for (offset, count) in self.offsets.iter_mut().zip(&self.counts) {
            *offset = total;
            total += count;
        }

        self.labels = Vec::with_capacity(total);
        for proc in 0..self.counts.len() {
            if self.synthetic[proc] {
                let offset = self.offsets[proc];
                self.labels
                    .extend((0..self.counts[proc]).map(|j| (offset + j + 1) as i32));
            } else if let Some(local) = &self.per_proc[proc] {
                self.labels.extend_from_slice(local);
            }
        }

        let mut entries = Vec::with_capacity(total);
        for proc in 0..self.counts.len() {
            let offset = self.offsets[proc];
            for local in 0..self.counts[proc] {
                entries.push(LabelEntry {
                    label: self.labels[offset + local],
                    proc,
                    local,
                });
            }
        }

        self.map = vec![0; total];
        self.global.clear();
        let mut last = None;
        for entry in MinHeap::from_vec(entries) {
            if last != Some(entry.label) {
                self.global.push(entry.label);
                last = Some(entry.label);
            }
            self.map[self.offsets[entry.proc] + entry.local] = self.global.len() - 1;
        }

        debug!(
            "Merged {} labels of {} into {} global objects",
            total,
            self.class_name,
            self.global.len()
        );
    }

    /// Sorted, deduplicated global labels
    pub fn global_labels(&self) -> &[i32] {
        &self.global
    }

    pub fn global_qty(&self) -> usize {
        self.global.len()
    }

    /// Local-to-global index map over all processors
    pub fn map(&self) -> &[usize] {
        &self.map
    }

    pub fn count(&self, proc: usize) -> usize {
        self.counts.get(proc).copied().unwrap_or(0)
    }

    pub fn offset(&self, proc: usize) -> usize {
        self.offsets.get(proc).copied().unwrap_or(0)
    }

    /// Concatenated raw labels of all processors
    pub fn raw_labels(&self) -> &[i32] {
        &self.labels
    }

    /// Processor's slice of the map
    pub fn proc_map(&self, proc: usize) -> &[usize] {
        let offset = self.offset(proc);
        &self.map[offset..offset + self.count(proc)]
    }

    /// Global 1-based id of a processor's 1-based local object id
    pub fn global_id(&self, proc: usize, local_id: usize) -> Result<usize> {
        if local_id == 0 || local_id > self.count(proc) {
            return Err(MiliError::ObjectNotInSubrecord {
                subrecord: format!("{} on processor {}", self.class_name, proc),
                id: local_id,
            });
        }
        Ok(self.map[self.offset(proc) + local_id - 1] + 1)
    }
}

/// Merged labels for every labelled class in a set of input families
#[derive(Debug, Clone, Default)]
pub struct LabelSet {
    classes: Vec<ClassLabels>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and merge labels from `inputs`; processor `p` is `inputs[p]`
    ///
    /// A node or element class with objects but no labels is an error
    /// unless `synthesize` is set.
    pub fn load(registry: &mut FamilyRegistry, inputs: &[FamilyId], synthesize: bool) -> Result<Self> {
        let mut set = LabelSet::new();
        let proc_qty = inputs.len();

        for (proc, &id) in inputs.iter().enumerate() {
            let family = registry.get_mut(id)?;
            let mut classes = Vec::new();
            for mesh in family.meshes() {
                for class in &mesh.classes {
                    if class.superclass.label_prefix().is_some() {
                        classes.push((mesh.id, class.short_name.clone(), class.superclass, class.qty()));
                    }
                }
            }

            for (mesh_id, class, superclass, qty) in classes {
                let labels = family.read_labels(mesh_id, &class)?;
                let entry = set.entry(mesh_id, &class, superclass, proc_qty);
                match labels {
                    Some(local) => entry.set_local(proc, local),
                    None if qty == 0 => {}
                    None if synthesize => {
                        warn!(
                            "Synthesizing labels for {} on processor {} ({} objects)",
                            class, proc, qty
                        );
                        entry.set_synthetic(proc, qty);
                    }
                    None => return Err(MiliError::MissingLabels(class)),
                }
            }
        }

        for class in &mut set.classes {
            class.merge();
        }
        Ok(set)
    }

    fn entry(
        &mut self,
        mesh_id: usize,
        class: &str,
        superclass: Superclass,
        proc_qty: usize,
    ) -> &mut ClassLabels {
        let pos = match self
            .classes
            .iter()
            .position(|c| c.mesh_id == mesh_id && c.class_name == class)
        {
            Some(pos) => pos,
            None => {
                self.classes
                    .push(ClassLabels::new(mesh_id, class, superclass, proc_qty));
                self.classes.len() - 1
            }
        };
        &mut self.classes[pos]
    }

    /// Add an already merged class
    pub fn insert(&mut self, labels: ClassLabels) {
        self.classes
            .retain(|c| !(c.mesh_id == labels.mesh_id && c.class_name == labels.class_name));
        self.classes.push(labels);
    }

    pub fn class(&self, mesh_id: usize, class: &str) -> Option<&ClassLabels> {
        self.classes
            .iter()
            .find(|c| c.mesh_id == mesh_id && c.class_name == class)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassLabels> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
