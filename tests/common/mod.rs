//! Per-processor family fixtures shared by the integration tests

#![allow(dead_code)]

use mili_rs::numeric::f32s_to_bytes;
use mili_rs::{
    AccessMode, Aggregation, BlockList, CombineConfig, Family, FamilyLocation, NumType,
    Organization, Precision, Result, StateVariable, Superclass,
};
use std::path::Path;

/// One processor's share of a truss slab
pub struct ProcSpec {
    pub node_labels: Vec<i32>,
    pub elem_labels: Vec<i32>,
    /// Local node ids, two per element
    pub conns: Vec<usize>,
}

impl ProcSpec {
    /// The combined slab of `nodes` nodes chained by `nodes - 1` trusses
    pub fn global(nodes: usize) -> Self {
        ProcSpec {
            node_labels: (1..=nodes as i32).collect(),
            elem_labels: (1..nodes as i32).collect(),
            conns: (1..nodes).flat_map(|n| [n, n + 1]).collect(),
        }
    }
}

/// Processors sharing node 3, with processor 1 numbering its nodes out of order
pub fn two_procs() -> Vec<ProcSpec> {
    vec![
        ProcSpec {
            node_labels: vec![1, 2, 3],
            elem_labels: vec![1, 2],
            conns: vec![1, 2, 2, 3],
        },
        ProcSpec {
            node_labels: vec![5, 3, 4],
            elem_labels: vec![3, 4],
            conns: vec![2, 3, 3, 1],
        },
    ]
}

/// Expected state record of `spec` at time `t`
///
/// Nodes carry `label + t`, trusses carry `(10 * label + t, -label)` and the
/// two materials carry `id + t`, so values do not depend on the processor.
pub fn state_bytes(spec: &ProcSpec, t: f64) -> Vec<u8> {
    let t = t as f32;
    let mut values: Vec<f32> = spec.node_labels.iter().map(|&l| l as f32 + t).collect();
    for &l in &spec.elem_labels {
        values.push(l as f32 * 10.0 + t);
        values.push(-(l as f32));
    }
    values.extend([1.0 + t, 2.0 + t]);
    f32s_to_bytes(&values)
}

pub fn write_proc(dir: &Path, root: &str, spec: &ProcSpec, times: &[f64]) -> Result<()> {
    let mut fam = Family::create(dir, root, Precision::Single, 0)?;
    fam.write_string("title", "slab")?;
    let mesh = fam.define_mesh("slab", 3)?;
    fam.define_class(mesh, Superclass::Node, "node", "Nodes")?;
    fam.define_class(mesh, Superclass::Truss, "beam", "Trusses")?;
    fam.define_class(mesh, Superclass::Material, "mat", "Materials")?;
    fam.define_class_idents(mesh, "mat", 1, 2)?;

    let nodes = spec.node_labels.len();
    let coords: Vec<f64> = spec
        .node_labels
        .iter()
        .flat_map(|&l| [l as f64, 0.0, 0.0])
        .collect();
    fam.define_nodes(mesh, "node", 1, nodes, &coords)?;
    fam.write_labels(mesh, "node", &spec.node_labels)?;

    let elems = spec.elem_labels.len();
    let parts: Vec<usize> = spec.elem_labels.iter().map(|&l| l as usize % 2 + 1).collect();
    fam.define_connectivity(mesh, "beam", 1, elems, &spec.conns, &vec![1; elems], &parts)?;
    fam.write_labels(mesh, "beam", &spec.elem_labels)?;

    fam.define_svar(StateVariable::scalar("temp", "Temperature", NumType::Float4))?;
    fam.define_svar(StateVariable::scalar("sx", "Axial stress", NumType::Float4))?;
    fam.define_svar(StateVariable::scalar("sy", "Shear stress", NumType::Float4))?;
    fam.define_svar(StateVariable::new(
        "stress",
        "Stress",
        NumType::Float4,
        Aggregation::Vector {
            components: vec!["sx".into(), "sy".into()],
        },
    )?)?;
    fam.define_svar(StateVariable::scalar("mass", "Material mass", NumType::Float4))?;

    let srec = fam.open_srec(mesh)?;
    fam.define_subrecord(
        srec,
        "nodal",
        "node",
        Organization::ObjectOrdered,
        &["temp"],
        BlockList::from_ranges(&[(1, nodes)])?,
    )?;
    fam.define_subrecord(
        srec,
        "beam_res",
        "beam",
        Organization::ResultOrdered,
        &["stress"],
        BlockList::from_ranges(&[(1, elems)])?,
    )?;
    fam.define_subrecord(
        srec,
        "mats",
        "mat",
        Organization::ResultOrdered,
        &["mass"],
        BlockList::from_ranges(&[(1, 2)])?,
    )?;
    fam.close_srec(srec)?;

    for &t in times {
        fam.write_state(srec, t, &state_bytes(spec, t))?;
    }
    fam.close()
}

/// Append more states to an existing processor family
pub fn append_states(dir: &Path, root: &str, spec: &ProcSpec, times: &[f64]) -> Result<()> {
    let mut fam = Family::open(dir, root, AccessMode::Append)?;
    for &t in times {
        fam.write_state(0, t, &state_bytes(spec, t))?;
    }
    fam.close()
}

pub fn proc_root(p: usize) -> String {
    format!("slab{:03}", p)
}

/// Write one family per spec and a config combining them into "slab"
pub fn write_run(dir: &Path, specs: &[ProcSpec], times: &[f64]) -> Result<CombineConfig> {
    let mut inputs = Vec::with_capacity(specs.len());
    for (p, spec) in specs.iter().enumerate() {
        write_proc(dir, &proc_root(p), spec, times)?;
        inputs.push(FamilyLocation::new(dir, proc_root(p)));
    }
    Ok(CombineConfig::new(inputs, FamilyLocation::new(dir, "slab")))
}
