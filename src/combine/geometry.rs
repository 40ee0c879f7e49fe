//! Global geometry and labels
//!
//! Node coordinates land at their global index and element connectivity is
//! renumbered through the node label map. Classes stored without geometry
//! only get their global identifier range.

use crate::error::{MiliError, Result};
use crate::family::Family;
use crate::labels::{ClassLabels, LabelSet};
use crate::mesh::Superclass;
use crate::registry::{FamilyId, FamilyRegistry};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeometryReport {
    pub nodes: usize,
    pub elements: usize,
    pub labelled_classes: usize,
}

pub fn combine_geometry(
    registry: &mut FamilyRegistry,
    inputs: &[FamilyId],
    labels: &LabelSet,
    out: &mut Family,
) -> Result<GeometryReport> {
    let mut report = GeometryReport::default();

    // Nodes first so connectivity can be checked against them
    let mut classes: Vec<&ClassLabels> = labels.iter().collect();
    classes.sort_by_key(|c| (c.mesh_id, c.superclass != Superclass::Node));

    for class in classes {
        let out_class = out.class(class.mesh_id, &class.class_name)?;
        if out_class.qty() > 0 {
            debug!("Class {} already defined in output", class.class_name);
            continue;
        }
        let qty = class.global_qty();
        if qty == 0 {
            continue;
        }

        if !has_geometry(registry, inputs, class)? {
            out.define_class_idents(class.mesh_id, &class.class_name, 1, qty)?;
        } else if class.superclass == Superclass::Node {
            let coords = gather_nodes(registry, inputs, class, out)?;
            out.define_nodes(class.mesh_id, &class.class_name, 1, qty, &coords)?;
            report.nodes += qty;
        } else {
            let (nodes, materials, parts) = gather_elements(registry, inputs, labels, class)?;
            out.define_connectivity(
                class.mesh_id,
                &class.class_name,
                1,
                qty,
                &nodes,
                &materials,
                &parts,
            )?;
            report.elements += qty;
        }

        out.write_labels(class.mesh_id, &class.class_name, class.global_labels())?;
        report.labelled_classes += 1;
    }

    info!(
        "Combined geometry: {} nodes, {} elements",
        report.nodes, report.elements
    );
    Ok(report)
}

/// Every processor holding objects of the class stored their geometry
fn has_geometry(registry: &FamilyRegistry, inputs: &[FamilyId], class: &ClassLabels) -> Result<bool> {
    for (proc, &id) in inputs.iter().enumerate() {
        if class.count(proc) == 0 {
            continue;
        }
        if !registry.get(id)?.has_geometry(class.mesh_id, &class.class_name)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn gather_nodes(
    registry: &mut FamilyRegistry,
    inputs: &[FamilyId],
    class: &ClassLabels,
    out: &Family,
) -> Result<Vec<f64>> {
    let dimension = out.mesh(class.mesh_id)?.dimension;
    let mut coords = vec![0.0; class.global_qty() * dimension];

    for (proc, &id) in inputs.iter().enumerate() {
        if class.count(proc) == 0 {
            continue;
        }
        let local = registry.get_mut(id)?.load_nodes(class.mesh_id, &class.class_name)?;
        for (k, point) in local.chunks_exact(dimension).enumerate() {
            let g = class.global_id(proc, k + 1)? - 1;
            coords[g * dimension..(g + 1) * dimension].copy_from_slice(point);
        }
    }
    Ok(coords)
}

type ElementRows = (Vec<usize>, Vec<usize>, Vec<usize>);

fn gather_elements(
    registry: &mut FamilyRegistry,
    inputs: &[FamilyId],
    labels: &LabelSet,
    class: &ClassLabels,
) -> Result<ElementRows> {
    let conn_qty = class.superclass.conn_qty().unwrap_or(0);
    let qty = class.global_qty();
    let mut nodes = vec![0; qty * conn_qty];
    let mut materials = vec![0; qty];
    let mut parts = vec![0; qty];

    for (proc, &id) in inputs.iter().enumerate() {
        if class.count(proc) == 0 {
            continue;
        }
        let family = registry.get_mut(id)?;
        let node_class = family
            .mesh(class.mesh_id)?
            .node_class()
            .map(|c| c.short_name.clone())
            .ok_or_else(|| MiliError::ClassNotFound {
                mesh: class.mesh_id,
                class: "node".to_string(),
            })?;
        let node_labels = labels
            .class(class.mesh_id, &node_class)
            .ok_or_else(|| MiliError::MissingLabels(node_class.clone()))?;

        let conn = family.load_connectivity(class.mesh_id, &class.class_name)?;
        for e in 0..conn.qty() {
            let g = class.global_id(proc, e + 1)? - 1;
            for (slot, &local) in nodes[g * conn_qty..(g + 1) * conn_qty]
                .iter_mut()
                .zip(&conn.nodes[e * conn_qty..(e + 1) * conn_qty])
            {
                *slot = node_labels.global_id(proc, local)?;
            }
            materials[g] = conn.materials[e];
            parts[g] = conn.parts[e];
        }
    }
    Ok((nodes, materials, parts))
}
