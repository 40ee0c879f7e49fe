//! Time-invariant metadata merge
//!
//! Runs once before geometry and state data. Definitions are matched by name
//! so running it against an already combined output is a no-op.

use crate::blocks::BlockList;
use crate::error::{MiliError, Result};
use crate::family::{Family, IDENTITY_KEYS};
use crate::param::{EntryKind, ParamValue, Scalar};
use crate::registry::{FamilyId, FamilyRegistry};
use crate::svar::StateVariable;
use crate::RESERVED_PREFIXES;
use tracing::{debug, info, warn};

/// Prefix given to identity strings copied from the first input
pub const ORIGIN_PREFIX: &str = "origin ";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataReport {
    pub meshes: usize,
    pub classes: usize,
    pub svars: usize,
    pub params_copied: usize,
    pub params_skipped: usize,
}

fn is_reserved(name: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn write_string_if_absent(out: &mut Family, kind: EntryKind, name: &str, value: String) -> Result<()> {
    if out.has_param(name) {
        return Ok(());
    }
    out.write_value(kind, name, &ParamValue::String(value))
}

/// Merge identity, meshes, classes, svars and parameters of every input
pub fn combine_metadata(
    registry: &mut FamilyRegistry,
    inputs: &[FamilyId],
    out: &mut Family,
) -> Result<MetadataReport> {
    let mut report = MetadataReport::default();
    if let Some(&first) = inputs.first() {
        copy_identity(registry.get_mut(first)?, out, &mut report);
    }

    for (proc, &id) in inputs.iter().enumerate() {
        let input = registry.get_mut(id)?;
        merge_meshes(proc, input, out, &mut report)?;
        merge_svars(input, out, &mut report)?;
        copy_params(input, out, &mut report);
    }

    info!(
        "Merged metadata: {} meshes, {} classes, {} svars, {} parameters ({} skipped)",
        report.meshes, report.classes, report.svars, report.params_copied, report.params_skipped
    );
    Ok(report)
}

fn copy_identity(input: &mut Family, out: &mut Family, report: &mut MetadataReport) {
    for key in IDENTITY_KEYS {
        if !input.has_param(key) {
            continue;
        }
        let name = format!("{}{}", ORIGIN_PREFIX, key);
        let copied = input
            .read_string(key)
            .and_then(|value| write_string_if_absent(out, EntryKind::Mili, &name, value));
        skip_on_error(copied, &name, input.root(), report);
    }
    if input.has_param("title") {
        let copied = input
            .read_string("title")
            .and_then(|title| write_string_if_absent(out, EntryKind::Application, "title", title));
        skip_on_error(copied, "title", input.root(), report);
    }

    let version = env!("CARGO_PKG_VERSION");
    let stamped = write_string_if_absent(
        out,
        EntryKind::Mili,
        "combiner version",
        format!("{} {}", env!("CARGO_PKG_NAME"), version),
    );
    skip_on_error(stamped, "combiner version", input.root(), report);
    let stamped =
        write_string_if_absent(out, EntryKind::Mili, "combiner lib version", version.to_string());
    skip_on_error(stamped, "combiner lib version", input.root(), report);
    if !out.has_param("states per file") {
        let spf = out.states_per_file() as i32;
        let stamped = out.write_scalar("states per file", Scalar::Int4(spf));
        skip_on_error(stamped, "states per file", input.root(), report);
    }
}

fn skip_on_error(result: Result<()>, name: &str, source: &str, report: &mut MetadataReport) {
    if let Err(e) = result {
        warn!("Skipping parameter '{}' from '{}': {}", name, source, e);
        report.params_skipped += 1;
    }
}

fn merge_meshes(
    proc: usize,
    input: &Family,
    out: &mut Family,
    report: &mut MetadataReport,
) -> Result<()> {
    for mesh in input.meshes() {
        let mesh_id = match out.mesh_id(&mesh.name) {
            Some(id) => id,
            None => {
                report.meshes += 1;
                out.define_mesh(&mesh.name, mesh.dimension)?
            }
        };
        if mesh_id != mesh.id {
            return Err(MiliError::Config(format!(
                "mesh '{}' is #{} on processor {} but #{} in the combined family",
                mesh.name, mesh.id, proc, mesh_id
            )));
        }

        for class in &mesh.classes {
            if out.mesh(mesh_id)?.class(&class.short_name).is_none() {
                out.define_class(mesh_id, class.superclass, &class.short_name, &class.long_name)?;
                report.classes += 1;
            }
            if !class.superclass.is_global() {
                continue;
            }

            let existing = out.class(mesh_id, &class.short_name)?.blocks.ordinal_index();
            let missing: Vec<usize> = class
                .blocks
                .ids()
                .filter(|&id| existing.ordinal_of(id).is_none())
                .collect();
            for block in BlockList::from_ids(&missing).blocks() {
                out.define_class_idents(mesh_id, &class.short_name, block.first, block.last)?;
            }
        }
    }
    Ok(())
}

fn merge_svars(input: &Family, out: &mut Family, report: &mut MetadataReport) -> Result<()> {
    for svar in input.svars() {
        define_svar_tree(input.svars(), svar, out, report)?;
    }
    Ok(())
}

/// Define `svar` after any components it aggregates
fn define_svar_tree(
    source: &[StateVariable],
    svar: &StateVariable,
    out: &mut Family,
    report: &mut MetadataReport,
) -> Result<()> {
    if out.svar(&svar.name).is_none() {
        for component in svar.aggregation.components() {
            if out.svar(component).is_some() {
                continue;
            }
            let def = source
                .iter()
                .find(|s| &s.name == component)
                .ok_or_else(|| MiliError::SvarNotFound(component.clone()))?;
            define_svar_tree(source, def, out, report)?;
        }
        report.svars += 1;
    }
    out.define_svar(svar.clone())
}

fn copy_params(input: &mut Family, out: &mut Family, report: &mut MetadataReport) {
    for entry in input.entries_of(&[EntryKind::Application, EntryKind::Ti]) {
        if is_reserved(&entry.name) || out.has_param(&entry.name) {
            continue;
        }
        let copied = input
            .read_value(&entry.name)
            .and_then(|value| out.write_value(entry.kind, &entry.name, &value));
        if copied.is_ok() {
            debug!("Copied parameter '{}' from '{}'", entry.name, input.root());
            report.params_copied += 1;
        }
        skip_on_error(copied, &entry.name, input.root(), report);
    }
}
