//! End-to-end combiner tests over real per-processor families

mod common;

use common::{state_bytes, two_procs, write_run, ProcSpec};
use mili_rs::numeric::{bytes_to_f32s, f32s_to_bytes};
use mili_rs::{
    combine, AccessMode, Aggregation, BlockList, CombineConfig, Family, FamilyLocation,
    MiliError, NumType, Organization, Precision, Result, Scalar, StateVariable, Superclass,
};
use std::path::Path;
use tempfile::tempdir;

const TIMES: [f64; 3] = [0.0, 0.5, 1.0];

#[test]
fn test_two_processors_dedup_shared_nodes() -> Result<()> {
    let dir = tempdir().unwrap();
    let config = write_run(dir.path(), &two_procs(), &TIMES)?;

    let report = combine(&config)?;
    assert_eq!(report.processors, 2);
    assert_eq!(report.states_written, 3);
    assert_eq!(report.first_state, Some(0));
    assert_eq!(report.geometry.nodes, 5);
    assert_eq!(report.geometry.elements, 4);

    let mut out = Family::open(dir.path(), "slab", AccessMode::Read)?;
    assert_eq!(out.read_labels(0, "node")?, Some(vec![1, 2, 3, 4, 5]));
    assert_eq!(out.read_labels(0, "beam")?, Some(vec![1, 2, 3, 4]));

    let xs: Vec<f64> = out.load_nodes(0, "node")?.chunks(3).map(|p| p[0]).collect();
    assert_eq!(xs, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

    let conn = out.load_connectivity(0, "beam")?;
    assert_eq!(conn.nodes, vec![1, 2, 2, 3, 3, 4, 4, 5]);
    assert_eq!(conn.parts, vec![2, 1, 2, 1]);

    let global = ProcSpec::global(5);
    assert_eq!(out.state_qty(), 3);
    for (state, &t) in TIMES.iter().enumerate() {
        assert_eq!(out.state_time(state)?, t);
        assert_eq!(out.read_state(state)?, state_bytes(&global, t));
    }
    Ok(())
}

#[test]
fn test_merged_subrecords_cover_global_objects() -> Result<()> {
    let dir = tempdir().unwrap();
    let config = write_run(dir.path(), &two_procs(), &TIMES[..1])?;
    let report = combine(&config)?;
    assert_eq!(report.subrecords, 3);

    let out = Family::open(dir.path(), "slab", AccessMode::Read)?;
    let srec = out.srec(0)?;
    let qtys: Vec<(String, usize)> = srec
        .subrecords
        .iter()
        .map(|s| (s.name.clone(), s.qty()))
        .collect();
    assert_eq!(
        qtys,
        vec![
            ("nodal".to_string(), 5),
            ("beam_res".to_string(), 4),
            ("mats".to_string(), 2)
        ]
    );
    for sub in &srec.subrecords {
        let span: usize = sub.blocks.blocks().iter().map(|b| b.last - b.first + 1).sum();
        assert_eq!(span, sub.qty());
    }
    Ok(())
}

#[test]
fn test_metadata_carried_into_output() -> Result<()> {
    let dir = tempdir().unwrap();
    let config = write_run(dir.path(), &two_procs(), &TIMES[..1])?;
    combine(&config)?;

    let mut out = Family::open(dir.path(), "slab", AccessMode::Read)?;
    assert_eq!(out.read_string("title")?, "slab");
    assert!(out.has_param("origin host name"));
    assert!(out.has_param("combiner version"));
    assert!(out.svar("stress").is_some());
    assert_eq!(
        out.class(0, "mat")?.blocks.ids().collect::<Vec<_>>(),
        vec![1, 2]
    );
    Ok(())
}

#[test]
fn test_processor_selection() -> Result<()> {
    let dir = tempdir().unwrap();
    let config = write_run(dir.path(), &two_procs(), &TIMES[..2])?.with_processors("1");
    let report = combine(&config)?;
    assert_eq!(report.processors, 1);

    let mut out = Family::open(dir.path(), "slab", AccessMode::Read)?;
    assert_eq!(out.read_labels(0, "node")?, Some(vec![3, 4, 5]));
    let temps = bytes_to_f32s(out.read_subrecord(1, 0)?);
    assert_eq!(temps, vec![3.5, 4.5, 5.5]);

    let bad = write_run(dir.path(), &two_procs(), &TIMES[..1])?.with_processors("0-2");
    assert!(matches!(
        combine(&bad),
        Err(MiliError::MalformedControlString(_))
    ));
    Ok(())
}

#[test]
fn test_state_range() -> Result<()> {
    let dir = tempdir().unwrap();
    let config =
        write_run(dir.path(), &two_procs(), &TIMES)?.with_state_range(Some(1), Some(1));
    let report = combine(&config)?;
    assert_eq!(report.states_written, 1);

    let out = Family::open(dir.path(), "slab", AccessMode::Read)?;
    assert_eq!(out.state_times(), vec![0.5]);
    Ok(())
}

#[test]
fn test_missing_labels() -> Result<()> {
    let dir = tempdir().unwrap();
    let mut fam = Family::create(dir.path(), "bare000", Precision::Single, 0)?;
    let mesh = fam.define_mesh("m", 2)?;
    fam.define_class(mesh, Superclass::Node, "node", "Nodes")?;
    fam.define_nodes(mesh, "node", 1, 2, &[0.0, 0.0, 1.0, 0.0])?;
    fam.close()?;

    let config = CombineConfig::new(
        vec![FamilyLocation::new(dir.path(), "bare000")],
        FamilyLocation::new(dir.path(), "bare"),
    );
    assert!(matches!(combine(&config), Err(MiliError::MissingLabels(_))));

    combine(&config.with_synthesized_labels())?;
    let mut out = Family::open(dir.path(), "bare", AccessMode::Read)?;
    assert_eq!(out.read_labels(0, "node")?, Some(vec![1, 2]));
    Ok(())
}

#[test]
fn test_unreadable_title_does_not_abort() -> Result<()> {
    let dir = tempdir().unwrap();
    let mut fam = Family::create(dir.path(), "odd000", Precision::Single, 0)?;
    fam.write_scalar("title", Scalar::Int4(1))?;
    let mesh = fam.define_mesh("m", 2)?;
    fam.define_class(mesh, Superclass::Node, "node", "Nodes")?;
    fam.define_nodes(mesh, "node", 1, 2, &[0.0, 0.0, 1.0, 0.0])?;
    fam.write_labels(mesh, "node", &[4, 9])?;
    fam.close()?;

    let config = CombineConfig::new(
        vec![FamilyLocation::new(dir.path(), "odd000")],
        FamilyLocation::new(dir.path(), "odd"),
    );
    let report = combine(&config)?;
    assert!(report.metadata.params_skipped > 0);
    assert_eq!(report.geometry.nodes, 2);

    let mut out = Family::open(dir.path(), "odd", AccessMode::Read)?;
    assert_eq!(out.read_labels(0, "node")?, Some(vec![4, 9]));
    assert!(out.has_param("combiner version"));
    Ok(())
}

#[test]
fn test_states_per_file_rollover() -> Result<()> {
    let dir = tempdir().unwrap();
    let config = write_run(dir.path(), &two_procs(), &TIMES)?.with_states_per_file(2);
    combine(&config)?;

    assert!(dir.path().join("slab00").exists());
    assert!(dir.path().join("slab01").exists());
    let out = Family::open(dir.path(), "slab", AccessMode::Read)?;
    assert_eq!(out.states_per_file(), 2);
    assert_eq!(out.state_qty(), 3);
    Ok(())
}

/// Single processor carrying every aggregation type in both organizations
fn write_aggregates(dir: &Path, root: &str, states: usize) -> Result<Vec<Vec<u8>>> {
    let mut fam = Family::create(dir, root, Precision::Double, 0)?;
    let mesh = fam.define_mesh("block", 3)?;
    fam.define_class(mesh, Superclass::Node, "node", "Nodes")?;
    fam.define_nodes(mesh, "node", 1, 3, &[0.0; 9])?;
    fam.write_labels(mesh, "node", &[10, 20, 30])?;

    fam.define_svar(StateVariable::scalar("a", "Scalar", NumType::Float8))?;
    for c in ["vx", "vy", "vz", "c1", "c2"] {
        fam.define_svar(StateVariable::scalar(c, c, NumType::Float4))?;
    }
    fam.define_svar(StateVariable::new(
        "v",
        "Vector",
        NumType::Float4,
        Aggregation::Vector {
            components: vec!["vx".into(), "vy".into(), "vz".into()],
        },
    )?)?;
    fam.define_svar(StateVariable::new(
        "arr",
        "Array",
        NumType::Int4,
        Aggregation::Array { dims: vec![2, 3] },
    )?)?;
    fam.define_svar(StateVariable::new(
        "va",
        "Vector array",
        NumType::Float4,
        Aggregation::VecArray {
            dims: vec![2],
            components: vec!["c1".into(), "c2".into()],
        },
    )?)?;

    let all = ["a", "v", "arr", "va"];
    let srec = fam.open_srec(mesh)?;
    fam.define_subrecord(
        srec,
        "by_result",
        "node",
        Organization::ResultOrdered,
        &all,
        BlockList::from_ranges(&[(1, 3)])?,
    )?;
    fam.define_subrecord(
        srec,
        "by_object",
        "node",
        Organization::ObjectOrdered,
        &all,
        BlockList::from_ranges(&[(1, 1), (2, 3)])?,
    )?;
    fam.close_srec(srec)?;

    let size = fam.srec(srec)?.size();
    let mut written = Vec::with_capacity(states);
    for s in 0..states {
        let values: Vec<f32> = (0..size / 4).map(|i| (i * 7 + s) as f32).collect();
        let data = f32s_to_bytes(&values);
        fam.write_state(srec, s as f64, &data)?;
        written.push(data);
    }
    fam.close()?;
    Ok(written)
}

#[test]
fn test_single_input_round_trip_is_byte_identical() -> Result<()> {
    let dir = tempdir().unwrap();
    let written = write_aggregates(dir.path(), "agg000", 3)?;
    let config = CombineConfig::new(
        vec![FamilyLocation::new(dir.path(), "agg000")],
        FamilyLocation::new(dir.path(), "agg"),
    )
    .with_buffer_qty(2);
    combine(&config)?;

    let mut out = Family::open(dir.path(), "agg", AccessMode::Read)?;
    assert_eq!(out.precision(), Precision::Double);
    assert_eq!(out.state_qty(), written.len());
    for (state, data) in written.iter().enumerate() {
        assert_eq!(&out.read_state(state)?, data);
    }
    Ok(())
}
