//! Parallel database combiner
//!
//! Merges per-processor families into one global family:
//!
//! 1. open the selected inputs and merge their labels
//! 2. merge metadata (identity, meshes, classes, svars, parameters)
//! 3. write global geometry and labels
//! 4. plan and commit the combined state-record formats
//! 5. copy state data, resuming after the output's last state in append mode
//!
//! ```rust,no_run
//! use mili_rs::{combine, CombineConfig, FamilyLocation};
//!
//! # fn main() -> mili_rs::Result<()> {
//! let inputs = (0..4)
//!     .map(|p| FamilyLocation::new("/scratch/run", format!("crash{:03}", p)))
//!     .collect();
//! let config = CombineConfig::new(inputs, FamilyLocation::new("/scratch/run", "crash"));
//! let report = combine(&config)?;
//! println!("wrote {} states", report.states_written);
//! # Ok(())
//! # }
//! ```

pub mod geometry;
pub mod metadata;
pub mod planner;
pub mod resume;
pub mod state;

pub use geometry::{combine_geometry, GeometryReport};
pub use metadata::{combine_metadata, MetadataReport};
pub use planner::{MergePlan, PlannedSrec, PlannedSubrecord};
pub use resume::{resume_index, wait_for_state};
pub use state::{merge_state_data, StateMerger, SubrecordRoute};

use crate::config::CombineConfig;
use crate::error::{MiliError, Result};
use crate::family::{AccessMode, Family};
use crate::io::non_state_path;
use crate::labels::LabelSet;
use crate::registry::{FamilyId, FamilyRegistry};
use std::time::Instant;
use tracing::{debug, info};

/// Outcome of a combine run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombineReport {
    pub processors: usize,
    pub metadata: MetadataReport,
    pub geometry: GeometryReport,
    pub subrecords: usize,
    /// First input state combined, `None` when nothing was left to do
    pub first_state: Option<usize>,
    pub states_written: usize,
    /// States in the output after the run
    pub output_states: usize,
    pub elapsed_secs: f64,
}

/// Combine the inputs named by `config` into its output family
pub fn combine(config: &CombineConfig) -> Result<CombineReport> {
    config.check()?;
    let started = Instant::now();
    let mut combiner = Combiner::open(config)?;
    let mut report = combiner.run()?;
    combiner.close()?;
    report.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        "Combined {} processors into '{}': {} states in {:.2}s",
        report.processors, config.output.root, report.states_written, report.elapsed_secs
    );
    Ok(report)
}

struct Combiner<'a> {
    config: &'a CombineConfig,
    registry: FamilyRegistry,
    inputs: Vec<FamilyId>,
    out: Family,
}

impl<'a> Combiner<'a> {
    fn open(config: &'a CombineConfig) -> Result<Self> {
        let selected = config.selected_processors()?;
        if selected.is_empty() {
            return Err(MiliError::Config("no processors selected".to_string()));
        }

        let mut registry = FamilyRegistry::new();
        let mut inputs = Vec::with_capacity(selected.len());
        for &p in &selected {
            let location = &config.inputs[p];
            let id = registry.open(&location.dir, &location.root, AccessMode::Read)?;
            let family = registry.get_mut(id)?;
            for mesh_id in 0..family.meshes().len() {
                family.set_buffer_qty(mesh_id, None, config.buffer_qty)?;
            }
            inputs.push(id);
        }

        let first = registry.get(inputs[0])?;
        let output = &config.output;
        let out = if config.append && non_state_path(&output.dir, &output.root).exists() {
            info!("Appending to existing family '{}'", output.root);
            Family::open(&output.dir, &output.root, AccessMode::Append)?
        } else {
            let states_per_file = match config.states_per_file {
                0 => first.states_per_file(),
                n => n,
            };
            Family::create(&output.dir, &output.root, first.precision(), states_per_file)?
        };

        Ok(Combiner {
            config,
            registry,
            inputs,
            out,
        })
    }

    fn run(&mut self) -> Result<CombineReport> {
        let mut report = CombineReport {
            processors: self.inputs.len(),
            ..CombineReport::default()
        };

        let labels = LabelSet::load(
            &mut self.registry,
            &self.inputs,
            self.config.synthesize_labels,
        )?;
        report.metadata = combine_metadata(&mut self.registry, &self.inputs, &mut self.out)?;
        report.geometry = combine_geometry(&mut self.registry, &self.inputs, &labels, &mut self.out)?;

        let mut plan = MergePlan::build(&self.registry, &self.inputs, &labels)?;
        plan.commit(&mut self.out)?;
        report.subrecords = plan.subrecord_qty();
        self.out.flush()?;

        let Some(start) = self.start_state()? else {
            info!("Output '{}' is up to date", self.out.root());
            report.output_states = self.out.state_qty();
            return Ok(report);
        };
        report.first_state = Some(start);

        let mut merger = StateMerger::new();
        let mut state = start;
        while self.config.stop_state.map_or(true, |stop| state <= stop) {
            if !self.state_available(state)? {
                break;
            }
            merger.merge(
                &mut self.registry,
                &self.inputs,
                state,
                &plan,
                &labels,
                &mut self.out,
            )?;
            report.states_written += 1;
            if self.config.live.is_some() {
                self.out.flush()?;
            }
            state += 1;
        }

        report.output_states = self.out.state_qty();
        Ok(report)
    }

    /// First input state to combine, `None` when there is nothing to do
    fn start_state(&self) -> Result<Option<usize>> {
        if !self.config.append {
            return Ok(Some(self.config.start_state.unwrap_or(0)));
        }
        let in_times = self.registry.get(self.inputs[0])?.state_times();
        let out_times = self.out.state_times();
        let start = match resume_index(&out_times, &in_times) {
            Some(start) => Some(start),
            None if self.config.live.is_some() => Some(in_times.len()),
            None => None,
        };
        debug!(
            "Resume: output has {} states, inputs {}, starting at {:?}",
            out_times.len(),
            in_times.len(),
            start
        );
        Ok(start)
    }

    /// Whether every input holds `state`, waiting for it in live mode
    fn state_available(&mut self, state: usize) -> Result<bool> {
        if let Some(live) = &self.config.live {
            return wait_for_state(&mut self.registry, &self.inputs, state, live);
        }
        for &id in &self.inputs {
            if self.registry.get(id)?.state_qty() <= state {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn close(self) -> Result<()> {
        let Combiner {
            mut registry, out, ..
        } = self;
        out.close()?;
        registry.close_all()
    }
}
