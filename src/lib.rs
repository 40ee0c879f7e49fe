//! # Mili - Simulation Result Databases
//!
//! `mili-rs` reads and writes Mili file families: a non-state file holding
//! parameters, geometry and definitions, plus state files holding one record
//! per time step. It also combines the per-processor families written by a
//! parallel run into a single global family.
//!
//! - **Parameter store** for scalars, strings and arrays
//! - **Meshes** with node coordinates, element connectivity and labels
//! - **State records** built from subrecords in result or object order
//! - **Combiner** with label deduplication, resume and live tailing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mili_rs::{BlockList, Family, NumType, Organization, Precision, Result, StateVariable, Superclass};
//!
//! # fn main() -> Result<()> {
//! let mut fam = Family::create("/tmp", "beam", Precision::Single, 0)?;
//! let mesh = fam.define_mesh("beam", 3)?;
//! fam.define_class(mesh, Superclass::Node, "node", "Nodes")?;
//! fam.define_nodes(mesh, "node", 1, 2, &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0])?;
//! fam.write_labels(mesh, "node", &[10, 20])?;
//!
//! fam.define_svar(StateVariable::scalar("temp", "Temperature", NumType::Float4))?;
//! let srec = fam.open_srec(mesh)?;
//! fam.define_subrecord(
//!     srec,
//!     "nodal",
//!     "node",
//!     Organization::ResultOrdered,
//!     &["temp"],
//!     BlockList::from_ranges(&[(1, 2)])?,
//! )?;
//! fam.close_srec(srec)?;
//!
//! let state = fam.new_state_buffer(srec)?;
//! fam.write_state(srec, 0.0, &state)?;
//! fam.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Combining
//!
//! ```rust,no_run
//! use mili_rs::{combine, CombineConfig, Result};
//!
//! # fn main() -> Result<()> {
//! let config = CombineConfig::from_file("combine.toml")?;
//! let report = combine(&config)?;
//! println!("{} states from {} processors", report.states_written, report.processors);
//! # Ok(())
//! # }
//! ```

pub mod blocks;
pub mod buffer_queue;
pub mod combine;
pub mod config;
pub mod error;
pub mod family;
pub mod header;
pub mod heap;
pub mod io;
pub mod labels;
pub mod mesh;
pub mod numeric;
pub mod param;
pub mod registry;
pub mod srec;
pub mod svar;

pub use blocks::{BlockList, IdBlock};
pub use buffer_queue::{BufferQueue, BufferQueueStats};
pub use combine::{combine, CombineReport};
pub use config::{CombineConfig, FamilyLocation, LiveWait};
pub use error::{ErrorKind, MiliError, Result};
pub use family::{AccessMode, Connectivity, Family};
pub use heap::MinHeap;
pub use labels::{ClassLabels, LabelSet};
pub use mesh::{Mesh, MeshObjectClass, Superclass};
pub use numeric::{NumType, Precision};
pub use param::{ArrayData, EntryKind, ParamArray, ParamValue, Scalar};
pub use registry::{FamilyId, FamilyRegistry};
pub use srec::{Organization, StateRecordFormat, Subrecord};
pub use svar::{Aggregation, StateVariable};

/// Parameter prefix of node label arrays
pub const NODE_LABELS: &str = "Node Labels";

/// Parameter prefix of element label arrays
pub const ELEMENT_LABELS: &str = "Element Labels";

/// Parameter prefixes the combiner regenerates instead of copying
pub const RESERVED_PREFIXES: [&str; 5] = [
    ELEMENT_LABELS,
    NODE_LABELS,
    "GLOBAL_IDS_LOCAL_MAP",
    "GLOBAL_IDS",
    "LOCAL_COUNT",
];
