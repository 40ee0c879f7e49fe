//! Mili file families
//!
//! A [`Family`] is one database: a non-state file holding the header,
//! parameters, geometry and definitions, plus state files holding one record
//! per time step. Definitions (meshes, classes, state variables and
//! state-record formats) are kept in memory and written back together with
//! the directory on every [`Family::flush`].

use crate::blocks::{BlockList, IdBlock};
use crate::buffer_queue::{BufferQueue, BufferQueueStats};
use crate::error::{MiliError, Result};
use crate::header::{Header, HEADER_SIZE};
use crate::io::{non_state_path, ByteStore, NonStateFile, StateFiles};
use crate::mesh::{Mesh, MeshObjectClass, Superclass};
use crate::numeric::{NumType, Precision};
use crate::param::{ArrayData, DirEntry, Directory, EntryKind, ParamArray, ParamValue, Scalar};
use crate::srec::{Organization, StateRecordFormat, Subrecord};
use crate::svar::{Aggregation, StateVariable};
use ahash::AHashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Buffers given to each object-ordered subrecord queue
pub const DEFAULT_BUFFER_QTY: usize = 1;

/// Identity strings written into every new family
pub const IDENTITY_KEYS: [&str; 5] = ["lib version", "host name", "arch name", "date", "username"];

/// How a family is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Existing family, read only
    Read,
    /// New family, replacing any existing one
    Write,
    /// Existing family, open for adding definitions and states
    Append,
}

impl AccessMode {
    pub fn is_writable(&self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// Element connectivity of one class
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connectivity {
    /// Nodes per element
    pub conn_qty: usize,
    /// 1-based node ids, `conn_qty` per element
    pub nodes: Vec<usize>,
    /// 1-based material per element
    pub materials: Vec<usize>,
    /// 1-based part per element
    pub parts: Vec<usize>,
}

impl Connectivity {
    pub fn qty(&self) -> usize {
        self.materials.len()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Definitions {
    meshes: Vec<Mesh>,
    svars: Vec<StateVariable>,
    srecs: Vec<StateRecordFormat>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Catalog {
    directory: Directory,
    definitions: Definitions,
}

/// Family root names are plain file-name stems
const ROOT_PATTERN: &str = r"^[A-Za-z0-9_.+-]+$";

fn validate_root(root: &str) -> Result<()> {
    let re = Regex::new(ROOT_PATTERN).map_err(|e| MiliError::Config(e.to_string()))?;
    if !re.is_match(root) {
        return Err(MiliError::Config(format!(
            "invalid family root name '{}'",
            root
        )));
    }
    Ok(())
}

fn label_key(prefix: &str, mesh_id: usize, class: &str) -> String {
    format!("{}[{}:{}]", prefix, mesh_id, class)
}

fn nodes_key(mesh_id: usize, class: &str, first: usize) -> String {
    format!("Nodes[{}:{}:{}]", mesh_id, class, first)
}

fn conns_key(mesh_id: usize, class: &str, first: usize) -> String {
    format!("Conns[{}:{}:{}]", mesh_id, class, first)
}

/// One open Mili database
pub struct Family {
    root: String,
    dir: PathBuf,
    mode: AccessMode,
    header: Header,
    file: NonStateFile,
    states: StateFiles,
    directory: Directory,
    defs: Definitions,
    queues: AHashMap<(usize, usize), BufferQueue>,
    scratch: Vec<u8>,
    closed: bool,
}

impl Family {
    /// Create a new family, replacing any files under the same root
    pub fn create<P: AsRef<Path>>(
        dir: P,
        root: &str,
        precision: Precision,
        states_per_file: usize,
    ) -> Result<Self> {
        validate_root(root)?;
        let dir = dir.as_ref().to_path_buf();
        info!("Creating family '{}' in {}", root, dir.display());

        let header = Header::new(precision, states_per_file as u32);
        let file = NonStateFile::create(non_state_path(&dir, root), &header)?;
        let states = StateFiles::create(&dir, root, states_per_file)?;

        let mut family = Family {
            root: root.to_string(),
            dir,
            mode: AccessMode::Write,
            header,
            file,
            states,
            directory: Directory::new(HEADER_SIZE as u64),
            defs: Definitions::default(),
            queues: AHashMap::new(),
            scratch: Vec::new(),
            closed: false,
        };
        family.write_identity()?;
        family.flush()?;
        Ok(family)
    }

    /// Open an existing family for reading or appending
    ///
    /// New families are made with [`Family::create`]; `AccessMode::Write` is
    /// rejected here.
    pub fn open<P: AsRef<Path>>(dir: P, root: &str, mode: AccessMode) -> Result<Self> {
        if mode == AccessMode::Write {
            return Err(MiliError::Config(format!(
                "family '{}' cannot be opened in write mode, create it instead",
                root
            )));
        }
        validate_root(root)?;
        let dir = dir.as_ref().to_path_buf();
        debug!("Opening family '{}' in {} ({:?})", root, dir.display(), mode);

        let mut file = NonStateFile::open(non_state_path(&dir, root), mode.is_writable())?;
        let header = file.read_header()?;

        let mut blob = vec![0u8; header.directory_len as usize];
        file.read_at(header.directory_offset, &mut blob)?;
        header.verify_blob(&blob)?;
        let catalog: Catalog = serde_json::from_slice(&blob)?;

        let mut directory = catalog.directory;
        directory.rebuild_index()?;
        let blob_end = header.directory_offset + header.directory_len;
        directory.reserve(header.directory_offset..blob_end);
        let mut defs = catalog.definitions;
        rebuild_layouts(&mut defs)?;

        let states = StateFiles::open(&dir, root, header.states_per_file as usize)?;

        let mut family = Family {
            root: root.to_string(),
            dir,
            mode,
            header,
            file,
            states,
            directory,
            defs,
            queues: AHashMap::new(),
            scratch: Vec::new(),
            closed: false,
        };
        family.init_queues()?;
        Ok(family)
    }

    fn write_identity(&mut self) -> Result<()> {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let arch = format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS);
        let date = chrono::Utc::now().to_rfc3339();

        let values = [
            env!("CARGO_PKG_VERSION").to_string(),
            host,
            arch,
            date,
            user,
        ];
        for (key, value) in IDENTITY_KEYS.iter().zip(values.iter()) {
            self.write_entry(EntryKind::Mili, key, &ParamValue::String(value.clone()))?;
        }
        Ok(())
    }

    fn init_queues(&mut self) -> Result<()> {
        for srec in self.defs.srecs.iter().filter(|s| s.closed) {
            for (index, sub) in srec.subrecords.iter().enumerate() {
                if sub.organization == Organization::ObjectOrdered {
                    self.queues.insert(
                        (srec.id, index),
                        BufferQueue::new(DEFAULT_BUFFER_QTY, sub.size())?,
                    );
                }
            }
        }
        Ok(())
    }

    fn require_writable(&self) -> Result<()> {
        if !self.mode.is_writable() {
            return Err(MiliError::ReadOnlyFamily(self.root.clone()));
        }
        Ok(())
    }

    /// Write the directory and definitions and update the header
    pub fn flush(&mut self) -> Result<()> {
        if !self.mode.is_writable() {
            return Ok(());
        }
        let catalog = CatalogRef {
            directory: &self.directory,
            definitions: &self.defs,
        };
        let blob = serde_json::to_vec(&catalog)?;
        // never overwrite the blob the on-disk header still points at
        let offset = self.directory.placement(blob.len() as u64);
        let end = offset + blob.len() as u64;

        self.file.write_at(offset, &blob)?;
        self.file.sync()?;
        self.header.seal(offset, &blob);
        self.file.write_header(&self.header)?;
        self.file.sync()?;
        self.file.truncate(end)?;
        self.directory.reserve(offset..end);
        self.states.sync()?;
        debug!(
            "Flushed family '{}': {} entries, {} states",
            self.root,
            self.directory.len(),
            self.states.len()
        );
        Ok(())
    }

    /// Flush and release the family
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.closed = true;
        info!("Closed family '{}'", self.root);
        Ok(())
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn precision(&self) -> Precision {
        self.header.precision
    }

    pub fn states_per_file(&self) -> usize {
        self.states.states_per_file()
    }

    // ---- parameters ----

    fn write_entry(&mut self, kind: EntryKind, name: &str, value: &ParamValue) -> Result<()> {
        self.require_writable()?;
        self.directory
            .write_value(&mut self.file, kind, name, value)
    }

    pub fn write_scalar(&mut self, name: &str, value: Scalar) -> Result<()> {
        self.write_entry(EntryKind::Application, name, &ParamValue::Scalar(value))
    }

    pub fn write_string(&mut self, name: &str, value: &str) -> Result<()> {
        self.write_entry(
            EntryKind::Application,
            name,
            &ParamValue::String(value.to_string()),
        )
    }

    pub fn write_array(&mut self, name: &str, array: &ParamArray) -> Result<()> {
        self.write_entry(EntryKind::Application, name, &ParamValue::Array(array.clone()))
    }

    pub fn ti_write_scalar(&mut self, name: &str, value: Scalar) -> Result<()> {
        self.write_entry(EntryKind::Ti, name, &ParamValue::Scalar(value))
    }

    pub fn ti_write_string(&mut self, name: &str, value: &str) -> Result<()> {
        self.write_entry(EntryKind::Ti, name, &ParamValue::String(value.to_string()))
    }

    pub fn ti_write_array(&mut self, name: &str, array: &ParamArray) -> Result<()> {
        self.write_entry(EntryKind::Ti, name, &ParamValue::Array(array.clone()))
    }

    /// Write a value under an explicit entry kind
    pub fn write_value(&mut self, kind: EntryKind, name: &str, value: &ParamValue) -> Result<()> {
        self.write_entry(kind, name, value)
    }

    pub fn read_scalar(&mut self, name: &str) -> Result<Scalar> {
        self.directory.read_scalar(&mut self.file, name)
    }

    pub fn read_string(&mut self, name: &str) -> Result<String> {
        self.directory.read_string(&mut self.file, name)
    }

    pub fn read_array(&mut self, name: &str) -> Result<ParamArray> {
        self.directory.read_array(&mut self.file, name)
    }

    pub fn read_value(&mut self, name: &str) -> Result<ParamValue> {
        self.directory.read_value(&mut self.file, name)
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.directory.contains(name)
    }

    /// Directory entries of the given kinds, in definition order
    pub fn entries_of(&self, kinds: &[EntryKind]) -> Vec<DirEntry> {
        self.directory
            .entries()
            .filter(|e| kinds.contains(&e.kind))
            .cloned()
            .collect()
    }

    /// Entry names matching a `*`/`?` wildcard pattern
    pub fn param_names_matching(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .directory
            .names_matching(pattern)?
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    // ---- meshes and classes ----

    pub fn meshes(&self) -> &[Mesh] {
        &self.defs.meshes
    }

    pub fn mesh(&self, mesh_id: usize) -> Result<&Mesh> {
        self.defs
            .meshes
            .get(mesh_id)
            .ok_or_else(|| MiliError::MeshNotFound(mesh_id.to_string()))
    }

    fn mesh_mut(&mut self, mesh_id: usize) -> Result<&mut Mesh> {
        self.defs
            .meshes
            .get_mut(mesh_id)
            .ok_or_else(|| MiliError::MeshNotFound(mesh_id.to_string()))
    }

    pub fn mesh_id(&self, name: &str) -> Option<usize> {
        self.defs.meshes.iter().position(|m| m.name == name)
    }

    pub fn class(&self, mesh_id: usize, class: &str) -> Result<&MeshObjectClass> {
        self.mesh(mesh_id)?.require_class(class)
    }

    /// Define an unstructured mesh, returning its id
    pub fn define_mesh(&mut self, name: &str, dimension: usize) -> Result<usize> {
        self.require_writable()?;
        if self.mesh_id(name).is_some() {
            return Err(MiliError::EntryExists(format!("mesh {}", name)));
        }
        if !(1..=3).contains(&dimension) {
            return Err(MiliError::Config(format!(
                "mesh dimension must be 1, 2 or 3, got {}",
                dimension
            )));
        }
        let id = self.defs.meshes.len();
        self.defs.meshes.push(Mesh::new(id, name, dimension));
        debug!("Defined mesh '{}' ({}d) as {}", name, dimension, id);
        Ok(id)
    }

    pub fn define_class(
        &mut self,
        mesh_id: usize,
        superclass: Superclass,
        short_name: &str,
        long_name: &str,
    ) -> Result<()> {
        self.require_writable()?;
        self.mesh_mut(mesh_id)?
            .add_class(MeshObjectClass::new(superclass, short_name, long_name))
    }

    /// Declare identifiers `[first, last]` of a class without geometry
    pub fn define_class_idents(
        &mut self,
        mesh_id: usize,
        class: &str,
        first: usize,
        last: usize,
    ) -> Result<()> {
        self.require_writable()?;
        let block = BlockList::from_ranges(&[(first, last)])?.blocks()[0];
        let mesh = self.mesh_mut(mesh_id)?;
        let class_def = mesh.class_mut(class)?;
        class_def.blocks.push(block, class)
    }

    /// Define nodes `[first, last]` with `dimension` coordinates each
    pub fn define_nodes(
        &mut self,
        mesh_id: usize,
        class: &str,
        first: usize,
        last: usize,
        coords: &[f64],
    ) -> Result<()> {
        self.require_writable()?;
        let block = BlockList::from_ranges(&[(first, last)])?.blocks()[0];
        let mesh = self.mesh(mesh_id)?;
        let dimension = mesh.dimension;
        let class_def = mesh.require_class(class)?;
        if class_def.superclass != Superclass::Node {
            return Err(MiliError::TypeMismatch {
                name: class.to_string(),
                stored: format!("{:?}", class_def.superclass),
                requested: "Node".to_string(),
            });
        }
        if class_def.blocks.overlaps(&block) {
            return Err(MiliError::ObjectRangeOverlap {
                class: class.to_string(),
                first,
                last,
            });
        }
        if coords.len() != block.len() * dimension {
            return Err(MiliError::ArrayShapeMismatch {
                name: nodes_key(mesh_id, class, first),
                stored: block.len() * dimension,
                requested: coords.len(),
            });
        }

        let data = match self.precision() {
            Precision::Single => ArrayData::Float4(coords.iter().map(|&c| c as f32).collect()),
            Precision::Double => ArrayData::Float8(coords.to_vec()),
        };
        let array = ParamArray::new(vec![block.len(), dimension], data);
        self.write_entry(
            EntryKind::Geometry,
            &nodes_key(mesh_id, class, first),
            &ParamValue::Array(array),
        )?;

        self.mesh_mut(mesh_id)?.class_mut(class)?.blocks.push(block, class)
    }

    /// Node coordinates of a class in block order
    pub fn load_nodes(&mut self, mesh_id: usize, class: &str) -> Result<Vec<f64>> {
        let blocks: Vec<IdBlock> = self.class(mesh_id, class)?.blocks.blocks().to_vec();
        let mut coords = Vec::new();
        for block in blocks {
            let array = self.read_array(&nodes_key(mesh_id, class, block.first))?;
            coords.extend(array.data.to_f64());
        }
        Ok(coords)
    }

    /// Define elements `[first, last]` of a class
    ///
    /// `nodes` holds `conn_qty` 1-based node ids per element; `materials`
    /// and `parts` hold one 1-based id per element.
    #[allow(clippy::too_many_arguments)]
    pub fn define_connectivity(
        &mut self,
        mesh_id: usize,
        class: &str,
        first: usize,
        last: usize,
        nodes: &[usize],
        materials: &[usize],
        parts: &[usize],
    ) -> Result<()> {
        self.require_writable()?;
        let block = BlockList::from_ranges(&[(first, last)])?.blocks()[0];
        let class_def = self.class(mesh_id, class)?;
        let conn_qty = class_def.superclass.conn_qty().ok_or_else(|| {
            MiliError::TypeMismatch {
                name: class.to_string(),
                stored: format!("{:?}", class_def.superclass),
                requested: "element".to_string(),
            }
        })?;
        if class_def.blocks.overlaps(&block) {
            return Err(MiliError::ObjectRangeOverlap {
                class: class.to_string(),
                first,
                last,
            });
        }
        let qty = block.len();
        if nodes.len() != qty * conn_qty || materials.len() != qty || parts.len() != qty {
            return Err(MiliError::ArrayShapeMismatch {
                name: conns_key(mesh_id, class, first),
                stored: qty * (conn_qty + 2),
                requested: nodes.len() + materials.len() + parts.len(),
            });
        }

        let width = conn_qty + 2;
        let mut rows = Vec::with_capacity(qty * width);
        for e in 0..qty {
            rows.extend(nodes[e * conn_qty..(e + 1) * conn_qty].iter().map(|&n| n as i32));
            rows.push(materials[e] as i32);
            rows.push(parts[e] as i32);
        }
        let array = ParamArray::new(vec![qty, width], ArrayData::Int4(rows));
        self.write_entry(
            EntryKind::Geometry,
            &conns_key(mesh_id, class, first),
            &ParamValue::Array(array),
        )?;

        self.mesh_mut(mesh_id)?.class_mut(class)?.blocks.push(block, class)
    }

    /// Element connectivity of a class in block order
    pub fn load_connectivity(&mut self, mesh_id: usize, class: &str) -> Result<Connectivity> {
        let class_def = self.class(mesh_id, class)?;
        let conn_qty = class_def
            .superclass
            .conn_qty()
            .ok_or_else(|| MiliError::EntryNotFound(conns_key(mesh_id, class, 0)))?;
        let blocks: Vec<IdBlock> = class_def.blocks.blocks().to_vec();

        let width = conn_qty + 2;
        let mut conn = Connectivity {
            conn_qty,
            ..Connectivity::default()
        };
        for block in blocks {
            let array = self.read_array(&conns_key(mesh_id, class, block.first))?;
            let rows = array.data.to_i64().ok_or_else(|| {
                MiliError::Corrupted(format!("connectivity of {} is not integer", class))
            })?;
            for row in rows.chunks_exact(width) {
                conn.nodes.extend(row[..conn_qty].iter().map(|&n| n as usize));
                conn.materials.push(row[conn_qty] as usize);
                conn.parts.push(row[conn_qty + 1] as usize);
            }
        }
        Ok(conn)
    }

    /// Whether every block of a node or element class has stored geometry
    pub fn has_geometry(&self, mesh_id: usize, class: &str) -> Result<bool> {
        let class_def = self.class(mesh_id, class)?;
        let key: fn(usize, &str, usize) -> String = match class_def.superclass {
            Superclass::Node => nodes_key,
            s if s.is_element() => conns_key,
            _ => return Ok(false),
        };
        Ok(class_def
            .blocks
            .blocks()
            .iter()
            .all(|b| self.directory.contains(&key(mesh_id, class, b.first))))
    }

    // ---- labels ----

    /// Store external labels for every object of a node or element class
    pub fn write_labels(&mut self, mesh_id: usize, class: &str, labels: &[i32]) -> Result<()> {
        let class_def = self.class(mesh_id, class)?;
        let prefix = class_def.superclass.label_prefix().ok_or_else(|| {
            MiliError::TypeMismatch {
                name: class.to_string(),
                stored: format!("{:?}", class_def.superclass),
                requested: "labelled class".to_string(),
            }
        })?;
        if labels.len() != class_def.qty() {
            return Err(MiliError::ArrayShapeMismatch {
                name: label_key(prefix, mesh_id, class),
                stored: class_def.qty(),
                requested: labels.len(),
            });
        }
        let key = label_key(prefix, mesh_id, class);
        self.ti_write_array(&key, &ParamArray::vector(ArrayData::Int4(labels.to_vec())))
    }

    /// Labels of a class, `None` if the class has none
    pub fn read_labels(&mut self, mesh_id: usize, class: &str) -> Result<Option<Vec<i32>>> {
        let class_def = self.class(mesh_id, class)?;
        let Some(prefix) = class_def.superclass.label_prefix() else {
            return Ok(None);
        };
        let key = label_key(prefix, mesh_id, class);
        if !self.directory.contains(&key) {
            return Ok(None);
        }
        match self.read_array(&key)?.data {
            ArrayData::Int4(labels) => Ok(Some(labels)),
            other => Err(MiliError::TypeMismatch {
                name: key,
                stored: other.num_type().to_string(),
                requested: NumType::Int4.to_string(),
            }),
        }
    }

    // ---- state variables ----

    pub fn svars(&self) -> &[StateVariable] {
        &self.defs.svars
    }

    pub fn svar(&self, name: &str) -> Option<&StateVariable> {
        self.defs.svars.iter().find(|s| s.name == name)
    }

    /// Define a state variable
    ///
    /// Re-defining an identical svar is a no-op. Vector components must
    /// already be defined as scalars.
    pub fn define_svar(&mut self, svar: StateVariable) -> Result<()> {
        self.require_writable()?;
        if let Some(existing) = self.svar(&svar.name) {
            if *existing == svar {
                return Ok(());
            }
            return Err(MiliError::EntryExists(format!("svar {}", svar.name)));
        }
        for component in svar.aggregation.components() {
            let def = self
                .svar(component)
                .ok_or_else(|| MiliError::SvarNotFound(component.clone()))?;
            if def.aggregation != Aggregation::Scalar || def.num_type != svar.num_type {
                return Err(MiliError::InvalidAggregation(format!(
                    "component {} of {} must be a {} scalar",
                    component, svar.name, svar.num_type
                )));
            }
        }
        self.defs.svars.push(svar);
        Ok(())
    }

    // ---- state record formats ----

    pub fn srecs(&self) -> &[StateRecordFormat] {
        &self.defs.srecs
    }

    pub fn srec(&self, srec_id: usize) -> Result<&StateRecordFormat> {
        self.defs
            .srecs
            .get(srec_id)
            .ok_or(MiliError::InvalidSrec(srec_id))
    }

    /// Start a new state-record format on a mesh
    pub fn open_srec(&mut self, mesh_id: usize) -> Result<usize> {
        self.require_writable()?;
        self.mesh(mesh_id)?;
        let id = self.defs.srecs.len();
        self.defs.srecs.push(StateRecordFormat::new(id, mesh_id));
        Ok(id)
    }

    /// Bind svars to the objects `blocks` of `class` in an open srec
    pub fn define_subrecord(
        &mut self,
        srec_id: usize,
        name: &str,
        class: &str,
        organization: Organization,
        svar_names: &[&str],
        blocks: BlockList,
    ) -> Result<usize> {
        self.require_writable()?;
        let srec = self.srec(srec_id)?;
        if srec.closed {
            return Err(MiliError::SrecClosed(srec_id));
        }
        self.class(srec.mesh_id, class)?;
        blocks.check_disjoint(class)?;

        let mut svars = Vec::with_capacity(svar_names.len());
        for &svar_name in svar_names {
            svars.push(
                self.svar(svar_name)
                    .ok_or_else(|| MiliError::SvarNotFound(svar_name.to_string()))?,
            );
        }
        let subrecord = Subrecord::new(name, class, organization, &svars, blocks);
        debug!(
            "Defined subrecord '{}' on {} with {} objects ({} bytes)",
            name,
            class,
            subrecord.qty(),
            subrecord.size()
        );

        self.defs
            .srecs
            .get_mut(srec_id)
            .ok_or(MiliError::InvalidSrec(srec_id))?
            .add_subrecord(subrecord)
    }

    /// Close an srec for definition and allocate its read buffers
    pub fn close_srec(&mut self, srec_id: usize) -> Result<()> {
        self.require_writable()?;
        let srec = self
            .defs
            .srecs
            .get_mut(srec_id)
            .ok_or(MiliError::InvalidSrec(srec_id))?;
        if srec.closed {
            return Ok(());
        }
        srec.closed = true;
        for (index, sub) in srec.subrecords.iter().enumerate() {
            if sub.organization == Organization::ObjectOrdered {
                self.queues.insert(
                    (srec_id, index),
                    BufferQueue::new(DEFAULT_BUFFER_QTY, sub.size())?,
                );
            }
        }
        Ok(())
    }

    /// Resize the read buffers of object-ordered subrecords on a mesh
    ///
    /// With `class` set only that class's subrecords are touched.
    pub fn set_buffer_qty(&mut self, mesh_id: usize, class: Option<&str>, qty: usize) -> Result<()> {
        self.mesh(mesh_id)?;
        for srec in self.defs.srecs.iter().filter(|s| s.mesh_id == mesh_id && s.closed) {
            for (index, sub) in srec.subrecords.iter().enumerate() {
                if sub.organization != Organization::ObjectOrdered {
                    continue;
                }
                if class.is_some_and(|c| c != sub.class_name) {
                    continue;
                }
                match self.queues.get_mut(&(srec.id, index)) {
                    Some(queue) => queue.resize(qty, sub.size())?,
                    None => {
                        self.queues
                            .insert((srec.id, index), BufferQueue::new(qty, sub.size())?);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn buffer_stats(&self, srec_id: usize, subrecord: usize) -> Option<BufferQueueStats> {
        self.queues.get(&(srec_id, subrecord)).map(BufferQueue::stats)
    }

    // ---- states ----

    pub fn state_qty(&self) -> usize {
        self.states.len()
    }

    pub fn state_time(&self, state: usize) -> Result<f64> {
        Ok(self.states.location(state)?.time)
    }

    pub fn state_times(&self) -> Vec<f64> {
        self.states.times()
    }

    /// State-record format used by a state
    pub fn state_srec(&self, state: usize) -> Result<usize> {
        Ok(self.states.location(state)?.srec_id)
    }

    /// Byte range of one object's value of one svar inside a state record
    pub fn locate(
        &self,
        srec_id: usize,
        subrecord: &str,
        svar: &str,
        object_id: usize,
    ) -> Result<Range<usize>> {
        self.srec(srec_id)?.locate(subrecord, svar, object_id)
    }

    /// Zero-filled buffer sized for one state record
    pub fn new_state_buffer(&self, srec_id: usize) -> Result<Vec<u8>> {
        Ok(vec![0u8; self.srec(srec_id)?.size()])
    }

    /// Append one complete state record
    pub fn write_state(&mut self, srec_id: usize, time: f64, data: &[u8]) -> Result<usize> {
        self.require_writable()?;
        let srec = self.srec(srec_id)?;
        if !srec.closed {
            return Err(MiliError::SrecOpen(srec_id));
        }
        if data.len() != srec.size() {
            return Err(MiliError::ArrayShapeMismatch {
                name: format!("state record {}", srec_id),
                stored: srec.size(),
                requested: data.len(),
            });
        }
        let state = self.states.append(srec_id, time, data)?;
        debug!("Wrote state {} (t={}) of '{}'", state, time, self.root);
        Ok(state)
    }

    /// Whole state record
    pub fn read_state(&mut self, state: usize) -> Result<Vec<u8>> {
        let len = self.states.location(state)?.len as usize;
        let mut buf = vec![0u8; len];
        self.states.read_payload(state, 0, &mut buf)?;
        Ok(buf)
    }

    /// One subrecord's bytes from a state, through its buffer queue
    pub fn read_subrecord(&mut self, state: usize, subrecord: usize) -> Result<&[u8]> {
        let srec_id = self.state_srec(state)?;
        let srec = self.srec(srec_id)?;
        let span = srec
            .subrecords
            .get(subrecord)
            .ok_or_else(|| MiliError::SubrecordNotFound(format!("#{} of srec {}", subrecord, srec_id)))?
            .span();

        let states = &mut self.states;
        if let Some(queue) = self
            .queues
            .get_mut(&(srec_id, subrecord))
            .filter(|q| !q.is_empty())
        {
            return queue.get_or_load(state, |buf| states.read_payload(state, span.start, buf));
        }

        self.scratch.resize(span.len(), 0);
        states.read_payload(state, span.start, &mut self.scratch)?;
        Ok(&self.scratch)
    }

    /// Pick up states appended by another writer since the family was opened
    pub fn refresh_states(&mut self) -> Result<usize> {
        self.states.rescan()?;
        for queue in self.queues.values_mut() {
            queue.invalidate();
        }
        Ok(self.states.len())
    }
}

impl Drop for Family {
    fn drop(&mut self) {
        if !self.closed && self.mode.is_writable() {
            if let Err(e) = self.flush() {
                warn!("Failed to flush family '{}' on drop: {}", self.root, e);
            }
        }
    }
}

#[derive(Serialize)]
struct CatalogRef<'a> {
    directory: &'a Directory,
    definitions: &'a Definitions,
}

fn rebuild_layouts(defs: &mut Definitions) -> Result<()> {
    let svars = &defs.svars;
    for srec in &mut defs.srecs {
        let mut offset = 0;
        for sub in &mut srec.subrecords {
            let mut resolved = Vec::with_capacity(sub.svar_names.len());
            for name in &sub.svar_names {
                resolved.push(
                    svars
                        .iter()
                        .find(|s| &s.name == name)
                        .ok_or_else(|| MiliError::Corrupted(format!("unknown svar {}", name)))?,
                );
            }
            sub.rebuild_layout(&resolved);
            if sub.offset != offset {
                return Err(MiliError::Corrupted(format!(
                    "subrecord {} at offset {}, expected {}",
                    sub.name, sub.offset, offset
                )));
            }
            offset += sub.size();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::{bytes_to_f32s, f32s_to_bytes};
    use tempfile::tempdir;

    fn mesh_family(dir: &Path) -> Family {
        let mut fam = Family::create(dir, "unit", Precision::Single, 0).unwrap();
        let mesh = fam.define_mesh("part", 3).unwrap();
        fam.define_class(mesh, Superclass::Node, "node", "Nodes").unwrap();
        fam.define_class(mesh, Superclass::Hex, "brick", "Bricks").unwrap();
        fam.define_nodes(mesh, "node", 1, 2, &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0])
            .unwrap();
        fam
    }

    #[test]
    fn test_create_writes_identity() {
        let dir = tempdir().unwrap();
        let mut fam = Family::create(dir.path(), "run", Precision::Double, 0).unwrap();
        assert_eq!(fam.read_string("lib version").unwrap(), env!("CARGO_PKG_VERSION"));
        assert_eq!(fam.param_names_matching("* name").unwrap(), vec!["host name", "arch name"]);
        fam.close().unwrap();
    }

    #[test]
    fn test_reopen_preserves_definitions() {
        let dir = tempdir().unwrap();
        let mut fam = mesh_family(dir.path());
        fam.write_scalar("nproc", Scalar::Int4(4)).unwrap();
        fam.close().unwrap();

        let mut fam = Family::open(dir.path(), "unit", AccessMode::Read).unwrap();
        assert_eq!(fam.meshes().len(), 1);
        assert_eq!(fam.class(0, "node").unwrap().qty(), 2);
        assert_eq!(fam.read_scalar("nproc").unwrap(), Scalar::Int4(4));
        assert_eq!(fam.load_nodes(0, "node").unwrap()[3], 1.0);
        assert!(matches!(
            fam.write_scalar("x", Scalar::Int4(1)),
            Err(MiliError::ReadOnlyFamily(_))
        ));
    }

    #[test]
    fn test_corrupted_directory_detected() {
        let dir = tempdir().unwrap();
        let fam = mesh_family(dir.path());
        fam.close().unwrap();

        let path = non_state_path(dir.path(), "unit");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            Family::open(dir.path(), "unit", AccessMode::Read),
            Err(MiliError::Corrupted(_))
        ));
    }

    #[test]
    fn test_checkpoint_survives_unflushed_writes() {
        let dir = tempdir().unwrap();
        let mut fam = mesh_family(dir.path());
        fam.write_scalar("nproc", Scalar::Int4(4)).unwrap();
        fam.close().unwrap();

        let mut fam = Family::open(dir.path(), "unit", AccessMode::Append).unwrap();
        fam.write_scalar("late", Scalar::Float8(2.5)).unwrap();
        fam.write_string("note", "written after the checkpoint").unwrap();
        // dropped without a flush, as after a crash
        std::mem::forget(fam);

        let mut fam = Family::open(dir.path(), "unit", AccessMode::Append).unwrap();
        assert_eq!(fam.read_scalar("nproc").unwrap(), Scalar::Int4(4));
        assert!(!fam.has_param("late"));
        assert_eq!(fam.load_nodes(0, "node").unwrap()[3], 1.0);

        fam.write_scalar("late", Scalar::Float8(3.5)).unwrap();
        fam.close().unwrap();
        let mut fam = Family::open(dir.path(), "unit", AccessMode::Read).unwrap();
        assert_eq!(fam.read_scalar("late").unwrap(), Scalar::Float8(3.5));
        assert_eq!(fam.read_scalar("nproc").unwrap(), Scalar::Int4(4));
    }

    #[test]
    fn test_repeated_flushes_reuse_space() {
        let dir = tempdir().unwrap();
        let mut fam = mesh_family(dir.path());
        let path = non_state_path(dir.path(), "unit");

        let mut lens = Vec::new();
        for _ in 0..6 {
            fam.flush().unwrap();
            lens.push(std::fs::metadata(&path).unwrap().len());
        }
        let bound = lens[0].max(lens[1]);
        assert!(lens.iter().all(|&len| len <= bound), "file grew: {:?}", lens);
        fam.close().unwrap();
    }

    #[test]
    fn test_open_rejects_write_mode() {
        let dir = tempdir().unwrap();
        mesh_family(dir.path()).close().unwrap();
        assert!(matches!(
            Family::open(dir.path(), "unit", AccessMode::Write),
            Err(MiliError::Config(_))
        ));
    }

    #[test]
    fn test_bad_root_name() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Family::create(dir.path(), "../escape", Precision::Single, 0),
            Err(MiliError::Config(_))
        ));
    }

    #[test]
    fn test_node_overlap_rejected() {
        let dir = tempdir().unwrap();
        let mut fam = mesh_family(dir.path());
        let err = fam
            .define_nodes(0, "node", 2, 3, &[0.0; 6])
            .unwrap_err();
        assert!(matches!(err, MiliError::ObjectRangeOverlap { first: 2, .. }));
    }

    #[test]
    fn test_connectivity_round_trip() {
        let dir = tempdir().unwrap();
        let mut fam = mesh_family(dir.path());
        fam.define_nodes(0, "node", 3, 8, &[0.5; 18]).unwrap();
        let nodes: Vec<usize> = (1..=8).collect();
        fam.define_connectivity(0, "brick", 1, 1, &nodes, &[2], &[1])
            .unwrap();
        let conn = fam.load_connectivity(0, "brick").unwrap();
        assert_eq!(conn.qty(), 1);
        assert_eq!(conn.nodes, nodes);
        assert_eq!(conn.materials, vec![2]);
    }

    #[test]
    fn test_labels() {
        let dir = tempdir().unwrap();
        let mut fam = mesh_family(dir.path());
        assert_eq!(fam.read_labels(0, "node").unwrap(), None);
        fam.write_labels(0, "node", &[101, 205]).unwrap();
        assert_eq!(fam.read_labels(0, "node").unwrap(), Some(vec![101, 205]));
        assert!(fam.has_param("Node Labels[0:node]"));
        assert!(matches!(
            fam.write_labels(0, "node", &[1]),
            Err(MiliError::ArrayShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_svar_definition_rules() {
        let dir = tempdir().unwrap();
        let mut fam = mesh_family(dir.path());
        let vel = StateVariable::new(
            "vel",
            "Velocity",
            NumType::Float4,
            Aggregation::Vector {
                components: vec!["vx".into(), "vy".into()],
            },
        )
        .unwrap();
        assert!(matches!(
            fam.define_svar(vel.clone()),
            Err(MiliError::SvarNotFound(_))
        ));
        fam.define_svar(StateVariable::scalar("vx", "X velocity", NumType::Float4))
            .unwrap();
        fam.define_svar(StateVariable::scalar("vy", "Y velocity", NumType::Float4))
            .unwrap();
        fam.define_svar(vel.clone()).unwrap();
        fam.define_svar(vel).unwrap();
        assert!(matches!(
            fam.define_svar(StateVariable::scalar("vx", "Other", NumType::Float8)),
            Err(MiliError::EntryExists(_))
        ));
    }

    #[test]
    fn test_state_write_and_subrecord_read() {
        let dir = tempdir().unwrap();
        let mut fam = mesh_family(dir.path());
        fam.define_svar(StateVariable::scalar("temp", "Temperature", NumType::Float4))
            .unwrap();
        let srec = fam.open_srec(0).unwrap();
        let blocks = BlockList::from_ranges(&[(1, 2)]).unwrap();
        fam.define_subrecord(srec, "nodal", "node", Organization::ObjectOrdered, &["temp"], blocks)
            .unwrap();
        assert!(matches!(
            fam.write_state(srec, 0.0, &f32s_to_bytes(&[0.0, 0.0])),
            Err(MiliError::SrecOpen(_))
        ));
        fam.close_srec(srec).unwrap();
        assert!(matches!(
            fam.define_subrecord(
                srec,
                "late",
                "node",
                Organization::ResultOrdered,
                &["temp"],
                BlockList::from_ranges(&[(1, 1)]).unwrap()
            ),
            Err(MiliError::SrecClosed(_))
        ));

        for step in 0..3 {
            let t = step as f32;
            fam.write_state(srec, t as f64 * 0.1, &f32s_to_bytes(&[t, t + 0.5]))
                .unwrap();
        }
        assert!(matches!(
            fam.write_state(srec, 1.0, &[0u8; 3]),
            Err(MiliError::ArrayShapeMismatch { .. })
        ));
        fam.close().unwrap();

        let mut fam = Family::open(dir.path(), "unit", AccessMode::Read).unwrap();
        assert_eq!(fam.state_qty(), 3);
        assert_eq!(bytes_to_f32s(fam.read_subrecord(2, 0).unwrap()), vec![2.0, 2.5]);
        assert_eq!(bytes_to_f32s(fam.read_subrecord(2, 0).unwrap()), vec![2.0, 2.5]);
        let stats = fam.buffer_stats(srec, 0).unwrap();
        assert_eq!((stats.hits, stats.misses), (1, 1));

        fam.set_buffer_qty(0, Some("node"), 3).unwrap();
        assert_eq!(fam.buffer_stats(srec, 0).unwrap().buffers, 3);
        assert!(matches!(
            fam.read_subrecord(3, 0),
            Err(MiliError::InvalidStateIndex { index: 3, .. })
        ));
    }
}
