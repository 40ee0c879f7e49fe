//! Directory and parameter store
//!
//! Every named entry in a family's non-state file (parameters, labels,
//! geometry arrays) is described by a [`DirEntry`]: its type, shape and the
//! byte range holding its data. The [`Directory`] owns the entry list, a hash
//! index by name and the next free byte offset. Data is read and written
//! through a [`ByteStore`].
//!
//! Re-writing an existing name keeps its byte range, so the new value must
//! have the same type and size. New names are appended at the first free
//! byte past the directory blob the header currently points at.

use crate::error::{MiliError, Result};
use crate::io::ByteStore;
use crate::numeric::{
    bytes_to_f32s, bytes_to_f64s, bytes_to_i32s, bytes_to_i64s, f32s_to_bytes, f64s_to_bytes,
    i32s_to_bytes, i64s_to_bytes, NumType,
};
use ahash::AHashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Who owns a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Library bookkeeping (identity strings, format data)
    Mili,
    /// Application parameters
    Application,
    /// Time-invariant data such as labels and global counts
    Ti,
    /// Node coordinates and connectivity
    Geometry,
}

/// Stored type of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Numeric(NumType),
    String,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Numeric(t) => write!(f, "{}", t),
            ValueType::String => f.write_str("String"),
        }
    }
}

/// A single numeric parameter value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
}

impl Scalar {
    pub fn num_type(&self) -> NumType {
        match self {
            Scalar::Int4(_) => NumType::Int4,
            Scalar::Int8(_) => NumType::Int8,
            Scalar::Float4(_) => NumType::Float4,
            Scalar::Float8(_) => NumType::Float8,
        }
    }

    fn to_bytes(self) -> Vec<u8> {
        match self {
            Scalar::Int4(v) => v.to_le_bytes().to_vec(),
            Scalar::Int8(v) => v.to_le_bytes().to_vec(),
            Scalar::Float4(v) => v.to_le_bytes().to_vec(),
            Scalar::Float8(v) => v.to_le_bytes().to_vec(),
        }
    }

    fn from_bytes(num_type: NumType, bytes: &[u8]) -> Result<Self> {
        let data = ArrayData::from_bytes(num_type, bytes)?;
        let scalar = match data {
            ArrayData::Int4(v) => v.first().copied().map(Scalar::Int4),
            ArrayData::Int8(v) => v.first().copied().map(Scalar::Int8),
            ArrayData::Float4(v) => v.first().copied().map(Scalar::Float4),
            ArrayData::Float8(v) => v.first().copied().map(Scalar::Float8),
        };
        scalar.ok_or(MiliError::ShortRead {
            expected: num_type.atom_size(),
            actual: bytes.len(),
        })
    }

    /// Value widened to `i64`, for integer parameters
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Scalar::Int4(v) => Some(v as i64),
            Scalar::Int8(v) => Some(v),
            Scalar::Float4(_) | Scalar::Float8(_) => None,
        }
    }

    /// Value widened to `f64`
    pub fn as_f64(&self) -> f64 {
        match *self {
            Scalar::Int4(v) => v as f64,
            Scalar::Int8(v) => v as f64,
            Scalar::Float4(v) => v as f64,
            Scalar::Float8(v) => v,
        }
    }
}

/// Typed contents of a parameter array
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Int4(Vec<i32>),
    Int8(Vec<i64>),
    Float4(Vec<f32>),
    Float8(Vec<f64>),
}

impl ArrayData {
    pub fn num_type(&self) -> NumType {
        match self {
            ArrayData::Int4(_) => NumType::Int4,
            ArrayData::Int8(_) => NumType::Int8,
            ArrayData::Float4(_) => NumType::Float4,
            ArrayData::Float8(_) => NumType::Float8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Int4(v) => v.len(),
            ArrayData::Int8(v) => v.len(),
            ArrayData::Float4(v) => v.len(),
            ArrayData::Float8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ArrayData::Int4(v) => i32s_to_bytes(v),
            ArrayData::Int8(v) => i64s_to_bytes(v),
            ArrayData::Float4(v) => f32s_to_bytes(v),
            ArrayData::Float8(v) => f64s_to_bytes(v),
        }
    }

    pub fn from_bytes(num_type: NumType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % num_type.atom_size() != 0 {
            return Err(MiliError::Corrupted(format!(
                "{} bytes is not a whole number of {} values",
                bytes.len(),
                num_type
            )));
        }
        Ok(match num_type {
            NumType::Int4 => ArrayData::Int4(bytes_to_i32s(bytes)),
            NumType::Int8 => ArrayData::Int8(bytes_to_i64s(bytes)),
            NumType::Float4 => ArrayData::Float4(bytes_to_f32s(bytes)),
            NumType::Float8 => ArrayData::Float8(bytes_to_f64s(bytes)),
        })
    }

    /// Values widened to `f64`
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            ArrayData::Int4(v) => v.iter().map(|&x| x as f64).collect(),
            ArrayData::Int8(v) => v.iter().map(|&x| x as f64).collect(),
            ArrayData::Float4(v) => v.iter().map(|&x| x as f64).collect(),
            ArrayData::Float8(v) => v.clone(),
        }
    }

    /// Integer values widened to `i64`
    pub fn to_i64(&self) -> Option<Vec<i64>> {
        match self {
            ArrayData::Int4(v) => Some(v.iter().map(|&x| x as i64).collect()),
            ArrayData::Int8(v) => Some(v.clone()),
            ArrayData::Float4(_) | ArrayData::Float8(_) => None,
        }
    }
}

/// A parameter array with its shape
#[derive(Debug, Clone, PartialEq)]
pub struct ParamArray {
    pub dims: Vec<usize>,
    pub data: ArrayData,
}

impl ParamArray {
    pub fn new(dims: Vec<usize>, data: ArrayData) -> Self {
        ParamArray { dims, data }
    }

    /// One-dimensional array
    pub fn vector(data: ArrayData) -> Self {
        ParamArray {
            dims: vec![data.len()],
            data,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

/// Any value a directory entry can hold
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Scalar(Scalar),
    String(String),
    Array(ParamArray),
}

/// Directory entry describing one named value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub value_type: ValueType,
    /// Empty for scalars and strings
    pub dims: Vec<usize>,
    pub offset: u64,
    pub length: u64,
}

impl DirEntry {
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty() && matches!(self.value_type, ValueType::Numeric(_))
    }
}

/// Named-entry directory of a family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
    entries: Vec<DirEntry>,
    next_free: u64,
    #[serde(skip)]
    index: AHashMap<String, usize>,
    /// Bytes of the directory blob the header currently points at
    #[serde(skip)]
    reserved: Option<Range<u64>>,
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| MiliError::MalformedControlString(format!("{}: {}", pattern, e)))
}

impl Directory {
    /// Create an empty directory whose data region starts at `data_start`
    pub fn new(data_start: u64) -> Self {
        Directory {
            entries: Vec::new(),
            next_free: data_start,
            index: AHashMap::new(),
            reserved: None,
        }
    }

    /// Keep new entry data out of `range` until the next [`Directory::reserve`]
    pub fn reserve(&mut self, range: Range<u64>) {
        self.reserved = Some(range);
    }

    /// First offset at or past `next_free` where `len` bytes miss the reserved range
    pub fn placement(&self, len: u64) -> u64 {
        let offset = self.next_free;
        match &self.reserved {
            Some(r) if offset < r.end && offset + len > r.start => r.end,
            _ => offset,
        }
    }

    /// Rebuild the name index after deserialization
    pub fn rebuild_index(&mut self) -> Result<()> {
        self.index.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            if self.index.insert(entry.name.clone(), i).is_some() {
                return Err(MiliError::Corrupted(format!(
                    "duplicate directory entry {}",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    /// First byte past all entry data
    pub fn next_free(&self) -> u64 {
        self.next_free
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Entries in definition order
    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter()
    }

    /// Names matching a `*`/`?` wildcard pattern, in definition order
    pub fn names_matching(&self, pattern: &str) -> Result<Vec<&str>> {
        let re = glob_to_regex(pattern)?;
        Ok(self
            .entries
            .iter()
            .map(|e| e.name.as_str())
            .filter(|n| re.is_match(n))
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<&DirEntry> {
        self.get(name)
            .ok_or_else(|| MiliError::EntryNotFound(name.to_string()))
    }

    fn write_entry<S: ByteStore>(
        &mut self,
        store: &mut S,
        kind: EntryKind,
        name: &str,
        value_type: ValueType,
        dims: Vec<usize>,
        bytes: &[u8],
    ) -> Result<()> {
        if let Some(&i) = self.index.get(name) {
            let entry = &self.entries[i];
            if entry.value_type != value_type {
                return Err(MiliError::TypeMismatch {
                    name: name.to_string(),
                    stored: entry.value_type.to_string(),
                    requested: value_type.to_string(),
                });
            }
            if entry.length != bytes.len() as u64 {
                return Err(match value_type {
                    ValueType::String => MiliError::StringLengthMismatch {
                        name: name.to_string(),
                        stored: entry.length as usize,
                        requested: bytes.len(),
                    },
                    ValueType::Numeric(t) => MiliError::ArrayShapeMismatch {
                        name: name.to_string(),
                        stored: entry.length as usize / t.atom_size(),
                        requested: bytes.len() / t.atom_size(),
                    },
                });
            }
            let offset = entry.offset;
            store.write_at(offset, bytes)?;
            self.entries[i].dims = dims;
            return Ok(());
        }

        let offset = self.placement(bytes.len() as u64);
        store.write_at(offset, bytes)?;
        self.entries.push(DirEntry {
            name: name.to_string(),
            kind,
            value_type,
            dims,
            offset,
            length: bytes.len() as u64,
        });
        self.index.insert(name.to_string(), self.entries.len() - 1);
        self.next_free = offset + bytes.len() as u64;
        Ok(())
    }

    fn read_bytes<S: ByteStore>(&self, store: &mut S, entry: &DirEntry) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; entry.length as usize];
        store.read_at(entry.offset, &mut buf)?;
        Ok(buf)
    }

    pub fn write_scalar<S: ByteStore>(
        &mut self,
        store: &mut S,
        kind: EntryKind,
        name: &str,
        value: Scalar,
    ) -> Result<()> {
        self.write_entry(
            store,
            kind,
            name,
            ValueType::Numeric(value.num_type()),
            Vec::new(),
            &value.to_bytes(),
        )
    }

    pub fn read_scalar<S: ByteStore>(&self, store: &mut S, name: &str) -> Result<Scalar> {
        let entry = self.lookup(name)?;
        let ValueType::Numeric(num_type) = entry.value_type else {
            return Err(MiliError::TypeMismatch {
                name: name.to_string(),
                stored: entry.value_type.to_string(),
                requested: "scalar".to_string(),
            });
        };
        let bytes = self.read_bytes(store, entry)?;
        Scalar::from_bytes(num_type, &bytes)
    }

    pub fn write_string<S: ByteStore>(
        &mut self,
        store: &mut S,
        kind: EntryKind,
        name: &str,
        value: &str,
    ) -> Result<()> {
        self.write_entry(
            store,
            kind,
            name,
            ValueType::String,
            Vec::new(),
            value.as_bytes(),
        )
    }

    pub fn read_string<S: ByteStore>(&self, store: &mut S, name: &str) -> Result<String> {
        let entry = self.lookup(name)?;
        if entry.value_type != ValueType::String {
            return Err(MiliError::NotAString(name.to_string()));
        }
        let bytes = self.read_bytes(store, entry)?;
        String::from_utf8(bytes)
            .map_err(|e| MiliError::Corrupted(format!("string {} is not UTF-8: {}", name, e)))
    }

    pub fn write_array<S: ByteStore>(
        &mut self,
        store: &mut S,
        kind: EntryKind,
        name: &str,
        array: &ParamArray,
    ) -> Result<()> {
        let expected: usize = array.dims.iter().product();
        if expected != array.data.len() {
            return Err(MiliError::ArrayShapeMismatch {
                name: name.to_string(),
                stored: expected,
                requested: array.data.len(),
            });
        }
        self.write_entry(
            store,
            kind,
            name,
            ValueType::Numeric(array.data.num_type()),
            array.dims.clone(),
            &array.data.to_bytes(),
        )
    }

    pub fn read_array<S: ByteStore>(&self, store: &mut S, name: &str) -> Result<ParamArray> {
        let entry = self.lookup(name)?;
        let ValueType::Numeric(num_type) = entry.value_type else {
            return Err(MiliError::TypeMismatch {
                name: name.to_string(),
                stored: entry.value_type.to_string(),
                requested: "array".to_string(),
            });
        };
        let bytes = self.read_bytes(store, entry)?;
        let data = ArrayData::from_bytes(num_type, &bytes)?;
        let dims = if entry.dims.is_empty() {
            vec![data.len()]
        } else {
            entry.dims.clone()
        };
        Ok(ParamArray { dims, data })
    }

    /// Read an entry whatever its shape
    pub fn read_value<S: ByteStore>(&self, store: &mut S, name: &str) -> Result<ParamValue> {
        let entry = self.lookup(name)?;
        if entry.value_type == ValueType::String {
            self.read_string(store, name).map(ParamValue::String)
        } else if entry.is_scalar() {
            self.read_scalar(store, name).map(ParamValue::Scalar)
        } else {
            self.read_array(store, name).map(ParamValue::Array)
        }
    }

    pub fn write_value<S: ByteStore>(
        &mut self,
        store: &mut S,
        kind: EntryKind,
        name: &str,
        value: &ParamValue,
    ) -> Result<()> {
        match value {
            ParamValue::Scalar(v) => self.write_scalar(store, kind, name, *v),
            ParamValue::String(v) => self.write_string(store, kind, name, v),
            ParamValue::Array(v) => self.write_array(store, kind, name, v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemStore;

    fn setup() -> (Directory, MemStore) {
        (Directory::new(64), MemStore::default())
    }

    #[test]
    fn test_scalar_round_trip() {
        let (mut dir, mut store) = setup();
        dir.write_scalar(&mut store, EntryKind::Application, "nproc", Scalar::Int4(8))
            .unwrap();
        assert_eq!(dir.read_scalar(&mut store, "nproc").unwrap(), Scalar::Int4(8));
        assert_eq!(dir.get("nproc").unwrap().offset, 64);
        assert_eq!(dir.next_free(), 68);
    }

    #[test]
    fn test_rewrite_in_place() {
        let (mut dir, mut store) = setup();
        dir.write_scalar(&mut store, EntryKind::Application, "dt", Scalar::Float8(0.1))
            .unwrap();
        dir.write_scalar(&mut store, EntryKind::Application, "dt", Scalar::Float8(0.2))
            .unwrap();
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.next_free(), 72);
        assert_eq!(dir.read_scalar(&mut store, "dt").unwrap(), Scalar::Float8(0.2));
    }

    #[test]
    fn test_new_entries_skip_reserved_range() {
        let (mut dir, mut store) = setup();
        dir.reserve(64..80);
        assert_eq!(dir.placement(16), 80);
        dir.write_scalar(&mut store, EntryKind::Application, "nproc", Scalar::Int4(8))
            .unwrap();
        assert_eq!(dir.get("nproc").unwrap().offset, 80);
        assert_eq!(dir.next_free(), 84);

        dir.reserve(100..120);
        assert_eq!(dir.placement(16), 84);
        assert_eq!(dir.placement(17), 120);
    }

    #[test]
    fn test_rewrite_type_mismatch() {
        let (mut dir, mut store) = setup();
        dir.write_scalar(&mut store, EntryKind::Application, "dt", Scalar::Float4(0.1))
            .unwrap();
        let err = dir
            .write_scalar(&mut store, EntryKind::Application, "dt", Scalar::Int4(1))
            .unwrap_err();
        assert!(matches!(err, MiliError::TypeMismatch { .. }));
        assert_eq!(dir.read_scalar(&mut store, "dt").unwrap(), Scalar::Float4(0.1));
    }

    #[test]
    fn test_string_rules() {
        let (mut dir, mut store) = setup();
        dir.write_string(&mut store, EntryKind::Mili, "title", "impact")
            .unwrap();
        assert_eq!(dir.read_string(&mut store, "title").unwrap(), "impact");

        dir.write_string(&mut store, EntryKind::Mili, "title", "crash!")
            .unwrap();
        assert_eq!(dir.read_string(&mut store, "title").unwrap(), "crash!");

        let err = dir
            .write_string(&mut store, EntryKind::Mili, "title", "longer title")
            .unwrap_err();
        assert!(matches!(err, MiliError::StringLengthMismatch { stored: 6, .. }));

        dir.write_scalar(&mut store, EntryKind::Application, "n", Scalar::Int8(3))
            .unwrap();
        assert!(matches!(
            dir.read_string(&mut store, "n"),
            Err(MiliError::NotAString(_))
        ));
        assert!(matches!(
            dir.read_string(&mut store, "missing"),
            Err(MiliError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_array_round_trip() {
        let (mut dir, mut store) = setup();
        let array = ParamArray::new(vec![2, 3], ArrayData::Float4(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        dir.write_array(&mut store, EntryKind::Ti, "coords", &array)
            .unwrap();
        let back = dir.read_array(&mut store, "coords").unwrap();
        assert_eq!(back, array);
        assert_eq!(back.rank(), 2);

        let bad = ParamArray::new(vec![4], ArrayData::Int4(vec![1, 2]));
        assert!(matches!(
            dir.write_array(&mut store, EntryKind::Ti, "bad", &bad),
            Err(MiliError::ArrayShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_value_copy_between_directories() {
        let (mut src, mut src_store) = setup();
        let (mut dst, mut dst_store) = setup();
        src.write_string(&mut src_store, EntryKind::Application, "code", "dyna")
            .unwrap();
        src.write_array(
            &mut src_store,
            EntryKind::Ti,
            "mat ids",
            &ParamArray::vector(ArrayData::Int8(vec![4, 5])),
        )
        .unwrap();

        for entry in src.entries().cloned().collect::<Vec<_>>() {
            let value = src.read_value(&mut src_store, &entry.name).unwrap();
            dst.write_value(&mut dst_store, entry.kind, &entry.name, &value)
                .unwrap();
        }
        assert_eq!(dst.read_string(&mut dst_store, "code").unwrap(), "dyna");
        assert_eq!(
            dst.read_value(&mut dst_store, "mat ids").unwrap(),
            ParamValue::Array(ParamArray::vector(ArrayData::Int8(vec![4, 5])))
        );
        assert_eq!(dst.get("mat ids").unwrap().kind, EntryKind::Ti);
    }

    #[test]
    fn test_wildcard_search() {
        let (mut dir, mut store) = setup();
        for name in ["origin host name", "origin date", "title", "origin"] {
            dir.write_string(&mut store, EntryKind::Mili, name, "x").unwrap();
        }
        assert_eq!(
            dir.names_matching("origin *").unwrap(),
            vec!["origin host name", "origin date"]
        );
        assert_eq!(dir.names_matching("t?tle").unwrap(), vec!["title"]);
    }

    #[test]
    fn test_rebuild_index() {
        let (mut dir, mut store) = setup();
        dir.write_scalar(&mut store, EntryKind::Application, "a", Scalar::Int4(1))
            .unwrap();
        let json = serde_json::to_string(&dir).unwrap();
        let mut back: Directory = serde_json::from_str(&json).unwrap();
        assert!(back.get("a").is_none());
        back.rebuild_index().unwrap();
        assert_eq!(back.read_scalar(&mut store, "a").unwrap(), Scalar::Int4(1));
    }
}
