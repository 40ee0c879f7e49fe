//! Numeric types, precision and little-endian atom codecs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric type of a parameter or state variable atom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumType {
    Int4,
    Int8,
    Float4,
    Float8,
}

impl NumType {
    /// Byte width of one atom
    pub fn atom_size(&self) -> usize {
        match self {
            NumType::Int4 | NumType::Float4 => 4,
            NumType::Int8 | NumType::Float8 => 8,
        }
    }

    /// Precision weight: 1 for single-width types, 2 for double-width
    pub fn iprec(&self) -> usize {
        self.atom_size() / 4
    }

    pub fn is_float(&self) -> bool {
        matches!(self, NumType::Float4 | NumType::Float8)
    }

    /// Float type matching a family precision
    pub fn float_for(precision: Precision) -> Self {
        match precision {
            Precision::Single => NumType::Float4,
            Precision::Double => NumType::Float8,
        }
    }
}

impl fmt::Display for NumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NumType::Int4 => "Int4",
            NumType::Int8 => "Int8",
            NumType::Float4 => "Float4",
            NumType::Float8 => "Float8",
        };
        f.write_str(name)
    }
}

/// Floating-point precision of a family's geometry
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    Single = 1,
    Double = 2,
}

impl Precision {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Precision::Single),
            2 => Some(Precision::Double),
            _ => None,
        }
    }
}

pub fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn f64s_to_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i32s_to_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i64s_to_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn bytes_to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn bytes_to_f64s(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

pub fn bytes_to_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn bytes_to_i64s(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

/// Copy `src` into `dst` one atom at a time
///
/// Both slices must have the same length, a multiple of `atom_size`.
pub fn copy_atoms(dst: &mut [u8], src: &[u8], atom_size: usize) {
    debug_assert_eq!(dst.len(), src.len());
    debug_assert_eq!(src.len() % atom_size, 0);
    for (d, s) in dst
        .chunks_exact_mut(atom_size)
        .zip(src.chunks_exact(atom_size))
    {
        d.copy_from_slice(s);
    }
}
