//! State variable definitions

use crate::error::{MiliError, Result};
use crate::numeric::NumType;
use serde::{Deserialize, Serialize};

/// Per-object data shape of a state variable
///
/// Array dimensions are row-major: the last index varies fastest. A
/// `VecArray` stores one full vector per array cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregation {
    Scalar,
    Array { dims: Vec<usize> },
    Vector { components: Vec<String> },
    VecArray { dims: Vec<usize>, components: Vec<String> },
}

impl Aggregation {
    /// Number of atoms one object contributes
    pub fn atoms_per_object(&self) -> usize {
        match self {
            Aggregation::Scalar => 1,
            Aggregation::Array { dims } => dims.iter().product(),
            Aggregation::Vector { components } => components.len(),
            Aggregation::VecArray { dims, components } => {
                dims.iter().product::<usize>() * components.len()
            }
        }
    }

    /// Component svar names for vector shapes
    pub fn components(&self) -> &[String] {
        match self {
            Aggregation::Vector { components } | Aggregation::VecArray { components, .. } => {
                components
            }
            Aggregation::Scalar | Aggregation::Array { .. } => &[],
        }
    }

    pub fn dims(&self) -> &[usize] {
        match self {
            Aggregation::Array { dims } | Aggregation::VecArray { dims, .. } => dims,
            Aggregation::Scalar | Aggregation::Vector { .. } => &[],
        }
    }

    /// Vector length, zero for non-vector shapes
    pub fn list_size(&self) -> usize {
        self.components().len()
    }

    fn validate(&self, name: &str) -> Result<()> {
        let bad = |why: &str| Err(MiliError::InvalidAggregation(format!("{}: {}", name, why)));
        match self {
            Aggregation::Scalar => Ok(()),
            Aggregation::Array { dims } if dims.is_empty() || dims.contains(&0) => {
                bad("array dimensions must be non-empty and non-zero")
            }
            Aggregation::Vector { components } if components.is_empty() => {
                bad("vector needs at least one component")
            }
            Aggregation::VecArray { dims, components }
                if dims.is_empty() || dims.contains(&0) || components.is_empty() =>
            {
                bad("vector array needs dimensions and components")
            }
            _ => Ok(()),
        }
    }
}

/// A named result quantity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVariable {
    pub name: String,
    pub title: String,
    pub num_type: NumType,
    pub aggregation: Aggregation,
}

impl StateVariable {
    pub fn new(
        name: impl Into<String>,
        title: impl Into<String>,
        num_type: NumType,
        aggregation: Aggregation,
    ) -> Result<Self> {
        let name = name.into();
        aggregation.validate(&name)?;
        Ok(StateVariable {
            name,
            title: title.into(),
            num_type,
            aggregation,
        })
    }

    pub fn scalar(name: impl Into<String>, title: impl Into<String>, num_type: NumType) -> Self {
        StateVariable {
            name: name.into(),
            title: title.into(),
            num_type,
            aggregation: Aggregation::Scalar,
        }
    }

    pub fn atoms_per_object(&self) -> usize {
        self.aggregation.atoms_per_object()
    }

    pub fn atom_size(&self) -> usize {
        self.num_type.atom_size()
    }

    /// Byte width of one object's slice of this svar
    pub fn bytes_per_object(&self) -> usize {
        self.atoms_per_object() * self.atom_size()
    }
}
