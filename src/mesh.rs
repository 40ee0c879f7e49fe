//! Meshes and mesh-object classes

use crate::blocks::BlockList;
use crate::error::{MiliError, Result};
use serde::{Deserialize, Serialize};

/// Family of object classes sharing a topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Superclass {
    Unit,
    Node,
    Truss,
    Beam,
    Tri,
    Quad,
    Tet,
    Pyramid,
    Wedge,
    Hex,
    Material,
    Mesh,
    Surface,
}

impl Superclass {
    /// Singleton classes numbered the same on every processor
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            Superclass::Mesh | Superclass::Material | Superclass::Unit | Superclass::Surface
        )
    }

    /// Nodes per element for element superclasses
    pub fn conn_qty(&self) -> Option<usize> {
        match self {
            Superclass::Truss => Some(2),
            Superclass::Beam => Some(3),
            Superclass::Tri => Some(3),
            Superclass::Quad => Some(4),
            Superclass::Tet => Some(4),
            Superclass::Pyramid => Some(5),
            Superclass::Wedge => Some(6),
            Superclass::Hex => Some(8),
            Superclass::Unit
            | Superclass::Node
            | Superclass::Material
            | Superclass::Mesh
            | Superclass::Surface => None,
        }
    }

    pub fn is_element(&self) -> bool {
        self.conn_qty().is_some()
    }

    /// Reserved parameter prefix under which this superclass stores labels
    pub fn label_prefix(&self) -> Option<&'static str> {
        if *self == Superclass::Node {
            Some(crate::NODE_LABELS)
        } else if self.is_element() {
            Some(crate::ELEMENT_LABELS)
        } else {
            None
        }
    }
}

/// Objects of one named class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshObjectClass {
    pub superclass: Superclass,
    pub short_name: String,
    pub long_name: String,
    pub blocks: BlockList,
}

impl MeshObjectClass {
    pub fn new(superclass: Superclass, short_name: &str, long_name: &str) -> Self {
        MeshObjectClass {
            superclass,
            short_name: short_name.to_string(),
            long_name: long_name.to_string(),
            blocks: BlockList::new(),
        }
    }

    pub fn qty(&self) -> usize {
        self.blocks.qty()
    }
}

/// An unstructured mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub id: usize,
    pub name: String,
    pub dimension: usize,
    pub classes: Vec<MeshObjectClass>,
}

impl Mesh {
    pub fn new(id: usize, name: &str, dimension: usize) -> Self {
        Mesh {
            id,
            name: name.to_string(),
            dimension,
            classes: Vec::new(),
        }
    }

    pub fn class(&self, short_name: &str) -> Option<&MeshObjectClass> {
        self.classes.iter().find(|c| c.short_name == short_name)
    }

    pub fn class_mut(&mut self, short_name: &str) -> Result<&mut MeshObjectClass> {
        let mesh = self.id;
        self.classes
            .iter_mut()
            .find(|c| c.short_name == short_name)
            .ok_or_else(|| MiliError::ClassNotFound {
                mesh,
                class: short_name.to_string(),
            })
    }

    pub fn require_class(&self, short_name: &str) -> Result<&MeshObjectClass> {
        self.class(short_name).ok_or_else(|| MiliError::ClassNotFound {
            mesh: self.id,
            class: short_name.to_string(),
        })
    }

    /// Classes of one superclass, in definition order
    pub fn classes_of(&self, superclass: Superclass) -> impl Iterator<Item = &MeshObjectClass> {
        self.classes
            .iter()
            .filter(move |c| c.superclass == superclass)
    }

    /// The class element connectivity refers to
    pub fn node_class(&self) -> Option<&MeshObjectClass> {
        self.classes_of(Superclass::Node).next()
    }

    pub fn add_class(&mut self, class: MeshObjectClass) -> Result<()> {
        if self.class(&class.short_name).is_some() {
            return Err(MiliError::EntryExists(format!(
                "class {} in mesh {}",
                class.short_name, self.name
            )));
        }
        self.classes.push(class);
        Ok(())
    }
}
