//! Object layouts for archived types
//!
//! A layout describes where references and native pointers sit inside an
//! object, which is what the map builder and both loaders need to know about
//! the type system.

use crate::object::{align_up, HEADER_SIZE, WORD_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of an instance field
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Plain 8-byte value, never relocated
    Scalar,
    /// Object reference, `ref_size` bytes wide
    Reference,
    /// 8-byte native (non-heap) pointer, rebased by the image delta
    Native,
}

impl FieldKind {
    /// Encoded tag used in the archive type table
    pub fn tag(self) -> u8 {
        match self {
            FieldKind::Scalar => 0,
            FieldKind::Reference => 1,
            FieldKind::Native => 2,
        }
    }

    /// Decode a type table tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FieldKind::Scalar),
            1 => Some(FieldKind::Reference),
            2 => Some(FieldKind::Native),
            _ => None,
        }
    }
}

/// Shape of an object as seen by the allocator
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Structured object with declared fields
    Instance,
    /// Array of scalar elements
    ScalarArray,
    /// Array of references
    ReferenceArray,
}

/// Kind of an archived type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    /// Structured object; fields are laid out in declaration order
    Instance {
        /// Field kinds in declaration order
        fields: Vec<FieldKind>,
    },
    /// Array of 1, 2, 4 or 8 byte scalars
    ScalarArray {
        /// Element size in bytes
        element_size: u8,
    },
    /// Array of references
    ReferenceArray,
}

impl TypeKind {
    /// Allocation shape of objects of this kind
    pub fn object_kind(&self) -> ObjectKind {
        match self {
            TypeKind::Instance { .. } => ObjectKind::Instance,
            TypeKind::ScalarArray { .. } => ObjectKind::ScalarArray,
            TypeKind::ReferenceArray => ObjectKind::ReferenceArray,
        }
    }
}

/// Byte offsets of the fields of an instance type for one reference width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    offsets: Vec<usize>,
    size: usize,
}

impl InstanceLayout {
    /// Lay out `fields` after the header
    ///
    /// Scalar and native fields take a word and are word aligned; references
    /// take `ref_size` bytes and are aligned to `ref_size`, so two narrow
    /// references can share a word.
    pub fn compute(fields: &[FieldKind], ref_size: usize) -> Self {
        let mut offset = HEADER_SIZE;
        let mut offsets = Vec::with_capacity(fields.len());
        for kind in fields {
            let width = match kind {
                FieldKind::Reference => ref_size,
                FieldKind::Scalar | FieldKind::Native => WORD_SIZE,
            };
            offset = align_up(offset, width);
            offsets.push(offset);
            offset += width;
        }
        Self {
            offsets,
            size: align_up(offset, WORD_SIZE),
        }
    }

    /// Byte offset of each field, in declaration order
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Object size in bytes, header included
    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Display for InstanceLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes, fields at {:?}", self.size, self.offsets)
    }
}
