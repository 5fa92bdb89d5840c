//! Type system for archived objects
//!
//! Provides the layouts and the registry the dump and load passes consult to
//! size objects and find their reference and native-pointer fields.

mod layout;
mod registry;

pub use layout::{FieldKind, InstanceLayout, ObjectKind, TypeKind};
pub use registry::{TypeIndex, TypeInfo, TypeRegistry, TypeRegistryBuilder, ROOT_ARRAY_TYPE};
