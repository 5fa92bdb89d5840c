//! Type registry for archived objects
//!
//! The registry maps a [`TypeIndex`] (stored in every object header) to the
//! [`TypeInfo`] needed to size an object and to enumerate its reference and
//! native-pointer fields. An archive embeds its registry so the file is
//! self-describing.

use super::layout::{FieldKind, InstanceLayout, ObjectKind, TypeKind};
use crate::archive::read_u32;
use crate::object::{align_up, HEADER_SIZE, WORD_SIZE};
use crate::{ArchiveError, ArchiveResult};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Index of a type in the registry
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeIndex(u32);

impl TypeIndex {
    /// Create a type index
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the index as a u32
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Type of the root array every archive carries (always index 0)
pub const ROOT_ARRAY_TYPE: TypeIndex = TypeIndex(0);

/// Runtime type information for archived objects
#[derive(Debug, Clone)]
pub struct TypeInfo {
    /// Type index
    pub index: TypeIndex,

    /// Type name (for diagnostics)
    pub name: String,

    /// Kind and field description
    pub kind: TypeKind,

    narrow_layout: Option<InstanceLayout>,
    wide_layout: Option<InstanceLayout>,
}

impl TypeInfo {
    fn new(index: TypeIndex, name: String, kind: TypeKind) -> Self {
        let (narrow_layout, wide_layout) = match &kind {
            TypeKind::Instance { fields } => (
                Some(InstanceLayout::compute(fields, 4)),
                Some(InstanceLayout::compute(fields, 8)),
            ),
            _ => (None, None),
        };
        Self {
            index,
            name,
            kind,
            narrow_layout,
            wide_layout,
        }
    }

    /// Allocation shape of objects of this type
    pub fn object_kind(&self) -> ObjectKind {
        self.kind.object_kind()
    }

    /// Field layout for instances, for the given reference width
    pub fn instance_layout(&self, ref_size: usize) -> Option<&InstanceLayout> {
        if ref_size == 4 {
            self.narrow_layout.as_ref()
        } else {
            self.wide_layout.as_ref()
        }
    }

    /// Declared fields for instances (empty for arrays)
    pub fn fields(&self) -> &[FieldKind] {
        match &self.kind {
            TypeKind::Instance { fields } => fields,
            _ => &[],
        }
    }

    /// Size in bytes of an object of this type with `length` in its header
    pub fn object_size(&self, length: u32, ref_size: usize) -> usize {
        let length = length as usize;
        match &self.kind {
            TypeKind::Instance { .. } => self
                .instance_layout(ref_size)
                .map(InstanceLayout::size)
                .unwrap_or(HEADER_SIZE),
            TypeKind::ScalarArray { element_size } => {
                align_up(HEADER_SIZE + length * (*element_size as usize), WORD_SIZE)
            }
            TypeKind::ReferenceArray => align_up(HEADER_SIZE + length * ref_size, WORD_SIZE),
        }
    }

    /// Check a header length against this type
    ///
    /// Instances must carry their declared field count.
    pub fn accepts_length(&self, length: u32) -> bool {
        match &self.kind {
            TypeKind::Instance { fields } => fields.len() == length as usize,
            _ => true,
        }
    }

    /// Call `f` with the byte offset of every reference field
    pub fn for_each_reference_offset<F>(&self, length: u32, ref_size: usize, mut f: F)
    where
        F: FnMut(usize),
    {
        match &self.kind {
            TypeKind::Instance { fields } => {
                if let Some(layout) = self.instance_layout(ref_size) {
                    for (kind, &offset) in fields.iter().zip(layout.offsets()) {
                        if *kind == FieldKind::Reference {
                            f(offset);
                        }
                    }
                }
            }
            TypeKind::ReferenceArray => {
                for i in 0..length as usize {
                    f(HEADER_SIZE + i * ref_size);
                }
            }
            TypeKind::ScalarArray { .. } => {}
        }
    }

    /// Call `f` with the byte offset of every native pointer field
    pub fn for_each_native_offset<F>(&self, ref_size: usize, mut f: F)
    where
        F: FnMut(usize),
    {
        if let (TypeKind::Instance { fields }, Some(layout)) =
            (&self.kind, self.instance_layout(ref_size))
        {
            for (kind, &offset) in fields.iter().zip(layout.offsets()) {
                if *kind == FieldKind::Native {
                    f(offset);
                }
            }
        }
    }
}

/// Registry of archived types
#[derive(Clone, Debug)]
pub struct TypeRegistry {
    types: Arc<Vec<TypeInfo>>,
    names: Arc<FxHashMap<String, TypeIndex>>,
}

impl TypeRegistry {
    /// Create a registry holding only the root array type
    pub fn new() -> Self {
        let mut names = FxHashMap::default();
        names.insert(ROOT_ARRAY_NAME.to_string(), ROOT_ARRAY_TYPE);
        Self {
            types: Arc::new(vec![root_array_info()]),
            names: Arc::new(names),
        }
    }

    /// Create a registry builder
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder { types: Vec::new() }
    }

    /// Get type information by index
    pub fn get(&self, index: TypeIndex) -> Option<&TypeInfo> {
        self.types.get(index.0 as usize)
    }

    /// Get type information, failing with `UnknownType`
    pub fn require(&self, index: TypeIndex) -> ArchiveResult<&TypeInfo> {
        self.get(index)
            .ok_or(ArchiveError::UnknownType(index.as_u32()))
    }

    /// Find a type by name
    pub fn lookup(&self, name: &str) -> Option<TypeIndex> {
        self.names.get(name).copied()
    }

    /// Iterate over registered types in index order
    pub fn iter(&self) -> impl Iterator<Item = &TypeInfo> {
        self.types.iter()
    }

    /// Get the number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Encode the registry as an archive type table
    pub fn encode(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&(self.types.len() as u32).to_le_bytes())?;
        for info in self.types.iter() {
            writer.write_all(&(info.name.len() as u32).to_le_bytes())?;
            writer.write_all(info.name.as_bytes())?;
            match &info.kind {
                TypeKind::Instance { fields } => {
                    writer.write_all(&[0])?;
                    writer.write_all(&(fields.len() as u32).to_le_bytes())?;
                    for field in fields {
                        writer.write_all(&[field.tag()])?;
                    }
                }
                TypeKind::ScalarArray { element_size } => {
                    writer.write_all(&[1, *element_size])?;
                }
                TypeKind::ReferenceArray => writer.write_all(&[2])?,
            }
        }
        Ok(())
    }

    /// Length in bytes of the encoded type table
    pub fn encoded_len(&self) -> usize {
        4 + self
            .types
            .iter()
            .map(|info| {
                4 + info.name.len()
                    + match &info.kind {
                        TypeKind::Instance { fields } => 1 + 4 + fields.len(),
                        TypeKind::ScalarArray { .. } => 2,
                        TypeKind::ReferenceArray => 1,
                    }
            })
            .sum::<usize>()
    }

    /// Decode an archive type table
    pub fn decode(reader: &mut impl Read) -> io::Result<Self> {
        let count = read_u32(reader)? as usize;
        let mut builder = TypeRegistry::builder();
        let mut kinds = Vec::with_capacity(count.min(1024));

        for _ in 0..count {
            let name_len = read_u32(reader)? as usize;
            let mut name = vec![0u8; name_len];
            reader.read_exact(&mut name)?;
            let name = String::from_utf8(name).map_err(|_| invalid_data("type name is not UTF-8"))?;

            let mut tag = [0u8; 1];
            reader.read_exact(&mut tag)?;
            let kind = match tag[0] {
                0 => {
                    let field_count = read_u32(reader)? as usize;
                    let mut fields = Vec::with_capacity(field_count.min(4096));
                    for _ in 0..field_count {
                        reader.read_exact(&mut tag)?;
                        fields.push(
                            FieldKind::from_tag(tag[0])
                                .ok_or_else(|| invalid_data("unknown field kind"))?,
                        );
                    }
                    TypeKind::Instance { fields }
                }
                1 => {
                    reader.read_exact(&mut tag)?;
                    TypeKind::ScalarArray {
                        element_size: tag[0],
                    }
                }
                2 => TypeKind::ReferenceArray,
                _ => return Err(invalid_data("unknown type kind")),
            };
            kinds.push((name, kind));
        }

        // Index 0 is always the root array; the builder re-adds it.
        let mut kinds = kinds.into_iter();
        match kinds.next() {
            Some((name, TypeKind::ReferenceArray)) if name == ROOT_ARRAY_NAME => {}
            _ => return Err(invalid_data("type table does not start with the root array")),
        }
        for (name, kind) in kinds {
            builder = builder.register(name, kind);
        }
        builder.build().map_err(|e| invalid_data(&e.to_string()))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for TypeRegistry
///
/// Types get consecutive indices in registration order, starting at 1;
/// index 0 is reserved for the root array.
pub struct TypeRegistryBuilder {
    types: Vec<(String, TypeKind)>,
}

impl TypeRegistryBuilder {
    /// Register a type of any kind
    pub fn register(mut self, name: impl Into<String>, kind: TypeKind) -> Self {
        self.types.push((name.into(), kind));
        self
    }

    /// Register an instance type
    pub fn instance(self, name: impl Into<String>, fields: Vec<FieldKind>) -> Self {
        self.register(name, TypeKind::Instance { fields })
    }

    /// Register a scalar array type
    pub fn scalar_array(self, name: impl Into<String>, element_size: u8) -> Self {
        self.register(name, TypeKind::ScalarArray { element_size })
    }

    /// Register a reference array type
    pub fn reference_array(self, name: impl Into<String>) -> Self {
        self.register(name, TypeKind::ReferenceArray)
    }

    /// Build the registry
    pub fn build(self) -> ArchiveResult<TypeRegistry> {
        let mut types = vec![root_array_info()];
        let mut names = FxHashMap::default();
        names.insert(ROOT_ARRAY_NAME.to_string(), ROOT_ARRAY_TYPE);
        for (name, kind) in self.types {
            if let TypeKind::ScalarArray { element_size } = kind {
                if !matches!(element_size, 1 | 2 | 4 | 8) {
                    return Err(ArchiveError::InvalidType {
                        name,
                        reason: format!("unsupported element size {}", element_size),
                    });
                }
            }
            if names.contains_key(&name) {
                return Err(ArchiveError::InvalidType {
                    name,
                    reason: "duplicate type name".to_string(),
                });
            }
            let index = TypeIndex(types.len() as u32);
            names.insert(name.clone(), index);
            types.push(TypeInfo::new(index, name, kind));
        }
        Ok(TypeRegistry {
            types: Arc::new(types),
            names: Arc::new(names),
        })
    }
}

const ROOT_ARRAY_NAME: &str = "RootArray";

fn root_array_info() -> TypeInfo {
    TypeInfo::new(
        ROOT_ARRAY_TYPE,
        ROOT_ARRAY_NAME.to_string(),
        TypeKind::ReferenceArray,
    )
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> TypeRegistry {
        TypeRegistry::builder()
            .instance(
                "Node",
                vec![FieldKind::Reference, FieldKind::Scalar, FieldKind::Native],
            )
            .scalar_array("ByteArray", 1)
            .reference_array("ObjectArray")
            .build()
            .unwrap()
    }

    #[test]
    fn test_root_array_is_index_zero() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.len(), 1);
        let root = registry.get(ROOT_ARRAY_TYPE).unwrap();
        assert_eq!(root.object_kind(), ObjectKind::ReferenceArray);
    }

    #[test]
    fn test_type_registry_builder() {
        let registry = sample_registry();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.lookup("Node"), Some(TypeIndex::new(1)));
        assert_eq!(registry.lookup("ByteArray"), Some(TypeIndex::new(2)));
        assert_eq!(registry.lookup("Missing"), None);
        assert!(registry.require(TypeIndex::new(9)).is_err());
    }

    #[test]
    fn test_lookup_after_decode() {
        let registry = sample_registry();
        let mut bytes = Vec::new();
        registry.encode(&mut bytes).unwrap();
        let decoded = TypeRegistry::decode(&mut &bytes[..]).unwrap();

        assert_eq!(decoded.lookup("RootArray"), Some(ROOT_ARRAY_TYPE));
        assert_eq!(decoded.lookup("ObjectArray"), Some(TypeIndex::new(3)));
        assert_eq!(decoded.lookup("Missing"), None);
        assert_eq!(TypeRegistry::new().lookup("RootArray"), Some(ROOT_ARRAY_TYPE));
    }

    #[test]
    fn test_object_sizes() {
        let registry = sample_registry();
        let node = registry.get(TypeIndex::new(1)).unwrap();
        // header + narrow ref (padded) + scalar + native
        assert_eq!(node.object_size(3, 4), 40);
        assert_eq!(node.object_size(3, 8), 40);

        let bytes = registry.get(TypeIndex::new(2)).unwrap();
        assert_eq!(bytes.object_size(0, 4), 16);
        assert_eq!(bytes.object_size(9, 4), 32);

        let refs = registry.get(TypeIndex::new(3)).unwrap();
        assert_eq!(refs.object_size(3, 4), 32);
        assert_eq!(refs.object_size(3, 8), 40);
    }

    #[test]
    fn test_reference_and_native_offsets() {
        let registry = sample_registry();
        let node = registry.get(TypeIndex::new(1)).unwrap();

        let mut refs = Vec::new();
        node.for_each_reference_offset(3, 4, |off| refs.push(off));
        assert_eq!(refs, vec![16]);

        let mut natives = Vec::new();
        node.for_each_native_offset(4, |off| natives.push(off));
        assert_eq!(natives, vec![32]);

        let array = registry.get(TypeIndex::new(3)).unwrap();
        let mut elems = Vec::new();
        array.for_each_reference_offset(3, 4, |off| elems.push(off));
        assert_eq!(elems, vec![16, 20, 24]);
    }

    #[test]
    fn test_invalid_element_size() {
        let result = TypeRegistry::builder().scalar_array("Odd", 3).build();
        assert!(matches!(result, Err(ArchiveError::InvalidType { .. })));
    }

    #[test]
    fn test_duplicate_name() {
        let result = TypeRegistry::builder()
            .reference_array("A")
            .reference_array("A")
            .build();
        assert!(matches!(result, Err(ArchiveError::InvalidType { .. })));
    }

    #[test]
    fn test_type_table_encode_decode() {
        let registry = sample_registry();
        let mut buf = Vec::new();
        registry.encode(&mut buf).unwrap();

        assert_eq!(buf.len(), registry.encoded_len());

        let decoded = TypeRegistry::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded.len(), registry.len());
        for (a, b) in decoded.iter().zip(registry.iter()) {
            assert_eq!(a.index, b.index);
            assert_eq!(a.name, b.name);
            assert_eq!(a.kind, b.kind);
        }
    }

    #[test]
    fn test_type_table_rejects_garbage() {
        let buf = [1u8, 0, 0, 0, 3, 0, 0, 0, b'F', b'o', b'o', 7];
        assert!(TypeRegistry::decode(&mut &buf[..]).is_err());
    }
}
