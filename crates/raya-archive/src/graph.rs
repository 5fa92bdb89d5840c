//! Source object graph handed to the dump pass
//!
//! Objects are addressed by [`ObjectId`], their index in the graph, so
//! graphs with cycles and forward references need no pointers. The
//! reachability collaborator decides which objects to archive and in which
//! region; that decision arrives as an [`ArchiveSelection`].

use crate::types::{FieldKind, TypeIndex, TypeKind, TypeRegistry};
use crate::{ArchiveError, ArchiveResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a source object
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u32);

impl ObjectId {
    /// Create a new object ID
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the object ID as a u32
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Value of one instance field
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    /// Plain value
    Scalar(u64),
    /// Reference to another source object
    Reference(Option<ObjectId>),
    /// Native pointer at its requested (dump-time) address
    Native(u64),
}

impl FieldValue {
    /// Field kind this value fills
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Scalar(_) => FieldKind::Scalar,
            FieldValue::Reference(_) => FieldKind::Reference,
            FieldValue::Native(_) => FieldKind::Native,
        }
    }
}

/// Contents of a source object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Instance fields in declaration order
    Fields(Vec<FieldValue>),
    /// Scalar array elements, each fitting the element size
    Scalars(Vec<u64>),
    /// Reference array elements
    References(Vec<Option<ObjectId>>),
}

impl Payload {
    /// Field or element count, stored as the header length
    pub fn len(&self) -> usize {
        match self {
            Payload::Fields(v) => v.len(),
            Payload::Scalars(v) => v.len(),
            Payload::References(v) => v.len(),
        }
    }

    /// Check if there are no fields or elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` for every non-null referent
    pub fn for_each_referent<F: FnMut(ObjectId)>(&self, mut f: F) {
        match self {
            Payload::Fields(fields) => {
                for field in fields {
                    if let FieldValue::Reference(Some(id)) = field {
                        f(*id);
                    }
                }
            }
            Payload::References(elems) => elems.iter().flatten().for_each(|id| f(*id)),
            Payload::Scalars(_) => {}
        }
    }
}

/// One object of the source graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceObject {
    /// Type of the object
    pub type_index: TypeIndex,

    /// Mark word copied into the archive verbatim
    #[serde(default)]
    pub mark: u64,

    /// Fields or elements
    pub payload: Payload,
}

/// Graph of source objects indexed by [`ObjectId`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGraph {
    objects: Vec<SourceObject>,
}

impl ObjectGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object and return its ID
    pub fn add(&mut self, object: SourceObject) -> ObjectId {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(object);
        id
    }

    /// Add an instance
    pub fn instance(&mut self, type_index: TypeIndex, fields: Vec<FieldValue>) -> ObjectId {
        self.add(SourceObject {
            type_index,
            mark: 0,
            payload: Payload::Fields(fields),
        })
    }

    /// Add a scalar array
    pub fn scalar_array(&mut self, type_index: TypeIndex, elements: Vec<u64>) -> ObjectId {
        self.add(SourceObject {
            type_index,
            mark: 0,
            payload: Payload::Scalars(elements),
        })
    }

    /// Add a reference array
    pub fn reference_array(
        &mut self,
        type_index: TypeIndex,
        elements: Vec<Option<ObjectId>>,
    ) -> ObjectId {
        self.add(SourceObject {
            type_index,
            mark: 0,
            payload: Payload::References(elements),
        })
    }

    /// Overwrite one instance field, e.g. to close a cycle
    pub fn set_field(&mut self, id: ObjectId, index: usize, value: FieldValue) -> ArchiveResult<()> {
        let object = self
            .objects
            .get_mut(id.index())
            .ok_or_else(|| ArchiveError::InvalidGraph(format!("no object {}", id)))?;
        match &mut object.payload {
            Payload::Fields(fields) if index < fields.len() => {
                fields[index] = value;
                Ok(())
            }
            _ => Err(ArchiveError::InvalidGraph(format!(
                "object {} has no field {}",
                id, index
            ))),
        }
    }

    /// Get an object by ID
    pub fn get(&self, id: ObjectId) -> Option<&SourceObject> {
        self.objects.get(id.index())
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check if the graph has no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterate over objects with their IDs
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &SourceObject)> {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, o)| (ObjectId(i as u32), o))
    }

    /// Check that an object's payload fits its type
    pub fn check_object(&self, id: ObjectId, registry: &TypeRegistry) -> ArchiveResult<()> {
        let object = self
            .get(id)
            .ok_or_else(|| ArchiveError::InvalidGraph(format!("no object {}", id)))?;
        let info = registry.require(object.type_index)?;
        let fits = match (&info.kind, &object.payload) {
            (TypeKind::Instance { fields }, Payload::Fields(values)) => {
                fields.len() == values.len()
                    && fields.iter().zip(values).all(|(k, v)| *k == v.kind())
            }
            (TypeKind::ScalarArray { element_size }, Payload::Scalars(values)) => {
                if let Some(v) = values.iter().find(|v| !fits_element(**v, *element_size)) {
                    return Err(ArchiveError::InvalidGraph(format!(
                        "object {} element {:#x} does not fit in {} bytes",
                        id, v, element_size
                    )));
                }
                true
            }
            (TypeKind::ReferenceArray, Payload::References(_)) => true,
            _ => false,
        };
        if fits {
            Ok(())
        } else {
            Err(ArchiveError::InvalidGraph(format!(
                "object {} does not match type {}",
                id, info.name
            )))
        }
    }
}

fn fits_element(value: u64, element_size: u8) -> bool {
    element_size >= 8 || value >> (u32::from(element_size) * 8) == 0
}

/// Region an archived object is assigned to
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    /// Objects that may be mutated after loading
    Open,
    /// Objects that are never written after loading
    Closed,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Open => write!(f, "open"),
            RegionKind::Closed => write!(f, "closed"),
        }
    }
}

/// Objects chosen for archiving, in buffering order, plus the roots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSelection {
    /// Archived objects and their region
    pub entries: Vec<(ObjectId, RegionKind)>,

    /// Entries of the root array, in order
    pub roots: Vec<ObjectId>,
}

impl ArchiveSelection {
    /// Create an empty selection
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive `id` in the open region
    pub fn open(mut self, id: ObjectId) -> Self {
        self.entries.push((id, RegionKind::Open));
        self
    }

    /// Archive `id` in the closed region
    pub fn closed(mut self, id: ObjectId) -> Self {
        self.entries.push((id, RegionKind::Closed));
        self
    }

    /// Append `id` to the root array
    pub fn root(mut self, id: ObjectId) -> Self {
        self.roots.push(id);
        self
    }

    /// Select every object of `graph` in the open region
    pub fn all_open(graph: &ObjectGraph) -> Self {
        Self {
            entries: graph.iter().map(|(id, _)| (id, RegionKind::Open)).collect(),
            roots: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
            .instance("Pair", vec![FieldKind::Reference, FieldKind::Scalar])
            .scalar_array("Ints", 4)
            .build()
            .unwrap()
    }

    #[test]
    fn test_add_and_get() {
        let mut graph = ObjectGraph::new();
        let a = graph.scalar_array(TypeIndex::new(2), vec![1, 2, 3]);
        let b = graph.instance(
            TypeIndex::new(1),
            vec![FieldValue::Reference(Some(a)), FieldValue::Scalar(7)],
        );
        assert_eq!(graph.len(), 2);
        assert_eq!(b.as_u32(), 1);
        assert_eq!(graph.get(a).unwrap().payload.len(), 3);

        let mut referents = Vec::new();
        graph.get(b).unwrap().payload.for_each_referent(|id| referents.push(id));
        assert_eq!(referents, vec![a]);
    }

    #[test]
    fn test_set_field_closes_cycle() {
        let mut graph = ObjectGraph::new();
        let a = graph.instance(
            TypeIndex::new(1),
            vec![FieldValue::Reference(None), FieldValue::Scalar(0)],
        );
        let b = graph.instance(
            TypeIndex::new(1),
            vec![FieldValue::Reference(Some(a)), FieldValue::Scalar(0)],
        );
        graph.set_field(a, 0, FieldValue::Reference(Some(b))).unwrap();
        assert_eq!(
            graph.get(a).unwrap().payload,
            Payload::Fields(vec![FieldValue::Reference(Some(b)), FieldValue::Scalar(0)])
        );
        assert!(graph.set_field(a, 5, FieldValue::Scalar(1)).is_err());
    }

    #[test]
    fn test_scalar_elements_must_fit() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let fits = graph.scalar_array(TypeIndex::new(2), vec![0, u32::MAX as u64]);
        let too_wide = graph.scalar_array(TypeIndex::new(2), vec![1, 0x1_0000_0000]);

        assert!(graph.check_object(fits, &registry).is_ok());
        assert!(matches!(
            graph.check_object(too_wide, &registry),
            Err(ArchiveError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_check_object() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let good = graph.instance(
            TypeIndex::new(1),
            vec![FieldValue::Reference(None), FieldValue::Scalar(1)],
        );
        let wrong_kind = graph.instance(
            TypeIndex::new(1),
            vec![FieldValue::Scalar(1), FieldValue::Scalar(1)],
        );
        let wrong_shape = graph.reference_array(TypeIndex::new(2), vec![None]);
        let unknown = graph.scalar_array(TypeIndex::new(42), vec![]);

        assert!(graph.check_object(good, &registry).is_ok());
        assert!(graph.check_object(wrong_kind, &registry).is_err());
        assert!(graph.check_object(wrong_shape, &registry).is_err());
        assert!(matches!(
            graph.check_object(unknown, &registry),
            Err(ArchiveError::UnknownType(42))
        ));
    }

    #[test]
    fn test_selection_builder() {
        let selection = ArchiveSelection::new()
            .open(ObjectId::new(0))
            .closed(ObjectId::new(1))
            .root(ObjectId::new(0));
        assert_eq!(selection.entries.len(), 2);
        assert_eq!(selection.entries[1].1, RegionKind::Closed);
        assert_eq!(selection.roots, vec![ObjectId::new(0)]);
    }

    #[test]
    fn test_graph_json() {
        let mut graph = ObjectGraph::new();
        graph.reference_array(TypeIndex::new(0), vec![None, Some(ObjectId::new(0))]);
        let json = serde_json::to_string(&graph).unwrap();
        let back: ObjectGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, graph);
    }
}
