//! JSON description of a graph to dump
//!
//! ```json
//! {
//!   "types": [
//!     { "name": "Node", "kind": { "instance": { "fields": ["reference", "scalar"] } } }
//!   ],
//!   "graph": {
//!     "objects": [
//!       { "type_index": 1, "payload": { "fields": [{ "reference": null }, { "scalar": 7 }] } }
//!     ]
//!   },
//!   "selection": { "entries": [[0, "open"]], "roots": [0] }
//! }
//! ```
//!
//! Type indices start at 1; index 0 is the root array. Without a selection,
//! every object goes to the open region and object 0 is the only root.

use anyhow::Context;
use raya_archive::graph::{ArchiveSelection, ObjectGraph, ObjectId};
use raya_archive::types::{TypeKind, TypeRegistry};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct TypeInput {
    pub name: String,
    pub kind: TypeKind,
}

#[derive(Debug, Deserialize)]
pub struct GraphInput {
    pub types: Vec<TypeInput>,
    pub graph: ObjectGraph,
    #[serde(default)]
    pub selection: Option<ArchiveSelection>,
}

impl GraphInput {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid graph file {}", path.display()))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn registry(&self) -> anyhow::Result<TypeRegistry> {
        let builder = self
            .types
            .iter()
            .fold(TypeRegistry::builder(), |builder, t| {
                builder.register(t.name.clone(), t.kind.clone())
            });
        Ok(builder.build()?)
    }

    pub fn selection(&self) -> ArchiveSelection {
        match &self.selection {
            Some(selection) => selection.clone(),
            None => {
                let selection = ArchiveSelection::all_open(&self.graph);
                if self.graph.is_empty() {
                    selection
                } else {
                    selection.root(ObjectId::new(0))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raya_archive::graph::RegionKind;

    const SAMPLE: &str = r#"{
        "types": [
            { "name": "Node", "kind": { "instance": { "fields": ["reference", "scalar"] } } },
            { "name": "Bytes", "kind": { "scalar_array": { "element_size": 1 } } }
        ],
        "graph": {
            "objects": [
                { "type_index": 1, "payload": { "fields": [{ "reference": 1 }, { "scalar": 7 }] } },
                { "type_index": 1, "mark": 3, "payload": { "fields": [{ "reference": null }, { "scalar": 8 }] } },
                { "type_index": 2, "payload": { "scalars": [1, 2, 3] } }
            ]
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let input = GraphInput::from_json(SAMPLE).unwrap();
        let registry = input.registry().unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(input.graph.len(), 3);
        assert_eq!(input.graph.get(ObjectId::new(1)).unwrap().mark, 3);
    }

    #[test]
    fn test_default_selection() {
        let input = GraphInput::from_json(SAMPLE).unwrap();
        let selection = input.selection();
        assert_eq!(selection.entries.len(), 3);
        assert!(selection.entries.iter().all(|(_, r)| *r == RegionKind::Open));
        assert_eq!(selection.roots, vec![ObjectId::new(0)]);
    }

    #[test]
    fn test_explicit_selection() {
        let text = SAMPLE.replacen(
            "\"graph\"",
            "\"selection\": { \"entries\": [[2, \"closed\"]], \"roots\": [2] }, \"graph\"",
            1,
        );
        let input = GraphInput::from_json(&text).unwrap();
        let selection = input.selection();
        assert_eq!(selection.entries, vec![(ObjectId::new(2), RegionKind::Closed)]);
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let text = SAMPLE.replace("\"Bytes\"", "\"Node\"");
        let input = GraphInput::from_json(&text).unwrap();
        assert!(input.registry().is_err());
    }
}
