//! Builds the shared object graph from parsed subsystem records.
//!
//! Objects are built once each into an index-addressable arena; references
//! anywhere in the file are bound to the arena afterwards, so every alias
//! to the same object index observes the same shared instance — the
//! behavior MATLAB handle classes require, including self- and
//! mutual-reference cycles.

use indexmap::IndexMap;
use log::debug;

use crate::array::{ArrayKind, CharEncoding, Dims, MatArray};
use crate::error::{MatError, Result};
use crate::subsys::segments::{
    PROP_FLAG_BOOL, PROP_FLAG_CELL_HEAP, PROP_FLAG_STRING, PropertyRecord, SubsystemMeta,
};
use crate::subsys::wire::PropertyHeap;
use std::sync::Arc;

/// One resolved class instance.
///
/// Created exactly once per object index during resolution and immutable
/// afterwards; aliases share it through `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsystemObject {
    /// Package the class lives in; empty for the root package.
    pub package_name: String,
    /// The class name.
    pub class_name: String,
    /// Property values in first-seen order.
    pub properties: IndexMap<String, MatArray>,
}

impl SubsystemObject {
    /// The property value stored under `name`.
    pub fn property(&self, name: &str) -> Option<&MatArray> {
        self.properties.get(name)
    }

    /// Property names in first-seen order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }
}

/// Index-addressable storage for resolved objects.
///
/// Index 0 is the "no object" sentinel; real objects are 1-based, matching
/// how object records are numbered on the wire.
#[derive(Debug, Default)]
pub struct ObjectArena {
    objects: Vec<Option<Arc<SubsystemObject>>>,
}

impl ObjectArena {
    /// An arena holding only the sentinel slot.
    pub fn empty() -> Self {
        Self {
            objects: vec![None],
        }
    }

    /// Number of real objects.
    pub fn len(&self) -> usize {
        self.objects.len().saturating_sub(1)
    }

    /// True when no objects were resolved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The shared instance at a 1-based object index.
    ///
    /// Every call for the same index returns a handle to the same
    /// allocation, which is what gives aliased references identity.
    pub fn get(&self, index: u32) -> Result<Arc<SubsystemObject>> {
        self.objects
            .get(index as usize)
            .and_then(Option::as_ref)
            .map(Arc::clone)
            .ok_or_else(|| {
                MatError::format(format!("object index {index} is not present in the arena"))
            })
    }
}

/// Builds [`ObjectArena`]s from parsed metadata and the property heap.
#[derive(Debug)]
pub struct Resolver;

impl Resolver {
    /// Constructs all objects in record order.
    ///
    /// Per object the build order is: seed every field from the owning
    /// class's default-property struct, then overlay the first property
    /// segment's list, then the second; later overlays win while the
    /// first-seen field order is preserved.
    pub fn build(meta: &SubsystemMeta, heap: &PropertyHeap<'_>) -> Result<Arc<ObjectArena>> {
        let mut objects = Vec::with_capacity(meta.objects.len());
        objects.push(None);
        for index in 1..meta.objects.len() {
            let record = &meta.objects[index];
            if record.class_id == 0 || record.class_id as usize >= meta.classes.len() {
                return Err(MatError::format(format!(
                    "object {index} references class {} outside the class table",
                    record.class_id
                )));
            }
            let class = &meta.classes[record.class_id as usize];
            let package_name = meta.string(class.package_name_index)?.to_string();
            let class_name = meta.string(class.class_name_index)?.to_string();

            let mut properties = IndexMap::new();
            Self::seed_defaults(&mut properties, heap, record.class_id)?;
            if record.props_a != 0 {
                let list = Self::list(&meta.props_a, record.props_a, index, "first")?;
                Self::overlay(&mut properties, list, meta, heap)?;
            }
            if record.props_b != 0 {
                let list = Self::list(&meta.props_b, record.props_b, index, "second")?;
                Self::overlay(&mut properties, list, meta, heap)?;
            }

            debug!(
                "resolved object {index}: class {class_name} with {} properties",
                properties.len()
            );
            objects.push(Some(Arc::new(SubsystemObject {
                package_name,
                class_name,
                properties,
            })));
        }
        Ok(Arc::new(ObjectArena { objects }))
    }

    fn list<'m>(
        lists: &'m [Vec<PropertyRecord>],
        one_based: u32,
        object: usize,
        which: &str,
    ) -> Result<&'m [PropertyRecord]> {
        lists
            .get(one_based as usize - 1)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                MatError::format(format!(
                    "object {object} references {which} property list {one_based} of {}",
                    lists.len()
                ))
            })
    }

    fn seed_defaults(
        properties: &mut IndexMap<String, MatArray>,
        heap: &PropertyHeap<'_>,
        class_id: u32,
    ) -> Result<()> {
        let defaults = heap.class_defaults(class_id)?;
        match defaults.kind() {
            ArrayKind::Struct(s) => {
                for name in s.field_names() {
                    if let Some(value) = s.get(0, name) {
                        properties.insert(name.to_string(), value.clone());
                    }
                }
                Ok(())
            }
            // An empty placeholder means the class declares no defaults.
            ArrayKind::Numeric(n) if n.real.is_empty() => Ok(()),
            _ => Err(MatError::format(format!(
                "default properties for class {class_id} are not a struct"
            ))),
        }
    }

    fn overlay(
        properties: &mut IndexMap<String, MatArray>,
        records: &[PropertyRecord],
        meta: &SubsystemMeta,
        heap: &PropertyHeap<'_>,
    ) -> Result<()> {
        for record in records {
            let name = meta.string(record.name_index)?.to_string();
            let value = match record.flag {
                PROP_FLAG_STRING => {
                    let text = meta.string(record.heap_index)?;
                    MatArray::char_rows(&[text], CharEncoding::Utf8)?
                }
                PROP_FLAG_CELL_HEAP => heap.value(record.heap_index)?.clone(),
                PROP_FLAG_BOOL => {
                    MatArray::logical(Dims::matrix(1, 1), vec![u8::from(record.heap_index != 0)])?
                }
                other => {
                    return Err(MatError::format(format!(
                        "property flag {other} is not a known interpretation"
                    )));
                }
            };
            // Re-inserting keeps the original position: later overlays win
            // without disturbing first-seen field order.
            properties.insert(name, value);
        }
        Ok(())
    }
}
