//! Assembles subsystem blobs for writing.
//!
//! The builder mirrors the resolver's reading model: intern strings, declare
//! classes and their default properties, add objects, attach per-object
//! property overlays, and mint reference placeholder arrays for the root
//! tree. `finish` lays everything out as the metadata buffer plus the
//! file-wrapper cell heap and frames it as a complete blob.

use indexmap::IndexSet;

use crate::array::{
    ArrayKind, Dims, MatArray, NumericData, ObjectRef, OpaqueArray, OpaqueContent,
};
use crate::bytes::{ByteSink, VecSink};
use crate::element;
use crate::error::{MatError, Result};
use crate::format::ByteOrder;
use crate::subsys::registry::ObjectLink;
use crate::subsys::segments::{
    ClassRecord, ObjectRecord, PROP_FLAG_BOOL, PROP_FLAG_CELL_HEAP, PROP_FLAG_STRING,
    PropertyRecord, SubsystemMeta,
};
use crate::subsys::wire::{FILE_WRAPPER_CLASS, MCOS_TYPE, blob_header};

/// A property value attached to an object.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    /// Any array; stored in the cell heap.
    Array(MatArray),
    /// A short string; stored in the string heap.
    Str(String),
    /// A boolean; stored inline in the property record.
    Bool(bool),
}

#[derive(Debug, Default)]
struct ClassSpec {
    package_name_index: u32,
    class_name_index: u32,
    name: String,
    defaults: Vec<(String, MatArray)>,
}

#[derive(Debug, Default)]
struct ObjectSpec {
    class_id: u32,
    properties: Vec<PropertyRecord>,
}

/// Incremental builder for a subsystem blob.
#[derive(Debug, Default)]
pub struct SubsystemBuilder {
    strings: IndexSet<String>,
    classes: Vec<ClassSpec>,
    objects: Vec<ObjectSpec>,
    heap: Vec<MatArray>,
}

impl SubsystemBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, value: &str) -> u32 {
        if value.is_empty() {
            return 0;
        }
        let (index, _) = self.strings.insert_full(value.to_string());
        index as u32 + 1
    }

    /// Declares a class, returning its 1-based class id.
    pub fn add_class(&mut self, package: &str, name: &str) -> u32 {
        let package_name_index = self.intern(package);
        let class_name_index = self.intern(name);
        self.classes.push(ClassSpec {
            package_name_index,
            class_name_index,
            name: name.to_string(),
            defaults: Vec::new(),
        });
        self.classes.len() as u32
    }

    fn class_mut(&mut self, class_id: u32) -> Result<&mut ClassSpec> {
        let index = class_id as usize;
        if index == 0 || index > self.classes.len() {
            return Err(MatError::bounds(format!("class id {class_id} not declared")));
        }
        Ok(&mut self.classes[index - 1])
    }

    /// Adds a default property seeded into every instance of the class.
    pub fn set_default(&mut self, class_id: u32, name: &str, value: MatArray) -> Result<()> {
        let class = self.class_mut(class_id)?;
        if let Some(slot) = class.defaults.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            class.defaults.push((name.to_string(), value));
        }
        Ok(())
    }

    /// Adds an instance of a class, returning its 1-based object index.
    pub fn add_object(&mut self, class_id: u32) -> Result<u32> {
        self.class_mut(class_id)?;
        self.objects.push(ObjectSpec {
            class_id,
            properties: Vec::new(),
        });
        Ok(self.objects.len() as u32)
    }

    /// Attaches a property overlay to an object.
    pub fn set_property(&mut self, object: u32, name: &str, value: PropertyValue) -> Result<()> {
        let index = object as usize;
        if index == 0 || index > self.objects.len() {
            return Err(MatError::bounds(format!("object index {object} not declared")));
        }
        let name_index = self.intern(name);
        let record = match value {
            PropertyValue::Array(array) => {
                self.heap.push(array);
                PropertyRecord {
                    name_index,
                    flag: PROP_FLAG_CELL_HEAP,
                    heap_index: self.heap.len() as u32 - 1,
                }
            }
            PropertyValue::Str(text) => PropertyRecord {
                name_index,
                flag: PROP_FLAG_STRING,
                heap_index: self.intern(&text),
            },
            PropertyValue::Bool(b) => PropertyRecord {
                name_index,
                flag: PROP_FLAG_BOOL,
                heap_index: u32::from(b),
            },
        };
        self.objects[index - 1].properties.push(record);
        Ok(())
    }

    /// Mints a reference placeholder array for the root tree.
    ///
    /// The array's dimensions are `len × 1` over the given object indices;
    /// it serializes as the u32 metadata form and resolves against this
    /// subsystem after a round trip.
    pub fn reference(&self, class_id: u32, objects: &[u32]) -> Result<MatArray> {
        let index = class_id as usize;
        if index == 0 || index > self.classes.len() {
            return Err(MatError::bounds(format!("class id {class_id} not declared")));
        }
        if objects.is_empty() {
            return Err(MatError::bounds("a reference needs at least one object"));
        }
        for &object in objects {
            if object == 0 || object as usize > self.objects.len() {
                return Err(MatError::bounds(format!(
                    "object index {object} not declared"
                )));
            }
        }
        MatArray::new(
            Dims::matrix(objects.len() as i32, 1),
            ArrayKind::Opaque(OpaqueArray {
                object_type: MCOS_TYPE.to_string(),
                class_name: self.classes[index - 1].name.clone(),
                content: OpaqueContent::Reference(ObjectRef {
                    class_index: class_id,
                    object_indices: objects.to_vec(),
                    link: ObjectLink::unbound(),
                }),
            }),
        )
    }

    /// Lays the builder out as raw subsystem blob bytes (little-endian).
    pub fn finish(self) -> Result<Vec<u8>> {
        let order = ByteOrder::Little;
        let meta = self.metadata()?;
        let meta_bytes = meta.encode(order)?;

        let mut cells = Vec::with_capacity(self.heap.len() + 3);
        cells.push(MatArray::numeric(
            Dims::matrix(1, meta_bytes.len() as i32),
            NumericData::U8(meta_bytes),
        )?);
        cells.push(MatArray::numeric(
            Dims::matrix(1, 0),
            NumericData::U8(Vec::new()),
        )?);
        cells.extend(self.heap);

        let mut defaults = Vec::with_capacity(self.classes.len());
        for class in &self.classes {
            if class.defaults.is_empty() {
                defaults.push(MatArray::empty());
            } else {
                let fields: Vec<String> =
                    class.defaults.iter().map(|(n, _)| n.clone()).collect();
                let values: Vec<MatArray> =
                    class.defaults.iter().map(|(_, v)| v.clone()).collect();
                defaults.push(MatArray::structure(
                    Dims::matrix(1, 1),
                    fields,
                    vec![values],
                )?);
            }
        }
        cells.push(MatArray::cell(
            Dims::matrix(defaults.len().max(1) as i32, 1),
            defaults,
        )?);

        let wrapper = MatArray::new(
            Dims::matrix(1, 1),
            ArrayKind::Opaque(OpaqueArray {
                object_type: MCOS_TYPE.to_string(),
                class_name: FILE_WRAPPER_CLASS.to_string(),
                content: OpaqueContent::Raw(Box::new(MatArray::cell(
                    Dims::matrix(cells.len() as i32, 1),
                    cells,
                )?)),
            }),
        )?;

        let mut sink = VecSink::new(order);
        sink.write_bytes(&blob_header(order))?;
        element::write_element("", &wrapper, &mut sink)?;
        Ok(sink.into_bytes())
    }

    fn metadata(&self) -> Result<SubsystemMeta> {
        let mut strings = Vec::with_capacity(self.strings.len() + 1);
        strings.push(String::new());
        strings.extend(self.strings.iter().cloned());

        let mut classes = vec![ClassRecord::default()];
        classes.extend(self.classes.iter().map(|c| ClassRecord {
            package_name_index: c.package_name_index,
            class_name_index: c.class_name_index,
        }));

        let mut props_a = Vec::new();
        let mut objects = vec![ObjectRecord::default()];
        for (index, object) in self.objects.iter().enumerate() {
            let props_index = if object.properties.is_empty() {
                0
            } else {
                props_a.push(object.properties.clone());
                props_a.len() as u32
            };
            objects.push(ObjectRecord {
                class_id: object.class_id,
                props_a: props_index,
                props_b: 0,
                object_id: index as u32 + 1,
            });
        }

        Ok(SubsystemMeta {
            strings,
            classes,
            props_a,
            objects,
            props_b: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsys::wire::parse_blob;

    #[test]
    fn build_and_resolve_a_single_object() {
        let mut b = SubsystemBuilder::new();
        let point = b.add_class("geom", "Point");
        b.set_default(point, "z", MatArray::double(Dims::matrix(1, 1), vec![0.0]).unwrap())
            .unwrap();
        let p1 = b.add_object(point).unwrap();
        b.set_property(
            p1,
            "x",
            PropertyValue::Array(MatArray::double(Dims::matrix(1, 1), vec![3.0]).unwrap()),
        )
        .unwrap();
        b.set_property(p1, "label", PropertyValue::Str("origin".into()))
            .unwrap();
        b.set_property(p1, "pinned", PropertyValue::Bool(true)).unwrap();

        let blob = b.finish().unwrap();
        let arena = parse_blob(&blob).unwrap();
        assert_eq!(arena.len(), 1);
        let object = arena.get(1).unwrap();
        assert_eq!(object.class_name, "Point");
        assert_eq!(object.package_name, "geom");
        // Defaults seed first, overlays follow in first-seen order.
        let names: Vec<&str> = object.field_names().collect();
        assert_eq!(names, ["z", "x", "label", "pinned"]);
    }

    #[test]
    fn aliases_share_one_instance() {
        let mut b = SubsystemBuilder::new();
        let class = b.add_class("", "Shared");
        let o = b.add_object(class).unwrap();
        b.set_property(
            o,
            "v",
            PropertyValue::Array(MatArray::double(Dims::matrix(1, 1), vec![7.0]).unwrap()),
        )
        .unwrap();
        let blob = b.finish().unwrap();
        let arena = parse_blob(&blob).unwrap();
        let a = arena.get(1).unwrap();
        let b2 = arena.get(1).unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b2));
    }

    #[test]
    fn cyclic_properties_resolve_without_recursing() {
        let mut b = SubsystemBuilder::new();
        let node = b.add_class("", "Node");
        let first = b.add_object(node).unwrap();
        let second = b.add_object(node).unwrap();
        let to_second = b.reference(node, &[second]).unwrap();
        let to_first = b.reference(node, &[first]).unwrap();
        b.set_property(first, "next", PropertyValue::Array(to_second))
            .unwrap();
        b.set_property(second, "next", PropertyValue::Array(to_first))
            .unwrap();

        let blob = b.finish().unwrap();
        let arena = parse_blob(&blob).unwrap();
        let one = arena.get(1).unwrap();
        // Traversing the cycle through the arena terminates: links are
        // index-based views, not owned children.
        let next = one.property("next").unwrap();
        match next.kind() {
            ArrayKind::Opaque(o) => match &o.content {
                OpaqueContent::Reference(r) => {
                    assert_eq!(r.object_indices, vec![2]);
                    let arena_again = r.link.arena().unwrap();
                    let two = arena_again.get(2).unwrap();
                    let back = two.property("next").unwrap();
                    assert!(format!("{back:?}").contains("ObjectLink"));
                }
                OpaqueContent::Raw(_) => panic!("expected reference"),
            },
            other => panic!("unexpected kind {other:?}"),
        }
    }
}
