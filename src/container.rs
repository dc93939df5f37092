//! The container: an ordered list of named root entries.
//!
//! Entries keep insertion order, which is also file order on write. A
//! container that carries a subsystem keeps it as the final entry across
//! every mutation — the wire format requires the subsystem blob to trail
//! everything it backs.

use log::debug;

use crate::array::{ArrayKind, MatArray};
use crate::error::{MatError, Result};
use crate::subsys::Subsystem;

/// One named root entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Variable name; empty only for the subsystem entry.
    pub name: String,
    /// The owned array.
    pub array: MatArray,
}

/// An in-memory MAT container.
#[derive(Debug, Default)]
pub struct MatFile {
    entries: Vec<Entry>,
}

impl MatFile {
    /// An empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in file order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Number of entries, subsystem included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry by name.
    ///
    /// Names are matched case-sensitively first; when nothing matches, a
    /// case-insensitive scan runs as a fallback for callers quoting names
    /// from sloppier sources.
    pub fn get(&self, name: &str) -> Option<&MatArray> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|e| !e.name.is_empty() && e.name.eq_ignore_ascii_case(name))
            })
            .map(|e| &e.array)
    }

    /// Mutable lookup with the same matching rules as [`get`](Self::get).
    pub fn get_mut(&mut self, name: &str) -> Option<&mut MatArray> {
        let index = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .or_else(|| {
                self.entries
                    .iter()
                    .position(|e| !e.name.is_empty() && e.name.eq_ignore_ascii_case(name))
            })?;
        Some(&mut self.entries[index].array)
    }

    /// Adds or replaces a named entry.
    ///
    /// Replacement is by exact name. New entries land at the end of the
    /// list but always before the subsystem.
    pub fn insert(&mut self, name: &str, array: MatArray) -> Result<()> {
        if name.is_empty() {
            return Err(MatError::bounds("root entries need a non-empty name"));
        }
        if matches!(array.kind(), ArrayKind::Subsystem(_)) {
            return Err(MatError::bounds(
                "subsystems are attached with set_subsystem, not insert",
            ));
        }
        if let Some(existing) = self.entries.iter_mut().find(|e| e.name == name) {
            existing.array = array;
        } else {
            self.entries.push(Entry {
                name: name.to_string(),
                array,
            });
        }
        self.restore_subsystem_order();
        Ok(())
    }

    /// Removes an entry by exact name, returning its array.
    pub fn remove(&mut self, name: &str) -> Option<MatArray> {
        let index = self.entries.iter().position(|e| e.name == name)?;
        let entry = self.entries.remove(index);
        self.restore_subsystem_order();
        Some(entry.array)
    }

    /// Attaches (or replaces) the trailing subsystem entry.
    pub fn set_subsystem(&mut self, subsystem: Subsystem) {
        self.entries
            .retain(|e| !matches!(e.array.kind(), ArrayKind::Subsystem(_)));
        self.entries.push(Entry {
            name: String::new(),
            array: MatArray::subsystem_entry(subsystem),
        });
        self.restore_subsystem_order();
    }

    /// The subsystem entry, if one is attached.
    pub fn subsystem(&self) -> Option<&Subsystem> {
        self.entries.iter().find_map(|e| match e.array.kind() {
            ArrayKind::Subsystem(s) => Some(s),
            _ => None,
        })
    }

    /// True when a subsystem entry is attached.
    pub fn has_subsystem(&self) -> bool {
        self.subsystem().is_some()
    }

    /// Moves the subsystem entry, if any, back to the end of the list.
    ///
    /// Called after every mutation so the invariant survives arbitrary
    /// insert/remove sequences.
    fn restore_subsystem_order(&mut self) {
        let Some(index) = self
            .entries
            .iter()
            .position(|e| matches!(e.array.kind(), ArrayKind::Subsystem(_)))
        else {
            return;
        };
        if index + 1 != self.entries.len() {
            let entry = self.entries.remove(index);
            self.entries.push(entry);
        }
    }

    /// Closes every owned array, releasing the subsystem buffer.
    ///
    /// Each entry is attempted even after a failure; the first error is
    /// surfaced and the rest are swallowed. The container is empty
    /// afterwards.
    pub fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        for entry in self.entries.drain(..) {
            if let ArrayKind::Subsystem(s) = entry.array.kind() {
                if let Err(e) = s.close() {
                    debug!("closing subsystem entry failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{BufferAllocator, PlainAllocator};
    use crate::array::Dims;
    use std::sync::Arc;

    fn scalar(v: f64) -> MatArray {
        MatArray::double(Dims::matrix(1, 1), vec![v]).unwrap()
    }

    fn subsystem(alloc: &Arc<PlainAllocator>) -> Subsystem {
        Subsystem::from_bytes(&[1, 2, 3, 4], Arc::clone(alloc) as Arc<dyn BufferAllocator>)
            .unwrap()
    }

    #[test]
    fn lookup_prefers_exact_case() {
        let mut file = MatFile::new();
        file.insert("Data", scalar(1.0)).unwrap();
        file.insert("data", scalar(2.0)).unwrap();
        assert_eq!(file.get("data"), Some(&scalar(2.0)));
        assert_eq!(file.get("DATA"), Some(&scalar(1.0)));
        assert!(file.get("missing").is_none());
    }

    #[test]
    fn insert_replaces_same_name() {
        let mut file = MatFile::new();
        file.insert("x", scalar(1.0)).unwrap();
        file.insert("x", scalar(9.0)).unwrap();
        assert_eq!(file.len(), 1);
        assert_eq!(file.get("x"), Some(&scalar(9.0)));
    }

    #[test]
    fn subsystem_stays_last_across_mutations() {
        let alloc = Arc::new(PlainAllocator::new());
        let mut file = MatFile::new();
        file.insert("a", scalar(1.0)).unwrap();
        file.set_subsystem(subsystem(&alloc));
        file.insert("b", scalar(2.0)).unwrap();
        file.insert("c", scalar(3.0)).unwrap();
        file.remove("a");
        let last = file.entries().last().unwrap();
        assert!(matches!(last.array.kind(), ArrayKind::Subsystem(_)));
        assert_eq!(file.len(), 3);
        file.close().unwrap();
        assert_eq!(alloc.stats().live(), 0);
    }

    #[test]
    fn close_is_idempotent_and_releases() {
        let alloc = Arc::new(PlainAllocator::new());
        let mut file = MatFile::new();
        file.set_subsystem(subsystem(&alloc));
        file.close().unwrap();
        file.close().unwrap();
        assert_eq!(alloc.stats().allocated, 1);
        assert_eq!(alloc.stats().released, 1);
    }
}
