//! Shared bookkeeping for class-instance reference placeholders.
//!
//! While elements are decoded — possibly on several worker threads —
//! every embedded subsystem reference is registered here instead of being
//! resolved inline, because the object it names may not exist yet (forward
//! references) or may reference back into the tree being parsed (cycles).
//! Once the object arena is fully built, [`ReferenceRegistry::bind_owned`]
//! patches every registered link in one pass.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use super::resolver::ObjectArena;

/// How a bound link holds the arena.
///
/// Links that live inside the arena's own objects hold a weak back
/// reference; anything stronger would keep cyclic object graphs alive
/// forever. Links in the root tree own the arena and define its lifetime.
#[derive(Clone)]
enum ArenaBinding {
    Owned(Arc<ObjectArena>),
    Backref(Weak<ObjectArena>),
}

/// A late-bound connection from a reference placeholder to the object arena.
///
/// Cloning a link aliases it: every clone observes the same binding, which
/// is what gives two references to the same object index the same shared
/// instance after resolution.
#[derive(Clone, Default)]
pub struct ObjectLink {
    cell: Arc<OnceLock<ArenaBinding>>,
}

impl ObjectLink {
    /// A fresh, unbound link.
    pub fn unbound() -> Self {
        Self::default()
    }

    /// True once the resolver has patched this link.
    pub fn is_bound(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The arena this link resolves through, if bound and still alive.
    pub fn arena(&self) -> Option<Arc<ObjectArena>> {
        match self.cell.get()? {
            ArenaBinding::Owned(arena) => Some(Arc::clone(arena)),
            ArenaBinding::Backref(weak) => weak.upgrade(),
        }
    }

    /// Identity comparison used by reference equality: two unbound links
    /// compare equal (same pending indices mean the same object), two bound
    /// links compare by arena identity.
    pub fn same_arena(&self, other: &Self) -> bool {
        match (self.arena(), other.arena()) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
            _ => false,
        }
    }

    fn bind(&self, binding: ArenaBinding) {
        // First binding wins; a link is only ever patched by one resolve
        // pass, so a second set is a benign no-op.
        let _ = self.cell.set(binding);
    }
}

impl fmt::Debug for ObjectLink {
    // Deliberately shallow: printing the arena would recurse through
    // object properties and back into links on cyclic graphs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bound() {
            write!(f, "ObjectLink(bound)")
        } else {
            write!(f, "ObjectLink(pending)")
        }
    }
}

/// Collects every reference placeholder seen during a parse.
///
/// Registration is synchronized: during a concurrent read, multiple root
/// decode tasks push links at the same time.
#[derive(Debug, Default)]
pub struct ReferenceRegistry {
    links: Mutex<Vec<ObjectLink>>,
}

impl ReferenceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a placeholder for the patch phase.
    pub fn register(&self, link: &ObjectLink) {
        let mut links = self.links.lock().unwrap_or_else(|p| p.into_inner());
        links.push(link.clone());
    }

    /// Number of placeholders registered so far.
    pub fn len(&self) -> usize {
        let links = self.links.lock().unwrap_or_else(|p| p.into_inner());
        links.len()
    }

    /// True when nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Patches every registered link with an owning arena handle.
    ///
    /// Used for placeholders discovered in the root tree; these keep the
    /// arena alive for the container's lifetime.
    pub fn bind_owned(&self, arena: &Arc<ObjectArena>) {
        let links = self.links.lock().unwrap_or_else(|p| p.into_inner());
        for link in links.iter() {
            link.bind(ArenaBinding::Owned(Arc::clone(arena)));
        }
    }

    /// Patches every registered link with a weak back reference.
    ///
    /// Used for placeholders inside the arena's own objects, where an
    /// owning handle would turn every cyclic graph into a leak.
    pub fn bind_backref(&self, arena: &Arc<ObjectArena>) {
        let links = self.links.lock().unwrap_or_else(|p| p.into_inner());
        for link in links.iter() {
            link.bind(ArenaBinding::Backref(Arc::downgrade(arena)));
        }
    }
}
