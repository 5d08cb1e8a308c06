//! # Ancestor resolution
//!
//! Frame computation needs a common supertype wherever two reference types
//! meet. Answering that by fully loading the types involved could recurse
//! into the loader that is currently asking for a rewrite, so the resolver
//! only ever reads unit *headers*: name, superclass, interfaces and the
//! interface flag, fetched as raw bytes from the defining loader's
//! [`ResourceSource`].
//!
//! Anything it cannot find degrades to the root type. That is always a
//! correct supertype, just a less precise one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};
use weaver_unit::{read_header, TypeHierarchy, UnitHeader, ROOT_TYPE};

/// Raw unit bytes by internal name, without defining or transforming them.
pub trait ResourceSource: Send + Sync {
    fn unit_bytes(&self, name: &str) -> Option<Vec<u8>>;
}

/// Source that knows no units; every lookup degrades to the root type.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResources;

impl ResourceSource for NoResources {
    fn unit_bytes(&self, _name: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Minimal view of a type, taken from its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub is_interface: bool,
}

impl From<UnitHeader> for TypeDescriptor {
    fn from(h: UnitHeader) -> Self {
        let is_interface = h.is_interface();
        Self {
            name: h.name,
            super_name: h.super_name,
            interfaces: h.interfaces,
            is_interface,
        }
    }
}

/// Process-lifetime cache of header descriptors, keyed by unit name.
///
/// Only found types are cached, so a type that shows up later is still
/// picked up on the next query.
#[derive(Debug, Default)]
pub struct DescriptorCache {
    entries: RwLock<HashMap<String, Arc<TypeDescriptor>>>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.entries.read().get(name).cloned()
    }

    pub fn insert(&self, descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
        let mut entries = self.entries.write();
        entries
            .entry(descriptor.name.clone())
            .or_insert_with(|| Arc::new(descriptor))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// [`TypeHierarchy`] backed by unit headers from a [`ResourceSource`].
pub struct AncestorResolver<'a> {
    source: &'a dyn ResourceSource,
    cache: &'a DescriptorCache,
}

impl<'a> AncestorResolver<'a> {
    pub fn new(source: &'a dyn ResourceSource, cache: &'a DescriptorCache) -> Self {
        Self { source, cache }
    }

    /// Make a header known without going through the source, e.g. the unit
    /// currently being defined.
    pub fn seed(&self, header: &UnitHeader) {
        self.cache.insert(TypeDescriptor::from(header.clone()));
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        if let Some(found) = self.cache.get(name) {
            return Some(found);
        }
        let bytes = self.source.unit_bytes(name)?;
        match read_header(&bytes) {
            Ok(header) if header.name == name => {
                trace!(unit = name, "cached header descriptor");
                Some(self.cache.insert(header.into()))
            }
            Ok(header) => {
                debug!(requested = name, found = %header.name, "resource name mismatch");
                None
            }
            Err(e) => {
                debug!(unit = name, error = %e, "unreadable unit header");
                None
            }
        }
    }

    /// A common supertype of `a` and `b`. Never fails; unknown types and
    /// unrelated hierarchies give the root type.
    pub fn common_ancestor(&self, a: &str, b: &str) -> String {
        if a.is_empty() || b.is_empty() || a == ROOT_TYPE || b == ROOT_TYPE {
            return ROOT_TYPE.to_string();
        }
        if a == b {
            return a.to_string();
        }
        if a.starts_with('[') || b.starts_with('[') {
            return ROOT_TYPE.to_string();
        }
        let (Some(da), Some(db)) = (self.descriptor(a), self.descriptor(b)) else {
            return ROOT_TYPE.to_string();
        };
        if da.is_interface {
            return self.common_interface(&da, &db);
        }
        if db.is_interface {
            return self.common_interface(&db, &da);
        }
        self.common_class(&da, &db)
    }

    fn common_interface(&self, iface: &TypeDescriptor, other: &TypeDescriptor) -> String {
        let closure = self.interface_closure(iface);
        if other.is_interface && closure.contains(&other.name) {
            return other.name.clone();
        }
        let mut visited = HashSet::new();
        self.implemented_interface(&closure, other, &mut visited)
            .unwrap_or_else(|| ROOT_TYPE.to_string())
    }

    /// `iface` and every interface it extends, transitively.
    fn interface_closure(&self, iface: &TypeDescriptor) -> HashSet<String> {
        let mut closure = HashSet::new();
        let mut pending = vec![iface.name.clone()];
        while let Some(name) = pending.pop() {
            if !closure.insert(name.clone()) {
                continue;
            }
            let interfaces = if name == iface.name {
                iface.interfaces.clone()
            } else {
                match self.descriptor(&name) {
                    Some(d) => d.interfaces.clone(),
                    None => continue,
                }
            };
            pending.extend(interfaces);
        }
        closure
    }

    /// First interface of `start`, its super-interfaces, or its superclasses'
    /// interfaces, that is in `closure`.
    fn implemented_interface(
        &self,
        closure: &HashSet<String>,
        start: &TypeDescriptor,
        visited: &mut HashSet<String>,
    ) -> Option<String> {
        let mut current = Some(Arc::new(start.clone()));
        while let Some(d) = current {
            if !visited.insert(d.name.clone()) {
                return None;
            }
            if let Some(hit) = d.interfaces.iter().find(|i| closure.contains(*i)) {
                return Some(hit.clone());
            }
            for name in &d.interfaces {
                if let Some(parent) = self.descriptor(name) {
                    if let Some(hit) = self.implemented_interface(closure, &parent, visited) {
                        return Some(hit);
                    }
                }
            }
            current = match d.super_name.as_deref() {
                None | Some(ROOT_TYPE) => None,
                Some(s) => self.descriptor(s),
            };
        }
        None
    }

    /// Walk both superclass chains in lockstep; the first name seen twice is
    /// the nearest common superclass.
    fn common_class(&self, a: &TypeDescriptor, b: &TypeDescriptor) -> String {
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(a.name.clone());
        seen.insert(b.name.clone());

        let mut next_a = a.super_name.clone();
        let mut next_b = b.super_name.clone();
        while next_a.is_some() || next_b.is_some() {
            if let Some(name) = next_a.take() {
                if !seen.insert(name.clone()) {
                    return name;
                }
                next_a = self.super_of(&name);
            }
            if let Some(name) = next_b.take() {
                if !seen.insert(name.clone()) {
                    return name;
                }
                next_b = self.super_of(&name);
            }
        }
        ROOT_TYPE.to_string()
    }

    fn super_of(&self, name: &str) -> Option<String> {
        if name == ROOT_TYPE {
            return None;
        }
        self.descriptor(name)?.super_name.clone()
    }
}

impl TypeHierarchy for AncestorResolver<'_> {
    fn common_ancestor(&self, a: &str, b: &str) -> String {
        AncestorResolver::common_ancestor(self, a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weaver_unit::builder::UnitBuilder;

    #[derive(Default)]
    struct MapSource {
        units: HashMap<String, Vec<u8>>,
        reads: RwLock<usize>,
    }

    impl MapSource {
        fn add(mut self, builder: UnitBuilder) -> Self {
            let unit = builder.build();
            let name = unit.name().to_string();
            self.units
                .insert(name, weaver_unit::encode_unit(&unit).unwrap());
            self
        }
    }

    impl ResourceSource for MapSource {
        fn unit_bytes(&self, name: &str) -> Option<Vec<u8>> {
            *self.reads.write() += 1;
            self.units.get(name).cloned()
        }
    }

    fn world() -> MapSource {
        MapSource::default()
            .add(UnitBuilder::interface("app/Named"))
            .add(UnitBuilder::interface("app/Entity").implements("app/Named"))
            .add(UnitBuilder::interface("app/Closeable"))
            .add(UnitBuilder::new("app/Animal").implements("app/Entity"))
            .add(UnitBuilder::new("app/Dog").extends("app/Animal"))
            .add(UnitBuilder::new("app/Cat").extends("app/Animal"))
            .add(UnitBuilder::new("app/Puppy").extends("app/Dog"))
            .add(UnitBuilder::new("app/Rock"))
            .add(UnitBuilder::new("app/Tag").implements("app/Named"))
    }

    #[test]
    fn test_identical_and_root() {
        let source = world();
        let cache = DescriptorCache::new();
        let r = AncestorResolver::new(&source, &cache);
        assert_eq!(r.common_ancestor("app/Dog", "app/Dog"), "app/Dog");
        assert_eq!(r.common_ancestor("app/Dog", ROOT_TYPE), ROOT_TYPE);
        assert_eq!(r.common_ancestor("", "app/Dog"), ROOT_TYPE);
    }

    #[test]
    fn test_superclass_pair() {
        let source = world();
        let cache = DescriptorCache::new();
        let r = AncestorResolver::new(&source, &cache);
        assert_eq!(r.common_ancestor("app/Dog", "app/Animal"), "app/Animal");
        assert_eq!(r.common_ancestor("app/Animal", "app/Puppy"), "app/Animal");
    }

    #[test]
    fn test_siblings_and_cousins() {
        let source = world();
        let cache = DescriptorCache::new();
        let r = AncestorResolver::new(&source, &cache);
        assert_eq!(r.common_ancestor("app/Dog", "app/Cat"), "app/Animal");
        assert_eq!(r.common_ancestor("app/Puppy", "app/Cat"), "app/Animal");
        assert_eq!(r.common_ancestor("app/Puppy", "app/Rock"), ROOT_TYPE);
    }

    #[test]
    fn test_unrelated_interfaces_give_root() {
        let source = world();
        let cache = DescriptorCache::new();
        let r = AncestorResolver::new(&source, &cache);
        assert_eq!(r.common_ancestor("app/Named", "app/Closeable"), ROOT_TYPE);
    }

    #[test]
    fn test_interface_pairs() {
        let source = world();
        let cache = DescriptorCache::new();
        let r = AncestorResolver::new(&source, &cache);
        // app/Entity extends app/Named.
        assert_eq!(r.common_ancestor("app/Entity", "app/Named"), "app/Named");
        // Puppy reaches app/Entity through Dog and Animal.
        assert_eq!(r.common_ancestor("app/Puppy", "app/Entity"), "app/Entity");
        assert_eq!(r.common_ancestor("app/Named", "app/Tag"), "app/Named");
        assert_eq!(r.common_ancestor("app/Rock", "app/Named"), ROOT_TYPE);
    }

    #[test]
    fn test_missing_types_degrade() {
        let source = world();
        let cache = DescriptorCache::new();
        let r = AncestorResolver::new(&source, &cache);
        assert_eq!(r.common_ancestor("app/Dog", "app/Ghost"), ROOT_TYPE);
        assert_eq!(r.common_ancestor("[Lapp/Dog;", "[Lapp/Cat;"), ROOT_TYPE);
    }

    #[test]
    fn test_cycle_in_interfaces_terminates() {
        let source = MapSource::default()
            .add(UnitBuilder::interface("app/A").implements("app/B"))
            .add(UnitBuilder::interface("app/B").implements("app/A"))
            .add(UnitBuilder::interface("app/C"));
        let cache = DescriptorCache::new();
        let r = AncestorResolver::new(&source, &cache);
        assert_eq!(r.common_ancestor("app/A", "app/C"), ROOT_TYPE);
        assert_eq!(r.common_ancestor("app/A", "app/B"), "app/B");
    }

    #[test]
    fn test_headers_are_cached() {
        let source = world();
        let cache = DescriptorCache::new();
        let r = AncestorResolver::new(&source, &cache);
        r.common_ancestor("app/Dog", "app/Cat");
        let reads = *source.reads.read();
        r.common_ancestor("app/Dog", "app/Cat");
        assert_eq!(*source.reads.read(), reads);
        assert!(cache.get("app/Animal").is_some());
        assert!(cache.get("app/Ghost").is_none());
    }

    #[test]
    fn test_seeded_header_is_used() {
        let source = NoResources;
        let cache = DescriptorCache::new();
        let r = AncestorResolver::new(&source, &cache);
        let unit = UnitBuilder::new("app/Local").extends("app/Base").build();
        r.seed(&unit.header);
        let base = UnitBuilder::new("app/Base").build();
        r.seed(&base.header);
        assert_eq!(r.common_ancestor("app/Local", "app/Base"), "app/Base");
    }
}
