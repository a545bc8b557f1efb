//! The live allocations of one state.

use crate::memory::{MemoryObject, ObjectState};
use crate::{Error, RC};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct ObjectEntry {
    object: RC<MemoryObject>,
    state: RC<ObjectState>,
}

/// An ordered set of non-overlapping `MemoryObject`s and their contents.
///
/// Cloning an `AddressSpace` is cheap. The clone shares every `ObjectState`
/// with the original until one side asks for a writeable view with
/// `get_writeable`, at which point that side receives a private copy.
///
/// The generation counter advances whenever an object is bound, unbound, or
/// privately copied. The binding generation advances only on bind and
/// unbind. Anything caching which objects live where must treat a change of
/// binding generation as invalidating the cache, and anything caching
/// contents must watch the generation.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AddressSpace {
    objects: BTreeMap<u64, ObjectEntry>,
    generation: u64,
    binding_generation: u64,
    #[serde(skip)]
    last_bound: Option<RC<MemoryObject>>,
}

/// Objects occupy at least one address, so zero-sized objects stay distinct.
pub(crate) fn footprint_end(object: &MemoryObject) -> u64 {
    object.address().saturating_add(object.size().max(1))
}

impl AddressSpace {
    /// Create a new, empty `AddressSpace`.
    pub fn new() -> AddressSpace {
        AddressSpace::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Advances when the set of bound objects changes, and not on copies.
    pub fn binding_generation(&self) -> u64 {
        self.binding_generation
    }

    /// The number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The object most recently bound, if it is still live.
    pub fn last_bound(&self) -> Option<&RC<MemoryObject>> {
        self.last_bound.as_ref()
    }

    /// Bind `state` as the contents of `object`.
    ///
    /// # Panics
    /// If `object` overlaps a live object, or `state` is not the size of
    /// `object`. Both are bugs in the caller.
    pub fn bind_object(&mut self, object: RC<MemoryObject>, state: ObjectState) {
        assert_eq!(
            object.size(),
            state.size(),
            "object state size does not match {}",
            object
        );
        if let Some((_, prev)) = self.objects.range(..=object.address()).next_back() {
            assert!(
                footprint_end(&prev.object) <= object.address(),
                "{} overlaps {}",
                object,
                prev.object
            );
        }
        if let Some((_, next)) = self.objects.range(object.address()..).next() {
            assert!(
                next.object.address() >= footprint_end(&object),
                "{} overlaps {}",
                object,
                next.object
            );
        }

        self.objects.insert(
            object.address(),
            ObjectEntry {
                object: object.clone(),
                state: RC::new(state),
            },
        );
        self.last_bound = Some(object);
        self.generation += 1;
        self.binding_generation += 1;
    }

    /// Remove `object` from this address space. Returns false if it was not
    /// bound here.
    pub fn unbind_object(&mut self, object: &MemoryObject) -> bool {
        let bound = self
            .objects
            .get(&object.address())
            .map(|entry| entry.object.id() == object.id())
            .unwrap_or(false);
        if !bound {
            return false;
        }
        self.objects.remove(&object.address());
        if self
            .last_bound
            .as_ref()
            .map(|last| last.id() == object.id())
            .unwrap_or(false)
        {
            self.last_bound = None;
        }
        self.generation += 1;
        self.binding_generation += 1;
        true
    }

    /// Get the contents of `object`, if it is bound here.
    pub fn find_object(&self, object: &MemoryObject) -> Option<&ObjectState> {
        self.objects
            .get(&object.address())
            .filter(|entry| entry.object.id() == object.id())
            .map(|entry| entry.state.as_ref())
    }

    /// Get a writeable view of the contents of `object`, copying them first
    /// if they are shared with another address space.
    ///
    /// # Error
    /// `object` is not bound here, or its contents are read-only.
    pub fn get_writeable(&mut self, object: &MemoryObject) -> Result<&mut ObjectState, Error> {
        let entry = self
            .objects
            .get_mut(&object.address())
            .filter(|entry| entry.object.id() == object.id())
            .ok_or(Error::ObjectNotBound(object.address()))?;
        if entry.state.read_only() {
            return Err(Error::ReadOnly);
        }
        if RC::strong_count(&entry.state) > 1 {
            self.generation += 1;
        }
        Ok(RC::make_mut(&mut entry.state))
    }

    /// Mark the contents of `object` read-only, or writeable.
    pub fn set_read_only(&mut self, object: &MemoryObject, read_only: bool) -> Result<(), Error> {
        let entry = self
            .objects
            .get_mut(&object.address())
            .filter(|entry| entry.object.id() == object.id())
            .ok_or(Error::ObjectNotBound(object.address()))?;
        if entry.state.read_only() != read_only {
            if RC::strong_count(&entry.state) > 1 {
                self.generation += 1;
            }
            RC::make_mut(&mut entry.state).set_read_only(read_only);
        }
        Ok(())
    }

    /// Find the object containing `address`.
    pub fn resolve_one(&self, address: u64) -> Option<&RC<MemoryObject>> {
        let (_, entry) = self.objects.range(..=address).next_back()?;
        if entry.object.contains(address) {
            Some(&entry.object)
        } else {
            None
        }
    }

    /// Find the object containing `address`, and its contents.
    pub fn lookup(&self, address: u64) -> Option<(&RC<MemoryObject>, &ObjectState)> {
        let (_, entry) = self.objects.range(..=address).next_back()?;
        if entry.object.contains(address) {
            Some((&entry.object, entry.state.as_ref()))
        } else {
            None
        }
    }

    /// The first object at or above `address`.
    pub fn lower_bound(&self, address: u64) -> Option<&RC<MemoryObject>> {
        self.objects
            .range(address..)
            .next()
            .map(|(_, entry)| &entry.object)
    }

    /// The first object strictly above `address`.
    pub fn upper_bound(&self, address: u64) -> Option<&RC<MemoryObject>> {
        let start = address.checked_add(1)?;
        self.lower_bound(start)
    }

    /// The last object strictly below `address`.
    pub fn predecessor(&self, address: u64) -> Option<&RC<MemoryObject>> {
        self.objects
            .range(..address)
            .next_back()
            .map(|(_, entry)| &entry.object)
    }

    /// The live object overlapping `[address, address + size)`, if any. A
    /// zero-sized range still claims `address`.
    pub fn overlapping(&self, address: u64, size: u64) -> Option<&RC<MemoryObject>> {
        let end = address.saturating_add(size.max(1));
        let candidate = self.predecessor(end)?;
        if footprint_end(candidate) > address {
            Some(candidate)
        } else {
            None
        }
    }

    /// Returns true if an object of `size` bytes fits at `address`.
    pub fn is_free(&self, address: u64, size: u64) -> bool {
        self.overlapping(address, size).is_none()
    }

    /// Every live object, ascending by address.
    pub fn objects(&self) -> impl Iterator<Item = &RC<MemoryObject>> {
        self.objects.values().map(|entry| &entry.object)
    }

    /// Every live object with its contents, ascending by address.
    pub fn pairs(&self) -> impl Iterator<Item = (&RC<MemoryObject>, &ObjectState)> {
        self.objects
            .values()
            .map(|entry| (&entry.object, entry.state.as_ref()))
    }

    /// The union of every live object as `[begin, end)` ranges, with
    /// adjacent objects merged.
    pub fn extents(&self) -> Vec<(u64, u64)> {
        let mut extents: Vec<(u64, u64)> = Vec::new();
        for object in self.objects() {
            if object.size() == 0 {
                continue;
            }
            match extents.last_mut() {
                Some(last) if last.1 == object.address() => last.1 = object.end(),
                _ => extents.push((object.address(), object.end())),
            }
        }
        extents
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (object, state) in self.pairs() {
            writeln!(
                f,
                "{}{} {}",
                object,
                if state.read_only() { " ro" } else { "" },
                object.alloc_info()
            )?;
        }
        Ok(())
    }
}
