//! A small, direct-mapped cache from addresses to `MemoryObject`s.
//!
//! A `Tlb` belongs to one state. Every entry was cached under a stamp of
//! (state id, binding generation of the address space), and when either
//! changes the whole cache is dropped. Cached objects are therefore always
//! bound in the address space the stamp names. Copy-on-write copies of
//! contents do not move the binding generation, so they keep the cache.

use crate::memory::{AddressSpace, MemoryObject};
use crate::RC;
use log::trace;

/// The number of entries in a `Tlb`.
pub const TLB_ENTRIES: usize = 64;

/// The granule of `Tlb` indexing, and the length of an explicit TLB insert.
pub const TLB_PAGE_SIZE: u64 = 4096;

#[derive(Clone, Debug)]
pub struct Tlb {
    entries: Vec<Option<RC<MemoryObject>>>,
    stamp: Option<(u64, u64)>,
    hits: u64,
    misses: u64,
}

impl Default for Tlb {
    fn default() -> Tlb {
        Tlb::new()
    }
}

impl Tlb {
    pub fn new() -> Tlb {
        Tlb {
            entries: vec![None; TLB_ENTRIES],
            stamp: None,
            hits: 0,
            misses: 0,
        }
    }

    fn index(address: u64) -> usize {
        ((address / TLB_PAGE_SIZE) % TLB_ENTRIES as u64) as usize
    }

    fn validate(&mut self, state_id: u64, space: &AddressSpace) {
        let stamp = (state_id, space.binding_generation());
        if self.stamp != Some(stamp) {
            if self.stamp.is_some() {
                trace!("tlb stamp changed to {:?}, dropping entries", stamp);
            }
            self.clear();
            self.stamp = Some(stamp);
        }
    }

    /// Find the cached object containing `address`.
    pub fn get(
        &mut self,
        state_id: u64,
        space: &AddressSpace,
        address: u64,
    ) -> Option<RC<MemoryObject>> {
        self.validate(state_id, space);
        let hit = self.entries[Tlb::index(address)]
            .as_ref()
            .filter(|object| object.is_in_bounds(address, 1))
            .cloned();
        if hit.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        hit
    }

    /// Cache `object`, which must be bound in `space`, in the slot of its
    /// address.
    pub fn put(&mut self, state_id: u64, space: &AddressSpace, object: RC<MemoryObject>) {
        self.validate(state_id, space);
        let index = Tlb::index(object.address());
        self.entries[index] = Some(object);
    }

    /// Drop the entry in the slot of `address`.
    pub fn invalidate(&mut self, address: u64) {
        self.entries[Tlb::index(address)] = None;
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|entry| *entry = None);
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
