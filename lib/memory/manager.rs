//! Deciding where new objects live.

use crate::executor::{ExecutionState, Options};
use crate::memory::address_space::footprint_end;
use crate::memory::{AddressSpace, MallocKey, MemoryObject, ObjectFlags, TLB_PAGE_SIZE};
use crate::{Error, RC};
use log::{debug, trace, warn};
use rustc_hash::FxHashMap;
use std::fmt;

/// The largest allocation attempted unless configured otherwise, 512 MiB.
pub const MAX_ALLOC_DEFAULT: u64 = 512 * 1024 * 1024;

/// Space left between consecutive heap allocations.
const HEAP_GAP: u64 = 16;

/// Round `address` up to a multiple of `alignment`, which is a power of two.
/// An alignment of zero is treated as one.
pub(crate) fn align_up(address: u64, alignment: u64) -> Option<u64> {
    let alignment = alignment.max(1);
    let mask = alignment - 1;
    address.checked_add(mask).map(|address| address & !mask)
}

/// A policy for assigning addresses to new `MemoryObject`s.
///
/// Implementations only choose addresses. Binding the new objects into an
/// address space is left to the caller, which is usually the `Executor`.
pub trait MemoryManager: fmt::Debug {
    /// Choose an address for `size` bytes, aligned to `alignment`, which does
    /// not overlap any object in `space`. Anonymous allocations have no
    /// address space.
    fn reserve(
        &mut self,
        space: Option<&AddressSpace>,
        num_allocs: u64,
        key: &MallocKey,
        size: u64,
        alignment: u64,
    ) -> Result<u64, Error>;

    /// A fresh, unique object id.
    fn next_object_id(&mut self) -> u64;

    /// The largest allocation this manager attempts. Zero means no limit.
    fn max_alloc(&self) -> u64;

    /// Fail allocations larger than `max_alloc`.
    fn check_size(&self, size: u64) -> Result<(), Error> {
        let max_alloc = self.max_alloc();
        if max_alloc != 0 && size > max_alloc {
            warn!("failing large alloc: {} bytes", size);
            return Err(Error::BadAllocationSize(size));
        }
        Ok(())
    }

    /// Allocate `size` bytes, 8-byte aligned.
    fn allocate(
        &mut self,
        state: Option<&mut ExecutionState>,
        size: u64,
        flags: ObjectFlags,
        alloc_site: Option<u64>,
    ) -> Result<RC<MemoryObject>, Error> {
        self.allocate_aligned(state, size, 8, flags, alloc_site)
    }

    /// Allocate `size` bytes at an address which is a multiple of
    /// `alignment`.
    fn allocate_aligned(
        &mut self,
        state: Option<&mut ExecutionState>,
        size: u64,
        alignment: u64,
        flags: ObjectFlags,
        alloc_site: Option<u64>,
    ) -> Result<RC<MemoryObject>, Error> {
        self.check_size(size)?;
        let (key, address) = match state {
            Some(state) => {
                let key = MallocKey::new(alloc_site, state.next_malloc_iteration(alloc_site));
                let address = self.reserve(
                    Some(state.address_space()),
                    state.num_allocs(),
                    &key,
                    size,
                    alignment,
                )?;
                state.count_allocation();
                (key, address)
            }
            None => {
                let key = MallocKey::new(alloc_site, 0);
                let address = self.reserve(None, 0, &key, size, alignment)?;
                (key, address)
            }
        };
        let object = MemoryObject::new(self.next_object_id(), address, size, flags, key);
        debug!("allocated {}", object);
        Ok(RC::new(object))
    }

    /// Allocate `size` bytes as consecutive page-sized objects, page aligned.
    /// Every page shares one allocation key. A trailing partial page is
    /// rounded up to a whole page.
    fn allocate_aligned_chopped(
        &mut self,
        state: &mut ExecutionState,
        size: u64,
        flags: ObjectFlags,
        alloc_site: Option<u64>,
    ) -> Result<Vec<RC<MemoryObject>>, Error> {
        self.check_size(size)?;
        if size == 0 {
            return Err(Error::BadAllocationSize(0));
        }
        let pages = (size + TLB_PAGE_SIZE - 1) / TLB_PAGE_SIZE;
        let key = MallocKey::new(alloc_site, state.next_malloc_iteration(alloc_site));
        let address = self.reserve(
            Some(state.address_space()),
            state.num_allocs(),
            &key,
            pages * TLB_PAGE_SIZE,
            TLB_PAGE_SIZE,
        )?;
        state.count_allocation();

        let mut objects = Vec::with_capacity(pages as usize);
        for page in 0..pages {
            let object = MemoryObject::new(
                self.next_object_id(),
                address + page * TLB_PAGE_SIZE,
                TLB_PAGE_SIZE,
                flags,
                key.clone(),
            );
            trace!("allocated page {}", object);
            objects.push(RC::new(object));
        }
        Ok(objects)
    }

    /// Create an object at `address`, which the caller chose. The object is
    /// global and fixed.
    ///
    /// # Error
    /// The range is already occupied in the address space of `state`.
    fn allocate_fixed(
        &mut self,
        state: Option<&mut ExecutionState>,
        address: u64,
        size: u64,
        alloc_site: Option<u64>,
    ) -> Result<RC<MemoryObject>, Error> {
        let iteration = match state {
            Some(state) => {
                if !state.address_space().is_free(address, size) {
                    return Err(Error::AddressInUse(address));
                }
                state.count_allocation();
                state.next_malloc_iteration(alloc_site)
            }
            None => 0,
        };
        let object = MemoryObject::new(
            self.next_object_id(),
            address,
            size,
            ObjectFlags::GLOBAL | ObjectFlags::FIXED,
            MallocKey::new(alloc_site, iteration),
        );
        debug!("allocated fixed {}", object);
        Ok(RC::new(object))
    }

    /// Create an object for `state` at an address the program asked for.
    ///
    /// # Error
    /// The range is already occupied.
    fn allocate_at(
        &mut self,
        state: &mut ExecutionState,
        address: u64,
        size: u64,
        alloc_site: Option<u64>,
    ) -> Result<RC<MemoryObject>, Error> {
        self.check_size(size)?;
        if let Some(object) = state.address_space().overlapping(address, size) {
            warn!("0x{:x} is already taken by {}", address, object);
            return Err(Error::AddressInUse(address));
        }
        let key = MallocKey::new(alloc_site, state.next_malloc_iteration(alloc_site));
        state.count_allocation();
        let object = MemoryObject::new(
            self.next_object_id(),
            address,
            size,
            ObjectFlags::GLOBAL | ObjectFlags::USER_SPECIFIED,
            key,
        );
        debug!("allocated {} at user request", object);
        Ok(RC::new(object))
    }
}

/// Assigns addresses from a bump cursor, and gives an allocation the address
/// an earlier allocation with the same key received whenever it still fits.
///
/// Forked states which repeat the same allocation sequence therefore see the
/// same addresses.
#[derive(Clone, Debug)]
pub struct HeapMemoryManager {
    next_id: u64,
    cursor: u64,
    anon_cursor: u64,
    max_address: u64,
    max_alloc: u64,
    heap_objects: FxHashMap<MallocKey, Vec<(u64, u64)>>,
}

impl HeapMemoryManager {
    pub fn new(options: &Options) -> HeapMemoryManager {
        HeapMemoryManager {
            next_id: 1,
            cursor: options.min_address(),
            anon_cursor: options.anon_address(),
            max_address: options.max_address(),
            max_alloc: options.max_alloc(),
            heap_objects: FxHashMap::default(),
        }
    }

    fn reserve_anonymous(&mut self, size: u64, alignment: u64) -> Result<u64, Error> {
        let address = align_up(self.anon_cursor, alignment).ok_or(Error::OutOfAddressSpace(size))?;
        self.anon_cursor = address
            .checked_add(size.max(1) + HEAP_GAP)
            .ok_or(Error::OutOfAddressSpace(size))?;
        Ok(address)
    }
}

impl MemoryManager for HeapMemoryManager {
    fn reserve(
        &mut self,
        space: Option<&AddressSpace>,
        _num_allocs: u64,
        key: &MallocKey,
        size: u64,
        alignment: u64,
    ) -> Result<u64, Error> {
        let space = match space {
            Some(space) => space,
            None => return self.reserve_anonymous(size, alignment),
        };

        // smallest earlier block for this key which fits and is free here
        if let Some(blocks) = self.heap_objects.get(key) {
            let reuse = blocks
                .iter()
                .filter(|&&(address, block_size)| {
                    size <= block_size
                        && align_up(address, alignment) == Some(address)
                        && space.is_free(address, size)
                })
                .min_by_key(|&&(_, block_size)| block_size);
            if let Some(&(address, _)) = reuse {
                trace!("reusing 0x{:x} for {:?}", address, key);
                return Ok(address);
            }
        }

        let mut address = align_up(self.cursor, alignment).ok_or(Error::OutOfAddressSpace(size))?;
        let end = loop {
            let end = address
                .checked_add(size.max(1))
                .filter(|&end| end <= self.max_address)
                .ok_or(Error::OutOfAddressSpace(size))?;
            match space.overlapping(address, size) {
                Some(object) => {
                    address = align_up(footprint_end(object), alignment)
                        .ok_or(Error::OutOfAddressSpace(size))?
                }
                None => break end,
            }
        };
        self.cursor = end + HEAP_GAP;
        self.heap_objects
            .entry(key.clone())
            .or_default()
            .push((address, size));
        Ok(address)
    }

    fn next_object_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn max_alloc(&self) -> u64 {
        self.max_alloc
    }
}
