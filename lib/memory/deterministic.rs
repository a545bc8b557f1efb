use crate::executor::Options;
use crate::memory::address_space::footprint_end;
use crate::memory::manager::align_up;
use crate::memory::{AddressSpace, MallocKey, MemoryManager};
use crate::Error;
use log::trace;

/// Assigns addresses as a function of the allocating state alone.
///
/// A state's next object goes immediately after the object it bound last, or,
/// before it has bound anything, `num_allocs * size` bytes into the window.
/// The scan steps over live objects and wraps to the bottom of the window
/// once. Two runs performing the same allocations see the same addresses,
/// whatever other states did in between.
#[derive(Clone, Debug)]
pub struct DeterministicMemoryManager {
    next_id: u64,
    min_address: u64,
    max_address: u64,
    anon_cursor: u64,
    max_alloc: u64,
}

impl DeterministicMemoryManager {
    pub fn new(options: &Options) -> DeterministicMemoryManager {
        DeterministicMemoryManager {
            next_id: 1,
            min_address: options.min_address(),
            max_address: options.max_address(),
            anon_cursor: options.anon_address(),
            max_alloc: options.max_alloc(),
        }
    }

    fn find_free(
        &self,
        space: &AddressSpace,
        num_allocs: u64,
        size: u64,
        alignment: u64,
    ) -> Result<u64, Error> {
        let mut address = match space.last_bound() {
            Some(last) => footprint_end(last),
            None => self
                .min_address
                .saturating_add(num_allocs.saturating_mul(size)),
        };

        let mut wrapped = false;
        loop {
            let candidate = align_up(address, alignment)
                .filter(|&candidate| {
                    candidate
                        .checked_add(size.max(1))
                        .map(|end| end <= self.max_address)
                        .unwrap_or(false)
                });
            let candidate = match candidate {
                Some(candidate) => candidate,
                None => {
                    if wrapped {
                        return Err(Error::OutOfAddressSpace(size));
                    }
                    trace!("wrapping allocation scan for {} bytes", size);
                    wrapped = true;
                    address = self.min_address;
                    continue;
                }
            };
            match space.overlapping(candidate, size) {
                Some(object) => address = footprint_end(object),
                None => return Ok(candidate),
            }
        }
    }
}

impl MemoryManager for DeterministicMemoryManager {
    fn reserve(
        &mut self,
        space: Option<&AddressSpace>,
        num_allocs: u64,
        _key: &MallocKey,
        size: u64,
        alignment: u64,
    ) -> Result<u64, Error> {
        match space {
            Some(space) => self.find_free(space, num_allocs, size, alignment),
            None => {
                let address = align_up(self.anon_cursor, alignment)
                    .ok_or(Error::OutOfAddressSpace(size))?;
                self.anon_cursor = address
                    .checked_add(size.max(1))
                    .ok_or(Error::OutOfAddressSpace(size))?;
                Ok(address)
            }
        }
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
