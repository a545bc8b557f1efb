//! The memory model of a symbolic state.
//!
//! Memory is a set of disjoint allocations. Each allocation is a
//! `MemoryObject`, which never changes, paired with an `ObjectState`, which
//! holds its byte contents. An `AddressSpace` holds the pairs live in one
//! state, ordered by address, and shares `ObjectState`s copy-on-write with the
//! address spaces of forked states.
//!
//! Around the address space sit a per-state translation cache (`Tlb`), the
//! memory managers which decide where new objects live, and the `Resolver`,
//! which asks the solver which objects a symbolic address may reference.

mod address_space;
mod deterministic;
mod manager;
mod object;
mod object_state;
mod resolver;
mod tlb;

pub use self::address_space::AddressSpace;
pub use self::deterministic::DeterministicMemoryManager;
pub use self::manager::{HeapMemoryManager, MemoryManager, MAX_ALLOC_DEFAULT};
pub use self::object::{MallocKey, MemoryObject};
pub use self::object_state::{Byte, ObjectState, Run, Update, UpdateList};
pub(crate) use self::object_state::{assemble_value, split_value, width_to_bytes};
pub use self::resolver::{Resolution, Resolver};
pub use self::tlb::{Tlb, TLB_ENTRIES, TLB_PAGE_SIZE};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// The byte order of multi-byte values in memory.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Endian {
    Big,
    Little,
}

impl Default for Endian {
    fn default() -> Endian {
        Endian::Little
    }
}

bitflags! {
    /// Properties of an allocation.
    #[derive(Deserialize, Serialize)]
    pub struct ObjectFlags: u32 {
        const LOCAL          = 0b0001;
        const GLOBAL         = 0b0010;
        /// Placed at an address chosen by the caller.
        const FIXED          = 0b0100;
        const USER_SPECIFIED = 0b1000;
    }
}
