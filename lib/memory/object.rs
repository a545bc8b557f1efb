//! The identity of one allocation.

use crate::executor::eval;
use crate::il;
use crate::memory::ObjectFlags;
use crate::{Error, POINTER_BITS};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The key of an allocation: where it was allocated, and how many times that
/// site had allocated before in the allocating state.
///
/// Repeated allocations at one site in forked states receive the same key, and
/// memory managers use it to give them the same identity.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct MallocKey {
    alloc_site: Option<u64>,
    iteration: u32,
}

impl MallocKey {
    pub fn new(alloc_site: Option<u64>, iteration: u32) -> MallocKey {
        MallocKey {
            alloc_site,
            iteration,
        }
    }

    /// The allocation site, usually the address of the allocating
    /// instruction. Anonymous allocations have no site.
    pub fn alloc_site(&self) -> Option<u64> {
        self.alloc_site
    }

    /// The number of prior allocations at this site in the allocating state.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }
}

/// An allocated range of memory.
///
/// A `MemoryObject` never changes once created. Its contents live in an
/// `ObjectState`, and the pairing between the two is held by an
/// `AddressSpace`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MemoryObject {
    id: u64,
    address: u64,
    size: u64,
    flags: ObjectFlags,
    malloc_key: MallocKey,
    name: Option<String>,
}

impl MemoryObject {
    /// Create a new `MemoryObject`. Memory managers hand these out, and
    /// ensure `id` is unique.
    pub fn new(
        id: u64,
        address: u64,
        size: u64,
        flags: ObjectFlags,
        malloc_key: MallocKey,
    ) -> MemoryObject {
        MemoryObject {
            id,
            address,
            size,
            flags,
            malloc_key,
            name: None,
        }
    }

    /// Give this `MemoryObject` a name, used in diagnostics.
    pub fn with_name<S: Into<String>>(mut self, name: S) -> MemoryObject {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// The size of this object in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The first address past the end of this object.
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    pub fn is_local(&self) -> bool {
        self.flags.contains(ObjectFlags::LOCAL)
    }

    pub fn is_global(&self) -> bool {
        self.flags.contains(ObjectFlags::GLOBAL)
    }

    pub fn is_fixed(&self) -> bool {
        self.flags.contains(ObjectFlags::FIXED)
    }

    pub fn malloc_key(&self) -> &MallocKey {
        &self.malloc_key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns true if `address` falls within this object. A zero-sized
    /// object contains only its own address.
    pub fn contains(&self, address: u64) -> bool {
        if self.size == 0 {
            address == self.address
        } else {
            address >= self.address && address - self.address < self.size
        }
    }

    /// Returns true if `[address, address + bytes)` lies within this object.
    ///
    /// An access wider than the object is never in bounds, and the arithmetic
    /// never overflows.
    pub fn is_in_bounds(&self, address: u64, bytes: u64) -> bool {
        if bytes > self.size || address < self.address {
            return false;
        }
        address - self.address <= self.size - bytes
    }

    /// The address of this object as an expression.
    pub fn base_expr(&self) -> il::Expression {
        il::expr_const(self.address, POINTER_BITS)
    }

    /// The size of this object as an expression.
    pub fn size_expr(&self) -> il::Expression {
        il::expr_const(self.size, POINTER_BITS)
    }

    /// The offset of `pointer` into this object, `pointer - address`.
    pub fn offset_expr(&self, pointer: &il::Expression) -> Result<il::Expression, Error> {
        eval::simplify(&il::Expression::sub(pointer.clone(), self.base_expr())?)
    }

    /// A boolean expression which holds when an access of `bytes` bytes at
    /// `offset` lies within this object.
    pub fn bounds_check_offset(
        &self,
        offset: &il::Expression,
        bytes: u64,
    ) -> Result<il::Expression, Error> {
        if bytes <= self.size {
            eval::simplify(&il::Expression::cmpltu(
                offset.clone(),
                il::expr_const(self.size - bytes + 1, POINTER_BITS),
            )?)
        } else {
            Ok(il::expr_false())
        }
    }

    /// A boolean expression which holds when an access of `bytes` bytes at
    /// `pointer` lies within this object.
    pub fn bounds_check_pointer(
        &self,
        pointer: &il::Expression,
        bytes: u64,
    ) -> Result<il::Expression, Error> {
        self.bounds_check_offset(&self.offset_expr(pointer)?, bytes)
    }

    /// A boolean expression which holds when `pointer` points into this
    /// object.
    pub fn contains_expr(&self, pointer: &il::Expression) -> Result<il::Expression, Error> {
        self.bounds_check_pointer(pointer, 1)
    }

    /// A description of where this object came from, for error messages.
    pub fn alloc_info(&self) -> String {
        let site = match self.malloc_key.alloc_site() {
            Some(site) => format!("site 0x{:x}", site),
            None => "an anonymous site".to_string(),
        };
        format!(
            "MO{}[{}] allocated at {} (iteration {})",
            self.id,
            self.size,
            site,
            self.malloc_key.iteration()
        )
    }
}

impl fmt::Display for MemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name {
            Some(ref name) => write!(
                f,
                "MO{}({})[0x{:x}, 0x{:x})",
                self.id,
                name,
                self.address,
                self.end()
            ),
            None => write!(f, "MO{}[0x{:x}, 0x{:x})", self.id, self.address, self.end()),
        }
    }
}
