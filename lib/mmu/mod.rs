//! Memory dispatch.
//!
//! An `Mmu` services one memory operation on one state, producing the states
//! which continue after it. Strategies compose: `DualMmu` tries one strategy
//! and hands what it declines to another, so a concrete fast path can sit in
//! front of the full symbolic machinery.
//!
//! | `MmuKind`      | First                | Second      |
//! |----------------|----------------------|-------------|
//! | `Generic`      | `GenericMmu`         |             |
//! | `Dual`         | `ConcreteMmu`        | `GenericMmu`|
//! | `Sym`          | `ConcreteMmu`        | `SymMmu`    |
//! | `SoftConcrete` | `SoftConcreteMmu`    | `SymMmu`    |

mod concrete;
mod dual;
mod generic;
mod soft_concrete;
mod sym;

pub use self::concrete::ConcreteMmu;
pub use self::dual::DualMmu;
pub use self::generic::GenericMmu;
pub use self::soft_concrete::SoftConcreteMmu;
pub use self::sym::{ForwardingHandler, SoftHandler, SymMmu};

use crate::executor::{ExecutionState, Executor, MmuKind, Options, READONLY_ERR};
use crate::il;
use crate::memory::{assemble_value, split_value, width_to_bytes, MemoryObject};
use crate::{Error, RC};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A load or a store.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MemOp {
    address: il::Expression,
    value: Option<il::Expression>,
    bits: usize,
    target: Option<String>,
}

impl MemOp {
    /// Load `bits` bits from `address`, binding the result to the local
    /// `target`.
    pub fn load<S: Into<String>>(address: il::Expression, bits: usize, target: S) -> MemOp {
        MemOp {
            address,
            value: None,
            bits,
            target: Some(target.into()),
        }
    }

    /// Store `value` to `address`. The width of the store is the width of
    /// `value`.
    pub fn store(address: il::Expression, value: il::Expression) -> MemOp {
        MemOp {
            address,
            bits: value.bits(),
            value: Some(value),
            target: None,
        }
    }

    pub fn address(&self) -> &il::Expression {
        &self.address
    }

    /// The value stored, if this is a store.
    pub fn value(&self) -> Option<&il::Expression> {
        self.value.as_ref()
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    /// The local a load binds its result to.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn is_write(&self) -> bool {
        self.value.is_some()
    }

    /// The number of bytes this operation touches.
    pub fn bytes(&self) -> Result<u64, Error> {
        width_to_bytes(self.bits)
    }

    /// Substitute the values `state` fixes into the address and value.
    pub fn simplified(&self, state: &ExecutionState) -> Result<MemOp, Error> {
        let address = match self.address.get_constant() {
            Some(_) => self.address.clone(),
            None => state.simplify_expression(&self.address)?,
        };
        let value = match self.value {
            Some(ref value) if value.get_constant().is_none() => {
                Some(state.simplify_expression(value)?)
            }
            ref value => value.clone(),
        };
        Ok(MemOp {
            address,
            value,
            bits: self.bits,
            target: self.target.clone(),
        })
    }
}

impl fmt::Display for MemOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.value {
            Some(ref value) => write!(f, "store.{} [{}] <- {}", self.bits, self.address, value),
            None => write!(
                f,
                "load.{} [{}] -> {}",
                self.bits,
                self.address,
                self.target.as_deref().unwrap_or("_")
            ),
        }
    }
}

/// The outcome of offering a memory operation to an `Mmu`.
#[derive(Debug)]
pub enum Dispatch {
    /// The operation was handled. These states continue, in order. Every
    /// other state the operation produced was terminated.
    Serviced(Vec<ExecutionState>),
    /// The operation is not for this `Mmu`. The state is returned untouched.
    Declined(ExecutionState),
}

impl Dispatch {
    pub fn is_serviced(&self) -> bool {
        matches!(self, Dispatch::Serviced(_))
    }
}

/// A memory dispatch strategy.
pub trait Mmu: fmt::Debug {
    /// Service `mop` on `state`, or decline it.
    fn execute(
        &self,
        executor: &mut Executor,
        state: ExecutionState,
        mop: &MemOp,
    ) -> Result<Dispatch, Error>;
}

/// Create the `Mmu` `options` select.
pub fn create(options: &Options) -> RC<dyn Mmu> {
    match options.mmu() {
        MmuKind::Generic => RC::new(GenericMmu::new()),
        MmuKind::Dual => RC::new(DualMmu::new(
            Box::new(ConcreteMmu::new()),
            Box::new(GenericMmu::new()),
        )),
        MmuKind::Sym => RC::new(DualMmu::new(
            Box::new(ConcreteMmu::new()),
            Box::new(SymMmu::with_default_helpers(options.helper_suffix())),
        )),
        MmuKind::SoftConcrete => RC::new(DualMmu::new(
            Box::new(SoftConcreteMmu::new(SymMmu::with_default_helpers(
                options.helper_suffix(),
            ))),
            Box::new(SymMmu::with_default_helpers(options.helper_suffix())),
        )),
    }
}

fn readonly_error(executor: &mut Executor, state: ExecutionState, mop: &MemOp) {
    let info = executor.address_info(&state, mop.address());
    executor.terminate_error(
        state,
        READONLY_ERR,
        format!("memory error: object read only\n{}", info),
    );
}

/// Perform `mop` on `object`, which `mop` accesses at `offset`, entirely in
/// bounds.
///
/// Returns `None` if the state was terminated.
pub(crate) fn commit(
    executor: &mut Executor,
    mut state: ExecutionState,
    mop: &MemOp,
    object: &MemoryObject,
    offset: &il::Expression,
) -> Result<Option<ExecutionState>, Error> {
    if offset.get_constant().is_none() {
        executor.count_sym_access(mop.is_write());
    }

    let contents = state
        .address_space()
        .find_object(object)
        .ok_or_else(|| Error::ObjectNotBound(object.address()))?;

    match mop.value() {
        Some(value) => {
            if contents.read_only() {
                readonly_error(executor, state, mop);
                return Ok(None);
            }
            state
                .address_space_mut()
                .get_writeable(object)?
                .write(offset, value)?;
        }
        None => {
            let value = contents.read(offset, mop.bits())?;
            if let Some(target) = mop.target() {
                state.bind_local(target, value);
            }
        }
    }
    Ok(Some(state))
}

/// Perform `mop` one byte at a time. `targets` holds, in memory order, the
/// object and offset of every byte `mop` touches.
///
/// Nothing is written unless every byte is writeable. Returns `None` if the
/// state was terminated.
pub(crate) fn commit_bytes(
    executor: &mut Executor,
    mut state: ExecutionState,
    mop: &MemOp,
    targets: &[(RC<MemoryObject>, il::Expression)],
) -> Result<Option<ExecutionState>, Error> {
    if targets
        .iter()
        .any(|(_, offset)| offset.get_constant().is_none())
    {
        executor.count_sym_access(mop.is_write());
    }
    let endian = executor.options().endian();

    match mop.value() {
        Some(value) => {
            for (object, _) in targets {
                let read_only = state
                    .address_space()
                    .find_object(object)
                    .ok_or_else(|| Error::ObjectNotBound(object.address()))?
                    .read_only();
                if read_only {
                    readonly_error(executor, state, mop);
                    return Ok(None);
                }
            }
            let bytes = split_value(value, endian)?;
            for ((object, offset), byte) in targets.iter().zip(bytes.iter()) {
                state
                    .address_space_mut()
                    .get_writeable(object)?
                    .write(offset, byte)?;
            }
        }
        None => {
            let mut values = Vec::with_capacity(targets.len());
            for (object, offset) in targets {
                let contents = state
                    .address_space()
                    .find_object(object)
                    .ok_or_else(|| Error::ObjectNotBound(object.address()))?;
                values.push(contents.read(offset, 8)?);
            }
            let value = assemble_value(values, mop.bits(), endian)?;
            if let Some(target) = mop.target() {
                state.bind_local(target, value);
            }
        }
    }
    Ok(Some(state))
}

/// Find the object holding `bytes` bytes at the constant `address`, through
/// the TLB when it is enabled.
pub(crate) fn lookup_constant(
    executor: &Executor,
    state: &mut ExecutionState,
    address: u64,
    bytes: u64,
) -> Option<RC<MemoryObject>> {
    let use_tlb = executor.options().use_tlb();
    if use_tlb {
        if let Some(object) = state.tlb_get(address) {
            if object.is_in_bounds(address, bytes) {
                return Some(object);
            }
        }
    }

    let object = state.address_space().resolve_one(address)?.clone();
    if use_tlb {
        state.tlb_put(object.clone());
    }
    if object.is_in_bounds(address, bytes) {
        Some(object)
    } else {
        None
    }
}

/// The constant offset of `address` into `object`.
pub(crate) fn constant_offset(object: &MemoryObject, address: u64) -> il::Expression {
    il::expr_const(address - object.address(), crate::POINTER_BITS)
}
