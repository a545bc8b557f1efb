//! Symmu: symbolic address resolution and memory dispatch.
//!
//! Symmu is the memory subsystem of a symbolic executor. Given a load or a
//! store whose address and value may be symbolic, it decides which live
//! allocations the access may touch, services the access directly when it
//! can, splits the program state once per feasible target when it cannot, and
//! terminates states which may access memory out of bounds.
//!
//! The pieces, from the bottom up:
//!
//! * [`il`] - A small expression language over bit-vectors.
//! * [`solver`] - The `Solver` contract, and a bounded enumerating solver.
//! * [`memory`] - Memory objects, their byte contents, the per-state address
//!   space, the translation cache, memory managers and the address resolver.
//! * [`mmu`] - Memory dispatch strategies and their composition.
//! * [`executor`] - Execution states, forking, termination and options.
//!
//! ```
//! use symmu::executor::{Executor, Options};
//! use symmu::il;
//! use symmu::mmu::MemOp;
//! use symmu::solver::EnumSolver;
//!
//! # fn example() -> Result<(), symmu::Error> {
//! let mut executor = Executor::new(Box::new(EnumSolver::new()), Options::default());
//! let mut state = executor.new_state();
//! let object = executor.allocate(&mut state, 16, false, false, Some(0x400))?;
//!
//! let store = MemOp::store(il::expr_const(object.address(), 64), il::expr_const(0x41, 8));
//! let mut states = executor.execute_memop(state, &store)?;
//!
//! let load = MemOp::load(il::expr_const(object.address(), 64), 8, "r");
//! let states = executor.execute_memop(states.remove(0), &load)?;
//! assert_eq!(states[0].local("r"), Some(&il::expr_const(0x41, 8)));
//! # Ok(())
//! # }
//! ```

pub mod executor;
pub mod il;
pub mod memory;
pub mod mmu;
pub mod solver;
#[cfg(test)]
mod tests;

use thiserror::Error;

#[cfg(not(feature = "thread_safe"))]
use std::rc::Rc;
#[cfg(not(feature = "thread_safe"))]
pub type RC<T> = Rc<T>;

#[cfg(feature = "thread_safe")]
use std::sync::Arc;
#[cfg(feature = "thread_safe")]
pub type RC<T> = Arc<T>;

/// The width, in bits, of addresses and sizes.
pub const POINTER_BITS: usize = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error in evaluation of arithmetic expression: {0}")]
    Arithmetic(String),
    #[error("Invalid access width of {0} bits")]
    BadWidth(usize),
    #[error("Allocation of {0} bytes exceeds the maximum allocation size")]
    BadAllocationSize(u64),
    #[error("{0}")]
    Custom(String),
    #[error("Could not find a free address for an allocation of {0} bytes")]
    OutOfAddressSpace(u64),
    #[error("Address 0x{0:x} is already allocated")]
    AddressInUse(u64),
    #[error("Memory operation was not serviced by any memory dispatcher")]
    MmuDispatch,
    #[error("No software memory helper named {0}")]
    MissingHelper(String),
    #[error("Memory object at 0x{0:x} is not bound in this address space")]
    ObjectNotBound(u64),
    #[error("Access of {bytes} bytes at offset {offset} out of bounds of a {size} byte object")]
    OutOfBounds { offset: u64, bytes: u64, size: u64 },
    #[error("Write to a read-only object")]
    ReadOnly,
    #[error("Sort error, invalid bitness between expressions or bad bitness")]
    Sort,
    #[error("Unbound scalar {0} during evaluation")]
    UnboundScalar(String),
    #[error("Solver failure: {0}")]
    Solver(#[from] solver::SolverFailure),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Error: {0}, Caused by: {1}")]
    Chain(Box<Error>, Box<Error>),
}

impl Error {
    pub fn chain(self, other: Error) -> Error {
        Error::Chain(Box::new(self), Box::new(other))
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Error {
        Error::Custom(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Error {
        Error::Custom(s)
    }
}
