//! The solver contract.
//!
//! Symmu never decides satisfiability itself. Every question about a symbolic
//! address is phrased as one of three queries over the path constraints of a
//! state, and answered by an implementation of `Solver`. Queries may fail,
//! and a failure is an ordinary outcome: the memory subsystem terminates only
//! the affected state.

mod enumerating;

pub use self::enumerating::EnumSolver;

use crate::il;
use thiserror::Error;

/// The ways a solver query can fail.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum SolverFailure {
    #[error("solver query timed out")]
    Timeout,
    #[error("constraints are unsatisfiable")]
    Unsatisfiable,
    #[error("internal solver error: {0}")]
    Internal(String),
}

/// A decision procedure over `il::Expression`.
///
/// `constraints` are 1-bit expressions which all hold on the current path.
/// Implementations may assume the constraints themselves are satisfiable.
pub trait Solver: std::fmt::Debug {
    /// Is `expr` true under every assignment satisfying `constraints`?
    fn must_be_true(
        &mut self,
        constraints: &[il::Expression],
        expr: &il::Expression,
    ) -> Result<bool, SolverFailure>;

    /// Is `expr` true under some assignment satisfying `constraints`?
    fn may_be_true(
        &mut self,
        constraints: &[il::Expression],
        expr: &il::Expression,
    ) -> Result<bool, SolverFailure>;

    /// A value of `expr` under some assignment satisfying `constraints`.
    fn get_value(
        &mut self,
        constraints: &[il::Expression],
        expr: &il::Expression,
    ) -> Result<il::Constant, SolverFailure>;
}
