//! Execution states, and the executor which forks and terminates them.
//!
//! The `Executor` is the context every memory dispatcher works against. It
//! owns the solver, the memory manager and the installed `Mmu`, hands out
//! state ids, forks states along conditions, and records why states were
//! terminated.

pub mod eval;
mod options;
mod state;

pub use self::options::{MemoryManagerKind, MmuKind, Options, OptionsBuilder};
pub use self::state::{ExecutionState, StateId};

use crate::il;
use crate::memory::{
    DeterministicMemoryManager, HeapMemoryManager, MemoryManager, MemoryObject, ObjectFlags,
    ObjectState,
};
use crate::mmu::{self, Dispatch, MemOp, Mmu};
use crate::solver::Solver;
use crate::{Error, RC};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The suffix of terminations for accesses outside every live object.
pub const PTR_ERR: &str = "ptr.err";
/// The suffix of terminations for writes to read-only objects.
pub const READONLY_ERR: &str = "readonly.err";
/// The suffix of terminations for bad requests from the program.
pub const USER_ERR: &str = "user.err";

/// Why a state stopped.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TerminationKind {
    /// The program did something wrong. Carries a suffix such as
    /// `"ptr.err"`.
    Error(String),
    /// The executor gave up on the state, usually because a solver query
    /// failed.
    Early,
}

/// The record of one terminated state.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Termination {
    state_id: StateId,
    kind: TerminationKind,
    message: String,
}

impl Termination {
    pub fn state_id(&self) -> StateId {
        self.state_id
    }

    pub fn kind(&self) -> &TerminationKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if this is an error termination with the given suffix.
    pub fn is_error(&self, suffix: &str) -> bool {
        match self.kind {
            TerminationKind::Error(ref s) => s == suffix,
            TerminationKind::Early => false,
        }
    }

    pub fn is_early(&self) -> bool {
        self.kind == TerminationKind::Early
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            TerminationKind::Error(ref suffix) => {
                write!(f, "state {}: {} ({})", self.state_id, self.message, suffix)
            }
            TerminationKind::Early => {
                write!(f, "state {}: early termination: {}", self.state_id, self.message)
            }
        }
    }
}

/// Counters kept across every memory operation.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MmuStats {
    memops: u64,
    queries: u64,
    sym_reads: u64,
    sym_writes: u64,
    forks: u64,
}

impl MmuStats {
    /// Memory operations dispatched.
    pub fn memops(&self) -> u64 {
        self.memops
    }

    /// Solver queries issued.
    pub fn queries(&self) -> u64 {
        self.queries
    }

    /// Reads at a symbolic offset into their object.
    pub fn sym_reads(&self) -> u64 {
        self.sym_reads
    }

    /// Writes at a symbolic offset into their object.
    pub fn sym_writes(&self) -> u64 {
        self.sym_writes
    }

    /// States split in two.
    pub fn forks(&self) -> u64 {
        self.forks
    }
}

/// The context memory operations execute in.
#[derive(Debug)]
pub struct Executor {
    solver: Box<dyn Solver>,
    options: Options,
    mmu: RC<dyn Mmu>,
    memory_manager: Box<dyn MemoryManager>,
    next_state_id: StateId,
    terminated: Vec<Termination>,
    stats: MmuStats,
}

impl Executor {
    /// Create a new `Executor`, with the `Mmu` and memory manager `options`
    /// select.
    pub fn new(solver: Box<dyn Solver>, options: Options) -> Executor {
        let memory_manager: Box<dyn MemoryManager> = match options.memory_manager() {
            MemoryManagerKind::Heap => Box::new(HeapMemoryManager::new(&options)),
            MemoryManagerKind::Deterministic => {
                Box::new(DeterministicMemoryManager::new(&options))
            }
        };
        Executor {
            solver,
            mmu: mmu::create(&options),
            options,
            memory_manager,
            next_state_id: 0,
            terminated: Vec::new(),
            stats: MmuStats::default(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Replace the installed `Mmu`.
    pub fn set_mmu(&mut self, mmu: RC<dyn Mmu>) {
        self.mmu = mmu;
    }

    pub fn mmu(&self) -> &RC<dyn Mmu> {
        &self.mmu
    }

    pub fn stats(&self) -> &MmuStats {
        &self.stats
    }

    pub(crate) fn count_sym_access(&mut self, write: bool) {
        if write {
            self.stats.sym_writes += 1;
        } else {
            self.stats.sym_reads += 1;
        }
    }

    fn next_state_id(&mut self) -> StateId {
        let id = self.next_state_id;
        self.next_state_id += 1;
        id
    }

    /// Create a new, empty state with a unique id.
    pub fn new_state(&mut self) -> ExecutionState {
        ExecutionState::new(self.next_state_id())
    }

    /// Is `expr` true on some path through `state`?
    pub fn may_be_true(
        &mut self,
        state: &ExecutionState,
        expr: &il::Expression,
    ) -> Result<bool, Error> {
        let expr = eval::simplify(expr)?;
        if let Some(constant) = expr.get_constant() {
            return Ok(constant.is_true());
        }
        self.stats.queries += 1;
        Ok(self.solver.may_be_true(state.constraints(), &expr)?)
    }

    /// Is `expr` true on every path through `state`?
    pub fn must_be_true(
        &mut self,
        state: &ExecutionState,
        expr: &il::Expression,
    ) -> Result<bool, Error> {
        let expr = eval::simplify(expr)?;
        if let Some(constant) = expr.get_constant() {
            return Ok(constant.is_true());
        }
        self.stats.queries += 1;
        Ok(self.solver.must_be_true(state.constraints(), &expr)?)
    }

    /// A value `expr` may take in `state`.
    pub fn get_value(
        &mut self,
        state: &ExecutionState,
        expr: &il::Expression,
    ) -> Result<il::Constant, Error> {
        let expr = eval::simplify(expr)?;
        if let Some(constant) = expr.get_constant() {
            return Ok(constant.clone());
        }
        self.stats.queries += 1;
        Ok(self.solver.get_value(state.constraints(), &expr)?)
    }

    /// Pick one value for `expr`, and constrain `state` to it.
    pub fn to_constant(
        &mut self,
        state: &mut ExecutionState,
        expr: &il::Expression,
        reason: &str,
    ) -> Result<il::Expression, Error> {
        let value: il::Expression = self.get_value(state, expr)?.into();
        if expr.get_constant().is_none() {
            warn!("concretizing {} to {} ({})", expr, value, reason);
            state.add_constraint(il::Expression::cmpeq(expr.clone(), value.clone())?)?;
        }
        Ok(value)
    }

    /// Split `state` along `condition`.
    ///
    /// The first state returned is constrained by `condition` and keeps the
    /// id of `state`. The second is constrained by its negation and receives
    /// a fresh id. A side is `None` when it is infeasible. If the solver
    /// fails, `state` is terminated early and both sides are `None`.
    pub fn fork(
        &mut self,
        mut state: ExecutionState,
        condition: &il::Expression,
    ) -> Result<(Option<ExecutionState>, Option<ExecutionState>), Error> {
        let condition = eval::simplify(condition)?;
        if let Some(constant) = condition.get_constant() {
            return Ok(if constant.is_true() {
                (Some(state), None)
            } else {
                (None, Some(state))
            });
        }
        let negation = il::Expression::not(condition.clone())?;

        let feasible = self
            .may_be_true(&state, &condition)
            .and_then(|t| Ok((t, self.may_be_true(&state, &negation)?)));
        let (true_feasible, false_feasible) = match feasible {
            Ok(feasible) => feasible,
            Err(Error::Solver(failure)) => {
                self.terminate_early(state, format!("query timed out (fork): {}", failure));
                return Ok((None, None));
            }
            Err(e) => return Err(e),
        };

        match (true_feasible, false_feasible) {
            (true, true) => {
                let mut false_state = state.clone();
                false_state.set_id(self.next_state_id());
                state.add_constraint(condition)?;
                false_state.add_constraint(negation)?;
                self.stats.forks += 1;
                debug!("forked state {} into {}", state.id(), false_state.id());
                Ok((Some(state), Some(false_state)))
            }
            (true, false) => Ok((Some(state), None)),
            (false, true) => Ok((None, Some(state))),
            (false, false) => {
                self.terminate_early(state, "infeasible path");
                Ok((None, None))
            }
        }
    }

    /// Stop `state` with a user-visible error such as `"ptr.err"`.
    pub fn terminate_error<S: Into<String>>(
        &mut self,
        state: ExecutionState,
        suffix: &str,
        message: S,
    ) {
        let termination = Termination {
            state_id: state.id(),
            kind: TerminationKind::Error(suffix.to_string()),
            message: message.into(),
        };
        debug!("terminated {}", termination);
        self.terminated.push(termination);
    }

    /// Stop `state` without a verdict.
    pub fn terminate_early<S: Into<String>>(&mut self, state: ExecutionState, message: S) {
        let termination = Termination {
            state_id: state.id(),
            kind: TerminationKind::Early,
            message: message.into(),
        };
        debug!("terminated {}", termination);
        self.terminated.push(termination);
    }

    /// Every termination recorded so far, oldest first.
    pub fn terminated(&self) -> &[Termination] {
        &self.terminated
    }

    pub fn take_terminated(&mut self) -> Vec<Termination> {
        std::mem::take(&mut self.terminated)
    }

    fn bind_new(&self, state: &mut ExecutionState, object: &RC<MemoryObject>) {
        state.address_space_mut().bind_object(
            object.clone(),
            ObjectState::new(object.size(), self.options.endian()),
        );
    }

    /// Allocate `size` zeroed bytes in `state`.
    pub fn allocate(
        &mut self,
        state: &mut ExecutionState,
        size: u64,
        is_local: bool,
        is_global: bool,
        alloc_site: Option<u64>,
    ) -> Result<RC<MemoryObject>, Error> {
        let mut flags = ObjectFlags::empty();
        flags.set(ObjectFlags::LOCAL, is_local);
        flags.set(ObjectFlags::GLOBAL, is_global);
        let object = self
            .memory_manager
            .allocate(Some(&mut *state), size, flags, alloc_site)?;
        self.bind_new(state, &object);
        Ok(object)
    }

    /// Allocate `size` zeroed bytes in `state`, aligned to `alignment`.
    pub fn allocate_aligned(
        &mut self,
        state: &mut ExecutionState,
        size: u64,
        alignment: u64,
        alloc_site: Option<u64>,
    ) -> Result<RC<MemoryObject>, Error> {
        let object = self.memory_manager.allocate_aligned(
            Some(&mut *state),
            size,
            alignment,
            ObjectFlags::LOCAL,
            alloc_site,
        )?;
        self.bind_new(state, &object);
        Ok(object)
    }

    /// Allocate `size` zeroed bytes in `state` as consecutive pages.
    pub fn allocate_chopped(
        &mut self,
        state: &mut ExecutionState,
        size: u64,
        alloc_site: Option<u64>,
    ) -> Result<Vec<RC<MemoryObject>>, Error> {
        let objects = self.memory_manager.allocate_aligned_chopped(
            state,
            size,
            ObjectFlags::LOCAL,
            alloc_site,
        )?;
        for object in &objects {
            self.bind_new(state, object);
        }
        Ok(objects)
    }

    /// Create a fixed, global object at `address` in `state`.
    pub fn allocate_fixed(
        &mut self,
        state: &mut ExecutionState,
        address: u64,
        size: u64,
        alloc_site: Option<u64>,
    ) -> Result<RC<MemoryObject>, Error> {
        let object =
            self.memory_manager
                .allocate_fixed(Some(&mut *state), address, size, alloc_site)?;
        self.bind_new(state, &object);
        Ok(object)
    }

    /// Create an object at an address the program asked for.
    pub fn allocate_at(
        &mut self,
        state: &mut ExecutionState,
        address: u64,
        size: u64,
        alloc_site: Option<u64>,
    ) -> Result<RC<MemoryObject>, Error> {
        let object = self
            .memory_manager
            .allocate_at(state, address, size, alloc_site)?;
        self.bind_new(state, &object);
        Ok(object)
    }

    /// Replace the contents of `object` with fresh symbolic bytes
    /// `name[0]`, `name[1]`, ...
    pub fn make_symbolic(
        &mut self,
        state: &mut ExecutionState,
        object: &MemoryObject,
        name: &str,
    ) -> Result<(), Error> {
        let contents = state.address_space_mut().get_writeable(object)?;
        *contents = ObjectState::new_symbolic(object.size(), name, self.options.endian());
        Ok(())
    }

    /// Release the object starting at `address`.
    pub fn free(&mut self, state: &mut ExecutionState, address: u64) -> Result<(), Error> {
        let object = state
            .address_space()
            .resolve_one(address)
            .filter(|object| object.address() == address)
            .cloned()
            .ok_or(Error::ObjectNotBound(address))?;
        state.address_space_mut().unbind_object(&object);
        state.tlb_invalidate(address);
        state.soft_tlb_invalidate(address);
        debug!("freed {}", object);
        Ok(())
    }

    pub fn set_read_only(
        &mut self,
        state: &mut ExecutionState,
        object: &MemoryObject,
        read_only: bool,
    ) -> Result<(), Error> {
        state.address_space_mut().set_read_only(object, read_only)
    }

    /// Dispatch one memory operation on `state` to the installed `Mmu`.
    ///
    /// Returns the states which continue after the operation, in order. The
    /// others were terminated, and are recorded in `terminated`.
    ///
    /// # Error
    /// No dispatcher serviced the operation, which means the installed `Mmu`
    /// is misconfigured, or the operation itself is malformed.
    pub fn execute_memop(
        &mut self,
        state: ExecutionState,
        mop: &MemOp,
    ) -> Result<Vec<ExecutionState>, Error> {
        self.stats.memops += 1;
        let simplified;
        let mop = if self.options.simplify_sym_indices() {
            simplified = mop.simplified(&state)?;
            &simplified
        } else {
            mop
        };

        let mmu = self.mmu.clone();
        match mmu.execute(self, state, mop)? {
            Dispatch::Serviced(states) => Ok(states),
            Dispatch::Declined(state) => {
                warn!("no dispatcher serviced {} in state {}", mop, state.id());
                Err(Error::MmuDispatch)
            }
        }
    }

    /// A description of where `address` points in `state`, for error
    /// messages.
    pub fn address_info(&mut self, state: &ExecutionState, address: &il::Expression) -> String {
        let mut info = format!("address: {}\n", address);
        let example = match self.get_value(state, address) {
            Ok(example) => example.value(),
            Err(_) => {
                info.push_str("example: unavailable\n");
                return info;
            }
        };
        info.push_str(&format!("example: 0x{:x}\n", example));

        let space = state.address_space();
        if let Some(object) = space.resolve_one(example) {
            info.push_str(&format!("in: {} {}\n", object, object.alloc_info()));
            return info;
        }
        match space.predecessor(example) {
            Some(object) => info.push_str(&format!("prev: {} {}\n", object, object.alloc_info())),
            None => info.push_str("prev: none\n"),
        }
        match space.upper_bound(example) {
            Some(object) => info.push_str(&format!("next: {} {}\n", object, object.alloc_info())),
            None => info.push_str("next: none\n"),
        }
        info
    }

    /// Read 64 bits at `address` in `state`, for diagnostics. Returns `None`
    /// when the read does not fit in one object.
    pub fn read_debug(
        &self,
        state: &ExecutionState,
        address: u64,
    ) -> Result<Option<il::Expression>, Error> {
        match state.address_space().lookup(address) {
            Some((object, contents)) if object.is_in_bounds(address, 8) => {
                Ok(Some(contents.read_at(address - object.address(), 64)?))
            }
            _ => Ok(None),
        }
    }
}
