//! A symbolic execution state, as far as memory is concerned.

use crate::executor::eval;
use crate::il;
use crate::memory::{AddressSpace, MemoryObject, Tlb};
use crate::{Error, RC};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Identifies an `ExecutionState`. Forking gives one side a fresh id.
pub type StateId = u64;

/// A symbolic execution state.
///
/// An `ExecutionState` owns its path constraints, its address space, the
/// values memory loads have produced, and its translation cache. Cloning a
/// state is how the executor forks, and is cheap: object contents are shared
/// copy-on-write.
#[derive(Clone, Debug)]
pub struct ExecutionState {
    id: StateId,
    address_space: AddressSpace,
    constraints: Vec<il::Expression>,
    locals: BTreeMap<String, il::Expression>,
    tlb: Tlb,
    soft_tlb: Tlb,
    malloc_iterations: FxHashMap<Option<u64>, u32>,
    num_allocs: u64,
    soft_mmu_enabled: bool,
}

impl ExecutionState {
    /// Create a new, empty `ExecutionState`. Use `Executor::new_state` to
    /// receive one with a unique id.
    pub fn new(id: StateId) -> ExecutionState {
        ExecutionState {
            id,
            address_space: AddressSpace::new(),
            constraints: Vec::new(),
            locals: BTreeMap::new(),
            tlb: Tlb::new(),
            soft_tlb: Tlb::new(),
            malloc_iterations: FxHashMap::default(),
            num_allocs: 0,
            soft_mmu_enabled: false,
        }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: StateId) {
        self.id = id;
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    pub fn address_space_mut(&mut self) -> &mut AddressSpace {
        &mut self.address_space
    }

    /// The path constraints of this state.
    pub fn constraints(&self) -> &[il::Expression] {
        &self.constraints
    }

    /// Add a 1-bit constraint to this state's path. Constraints which fold to
    /// `true` are dropped.
    pub fn add_constraint(&mut self, constraint: il::Expression) -> Result<(), Error> {
        if constraint.bits() != 1 {
            return Err(Error::Sort);
        }
        let constraint = eval::simplify(&constraint)?;
        if let Some(c) = constraint.get_constant() {
            if c.is_true() {
                return Ok(());
            }
        }
        self.constraints.push(constraint);
        Ok(())
    }

    /// Values bound by memory loads, by target name.
    pub fn locals(&self) -> &BTreeMap<String, il::Expression> {
        &self.locals
    }

    pub fn local(&self, name: &str) -> Option<&il::Expression> {
        self.locals.get(name)
    }

    /// Bind the result of a load to `name`.
    pub fn bind_local<S: Into<String>>(&mut self, name: S, value: il::Expression) {
        self.locals.insert(name.into(), value);
    }

    /// Rewrite `expr` using every constraint of the form `scalar == constant`,
    /// then fold constants.
    pub fn simplify_expression(&self, expr: &il::Expression) -> Result<il::Expression, Error> {
        let mut known: FxHashMap<&str, il::Expression> = FxHashMap::default();
        for constraint in &self.constraints {
            if let il::Expression::Cmpeq(ref lhs, ref rhs) = *constraint {
                match (lhs.as_ref(), rhs.as_ref()) {
                    (il::Expression::Scalar(scalar), il::Expression::Constant(_))
                    | (il::Expression::Constant(_), il::Expression::Scalar(scalar)) => {
                        let value = if lhs.get_constant().is_some() { lhs } else { rhs };
                        known.insert(scalar.name(), value.as_ref().clone());
                    }
                    _ => {}
                }
            }
        }
        if known.is_empty() {
            return eval::simplify(expr);
        }
        eval::simplify(&eval::substitute(expr, &|scalar| {
            known.get(scalar.name()).cloned()
        })?)
    }

    /// Find the cached object containing `address`.
    pub fn tlb_get(&mut self, address: u64) -> Option<RC<MemoryObject>> {
        self.tlb.get(self.id, &self.address_space, address)
    }

    /// Cache `object`, which must be bound in this state.
    pub fn tlb_put(&mut self, object: RC<MemoryObject>) {
        self.tlb.put(self.id, &self.address_space, object)
    }

    /// Drop the cache entry for `address`.
    pub fn tlb_invalidate(&mut self, address: u64) {
        self.tlb.invalidate(address)
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// Find the object containing `address` in the cache the soft MMU
    /// maintains through explicit inserts.
    pub fn soft_tlb_get(&mut self, address: u64) -> Option<RC<MemoryObject>> {
        self.soft_tlb.get(self.id, &self.address_space, address)
    }

    pub fn soft_tlb_put(&mut self, object: RC<MemoryObject>) {
        self.soft_tlb.put(self.id, &self.address_space, object)
    }

    pub fn soft_tlb_invalidate(&mut self, address: u64) {
        self.soft_tlb.invalidate(address)
    }

    pub fn soft_tlb(&self) -> &Tlb {
        &self.soft_tlb
    }

    /// Returns the iteration of the next allocation at `alloc_site`, and
    /// advances it.
    pub fn next_malloc_iteration(&mut self, alloc_site: Option<u64>) -> u32 {
        let iteration = self.malloc_iterations.entry(alloc_site).or_insert(0);
        let current = *iteration;
        *iteration += 1;
        current
    }

    /// The number of allocations this state has made.
    pub fn num_allocs(&self) -> u64 {
        self.num_allocs
    }

    pub(crate) fn count_allocation(&mut self) {
        self.num_allocs += 1;
    }

    /// Whether loads and stores should go through the software MMU.
    pub fn soft_mmu_enabled(&self) -> bool {
        self.soft_mmu_enabled
    }

    pub fn set_soft_mmu_enabled(&mut self, enabled: bool) {
        self.soft_mmu_enabled = enabled;
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[test]
    fn constraints() {
        let mut state = ExecutionState::new(0);
        state.add_constraint(il::expr_true()).unwrap();
        assert!(state.constraints().is_empty());
        assert!(state.add_constraint(il::expr_const(1, 8)).is_err());

        state
            .add_constraint(
                il::Expression::cmpeq(il::expr_scalar("y", 64), il::expr_const(0x2000, 64))
                    .unwrap(),
            )
            .unwrap();
        let address =
            il::Expression::add(il::expr_scalar("y", 64), il::expr_const(4, 64)).unwrap();
        assert_eq!(
            state.simplify_expression(&address).unwrap(),
            il::expr_const(0x2004, 64)
        );
    }

    #[test]
    fn malloc_iterations() {
        let mut state = ExecutionState::new(0);
        assert_eq!(state.next_malloc_iteration(Some(0x400)), 0);
        assert_eq!(state.next_malloc_iteration(Some(0x400)), 1);
        assert_eq!(state.next_malloc_iteration(Some(0x500)), 0);

        let mut fork = state.clone();
        assert_eq!(fork.next_malloc_iteration(Some(0x400)), 2);
        assert_eq!(state.next_malloc_iteration(Some(0x400)), 2);
    }
}
