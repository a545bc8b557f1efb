use crate::executor::{ExecutionState, Executor, USER_ERR};
use crate::memory::TLB_PAGE_SIZE;
use crate::mmu::{commit, constant_offset, ConcreteMmu, Dispatch, MemOp, Mmu, SymMmu};
use crate::Error;
use log::{trace, warn};

/// A concrete fast path driven by a TLB the program fills explicitly.
///
/// While a state has the soft MMU disabled, every constant address goes to a
/// `ConcreteMmu`. While it is enabled, a constant address whose object the
/// program inserted with `tlb_insert` is committed directly, and any other
/// constant address goes to the software helpers, with the soft MMU disabled
/// for the duration of the helper. Symbolic addresses are declined.
#[derive(Debug)]
pub struct SoftConcreteMmu {
    concrete: ConcreteMmu,
    sym: SymMmu,
}

impl SoftConcreteMmu {
    pub fn new(sym: SymMmu) -> SoftConcreteMmu {
        SoftConcreteMmu {
            concrete: ConcreteMmu::new(),
            sym,
        }
    }

    /// Turn the soft MMU on for `state`.
    pub fn enable(state: &mut ExecutionState) {
        state.set_soft_mmu_enabled(true);
    }

    /// Cache the object holding `address` in the soft TLB of `state`.
    ///
    /// Entries cover exactly one page, so `len` must be `TLB_PAGE_SIZE`.
    /// Returns `None` when the request is bad and the state was terminated
    /// with `"user.err"`.
    pub fn tlb_insert(
        executor: &mut Executor,
        mut state: ExecutionState,
        address: u64,
        len: u64,
    ) -> Option<ExecutionState> {
        if len != TLB_PAGE_SIZE {
            warn!("bad tlb insert address=0x{:x} len={}", address, len);
            executor.terminate_error(state, USER_ERR, "Bad TLB insert");
            return None;
        }
        let object = match state.address_space().resolve_one(address) {
            Some(object) => object.clone(),
            None => {
                warn!("bad tlb lookup address=0x{:x} len={}", address, len);
                executor.terminate_error(state, USER_ERR, "Bad TLB lookup");
                return None;
            }
        };
        state.soft_tlb_put(object);
        Some(state)
    }

    /// Drop the soft TLB entry for `address`.
    pub fn tlb_invalidate(state: &mut ExecutionState, address: u64) {
        state.soft_tlb_invalidate(address);
    }
}

impl Mmu for SoftConcreteMmu {
    fn execute(
        &self,
        executor: &mut Executor,
        mut state: ExecutionState,
        mop: &MemOp,
    ) -> Result<Dispatch, Error> {
        if !state.soft_mmu_enabled() {
            return self.concrete.execute(executor, state, mop);
        }

        let address = match mop.address().get_constant() {
            Some(address) => address.value(),
            None => return Ok(Dispatch::Declined(state)),
        };

        if let Some(object) = state.soft_tlb_get(address) {
            if object.is_in_bounds(address, mop.bytes()?) {
                let offset = constant_offset(&object, address);
                return Ok(Dispatch::Serviced(
                    commit(executor, state, mop, &object, &offset)?
                        .into_iter()
                        .collect(),
                ));
            }
        }

        // helpers must not reenter the soft MMU
        trace!("soft tlb miss at 0x{:x}", address);
        state.set_soft_mmu_enabled(false);
        match self.sym.execute(executor, state, mop)? {
            Dispatch::Serviced(mut states) => {
                states.iter_mut().for_each(SoftConcreteMmu::enable);
                Ok(Dispatch::Serviced(states))
            }
            Dispatch::Declined(mut state) => {
                SoftConcreteMmu::enable(&mut state);
                Ok(Dispatch::Declined(state))
            }
        }
    }
}
