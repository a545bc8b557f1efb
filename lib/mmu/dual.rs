use crate::executor::{ExecutionState, Executor};
use crate::mmu::{Dispatch, MemOp, Mmu};
use crate::Error;

/// Offers each operation to `first`, and whatever it declines to `second`.
#[derive(Debug)]
pub struct DualMmu {
    first: Box<dyn Mmu>,
    second: Box<dyn Mmu>,
}

impl DualMmu {
    pub fn new(first: Box<dyn Mmu>, second: Box<dyn Mmu>) -> DualMmu {
        DualMmu { first, second }
    }

    pub fn first(&self) -> &dyn Mmu {
        self.first.as_ref()
    }

    pub fn second(&self) -> &dyn Mmu {
        self.second.as_ref()
    }
}

impl Mmu for DualMmu {
    fn execute(
        &self,
        executor: &mut Executor,
        state: ExecutionState,
        mop: &MemOp,
    ) -> Result<Dispatch, Error> {
        match self.first.execute(executor, state, mop)? {
            Dispatch::Declined(state) => self.second.execute(executor, state, mop),
            serviced => Ok(serviced),
        }
    }
}
