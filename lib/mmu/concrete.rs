use crate::executor::{ExecutionState, Executor, PTR_ERR};
use crate::mmu::{commit, commit_bytes, constant_offset, lookup_constant, Dispatch, MemOp, Mmu};
use crate::Error;
use log::trace;

/// Services operations at constant addresses, and declines the rest.
///
/// An access which fits inside one object is committed directly. One which
/// straddles objects is split into bytes, and every byte must land in some
/// object. Anything else is an out-of-bounds access.
#[derive(Clone, Debug, Default)]
pub struct ConcreteMmu;

impl ConcreteMmu {
    pub fn new() -> ConcreteMmu {
        ConcreteMmu
    }

    /// Service `mop` at the constant `address`.
    pub(crate) fn execute_at(
        &self,
        executor: &mut Executor,
        mut state: ExecutionState,
        mop: &MemOp,
        address: u64,
    ) -> Result<Vec<ExecutionState>, Error> {
        let bytes = mop.bytes()?;

        if let Some(object) = lookup_constant(executor, &mut state, address, bytes) {
            let offset = constant_offset(&object, address);
            return Ok(commit(executor, state, mop, &object, &offset)?
                .into_iter()
                .collect());
        }

        if bytes > 1 {
            let mut targets = Vec::with_capacity(bytes as usize);
            for i in 0..bytes {
                let byte_address = address.wrapping_add(i);
                match lookup_constant(executor, &mut state, byte_address, 1) {
                    Some(object) => {
                        let offset = constant_offset(&object, byte_address);
                        targets.push((object, offset));
                    }
                    None => break,
                }
            }
            if targets.len() as u64 == bytes {
                trace!("{} straddles objects, accessing by byte", mop);
                return Ok(commit_bytes(executor, state, mop, &targets)?
                    .into_iter()
                    .collect());
            }
        }

        let info = executor.address_info(&state, mop.address());
        executor.terminate_error(
            state,
            PTR_ERR,
            format!("memory error: out of bound pointer\n{}", info),
        );
        Ok(Vec::new())
    }
}

impl Mmu for ConcreteMmu {
    fn execute(
        &self,
        executor: &mut Executor,
        state: ExecutionState,
        mop: &MemOp,
    ) -> Result<Dispatch, Error> {
        let address = match mop.address().get_constant() {
            Some(address) => address.value(),
            None => return Ok(Dispatch::Declined(state)),
        };
        Ok(Dispatch::Serviced(
            self.execute_at(executor, state, mop, address)?,
        ))
    }
}
