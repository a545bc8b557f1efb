use crate::executor::{ExecutionState, Executor};
use crate::mmu::{Dispatch, GenericMmu, MemOp, Mmu};
use crate::{Error, RC};
use log::trace;
use rustc_hash::FxHashMap;
use std::fmt;

/// The access widths software helpers exist for.
const HELPER_WIDTHS: [usize; 4] = [8, 16, 32, 64];

/// A software implementation of one load or store width.
pub trait SoftHandler: fmt::Debug {
    fn call(
        &self,
        executor: &mut Executor,
        state: ExecutionState,
        mop: &MemOp,
    ) -> Result<Vec<ExecutionState>, Error>;
}

/// A helper which services the access with a `GenericMmu`.
#[derive(Clone, Debug, Default)]
pub struct ForwardingHandler {
    mmu: GenericMmu,
}

impl ForwardingHandler {
    pub fn new() -> ForwardingHandler {
        ForwardingHandler {
            mmu: GenericMmu::new(),
        }
    }
}

impl SoftHandler for ForwardingHandler {
    fn call(
        &self,
        executor: &mut Executor,
        state: ExecutionState,
        mop: &MemOp,
    ) -> Result<Vec<ExecutionState>, Error> {
        match self.mmu.execute(executor, state, mop)? {
            Dispatch::Serviced(states) => Ok(states),
            Dispatch::Declined(_) => Err(Error::MmuDispatch),
        }
    }
}

/// Services every operation by calling the helper registered for its
/// direction and width, `mmu_load_32_<suffix>`, `mmu_store_8_<suffix>`, and
/// so on. Boolean accesses use the 8-bit helpers.
#[derive(Debug)]
pub struct SymMmu {
    suffix: String,
    helpers: FxHashMap<String, RC<dyn SoftHandler>>,
}

impl SymMmu {
    /// Create a `SymMmu` with no helpers.
    pub fn new<S: Into<String>>(suffix: S) -> SymMmu {
        SymMmu {
            suffix: suffix.into(),
            helpers: FxHashMap::default(),
        }
    }

    /// Create a `SymMmu` whose helpers all forward to a `GenericMmu`.
    pub fn with_default_helpers<S: Into<String>>(suffix: S) -> SymMmu {
        let mut mmu = SymMmu::new(suffix);
        let forward: RC<dyn SoftHandler> = RC::new(ForwardingHandler::new());
        for &bits in HELPER_WIDTHS.iter() {
            for &write in [false, true].iter() {
                let name = mmu.name_for(write, bits);
                mmu.helpers.insert(name, forward.clone());
            }
        }
        mmu
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Register `handler` under `name`, replacing any helper of that name.
    pub fn set_helper<S: Into<String>>(&mut self, name: S, handler: RC<dyn SoftHandler>) {
        self.helpers.insert(name.into(), handler);
    }

    pub fn with_helper<S: Into<String>>(mut self, name: S, handler: RC<dyn SoftHandler>) -> SymMmu {
        self.set_helper(name, handler);
        self
    }

    fn name_for(&self, write: bool, bits: usize) -> String {
        format!(
            "mmu_{}_{}_{}",
            if write { "store" } else { "load" },
            bits,
            self.suffix
        )
    }

    /// The name of the helper which services `mop`.
    pub fn helper_name(&self, mop: &MemOp) -> Result<String, Error> {
        let bits = if mop.bits() == 1 { 8 } else { mop.bits() };
        if !HELPER_WIDTHS.contains(&bits) {
            return Err(Error::BadWidth(mop.bits()));
        }
        Ok(self.name_for(mop.is_write(), bits))
    }
}

impl Mmu for SymMmu {
    fn execute(
        &self,
        executor: &mut Executor,
        state: ExecutionState,
        mop: &MemOp,
    ) -> Result<Dispatch, Error> {
        let name = self.helper_name(mop)?;
        let helper = self
            .helpers
            .get(&name)
            .ok_or_else(|| Error::MissingHelper(name.clone()))?;
        trace!("{} -> {}", mop, name);
        executor.count_sym_access(mop.is_write());
        Ok(Dispatch::Serviced(helper.call(executor, state, mop)?))
    }
}
