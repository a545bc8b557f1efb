use crate::executor::{eval, ExecutionState, Executor, PTR_ERR};
use crate::il;
use crate::memory::{MemoryObject, Resolver};
use crate::mmu::{commit, commit_bytes, constant_offset, lookup_constant, Dispatch, MemOp, Mmu};
use crate::{Error, POINTER_BITS, RC};
use log::{debug, trace, warn};

/// Where a single resolution attempt landed.
enum Lookup {
    /// The access lies within this object, at this offset, on every path.
    Hit(RC<MemoryObject>, il::Expression),
    /// No single object holds the access on every path.
    Miss,
    /// The solver gave up.
    TimedOut,
}

/// Map solver failures to `Lookup::TimedOut`.
macro_rules! or_timeout {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(Error::Solver(failure)) => {
                debug!("solver failure during lookup: {}", failure);
                return Ok(Lookup::TimedOut);
            }
            Err(e) => return Err(e),
        }
    };
}

/// Services any memory operation.
///
/// Each operation goes through these steps, and the first which applies
/// wins:
///
/// 1. The address resolves to one object holding the whole access on every
///    path.
/// 2. Every byte of the access resolves that way, perhaps to different
///    objects.
/// 3. The address is resolved to every object it may point into, and the
///    state forks once per object. States left over after the last object
///    access memory out of bounds.
#[derive(Clone, Debug, Default)]
pub struct GenericMmu;

impl GenericMmu {
    pub fn new() -> GenericMmu {
        GenericMmu
    }

    fn resolve_fast(
        &self,
        executor: &mut Executor,
        state: &mut ExecutionState,
        address: &il::Expression,
        bytes: u64,
    ) -> Result<Lookup, Error> {
        if let Some(constant) = address.get_constant() {
            let constant = constant.value();
            return Ok(match lookup_constant(executor, state, constant, bytes) {
                Some(object) => {
                    let offset = constant_offset(&object, constant);
                    Lookup::Hit(object, offset)
                }
                None => Lookup::Miss,
            });
        }

        let mut address = address.clone();
        let found = Resolver::new(executor, state).get_feasible_object(&address);
        let object = match found {
            Ok(Some(object)) => object,
            Ok(None) => return Ok(Lookup::Miss),
            Err(Error::Solver(failure)) => {
                debug!("{} while looking up {}, concretizing", failure, address);
                address = or_timeout!(executor.to_constant(state, &address, "resolve_one failure"));
                let constant = match address.get_constant() {
                    Some(constant) => constant.value(),
                    None => return Ok(Lookup::Miss),
                };
                match state.address_space().resolve_one(constant) {
                    Some(object) => object.clone(),
                    None => return Ok(Lookup::Miss),
                }
            }
            Err(e) => return Err(e),
        };

        let max_sym_array_size = executor.options().max_sym_array_size();
        if max_sym_array_size != 0
            && object.size() >= max_sym_array_size
            && address.get_constant().is_none()
        {
            address = or_timeout!(executor.to_constant(state, &address, "max_sym_array_size"));
        }

        let offset = object.offset_expr(&address)?;
        let in_bounds = object.bounds_check_offset(&offset, bytes)?;
        if or_timeout!(executor.must_be_true(state, &in_bounds)) {
            trace!("{} always lies in {}", address, object);
            Ok(Lookup::Hit(object, offset))
        } else {
            Ok(Lookup::Miss)
        }
    }

    /// Try each byte of `mop` on its own. Returns the state back if some byte
    /// has no single object.
    fn execute_by_byte(
        &self,
        executor: &mut Executor,
        mut state: ExecutionState,
        mop: &MemOp,
        bytes: u64,
    ) -> Result<Result<Vec<ExecutionState>, ExecutionState>, Error> {
        let mut targets = Vec::with_capacity(bytes as usize);
        for i in 0..bytes {
            let byte_address = eval::simplify(&il::Expression::add(
                mop.address().clone(),
                il::expr_const(i, POINTER_BITS),
            )?)?;
            match self.resolve_fast(executor, &mut state, &byte_address, 1)? {
                Lookup::Hit(object, offset) => targets.push((object, offset)),
                Lookup::Miss => return Ok(Err(state)),
                Lookup::TimedOut => {
                    executor.terminate_early(state, "query timed out (memOpResolve)");
                    return Ok(Ok(Vec::new()));
                }
            }
        }
        trace!("{} serviced by byte", mop);
        Ok(Ok(commit_bytes(executor, state, mop, &targets)?
            .into_iter()
            .collect()))
    }

    /// Fork `state` once per object `mop` may access, then deal with what is
    /// left.
    fn execute_by_fork(
        &self,
        executor: &mut Executor,
        state: ExecutionState,
        mop: &MemOp,
        bytes: u64,
    ) -> Result<Vec<ExecutionState>, Error> {
        let max_resolutions = executor.options().max_resolutions();
        let resolution = Resolver::new(executor, &state).resolve(mop.address(), max_resolutions);
        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(Error::Solver(failure)) => {
                executor.terminate_early(state, format!("query timed out (resolve): {}", failure));
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        debug!(
            "{} resolved to {} objects{}",
            mop.address(),
            resolution.len(),
            if resolution.incomplete() { ", incomplete" } else { "" }
        );

        let mut successors = Vec::new();
        let mut unbound = state;
        for object in resolution.objects() {
            let in_bounds = object.bounds_check_pointer(mop.address(), bytes)?;
            let (bound, rest) = executor.fork(unbound, &in_bounds)?;
            if let Some(bound) = bound {
                let offset = object.offset_expr(mop.address())?;
                successors.extend(commit(executor, bound, mop, object, &offset)?);
            }
            unbound = match rest {
                Some(rest) => rest,
                None => return Ok(successors),
            };
        }

        if !resolution.incomplete() {
            let info = executor.address_info(&unbound, mop.address());
            executor.terminate_error(
                unbound,
                PTR_ERR,
                format!("memory error: out of bound pointer\n{}", info),
            );
            return Ok(successors);
        }

        // The search stopped early, so the residual may still point into an
        // object nobody examined.
        let oob = Resolver::oob_condition(unbound.address_space(), mop.address())?;
        match executor.fork(unbound, &oob)? {
            (None, None) => warn!("total timeout checking {} for oob, may miss a ptr.err", mop),
            (oob_state, rest) => {
                if let Some(oob_state) = oob_state {
                    let info = executor.address_info(&oob_state, mop.address());
                    executor.terminate_error(
                        oob_state,
                        PTR_ERR,
                        format!("memory error: out of bound pointer\n{}", info),
                    );
                }
                if let Some(rest) = rest {
                    executor.terminate_early(rest, "query timed out (memOpError)");
                }
            }
        }
        Ok(successors)
    }
}

impl Mmu for GenericMmu {
    fn execute(
        &self,
        executor: &mut Executor,
        mut state: ExecutionState,
        mop: &MemOp,
    ) -> Result<Dispatch, Error> {
        let bytes = mop.bytes()?;

        match self.resolve_fast(executor, &mut state, mop.address(), bytes)? {
            Lookup::Hit(object, offset) => {
                let successors = commit(executor, state, mop, &object, &offset)?;
                return Ok(Dispatch::Serviced(successors.into_iter().collect()));
            }
            Lookup::TimedOut => {
                executor.terminate_early(state, "query timed out (memOpResolve)");
                return Ok(Dispatch::Serviced(Vec::new()));
            }
            Lookup::Miss => {}
        }

        if bytes > 1 {
            state = match self.execute_by_byte(executor, state, mop, bytes)? {
                Ok(successors) => return Ok(Dispatch::Serviced(successors)),
                Err(state) => state,
            };
        }

        Ok(Dispatch::Serviced(
            self.execute_by_fork(executor, state, mop, bytes)?,
        ))
    }
}

#[cfg(test)]
mod generic_tests {
    use super::*;
    use crate::executor::{Options, OptionsBuilder, READONLY_ERR};
    use crate::solver::EnumSolver;

    fn setup(solver: EnumSolver, options: Options) -> (Executor, ExecutionState) {
        let mut executor = Executor::new(Box::new(solver), options);
        let mut state = executor.new_state();
        executor.allocate_at(&mut state, 0x1000, 0x10, None).unwrap();
        executor.allocate_at(&mut state, 0x1010, 0x10, None).unwrap();
        (executor, state)
    }

    fn run(executor: &mut Executor, state: ExecutionState, mop: &MemOp) -> Vec<ExecutionState> {
        match GenericMmu::new().execute(executor, state, mop).unwrap() {
            Dispatch::Serviced(states) => states,
            Dispatch::Declined(_) => panic!("generic mmu declined"),
        }
    }

    fn constrain(state: &mut ExecutionState, x: &il::Expression, low: u64, high: u64) {
        state
            .add_constraint(il::Expression::cmpleu(il::expr_const(low, 64), x.clone()).unwrap())
            .unwrap();
        state
            .add_constraint(il::Expression::cmpleu(x.clone(), il::expr_const(high, 64)).unwrap())
            .unwrap();
    }

    #[test]
    fn single_object_needs_no_fork() {
        let solver = EnumSolver::new().with_domain("x", 0x1000, 0x1020);
        let (mut executor, mut state) = setup(solver, Options::default());
        let x = il::expr_scalar("x", 64);
        constrain(&mut state, &x, 0x1000, 0x1008);

        let store = MemOp::store(x.clone(), il::expr_const(0x7f, 8));
        let states = run(&mut executor, state, &store);
        assert_eq!(states.len(), 1);
        assert_eq!(executor.stats().forks(), 0);
        assert_eq!(executor.stats().sym_writes(), 1);
    }

    #[test]
    fn straddle_by_byte() {
        // every byte of the access has exactly one home
        let solver = EnumSolver::new().with_domain("x", 0x1000, 0x1020);
        let (mut executor, mut state) = setup(solver, Options::default());
        let x = il::expr_scalar("x", 64);
        state
            .add_constraint(il::Expression::cmpeq(x.clone(), il::expr_const(0x100e, 64)).unwrap())
            .unwrap();

        let load = MemOp::load(x, 32, "r");
        let states = run(&mut executor, state, &load);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].local("r"), Some(&il::expr_const(0, 32)));
        assert_eq!(executor.stats().forks(), 0);
    }

    #[test]
    fn fork_per_object() {
        let solver = EnumSolver::new().with_domain("x", 0x1000, 0x1020);
        let (mut executor, mut state) = setup(solver, Options::default());
        let x = il::expr_scalar("x", 64);
        constrain(&mut state, &x, 0x1008, 0x1018);

        let load = MemOp::load(x.clone(), 8, "r");
        let states = run(&mut executor, state, &load);
        assert_eq!(states.len(), 2);
        assert_eq!(executor.stats().forks(), 1);
        assert!(executor.terminated().is_empty());
        let in_a = il::Expression::cmpltu(x.clone(), il::expr_const(0x1010, 64)).unwrap();
        assert!(executor.must_be_true(&states[0], &in_a).unwrap());
        assert!(!executor.may_be_true(&states[1], &in_a).unwrap());
    }

    #[test]
    fn incomplete_resolution_checks_oob() {
        let solver = EnumSolver::new().with_domain("x", 0x1000, 0x1030);
        let options = OptionsBuilder::new().max_resolutions(1).build();
        let (mut executor, mut state) = setup(solver, options);
        let x = il::expr_scalar("x", 64);
        constrain(&mut state, &x, 0x1008, 0x1028);

        let load = MemOp::load(x, 8, "r");
        let states = run(&mut executor, state, &load);
        assert_eq!(states.len(), 1);

        let terminated = executor.terminated();
        assert_eq!(terminated.len(), 2);
        assert!(terminated[0].is_error(PTR_ERR));
        assert!(terminated[1].is_early());
    }

    #[test]
    fn solver_timeout_terminates_early() {
        let solver = EnumSolver::new().with_domain("x", 0, 0xffff).with_budget(16);
        let (mut executor, mut state) = setup(solver, Options::default());
        let x = il::expr_scalar("x", 64);
        constrain(&mut state, &x, 0x1000, 0x1008);

        let load = MemOp::load(x, 8, "r");
        assert!(run(&mut executor, state, &load).is_empty());
        assert!(executor.terminated()[0].is_early());
    }

    #[test]
    fn symbolic_write_to_read_only() {
        let solver = EnumSolver::new().with_domain("x", 0x1000, 0x1020);
        let (mut executor, mut state) = setup(solver, Options::default());
        let a = state.address_space().resolve_one(0x1000).unwrap().clone();
        executor.set_read_only(&mut state, &a, true).unwrap();
        let x = il::expr_scalar("x", 64);
        constrain(&mut state, &x, 0x1000, 0x1004);

        let store = MemOp::store(x, il::expr_const(1, 8));
        assert!(run(&mut executor, state.clone(), &store).is_empty());
        assert!(executor.terminated()[0].is_error(READONLY_ERR));
        let contents = state.address_space().find_object(&a).unwrap();
        assert!(contents.is_concrete());
    }

    #[test]
    fn large_objects_are_concretized() {
        let solver = EnumSolver::new().with_domain("x", 0x1000, 0x1020);
        let options = OptionsBuilder::new().max_sym_array_size(0x10).build();
        let (mut executor, mut state) = setup(solver, options);
        let x = il::expr_scalar("x", 64);
        constrain(&mut state, &x, 0x1004, 0x1008);

        let load = MemOp::load(x.clone(), 8, "r");
        let states = run(&mut executor, state, &load);
        assert_eq!(states.len(), 1);
        assert_eq!(executor.stats().sym_reads(), 0);
        assert!(executor
            .must_be_true(
                &states[0],
                &il::Expression::cmpeq(x, il::expr_const(0x1004, 64)).unwrap()
            )
            .unwrap());
    }
}
