//! End-to-end memory scenarios, driven through `Executor::execute_memop`.

use crate::executor::{
    eval, ExecutionState, Executor, MemoryManagerKind, MmuKind, Options, OptionsBuilder,
    TerminationKind, PTR_ERR, READONLY_ERR,
};
use crate::il;
use crate::memory::{MemoryObject, Resolver};
use crate::mmu::MemOp;
use crate::solver::EnumSolver;
use crate::RC;

fn executor(solver: EnumSolver, options: Options) -> Executor {
    Executor::new(Box::new(solver), options)
}

/// A at [0x1000, 0x1010), B at [0x1010, 0x1020).
fn two_objects(executor: &mut Executor) -> (ExecutionState, RC<MemoryObject>, RC<MemoryObject>) {
    let mut state = executor.new_state();
    let a = executor.allocate_at(&mut state, 0x1000, 0x10, None).unwrap();
    let b = executor.allocate_at(&mut state, 0x1010, 0x10, None).unwrap();
    (state, a, b)
}

fn constrain(state: &mut ExecutionState, x: &il::Expression, low: u64, high: u64) {
    state
        .add_constraint(il::Expression::cmpleu(il::expr_const(low, 64), x.clone()).unwrap())
        .unwrap();
    state
        .add_constraint(il::Expression::cmpleu(x.clone(), il::expr_const(high, 64)).unwrap())
        .unwrap();
}

fn run(executor: &mut Executor, state: ExecutionState, mop: &MemOp) -> Vec<ExecutionState> {
    executor.execute_memop(state, mop).unwrap()
}

#[test]
fn straddling_read_forks_per_object() {
    let mut executor = executor(
        EnumSolver::new().with_domain("x", 0x1000, 0x1030),
        Options::default(),
    );
    let (mut state, a, b) = two_objects(&mut executor);
    let x = il::expr_scalar("x", 64);
    constrain(&mut state, &x, 0x100c, 0x1012);

    let resolution = Resolver::new(&mut executor, &state).resolve(&x, 0).unwrap();
    assert!(!resolution.incomplete());
    let addresses: Vec<u64> = resolution.objects().iter().map(|o| o.address()).collect();
    assert_eq!(addresses, vec![a.address(), b.address()]);

    let load = MemOp::load(x.clone(), 32, "r");
    let states = run(&mut executor, state, &load);
    assert_eq!(states.len(), 2);
    assert_eq!(executor.stats().forks(), 2);

    let in_a = a.bounds_check_pointer(&x, 4).unwrap();
    let in_b = b.bounds_check_pointer(&x, 4).unwrap();
    assert!(executor.must_be_true(&states[0], &in_a).unwrap());
    assert!(executor.must_be_true(&states[1], &in_b).unwrap());
    for state in &states {
        assert_eq!(state.local("r"), Some(&il::expr_const(0, 32)));
    }

    // 0x100d..=0x100f straddle A and B, and belong to neither
    let terminated = executor.terminated();
    assert_eq!(terminated.len(), 1);
    assert!(terminated[0].is_error(PTR_ERR));
}

#[test]
fn unmapped_address_is_ptr_err() {
    let mut executor = executor(
        EnumSolver::new().with_domain("y", 0x1000, 0x3000),
        Options::default(),
    );
    let (mut state, _, _) = two_objects(&mut executor);
    let y = il::expr_scalar("y", 64);
    state
        .add_constraint(il::Expression::cmpeq(y.clone(), il::expr_const(0x2000, 64)).unwrap())
        .unwrap();

    let load = MemOp::load(y, 32, "r");
    assert!(run(&mut executor, state, &load).is_empty());
    assert_eq!(executor.terminated().len(), 1);
    assert!(executor.terminated()[0].is_error(PTR_ERR));
    assert_eq!(executor.stats().forks(), 0);
}

#[test]
fn unmapped_address_is_ptr_err_after_simplification() {
    let options = OptionsBuilder::new().simplify_sym_indices(true).build();
    let mut executor = executor(EnumSolver::new(), options);
    let (mut state, _, _) = two_objects(&mut executor);
    let y = il::expr_scalar("y", 64);
    state
        .add_constraint(il::Expression::cmpeq(y.clone(), il::expr_const(0x2000, 64)).unwrap())
        .unwrap();

    let load = MemOp::load(y, 32, "r");
    assert!(run(&mut executor, state, &load).is_empty());
    assert!(executor.terminated()[0].is_error(PTR_ERR));
    assert_eq!(executor.stats().queries(), 0);
}

#[test]
fn read_only_writes_fail() {
    let mut executor = executor(
        EnumSolver::new().with_domain("x", 0x1000, 0x1020),
        Options::default(),
    );
    let (mut state, a, _) = two_objects(&mut executor);
    executor.set_read_only(&mut state, &a, true).unwrap();

    let store = MemOp::store(il::expr_const(0x1004, 64), il::expr_const(0xff, 8));
    assert!(run(&mut executor, state.clone(), &store).is_empty());

    let x = il::expr_scalar("x", 64);
    let mut symbolic = state.clone();
    constrain(&mut symbolic, &x, 0x1000, 0x1008);
    let store = MemOp::store(x, il::expr_const(0xff, 8));
    assert!(run(&mut executor, symbolic, &store).is_empty());

    // a straddling store must not write the bytes which are writeable
    let store = MemOp::store(il::expr_const(0x100e, 64), il::expr_const(0xffffffff, 32));
    assert!(run(&mut executor, state.clone(), &store).is_empty());

    let terminated = executor.terminated();
    assert_eq!(terminated.len(), 3);
    assert!(terminated.iter().all(|t| t.is_error(READONLY_ERR)));
    assert_eq!(
        executor.read_debug(&state, 0x1000).unwrap(),
        Some(il::expr_const(0, 64))
    );
    assert_eq!(
        executor.read_debug(&state, 0x1010).unwrap(),
        Some(il::expr_const(0, 64))
    );

    let load = MemOp::load(il::expr_const(0x1004, 64), 8, "r");
    let states = run(&mut executor, state, &load);
    assert_eq!(states[0].local("r"), Some(&il::expr_const(0, 8)));
}

#[test]
fn concrete_round_trip() {
    let mut executor = executor(EnumSolver::new(), Options::default());
    let mut state = executor.new_state();
    let object = executor.allocate(&mut state, 64, false, false, Some(0x400)).unwrap();

    let mut states = vec![state];
    for (i, bits) in [8usize, 16, 32, 64].iter().enumerate() {
        let address = il::expr_const(object.address() + (i as u64) * 8, 64);
        let value = il::expr_const(0x0102030405060708 >> (64 - bits), *bits);
        let store = MemOp::store(address.clone(), value.clone());
        states = run(&mut executor, states.remove(0), &store);
        let load = MemOp::load(address, *bits, "r");
        states = run(&mut executor, states.remove(0), &load);
        assert_eq!(states[0].local("r"), Some(&value));
    }
}

#[test]
fn symbolic_round_trip() {
    let mut executor = executor(
        EnumSolver::new().with_domain("x", 0x1000, 0x1020),
        Options::default(),
    );
    let (mut state, a, _) = two_objects(&mut executor);
    executor.make_symbolic(&mut state, &a, "buf").unwrap();
    let x = il::expr_scalar("x", 64);
    constrain(&mut state, &x, 0x1000, 0x100f);

    let value = il::expr_scalar("v", 8);
    let store = MemOp::store(x.clone(), value.clone());
    let states = run(&mut executor, state, &store);
    assert_eq!(states.len(), 1);

    let load = MemOp::load(x, 8, "r");
    let states = run(&mut executor, states[0].clone(), &load);
    assert_eq!(states[0].local("r"), Some(&value));
    assert_eq!(executor.stats().sym_reads(), 1);
    assert_eq!(executor.stats().sym_writes(), 1);

    // untouched bytes still read from the symbolic array
    let load = MemOp::load(il::expr_const(0x1000, 64), 8, "first");
    let states = run(&mut executor, states[0].clone(), &load);
    let first = states[0].local("first").unwrap();
    assert!(first.scalars().iter().any(|s| s.name() == "buf[0]"));
}

#[test]
fn forked_states_are_isolated() {
    let mut executor = executor(EnumSolver::new(), Options::default());
    let mut state = executor.new_state();
    let object = executor.allocate(&mut state, 8, false, false, None).unwrap();
    let address = il::expr_const(object.address(), 64);

    let b = il::expr_scalar("b", 8);
    let condition = il::Expression::cmpltu(b, il::expr_const(0x80, 8)).unwrap();
    let (left, right) = executor.fork(state, &condition).unwrap();
    let (left, right) = (left.unwrap(), right.unwrap());

    let store = MemOp::store(address.clone(), il::expr_const(0x1122334455667788, 64));
    let left = run(&mut executor, left, &store).remove(0);

    let load = MemOp::load(address, 64, "r");
    let left = run(&mut executor, left, &load).remove(0);
    let right = run(&mut executor, right, &load).remove(0);
    assert_eq!(left.local("r"), Some(&il::expr_const(0x1122334455667788, 64)));
    assert_eq!(right.local("r"), Some(&il::expr_const(0, 64)));
}

fn tlb_workload(use_tlb: bool) -> Vec<Option<il::Expression>> {
    let options = OptionsBuilder::new().use_tlb(use_tlb).build();
    let mut executor = executor(EnumSolver::new(), options);
    let mut state = executor.new_state();
    let a = executor.allocate(&mut state, 0x20, false, false, Some(1)).unwrap();
    let b = executor.allocate(&mut state, 0x2000, false, false, Some(2)).unwrap();

    let ops = vec![
        MemOp::store(il::expr_const(a.address(), 64), il::expr_const(0xdead, 16)),
        MemOp::store(il::expr_const(b.address() + 0x1000, 64), il::expr_const(7, 32)),
        MemOp::load(il::expr_const(a.address(), 64), 16, "a"),
        MemOp::load(il::expr_const(b.address() + 0x1000, 64), 32, "b"),
        MemOp::store(il::expr_const(a.address() + 0x1e, 64), il::expr_const(1, 8)),
        MemOp::load(il::expr_const(a.address() + 0x1e, 64), 16, "c"),
    ];
    for mop in &ops {
        state = run(&mut executor, state, mop).remove(0);
    }

    // freeing and reallocating must not leave a stale translation behind
    executor.free(&mut state, a.address()).unwrap();
    let load = MemOp::load(il::expr_const(a.address(), 64), 16, "gone");
    assert!(run(&mut executor, state.clone(), &load).is_empty());

    ["a", "b", "c"]
        .iter()
        .map(|name| state.local(name).cloned())
        .collect()
}

#[test]
fn tlb_is_transparent() {
    let with = tlb_workload(true);
    assert_eq!(with, tlb_workload(false));
    assert_eq!(with[0], Some(il::expr_const(0xdead, 16)));
    assert_eq!(with[1], Some(il::expr_const(7, 32)));
    assert_eq!(with[2], Some(il::expr_const(1, 16)));
}

#[test]
fn allocations_never_overlap() {
    for kind in [MemoryManagerKind::Heap, MemoryManagerKind::Deterministic].iter() {
        let options = OptionsBuilder::new().memory_manager(*kind).build();
        let mut executor = executor(EnumSolver::new(), options);
        let mut state = executor.new_state();

        let mut live = Vec::new();
        for i in 0..32u64 {
            live.push(
                executor
                    .allocate(&mut state, (i % 5) * 24, false, false, Some(i % 3))
                    .unwrap(),
            );
        }
        for object in live.iter().step_by(2) {
            executor.free(&mut state, object.address()).unwrap();
        }
        for i in 0..16u64 {
            executor
                .allocate(&mut state, 1 + i * 40, false, false, Some(i % 4))
                .unwrap();
        }
        executor.allocate_chopped(&mut state, 5000, None).unwrap();

        let objects: Vec<&RC<MemoryObject>> = state.address_space().objects().collect();
        for pair in objects.windows(2) {
            assert!(
                pair[0].address() + pair[0].size().max(1) <= pair[1].address(),
                "{} overlaps {}",
                pair[0],
                pair[1]
            );
        }
    }
}

#[test]
fn sym_mmu_services_symbolic_addresses() {
    let options = OptionsBuilder::new().mmu(MmuKind::Sym).build();
    let mut executor = executor(EnumSolver::new().with_domain("x", 0x1000, 0x1008), options);
    let (state, _, _) = two_objects(&mut executor);

    let store = MemOp::store(il::expr_scalar("x", 64), il::expr_const(3, 8));
    let states = run(&mut executor, state, &store);
    assert_eq!(states.len(), 1);
    assert_eq!(executor.stats().sym_writes(), 2);

    let load = MemOp::load(il::expr_const(0x1010, 64), 8, "r");
    let states = run(&mut executor, states[0].clone(), &load);
    assert_eq!(states[0].local("r"), Some(&il::expr_const(0, 8)));
}

#[test]
fn soft_concrete_mmu_end_to_end() {
    let options = OptionsBuilder::new().mmu(MmuKind::SoftConcrete).build();
    let mut executor = executor(EnumSolver::new(), options);
    let mut state = executor.new_state();
    let page = executor.allocate_chopped(&mut state, 4096, Some(0x10)).unwrap();
    let address = page[0].address();
    crate::mmu::SoftConcreteMmu::enable(&mut state);

    // a miss takes the helpers, and leaves the soft MMU enabled
    let store = MemOp::store(il::expr_const(address + 8, 64), il::expr_const(0x99, 8));
    let state = run(&mut executor, state, &store).remove(0);
    assert!(state.soft_mmu_enabled());

    let state =
        crate::mmu::SoftConcreteMmu::tlb_insert(&mut executor, state, address, 4096).unwrap();
    let load = MemOp::load(il::expr_const(address + 8, 64), 8, "r");
    let state = run(&mut executor, state, &load).remove(0);
    assert_eq!(state.local("r"), Some(&il::expr_const(0x99, 8)));
    assert_eq!(state.soft_tlb().hits(), 1);
}

#[test]
fn symbolic_read_in_a_page_sized_object() {
    let mut executor = executor(
        EnumSolver::new().with_domain("x", 0x100000, 0x100004),
        Options::default(),
    );
    let mut state = executor.new_state();
    let page = executor
        .allocate_at(&mut state, 0x100000, 0x1000, None)
        .unwrap();
    executor.make_symbolic(&mut state, &page, "page").unwrap();
    let x = il::expr_scalar("x", 64);

    let load = MemOp::load(x.clone(), 8, "r");
    let states = run(&mut executor, state, &load);
    assert_eq!(states.len(), 1);
    assert!(executor.terminated().is_empty());

    let value = eval::eval_with(states[0].local("r").unwrap(), &|scalar| {
        match scalar.name() {
            "x" => Some(il::const_(0x100002, 64)),
            "page[2]" => Some(il::const_(0x5a, 8)),
            _ => None,
        }
    })
    .unwrap();
    assert_eq!(value.value(), 0x5a);

    let store = MemOp::store(x, il::expr_const(0x77, 8));
    let states = run(&mut executor, states[0].clone(), &store);
    let states = run(&mut executor, states[0].clone(), &load);
    assert_eq!(states[0].local("r"), Some(&il::expr_const(0x77, 8)));
}

#[test]
fn solver_failure_while_resolving_ends_the_state_early() {
    // Every lookup before the full resolution settles within 17 values.
    // Deciding whether B is feasible needs 0x811.
    let mut executor = executor(
        EnumSolver::new()
            .with_domain("x", 0xff0, 0x1fff)
            .with_budget(100),
        Options::default(),
    );
    let mut state = executor.new_state();
    executor.allocate_at(&mut state, 0x1000, 0x10, None).unwrap();
    executor.allocate_at(&mut state, 0x1800, 0x10, None).unwrap();

    let load = MemOp::load(il::expr_scalar("x", 64), 8, "r");
    assert!(run(&mut executor, state, &load).is_empty());

    let terminated = executor.terminated();
    assert_eq!(terminated.len(), 1);
    assert_eq!(terminated[0].kind(), &TerminationKind::Early);
    assert_eq!(
        terminated[0].message(),
        "query timed out (resolve): solver query timed out"
    );
    assert_eq!(executor.stats().forks(), 0);
}

#[test]
fn incomplete_resolution_splits_the_residual() {
    let options = OptionsBuilder::new().max_resolutions(1).build();
    let mut executor = executor(EnumSolver::new().with_domain("x", 0xff0, 0x1030), options);
    let (state, a, _) = two_objects(&mut executor);
    let x = il::expr_scalar("x", 64);

    let load = MemOp::load(x.clone(), 8, "r");
    let states = run(&mut executor, state, &load);
    assert_eq!(states.len(), 1);
    let in_a = a.bounds_check_pointer(&x, 1).unwrap();
    assert!(executor.must_be_true(&states[0], &in_a).unwrap());

    // below A is out of bounds, while B was never examined
    let terminated = executor.terminated();
    assert_eq!(terminated.len(), 2);
    assert!(terminated[0].is_error(PTR_ERR));
    assert_eq!(terminated[1].kind(), &TerminationKind::Early);
    assert_eq!(terminated[1].message(), "query timed out (memOpError)");
    assert_eq!(executor.stats().forks(), 2);
}

#[test]
fn oob_check_timing_out_ends_the_residual_early() {
    // Placing the residual inside B needs 0x21 values, past the budget.
    let options = OptionsBuilder::new().max_resolutions(1).build();
    let mut executor = executor(
        EnumSolver::new()
            .with_domain("x", 0xff0, 0x1030)
            .with_budget(20),
        options,
    );
    let (state, _, _) = two_objects(&mut executor);

    let load = MemOp::load(il::expr_scalar("x", 64), 8, "r");
    let states = run(&mut executor, state, &load);
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].local("r"), Some(&il::expr_const(0, 8)));

    let terminated = executor.terminated();
    assert_eq!(terminated.len(), 1);
    assert_eq!(terminated[0].kind(), &TerminationKind::Early);
    assert_eq!(
        terminated[0].message(),
        "query timed out (fork): solver query timed out"
    );
    assert_eq!(executor.stats().forks(), 1);
}
