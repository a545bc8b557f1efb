//! Finding the objects a symbolic address may reference.

use crate::executor::{eval, ExecutionState, Executor};
use crate::il;
use crate::memory::{AddressSpace, MemoryObject};
use crate::{Error, POINTER_BITS, RC};
use log::{trace, warn};

/// Objects below the base object scanned by contiguous-offset resolution.
const CONTIGUOUS_PREV_SCAN: usize = 10;
/// Objects above the base object scanned by contiguous-offset resolution.
const CONTIGUOUS_NEXT_SCAN: usize = 20;

/// The objects a symbolic address may reference, ascending by address.
///
/// A complete resolution lists every object the address may point into,
/// though the address may still fall between them. An incomplete one may be
/// missing feasible objects.
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    objects: Vec<RC<MemoryObject>>,
    incomplete: bool,
}

impl Resolution {
    fn complete(mut objects: Vec<RC<MemoryObject>>) -> Resolution {
        objects.sort_by_key(|object| object.address());
        Resolution {
            objects,
            incomplete: false,
        }
    }

    fn partial(mut objects: Vec<RC<MemoryObject>>) -> Resolution {
        objects.sort_by_key(|object| object.address());
        Resolution {
            objects,
            incomplete: true,
        }
    }

    pub fn objects(&self) -> &[RC<MemoryObject>] {
        &self.objects
    }

    pub fn into_objects(self) -> Vec<RC<MemoryObject>> {
        self.objects
    }

    pub fn incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// If `address` has the shape `constant + zext(x)` with `x` no wider than a
/// byte, the constant, which is a cheap guess at a feasible address.
fn base_guess(address: &il::Expression) -> Option<u64> {
    if let il::Expression::Add(ref lhs, ref rhs) = *address {
        let (base, offset) = match (lhs.get_constant(), rhs.get_constant()) {
            (Some(base), None) => (base, rhs),
            (None, Some(base)) => (base, lhs),
            _ => return None,
        };
        if let il::Expression::Zext(_, ref narrow) = **offset {
            if narrow.bits() <= 8 {
                return Some(base.value());
            }
        }
    }
    None
}

/// `address` lies in `[low.address, high.end)`.
fn range_expr(
    address: &il::Expression,
    low: &MemoryObject,
    high: &MemoryObject,
) -> Result<il::Expression, Error> {
    il::Expression::cmpltu(
        il::Expression::sub(address.clone(), low.base_expr())?,
        il::expr_const(high.end().saturating_sub(low.address()), POINTER_BITS),
    )
}

/// A resolution cut short at `max_resolutions` objects.
fn capped(
    address: &il::Expression,
    found: Vec<RC<MemoryObject>>,
    max_resolutions: usize,
) -> Resolution {
    warn!(
        "hit maximum resolution count of {} for {} in contiguous scan",
        max_resolutions, address
    );
    Resolution::partial(found)
}

/// `pointer` lies in one of `extents`, as a balanced disjunction.
fn within_any(pointer: &il::Expression, extents: &[(u64, u64)]) -> Result<il::Expression, Error> {
    match extents.len() {
        0 => Ok(il::expr_false()),
        1 => {
            let (begin, end) = extents[0];
            il::Expression::cmpltu(
                il::Expression::sub(pointer.clone(), il::expr_const(begin, POINTER_BITS))?,
                il::expr_const(end - begin, POINTER_BITS),
            )
        }
        n => il::Expression::or(
            within_any(pointer, &extents[..n / 2])?,
            within_any(pointer, &extents[n / 2..])?,
        ),
    }
}

/// Solver-assisted address resolution against the address space of one
/// state.
///
/// All queries go through the `Executor`, under the path constraints of the
/// state. A failed query surfaces as `Error::Solver`, and the caller is
/// expected to terminate the state.
pub struct Resolver<'r> {
    executor: &'r mut Executor,
    state: &'r ExecutionState,
}

impl<'r> Resolver<'r> {
    pub fn new(executor: &'r mut Executor, state: &'r ExecutionState) -> Resolver<'r> {
        Resolver { executor, state }
    }

    fn space(&self) -> &'r AddressSpace {
        self.state.address_space()
    }

    fn is_feasible_range(
        &mut self,
        address: &il::Expression,
        low: &MemoryObject,
        high: &MemoryObject,
    ) -> Result<bool, Error> {
        let range = range_expr(address, low, high)?;
        self.executor.may_be_true(self.state, &range)
    }

    fn must_be_in_range(
        &mut self,
        address: &il::Expression,
        low: &MemoryObject,
        high: &MemoryObject,
    ) -> Result<bool, Error> {
        let range = range_expr(address, low, high)?;
        self.executor.must_be_true(self.state, &range)
    }

    /// Find every object `address` may point into.
    ///
    /// At most `max_resolutions` objects are returned, zero meaning no limit.
    /// A resolution which stopped at the limit with candidates left
    /// unexamined is incomplete.
    pub fn resolve(
        &mut self,
        address: &il::Expression,
        max_resolutions: usize,
    ) -> Result<Resolution, Error> {
        if let Some(constant) = address.get_constant() {
            let objects = self
                .space()
                .resolve_one(constant.value())
                .cloned()
                .into_iter()
                .collect();
            return Ok(Resolution::complete(objects));
        }

        if self.executor.options().contiguous_offset_resolution() {
            if let Some(resolution) = self.resolve_contiguous(address, max_resolutions)? {
                return Ok(resolution);
            }
        }

        let objects: Vec<&RC<MemoryObject>> = self.space().objects().collect();
        if objects.is_empty() {
            return Ok(Resolution::complete(Vec::new()));
        }

        let example = match base_guess(address) {
            Some(guess) => guess,
            None => self.executor.get_value(self.state, address)?.value(),
        };

        // Candidate ranges are inclusive index pairs. The object containing
        // the example is examined first, since it is the most likely
        // target and may end the search.
        let mut stack: Vec<(usize, usize)> = Vec::new();
        let split = objects.partition_point(|object| object.address() <= example);
        if split > 0 && objects[split - 1].contains(example) {
            let hit = split - 1;
            if hit > 0 {
                stack.push((0, hit - 1));
            }
            if hit + 1 < objects.len() {
                stack.push((hit + 1, objects.len() - 1));
            }
            stack.push((hit, hit));
        } else {
            if split > 0 {
                stack.push((0, split - 1));
            }
            if split < objects.len() {
                stack.push((split, objects.len() - 1));
            }
        }

        let mut found: Vec<RC<MemoryObject>> = Vec::new();
        while let Some((low, high)) = stack.pop() {
            if !self.is_feasible_range(address, objects[low], objects[high])? {
                continue;
            }

            if low != high {
                let mid = low + (high - low) / 2;
                stack.push((mid + 1, high));
                // lower half first
                stack.push((low, mid));
                continue;
            }

            trace!("{} may reference {}", address, objects[low]);
            found.push(objects[low].clone());

            if found.len() == 1 && self.must_be_in_range(address, objects[low], objects[low])? {
                return Ok(Resolution::complete(found));
            }

            if max_resolutions != 0 && found.len() >= max_resolutions {
                if stack.is_empty() {
                    break;
                }
                warn!(
                    "hit maximum resolution count of {} for {}",
                    max_resolutions, address
                );
                return Ok(Resolution::partial(found));
            }
        }

        Ok(Resolution::complete(found))
    }

    /// Resolution for addresses of the shape `base + offset`, where `base` is
    /// a constant inside a live object, by scanning the objects contiguous
    /// with that one.
    ///
    /// Returns `None` when the shape does not match, or when the scan cannot
    /// decide and a full search is required. Like `resolve`, the scan stops
    /// at `max_resolutions` objects.
    fn resolve_contiguous(
        &mut self,
        address: &il::Expression,
        max_resolutions: usize,
    ) -> Result<Option<Resolution>, Error> {
        let base = match *address {
            il::Expression::Add(ref lhs, _) => match lhs.get_constant() {
                Some(base) if base.bits() == POINTER_BITS => base.value(),
                _ => return Ok(None),
            },
            _ => return Ok(None),
        };
        let space = self.space();
        let base_object = match space.resolve_one(base) {
            Some(object) => object.clone(),
            None => return Ok(None),
        };
        if !self.is_feasible_range(address, &base_object, &base_object)? {
            return Ok(None);
        }
        if self.must_be_in_range(address, &base_object, &base_object)? {
            return Ok(Some(Resolution::complete(vec![base_object])));
        }

        let mut found = vec![base_object.clone()];
        let mut low = base_object.clone();
        let mut high = base_object;
        let mut partial = false;
        let full = |found: &[RC<MemoryObject>]| {
            max_resolutions != 0 && found.len() >= max_resolutions
        };

        let mut scanned = 0;
        while let Some(prev) = low
            .address()
            .checked_sub(1)
            .and_then(|address| space.resolve_one(address))
        {
            if scanned == CONTIGUOUS_PREV_SCAN {
                warn!("skipped objects below 0x{:x} in contiguous scan", low.address());
                partial = true;
                break;
            }
            if !self.is_feasible_range(address, prev, prev)? {
                partial = true;
                break;
            }
            if full(&found) {
                return Ok(Some(capped(address, found, max_resolutions)));
            }
            found.push(prev.clone());
            low = prev.clone();
            scanned += 1;
        }

        scanned = 0;
        while let Some(next) = space.resolve_one(high.end()) {
            if scanned == CONTIGUOUS_NEXT_SCAN {
                warn!("skipped objects from 0x{:x} in contiguous scan", high.end());
                partial = true;
                break;
            }
            if !self.is_feasible_range(address, next, next)? {
                partial = true;
                break;
            }
            if full(&found) {
                return Ok(Some(capped(address, found, max_resolutions)));
            }
            found.push(next.clone());
            high = next.clone();
            scanned += 1;
        }

        if self.must_be_in_range(address, &low, &high)? {
            return Ok(Some(Resolution::complete(found)));
        }
        if partial {
            trace!("contiguous scan for {} is partial, searching fully", address);
            return Ok(None);
        }
        // the address covers a whole contiguous segment and escapes it
        Ok(Some(Resolution::partial(found)))
    }

    /// Find one object `address` may point into, if there is any.
    ///
    /// Tries, in order: a constant lookup, the `constant + zext(byte)` guess,
    /// the object containing a solver example, then a bisection over every
    /// live object.
    pub fn get_feasible_object(
        &mut self,
        address: &il::Expression,
    ) -> Result<Option<RC<MemoryObject>>, Error> {
        let space = self.space();
        if let Some(constant) = address.get_constant() {
            return Ok(space.resolve_one(constant.value()).cloned());
        }

        if let Some(object) = base_guess(address).and_then(|guess| space.resolve_one(guess)) {
            if self.is_feasible_range(address, object, object)? {
                trace!("guessed {} for {}", object, address);
                return Ok(Some(object.clone()));
            }
        }

        let example = self.executor.get_value(self.state, address)?.value();
        if let Some(object) = space.resolve_one(example) {
            return Ok(Some(object.clone()));
        }

        self.search_feasible(address, example)
    }

    fn search_feasible(
        &mut self,
        address: &il::Expression,
        example: u64,
    ) -> Result<Option<RC<MemoryObject>>, Error> {
        let objects: Vec<&RC<MemoryObject>> = self.space().objects().collect();
        let split = objects.partition_point(|object| object.address() <= example);
        let mut ranges = [
            if split > 0 { Some((0, split - 1)) } else { None },
            if split < objects.len() {
                Some((split, objects.len() - 1))
            } else {
                None
            },
        ];

        'search: loop {
            let current = ranges;
            for (low, high) in current.iter().flatten().copied() {
                if !self.is_feasible_range(address, objects[low], objects[high])? {
                    continue;
                }
                if low == high {
                    return Ok(Some(objects[low].clone()));
                }
                let mid = low + (high - low) / 2;
                ranges = [Some((low, mid)), Some((mid + 1, high))];
                continue 'search;
            }
            return Ok(None);
        }
    }

    /// A condition which holds when `pointer` lies outside every live object
    /// of `space`.
    pub fn oob_condition(
        space: &AddressSpace,
        pointer: &il::Expression,
    ) -> Result<il::Expression, Error> {
        let extents = space.extents();
        eval::simplify(&il::Expression::not(within_any(pointer, &extents)?)?)
    }
}

#[cfg(test)]
mod resolver_tests {
    use super::*;
    use crate::executor::{Options, OptionsBuilder};
    use crate::solver::EnumSolver;

    fn executor(solver: EnumSolver, options: Options) -> Executor {
        Executor::new(Box::new(solver), options)
    }

    fn bind_at(executor: &mut Executor, state: &mut ExecutionState, address: u64, size: u64) {
        executor
            .allocate_at(state, address, size, None)
            .unwrap();
    }

    fn x() -> il::Expression {
        il::expr_scalar("x", 64)
    }

    fn constrain(state: &mut ExecutionState, low: u64, high: u64) {
        state
            .add_constraint(il::Expression::cmpleu(il::expr_const(low, 64), x()).unwrap())
            .unwrap();
        state
            .add_constraint(il::Expression::cmpleu(x(), il::expr_const(high, 64)).unwrap())
            .unwrap();
    }

    fn addresses(resolution: &Resolution) -> Vec<u64> {
        resolution.objects().iter().map(|o| o.address()).collect()
    }

    #[test]
    fn straddling_address_resolves_in_order() {
        let solver = EnumSolver::new().with_domain("x", 0xff0, 0x1030);
        let mut executor = executor(solver, Options::default());
        let mut state = executor.new_state();
        bind_at(&mut executor, &mut state, 0x1000, 0x10);
        bind_at(&mut executor, &mut state, 0x1010, 0x10);
        bind_at(&mut executor, &mut state, 0x1100, 0x10);
        constrain(&mut state, 0x100c, 0x1012);

        let resolution = Resolver::new(&mut executor, &state)
            .resolve(&x(), 0)
            .unwrap();
        assert_eq!(addresses(&resolution), vec![0x1000, 0x1010]);
        assert!(!resolution.incomplete());
    }

    #[test]
    fn single_object_is_complete() {
        let solver = EnumSolver::new().with_domain("x", 0xff0, 0x1030);
        let mut executor = executor(solver, Options::default());
        let mut state = executor.new_state();
        bind_at(&mut executor, &mut state, 0x1000, 0x10);
        bind_at(&mut executor, &mut state, 0x1010, 0x10);
        constrain(&mut state, 0x1011, 0x101f);

        let resolution = Resolver::new(&mut executor, &state)
            .resolve(&x(), 0)
            .unwrap();
        assert_eq!(addresses(&resolution), vec![0x1010]);
        assert!(!resolution.incomplete());
    }

    #[test]
    fn every_feasible_object_is_found() {
        let solver = EnumSolver::new().with_domain("x", 0x1000, 0x1040);
        let mut executor = executor(solver, Options::default());
        let mut state = executor.new_state();
        for i in 0..4 {
            bind_at(&mut executor, &mut state, 0x1000 + i * 0x10, 0x10);
        }
        let resolution = Resolver::new(&mut executor, &state)
            .resolve(&x(), 0)
            .unwrap();
        assert_eq!(addresses(&resolution), vec![0x1000, 0x1010, 0x1020, 0x1030]);
        assert!(!resolution.incomplete());
    }

    #[test]
    fn maximum_resolutions() {
        let solver = EnumSolver::new().with_domain("x", 0x1000, 0x1040);
        let mut executor = executor(solver, Options::default());
        let mut state = executor.new_state();
        for i in 0..4 {
            bind_at(&mut executor, &mut state, 0x1000 + i * 0x10, 0x10);
        }
        let resolution = Resolver::new(&mut executor, &state)
            .resolve(&x(), 2)
            .unwrap();
        assert_eq!(resolution.len(), 2);
        assert!(resolution.incomplete());
    }

    #[test]
    fn constant_addresses() {
        let mut executor = executor(EnumSolver::new(), Options::default());
        let mut state = executor.new_state();
        bind_at(&mut executor, &mut state, 0x1000, 0x10);
        let mut resolver = Resolver::new(&mut executor, &state);
        let hit = resolver.resolve(&il::expr_const(0x1004, 64), 0).unwrap();
        assert_eq!(addresses(&hit), vec![0x1000]);
        let miss = resolver.resolve(&il::expr_const(0x2000, 64), 0).unwrap();
        assert!(miss.is_empty() && !miss.incomplete());
    }

    #[test]
    fn feasible_object_by_bisection() {
        let solver = EnumSolver::new().with_domain("x", 0, 0x1100);
        let mut executor = executor(solver, Options::default());
        let mut state = executor.new_state();
        bind_at(&mut executor, &mut state, 0x800, 0x10);
        bind_at(&mut executor, &mut state, 0x1000, 0x10);
        bind_at(&mut executor, &mut state, 0x2000, 0x10);
        // the first example, 0xf00, lies between objects
        constrain(&mut state, 0xf00, 0x1100);

        let mut resolver = Resolver::new(&mut executor, &state);
        let object = resolver.get_feasible_object(&x()).unwrap().unwrap();
        assert_eq!(object.address(), 0x1000);

        let unreachable = il::Expression::add(x(), il::expr_const(0x10000, 64)).unwrap();
        assert!(resolver.get_feasible_object(&unreachable).unwrap().is_none());
    }

    #[test]
    fn byte_offset_guess() {
        let solver = EnumSolver::new();
        let mut executor = executor(solver, Options::default());
        let mut state = executor.new_state();
        bind_at(&mut executor, &mut state, 0x1000, 0x100);
        let address = il::Expression::add(
            il::expr_const(0x1000, 64),
            il::Expression::zext(64, il::expr_scalar("b", 8)).unwrap(),
        )
        .unwrap();

        let mut resolver = Resolver::new(&mut executor, &state);
        let object = resolver.get_feasible_object(&address).unwrap().unwrap();
        assert_eq!(object.address(), 0x1000);
        let resolution = resolver.resolve(&address, 0).unwrap();
        assert_eq!(addresses(&resolution), vec![0x1000]);
        assert!(!resolution.incomplete());
    }

    #[test]
    fn contiguous_offset_resolution() {
        let solver = EnumSolver::new().with_domain("o", 0, 0x40);
        let options = OptionsBuilder::new()
            .contiguous_offset_resolution(true)
            .build();
        let mut executor = executor(solver, options);
        let mut state = executor.new_state();
        bind_at(&mut executor, &mut state, 0x1000, 0x10);
        bind_at(&mut executor, &mut state, 0x1010, 0x10);
        bind_at(&mut executor, &mut state, 0x1100, 0x10);
        let unconstrained = state.clone();

        let o = il::expr_scalar("o", 64);
        let address = il::Expression::add(il::expr_const(0x1000, 64), o.clone()).unwrap();
        state
            .add_constraint(il::Expression::cmpltu(o, il::expr_const(0x20, 64)).unwrap())
            .unwrap();

        let resolution = Resolver::new(&mut executor, &state)
            .resolve(&address, 0)
            .unwrap();
        assert_eq!(addresses(&resolution), vec![0x1000, 0x1010]);
        assert!(!resolution.incomplete());

        // the address covers the whole segment and runs past its end
        let resolution = Resolver::new(&mut executor, &unconstrained)
            .resolve(&address, 0)
            .unwrap();
        assert_eq!(addresses(&resolution), vec![0x1000, 0x1010]);
        assert!(resolution.incomplete());
    }

    #[test]
    fn contiguous_scan_respects_maximum_resolutions() {
        let solver = EnumSolver::new().with_domain("o", 0, 0x40);
        let options = OptionsBuilder::new()
            .contiguous_offset_resolution(true)
            .build();
        let mut executor = executor(solver, options);
        let mut state = executor.new_state();
        for i in 0..3 {
            bind_at(&mut executor, &mut state, 0x1000 + i * 0x10, 0x10);
        }
        let o = il::expr_scalar("o", 64);
        let address = il::Expression::add(il::expr_const(0x1000, 64), o.clone()).unwrap();
        state
            .add_constraint(il::Expression::cmpltu(o, il::expr_const(0x30, 64)).unwrap())
            .unwrap();

        let resolution = Resolver::new(&mut executor, &state)
            .resolve(&address, 2)
            .unwrap();
        assert_eq!(addresses(&resolution), vec![0x1000, 0x1010]);
        assert!(resolution.incomplete());

        let resolution = Resolver::new(&mut executor, &state)
            .resolve(&address, 0)
            .unwrap();
        assert_eq!(addresses(&resolution), vec![0x1000, 0x1010, 0x1020]);
        assert!(!resolution.incomplete());
    }

    #[test]
    fn oob_condition() {
        let mut executor = executor(EnumSolver::new(), Options::default());
        let mut state = executor.new_state();
        assert_eq!(
            Resolver::oob_condition(state.address_space(), &x()).unwrap(),
            il::expr_true()
        );
        bind_at(&mut executor, &mut state, 0x1000, 0x10);
        bind_at(&mut executor, &mut state, 0x1010, 0x10);
        let condition = Resolver::oob_condition(state.address_space(), &x()).unwrap();
        let at = |value: u64| {
            eval::eval_with(&condition, &|_| Some(il::const_(value, 64)))
                .unwrap()
                .is_true()
        };
        assert!(at(0xfff));
        assert!(!at(0x1000));
        assert!(!at(0x101f));
        assert!(at(0x1020));
    }
}
