//! A solver which enumerates assignments over finite scalar domains.
//!
//! `EnumSolver` is exact for the domains it is given, and gives up with
//! `SolverFailure::Timeout` once a query has examined more assignments than
//! its budget allows. Scalars of 8 bits or fewer default to their full range.
//! Wider scalars must be given a domain.
//!
//! Only the constraints which transitively share scalars with the query are
//! considered, so unrelated constraints do not multiply the search space.

use crate::executor::eval;
use crate::il;
use crate::solver::{Solver, SolverFailure};
use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};

/// The default number of assignments a single query may examine.
pub const DEFAULT_BUDGET: u64 = 1 << 20;

/// A brute-force solver over declared scalar domains.
#[derive(Clone, Debug)]
pub struct EnumSolver {
    domains: FxHashMap<String, (u64, u64)>,
    budget: u64,
    queries: u64,
}

impl Default for EnumSolver {
    fn default() -> EnumSolver {
        EnumSolver::new()
    }
}

impl EnumSolver {
    /// Create a new `EnumSolver` with no declared domains.
    pub fn new() -> EnumSolver {
        EnumSolver {
            domains: FxHashMap::default(),
            budget: DEFAULT_BUDGET,
            queries: 0,
        }
    }

    /// Declare the inclusive range of values the named scalar may take.
    pub fn with_domain<S: Into<String>>(mut self, name: S, low: u64, high: u64) -> EnumSolver {
        self.set_domain(name, low, high);
        self
    }

    /// Declare the inclusive range of values the named scalar may take.
    pub fn set_domain<S: Into<String>>(&mut self, name: S, low: u64, high: u64) {
        self.domains.insert(name.into(), (low, high));
    }

    /// Set the number of assignments a single query may examine.
    pub fn with_budget(mut self, budget: u64) -> EnumSolver {
        self.budget = budget;
        self
    }

    /// The number of queries this solver has answered or failed.
    pub fn queries(&self) -> u64 {
        self.queries
    }

    fn domain(&self, scalar: &il::Scalar) -> Result<(u64, u64), SolverFailure> {
        if let Some(domain) = self.domains.get(scalar.name()) {
            return Ok(*domain);
        }
        if scalar.bits() <= 8 {
            Ok((0, (1u64 << scalar.bits()) - 1))
        } else {
            Err(SolverFailure::Internal(format!(
                "no domain declared for scalar {}",
                scalar
            )))
        }
    }

    /// The constraints which transitively share scalars with `seed`.
    fn relevant<'c>(
        constraints: &'c [il::Expression],
        seed: &il::Expression,
    ) -> Vec<&'c il::Expression> {
        let mut names: FxHashSet<&str> = seed.scalars().into_iter().map(|s| s.name()).collect();
        let mut taken = vec![false; constraints.len()];
        let mut relevant = Vec::new();

        loop {
            let mut changed = false;
            for (i, constraint) in constraints.iter().enumerate() {
                if taken[i] {
                    continue;
                }
                let scalars = constraint.scalars();
                if scalars.iter().any(|s| names.contains(s.name())) {
                    taken[i] = true;
                    changed = true;
                    names.extend(scalars.into_iter().map(|s| s.name()));
                    relevant.push(constraint);
                }
            }
            if !changed {
                break;
            }
        }

        relevant
    }

    fn holds(
        expr: &il::Expression,
        assignment: &FxHashMap<String, il::Constant>,
    ) -> Result<bool, SolverFailure> {
        eval::eval_with(expr, &|scalar| assignment.get(scalar.name()).cloned())
            .map(|c| c.is_true())
            .map_err(|e| SolverFailure::Internal(e.to_string()))
    }

    /// Find an assignment satisfying the constraints relevant to `seed`, and
    /// `goal` if given.
    fn find(
        &mut self,
        constraints: &[il::Expression],
        seed: &il::Expression,
        goal: Option<&il::Expression>,
    ) -> Result<Option<FxHashMap<String, il::Constant>>, SolverFailure> {
        self.queries += 1;

        let relevant = EnumSolver::relevant(constraints, seed);

        let mut scalars: Vec<il::Scalar> = Vec::new();
        for scalar in seed
            .scalars()
            .into_iter()
            .chain(relevant.iter().flat_map(|c| c.scalars()))
        {
            if !scalars.iter().any(|s| s.name() == scalar.name()) {
                scalars.push(scalar.clone());
            }
        }
        scalars.sort();

        let domains = scalars
            .iter()
            .map(|scalar| self.domain(scalar))
            .collect::<Result<Vec<(u64, u64)>, SolverFailure>>()?;
        let mut values: Vec<u64> = domains.iter().map(|d| d.0).collect();

        trace!(
            "enumerating {} scalars against {} constraints",
            scalars.len(),
            relevant.len()
        );

        let mut examined: u64 = 0;
        loop {
            examined += 1;
            if examined > self.budget {
                return Err(SolverFailure::Timeout);
            }

            let assignment: FxHashMap<String, il::Constant> = scalars
                .iter()
                .zip(values.iter())
                .map(|(s, v)| (s.name().to_string(), il::const_(*v, s.bits())))
                .collect();

            let mut satisfied = true;
            for constraint in &relevant {
                if !EnumSolver::holds(constraint, &assignment)? {
                    satisfied = false;
                    break;
                }
            }
            if satisfied {
                if let Some(goal) = goal {
                    satisfied = EnumSolver::holds(goal, &assignment)?;
                }
            }
            if satisfied {
                return Ok(Some(assignment));
            }

            // advance the odometer
            let mut i = 0;
            loop {
                if i == values.len() {
                    return Ok(None);
                }
                if values[i] < domains[i].1 {
                    values[i] += 1;
                    break;
                }
                values[i] = domains[i].0;
                i += 1;
            }
        }
    }
}

impl Solver for EnumSolver {
    fn must_be_true(
        &mut self,
        constraints: &[il::Expression],
        expr: &il::Expression,
    ) -> Result<bool, SolverFailure> {
        let negated =
            il::Expression::not(expr.clone()).map_err(|e| SolverFailure::Internal(e.to_string()))?;
        Ok(self.find(constraints, expr, Some(&negated))?.is_none())
    }

    fn may_be_true(
        &mut self,
        constraints: &[il::Expression],
        expr: &il::Expression,
    ) -> Result<bool, SolverFailure> {
        if expr.bits() != 1 {
            return Err(SolverFailure::Internal(format!(
                "{} is not a boolean expression",
                expr
            )));
        }
        Ok(self.find(constraints, expr, Some(expr))?.is_some())
    }

    fn get_value(
        &mut self,
        constraints: &[il::Expression],
        expr: &il::Expression,
    ) -> Result<il::Constant, SolverFailure> {
        let assignment = self
            .find(constraints, expr, None)?
            .ok_or(SolverFailure::Unsatisfiable)?;
        eval::eval_with(expr, &|scalar| assignment.get(scalar.name()).cloned())
            .map_err(|e| SolverFailure::Internal(e.to_string()))
    }
}
