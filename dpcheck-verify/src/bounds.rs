//! Built-in prover: sign reasoning over variable bounds, with a bounded grid
//! search for counterexamples. Needs no external solver.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use num_traits::{One, Signed, Zero};

use crate::solver::{AssumptionSet, CmpOp, Domain, Predicate, ProofOutcome, Prover, Witness};
use crate::sym::{Monomial, Point, Poly, Rational, Sym, rat, ratio};

#[derive(Clone, Debug, Default, PartialEq)]
struct Bound {
    value: Rational,
    strict: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct VarBound {
    lo: Option<Bound>,
    hi: Option<Bound>,
}

/// Per-variable interval bounds read off the assumptions, plus the remaining
/// linear facts normalized to `p >= 0`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VarBounds {
    vars: BTreeMap<String, VarBound>,
    facts: Vec<(Poly, bool)>,
}

impl VarBounds {
    pub fn derive(assumptions: &AssumptionSet) -> Self {
        let mut out = VarBounds::default();
        let mut atoms = Vec::new();
        for fact in &assumptions.facts {
            flatten_and(&fact.nnf(), &mut atoms);
        }
        for (lhs, op, rhs) in atoms {
            let (Some(l), Some(r)) = (lhs.as_poly(), rhs.as_poly()) else {
                continue;
            };
            // Normalize to `p op 0`.
            let p = l.sub(r);
            match op {
                CmpOp::Ge => out.add_fact(&p, false, assumptions),
                CmpOp::Gt => out.add_fact(&p, true, assumptions),
                CmpOp::Le => out.add_fact(&p.neg(), false, assumptions),
                CmpOp::Lt => out.add_fact(&p.neg(), true, assumptions),
                CmpOp::Eq => {
                    out.add_fact(&p, false, assumptions);
                    out.add_fact(&p.neg(), false, assumptions);
                }
                CmpOp::Ne => {}
            }
        }
        out
    }

    fn add_fact(&mut self, p: &Poly, strict: bool, assumptions: &AssumptionSet) {
        self.facts.push((p.clone(), strict));
        // Single-variable linear fact `c * x + d >= 0` bounds `x`.
        let vars = p.vars();
        if vars.len() != 1 {
            return;
        }
        let Some(x) = vars.into_iter().next() else {
            return;
        };
        let mut coef = Rational::zero();
        let mut constant = Rational::zero();
        for (m, c) in p.terms() {
            if m.is_one() {
                constant = c.clone();
            } else if *m == Monomial::var(&x) {
                coef = c.clone();
            } else {
                return;
            }
        }
        if coef.is_zero() {
            return;
        }
        let value = -constant / &coef;
        let int = assumptions.domain(&x) == Domain::Int;
        let entry = self.vars.entry(x).or_default();
        if coef.is_positive() {
            let bound = tighten(value, strict, int, true);
            entry.lo = Some(match entry.lo.take() {
                Some(old) if old.value > bound.value || (old.value == bound.value && old.strict) => old,
                _ => bound,
            });
        } else {
            let bound = tighten(value, strict, int, false);
            entry.hi = Some(match entry.hi.take() {
                Some(old) if old.value < bound.value || (old.value == bound.value && old.strict) => old,
                _ => bound,
            });
        }
    }

    fn lower(&self, x: &str) -> Option<&Bound> {
        self.vars.get(x).and_then(|b| b.lo.as_ref())
    }

    fn upper(&self, x: &str) -> Option<&Bound> {
        self.vars.get(x).and_then(|b| b.hi.as_ref())
    }

    /// Variables that are strictly positive under the assumptions.
    pub fn positive_vars(&self) -> BTreeSet<String> {
        self.vars
            .iter()
            .filter(|(_, b)| {
                b.lo
                    .as_ref()
                    .is_some_and(|lo| lo.value.is_positive() || (lo.value.is_zero() && lo.strict))
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn admits(&self, x: &str, v: &Rational) -> bool {
        let lo_ok = self
            .lower(x)
            .is_none_or(|b| if b.strict { *v > b.value } else { *v >= b.value });
        let hi_ok = self
            .upper(x)
            .is_none_or(|b| if b.strict { *v < b.value } else { *v <= b.value });
        lo_ok && hi_ok
    }

    /// Proves `p >= 0` (or `p > 0`) by sign reasoning.
    fn poly_nonneg(&self, p: &Poly, strict: bool) -> bool {
        if let Some(c) = p.as_constant() {
            return if strict { c.is_positive() } else { !c.is_negative() };
        }
        if self.signs_ok(p, strict) {
            return true;
        }
        // Use one linear fact: p - f >= 0 and f >= 0.
        self.facts.iter().any(|(f, f_strict)| {
            let rest = p.sub(f);
            self.signs_ok(&rest, strict && !*f_strict)
        })
    }

    fn signs_ok(&self, p: &Poly, strict: bool) -> bool {
        if let Some(c) = p.as_constant() {
            return if strict { c.is_positive() } else { !c.is_negative() };
        }
        let positive = self.positive_vars();

        // Clear denominators of positive variables.
        let mut q = p.clone();
        for x in p.vars() {
            let min_power = q
                .terms()
                .filter_map(|(m, _)| m.powers().find(|(v, _)| *v == x).map(|(_, e)| e))
                .min()
                .unwrap_or(0);
            if min_power < 0 {
                if !positive.contains(&x) {
                    return false;
                }
                let mut factor = Poly::constant(Rational::one());
                for _ in 0..min_power.unsigned_abs() {
                    factor = factor.mul(&Poly::var(&x));
                }
                q = q.mul(&factor);
            }
        }

        // Move every variable to its lower bound, so all of them become >= 0.
        let mut strictly_positive = BTreeSet::new();
        for x in q.vars() {
            let Some(lo) = self.lower(&x) else {
                return false;
            };
            if lo.strict {
                strictly_positive.insert(x.clone());
            }
            if !lo.value.is_zero() {
                match q.shift_var(&x, &lo.value) {
                    Some(shifted) => q = shifted,
                    None => return false,
                }
            }
        }

        if q.terms().any(|(_, c)| c.is_negative()) {
            return false;
        }
        if !strict {
            return true;
        }
        q.terms().any(|(m, c)| {
            c.is_positive() && m.powers().all(|(v, _)| strictly_positive.contains(v))
        })
    }

    fn sym_nonneg(&self, s: &Sym, strict: bool) -> bool {
        match s {
            Sym::Poly(p) => self.poly_nonneg(p, strict),
            Sym::Max(xs) => xs.iter().any(|x| self.sym_nonneg(x, strict)),
            Sym::Min(xs) => xs.iter().all(|x| self.sym_nonneg(x, strict)),
        }
    }

    fn decide(&self, goal: &Predicate) -> bool {
        match goal {
            Predicate::And(ps) => ps.iter().all(|p| self.decide(p)),
            Predicate::Or(ps) => ps.iter().any(|p| self.decide(p)),
            Predicate::Not(_) => false,
            Predicate::Cmp { lhs, op, rhs } => match op {
                CmpOp::Ge => self.sym_nonneg(&lhs.sub(rhs), false),
                CmpOp::Gt => self.sym_nonneg(&lhs.sub(rhs), true),
                CmpOp::Le => self.sym_nonneg(&rhs.sub(lhs), false),
                CmpOp::Lt => self.sym_nonneg(&rhs.sub(lhs), true),
                CmpOp::Eq => {
                    let d = lhs.sub(rhs);
                    d.is_zero() || (self.sym_nonneg(&d, false) && self.sym_nonneg(&d.neg(), false))
                }
                CmpOp::Ne => {
                    let d = lhs.sub(rhs);
                    self.sym_nonneg(&d, true) || self.sym_nonneg(&d.neg(), true)
                }
            },
        }
    }
}

fn flatten_and(p: &Predicate, out: &mut Vec<(Sym, CmpOp, Sym)>) {
    match p {
        Predicate::And(ps) => ps.iter().for_each(|q| flatten_and(q, out)),
        Predicate::Cmp { lhs, op, rhs } => out.push((lhs.clone(), *op, rhs.clone())),
        _ => {}
    }
}

fn tighten(value: Rational, strict: bool, int: bool, lower: bool) -> Bound {
    if !int {
        return Bound { value, strict };
    }
    let value = match (lower, strict) {
        (true, true) => value.floor() + Rational::one(),
        (true, false) => value.ceil(),
        (false, true) => value.ceil() - Rational::one(),
        (false, false) => value.floor(),
    };
    Bound {
        value,
        strict: false,
    }
}

fn candidates(domain: Domain) -> Vec<Rational> {
    match domain {
        Domain::Int => [1, 0, 2, 3, 4, 5, 10, -1, -10, 20, 100].into_iter().map(rat).collect(),
        Domain::Real => vec![
            rat(1),
            ratio(1, 2),
            rat(2),
            rat(0),
            ratio(1, 10),
            rat(3),
            rat(10),
            rat(-1),
            rat(-10),
            rat(100),
        ],
    }
}

/// Default prover of the engine.
#[derive(Clone, Debug)]
pub struct BoundsProver {
    /// Upper limit on grid points tried per disproof.
    pub max_points: usize,
}

impl Default for BoundsProver {
    fn default() -> Self {
        Self { max_points: 50_000 }
    }
}

impl BoundsProver {
    pub fn new(max_points: usize) -> Self {
        Self { max_points }
    }

    /// Looks for a point satisfying the assumptions where `goal` is false.
    fn disprove(
        &self,
        goal: &Predicate,
        assumptions: &AssumptionSet,
        bounds: &VarBounds,
        deadline: Instant,
    ) -> Result<Option<Point>, ()> {
        let mut vars: BTreeSet<String> = goal.free_vars();
        for fact in &assumptions.facts {
            vars.extend(fact.free_vars());
        }
        let vars: Vec<String> = vars.into_iter().collect();
        let columns: Vec<Vec<Rational>> = vars
            .iter()
            .map(|x| {
                let mut vals: Vec<Rational> = candidates(assumptions.domain(x))
                    .into_iter()
                    .filter(|v| bounds.admits(x, v))
                    .collect();
                if vals.is_empty() {
                    if let Some(lo) = bounds.lower(x) {
                        let v = if lo.strict { lo.value.clone() + ratio(1, 2) } else { lo.value.clone() };
                        if bounds.admits(x, &v) {
                            vals.push(v);
                        }
                    }
                }
                vals
            })
            .collect();
        if columns.iter().any(Vec::is_empty) {
            return Ok(None);
        }

        let mut index = vec![0usize; vars.len()];
        for visited in 0..self.max_points {
            if visited % 256 == 0 && Instant::now() > deadline {
                return Err(());
            }
            let point: Point = vars
                .iter()
                .zip(&index)
                .zip(&columns)
                .map(|((x, &i), col)| (x.clone(), col[i].clone()))
                .collect();
            if assumptions.holds_at(&point) && goal.eval(&point) == Some(false) {
                return Ok(Some(point));
            }
            // Odometer over the columns, last column fastest.
            let mut pos = vars.len();
            loop {
                if pos == 0 {
                    return Ok(None);
                }
                pos -= 1;
                index[pos] += 1;
                if index[pos] < columns[pos].len() {
                    break;
                }
                index[pos] = 0;
            }
        }
        Ok(None)
    }
}

impl Prover for BoundsProver {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn prove(&mut self, goal: &Predicate, assumptions: &AssumptionSet, timeout: Duration) -> ProofOutcome {
        let deadline = Instant::now() + timeout;
        let bounds = VarBounds::derive(assumptions);
        if bounds.decide(&goal.nnf()) {
            return ProofOutcome::Proved;
        }
        match self.disprove(goal, assumptions, &bounds, deadline) {
            Ok(Some(assignment)) => ProofOutcome::Disproved {
                witness: Some(Witness { assignment }),
            },
            Ok(None) => ProofOutcome::Unknown {
                reason: "no proof by sign reasoning and no counterexample on the grid".to_string(),
            },
            Err(()) => ProofOutcome::Unknown {
                reason: format!("timed out after {} ms", timeout.as_millis()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sv_assumptions() -> AssumptionSet {
        let mut a = AssumptionSet::new();
        a.declare("NN", Domain::Int);
        a.declare("size", Domain::Int);
        a.declare("epsilon", Domain::Real);
        a.declare("T", Domain::Real);
        a.assume(Predicate::cmp(Sym::var("NN"), CmpOp::Gt, Sym::zero()));
        a.assume(Predicate::cmp(Sym::var("NN"), CmpOp::Le, Sym::var("size")));
        a.assume(Predicate::cmp(Sym::var("T"), CmpOp::Ge, Sym::int(-10)));
        a.assume(Predicate::cmp(Sym::var("epsilon"), CmpOp::Gt, Sym::zero()));
        a
    }

    fn prove(goal: Predicate) -> ProofOutcome {
        BoundsProver::default().prove(&goal, &sv_assumptions(), Duration::from_secs(5))
    }

    fn eps() -> Sym {
        Sym::var("epsilon")
    }

    #[test]
    fn integer_strict_bounds_are_tightened() {
        let bounds = VarBounds::derive(&sv_assumptions());
        assert_eq!(bounds.lower("NN").map(|b| b.value.clone()), Some(rat(1)));
        assert!(bounds.positive_vars().contains("NN"));
        assert!(bounds.positive_vars().contains("epsilon"));
        assert!(!bounds.positive_vars().contains("T"));
    }

    #[test]
    fn proves_by_clearing_denominators_and_shifting() {
        // epsilon / (2 * NN) <= epsilon / 2 needs NN >= 1.
        let lhs = eps().div(&Sym::var("NN").scale(&rat(2))).unwrap();
        let rhs = eps().scale(&ratio(1, 2));
        assert_eq!(prove(Predicate::le(&lhs, &rhs)), ProofOutcome::Proved);
    }

    #[test]
    fn max_on_the_left_needs_every_argument() {
        let m = eps().scale(&ratio(1, 2)).join_max(&eps().div(&Sym::var("NN")).unwrap());
        assert_eq!(prove(Predicate::le(&m, &eps())), ProofOutcome::Proved);
    }

    #[test]
    fn uses_linear_facts_between_variables() {
        let goal = Predicate::le(&Sym::var("NN"), &Sym::var("size").add(&Sym::int(1)));
        assert_eq!(prove(goal), ProofOutcome::Proved);
    }

    #[test]
    fn disproves_with_a_witness_satisfying_the_assumptions() {
        // 3 * epsilon * NN / 2 + epsilon / 4 <= epsilon fails at NN = 1.
        let cost = eps()
            .mul(&Sym::var("NN"))
            .unwrap()
            .scale(&ratio(3, 2))
            .add(&eps().scale(&ratio(1, 4)));
        match prove(Predicate::le(&cost, &eps())) {
            ProofOutcome::Disproved { witness: Some(w) } => {
                assert!(sv_assumptions().holds_at(&w.assignment));
                assert_eq!(w.assignment.get("NN"), Some(&rat(1)));
            }
            other => panic!("expected a disproof, got {other:?}"),
        }
    }

    #[test]
    fn unknown_when_neither_side_can_be_shown() {
        // x * x >= 0 holds, but x has no bound to shift by.
        let x = Sym::var("x");
        let goal = Predicate::ge(&x.mul(&x).unwrap(), &Sym::zero());
        assert!(matches!(prove(goal), ProofOutcome::Unknown { .. }));
    }
}
