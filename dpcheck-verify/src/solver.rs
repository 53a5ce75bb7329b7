#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use dpcheck_ast::{BaseType, BinOp, Expr, ExprKind, Program, SymbolTable, UnaryOp};
use tracing::trace;

use crate::sym::{Point, Rational, Sym};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    pub fn negate(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
        }
    }

    pub fn from_binop(op: BinOp) -> Option<CmpOp> {
        match op {
            BinOp::Lt => Some(CmpOp::Lt),
            BinOp::Le => Some(CmpOp::Le),
            BinOp::Gt => Some(CmpOp::Gt),
            BinOp::Ge => Some(CmpOp::Ge),
            BinOp::Eq => Some(CmpOp::Eq),
            BinOp::Ne => Some(CmpOp::Ne),
            _ => None,
        }
    }

    pub fn holds(self, a: &Rational, b: &Rational) -> bool {
        match self {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        }
    }
}

/// Arithmetic side condition over program parameters.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Predicate {
    Cmp { lhs: Sym, op: CmpOp, rhs: Sym },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn cmp(lhs: Sym, op: CmpOp, rhs: Sym) -> Predicate {
        Predicate::Cmp { lhs, op, rhs }
    }

    pub fn le(lhs: &Sym, rhs: &Sym) -> Predicate {
        Predicate::cmp(lhs.clone(), CmpOp::Le, rhs.clone())
    }

    pub fn ge(lhs: &Sym, rhs: &Sym) -> Predicate {
        Predicate::cmp(lhs.clone(), CmpOp::Ge, rhs.clone())
    }

    /// Pushes negations down to the comparisons.
    pub fn nnf(&self) -> Predicate {
        self.nnf_with(false)
    }

    fn nnf_with(&self, negated: bool) -> Predicate {
        match self {
            Predicate::Cmp { lhs, op, rhs } => Predicate::Cmp {
                lhs: lhs.clone(),
                op: if negated { op.negate() } else { *op },
                rhs: rhs.clone(),
            },
            Predicate::Not(inner) => inner.nnf_with(!negated),
            Predicate::And(ps) | Predicate::Or(ps) => {
                let parts = ps.iter().map(|p| p.nnf_with(negated)).collect();
                let is_and = matches!(self, Predicate::And(_));
                if is_and != negated {
                    Predicate::And(parts)
                } else {
                    Predicate::Or(parts)
                }
            }
        }
    }

    /// `None` when some term is undefined at the point.
    pub fn eval(&self, point: &Point) -> Option<bool> {
        match self {
            Predicate::Cmp { lhs, op, rhs } => Some(op.holds(&lhs.eval(point)?, &rhs.eval(point)?)),
            Predicate::And(ps) => {
                let mut all = true;
                for p in ps {
                    all &= p.eval(point)?;
                }
                Some(all)
            }
            Predicate::Or(ps) => {
                let mut any = false;
                for p in ps {
                    any |= p.eval(point)?;
                }
                Some(any)
            }
            Predicate::Not(p) => p.eval(point).map(|b| !b),
        }
    }

    pub fn free_vars(&self) -> BTreeSet<String> {
        match self {
            Predicate::Cmp { lhs, rhs, .. } => {
                let mut vs = lhs.free_vars();
                vs.extend(rhs.free_vars());
                vs
            }
            Predicate::And(ps) | Predicate::Or(ps) => ps.iter().flat_map(Predicate::free_vars).collect(),
            Predicate::Not(p) => p.free_vars(),
        }
    }

    /// Reads an assumption written in the program's expression syntax.
    pub fn from_expr(expr: &Expr) -> Option<Predicate> {
        let lookup = |name: &str| Some(Sym::var(name));
        match &expr.kind {
            ExprKind::Binary { left, op, right } => match op {
                BinOp::And | BinOp::Or => {
                    let parts = vec![Predicate::from_expr(left)?, Predicate::from_expr(right)?];
                    Some(if *op == BinOp::And {
                        Predicate::And(parts)
                    } else {
                        Predicate::Or(parts)
                    })
                }
                op => {
                    let cmp = CmpOp::from_binop(*op)?;
                    Some(Predicate::cmp(
                        Sym::from_expr(left, &lookup)?,
                        cmp,
                        Sym::from_expr(right, &lookup)?,
                    ))
                }
            },
            ExprKind::Unary {
                op: UnaryOp::Not,
                expr,
            } => Some(Predicate::Not(Box::new(Predicate::from_expr(expr)?))),
            _ => None,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Cmp { lhs, op, rhs } => write!(f, "{lhs} {} {rhs}", op.symbol()),
            Predicate::And(ps) | Predicate::Or(ps) => {
                let sep = if matches!(self, Predicate::And(_)) { " && " } else { " || " };
                for (i, p) in ps.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "({p})")?;
                }
                Ok(())
            }
            Predicate::Not(p) => write!(f, "!({p})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Domain {
    Int,
    Real,
}

/// Facts the solver may assume for the whole attempt.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AssumptionSet {
    pub facts: Vec<Predicate>,
    pub domains: BTreeMap<String, Domain>,
}

impl AssumptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assume(&mut self, fact: Predicate) {
        if !self.facts.contains(&fact) {
            self.facts.push(fact);
        }
    }

    pub fn declare(&mut self, var: &str, domain: Domain) {
        self.domains.insert(var.to_string(), domain);
    }

    pub fn domain(&self, var: &str) -> Domain {
        self.domains.get(var).copied().unwrap_or(Domain::Real)
    }

    pub fn holds_at(&self, point: &Point) -> bool {
        self.facts.iter().all(|f| f.eval(point) == Some(true))
    }

    /// Parameter domains, the ASSUME list, positivity of the budget variables
    /// and nonnegativity of the array length.
    pub fn from_program(program: &Program, symbols: &SymbolTable) -> Option<AssumptionSet> {
        let mut set = AssumptionSet::new();
        for p in symbols.params().filter(|p| !p.array) {
            let domain = match p.ty {
                BaseType::Int => Domain::Int,
                BaseType::Float => Domain::Real,
            };
            set.declare(&p.name, domain);
        }
        for expr in &program.annotations.precondition.assumptions {
            set.assume(Predicate::from_expr(expr)?);
        }
        let mut budget_vars = Vec::new();
        program.annotations.check.visit_idents(&mut |id| budget_vars.push(id.node.clone()));
        for v in budget_vars {
            set.assume(Predicate::cmp(Sym::var(&v), CmpOp::Gt, Sym::zero()));
        }
        if let Some(len) = program.length_param() {
            set.assume(Predicate::cmp(Sym::var(&len.name.node), CmpOp::Ge, Sym::zero()));
        }
        Some(set)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Witness {
    pub assignment: Point,
}

impl fmt::Display for Witness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.assignment.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k} = {v}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProofOutcome {
    Proved,
    Disproved { witness: Option<Witness> },
    Unknown { reason: String },
}

impl ProofOutcome {
    pub fn is_proved(&self) -> bool {
        matches!(self, ProofOutcome::Proved)
    }
}

/// Decision procedure for side conditions. Any implementation honouring this
/// contract can be plugged into the engine.
pub trait Prover {
    fn name(&self) -> &'static str;

    /// Decide `goal` under `assumptions`, giving up after `timeout`.
    fn prove(&mut self, goal: &Predicate, assumptions: &AssumptionSet, timeout: Duration) -> ProofOutcome;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SolverStats {
    pub queries: u64,
    pub cache_hits: u64,
    pub unknown: u64,
}

/// One attempt's view of the prover: fixed assumptions, per-query timeout and
/// a result cache keyed by the goal.
pub struct SolverSession<'p> {
    prover: &'p mut dyn Prover,
    assumptions: AssumptionSet,
    timeout: Duration,
    cache: BTreeMap<Predicate, ProofOutcome>,
    positive: BTreeSet<String>,
    pub stats: SolverStats,
}

impl<'p> SolverSession<'p> {
    pub fn new(prover: &'p mut dyn Prover, assumptions: AssumptionSet, timeout: Duration) -> Self {
        let positive = crate::bounds::VarBounds::derive(&assumptions).positive_vars();
        Self {
            prover,
            assumptions,
            timeout,
            cache: BTreeMap::new(),
            positive,
            stats: SolverStats::default(),
        }
    }

    pub fn assumptions(&self) -> &AssumptionSet {
        &self.assumptions
    }

    pub fn prover_name(&self) -> &'static str {
        self.prover.name()
    }

    /// Variables the assumptions make strictly positive.
    pub fn positive_vars(&self) -> &BTreeSet<String> {
        &self.positive
    }

    pub fn prove(&mut self, goal: &Predicate) -> ProofOutcome {
        self.stats.queries += 1;
        if let Some(hit) = self.cache.get(goal) {
            self.stats.cache_hits += 1;
            return hit.clone();
        }
        let outcome = self.prover.prove(goal, &self.assumptions, self.timeout);
        trace!(prover = self.prover.name(), %goal, ?outcome, "side condition");
        if matches!(outcome, ProofOutcome::Unknown { .. }) {
            self.stats.unknown += 1;
        }
        self.cache.insert(goal.clone(), outcome.clone());
        outcome
    }

    pub fn le(&mut self, a: &Sym, b: &Sym) -> ProofOutcome {
        self.prove(&Predicate::le(a, b))
    }

    pub fn proves_le(&mut self, a: &Sym, b: &Sym) -> bool {
        self.le(a, b).is_proved()
    }

    pub fn proves_nonneg(&mut self, a: &Sym) -> bool {
        self.proves_le(&Sym::zero(), a)
    }

    pub fn simplify(&self, s: &Sym) -> Sym {
        s.simplify(&self.positive)
    }
}

#[cfg(feature = "z3")]
pub mod z3_prover {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use num_bigint::BigInt;
    use num_traits::{One, Zero};
    use z3::{
        ast::{Ast, Bool, Int, Real},
        Config, Context, Params, SatResult, Solver,
    };

    use super::{AssumptionSet, CmpOp, Domain, Predicate, ProofOutcome, Prover, Witness};
    use crate::sym::{Poly, Rational, Sym};

    pub struct Z3Prover {
        ctx: &'static Context,
    }

    impl Default for Z3Prover {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Z3Prover {
        pub fn new() -> Self {
            let mut cfg = Config::new();
            cfg.set_model_generation(true);
            // The context lives for the rest of the process; leaking it avoids a
            // self-referential prover struct.
            let ctx: &'static Context = Box::leak(Box::new(Context::new(&cfg)));
            Self { ctx }
        }

        fn constant(&self, c: &Rational) -> Real<'static> {
            let num = c.numer().to_string();
            let den = c.denom().to_string();
            Real::from_real_str(self.ctx, &num, &den)
                .unwrap_or_else(|| Real::from_real(self.ctx, 0, 1))
        }

        fn var(&self, name: &str, assumptions: &AssumptionSet, vars: &mut BTreeMap<String, Real<'static>>) -> Real<'static> {
            if let Some(v) = vars.get(name) {
                return v.clone();
            }
            let v = match assumptions.domain(name) {
                Domain::Int => Int::new_const(self.ctx, name).to_real(),
                Domain::Real => Real::new_const(self.ctx, name),
            };
            vars.insert(name.to_string(), v.clone());
            v
        }

        fn poly(&self, p: &Poly, assumptions: &AssumptionSet, vars: &mut BTreeMap<String, Real<'static>>) -> Real<'static> {
            let mut sum = self.constant(&Rational::zero());
            for (m, c) in p.terms() {
                let mut num = self.constant(c);
                let mut den = self.constant(&Rational::one());
                for (v, e) in m.powers() {
                    let x = self.var(v, assumptions, vars);
                    for _ in 0..e.unsigned_abs() {
                        if e > 0 {
                            num = Real::mul(self.ctx, &[&num, &x]);
                        } else {
                            den = Real::mul(self.ctx, &[&den, &x]);
                        }
                    }
                }
                sum = Real::add(self.ctx, &[&sum, &num.div(&den)]);
            }
            sum
        }

        fn sym(&self, s: &Sym, assumptions: &AssumptionSet, vars: &mut BTreeMap<String, Real<'static>>) -> Real<'static> {
            match s {
                Sym::Poly(p) => self.poly(p, assumptions, vars),
                Sym::Max(xs) | Sym::Min(xs) => {
                    let is_max = matches!(s, Sym::Max(_));
                    let mut acc = self.sym(&xs[0], assumptions, vars);
                    for x in &xs[1..] {
                        let y = self.sym(x, assumptions, vars);
                        let pick_y = if is_max { y.gt(&acc) } else { y.lt(&acc) };
                        acc = pick_y.ite(&y, &acc);
                    }
                    acc
                }
            }
        }

        fn pred(&self, p: &Predicate, assumptions: &AssumptionSet, vars: &mut BTreeMap<String, Real<'static>>) -> Bool<'static> {
            match p {
                Predicate::Cmp { lhs, op, rhs } => {
                    let l = self.sym(lhs, assumptions, vars);
                    let r = self.sym(rhs, assumptions, vars);
                    match op {
                        CmpOp::Lt => l.lt(&r),
                        CmpOp::Le => l.le(&r),
                        CmpOp::Gt => l.gt(&r),
                        CmpOp::Ge => l.ge(&r),
                        CmpOp::Eq => l._eq(&r),
                        CmpOp::Ne => l._eq(&r).not(),
                    }
                }
                Predicate::And(ps) | Predicate::Or(ps) => {
                    let parts: Vec<Bool<'static>> = ps.iter().map(|q| self.pred(q, assumptions, vars)).collect();
                    let refs: Vec<&Bool<'static>> = parts.iter().collect();
                    if matches!(p, Predicate::And(_)) {
                        Bool::and(self.ctx, &refs)
                    } else {
                        Bool::or(self.ctx, &refs)
                    }
                }
                Predicate::Not(q) => self.pred(q, assumptions, vars).not(),
            }
        }
    }

    impl Prover for Z3Prover {
        fn name(&self) -> &'static str {
            "z3"
        }

        fn prove(&mut self, goal: &Predicate, assumptions: &AssumptionSet, timeout: Duration) -> ProofOutcome {
            // Refutation: the goal holds iff assumptions && !goal is UNSAT.
            let solver = Solver::new(self.ctx);
            let mut params = Params::new(self.ctx);
            params.set_u32("timeout", timeout.as_millis().min(u32::MAX as u128) as u32);
            params.set_u32("smt.random_seed", 0);
            solver.set_params(&params);

            let mut vars = BTreeMap::new();
            for fact in &assumptions.facts {
                solver.assert(&self.pred(fact, assumptions, &mut vars));
            }
            solver.assert(&self.pred(goal, assumptions, &mut vars).not());

            match solver.check() {
                SatResult::Unsat => ProofOutcome::Proved,
                SatResult::Sat => {
                    let witness = solver.get_model().map(|model| {
                        let mut assignment = BTreeMap::new();
                        for (name, v) in &vars {
                            let value = model
                                .eval(v, true)
                                .and_then(|r| r.as_real())
                                .map(|(n, d)| Rational::new(BigInt::from(n), BigInt::from(d)));
                            if let Some(value) = value {
                                assignment.insert(name.clone(), value);
                            }
                        }
                        Witness { assignment }
                    });
                    ProofOutcome::Disproved { witness }
                }
                SatResult::Unknown => ProofOutcome::Unknown {
                    reason: solver
                        .get_reason_unknown()
                        .unwrap_or_else(|| "z3 returned unknown".to_string()),
                },
            }
        }
    }
}
