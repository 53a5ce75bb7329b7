//! One derivation: a walk over the program under a fixed set of choices.

use std::collections::BTreeSet;
use std::time::Instant;

use dpcheck_ast::{
    BinOp, Block, Expr, ExprKind, IfStmt, LaplaceDraw, OutputStmt, Program, Rhs, Span, Stmt, UnaryOp,
    const_truth,
};
use dpcheck_parse::format_expr;
use num_traits::{Signed, Zero};
use tracing::{debug, trace};

use crate::config::VerifyConfig;
use crate::error::{DeadEnd, DivergenceWitness, Halt};
use crate::relation::{Distance, JoinMode, Relation};
use crate::rules::{BranchAlignment, Choice, ChoiceError, ChoiceKey, Decisions, NoiseAlignment, Rule, RuleApp};
use crate::solver::{CmpOp, Predicate, ProofOutcome, SolverSession};
use crate::state::{Binding, NoiseDraw, Observed, Scope, TwoRunState};
use crate::sym::{Rational, Sym};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Exit {
    Normal,
    Break,
}

#[derive(Clone, Debug)]
pub(crate) struct Path {
    pub state: TwoRunState,
    pub exit: Exit,
}

impl Path {
    pub fn normal(state: TwoRunState) -> Self {
        Self {
            state,
            exit: Exit::Normal,
        }
    }
}

/// A comparison in negation normal form. A missing right side means zero.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Atom<'e> {
    pub left: &'e Expr,
    pub op: CmpOp,
    pub right: Option<&'e Expr>,
}

/// Condition `expr` (or its negation) as a formula over atoms.
#[derive(Clone, Debug)]
pub(crate) enum Cond<'e> {
    Atom(Atom<'e>),
    And(Vec<Cond<'e>>),
    Or(Vec<Cond<'e>>),
}

impl<'e> Cond<'e> {
    pub fn of(expr: &'e Expr, polarity: bool) -> Cond<'e> {
        match &expr.kind {
            ExprKind::Unary {
                op: UnaryOp::Not,
                expr,
            } => Cond::of(expr, !polarity),
            ExprKind::Binary { left, op, right } if op.is_logical() => {
                let parts = vec![Cond::of(left, polarity), Cond::of(right, polarity)];
                if (*op == BinOp::And) == polarity {
                    Cond::And(parts)
                } else {
                    Cond::Or(parts)
                }
            }
            ExprKind::Binary { left, op, right } if op.is_comparison() => {
                let op = CmpOp::from_binop(*op).unwrap_or(CmpOp::Ne);
                Cond::Atom(Atom {
                    left,
                    op: if polarity { op } else { op.negate() },
                    right: Some(&**right),
                })
            }
            _ => Cond::Atom(Atom {
                left: expr,
                op: if polarity { CmpOp::Ne } else { CmpOp::Eq },
                right: None,
            }),
        }
    }

    pub fn atoms(&self) -> Vec<Atom<'e>> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut Vec<Atom<'e>>) {
        match self {
            Cond::Atom(a) => out.push(*a),
            Cond::And(parts) | Cond::Or(parts) => parts.iter().for_each(|p| p.collect(out)),
        }
    }

    /// Top-level disjuncts; a formula that is not a disjunction is its own
    /// single disjunct.
    pub fn disjuncts(&self) -> Vec<&Cond<'e>> {
        match self {
            Cond::Or(parts) => parts.iter().flat_map(Cond::disjuncts).collect(),
            other => vec![other],
        }
    }
}

/// Cost and trace of a completed derivation.
#[derive(Clone, Debug)]
pub(crate) struct Derivation {
    pub cost: Sym,
}

pub(crate) struct Engine<'a, 'p> {
    pub program: &'a Program,
    pub scope: &'a Scope<'a>,
    pub config: &'a VerifyConfig,
    pub session: &'a mut SolverSession<'p>,
    pub decisions: &'a mut Decisions,
    pub trace: Vec<RuleApp>,
    /// Nesting of loop bodies; paths stay apart inside them.
    pub loop_depth: usize,
    /// Shadow analysis: every draw in lockstep, no checks, no choices.
    pub lockstep_only: bool,
    /// Only this polarity of the `if` at this site is explored.
    pub forced: Option<(usize, bool)>,
    pub deadline: Instant,
}

impl<'a, 'p> Engine<'a, 'p> {
    pub fn new(
        program: &'a Program,
        scope: &'a Scope<'a>,
        config: &'a VerifyConfig,
        session: &'a mut SolverSession<'p>,
        decisions: &'a mut Decisions,
        deadline: Instant,
    ) -> Self {
        Self {
            program,
            scope,
            config,
            session,
            decisions,
            trace: Vec::new(),
            loop_depth: 0,
            lockstep_only: false,
            forced: None,
            deadline,
        }
    }

    pub fn run(&mut self) -> Result<Derivation, Halt> {
        let program = self.program;
        let paths = self.exec_block(&program.body, vec![Path::normal(TwoRunState::new())])?;
        let end = self
            .join_paths(&paths, Exit::Normal, JoinMode::Structural)
            .unwrap_or_default();
        let cost = self.session.simplify(&end.total_cost(&self.scope.model, self.positive()));
        debug!(%cost, ledger = %end.ledger, "derivation complete");
        Ok(Derivation { cost })
    }

    pub fn positive(&self) -> &'a BTreeSet<String> {
        &self.scope.positive
    }

    pub fn record(&mut self, rule: Rule, at: usize) {
        if self.lockstep_only {
            return;
        }
        if !self.trace.iter().any(|r| r.rule == rule && r.at == at) {
            self.trace.push(RuleApp { rule, at });
        }
    }

    pub fn choose(
        &mut self,
        key: ChoiceKey,
        options: impl FnOnce() -> Vec<Choice>,
        span: Span,
    ) -> Result<Choice, Halt> {
        let choice = self
            .decisions
            .choose(key, options, self.config.max_depth)
            .map_err(|e| match e {
                ChoiceError::TooDeep { limit } => DeadEnd::TooDeep { limit },
                ChoiceError::Missing { key } => DeadEnd::Unresolved {
                    subject: format!("no recorded choice for {key}"),
                    span,
                },
            })?;
        trace!(%key, %choice, "choice");
        Ok(choice)
    }

    pub fn join_paths(&self, paths: &[Path], exit: Exit, mode: JoinMode) -> Option<TwoRunState> {
        TwoRunState::join_all(
            paths.iter().filter(|p| p.exit == exit).map(|p| &p.state),
            mode,
            &self.scope.model,
            self.positive(),
        )
    }

    pub fn exec_block(&mut self, block: &Block, mut paths: Vec<Path>) -> Result<Vec<Path>, Halt> {
        if block.stmts.len() > 1 {
            self.record(Rule::Sequence, block.span.offset());
        }
        for stmt in &block.stmts {
            if Instant::now() > self.deadline {
                return Err(DeadEnd::OutOfTime.into());
            }
            let mut next = Vec::with_capacity(paths.len());
            for p in paths {
                match p.exit {
                    Exit::Break => next.push(p),
                    Exit::Normal => next.extend(self.exec_stmt(stmt, p.state)?),
                }
            }
            paths = self.merge(next);
        }
        Ok(paths)
    }

    /// Outside loops every statement ends in one state. Inside loop bodies
    /// paths stay apart up to `max_paths`.
    fn merge(&self, paths: Vec<Path>) -> Vec<Path> {
        if self.loop_depth > 0 && paths.len() <= self.config.max_paths {
            return paths;
        }
        let mut out = Vec::new();
        for exit in [Exit::Normal, Exit::Break] {
            if let Some(state) = self.join_paths(&paths, exit, JoinMode::Structural) {
                out.push(Path { state, exit });
            }
        }
        out
    }

    fn exec_stmt(&mut self, stmt: &Stmt, mut state: TwoRunState) -> Result<Vec<Path>, Halt> {
        match stmt {
            Stmt::Decl(d) => {
                match &d.init {
                    None => {
                        state.bind(&d.name.node, Binding::equal(None), self.positive());
                        self.record(Rule::DeterministicAssign, d.span.offset());
                    }
                    Some(Rhs::Expr(e)) => self.assign(&d.name.node, e, d.span, &mut state)?,
                    Some(Rhs::Laplace(lap)) => self.draw(&d.name.node, lap, d.span, &mut state)?,
                }
                Ok(vec![Path::normal(state)])
            }
            Stmt::Assign(a) => {
                match &a.value {
                    Rhs::Expr(e) => self.assign(&a.target.node, e, a.span, &mut state)?,
                    Rhs::Laplace(lap) => self.draw(&a.target.node, lap, a.span, &mut state)?,
                }
                Ok(vec![Path::normal(state)])
            }
            Stmt::If(s) => self.exec_if(s, state),
            Stmt::While(w) => self.exec_while(w, state),
            Stmt::Output(o) => {
                self.exec_output(o, &mut state)?;
                Ok(vec![Path::normal(state)])
            }
            Stmt::Break(_) => Ok(vec![Path {
                state,
                exit: Exit::Break,
            }]),
            Stmt::Block(b) => self.exec_block(b, vec![Path::normal(state)]),
        }
    }

    fn draw(&mut self, name: &str, lap: &LaplaceDraw, span: Span, state: &mut TwoRunState) -> Result<(), Halt> {
        let bad_scale = |scale: String, problem: &str, concrete: bool| DeadEnd::NoiseScale {
            scale,
            problem: problem.to_string(),
            concrete,
            span: lap.span,
        };
        let scale = Sym::from_expr(&lap.scale, &|x| Some(Sym::var(x)))
            .ok_or_else(|| bad_scale(format_expr(&lap.scale), "is not a polynomial in the parameters", false))?;
        match self.session.prove(&Predicate::cmp(scale.clone(), CmpOp::Gt, Sym::zero())) {
            ProofOutcome::Proved => {}
            ProofOutcome::Disproved { .. } => return Err(bad_scale(scale.to_string(), "can be zero or negative", true).into()),
            ProofOutcome::Unknown { reason } => {
                return Err(DeadEnd::SolverUnknown {
                    goal: format!("{scale} > 0"),
                    reason,
                    span: lap.span,
                }
                .into());
            }
        }
        let inv_scale = scale
            .as_poly()
            .and_then(|p| p.recip())
            .ok_or_else(|| bad_scale(scale.to_string(), "must be a single term to bound alignment costs", false))?;
        let draw = NoiseDraw {
            scale,
            inv_scale,
            site: span.offset(),
        };
        state.bind(name, Binding::pending(draw), self.positive());
        self.record(Rule::NoiseDraw, span.offset());
        Ok(())
    }

    fn assign(&mut self, name: &str, expr: &Expr, span: Span, state: &mut TwoRunState) -> Result<(), Halt> {
        let site = span.offset();
        let involved = !state.pending_in(expr).is_empty();
        let cancelled = self.resolve_assignment_noise(state, expr, span)?;
        let obs = state.observe(expr, self.scope);
        let rel = if cancelled { Relation::Equal } else { obs.rel };

        if self.scope.cursor.as_deref() == Some(name) {
            if self.is_advance(expr, name, state) {
                state.advance_cursor(&self.scope.model, self.positive());
            } else {
                state.blur_cursor(&self.scope.model, self.positive());
            }
        }
        let binding = Binding {
            rel,
            value: obs.value,
            noisy: obs.noisy,
            pending: None,
        };
        trace!(var = name, rel = %binding.rel, "assign");
        state.bind(name, binding, self.positive());
        if !involved {
            self.record(Rule::DeterministicAssign, site);
        }
        Ok(())
    }

    /// `cursor = cursor + k` with `k >= 1` the same in both runs.
    fn is_advance(&mut self, expr: &Expr, cursor: &str, state: &TwoRunState) -> bool {
        let ExprKind::Binary {
            left,
            op: BinOp::Add,
            right,
        } = &expr.kind
        else {
            return false;
        };
        let step = match (&left.kind, &right.kind) {
            (ExprKind::Ident(id), _) if id.node == cursor => right,
            (_, ExprKind::Ident(id)) if id.node == cursor => left,
            _ => return false,
        };
        let obs = state.observe(step, self.scope);
        match (&obs.rel, obs.value) {
            (Relation::Equal, Some(v)) => self.session.proves_le(&Sym::one(), &v),
            _ => false,
        }
    }

    /// Aligns every pending draw in an assignment. Returns whether the last
    /// one was used to cancel the whole right-hand side.
    fn resolve_assignment_noise(&mut self, state: &mut TwoRunState, expr: &Expr, span: Span) -> Result<bool, Halt> {
        let pending = state.pending_in(expr);
        if self.lockstep_only {
            for eta in &pending {
                self.align_lockstep(state, eta);
            }
            return Ok(false);
        }
        let site = span.offset();
        let mut cancelled = false;
        for (j, eta) in pending.iter().enumerate() {
            let last = j + 1 == pending.len();
            let (d0, k) = self.dependence(state, |st, scope| st.observe(expr, scope), eta);
            let can_cancel = last && k.as_ref().is_some_and(|k| !k.is_zero()) && d0.as_ref().is_some_and(|d| !d.is_zero());
            let shifts = self.config.shifts.clone();
            let choice = self.choose(
                ChoiceKey::noise(site, j),
                || {
                    let mut options = vec![Choice::Noise(NoiseAlignment::Lockstep)];
                    if can_cancel {
                        options.push(Choice::Noise(NoiseAlignment::Cancel));
                    }
                    options.extend(shifts.into_iter().map(|n| Choice::Noise(NoiseAlignment::Shift(n))));
                    options
                },
                span,
            )?;
            match (choice, d0, k) {
                (Choice::Noise(NoiseAlignment::Lockstep), _, _) => {
                    self.align_lockstep(state, eta);
                    self.record(Rule::Lockstep, site);
                }
                (Choice::Noise(NoiseAlignment::Cancel), Some(d0), Some(k)) if can_cancel => {
                    self.align_cancel(state, eta, &d0, &k);
                    self.record(Rule::Cancel, site);
                    cancelled = true;
                }
                (Choice::Noise(NoiseAlignment::Shift(n)), _, _) => {
                    self.align_offset(state, eta, Sym::int(n));
                    self.record(Rule::OneSidedShift, site);
                }
                (choice, _, _) => {
                    return Err(DeadEnd::Unresolved {
                        subject: format!("`{eta}` cannot be aligned by {choice}"),
                        span,
                    }
                    .into());
                }
            }
        }
        Ok(cancelled)
    }

    /// Distance of `observe` with the draw in lockstep, and the coefficient
    /// of the draw in it.
    fn dependence(
        &self,
        state: &TwoRunState,
        observe: impl Fn(&TwoRunState, &Scope<'_>) -> Observed,
        eta: &str,
    ) -> (Option<Distance>, Option<Rational>) {
        let d0 = observe(state, self.scope).distance();
        let mut shifted = state.clone();
        shifted.set(
            eta,
            Binding {
                rel: Relation::Diff(Distance::offset(Sym::one())),
                value: None,
                noisy: true,
                pending: None,
            },
        );
        let d1 = observe(&shifted, self.scope).distance();
        let k = match (&d0, d1) {
            (Some(a), Some(b)) => b.offset.sub(&a.offset).as_constant(),
            _ => None,
        };
        (d0, k)
    }

    fn draw_of(state: &TwoRunState, eta: &str) -> Option<NoiseDraw> {
        state.get(eta).and_then(|b| b.pending.clone())
    }

    pub(crate) fn align_lockstep(&mut self, state: &mut TwoRunState, eta: &str) {
        state.set(
            eta,
            Binding {
                rel: Relation::Equal,
                value: None,
                noisy: true,
                pending: None,
            },
        );
    }

    fn align_offset(&mut self, state: &mut TwoRunState, eta: &str, a: Sym) {
        let mut dist = Distance::offset(a);
        if let Some(draw) = Self::draw_of(state, eta) {
            self.charge(state, &mut dist, &draw);
        }
        state.set(
            eta,
            Binding {
                rel: Relation::from_distance(dist),
                value: None,
                noisy: true,
                pending: None,
            },
        );
    }

    /// Shifts the draw by `-d0 / k` so the expression it appears in has no
    /// distance left.
    fn align_cancel(&mut self, state: &mut TwoRunState, eta: &str, d0: &Distance, k: &Rational) {
        let mut dist = d0.scale(&(-k.recip()));
        if let Some(draw) = Self::draw_of(state, eta) {
            self.charge(state, &mut dist, &draw);
        }
        state.set(
            eta,
            Binding {
                rel: Relation::from_distance(dist),
                value: None,
                noisy: true,
                pending: None,
            },
        );
    }

    fn abs(&mut self, s: &Sym) -> Sym {
        if let Some(c) = s.as_constant() {
            return Sym::constant(c.abs());
        }
        if self.session.proves_nonneg(s) {
            s.clone()
        } else if self.session.proves_nonneg(&s.neg()) {
            s.neg()
        } else {
            s.join_max(&s.neg())
        }
    }

    /// Pays for shifting a draw by `dist`. Under `ONE_DIFFER` the parts tied
    /// to a record go to that record's account; the history weight of `dist`
    /// is updated in place.
    fn charge(&mut self, state: &mut TwoRunState, dist: &mut Distance, draw: &NoiseDraw) {
        let positive = self.positive();
        let inv = &draw.inv_scale;
        let one_differ = self.scope.model.one_differ();
        let mut fixed = state.ledger.fixed.clone();

        if !dist.offset.is_zero() {
            fixed = fixed.add(&self.abs(&dist.offset).mul_nonneg(inv));
        }
        if let Some(e) = &dist.entry {
            let amount = Sym::constant(e.coef.abs()).mul_nonneg(inv);
            if one_differ {
                state.ledger.current = state.ledger.current.add(&amount).simplify(positive);
            } else {
                fixed = fixed.add(&amount);
            }
        }
        if let Some(h) = &mut dist.hist {
            if one_differ {
                h.weight = h
                    .weight
                    .add(&Sym::constant(h.coef.abs()).mul_nonneg(inv))
                    .simplify(positive);
                state.bump_weights(&h.weight, positive);
            } else {
                let amount = self
                    .scope
                    .model
                    .extent_factor(h.extent)
                    .mul_nonneg(inv)
                    .scale(&h.coef.abs());
                fixed = fixed.add(&amount);
            }
        }
        if let Some(s) = dist.slack.clone() {
            let widest = self.abs(&s.lo).join_max(&self.abs(&s.hi));
            fixed = fixed.add(&widest.mul_nonneg(inv));
        }
        state.ledger.fixed = self.session.simplify(&fixed);
        trace!(eta_site = draw.site, shift = %dist, ledger = %state.ledger, "charged");
    }

    fn exec_if(&mut self, s: &IfStmt, state: TwoRunState) -> Result<Vec<Path>, Halt> {
        let site = s.span.offset();
        if let Some(truth) = const_truth(&s.cond) {
            self.record(Rule::SameBranch, site);
            return self.exec_arm(s, truth, state);
        }
        let polarities = match self.forced {
            Some((at, polarity)) if at == site => vec![polarity],
            _ => vec![true, false],
        };
        let mut out = Vec::new();
        for &polarity in &polarities {
            let mut st = state.clone();
            self.assume_branch(&s.cond, polarity, &mut st, s.cond.span)?;
            out.extend(self.exec_arm(s, polarity, st)?);
        }
        if polarities.len() == 2 {
            self.record(Rule::CaseSplit, site);
        }
        Ok(out)
    }

    fn exec_arm(&mut self, s: &IfStmt, polarity: bool, state: TwoRunState) -> Result<Vec<Path>, Halt> {
        let start = vec![Path::normal(state)];
        if polarity {
            self.exec_block(&s.then_block, start)
        } else {
            match &s.else_block {
                Some(b) => self.exec_block(b, start),
                None => Ok(start),
            }
        }
    }

    /// Relation of `left - right` for one atom.
    pub(crate) fn atom_relation(&self, state: &TwoRunState, atom: &Atom<'_>) -> Observed {
        Self::observe_atom(state, self.scope, atom)
    }

    fn observe_atom(state: &TwoRunState, scope: &Scope<'_>, atom: &Atom<'_>) -> Observed {
        let l = state.observe(atom.left, scope);
        let Some(right) = atom.right else {
            return l;
        };
        let r = state.observe(right, scope);
        let mut dropped = Vec::new();
        Observed {
            rel: l.rel.combine(&r.rel, |a, b| a.sub(b, &scope.model, &mut dropped)),
            value: None,
            noisy: l.noisy || r.noisy,
        }
    }

    /// Makes `cond` (or its negation) take the same direction in both runs,
    /// aligning the last pending draw it mentions.
    pub(crate) fn assume_branch(
        &mut self,
        cond: &Expr,
        polarity: bool,
        state: &mut TwoRunState,
        span: Span,
    ) -> Result<(), Halt> {
        let formula = Cond::of(cond, polarity);
        let atoms = formula.atoms();
        let pending = state.pending_in(cond);
        if self.lockstep_only {
            for eta in &pending {
                self.align_lockstep(state, eta);
            }
            return Ok(());
        }
        let site = span.offset();
        let Some((last, earlier)) = pending.split_last() else {
            self.check_atoms(state, &atoms, None, true, cond, span)?;
            self.record(Rule::SameBranch, site);
            return Ok(());
        };
        for eta in earlier {
            self.align_lockstep(state, eta);
        }

        let choice = self.choose(
            ChoiceKey::branch(site, polarity),
            || {
                vec![
                    Choice::Branch(BranchAlignment::Computed),
                    Choice::Branch(BranchAlignment::Cancel),
                ]
            },
            span,
        )?;
        let dependences: Vec<_> = atoms
            .iter()
            .map(|atom| self.dependence(state, |st, sc| Self::observe_atom(st, sc, atom), last))
            .collect();

        let mut exempt = None;
        match choice {
            Choice::Branch(BranchAlignment::Computed) => {
                self.align_computed(state, last, &atoms, &dependences);
                self.record(Rule::NoisyThreshold, site);
            }
            Choice::Branch(BranchAlignment::Cancel) => {
                let target = dependences.iter().enumerate().find_map(|(i, (d0, k))| match (d0, k) {
                    (Some(d0), Some(k)) if !k.is_zero() => Some((i, d0.clone(), k.clone())),
                    _ => None,
                });
                let Some((i, d0, k)) = target else {
                    return Err(DeadEnd::Unresolved {
                        subject: format!("`{}` has no comparison `{last}` can cancel", format_expr(cond)),
                        span,
                    }
                    .into());
                };
                self.align_cancel(state, last, &d0, &k);
                exempt = Some(i);
                self.record(Rule::Cancel, site);
            }
            other => {
                return Err(DeadEnd::Unresolved {
                    subject: format!("branch alignment {other} does not apply"),
                    span,
                }
                .into());
            }
        }
        self.check_atoms(state, &atoms, exempt, false, cond, span)
    }

    /// Picks the shift of `eta` closest to zero that keeps every comparison.
    /// Falls back to no shift, leaving the check to report the divergence.
    fn align_computed(
        &mut self,
        state: &mut TwoRunState,
        eta: &str,
        atoms: &[Atom<'_>],
        dependences: &[(Option<Distance>, Option<Rational>)],
    ) {
        let mut lower = Vec::new();
        let mut upper = Vec::new();
        for (atom, (d0, k)) in atoms.iter().zip(dependences) {
            let (Some(d0), Some(k)) = (d0, k) else {
                continue;
            };
            if k.is_zero() {
                continue;
            }
            let iv = d0.bounds(&self.scope.model);
            let by = -k.recip();
            let k_pos = k.is_positive();
            match atom.op {
                CmpOp::Gt | CmpOp::Ge => {
                    let b = iv.lo.scale(&by);
                    if k_pos { lower.push(b) } else { upper.push(b) }
                }
                CmpOp::Lt | CmpOp::Le => {
                    let b = iv.hi.scale(&by);
                    if k_pos { upper.push(b) } else { lower.push(b) }
                }
                CmpOp::Eq | CmpOp::Ne if d0.is_exact() => {
                    let b = d0.offset.scale(&by);
                    lower.push(b.clone());
                    upper.push(b);
                }
                CmpOp::Eq | CmpOp::Ne => {}
            }
        }
        let lmax = (!lower.is_empty()).then(|| self.session.simplify(&Sym::max_of(lower)));
        let umin = (!upper.is_empty()).then(|| self.session.simplify(&Sym::min_of(upper)));

        let mut candidates = vec![Sym::zero()];
        if let Some(l) = &lmax {
            if self.session.proves_nonneg(l) {
                candidates.push(l.clone());
            }
        }
        if let Some(u) = &umin {
            if self.session.proves_nonneg(&u.neg()) {
                candidates.push(u.clone());
            }
        }
        let mut chosen = Sym::zero();
        for a in candidates {
            let above = lmax.as_ref().is_none_or(|l| self.session.proves_le(l, &a));
            let below = umin.as_ref().is_none_or(|u| self.session.proves_le(&a, u));
            if above && below {
                chosen = a;
                break;
            }
        }
        trace!(eta, shift = %chosen, "computed alignment");
        if chosen.is_zero() {
            self.align_lockstep(state, eta);
        } else {
            self.align_offset(state, eta, chosen);
        }
    }

    /// Every atom must keep its outcome in the second run.
    fn check_atoms(
        &mut self,
        state: &TwoRunState,
        atoms: &[Atom<'_>],
        exempt: Option<usize>,
        noise_free: bool,
        cond: &Expr,
        span: Span,
    ) -> Result<(), Halt> {
        for (i, atom) in atoms.iter().enumerate() {
            if Some(i) == exempt {
                continue;
            }
            let obs = self.atom_relation(state, atom);
            match obs.rel {
                Relation::Equal => {}
                Relation::Unrelated => {
                    return Err(DeadEnd::Unresolved {
                        subject: format_expr(cond),
                        span,
                    }
                    .into());
                }
                Relation::Diff(d) => {
                    self.check_preserved(atom.op, &d, noise_free && !obs.noisy, cond, span)?;
                }
            }
        }
        Ok(())
    }

    /// `op` applied to the first run's difference implies it for the second.
    pub(crate) fn check_preserved(
        &mut self,
        op: CmpOp,
        d: &Distance,
        concrete: bool,
        cond: &Expr,
        span: Span,
    ) -> Result<(), Halt> {
        let iv = d.bounds(&self.scope.model);
        let goals = match op {
            CmpOp::Gt | CmpOp::Ge => vec![(Predicate::ge(&iv.lo, &Sym::zero()), iv.lo.clone())],
            CmpOp::Lt | CmpOp::Le => vec![(Predicate::le(&iv.hi, &Sym::zero()), iv.hi.clone())],
            CmpOp::Eq | CmpOp::Ne => vec![
                (Predicate::ge(&iv.lo, &Sym::zero()), iv.lo.clone()),
                (Predicate::le(&iv.hi, &Sym::zero()), iv.hi.clone()),
            ],
        };
        for (goal, bound) in goals {
            match self.session.prove(&goal) {
                ProofOutcome::Proved => {}
                ProofOutcome::Disproved { witness } => {
                    let condition = format_expr(cond);
                    let witness = witness.map(|w| DivergenceWitness {
                        condition: condition.clone(),
                        run_a: "0".to_string(),
                        run_b: bound
                            .eval(&w.assignment)
                            .map_or_else(|| bound.to_string(), |v| v.to_string()),
                        assignment: w.assignment,
                    });
                    return Err(DeadEnd::Divergent {
                        condition,
                        witness,
                        concrete,
                        span,
                    }
                    .into());
                }
                ProofOutcome::Unknown { reason } => {
                    return Err(DeadEnd::SolverUnknown {
                        goal: goal.to_string(),
                        reason,
                        span,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn exec_output(&mut self, o: &OutputStmt, state: &mut TwoRunState) -> Result<(), Halt> {
        let site = o.span.offset();
        let pending = state.pending_in(&o.expr);
        if self.lockstep_only {
            for eta in &pending {
                self.align_lockstep(state, eta);
            }
            return Ok(());
        }
        let mut cancelled = false;
        if let Some((last, earlier)) = pending.split_last() {
            for eta in earlier {
                self.align_lockstep(state, eta);
            }
            let (d0, k) = self.dependence(state, |st, scope| st.observe(&o.expr, scope), last);
            match (d0, k) {
                (Some(d0), Some(k)) if !k.is_zero() && !d0.is_zero() => {
                    self.align_cancel(state, last, &d0, &k);
                    self.record(Rule::Cancel, site);
                    cancelled = true;
                }
                _ => {
                    self.align_lockstep(state, last);
                    self.record(Rule::Lockstep, site);
                }
            }
        }
        if cancelled {
            self.record(Rule::AlignedOutput, site);
            return Ok(());
        }
        match state.observe(&o.expr, self.scope).rel {
            Relation::Equal => {
                self.record(Rule::AlignedOutput, site);
                Ok(())
            }
            Relation::Unrelated => Err(DeadEnd::Unresolved {
                subject: format_expr(&o.expr),
                span: o.span,
            }
            .into()),
            Relation::Diff(d) => Err(DeadEnd::Misaligned {
                expr: format_expr(&o.expr),
                distance: d.to_string(),
                span: o.span,
            }
            .into()),
        }
    }

    /// Variables assigned or declared anywhere in `block`.
    pub(crate) fn assigned_in(block: &Block) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for stmt in dpcheck_ast::StmtWalk::new(block) {
            match stmt {
                Stmt::Decl(d) => {
                    out.insert(d.name.node.clone());
                }
                Stmt::Assign(a) => {
                    out.insert(a.target.node.clone());
                }
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpcheck_parse::parse_expr;

    #[test]
    fn negated_disjunction_becomes_conjunction_of_negated_atoms() {
        let e = parse_expr("q[i] + eta > bq || i == 0").unwrap();
        let then = Cond::of(&e, true);
        assert_eq!(then.disjuncts().len(), 2);
        let els = Cond::of(&e, false);
        assert!(matches!(els, Cond::And(_)));
        let ops: Vec<CmpOp> = els.atoms().iter().map(|a| a.op).collect();
        assert_eq!(ops, vec![CmpOp::Le, CmpOp::Ne]);
    }

    #[test]
    fn bare_expressions_compare_against_zero() {
        let e = parse_expr("!(x % 2)").unwrap();
        let atoms = Cond::of(&e, true).atoms();
        assert_eq!(atoms.len(), 1);
        assert_eq!(atoms[0].op, CmpOp::Eq);
        assert!(atoms[0].right.is_none());
    }
}
