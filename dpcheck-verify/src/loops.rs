//! Loop rules: a widening fixpoint over the loop head, then a cost bound.

use std::collections::BTreeSet;

use dpcheck_ast::{BaseType, BinOp, Block, Expr, ExprKind, Rhs, Stmt, StmtWalk, WhileStmt, const_truth};
use dpcheck_parse::format_expr;
use tracing::debug;

use crate::engine::{Cond, Engine, Exit, Path};
use crate::error::{DeadEnd, Halt};
use crate::relation::{JoinMode, Relation};
use crate::rules::{Choice, ChoiceKey, LoopRule, Rule};
use crate::solver::ProofOutcome;
use crate::state::{Binding, TwoRunState};
use crate::sym::{Sym, rat};

/// A variable whose growth bounds the number of iterations.
#[derive(Clone, Debug)]
pub(crate) struct Meter {
    pub var: String,
    pub bound: Expr,
    /// The loop continues only while `var < bound`.
    pub strict: bool,
    /// Read from a trailing `if (..) break;` instead of the guard.
    pub from_break: bool,
}

/// A loop whose only lasting effect is which iteration last took one branch.
#[derive(Clone, Debug)]
pub(crate) struct WinnerShape {
    pub if_index: usize,
    pub if_site: usize,
    pub winners: BTreeSet<String>,
    pub noise: BTreeSet<String>,
}

impl<'a, 'p> Engine<'a, 'p> {
    pub(crate) fn exec_while(&mut self, w: &WhileStmt, entry: TwoRunState) -> Result<Vec<Path>, Halt> {
        if const_truth(&w.cond) == Some(false) {
            return Ok(vec![Path::normal(entry)]);
        }
        let assigned = Self::assigned_in(&w.body);

        if self.lockstep_only {
            let (head, paths) = self.fixpoint(w, &entry, &assigned, true)?;
            let mut exit = self.exit_state(&head, &paths);
            exit.ledger.fixed = entry.ledger.fixed.clone();
            return Ok(vec![Path::normal(exit)]);
        }

        let site = w.span.offset();
        let meters = meter_candidates(w, &assigned);
        let shape = last_winner_shape(&w.body);
        let choice = self.choose(
            ChoiceKey::loop_rule(site),
            || {
                let mut options = vec![Choice::Loop(LoopRule::ZeroCost)];
                options.extend(meters.iter().map(|m| {
                    Choice::Loop(LoopRule::Counted {
                        meter: m.var.clone(),
                        from_break: m.from_break,
                    })
                }));
                if shape.is_some() {
                    options.push(Choice::Loop(LoopRule::LastWinner));
                }
                options
            },
            w.span,
        )?;
        debug!(site, %choice, "loop rule");

        match choice {
            Choice::Loop(LoopRule::ZeroCost) => self.counted(w, entry, &assigned, None),
            Choice::Loop(LoopRule::Counted { meter, from_break }) => {
                let m = meter_candidates(w, &assigned)
                    .into_iter()
                    .find(|m| m.var == meter && m.from_break == from_break)
                    .ok_or_else(|| DeadEnd::Unresolved {
                        subject: format!("`{meter}` does not bound this loop"),
                        span: w.span,
                    })?;
                self.counted(w, entry, &assigned, Some(&m))
            }
            Choice::Loop(LoopRule::LastWinner) => {
                let shape = last_winner_shape(&w.body).ok_or_else(|| DeadEnd::Unresolved {
                    subject: "loop has no last-winner shape".to_string(),
                    span: w.span,
                })?;
                self.last_winner(w, entry, &assigned, &shape)
            }
            other => Err(DeadEnd::Unresolved {
                subject: format!("{other} is not a loop rule"),
                span: w.span,
            }
            .into()),
        }
    }

    fn round_mode(&self, round: usize, hull_only: bool) -> JoinMode {
        let s = self.config.structural_rounds;
        let h = self.config.hull_rounds;
        if hull_only {
            if round < h { JoinMode::Hull } else { JoinMode::Top }
        } else if round < s {
            JoinMode::Structural
        } else if round < s + h {
            JoinMode::Hull
        } else {
            JoinMode::Top
        }
    }

    fn round_limit(&self) -> usize {
        self.config.structural_rounds + self.config.hull_rounds + 1
    }

    /// `state` as a loop head: assigned values become fresh symbols and the
    /// fixed cost restarts from zero.
    fn as_head(&self, mut state: TwoRunState, assigned: &BTreeSet<String>, site: usize) -> TwoRunState {
        state.freshen(assigned, site);
        state.ledger.fixed = Sym::zero();
        state
    }

    /// Joins the loop head with every iteration end until nothing changes.
    /// Returns the stable head and the paths of one iteration from it.
    pub(crate) fn fixpoint(
        &mut self,
        w: &WhileStmt,
        entry: &TwoRunState,
        assigned: &BTreeSet<String>,
        hull_only: bool,
    ) -> Result<(TwoRunState, Vec<Path>), Halt> {
        let site = w.span.offset();
        let mut head = self.as_head(entry.clone(), assigned, site);
        for round in 0.. {
            self.check_guard(w, &head)?;
            let paths = self.body_paths(w, head.clone())?;
            let mode = self.round_mode(round, hull_only);
            let next = if mode == JoinMode::Structural {
                match self.join_paths(&paths, Exit::Normal, JoinMode::Structural) {
                    Some(end) => head.join(&end, mode, &self.scope.model, self.positive()),
                    None => head.clone(),
                }
            } else {
                // Each iteration end is widened against the head separately.
                let ends = paths.iter().filter(|p| p.exit == Exit::Normal).map(|p| &p.state);
                TwoRunState::join_all(std::iter::once(&head).chain(ends), mode, &self.scope.model, self.positive())
                    .unwrap_or_else(|| head.clone())
            };
            let next = self.as_head(next, assigned, site);
            if next == head {
                return Ok((head, paths));
            }
            if round > self.round_limit() {
                break;
            }
            head = next;
        }
        Err(DeadEnd::Unbounded {
            reason: "relations or cost weights do not stabilise".to_string(),
            span: w.span,
        }
        .into())
    }

    fn body_paths(&mut self, w: &WhileStmt, head: TwoRunState) -> Result<Vec<Path>, Halt> {
        self.loop_depth += 1;
        let out = self.exec_block(&w.body, vec![Path::normal(head)]);
        self.loop_depth -= 1;
        out
    }

    /// Both runs must agree on whether to run another iteration.
    fn check_guard(&mut self, w: &WhileStmt, head: &TwoRunState) -> Result<(), Halt> {
        if self.lockstep_only {
            return Ok(());
        }
        let noise_free = head.pending_in(&w.cond).is_empty();
        for atom in Cond::of(&w.cond, true).atoms() {
            let obs = self.atom_relation(head, &atom);
            match obs.rel {
                Relation::Equal => {}
                Relation::Unrelated => {
                    return Err(DeadEnd::Unresolved {
                        subject: format_expr(&w.cond),
                        span: w.cond.span,
                    }
                    .into());
                }
                Relation::Diff(d) => {
                    let concrete = noise_free && !obs.noisy;
                    self.check_preserved(atom.op, &d, concrete, &w.cond, w.cond.span)?;
                    self.check_preserved(atom.op.negate(), &d, concrete, &w.cond, w.cond.span)?;
                }
            }
        }
        Ok(())
    }

    fn exit_state(&self, head: &TwoRunState, paths: &[Path]) -> TwoRunState {
        let breaks = paths.iter().filter(|p| p.exit == Exit::Break).map(|p| &p.state);
        TwoRunState::join_all(
            std::iter::once(head).chain(breaks),
            JoinMode::Structural,
            &self.scope.model,
            self.positive(),
        )
        .unwrap_or_else(|| head.clone())
    }

    fn unbounded(w: &WhileStmt, reason: String) -> Halt {
        DeadEnd::Unbounded { reason, span: w.span }.into()
    }

    /// Zero-cost loops (`meter` is `None`) and loops whose cost grows with a
    /// bounded counter.
    fn counted(
        &mut self,
        w: &WhileStmt,
        entry: TwoRunState,
        assigned: &BTreeSet<String>,
        meter: Option<&Meter>,
    ) -> Result<Vec<Path>, Halt> {
        let site = w.span.offset();
        let (head, paths) = self.fixpoint(w, &entry, assigned, false)?;
        let costs: Vec<Sym> = paths.iter().map(|p| self.session.simplify(&p.state.ledger.fixed)).collect();

        let cost = match meter {
            None => {
                for c in &costs {
                    if !c.is_zero() && !self.session.proves_le(c, &Sym::zero()) {
                        return Err(Self::unbounded(w, format!("an iteration costs {c}")));
                    }
                }
                self.record(Rule::ZeroCostLoop, site);
                Sym::zero()
            }
            Some(m) => {
                let cost = self.metered_cost(w, &entry, &head, &paths, &costs, assigned, m)?;
                self.record(Rule::CountedLoop, site);
                cost
            }
        };

        let mut exit = self.exit_state(&head, &paths);
        exit.ledger.fixed = self.session.simplify(&entry.ledger.fixed.add(&cost));
        debug!(site, %cost, "loop cost");
        Ok(vec![Path::normal(exit)])
    }

    /// Total cost `k * T`: each iteration costs at most `k` times the growth
    /// of the meter, which grows by at most `T` over the whole loop.
    #[allow(clippy::too_many_arguments)]
    fn metered_cost(
        &mut self,
        w: &WhileStmt,
        entry: &TwoRunState,
        head: &TwoRunState,
        paths: &[Path],
        costs: &[Sym],
        assigned: &BTreeSet<String>,
        m: &Meter,
    ) -> Result<Sym, Halt> {
        let v0 = entry
            .get(&m.var)
            .and_then(|b| b.value.clone())
            .ok_or_else(|| Self::unbounded(w, format!("initial value of `{}` is unknown", m.var)))?;
        let head_v = head
            .get(&m.var)
            .and_then(|b| b.value.clone())
            .ok_or_else(|| Self::unbounded(w, format!("`{}` is not tracked", m.var)))?;

        let mut deltas = Vec::with_capacity(paths.len());
        for p in paths {
            let v = p
                .state
                .get(&m.var)
                .and_then(|b| b.value.clone())
                .ok_or_else(|| Self::unbounded(w, format!("`{}` takes an unknown value", m.var)))?;
            let d = self.session.simplify(&v.sub(&head_v));
            if !self.session.proves_nonneg(&d) {
                return Err(Self::unbounded(w, format!("`{}` may decrease by {}", m.var, d.neg())));
            }
            deltas.push(d);
        }

        let mut unknown = false;
        let mut rate = None;
        for (c, d) in costs.iter().zip(&deltas) {
            if d.is_zero() {
                continue;
            }
            let Some(k) = c.div(d) else { continue };
            let k = self.session.simplify(&k);
            if self.rate_covers(&k, costs, &deltas, &mut unknown) {
                rate = Some(k);
                break;
            }
        }
        let Some(k) = rate else {
            if costs.iter().all(Sym::is_zero) {
                return Ok(Sym::zero());
            }
            if unknown {
                return Err(DeadEnd::SolverUnknown {
                    goal: format!("iteration cost per step of `{}`", m.var),
                    reason: "side condition undecided".to_string(),
                    span: w.span,
                }
                .into());
            }
            return Err(Self::unbounded(w, format!("iteration cost is not proportional to the growth of `{}`", m.var)));
        };

        let dmax = self.session.simplify(&Sym::max_of(deltas.clone()));
        let symbols = self.scope.symbols;
        let bound = Sym::from_expr(&m.bound, &|x| {
            if symbols.is_param(x) {
                Some(Sym::var(x))
            } else if assigned.contains(x) {
                None
            } else {
                entry.get(x).and_then(|b| b.value.clone())
            }
        })
        .ok_or_else(|| Self::unbounded(w, format!("bound `{}` is not a fixed quantity", format_expr(&m.bound))))?;

        let integral = symbols.get(&m.var).is_some_and(|meta| meta.ty == BaseType::Int)
            && deltas
                .iter()
                .all(|d| d.as_constant().is_some_and(|c| c.is_integer()));
        let base = if m.strict && integral {
            bound.sub(&Sym::one()).sub(&v0)
        } else {
            bound.sub(&v0)
        };
        let base = self.session.simplify(&base);
        let base = if self.session.proves_nonneg(&base) {
            base
        } else if self.session.proves_le(&base, &Sym::zero()) {
            Sym::zero()
        } else {
            base.join_max(&Sym::zero())
        };
        let total = self.session.simplify(&base.add(&dmax));

        let cost = if let Some(kp) = k.as_poly() {
            total.mul_nonneg(kp)
        } else if let Some(tp) = total.as_poly() {
            k.mul_nonneg(tp)
        } else {
            return Err(Self::unbounded(w, format!("cannot multiply {k} by {total}")));
        };
        Ok(self.session.simplify(&cost))
    }

    /// Every path costs at most `k` times its growth of the meter.
    fn rate_covers(&mut self, k: &Sym, costs: &[Sym], deltas: &[Sym], unknown: &mut bool) -> bool {
        for (c, d) in costs.iter().zip(deltas) {
            let limit = if d.is_zero() {
                Some(Sym::zero())
            } else {
                k.mul(d).map(|s| self.session.simplify(&s))
            };
            let Some(limit) = limit else { return false };
            match self.session.le(c, &limit) {
                ProofOutcome::Proved => {}
                ProofOutcome::Unknown { .. } => {
                    *unknown = true;
                    return false;
                }
                ProofOutcome::Disproved { .. } => return false,
            }
        }
        true
    }

    /// Report-noisy-max loops. Only the iteration that last takes the
    /// winning branch has to be paid for: the winning branch is analysed
    /// against the relations the winners could have had, and every other
    /// iteration must be free.
    fn last_winner(
        &mut self,
        w: &WhileStmt,
        entry: TwoRunState,
        assigned: &BTreeSet<String>,
        shape: &WinnerShape,
    ) -> Result<Vec<Path>, Halt> {
        let site = w.span.offset();
        let shadow = self.shadow(w, &entry, assigned, &shape.winners)?;
        let forced = self.forced_first_winner(w, &entry, shape);
        let entry_w = restrict(&entry, &shape.winners);

        let mut head = self.as_head(entry.clone(), assigned, site);
        let mut winners: Option<TwoRunState> = None;
        let mut then_cost;
        let mut round = 0;
        loop {
            self.check_guard(w, &head)?;
            let mode = self.round_mode(round, false);

            let mut start = head.clone();
            overlay(&mut start, &shadow);
            let then_paths = self.forced_run(w, shape.if_site, true, start)?;
            let then_end = self
                .join_paths(&then_paths, Exit::Normal, JoinMode::Structural)
                .ok_or_else(|| Self::unbounded(w, "the winning branch never completes".to_string()))?;
            then_cost = self.session.simplify(&then_end.ledger.fixed);

            let else_w = match (&winners, forced) {
                (Some(prev), true) => Some(prev.clone()),
                (Some(prev), false) => Some(prev.join(&entry_w, mode, &self.scope.model, self.positive())),
                (None, false) => Some(entry_w.clone()),
                (None, true) => None,
            };
            let mut ends = vec![then_end.clone()];
            let mut parts = vec![restrict(&then_end, &shape.winners)];
            parts.extend(winners.clone());
            if let Some(else_w) = else_w {
                let mut start = head.clone();
                overlay(&mut start, &else_w);
                let else_paths = self.forced_run(w, shape.if_site, false, start)?;
                if let Some(else_end) = self.join_paths(&else_paths, Exit::Normal, JoinMode::Structural) {
                    let c = self.session.simplify(&else_end.ledger.fixed);
                    if !c.is_zero() && !self.session.proves_le(&c, &Sym::zero()) {
                        return Err(Self::unbounded(w, format!("a losing iteration costs {c}")));
                    }
                    parts.push(restrict(&else_end, &shape.winners));
                    ends.push(else_end);
                }
            }
            let new_w = TwoRunState::join_all(&parts, mode, &self.scope.model, self.positive())
                .unwrap_or_else(|| entry_w.clone());

            let joined = TwoRunState::join_all(
                std::iter::once(&head).chain(&ends),
                mode,
                &self.scope.model,
                self.positive(),
            )
            .unwrap_or_else(|| head.clone());
            let mut next = self.as_head(joined, assigned, site);
            overlay(&mut next, &entry_w);
            next.freshen(&shape.winners, site);

            let stable = next == head && winners.as_ref() == Some(&new_w);
            head = next;
            winners = Some(new_w);
            if stable {
                break;
            }
            round += 1;
            if round > self.round_limit() {
                return Err(Self::unbounded(w, "winner relations do not stabilise".to_string()));
            }
        }

        let final_w = match winners {
            Some(won) => won.join(&entry_w, JoinMode::Structural, &self.scope.model, self.positive()),
            None => entry_w,
        };
        let mut exit = head;
        overlay(&mut exit, &final_w);
        exit.ledger.fixed = self.session.simplify(&entry.ledger.fixed.add(&then_cost));
        self.record(Rule::LastWinnerLoop, site);
        debug!(site, cost = %then_cost, "last-winner loop");
        Ok(vec![Path::normal(exit)])
    }

    /// Relations the winner variables can reach when every draw stays in
    /// lockstep.
    fn shadow(
        &mut self,
        w: &WhileStmt,
        entry: &TwoRunState,
        assigned: &BTreeSet<String>,
        winners: &BTreeSet<String>,
    ) -> Result<TwoRunState, Halt> {
        let saved = std::mem::replace(&mut self.lockstep_only, true);
        let out = self.fixpoint(w, entry, assigned, true);
        self.lockstep_only = saved;
        let (head, _) = out?;
        Ok(restrict(&head, winners))
    }

    fn forced_run(&mut self, w: &WhileStmt, if_site: usize, polarity: bool, start: TwoRunState) -> Result<Vec<Path>, Halt> {
        let saved = self.forced.replace((if_site, polarity));
        let out = self.body_paths(w, start);
        self.forced = saved;
        out
    }

    /// The first iteration always wins when a noise-free disjunct of the
    /// winning condition already holds on entry, as `i == 0` does.
    fn forced_first_winner(&self, w: &WhileStmt, entry: &TwoRunState, shape: &WinnerShape) -> bool {
        let Some(Stmt::If(s)) = w.body.stmts.get(shape.if_index) else {
            return false;
        };
        let before: BTreeSet<String> = w.body.stmts[..shape.if_index]
            .iter()
            .flat_map(|stmt| Self::assigned_in(&single(stmt)))
            .collect();
        let untouched = |e: &Expr| !e.idents().iter().any(|id| shape.noise.contains(&id.node) || before.contains(&id.node));
        let constant = |e: &Expr| {
            let obs = entry.observe(e, self.scope);
            if obs.rel.is_equal() {
                obs.value.as_ref().and_then(Sym::as_constant)
            } else {
                None
            }
        };
        let formula = Cond::of(&s.cond, true);
        formula.disjuncts().into_iter().any(|d| {
            let Cond::Atom(a) = d else { return false };
            if !untouched(a.left) || !a.right.is_none_or(|r| untouched(r)) {
                return false;
            }
            let Some(l) = constant(a.left) else { return false };
            let r = match a.right {
                Some(r) => constant(r),
                None => Some(rat(0)),
            };
            r.is_some_and(|r| a.op.holds(&l, &r))
        })
    }
}

fn single(stmt: &Stmt) -> Block {
    Block {
        span: stmt.span(),
        stmts: vec![stmt.clone()],
    }
}

/// The bindings of `names` in `state`; missing names read as equal.
fn restrict(state: &TwoRunState, names: &BTreeSet<String>) -> TwoRunState {
    let mut out = TwoRunState::new();
    for name in names {
        let b = state.get(name).cloned().unwrap_or_else(|| Binding::equal(None));
        out.set(name, b);
    }
    out
}

fn overlay(state: &mut TwoRunState, from: &TwoRunState) {
    for (name, b) in from.bindings() {
        state.set(name, b.clone());
    }
}

fn conjuncts(e: &Expr) -> Vec<&Expr> {
    match &e.kind {
        ExprKind::Binary {
            left,
            op: BinOp::And,
            right,
        } => {
            let mut out = conjuncts(left);
            out.extend(conjuncts(right));
            out
        }
        _ => vec![e],
    }
}

/// Readings of `e` as `v OP bound` with a plain variable `v` on the left.
fn comparisons_on(e: &Expr) -> Vec<(&str, BinOp, &Expr)> {
    let ExprKind::Binary { left, op, right } = &e.kind else {
        return Vec::new();
    };
    let flipped = match op {
        BinOp::Lt => BinOp::Gt,
        BinOp::Le => BinOp::Ge,
        BinOp::Gt => BinOp::Lt,
        BinOp::Ge => BinOp::Le,
        _ => return Vec::new(),
    };
    let mut out = Vec::new();
    if let ExprKind::Ident(v) = &left.kind {
        out.push((v.node.as_str(), *op, &**right));
    }
    if let ExprKind::Ident(v) = &right.kind {
        out.push((v.node.as_str(), flipped, &**left));
    }
    out
}

pub(crate) fn meter_candidates(w: &WhileStmt, assigned: &BTreeSet<String>) -> Vec<Meter> {
    let usable = |v: &str, bound: &Expr| assigned.contains(v) && !assigned.iter().any(|a| bound.mentions(a));
    let mut out = Vec::new();
    for c in conjuncts(&w.cond) {
        for (v, op, bound) in comparisons_on(c) {
            if usable(v, bound) && matches!(op, BinOp::Lt | BinOp::Le) {
                out.push(Meter {
                    var: v.to_string(),
                    bound: bound.clone(),
                    strict: op == BinOp::Lt,
                    from_break: false,
                });
            }
        }
    }
    if let Some(Stmt::If(s)) = w.body.stmts.last() {
        let breaks = s.else_block.is_none() && matches!(s.then_block.stmts.as_slice(), [Stmt::Break(_)]);
        if breaks {
            for (v, op, bound) in comparisons_on(&s.cond) {
                if usable(v, bound) && matches!(op, BinOp::Gt | BinOp::Ge) {
                    out.push(Meter {
                        var: v.to_string(),
                        bound: bound.clone(),
                        strict: op == BinOp::Ge,
                        from_break: true,
                    });
                }
            }
        }
    }
    out
}

pub(crate) fn last_winner_shape(body: &Block) -> Option<WinnerShape> {
    let mut noise = BTreeSet::new();
    for stmt in StmtWalk::new(body) {
        match stmt {
            Stmt::Output(_) | Stmt::Break(_) => return None,
            Stmt::Decl(d) if matches!(d.init, Some(Rhs::Laplace(_))) => {
                noise.insert(d.name.node.clone());
            }
            Stmt::Assign(a) if matches!(a.value, Rhs::Laplace(_)) => {
                noise.insert(a.target.node.clone());
            }
            _ => {}
        }
    }
    let (if_index, s) = body.stmts.iter().enumerate().find_map(|(i, stmt)| match stmt {
        Stmt::If(s) if noise.iter().any(|n| s.cond.mentions(n)) => Some((i, s)),
        _ => None,
    })?;

    let declared_inside: BTreeSet<String> = StmtWalk::new(&s.then_block)
        .filter_map(|stmt| match stmt {
            Stmt::Decl(d) => Some(d.name.node.clone()),
            _ => None,
        })
        .collect();
    let mut elsewhere: BTreeSet<String> = body
        .stmts
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != if_index)
        .flat_map(|(_, stmt)| Engine::assigned_in(&single(stmt)))
        .collect();
    if let Some(b) = &s.else_block {
        elsewhere.extend(Engine::assigned_in(b));
    }
    let winners: BTreeSet<String> = Engine::assigned_in(&s.then_block)
        .into_iter()
        .filter(|v| !declared_inside.contains(v) && !elsewhere.contains(v))
        .collect();
    if winners.is_empty() {
        return None;
    }
    Some(WinnerShape {
        if_index,
        if_site: s.span.offset(),
        winners,
        noise,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpcheck_parse::parse_source;

    fn first_loop(src: &str) -> WhileStmt {
        let program = parse_source(src).unwrap();
        program
            .body
            .stmts
            .into_iter()
            .find_map(|s| match s {
                Stmt::While(w) => Some(w),
                _ => None,
            })
            .unwrap()
    }

    const HEADER: &str = r#"int f(float q[], int size, float epsilon, int N)
{
  "TYPES: epsilon: <0, 0>; size: <0, 0>; q: <*, *>; N: <0, 0>;";
  "PRECONDITION: ALL_DIFFER;";
  "CHECK: epsilon";
"#;

    #[test]
    fn meters_come_from_guard_and_trailing_break() {
        let src = format!(
            "{HEADER}  int i = 0; int count = 0;\n  while (i < size && N > count) {{\n    count = count + 1;\n    i = i + 1;\n    if (count >= N) {{ break; }}\n  }}\n}}\n"
        );
        let w = first_loop(&src);
        let meters = meter_candidates(&w, &Engine::assigned_in(&w.body));
        let found: Vec<(&str, bool, bool)> = meters
            .iter()
            .map(|m| (m.var.as_str(), m.strict, m.from_break))
            .collect();
        assert_eq!(found, vec![("i", true, false), ("count", true, false), ("count", true, true)]);
    }

    #[test]
    fn noisy_max_has_a_winner_shape() {
        let src = format!(
            "{HEADER}  int max = 0; int i = 0; float bq = 0;\n  while (i < size) {{\n    float eta = Lap(2 / epsilon);\n    if (q[i] + eta > bq || i == 0) {{\n      max = i;\n      bq = q[i] + eta;\n    }}\n    i = i + 1;\n  }}\n  CHECKDP_OUTPUT(max);\n}}\n"
        );
        let w = first_loop(&src);
        let shape = last_winner_shape(&w.body).unwrap();
        assert_eq!(shape.if_index, 1);
        assert_eq!(shape.winners, BTreeSet::from(["bq".to_string(), "max".to_string()]));
        assert!(shape.noise.contains("eta"));
    }

    #[test]
    fn shadow_fixpoint_keeps_the_running_best_within_one() {
        use std::time::{Duration, Instant};

        use crate::bounds::BoundsProver;
        use crate::config::VerifyConfig;
        use crate::relation::AdjacencyModel;
        use crate::rules::Decisions;
        use crate::solver::{AssumptionSet, SolverSession};
        use crate::state::{Scope, find_cursor};
        use crate::sym::Point;

        let src = format!(
            "{HEADER}  int max = 0; int i = 0; float bq = 0;\n  while (i < size) {{\n    float eta = Lap(2 / epsilon);\n    if (q[i] + eta > bq || i == 0) {{\n      max = i;\n      bq = q[i] + eta;\n    }}\n    i = i + 1;\n  }}\n  CHECKDP_OUTPUT(max);\n}}\n"
        );
        let (program, symbols) = dpcheck_parse::parse_and_validate(&src).unwrap();
        let config = VerifyConfig::default();
        let mut prover = BoundsProver::new(config.grid_points);
        let assumptions = AssumptionSet::from_program(&program, &symbols).unwrap();
        let mut session = SolverSession::new(&mut prover, assumptions, config.solver_timeout());
        let scope = Scope {
            symbols: &symbols,
            model: AdjacencyModel::new(program.adjacency(), "size"),
            query: "q".to_string(),
            cursor: find_cursor(&program.body, "q"),
            positive: session.positive_vars().clone(),
        };
        let mut decisions = Decisions::new();
        let deadline = Instant::now() + Duration::from_secs(60);
        let mut engine = Engine::new(&program, &scope, &config, &mut session, &mut decisions, deadline);

        let loop_at = program.body.stmts.iter().position(|s| matches!(s, Stmt::While(_))).unwrap();
        let Stmt::While(w) = &program.body.stmts[loop_at] else {
            unreachable!()
        };
        let prelude = Block {
            span: program.body.span,
            stmts: program.body.stmts[..loop_at].to_vec(),
        };
        let paths = engine.exec_block(&prelude, vec![Path::normal(TwoRunState::new())]).unwrap();
        let entry = engine.join_paths(&paths, Exit::Normal, JoinMode::Structural).unwrap();

        engine.lockstep_only = true;
        let (head, _) = engine.fixpoint(w, &entry, &Engine::assigned_in(&w.body), true).unwrap();
        let Relation::Diff(d) = &head.get("bq").unwrap().rel else {
            panic!("bq should stay related, got {:?}", head.get("bq"));
        };
        let iv = d.bounds(&scope.model);
        assert_eq!(iv.lo.eval(&Point::new()), Some(rat(-1)));
        assert_eq!(iv.hi.eval(&Point::new()), Some(rat(1)));
    }

    #[test]
    fn loops_with_outputs_have_no_winner_shape() {
        let src = format!(
            "{HEADER}  int i = 0;\n  while (i < size) {{\n    float eta = Lap(1 / epsilon);\n    if (q[i] + eta > 0) {{ CHECKDP_OUTPUT(1); }}\n    i = i + 1;\n  }}\n}}\n"
        );
        let w = first_loop(&src);
        assert!(last_winner_shape(&w.body).is_none());
    }
}
