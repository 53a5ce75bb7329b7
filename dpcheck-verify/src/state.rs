//! Abstract state of the two aligned runs at one program point.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use dpcheck_ast::{BinOp, Block, Expr, ExprKind, Rhs, Stmt, StmtWalk, SymbolTable, UnaryOp};
use num_traits::Zero;

use crate::relation::{AdjacencyModel, Distance, Interval, JoinMode, Relation, Released, join_relations};
use crate::sym::{Poly, Sym, parse_decimal, rat};

/// A `Lap(scale)` draw whose alignment is decided at its first use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoiseDraw {
    pub scale: Sym,
    /// `1 / scale`: the price of shifting this draw by one.
    pub inv_scale: Poly,
    pub site: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub rel: Relation,
    /// Value in the first run, when it is a known symbol.
    pub value: Option<Sym>,
    /// Depends on a noise draw.
    pub noisy: bool,
    pub pending: Option<NoiseDraw>,
}

impl Binding {
    pub fn equal(value: Option<Sym>) -> Self {
        Self {
            rel: Relation::Equal,
            value,
            noisy: false,
            pending: None,
        }
    }

    pub fn pending(draw: NoiseDraw) -> Self {
        Self {
            rel: Relation::Equal,
            value: None,
            noisy: true,
            pending: Some(draw),
        }
    }

    /// Value in the second run, when the distance is a known offset.
    pub fn value_b(&self) -> Option<Sym> {
        let a = self.value.as_ref()?;
        match &self.rel {
            Relation::Equal => Some(a.clone()),
            Relation::Diff(d) if d.is_exact() => Some(a.add(&d.offset)),
            _ => None,
        }
    }
}

/// Privacy cost spent so far.
///
/// `fixed` is paid in every neighbouring pair. Under `ONE_DIFFER` only one
/// record differs, so costs tied to a record are kept apart: `current` for the
/// entry under the cursor and `settled` for the worst entry already passed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CostLedger {
    pub fixed: Sym,
    pub current: Sym,
    pub settled: Sym,
}

impl CostLedger {
    fn join(&self, other: &CostLedger, positive: &BTreeSet<String>) -> CostLedger {
        CostLedger {
            fixed: self.fixed.join_max(&other.fixed).simplify(positive),
            current: self.current.join_max(&other.current).simplify(positive),
            settled: self.settled.join_max(&other.settled).simplify(positive),
        }
    }
}

impl fmt::Display for CostLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fixed {}, current {}, settled {}", self.fixed, self.current, self.settled)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TwoRunState {
    vars: BTreeMap<String, Binding>,
    pub ledger: CostLedger,
}

impl TwoRunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.vars.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Binding> {
        self.vars.get_mut(name)
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&String, &Binding)> {
        self.vars.iter()
    }

    /// Binds `name`, releasing the history weight of the value it replaces.
    pub fn bind(&mut self, name: &str, binding: Binding, positive: &BTreeSet<String>) {
        if let Some(old) = self.vars.insert(name.to_string(), binding) {
            if let Some(w) = old.rel.weight() {
                self.release(w, positive);
            }
        }
    }

    /// Overrides a binding without touching the ledger.
    pub fn set(&mut self, name: &str, binding: Binding) {
        self.vars.insert(name.to_string(), binding);
    }

    pub fn remove(&mut self, name: &str, positive: &BTreeSet<String>) -> Option<Binding> {
        let old = self.vars.remove(name)?;
        if let Some(w) = old.rel.weight() {
            self.release(w, positive);
        }
        Some(old)
    }

    pub fn release(&mut self, weight: &Sym, positive: &BTreeSet<String>) {
        if !weight.is_zero() {
            self.ledger.settled = self.ledger.settled.join_max(weight).simplify(positive);
        }
    }

    fn release_all(&mut self, released: Released, positive: &BTreeSet<String>) {
        for w in released {
            self.release(&w, positive);
        }
    }

    /// Names of noise draws still waiting for an alignment.
    pub fn pending_in(&self, expr: &Expr) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        expr.visit_idents(&mut |id| {
            let pending = self.vars.get(&id.node).is_some_and(|b| b.pending.is_some());
            if pending && !out.contains(&id.node) {
                out.push(id.node.clone());
            }
        });
        out
    }

    pub fn hist_weights(&self) -> Vec<Sym> {
        self.vars.values().filter_map(|b| b.rel.weight().cloned()).collect()
    }

    /// Raises every history weight to at least `w`.
    pub fn bump_weights(&mut self, w: &Sym, positive: &BTreeSet<String>) {
        for b in self.vars.values_mut() {
            if let Relation::Diff(d) = &mut b.rel {
                if let Some(h) = &mut d.hist {
                    h.weight = h.weight.join_max(w).simplify(positive);
                }
            }
        }
    }

    /// Total cost of the run so far.
    pub fn total_cost(&self, model: &AdjacencyModel, positive: &BTreeSet<String>) -> Sym {
        if !model.one_differ() {
            return self.ledger.fixed.simplify(positive);
        }
        let mut per_record = vec![self.ledger.current.clone(), self.ledger.settled.clone()];
        per_record.extend(self.hist_weights());
        self.ledger.fixed.add(&Sym::max_of(per_record)).simplify(positive)
    }

    /// The cursor moved to the next entry.
    pub fn advance_cursor(&mut self, model: &AdjacencyModel, positive: &BTreeSet<String>) {
        let current = self.ledger.current.clone();
        for b in self.vars.values_mut() {
            if let Relation::Diff(d) = &mut b.rel {
                d.advance(&current, model, positive);
            }
        }
        self.ledger.settled = self.ledger.settled.join_max(&current).simplify(positive);
        self.ledger.current = Sym::zero();
    }

    /// The cursor moved somewhere unknown: entry and history terms only keep
    /// their bounds.
    pub fn blur_cursor(&mut self, model: &AdjacencyModel, positive: &BTreeSet<String>) {
        let mut released = Released::new();
        for b in self.vars.values_mut() {
            if let Relation::Diff(d) = &b.rel {
                let mut d = d.clone();
                d.blur_entry(model);
                d.blur_hist(model, &mut released);
                b.rel = Relation::from_distance(d);
            }
        }
        released.push(self.ledger.current.clone());
        self.ledger.current = Sym::zero();
        self.release_all(released, positive);
    }

    /// Replaces the first-run values of `names` by fresh symbols tagged with
    /// `site`.
    pub fn freshen<'n>(&mut self, names: impl IntoIterator<Item = &'n String>, site: usize) {
        for name in names {
            if let Some(b) = self.vars.get_mut(name) {
                b.value = Some(Sym::var(&format!("{name}#{site}")));
            }
        }
    }

    /// Least state covering both inputs.
    pub fn join(
        &self,
        other: &TwoRunState,
        mode: JoinMode,
        model: &AdjacencyModel,
        positive: &BTreeSet<String>,
    ) -> TwoRunState {
        let mut released = Released::new();
        let mut vars = BTreeMap::new();
        for (name, a) in &self.vars {
            let Some(b) = other.vars.get(name) else {
                released.extend(a.rel.weight().cloned());
                continue;
            };
            vars.insert(name.clone(), join_bindings(a, b, mode, model, positive, &mut released));
        }
        for (name, b) in &other.vars {
            if !self.vars.contains_key(name) {
                released.extend(b.rel.weight().cloned());
            }
        }
        let mut out = TwoRunState {
            vars,
            ledger: self.ledger.join(&other.ledger, positive),
        };
        out.release_all(released, positive);
        out
    }

    pub fn join_all<'s>(
        states: impl IntoIterator<Item = &'s TwoRunState>,
        mode: JoinMode,
        model: &AdjacencyModel,
        positive: &BTreeSet<String>,
    ) -> Option<TwoRunState> {
        states.into_iter().fold(None, |acc, s| match acc {
            None => Some(s.clone()),
            Some(acc) => Some(acc.join(s, mode, model, positive)),
        })
    }

    /// Observes an expression under this state.
    pub fn observe(&self, expr: &Expr, scope: &Scope<'_>) -> Observed {
        match &expr.kind {
            ExprKind::Int(n) => Observed::equal(Some(Sym::literal(*n))),
            ExprKind::Decimal(s) => Observed::equal(parse_decimal(s).map(Sym::constant)),
            ExprKind::Ident(id) => {
                if scope.symbols.is_param(&id.node) {
                    return Observed {
                        rel: scope.param_relation(&id.node),
                        value: Some(Sym::var(&id.node)),
                        noisy: false,
                    };
                }
                match self.vars.get(&id.node) {
                    Some(b) if b.pending.is_some() => Observed {
                        rel: Relation::Equal,
                        value: None,
                        noisy: true,
                    },
                    Some(b) => Observed {
                        rel: b.rel.clone(),
                        value: b.value.clone(),
                        noisy: b.noisy,
                    },
                    None => Observed::equal(None),
                }
            }
            ExprKind::Index { base, index } => {
                let idx = self.observe(index, scope);
                if !idx.rel.is_equal() {
                    return Observed {
                        rel: Relation::Unrelated,
                        value: None,
                        noisy: idx.noisy,
                    };
                }
                let at_cursor = matches!(&index.kind, ExprKind::Ident(i) if Some(&i.node) == scope.cursor.as_ref());
                let rel = if base.node == scope.query && at_cursor {
                    Relation::Diff(Distance::entry(rat(1)))
                } else {
                    scope.param_relation(&base.node)
                };
                Observed {
                    rel,
                    value: None,
                    noisy: idx.noisy,
                }
            }
            ExprKind::Unary { op: UnaryOp::Neg, expr } => {
                let inner = self.observe(expr, scope);
                Observed {
                    rel: match inner.rel {
                        Relation::Diff(d) => Relation::Diff(d.neg()),
                        other => other,
                    },
                    value: inner.value.map(|v| v.neg()),
                    noisy: inner.noisy,
                }
            }
            ExprKind::Unary { op: UnaryOp::Not, expr } => {
                let inner = self.observe(expr, scope);
                Observed::predicate(&inner, &Observed::equal(None))
            }
            ExprKind::Binary { left, op, right } => {
                let l = self.observe(left, scope);
                let r = self.observe(right, scope);
                let noisy = l.noisy || r.noisy;
                let value = |f: &dyn Fn(&Sym, &Sym) -> Option<Sym>| match (&l.value, &r.value) {
                    (Some(a), Some(b)) => f(a, b),
                    _ => None,
                };
                match op {
                    BinOp::Add | BinOp::Sub => {
                        let mut dropped = Released::new();
                        let rel = l.rel.combine(&r.rel, |a, b| {
                            if *op == BinOp::Add {
                                a.add(b, &scope.model, &mut dropped)
                            } else {
                                a.sub(b, &scope.model, &mut dropped)
                            }
                        });
                        let value = if *op == BinOp::Add {
                            value(&|a, b| Some(a.add(b)))
                        } else {
                            value(&|a, b| Some(a.sub(b)))
                        };
                        Observed { rel, value, noisy }
                    }
                    BinOp::Mul | BinOp::Div => {
                        let value = if *op == BinOp::Mul {
                            value(&|a, b| a.mul(b))
                        } else {
                            value(&|a, b| a.div(b))
                        };
                        let rel = scaled_relation(&l, &r, *op);
                        Observed { rel, value, noisy }
                    }
                    _ => {
                        let mut out = Observed::predicate(&l, &r);
                        out.noisy = noisy;
                        out
                    }
                }
            }
        }
    }
}

/// Relation of a product or quotient. Only scaling by a value known to be a
/// constant in both runs keeps structure.
fn scaled_relation(l: &Observed, r: &Observed, op: BinOp) -> Relation {
    let constant = |o: &Observed| {
        if o.rel.is_equal() {
            o.value.as_ref().and_then(Sym::as_constant)
        } else {
            None
        }
    };
    match (&l.rel, &r.rel) {
        (Relation::Equal, Relation::Equal) => Relation::Equal,
        (_, Relation::Unrelated) | (Relation::Unrelated, _) => Relation::Unrelated,
        (Relation::Diff(d), Relation::Equal) => match constant(r) {
            Some(k) if op == BinOp::Mul => Relation::from_distance(d.scale(&k)),
            Some(k) if op == BinOp::Div && !k.is_zero() => Relation::from_distance(d.scale(&k.recip())),
            _ => Relation::Unrelated,
        },
        (Relation::Equal, Relation::Diff(d)) if op == BinOp::Mul => match constant(l) {
            Some(k) => Relation::from_distance(d.scale(&k)),
            None => Relation::Unrelated,
        },
        _ => Relation::Unrelated,
    }
}

fn join_bindings(
    a: &Binding,
    b: &Binding,
    mode: JoinMode,
    model: &AdjacencyModel,
    positive: &BTreeSet<String>,
    released: &mut Released,
) -> Binding {
    // A draw still pending on one side is aligned in lockstep there.
    let pending = if a.pending == b.pending { a.pending.clone() } else { None };
    let rel = join_relations(&a.rel, &b.rel, mode, model, positive, released);
    Binding {
        rel,
        value: if a.value == b.value { a.value.clone() } else { None },
        noisy: a.noisy || b.noisy,
        pending,
    }
}

/// Read-only context for observing expressions.
#[derive(Clone, Debug)]
pub struct Scope<'a> {
    pub symbols: &'a SymbolTable,
    pub model: AdjacencyModel,
    /// Name of the query array.
    pub query: String,
    /// The variable used to index the query array, if there is exactly one.
    pub cursor: Option<String>,
    pub positive: BTreeSet<String>,
}

impl Scope<'_> {
    /// Relation of a parameter according to its TYPES tag.
    pub fn param_relation(&self, name: &str) -> Relation {
        let fixed = self
            .symbols
            .get(name)
            .and_then(|m| m.tag.as_ref())
            .is_none_or(|t| t.is_fixed());
        if fixed {
            Relation::Equal
        } else {
            let (lo, hi) = self.model.entry_range();
            Relation::from_distance(Distance::within(Interval::new(Sym::constant(lo), Sym::constant(hi))))
        }
    }
}

/// Result of observing an expression.
#[derive(Clone, Debug, PartialEq)]
pub struct Observed {
    pub rel: Relation,
    pub value: Option<Sym>,
    pub noisy: bool,
}

impl Observed {
    fn equal(value: Option<Sym>) -> Self {
        Self {
            rel: Relation::Equal,
            value,
            noisy: false,
        }
    }

    fn predicate(l: &Observed, r: &Observed) -> Self {
        Self {
            rel: if l.rel.is_equal() && r.rel.is_equal() {
                Relation::Equal
            } else {
                Relation::Unrelated
            },
            value: None,
            noisy: l.noisy || r.noisy,
        }
    }

    pub fn distance(&self) -> Option<Distance> {
        self.rel.distance()
    }
}

/// The single identifier used to index the query array, if there is one.
pub fn find_cursor(body: &Block, query: &str) -> Option<String> {
    let mut found: BTreeSet<String> = BTreeSet::new();
    let mut other = false;
    let mut visit = |e: &Expr| visit_indices(e, query, &mut found, &mut other);
    for stmt in StmtWalk::new(body) {
        match stmt {
            Stmt::Decl(d) => {
                if let Some(Rhs::Expr(e)) = &d.init {
                    visit(e);
                }
            }
            Stmt::Assign(a) => {
                if let Rhs::Expr(e) = &a.value {
                    visit(e);
                }
            }
            Stmt::If(s) => visit(&s.cond),
            Stmt::While(s) => visit(&s.cond),
            Stmt::Output(o) => visit(&o.expr),
            Stmt::Break(_) | Stmt::Block(_) => {}
        }
    }
    if found.len() == 1 && !other {
        found.pop_first()
    } else {
        None
    }
}

fn visit_indices(expr: &Expr, query: &str, found: &mut BTreeSet<String>, other: &mut bool) {
    match &expr.kind {
        ExprKind::Index { base, index } => {
            if base.node == query {
                match &index.kind {
                    ExprKind::Ident(i) => {
                        found.insert(i.node.clone());
                    }
                    _ => *other = true,
                }
            }
            visit_indices(index, query, found, other);
        }
        ExprKind::Unary { expr, .. } => visit_indices(expr, query, found, other),
        ExprKind::Binary { left, right, .. } => {
            visit_indices(left, query, found, other);
            visit_indices(right, query, found, other);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::{Extent, History};
    use dpcheck_ast::Adjacency;

    fn positive() -> BTreeSet<String> {
        BTreeSet::from(["epsilon".to_string()])
    }

    fn hist(weight: Sym) -> Binding {
        Binding {
            rel: Relation::Diff(Distance {
                hist: Some(History {
                    coef: rat(1),
                    extent: Extent::Many,
                    weight,
                }),
                ..Distance::zero()
            }),
            value: None,
            noisy: false,
            pending: None,
        }
    }

    #[test]
    fn overwriting_a_history_settles_its_weight() {
        let mut st = TwoRunState::new();
        let eps = Sym::var("epsilon");
        st.bind("sum", hist(eps.scale(&rat(2))), &positive());
        st.bind("sum", Binding::equal(Some(Sym::zero())), &positive());
        assert_eq!(st.ledger.settled, eps.scale(&rat(2)));
    }

    #[test]
    fn one_differ_total_takes_the_worst_record() {
        let model = AdjacencyModel::new(Adjacency::OneDiffer, "size");
        let eps = Sym::var("epsilon");
        let mut st = TwoRunState::new();
        st.ledger.fixed = eps.clone();
        st.ledger.settled = eps.scale(&rat(2));
        st.bind("sum", hist(eps.clone()), &positive());
        assert_eq!(st.total_cost(&model, &positive()), eps.scale(&rat(3)));

        let all = AdjacencyModel::new(Adjacency::AllDiffer, "size");
        assert_eq!(st.total_cost(&all, &positive()), eps);
    }

    #[test]
    fn advancing_moves_current_cost_into_settled() {
        let model = AdjacencyModel::new(Adjacency::OneDiffer, "size");
        let eps = Sym::var("epsilon");
        let mut st = TwoRunState::new();
        st.ledger.current = eps.clone();
        st.bind(
            "sum",
            Binding {
                rel: Relation::Diff(Distance::entry(rat(1))),
                value: None,
                noisy: false,
                pending: None,
            },
            &positive(),
        );
        st.advance_cursor(&model, &positive());
        assert!(st.ledger.current.is_zero());
        assert_eq!(st.ledger.settled, eps);
        assert_eq!(st.hist_weights(), vec![eps]);
    }

    #[test]
    fn large_integer_literals_stay_positive() {
        let symbols = SymbolTable::default();
        let scope = Scope {
            symbols: &symbols,
            model: AdjacencyModel::new(Adjacency::AllDiffer, "size"),
            query: "q".to_string(),
            cursor: None,
            positive: positive(),
        };
        let expr = dpcheck_parse::parse_expr("18446744073709551615").unwrap();
        let seen = TwoRunState::new().observe(&expr, &scope);
        assert!(seen.rel.is_equal());
        assert_eq!(seen.value.map(|v| v.to_string()), Some("18446744073709551615".to_string()));
    }

    #[test]
    fn join_drops_one_sided_variables() {
        let model = AdjacencyModel::new(Adjacency::OneDiffer, "size");
        let eps = Sym::var("epsilon");
        let mut a = TwoRunState::new();
        a.bind("eta", hist(eps.clone()), &positive());
        let b = TwoRunState::new();
        let j = a.join(&b, JoinMode::Structural, &model, &positive());
        assert!(j.get("eta").is_none());
        assert_eq!(j.ledger.settled, eps);
    }
}
