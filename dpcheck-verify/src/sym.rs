//! Exact symbolic arithmetic over program parameters.
//!
//! Costs, shifts and loop bounds are Laurent polynomials in the scalar
//! parameters (`epsilon`, `NN`, `size`, ...) with rational coefficients, closed
//! under `max`/`min`. Arithmetic keeps `max`/`min` at the top of the tree, so
//! two symbols that denote the same function compare equal structurally in
//! the common cases the engine relies on (fixpoint detection).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use dpcheck_ast::{BinOp, Expr, ExprKind, UnaryOp};
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed, Zero};

pub type Rational = BigRational;

/// Assignment of values to parameters.
pub type Point = BTreeMap<String, Rational>;

pub fn rat(n: i64) -> Rational {
    BigRational::from_integer(BigInt::from(n))
}

pub fn ratio(n: i64, d: i64) -> Rational {
    BigRational::new(BigInt::from(n), BigInt::from(d))
}

/// Product of parameters raised to nonzero integer powers.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Monomial(BTreeMap<String, i32>);

impl Monomial {
    pub fn one() -> Self {
        Monomial(BTreeMap::new())
    }

    pub fn var(name: &str) -> Self {
        Monomial(BTreeMap::from([(name.to_string(), 1)]))
    }

    pub fn is_one(&self) -> bool {
        self.0.is_empty()
    }

    pub fn powers(&self) -> impl Iterator<Item = (&str, i32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn degree(&self) -> i32 {
        self.0.values().sum()
    }

    fn mul(&self, other: &Monomial) -> Monomial {
        let mut out = self.0.clone();
        for (v, e) in &other.0 {
            let slot = out.entry(v.clone()).or_insert(0);
            *slot += e;
            if *slot == 0 {
                out.remove(v);
            }
        }
        Monomial(out)
    }

    fn recip(&self) -> Monomial {
        Monomial(self.0.iter().map(|(k, v)| (k.clone(), -v)).collect())
    }

    fn eval(&self, point: &Point) -> Option<Rational> {
        let mut acc = Rational::one();
        for (v, e) in &self.0 {
            let x = point.get(v)?;
            if *e < 0 && x.is_zero() {
                return None;
            }
            acc *= pow(x, *e);
        }
        Some(acc)
    }
}

fn pow(x: &Rational, e: i32) -> Rational {
    let mut acc = Rational::one();
    for _ in 0..e.unsigned_abs() {
        acc *= x;
    }
    if e < 0 { acc.recip() } else { acc }
}

/// Sum of monomials with nonzero rational coefficients.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Poly {
    terms: BTreeMap<Monomial, Rational>,
}

impl Poly {
    pub fn zero() -> Self {
        Poly::default()
    }

    pub fn constant(c: Rational) -> Self {
        let mut p = Poly::zero();
        p.add_term(Monomial::one(), c);
        p
    }

    pub fn var(name: &str) -> Self {
        let mut p = Poly::zero();
        p.add_term(Monomial::var(name), Rational::one());
        p
    }

    pub fn terms(&self) -> impl Iterator<Item = (&Monomial, &Rational)> {
        self.terms.iter()
    }

    pub fn is_zero(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn as_constant(&self) -> Option<Rational> {
        match self.terms.len() {
            0 => Some(Rational::zero()),
            1 => self.terms.get(&Monomial::one()).cloned(),
            _ => None,
        }
    }

    /// The only term, when there is exactly one.
    pub fn single_term(&self) -> Option<(&Monomial, &Rational)> {
        if self.terms.len() == 1 {
            self.terms.iter().next()
        } else {
            None
        }
    }

    pub fn vars(&self) -> BTreeSet<String> {
        self.terms
            .keys()
            .flat_map(|m| m.0.keys().cloned())
            .collect()
    }

    fn add_term(&mut self, m: Monomial, c: Rational) {
        if c.is_zero() {
            return;
        }
        let slot = self.terms.entry(m.clone()).or_insert_with(Rational::zero);
        *slot += c;
        if slot.is_zero() {
            self.terms.remove(&m);
        }
    }

    pub fn add(&self, other: &Poly) -> Poly {
        let mut out = self.clone();
        for (m, c) in &other.terms {
            out.add_term(m.clone(), c.clone());
        }
        out
    }

    pub fn neg(&self) -> Poly {
        Poly {
            terms: self
                .terms
                .iter()
                .map(|(m, c)| (m.clone(), -c.clone()))
                .collect(),
        }
    }

    pub fn sub(&self, other: &Poly) -> Poly {
        self.add(&other.neg())
    }

    pub fn mul(&self, other: &Poly) -> Poly {
        let mut out = Poly::zero();
        for (m1, c1) in &self.terms {
            for (m2, c2) in &other.terms {
                out.add_term(m1.mul(m2), c1 * c2);
            }
        }
        out
    }

    pub fn scale(&self, k: &Rational) -> Poly {
        let mut out = Poly::zero();
        for (m, c) in &self.terms {
            out.add_term(m.clone(), c * k);
        }
        out
    }

    /// `1 / p`, defined only for a single nonzero term.
    pub fn recip(&self) -> Option<Poly> {
        let (m, c) = self.single_term()?;
        let mut out = Poly::zero();
        out.add_term(m.recip(), c.recip());
        Some(out)
    }

    pub fn eval(&self, point: &Point) -> Option<Rational> {
        let mut acc = Rational::zero();
        for (m, c) in &self.terms {
            acc += c * m.eval(point)?;
        }
        Some(acc)
    }

    /// Rewrites `x` as `x + by`. Only defined when `x` never appears with a
    /// negative power.
    pub fn shift_var(&self, x: &str, by: &Rational) -> Option<Poly> {
        let mut out = Poly::zero();
        for (m, c) in &self.terms {
            let e = m.0.get(x).copied().unwrap_or(0);
            if e < 0 {
                return None;
            }
            if e == 0 {
                out.add_term(m.clone(), c.clone());
                continue;
            }
            let mut rest = m.0.clone();
            rest.remove(x);
            // (x + by)^e = sum_k C(e, k) x^k by^(e-k)
            let mut binom = BigInt::one();
            for k in 0..=e {
                let mut mono = rest.clone();
                if k > 0 {
                    mono.insert(x.to_string(), k);
                }
                let coef = c * Rational::from_integer(binom.clone()) * pow(by, e - k);
                out.add_term(Monomial(mono), coef);
                binom = binom * BigInt::from(e - k) / BigInt::from(k + 1);
            }
        }
        Some(out)
    }
}

/// A symbolic quantity: a polynomial, or a `max`/`min` of symbols.
///
/// Constructors keep the normal form: `max`/`min` are flattened, sorted,
/// deduplicated and hold at least two arguments.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Sym {
    Poly(Poly),
    Max(Vec<Sym>),
    Min(Vec<Sym>),
}

impl Default for Sym {
    fn default() -> Self {
        Sym::zero()
    }
}

impl From<Poly> for Sym {
    fn from(p: Poly) -> Self {
        Sym::Poly(p)
    }
}

impl Sym {
    pub fn zero() -> Self {
        Sym::Poly(Poly::zero())
    }

    pub fn one() -> Self {
        Sym::constant(Rational::one())
    }

    pub fn int(n: i64) -> Self {
        Sym::constant(rat(n))
    }

    /// An integer literal from the source, which may exceed `i64`.
    pub fn literal(n: u64) -> Self {
        Sym::constant(Rational::from_integer(BigInt::from(n)))
    }

    pub fn constant(c: Rational) -> Self {
        Sym::Poly(Poly::constant(c))
    }

    pub fn var(name: &str) -> Self {
        Sym::Poly(Poly::var(name))
    }

    pub fn as_poly(&self) -> Option<&Poly> {
        match self {
            Sym::Poly(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<Rational> {
        self.as_poly().and_then(Poly::as_constant)
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Sym::Poly(p) if p.is_zero())
    }

    pub fn free_vars(&self) -> BTreeSet<String> {
        match self {
            Sym::Poly(p) => p.vars(),
            Sym::Max(xs) | Sym::Min(xs) => xs.iter().flat_map(Sym::free_vars).collect(),
        }
    }

    pub fn eval(&self, point: &Point) -> Option<Rational> {
        match self {
            Sym::Poly(p) => p.eval(point),
            Sym::Max(xs) | Sym::Min(xs) => {
                let is_max = matches!(self, Sym::Max(_));
                let mut best: Option<Rational> = None;
                for x in xs {
                    let v = x.eval(point)?;
                    if best.as_ref().is_none_or(|b| if is_max { v > *b } else { v < *b }) {
                        best = Some(v);
                    }
                }
                best
            }
        }
    }

    pub fn add(&self, other: &Sym) -> Sym {
        match (self, other) {
            (Sym::Poly(a), Sym::Poly(b)) => Sym::Poly(a.add(b)),
            (Sym::Max(xs), _) => Sym::max_of(xs.iter().map(|x| x.add(other)).collect()),
            (Sym::Min(xs), _) => Sym::min_of(xs.iter().map(|x| x.add(other)).collect()),
            (_, Sym::Max(ys)) => Sym::max_of(ys.iter().map(|y| self.add(y)).collect()),
            (_, Sym::Min(ys)) => Sym::min_of(ys.iter().map(|y| self.add(y)).collect()),
        }
    }

    pub fn neg(&self) -> Sym {
        match self {
            Sym::Poly(p) => Sym::Poly(p.neg()),
            Sym::Max(xs) => Sym::min_of(xs.iter().map(Sym::neg).collect()),
            Sym::Min(xs) => Sym::max_of(xs.iter().map(Sym::neg).collect()),
        }
    }

    pub fn sub(&self, other: &Sym) -> Sym {
        self.add(&other.neg())
    }

    pub fn scale(&self, k: &Rational) -> Sym {
        if k.is_negative() {
            return self.neg().scale(&-k.clone());
        }
        match self {
            Sym::Poly(p) => Sym::Poly(p.scale(k)),
            Sym::Max(xs) => Sym::max_of(xs.iter().map(|x| x.scale(k)).collect()),
            Sym::Min(xs) => Sym::min_of(xs.iter().map(|x| x.scale(k)).collect()),
        }
    }

    /// Product with a factor the caller knows to be nonnegative.
    pub fn mul_nonneg(&self, factor: &Poly) -> Sym {
        match self {
            Sym::Poly(p) => Sym::Poly(p.mul(factor)),
            Sym::Max(xs) => Sym::max_of(xs.iter().map(|x| x.mul_nonneg(factor)).collect()),
            Sym::Min(xs) => Sym::min_of(xs.iter().map(|x| x.mul_nonneg(factor)).collect()),
        }
    }

    /// Exact product. Products involving `max`/`min` are only formed when the
    /// other side is a constant.
    pub fn mul(&self, other: &Sym) -> Option<Sym> {
        match (self, other) {
            (Sym::Poly(a), Sym::Poly(b)) => Some(Sym::Poly(a.mul(b))),
            (_, Sym::Poly(b)) => b.as_constant().map(|k| self.scale(&k)),
            (Sym::Poly(a), _) => a.as_constant().map(|k| other.scale(&k)),
            _ => None,
        }
    }

    /// Exact quotient by a single-term polynomial.
    pub fn div(&self, other: &Sym) -> Option<Sym> {
        let recip = other.as_poly()?.recip()?;
        match self {
            Sym::Poly(a) => Some(Sym::Poly(a.mul(&recip))),
            _ => recip.as_constant().map(|k| self.scale(&k)),
        }
    }

    pub fn join_max(&self, other: &Sym) -> Sym {
        Sym::max_of(vec![self.clone(), other.clone()])
    }

    pub fn join_min(&self, other: &Sym) -> Sym {
        Sym::min_of(vec![self.clone(), other.clone()])
    }

    pub fn max_of(args: Vec<Sym>) -> Sym {
        lattice_of(args, true)
    }

    pub fn min_of(args: Vec<Sym>) -> Sym {
        lattice_of(args, false)
    }

    /// Drops `max`/`min` arguments that are dominated given that every
    /// variable in `positive` is strictly positive.
    pub fn simplify(&self, positive: &BTreeSet<String>) -> Sym {
        match self {
            Sym::Poly(_) => self.clone(),
            Sym::Max(xs) | Sym::Min(xs) => {
                let is_max = matches!(self, Sym::Max(_));
                let xs: Vec<Sym> = xs.iter().map(|x| x.simplify(positive)).collect();
                let mut keep: Vec<Sym> = Vec::new();
                for (i, x) in xs.iter().enumerate() {
                    let dominated = xs.iter().enumerate().any(|(j, y)| {
                        if i == j {
                            return false;
                        }
                        // Drop x when y is always at least as good, keeping the
                        // earlier one of two equivalent arguments.
                        let (hi, lo) = if is_max { (y, x) } else { (x, y) };
                        let y_wins = nonneg_by_signs(&hi.sub(lo), positive);
                        let x_wins = nonneg_by_signs(&(if is_max { x.sub(y) } else { y.sub(x) }), positive);
                        y_wins && (!x_wins || j < i)
                    });
                    if !dominated {
                        keep.push(x.clone());
                    }
                }
                lattice_of(keep, is_max)
            }
        }
    }

    /// Reads a parameter-only arithmetic expression.
    pub fn from_expr(expr: &Expr, lookup: &dyn Fn(&str) -> Option<Sym>) -> Option<Sym> {
        match &expr.kind {
            ExprKind::Int(n) => Some(Sym::literal(*n)),
            ExprKind::Decimal(s) => parse_decimal(s).map(Sym::constant),
            ExprKind::Ident(id) => lookup(&id.node),
            ExprKind::Index { .. } => None,
            ExprKind::Unary {
                op: UnaryOp::Neg,
                expr,
            } => Sym::from_expr(expr, lookup).map(|s| s.neg()),
            ExprKind::Unary { .. } => None,
            ExprKind::Binary { left, op, right } => {
                let l = Sym::from_expr(left, lookup)?;
                let r = Sym::from_expr(right, lookup)?;
                match op {
                    BinOp::Add => Some(l.add(&r)),
                    BinOp::Sub => Some(l.sub(&r)),
                    BinOp::Mul => l.mul(&r),
                    BinOp::Div => l.div(&r),
                    _ => None,
                }
            }
        }
    }
}

/// Whether `s` is a polynomial that is nonnegative just by the signs of its
/// coefficients, given that the variables in `positive` are positive.
pub fn nonneg_by_signs(s: &Sym, positive: &BTreeSet<String>) -> bool {
    match s {
        Sym::Poly(p) => p.terms().all(|(m, c)| {
            !c.is_negative() && m.powers().all(|(v, _)| positive.contains(v))
        }),
        Sym::Min(xs) => xs.iter().all(|x| nonneg_by_signs(x, positive)),
        Sym::Max(xs) => xs.iter().any(|x| nonneg_by_signs(x, positive)),
    }
}

fn lattice_of(args: Vec<Sym>, is_max: bool) -> Sym {
    let mut flat: Vec<Sym> = Vec::new();
    for a in args {
        match a {
            Sym::Max(inner) if is_max => flat.extend(inner),
            Sym::Min(inner) if !is_max => flat.extend(inner),
            other => flat.push(other),
        }
    }

    // Keep only the extreme constant.
    let mut best: Option<Rational> = None;
    let mut rest: Vec<Sym> = Vec::new();
    for a in flat {
        match a.as_constant() {
            Some(c) => {
                best = Some(match best {
                    Some(b) if (is_max && b >= c) || (!is_max && b <= c) => b,
                    _ => c,
                });
            }
            None => rest.push(a),
        }
    }
    if let Some(c) = best {
        rest.push(Sym::constant(c));
    }
    rest.sort();
    rest.dedup();

    match rest.len() {
        0 => Sym::zero(),
        1 => rest.pop().unwrap_or_default(),
        _ if is_max => Sym::Max(rest),
        _ => Sym::Min(rest),
    }
}

/// `"2.25"` as the exact rational `9/4`.
pub fn parse_decimal(s: &str) -> Option<Rational> {
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    let digits = format!("{whole}{frac}");
    let num: BigInt = digits.parse().ok()?;
    let den = BigInt::from(10u32).pow(frac.len() as u32);
    Some(BigRational::new(num, den))
}

impl fmt::Display for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sym::Poly(p) => write!(f, "{p}"),
            Sym::Max(xs) | Sym::Min(xs) => {
                f.write_str(if matches!(self, Sym::Max(_)) { "max(" } else { "min(" })?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for Poly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("0");
        }
        // Higher degree first, constant last.
        let mut terms: Vec<(&Monomial, &Rational)> = self.terms.iter().collect();
        terms.sort_by(|a, b| b.0.degree().cmp(&a.0.degree()).then_with(|| a.0.cmp(b.0)));
        for (i, (m, c)) in terms.into_iter().enumerate() {
            let body = format_term(m, &c.abs());
            match (i, c.is_negative()) {
                (0, true) => write!(f, "-{body}")?,
                (0, false) => f.write_str(&body)?,
                (_, true) => write!(f, " - {body}")?,
                (_, false) => write!(f, " + {body}")?,
            }
        }
        Ok(())
    }
}

fn format_term(m: &Monomial, c: &Rational) -> String {
    let mut num: Vec<String> = Vec::new();
    let mut den: Vec<String> = Vec::new();
    if !c.numer().is_one() {
        num.push(c.numer().to_string());
    }
    if !c.denom().is_one() {
        den.push(c.denom().to_string());
    }
    for (v, e) in m.powers() {
        let factor = match e.abs() {
            1 => v.to_string(),
            k => format!("{v}^{k}"),
        };
        if e > 0 { num.push(factor) } else { den.push(factor) }
    }
    let num = if num.is_empty() { "1".to_string() } else { num.join(" * ") };
    match den.len() {
        0 => num,
        1 => format!("{num} / {}", den[0]),
        _ => format!("{num} / ({})", den.join(" * ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eps() -> Sym {
        Sym::var("epsilon")
    }

    #[test]
    fn laurent_terms_cancel_exactly() {
        // NN * (2 * epsilon / (3 * NN)) == 2 * epsilon / 3
        let per = eps()
            .scale(&rat(2))
            .div(&Sym::var("NN").scale(&rat(3)))
            .unwrap();
        let total = per.mul(&Sym::var("NN")).unwrap();
        assert_eq!(total, eps().scale(&ratio(2, 3)));
        assert_eq!(total.to_string(), "2 * epsilon / 3");
    }

    #[test]
    fn display_uses_grouped_denominators() {
        let s = eps().scale(&rat(3)).div(&Sym::var("NN").scale(&rat(4))).unwrap();
        assert_eq!(s.to_string(), "3 * epsilon / (4 * NN)");
        assert_eq!(eps().scale(&ratio(1, 2)).to_string(), "epsilon / 2");
        assert_eq!(eps().sub(&Sym::int(1)).to_string(), "epsilon - 1");
    }

    #[test]
    fn max_normalizes_constants_and_duplicates() {
        let m = Sym::max_of(vec![Sym::int(0), eps(), Sym::int(3), eps()]);
        assert_eq!(m, Sym::max_of(vec![Sym::int(3), eps()]));
        assert!(matches!(&m, Sym::Max(args) if args.len() == 2));
        assert_eq!(Sym::int(2).join_max(&Sym::int(5)), Sym::int(5));
    }

    #[test]
    fn join_max_builds_a_symbolic_max() {
        let a = Sym::var("a");
        let b = Sym::var("b");
        assert_eq!(a.join_max(&b).to_string(), "max(a, b)");
        assert_eq!(b.join_min(&a).to_string(), "min(a, b)");
        let point = Point::from([("a".to_string(), rat(7)), ("b".to_string(), rat(2))]);
        assert_eq!(a.join_max(&b).eval(&point), Some(rat(7)));
        assert_eq!(a.join_min(&b).eval(&point), Some(rat(2)));
    }

    #[test]
    fn addition_distributes_over_max() {
        let m = eps().join_max(&Sym::int(1));
        let shifted = m.add(&Sym::int(1));
        let point = Point::from([("epsilon".to_string(), rat(3))]);
        assert_eq!(shifted.eval(&point), Some(rat(4)));
        let point = Point::from([("epsilon".to_string(), ratio(1, 2))]);
        assert_eq!(shifted.eval(&point), Some(rat(2)));
    }

    #[test]
    fn simplify_drops_dominated_positive_terms() {
        let positive = BTreeSet::from(["epsilon".to_string()]);
        let m = eps().join_max(&eps().scale(&rat(2)));
        assert_eq!(m.simplify(&positive), eps().scale(&rat(2)));
        let m = Sym::zero().join_max(&eps());
        assert_eq!(m.simplify(&positive), eps());
    }

    #[test]
    fn shift_var_expands_binomially() {
        // (x + 1)^2 = x^2 + 2x + 1
        let x = Poly::var("x");
        let sq = x.mul(&x);
        let shifted = sq.shift_var("x", &rat(1)).unwrap();
        let expect = sq.add(&x.scale(&rat(2))).add(&Poly::constant(rat(1)));
        assert_eq!(shifted, expect);
    }

    #[test]
    fn decimals_are_exact() {
        assert_eq!(parse_decimal("2.25"), Some(ratio(9, 4)));
        assert_eq!(parse_decimal("0.1"), Some(ratio(1, 10)));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn small_poly() -> impl Strategy<Value = Sym> {
            (-5i64..5, -5i64..5, -3i64..3).prop_map(|(a, b, c)| {
                Sym::var("epsilon")
                    .scale(&rat(a))
                    .add(&Sym::var("NN").scale(&rat(b)))
                    .add(&Sym::int(c))
            })
        }

        proptest! {
            #[test]
            fn max_agrees_with_pointwise_max(a in small_poly(), b in small_poly(), e in 1i64..6, n in 1i64..6) {
                let point = Point::from([("epsilon".to_string(), rat(e)), ("NN".to_string(), rat(n))]);
                let va = a.eval(&point).unwrap();
                let vb = b.eval(&point).unwrap();
                let expect = if va >= vb { va } else { vb };
                prop_assert_eq!(a.join_max(&b).eval(&point), Some(expect));
            }

            #[test]
            fn sub_then_add_is_identity(a in small_poly(), b in small_poly()) {
                prop_assert_eq!(a.sub(&b).add(&b), a);
            }
        }
    }
}
